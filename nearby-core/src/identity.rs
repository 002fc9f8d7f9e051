//! Peer identity: display name plus a random instance id, and the fixed discovery tag.

use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Longest display name in bytes (UTF-8).
pub const MAX_DISPLAY_NAME_LEN: usize = 63;

/// Fallback when neither config nor host name yields a device name.
const FALLBACK_DEVICE_NAME: &str = "nearby";

/// Identifies one process instance on the local network.
///
/// Two ids compare equal only when their instance ids match; the display name is
/// informational and may collide between devices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerId {
    display_name: String,
    instance: Uuid,
}

impl PeerId {
    /// Create a fresh identity with a random instance id.
    pub fn new(display_name: impl Into<String>) -> Result<Self, IdentityError> {
        let display_name = display_name.into();
        validate_display_name(&display_name)?;
        Ok(Self {
            display_name,
            instance: Uuid::new_v4(),
        })
    }

    /// Rebuild an identity received from the wire.
    pub fn from_parts(display_name: impl Into<String>, instance: Uuid) -> Result<Self, IdentityError> {
        let display_name = display_name.into();
        validate_display_name(&display_name)?;
        Ok(Self {
            display_name,
            instance,
        })
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn instance(&self) -> Uuid {
        self.instance
    }
}

impl PartialEq for PeerId {
    fn eq(&self, other: &Self) -> bool {
        self.instance == other.instance
    }
}

impl Eq for PeerId {}

impl Hash for PeerId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.instance.hash(state);
    }
}

impl PartialOrd for PeerId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Ordered by instance id; used to break ties between duplicate links.
impl Ord for PeerId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.instance.cmp(&other.instance)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let simple = self.instance.simple().to_string();
        write!(f, "{}#{}", self.display_name, &simple[..8])
    }
}

fn validate_display_name(name: &str) -> Result<(), IdentityError> {
    if name.is_empty() {
        return Err(IdentityError::EmptyName);
    }
    if name.len() > MAX_DISPLAY_NAME_LEN {
        return Err(IdentityError::NameTooLong(name.len()));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    #[error("display name is empty")]
    EmptyName,
    #[error("display name is {0} bytes, limit is 63")]
    NameTooLong(usize),
}

/// Resolve this device's name: explicit override, then host name, then a fixed fallback.
/// Result is trimmed and truncated on a char boundary so it always forms a valid [`PeerId`].
pub fn device_name(configured: Option<&str>) -> String {
    let candidate = configured
        .map(str::to_owned)
        .or_else(|| std::env::var("HOSTNAME").ok())
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|s| s.trim().to_owned())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| FALLBACK_DEVICE_NAME.to_owned());
    truncate_on_char_boundary(candidate, MAX_DISPLAY_NAME_LEN)
}

fn truncate_on_char_boundary(mut s: String, max: usize) -> String {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s.truncate(end);
    s
}

/// Discovery tag scoping which peers can see each other.
///
/// Follows the Bonjour service naming rules: 1-15 characters of lowercase ASCII letters,
/// digits and hyphens, at least one letter, and hyphens neither leading, trailing nor adjacent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceType(String);

/// Fixed discovery tag for this application.
pub const SERVICE_TYPE: &str = "nearby-chat";

impl ServiceType {
    pub fn new(tag: impl Into<String>) -> Result<Self, ServiceTypeError> {
        let tag = tag.into();
        if tag.is_empty() || tag.len() > 15 {
            return Err(ServiceTypeError::Length(tag.len()));
        }
        if let Some(c) = tag
            .chars()
            .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-'))
        {
            return Err(ServiceTypeError::InvalidChar(c));
        }
        if !tag.chars().any(|c| c.is_ascii_lowercase()) {
            return Err(ServiceTypeError::NoLetter);
        }
        if tag.starts_with('-') || tag.ends_with('-') || tag.contains("--") {
            return Err(ServiceTypeError::MisplacedHyphen);
        }
        Ok(Self(tag))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ServiceType {
    fn default() -> Self {
        Self(SERVICE_TYPE.to_owned())
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServiceTypeError {
    #[error("service type must be 1-15 characters, got {0}")]
    Length(usize),
    #[error("invalid character {0:?} in service type")]
    InvalidChar(char),
    #[error("service type must contain a letter")]
    NoLetter,
    #[error("service type hyphens may not lead, trail or repeat")]
    MisplacedHyphen,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn equality_ignores_display_name() {
        let a = PeerId::new("alpha").unwrap();
        let renamed = PeerId::from_parts("beta", a.instance()).unwrap();
        assert_eq!(a, renamed);
        let mut set = HashSet::new();
        set.insert(a.clone());
        assert!(set.contains(&renamed));
    }

    #[test]
    fn same_name_different_instances_differ() {
        let a = PeerId::new("phone").unwrap();
        let b = PeerId::new("phone").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn display_name_limits() {
        assert_eq!(PeerId::new(""), Err(IdentityError::EmptyName));
        assert!(PeerId::new("x".repeat(63)).is_ok());
        assert_eq!(
            PeerId::new("x".repeat(64)),
            Err(IdentityError::NameTooLong(64))
        );
    }

    #[test]
    fn device_name_truncates_multibyte() {
        // 'é' is two bytes; 40 of them is 80 bytes.
        let name = device_name(Some(&"é".repeat(40)));
        assert!(name.len() <= MAX_DISPLAY_NAME_LEN);
        assert!(PeerId::new(name).is_ok());
    }

    #[test]
    fn device_name_prefers_configured() {
        assert_eq!(device_name(Some("  kitchen-tablet \n")), "kitchen-tablet");
    }

    #[test]
    fn service_type_rules() {
        assert!(ServiceType::new("nearby-chat").is_ok());
        assert!(ServiceType::new("a1").is_ok());
        assert_eq!(ServiceType::new(""), Err(ServiceTypeError::Length(0)));
        assert_eq!(
            ServiceType::new("abcdefghijklmnop"),
            Err(ServiceTypeError::Length(16))
        );
        assert_eq!(
            ServiceType::new("Chat"),
            Err(ServiceTypeError::InvalidChar('C'))
        );
        assert_eq!(ServiceType::new("123"), Err(ServiceTypeError::NoLetter));
        assert_eq!(
            ServiceType::new("-chat"),
            Err(ServiceTypeError::MisplacedHyphen)
        );
        assert_eq!(
            ServiceType::new("a--b"),
            Err(ServiceTypeError::MisplacedHyphen)
        );
        assert_eq!(ServiceType::default().as_str(), SERVICE_TYPE);
    }
}
