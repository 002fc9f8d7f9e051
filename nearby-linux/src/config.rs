//! Load config from file and environment.

use anyhow::Context;
use serde::Deserialize;
use std::path::PathBuf;

/// Node configuration. File: ~/.config/nearby/config.toml or /etc/nearby/config.toml.
/// Env overrides: NEARBY_DISPLAY_NAME, NEARBY_DISCOVERY_PORT, NEARBY_TRANSPORT_PORT, NEARBY_LOG.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Name shown to peers. Falls back to the host name.
    #[serde(default)]
    pub display_name: Option<String>,
    /// Multicast beacon UDP port (default 45680).
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// Invite and link TCP port (default 45681).
    #[serde(default = "default_transport_port")]
    pub transport_port: u16,
    /// Log filter used when RUST_LOG is unset (default "info").
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_discovery_port() -> u16 {
    45680
}
fn default_transport_port() -> u16 {
    45681
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            display_name: None,
            discovery_port: default_discovery_port(),
            transport_port: default_transport_port(),
            log_level: default_log_level(),
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
/// A config file that exists but cannot be read or parsed is an error.
pub fn load() -> anyhow::Result<Config> {
    let mut c = load_file()?.unwrap_or_default();
    apply_env(&mut c, |key| std::env::var(key).ok());
    Ok(c)
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(name) = var("NEARBY_DISPLAY_NAME").filter(|s| !s.trim().is_empty()) {
        c.display_name = Some(name);
    }
    if let Some(p) = var("NEARBY_DISCOVERY_PORT").and_then(|s| s.parse::<u16>().ok()) {
        c.discovery_port = p;
    }
    if let Some(p) = var("NEARBY_TRANSPORT_PORT").and_then(|s| s.parse::<u16>().ok()) {
        c.transport_port = p;
    }
    if let Some(level) = var("NEARBY_LOG") {
        c.log_level = level;
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/nearby/config.toml"));
    }
    out.push(PathBuf::from("/etc/nearby/config.toml"));
    out
}

/// First existing file wins.
fn load_file() -> anyhow::Result<Option<Config>> {
    let Some(path) = config_paths().into_iter().find(|p| p.exists()) else {
        return Ok(None);
    };
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("reading {}", path.display()))?;
    let c = parse(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(Some(c))
}

fn parse(text: &str) -> Result<Config, toml::de::Error> {
    toml::from_str(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn empty_file_gives_defaults() {
        assert_eq!(parse("").unwrap(), Config::default());
    }

    #[test]
    fn file_fields_override_defaults() {
        let c = parse("display_name = \"den\"\ntransport_port = 5000\n").unwrap();
        assert_eq!(c.display_name.as_deref(), Some("den"));
        assert_eq!(c.transport_port, 5000);
        assert_eq!(c.discovery_port, 45680);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(parse("proxy_port = 3128\n").is_err());
    }

    #[test]
    fn env_overrides_file() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("NEARBY_DISPLAY_NAME", "attic"),
            ("NEARBY_DISCOVERY_PORT", "7000"),
            ("NEARBY_TRANSPORT_PORT", "not-a-port"),
            ("NEARBY_LOG", "debug"),
        ]);
        let mut c = parse("transport_port = 5000\n").unwrap();
        apply_env(&mut c, |k| env.get(k).map(|v| v.to_string()));
        assert_eq!(c.display_name.as_deref(), Some("attic"));
        assert_eq!(c.discovery_port, 7000);
        assert_eq!(c.transport_port, 5000);
        assert_eq!(c.log_level, "debug");
    }

    #[test]
    fn blank_env_name_is_ignored() {
        let mut c = Config::default();
        apply_env(&mut c, |k| (k == "NEARBY_DISPLAY_NAME").then(|| "  ".to_string()));
        assert_eq!(c.display_name, None);
    }
}
