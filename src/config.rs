//! Configuration file loading.
//!
//! The appliance is configured by a single JSON document with the keys
//! described in the crate's top-level documentation. Unknown keys are
//! ignored by `serde`'s default struct deserialization. A missing or
//! malformed file is logged by the caller and the process falls back to
//! `Config::default()`, which leaves enough blank state that the DNS
//! listener will fail to bind later -- fail-soft at load, fail-loud at
//! bind.

use std::net::Ipv4Addr;
use std::path::Path;

use serde::Deserialize;

use crate::error::config::ConfigError;

/// Relay ports used when the config omits `RELAY_PORTS`.
pub const DEFAULT_RELAY_PORTS: [u16; 2] = [80, 443];

/// Appliance configuration, read once at startup and never mutated
/// afterward.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(rename = "UPSTREAM_DNS", default)]
    pub upstream_dns: String,

    #[serde(rename = "EXTERNAL_ADDRESS", default)]
    pub external_address: String,

    #[serde(rename = "DNS_PORT", default)]
    pub dns_port: String,

    #[serde(rename = "INTERCEPTS", default)]
    pub intercepts: Vec<String>,

    #[serde(rename = "DEBUG", default)]
    pub debug: bool,

    #[serde(rename = "RELAY_PORTS", default = "default_relay_ports")]
    pub relay_ports: Vec<u16>,
}

fn default_relay_ports() -> Vec<u16> {
    DEFAULT_RELAY_PORTS.to_vec()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            upstream_dns: String::new(),
            external_address: String::new(),
            dns_port: String::new(),
            intercepts: Vec::new(),
            debug: false,
            relay_ports: default_relay_ports(),
        }
    }
}

impl Config {
    /// Load configuration from the JSON file at `path`.
    ///
    /// Intercept substrings are lowercased here, once, so every other
    /// component can assume `intercepts` is already normalized.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let buf = std::fs::read_to_string(path)?;
        let mut config: Config = serde_json::from_str(&buf)?;
        config.intercepts = config
            .intercepts
            .into_iter()
            .map(|s| s.to_lowercase())
            .collect();
        Ok(config)
    }

    /// The configured external address, parsed as an IPv4 address.
    pub fn external_ipv4(&self) -> Option<Ipv4Addr> {
        self.external_address.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_when_keys_missing() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.relay_ports, vec![80, 443]);
        assert!(config.intercepts.is_empty());
        assert!(!config.debug);
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let config: Config = serde_json::from_str(
            r#"{"UPSTREAM_DNS":"8.8.8.8:53","NOT_A_REAL_KEY":"whatever"}"#,
        )
        .unwrap();
        assert_eq!(config.upstream_dns, "8.8.8.8:53");
    }

    #[test]
    fn load_lowercases_intercepts() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"UPSTREAM_DNS":"8.8.8.8:53","EXTERNAL_ADDRESS":"10.0.0.1","DNS_PORT":":53","INTERCEPTS":["Example-Stream","OTHER"]}}"#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.intercepts, vec!["example-stream", "other"]);
        assert_eq!(config.external_ipv4(), Some(Ipv4Addr::new(10, 0, 0, 1)));
    }

    #[test]
    fn load_missing_file_is_an_error() {
        let result = Config::load(Path::new("/no/such/config.json"));
        assert!(result.is_err());
    }
}
