//! # Process Configuration
//!
//! JSON configuration surfaces: the server bind config (§6 "Server bind
//! config") and the load balancer's per-service weight table (§6
//! "Load-balancer config file"). Both are plain `serde_json::Value`-backed
//! structs loaded once at startup — hot reload for the balancer config
//! lives in [`crate::balancer`], which re-reads the same file shape on a
//! timer rather than here.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

/// `{ "host": ..., "port": ..., "basePackage": "...", "logging": true }`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    #[serde(rename = "basePackage", default)]
    pub base_package: String,
    #[serde(default = "default_logging")]
    pub logging: bool,
}

fn default_logging() -> bool {
    true
}

impl ServerConfig {
    /// Comma-separated `basePackage` split into individual namespace
    /// prefixes, trimmed of whitespace, empty entries dropped.
    pub fn base_packages(&self) -> Vec<String> {
        self.base_package
            .split(',')
            .map(|segment| segment.trim().to_string())
            .filter(|segment| !segment.is_empty())
            .collect()
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&raw)?)
    }
}

/// `{ "<serviceName>": { "<host:port>": <weight>, ... }, ... }`
///
/// A `BTreeMap` keeps service and endpoint iteration order deterministic,
/// which matters for tests asserting on rotation proportions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BalancerConfig(pub BTreeMap<String, BTreeMap<String, u32>>);

impl BalancerConfig {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&raw)?)
    }
}

/// Process-wide properties file (spec §6: "Injected from a properties
/// file (encrypted values supported); the key set is open-ended and out
/// of scope for the core, except that `LOGGER` selects which log sinks
/// ... are active"). Parsed as flat `key=value` lines, Java-properties
/// style, since that is the shape the spec's own wording implies (a
/// "properties file", not a JSON document).
#[derive(Debug, Clone, Default)]
pub struct Properties {
    values: HashMap<String, String>,
}

impl Properties {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Ok(Self::parse(&raw))
    }

    fn parse(raw: &str) -> Self {
        let mut values = HashMap::new();
        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                values.insert(key.trim().to_string(), value.trim().to_string());
            }
        }
        Self { values }
    }

    /// Raw value for `key`. Encrypted values (the spec's "encrypted values
    /// supported" clause) are returned opaque and undecoded — decryption
    /// is a cryptographic primitive and explicitly out of scope for the
    /// core (spec §1 non-goals).
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(|s| s.as_str())
    }

    /// Decode the `LOGGER` key into a sink selection (spec §6), defaulting
    /// to console-only when the key or the whole properties file is
    /// absent.
    pub fn log_sinks(&self) -> LogSinks {
        match self.get("LOGGER") {
            Some(spec) => LogSinks::parse(spec),
            None => LogSinks::default(),
        }
    }
}

/// Which log sinks are active (spec §6: "`LOGGER` selects which log sinks
/// (console/file/remote) are active"). `remote` only marks the intent —
/// the concrete shipping transport is the operator's own `tracing` layer
/// (spec §1: log-shipping appenders are an external collaborator).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogSinks {
    pub console: bool,
    pub file: bool,
    pub remote: bool,
}

impl Default for LogSinks {
    fn default() -> Self {
        Self {
            console: true,
            file: false,
            remote: false,
        }
    }
}

impl LogSinks {
    fn parse(spec: &str) -> Self {
        let mut sinks = Self {
            console: false,
            file: false,
            remote: false,
        };
        for token in spec.split(',') {
            match token.trim().to_ascii_lowercase().as_str() {
                "console" => sinks.console = true,
                "file" => sinks.file = true,
                "remote" => sinks.remote = true,
                _ => {}
            }
        }
        sinks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_config_splits_base_package_list() {
        let config = ServerConfig {
            host: "0.0.0.0".into(),
            port: 9000,
            base_package: " com.example.a , com.example.b,,com.example.c ".into(),
            logging: true,
        };
        assert_eq!(
            config.base_packages(),
            vec!["com.example.a", "com.example.b", "com.example.c"]
        );
    }

    #[test]
    fn balancer_config_parses_nested_weights() {
        let raw = r#"{ "svc": { "10.0.0.1:9000": 2, "10.0.0.2:9000": 1 } }"#;
        let config: BalancerConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.0["svc"]["10.0.0.1:9000"], 2);
        assert_eq!(config.0["svc"]["10.0.0.2:9000"], 1);
    }

    #[test]
    fn properties_parse_skips_comments_and_blank_lines() {
        let raw = "# comment\n\nLOGGER=console,file\n! also a comment\nsecret.key=ENC(abcd1234)\n";
        let properties = Properties::parse(raw);
        assert_eq!(properties.get("LOGGER"), Some("console,file"));
        assert_eq!(properties.get("secret.key"), Some("ENC(abcd1234)"));
        assert_eq!(properties.get("missing"), None);
    }

    #[test]
    fn log_sinks_default_to_console_only_when_logger_key_absent() {
        let properties = Properties::default();
        assert_eq!(properties.log_sinks(), LogSinks::default());
        assert!(properties.log_sinks().console);
        assert!(!properties.log_sinks().file);
    }

    #[test]
    fn log_sinks_parse_comma_separated_logger_value() {
        let properties = Properties::parse("LOGGER=console,remote\n");
        let sinks = properties.log_sinks();
        assert!(sinks.console);
        assert!(!sinks.file);
        assert!(sinks.remote);
    }
}
