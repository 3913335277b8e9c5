//! # Command-Line Interface
//!
//! `clap`-derived argument parsing for the `meshrpc-server` binary.
//! Mirrors spec §6's server bind config (`host`, `port`, `basePackage`,
//! `logging`) as CLI flags plus a JSON config file override, along with
//! the load-balancer config path and logging verbosity. Grounded on the
//! teacher's own `cli.rs` — the `styles()` helper, duration parsing idiom,
//! and doc-comment density are kept near verbatim; the argument set itself
//! is new.

use clap::{
    builder::styling::{AnsiColor, Styles},
    Parser,
};
use std::path::PathBuf;
use std::time::Duration;

use crate::config::ServerConfig;
use crate::router::DuplicateRoutePolicy;

/// Defines the styles for the help message to replicate clap v3's appearance.
fn styles() -> Styles {
    Styles::styled()
        .header(AnsiColor::Yellow.on_default())
        .usage(AnsiColor::Yellow.on_default())
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
}

/// meshrpc — length-prefixed RPC transport, annotation-style router, and
/// client-side load balancer.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None, styles = styles())]
pub struct Args {
    /// JSON server bind config, per spec §6 (`host`, `port`, `basePackage`,
    /// `logging`). When present, overrides `--host`/`--port`/`--base-package`.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Interface to bind the RPC listener to.
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,

    /// Port to bind the RPC listener to.
    #[arg(long, default_value_t = 7077)]
    pub port: u16,

    /// Comma-separated namespace prefixes used to scope route discovery.
    /// An empty value accepts every compiled-in route.
    #[arg(long, default_value = "")]
    pub base_package: String,

    /// Path to the load balancer's JSON weight config. Required only by
    /// processes that make outbound calls through [`crate::balancer`];
    /// absence at startup is fatal per spec §6 if supplied.
    #[arg(long)]
    pub balancer_config: Option<PathBuf>,

    /// Post-response linger before a connection closes (spec §4.4 default
    /// 100ms), e.g. "100ms", "1s".
    #[arg(long, value_parser = parse_duration, default_value = "100ms")]
    pub linger: Duration,

    /// Fail registry construction on a duplicate route instead of the
    /// default warn-and-overwrite (spec §9 open question).
    #[arg(long)]
    pub fatal_on_duplicate_route: bool,

    /// How long the graceful shutdown sequence waits for in-flight
    /// invocations to drain before closing anyway.
    #[arg(long, value_parser = parse_duration, default_value = "30s")]
    pub drain_deadline: Duration,

    /// Write detailed logs here instead of a rolling file; "stderr" logs
    /// to stderr instead.
    #[arg(long)]
    pub log_file: Option<String>,

    /// Process-wide properties file (spec §6): open-ended `key=value`
    /// config whose only core-relevant key is `LOGGER`, selecting which
    /// log sinks (console/file/remote) are active.
    #[arg(long)]
    pub properties: Option<PathBuf>,

    /// Increase diagnostic log verbosity on stderr.
    ///  -v: debug
    ///  -vv and above: trace
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl Args {
    /// Load the `--properties` file if given, defaulting to console-only
    /// log sinks when absent.
    pub fn properties(&self) -> anyhow::Result<crate::config::Properties> {
        match &self.properties {
            Some(path) => crate::config::Properties::load(path),
            None => Ok(crate::config::Properties::default()),
        }
    }

    /// Resolve the server bind config: the `--config` file if given,
    /// otherwise the individual CLI flags.
    pub fn server_config(&self) -> anyhow::Result<ServerConfig> {
        match &self.config {
            Some(path) => ServerConfig::load(path),
            None => Ok(ServerConfig {
                host: self.host.clone(),
                port: self.port,
                base_package: self.base_package.clone(),
                logging: true,
            }),
        }
    }

    pub fn duplicate_route_policy(&self) -> DuplicateRoutePolicy {
        if self.fatal_on_duplicate_route {
            DuplicateRoutePolicy::Fatal
        } else {
            DuplicateRoutePolicy::WarnAndOverwrite
        }
    }
}

/// Parse duration from string (e.g., "100ms", "30s", "5m", "1h").
fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("duration cannot be empty".to_string());
    }

    let (num_str, unit) = if let Some(stripped) = s.strip_suffix("ms") {
        (stripped, "ms")
    } else if let Some(stripped) = s.strip_suffix('s') {
        (stripped, "s")
    } else if let Some(stripped) = s.strip_suffix('m') {
        (stripped, "m")
    } else if let Some(stripped) = s.strip_suffix('h') {
        (stripped, "h")
    } else {
        (s, "s")
    };

    let num: f64 = num_str
        .parse()
        .map_err(|_| format!("invalid number in duration: {num_str}"))?;
    if num < 0.0 {
        return Err("duration cannot be negative".to_string());
    }

    Ok(match unit {
        "ms" => Duration::from_millis(num as u64),
        "s" => Duration::from_secs(num as u64),
        "m" => Duration::from_secs((num * 60.0) as u64),
        "h" => Duration::from_secs((num * 3600.0) as u64),
        _ => return Err(format!("invalid duration unit: {unit}")),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_human_readable_durations() {
        assert_eq!(parse_duration("100ms").unwrap(), Duration::from_millis(100));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("10").unwrap(), Duration::from_secs(10));
    }

    #[test]
    fn rejects_empty_and_negative_durations() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("-5s").is_err());
        assert!(parse_duration("nonsense").is_err());
    }

    #[test]
    fn default_args_resolve_a_server_config_without_a_file() {
        let args = Args::parse_from(["meshrpc-server"]);
        let config = args.server_config().unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 7077);
        assert!(config.base_packages().is_empty());
    }

    #[test]
    fn fatal_flag_selects_fatal_duplicate_policy() {
        let args = Args::parse_from(["meshrpc-server", "--fatal-on-duplicate-route"]);
        assert_eq!(args.duplicate_route_policy(), DuplicateRoutePolicy::Fatal);
    }

    #[test]
    fn missing_properties_flag_defaults_to_console_only_sinks() {
        let args = Args::parse_from(["meshrpc-server"]);
        let properties = args.properties().unwrap();
        assert!(properties.log_sinks().console);
        assert!(!properties.log_sinks().file);
    }
}
