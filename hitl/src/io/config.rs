//! Client settings from the environment and server settings from TOML.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::broker::BrokerConfig;

pub const DEFAULT_SERVER_URL: &str = "http://localhost:8765";

pub const ENV_SERVER_URL: &str = "HITL_SERVER_URL";
pub const ENV_ENABLED: &str = "HITL_ENABLED";
pub const ENV_TIMEOUT: &str = "HITL_TIMEOUT";
pub const ENV_GRACE: &str = "HITL_GRACE";

/// Settings a producer reads once, at client construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Base URL of the HITL server.
    pub server_url: String,
    /// When false, requests are answered locally without contacting the server.
    pub enabled: bool,
    /// Broker timeout applied to FEEDBACK requests that carry none.
    pub default_timeout: Duration,
    /// Extra HTTP wait beyond the broker timeout, so the broker's own timeout
    /// response arrives before the transport gives up.
    pub grace: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            enabled: true,
            default_timeout: Duration::from_secs(300),
            grace: Duration::from_secs(10),
        }
    }
}

impl ClientConfig {
    /// Read `HITL_SERVER_URL`, `HITL_ENABLED`, `HITL_TIMEOUT`, and `HITL_GRACE`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unset keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut cfg = Self::default();
        if let Some(url) = lookup(ENV_SERVER_URL) {
            cfg.server_url = url;
        }
        if let Some(enabled) = lookup(ENV_ENABLED) {
            // Anything other than "true" disables, matching shell conventions
            // where HITL_ENABLED=0/false/no all mean off.
            cfg.enabled = enabled.trim().eq_ignore_ascii_case("true");
        }
        if let Some(timeout) = lookup(ENV_TIMEOUT) {
            cfg.default_timeout = parse_secs(ENV_TIMEOUT, &timeout)?;
        }
        if let Some(grace) = lookup(ENV_GRACE) {
            cfg.grace = parse_secs(ENV_GRACE, &grace)?;
        }
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn with_server_url(mut self, server_url: impl Into<String>) -> Self {
        self.server_url = server_url.into();
        self
    }

    pub fn validate(&self) -> Result<()> {
        validate_server_url(&self.server_url)?;
        if self.default_timeout.is_zero() {
            return Err(anyhow!("{ENV_TIMEOUT} must be > 0"));
        }
        Ok(())
    }
}

fn parse_secs(key: &str, raw: &str) -> Result<Duration> {
    let secs: u64 = raw
        .trim()
        .parse()
        .with_context(|| format!("{key} must be a whole number of seconds, got {raw:?}"))?;
    Ok(Duration::from_secs(secs))
}

pub fn validate_server_url(url: &str) -> Result<()> {
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(anyhow!("server url must start with http:// or https://, got {url:?}"));
    }
    Ok(())
}

/// Server configuration (TOML).
///
/// Every field is optional in the file; missing fields take the defaults
/// below. Command-line flags override file values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind.
    pub bind: String,

    pub port: u16,

    /// Long-poll budget for `GET /next` when the consumer names none.
    pub default_poll_secs: u64,

    /// Upper bound on any long-poll budget.
    pub max_poll_secs: u64,

    pub broker: BrokerConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 8765,
            default_poll_secs: 30,
            max_poll_secs: 120,
            broker: BrokerConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.bind.trim().is_empty() {
            return Err(anyhow!("bind must be a non-empty address"));
        }
        if self.max_poll_secs == 0 {
            return Err(anyhow!("max_poll_secs must be > 0"));
        }
        if self.default_poll_secs > self.max_poll_secs {
            return Err(anyhow!(
                "default_poll_secs ({}) must not exceed max_poll_secs ({})",
                self.default_poll_secs,
                self.max_poll_secs
            ));
        }
        self.broker.validate()
    }

    pub fn default_poll(&self) -> Duration {
        Duration::from_secs(self.default_poll_secs)
    }

    pub fn max_poll(&self) -> Duration {
        Duration::from_secs(self.max_poll_secs)
    }
}

/// Load server config from a TOML file.
///
/// If the file is missing, returns `ServerConfig::default()`.
pub fn load_config(path: &Path) -> Result<ServerConfig> {
    if !path.exists() {
        let cfg = ServerConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: ServerConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::broker::NotifyPolicy;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn client_defaults_when_env_is_empty() {
        let cfg = ClientConfig::from_lookup(lookup(&[])).expect("config");
        assert_eq!(cfg, ClientConfig::default());
    }

    #[test]
    fn client_reads_env_values() {
        let cfg = ClientConfig::from_lookup(lookup(&[
            ("HITL_SERVER_URL", "http://10.0.0.5:9000"),
            ("HITL_ENABLED", "TRUE"),
            ("HITL_TIMEOUT", "45"),
            ("HITL_GRACE", "3"),
        ]))
        .expect("config");
        assert_eq!(cfg.server_url, "http://10.0.0.5:9000");
        assert!(cfg.enabled);
        assert_eq!(cfg.default_timeout, Duration::from_secs(45));
        assert_eq!(cfg.grace, Duration::from_secs(3));
    }

    #[test]
    fn anything_but_true_disables() {
        for value in ["false", "0", "yes", ""] {
            let cfg = ClientConfig::from_lookup(lookup(&[("HITL_ENABLED", value)])).expect("config");
            assert!(!cfg.enabled, "{value:?} should disable");
        }
    }

    #[test]
    fn client_rejects_bad_timeout_and_url() {
        let err = ClientConfig::from_lookup(lookup(&[("HITL_TIMEOUT", "soon")]))
            .expect_err("bad timeout");
        assert!(format!("{err:#}").contains("HITL_TIMEOUT"));

        assert!(ClientConfig::from_lookup(lookup(&[("HITL_TIMEOUT", "0")])).is_err());
        assert!(ClientConfig::from_lookup(lookup(&[("HITL_SERVER_URL", "localhost:8765")])).is_err());
    }

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, ServerConfig::default());
    }

    #[test]
    fn load_partial_file_keeps_other_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("hitl.toml");
        fs::write(
            &path,
            "port = 9100\n\n[broker]\nreaper_interval_secs = 5\nnotify_policy = \"await_ack\"\n",
        )
        .expect("write");

        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.port, 9100);
        assert_eq!(cfg.bind, "127.0.0.1");
        assert_eq!(cfg.broker.reaper_interval_secs, 5);
        assert_eq!(cfg.broker.notify_policy, NotifyPolicy::AwaitAck);
        assert_eq!(cfg.broker.notify_retention_secs, 300);
    }

    #[test]
    fn load_rejects_inconsistent_poll_limits() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("hitl.toml");
        fs::write(&path, "default_poll_secs = 60\nmax_poll_secs = 10\n").expect("write");

        let err = load_config(&path).expect_err("invalid");
        assert!(err.to_string().contains("default_poll_secs"));
    }
}
