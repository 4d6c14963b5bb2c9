use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::bridge::BridgeConfig;
use crate::broker::Limits;
use crate::clip::TopicTemplates;
use crate::legacy::LegacyConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// name appliances use to reach this host, also the CA subject
    pub hostname: String,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub legacy: LegacyConfig,
    #[serde(default)]
    pub hub: BridgeConfig,
    #[serde(default)]
    pub topics: TopicTemplates,
    /// log targets enabled at info level, `all` enables everything
    #[serde(default = "default_log")]
    pub log: Vec<String>,
    #[serde(default = "default_ca_cert_file")]
    pub ca_cert_file: String,
    #[serde(default = "default_ca_key_file")]
    pub ca_key_file: String,
    /// payloads buffered per device
    #[serde(default = "default_device_queue")]
    pub device_queue: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub port: u16,
    pub bind: String,
    pub max_packet: usize,
    pub idle_timeout_secs: u64,
    pub outgoing_queue: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        let limits = Limits::default();
        Self {
            port: 1883,
            bind: "0.0.0.0".to_owned(),
            max_packet: limits.max_packet,
            idle_timeout_secs: limits.idle_timeout.as_secs(),
            outgoing_queue: limits.outgoing_queue,
        }
    }
}

impl BrokerConfig {
    pub fn limits(&self) -> Limits {
        Limits {
            max_packet: self.max_packet,
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            outgoing_queue: self.outgoing_queue,
        }
    }
}

fn default_log() -> Vec<String> {
    vec!["status".to_owned(), "incoming".to_owned()]
}

fn default_ca_cert_file() -> String {
    "ca.crt".to_owned()
}

fn default_ca_key_file() -> String {
    "ca.key".to_owned()
}

fn default_device_queue() -> usize {
    64
}

impl Config {
    /// Filter for the log crate, enabled targets at info and everything else at warn.
    pub fn log_filter(&self) -> String {
        if self.log.iter().any(|t| t == "all") {
            return "debug".to_owned();
        }
        let mut filter = vec!["warn".to_owned()];
        filter.extend(self.log.iter().map(|t| format!("{}=info", t)));
        filter.join(",")
    }
}

pub fn parse_config(data: &str) -> Result<Config> {
    let config: Config = serde_json::from_str(data).context("parsing config")?;
    if config.hostname.trim().is_empty() {
        anyhow::bail!("hostname must not be empty");
    }
    config.hub.validate().context("hub settings")?;
    Ok(config)
}

pub fn load_config(path: &str) -> Result<Config> {
    let data = std::fs::read_to_string(path).context(format!("reading config from {}", path))?;
    parse_config(&data).context(format!("loading {}", path))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::parse_config;

    #[test]
    fn minimal_config_gets_defaults() {
        let c = parse_config(r#"{"hostname": "cloud.local"}"#).unwrap();
        assert_eq!(c.broker.port, 1883);
        assert_eq!(c.hub.prefix, "cloudless");
        assert_eq!(c.hub.discovery_prefix, "homeassistant");
        assert_eq!(c.hub.url, None);
        assert_eq!(c.topics.message("d1"), "clip/message/devices/d1");
        assert_eq!(c.topics.device("d1"), "lime/devices/d1");
        assert_eq!(c.legacy.port, None);
        assert_eq!(c.legacy.idle_timeout_secs, 90);
        assert_eq!(c.broker.limits().idle_timeout, Duration::from_secs(300));
        assert_eq!(c.log_filter(), "warn,status=info,incoming=info");
    }

    #[test]
    fn full_config() {
        let c = parse_config(
            r#"{
                "hostname": "cloud.local",
                "broker": {"port": 8883, "idle_timeout_secs": 60},
                "legacy": {"port": 47878, "devices": {"abc": {"model": "WTDN3", "name": "Washer"}}},
                "hub": {"prefix": "lg", "url": "mqtt://hub.lan", "username": "ha", "password": "pw"},
                "log": ["all"]
            }"#,
        )
        .unwrap();
        assert_eq!(c.broker.port, 8883);
        assert_eq!(c.broker.max_packet, 1024 * 1024);
        assert_eq!(c.legacy.devices["abc"].model, "WTDN3");
        assert_eq!(c.hub.prefix, "lg");
        assert_eq!(c.hub.discovery_prefix, "homeassistant");
        assert_eq!(c.hub.url.as_deref(), Some("mqtt://hub.lan"));
        assert_eq!(c.hub.username.as_deref(), Some("ha"));
        assert_eq!(c.log_filter(), "debug");
    }

    #[test]
    fn invalid_configs() {
        assert!(parse_config("{}").is_err());
        assert!(parse_config(r#"{"hostname": " "}"#).is_err());
        assert!(parse_config("not json").is_err());
        assert!(parse_config(r#"{"hostname": "h", "hub": {"url": "tcp://hub"}}"#).is_err());
    }
}
