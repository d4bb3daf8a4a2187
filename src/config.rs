use std::path::Path;

use figment::{providers::Format, Figment};
use serde::{Deserialize, Serialize};

use crate::automations::PushSettings;

#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub system: ConfigSystem,
    /// Pushover-style push delivery; `sendPushNotification` actions fail
    /// without it.
    #[serde(default)]
    pub push: Option<PushSettings>,
}

#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
pub struct ConfigSystem {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_database_path")]
    pub database_path: String,
    /// Inbound event ring depth; overflow drops the oldest frames.
    #[serde(default = "default_queue_capacity")]
    pub event_queue_capacity: usize,
    /// Concurrent automation executions per organization.
    #[serde(default = "default_org_execution_cap")]
    pub org_execution_cap: usize,
}

impl Default for ConfigSystem {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            database_path: default_database_path(),
            event_queue_capacity: default_queue_capacity(),
            org_execution_cap: default_org_execution_cap(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_database_path() -> String {
    "fusion.db".to_string()
}

fn default_queue_capacity() -> usize {
    crate::pipeline::DEFAULT_QUEUE_CAPACITY
}

fn default_org_execution_cap() -> usize {
    crate::automations::DEFAULT_ORG_CONCURRENCY
}

pub fn load_config(path: impl AsRef<Path>) -> Result<Config, String> {
    let cfg: Config = Figment::new()
        .merge(figment::providers::Toml::file(path))
        .merge(figment::providers::Env::prefixed("FUSION_"))
        .extract()
        .map_err(|e| e.to_string())?;

    if cfg.system.event_queue_capacity == 0 {
        return Err("system.event_queue_capacity must be at least 1".to_string());
    }
    if cfg.system.org_execution_cap == 0 {
        return Err("system.org_execution_cap must be at least 1".to_string());
    }
    Ok(cfg)
}

#[cfg(test)]
mod test {
    use super::*;
    use indoc::indoc;

    #[test]
    fn test_defaults_apply() {
        let cfg: Config = Figment::new()
            .merge(figment::providers::Toml::string(""))
            .extract()
            .unwrap();
        assert_eq!(cfg.system.log_level, "info");
        assert_eq!(cfg.system.event_queue_capacity, 1024);
        assert_eq!(cfg.system.org_execution_cap, 16);
        assert!(cfg.push.is_none());
    }

    #[test]
    fn test_parses_full_config() {
        let cfg: Config = Figment::new()
            .merge(figment::providers::Toml::string(indoc! {r#"
                [system]
                log_level = "debug"
                database_path = "/var/lib/fusion/fusion.db"
                event_queue_capacity = 2048

                [push]
                token = "app-token"
                group_key = "group-1"
            "#}))
            .extract()
            .unwrap();
        assert_eq!(cfg.system.log_level, "debug");
        assert_eq!(cfg.system.event_queue_capacity, 2048);
        let push = cfg.push.unwrap();
        assert_eq!(push.token, "app-token");
        assert_eq!(push.group_key, "group-1");
        assert_eq!(push.api_url, "https://api.pushover.net/1/messages.json");
    }
}
