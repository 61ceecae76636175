// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Network settings, persisted through `replay-config`.

use std::collections::BTreeMap;

use replay_config::{ConfigError, ConfigService, ConfigStore};
use replay_proto::wire::DEFAULT_MAX_PAYLOAD;
use serde::{Deserialize, Serialize};

/// Key the settings are stored under.
pub const CONFIG_KEY: &str = "replay_network";

/// `Accept` header sent with every request.
pub const ACCEPT: &str = "multipart/mixed; deferSpec=20220824, application/json";

/// Where and how requests are sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// GraphQL endpoint.
    pub url: String,
    /// HTTP method.
    pub method: String,
    /// Extra headers, sent after the defaults.
    pub headers: BTreeMap<String, String>,
    /// Ceiling on one buffered multipart part, JSON body, or handoff frame.
    pub max_frame_bytes: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:4000/graphql".to_string(),
            method: "POST".to_string(),
            headers: BTreeMap::new(),
            max_frame_bytes: DEFAULT_MAX_PAYLOAD,
        }
    }
}

impl NetworkConfig {
    /// Defaults with a different endpoint.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Add an extra header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Load from `service`, falling back to defaults when nothing is stored.
    pub fn load<S: ConfigStore>(service: &ConfigService<S>) -> Result<Self, ConfigError> {
        service.load_or_default(CONFIG_KEY)
    }

    /// Persist to `service`.
    pub fn save<S: ConfigStore>(&self, service: &ConfigService<S>) -> Result<(), ConfigError> {
        service.save(CONFIG_KEY, self)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use replay_config::MemoryConfigStore;

    #[test]
    fn missing_config_falls_back_to_defaults() {
        let svc = ConfigService::new(MemoryConfigStore::new());
        let cfg = NetworkConfig::load(&svc).unwrap();
        assert_eq!(cfg, NetworkConfig::default());
        assert_eq!(cfg.method, "POST");
        assert_eq!(cfg.max_frame_bytes, 8 * 1024 * 1024);
    }

    #[test]
    fn partial_config_keeps_other_defaults() {
        let svc = ConfigService::new(MemoryConfigStore::new());
        svc.store()
            .save_raw(CONFIG_KEY, br#"{"url": "https://api.example/graphql"}"#)
            .unwrap();
        let cfg = NetworkConfig::load(&svc).unwrap();
        assert_eq!(cfg.url, "https://api.example/graphql");
        assert_eq!(cfg.method, "POST");
    }

    #[test]
    fn saved_config_round_trips() {
        let svc = ConfigService::new(MemoryConfigStore::new());
        let cfg = NetworkConfig::new("https://x/graphql").with_header("x-render", "ssr");
        cfg.save(&svc).unwrap();
        assert_eq!(NetworkConfig::load(&svc).unwrap(), cfg);
    }
}
