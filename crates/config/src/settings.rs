use std::collections::HashMap;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub app: AppSettings,
    pub store: StoreSettings,
    pub redis: RedisSettings,
    pub presence: PresenceSettings,
    pub events: EventSettings,
    #[serde(default)]
    pub directory: DirectorySettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppSettings {
    pub host: String,
    pub port: u16,
    pub cors_origins: Vec<String>,
}

/// Which backing implementation serves the presence and event stores.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    /// Process-local maps. Single instance only.
    Memory,
    /// Shared Redis with native key expiry. Safe across instances.
    Redis,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreSettings {
    pub backend: StoreBackend,
    pub key_prefix: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RedisSettings {
    pub url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PresenceSettings {
    pub eviction_window_secs: u64,
}

impl PresenceSettings {
    pub fn eviction_window(&self) -> Duration {
        Duration::from_secs(self.eviction_window_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EventSettings {
    pub max_messages: usize,
    pub max_polls: usize,
    pub max_reactions: usize,
    pub reaction_ttl_secs: u64,
    pub hand_raise_ttl_secs: u64,
    pub idle_bucket_ttl_secs: u64,
    pub janitor_interval_secs: u64,
}

/// Static participant allow-lists, keyed by meeting id.
///
/// A meeting with no entry admits everyone.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct DirectorySettings {
    #[serde(default)]
    pub allowed: HashMap<String, Vec<String>>,
}

impl Default for PresenceSettings {
    fn default() -> Self {
        Self {
            eviction_window_secs: 15,
        }
    }
}

impl Default for EventSettings {
    fn default() -> Self {
        Self {
            max_messages: 200,
            max_polls: 50,
            max_reactions: 50,
            reaction_ttl_secs: 10,
            hand_raise_ttl_secs: 30,
            idle_bucket_ttl_secs: 3600,
            janitor_interval_secs: 60,
        }
    }
}

impl Settings {
    pub fn load() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(
                Environment::default()
                    .separator("__")
                    .prefix("RENDEZVOUS"),
            )
            .set_default("app.host", "0.0.0.0")?
            .set_default("app.port", 3000)?
            .set_default("app.cors_origins", Vec::<String>::new())?
            .set_default("store.backend", "memory")?
            .set_default("store.key_prefix", "rdv")?
            .set_default("redis.url", "redis://127.0.0.1:6379")?
            .set_default("presence.eviction_window_secs", 15)?
            .set_default("events.max_messages", 200)?
            .set_default("events.max_polls", 50)?
            .set_default("events.max_reactions", 50)?
            .set_default("events.reaction_ttl_secs", 10)?
            .set_default("events.hand_raise_ttl_secs", 30)?
            .set_default("events.idle_bucket_ttl_secs", 3600)?
            .set_default("events.janitor_interval_secs", 60)?
            .build()?;

        config.try_deserialize()
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            app: AppSettings {
                host: "0.0.0.0".to_string(),
                port: 3000,
                cors_origins: vec![],
            },
            store: StoreSettings {
                backend: StoreBackend::Memory,
                key_prefix: "rdv".to_string(),
            },
            redis: RedisSettings {
                url: "redis://127.0.0.1:6379".to_string(),
            },
            presence: PresenceSettings::default(),
            events: EventSettings::default(),
            directory: DirectorySettings::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_loaded_defaults() {
        let loaded = Settings::load().unwrap();
        let fallback = Settings::default();
        assert_eq!(loaded.store.backend, fallback.store.backend);
        assert_eq!(
            loaded.presence.eviction_window_secs,
            fallback.presence.eviction_window_secs
        );
        assert_eq!(loaded.events.max_messages, fallback.events.max_messages);
        assert!(loaded.directory.allowed.is_empty());
    }

    #[test]
    fn backend_parses_snake_case() {
        let backend: StoreBackend = serde_json::from_str("\"redis\"").unwrap();
        assert_eq!(backend, StoreBackend::Redis);
    }
}
