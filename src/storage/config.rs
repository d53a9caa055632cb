use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub google: GoogleConfig,
    pub sync: SyncConfig,
    pub calendars: CalendarsConfig,
    pub storage: StorageConfig,
    pub source: SourceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GoogleConfig {
    pub client_id: String,
    pub client_secret: String,
    pub token_cache: PathBuf,
    pub redirect_port: u16,
    pub authorization_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncConfig {
    pub interval_minutes: u32,
    pub sync_past_days: u32,
    pub sync_future_days: u32,
    pub delete_batch_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CalendarsConfig {
    /// Remote calendar receiving the mirrored events.
    pub target: String,
    /// Local calendars to mirror, by name.
    pub sources: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageConfig {
    pub database: PathBuf,
    pub legacy_mappings: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceConfig {
    pub events_file: PathBuf,
    pub poll_seconds: u64,
}

impl Config {
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(ConfigError::from)
    }

    pub fn load_or_create() -> Result<Self, ConfigError> {
        let config_path = Self::config_path();

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            Self::from_toml(&content)
        } else {
            let config = Self::default();
            config.save()?;
            Ok(config)
        }
    }

    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("gcal-mirror")
    }

    pub fn config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        let config_path = Self::config_path();

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;

        Ok(())
    }

    /// Problems that make a sync pass pointless. An empty list means the
    /// configuration is usable.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if self.google.client_id.is_empty() || self.google.client_secret.is_empty() {
            problems.push("google.client_id and google.client_secret must be set".to_string());
        }
        if self.calendars.sources.is_empty() {
            problems.push("calendars.sources lists no calendars to mirror".to_string());
        }
        if self.calendars.target.is_empty() {
            problems.push("calendars.target must name a remote calendar".to_string());
        }
        if self.sync.interval_minutes == 0 {
            problems.push("sync.interval_minutes must be at least 1".to_string());
        }
        if self.source.poll_seconds == 0 {
            problems.push("source.poll_seconds must be at least 1".to_string());
        }

        problems
    }
}

impl Default for Config {
    fn default() -> Self {
        let config_dir = Self::config_dir();

        Self {
            google: GoogleConfig {
                client_id: String::new(),
                client_secret: String::new(),
                token_cache: config_dir.join("token.json"),
                redirect_port: 8080,
                authorization_timeout_secs: 300,
            },
            sync: SyncConfig {
                interval_minutes: 15,
                sync_past_days: 30,
                sync_future_days: 365,
                delete_batch_delay_ms: 1000,
            },
            calendars: CalendarsConfig {
                target: "primary".to_string(),
                sources: Vec::new(),
            },
            storage: StorageConfig {
                database: config_dir.join("sync.db"),
                legacy_mappings: config_dir.join("mappings.json"),
            },
            source: SourceConfig {
                events_file: config_dir.join("events.json"),
                poll_seconds: 30,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_15_minute_sync_interval() {
        let config = Config::default();
        assert_eq!(config.sync.interval_minutes, 15);
    }

    #[test]
    fn default_config_targets_primary_calendar() {
        let config = Config::default();
        assert_eq!(config.calendars.target, "primary");
        assert_eq!(config.google.redirect_port, 8080);
    }

    #[test]
    fn default_config_reports_missing_credentials_and_calendars() {
        let problems = Config::default().validate();
        assert_eq!(problems.len(), 2);
    }

    #[test]
    fn zero_intervals_are_reported() {
        let mut config = Config::default();
        config.google.client_id = "client".to_string();
        config.google.client_secret = "secret".to_string();
        config.calendars.sources = vec!["Work".to_string()];
        config.sync.interval_minutes = 0;
        config.source.poll_seconds = 0;

        let problems = config.validate();

        assert_eq!(problems.len(), 2);
        assert!(problems[0].contains("interval_minutes"));
        assert!(problems[1].contains("poll_seconds"));
    }

    #[test]
    fn parse_valid_toml_config() {
        let toml_content = r#"
            [google]
            client_id = "test_client_id"
            client_secret = "test_secret"
            token_cache = "/tmp/token.json"
            redirect_port = 9004
            authorization_timeout_secs = 120

            [sync]
            interval_minutes = 30
            sync_past_days = 7
            sync_future_days = 180
            delete_batch_delay_ms = 250

            [calendars]
            target = "mirror@group.calendar.google.com"
            sources = ["Work", "Family"]

            [storage]
            database = "/tmp/sync.db"
            legacy_mappings = "/tmp/mappings.json"

            [source]
            events_file = "/tmp/events.json"
            poll_seconds = 10
        "#;

        let config = Config::from_toml(toml_content).unwrap();

        assert_eq!(config.google.client_id, "test_client_id");
        assert_eq!(config.google.redirect_port, 9004);
        assert_eq!(config.sync.interval_minutes, 30);
        assert_eq!(config.calendars.sources, vec!["Work", "Family"]);
        assert_eq!(config.storage.database, PathBuf::from("/tmp/sync.db"));
        assert!(config.validate().is_empty());
    }

    #[test]
    fn default_config_round_trips_through_toml() {
        let config = Config::default();
        let rendered = toml::to_string_pretty(&config).unwrap();

        assert_eq!(Config::from_toml(&rendered).unwrap(), config);
    }

    #[test]
    fn parse_invalid_toml_returns_error() {
        let invalid_toml = "this is not valid toml";
        let result = Config::from_toml(invalid_toml);
        assert!(result.is_err());
    }
}
