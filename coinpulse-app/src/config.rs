//! Configuration loader: defaults, `.env`, `coinpulse.toml`, then environment
//! overrides.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use coinpulse_core::{DashboardConfig, FeedConfig, PipelineConfig};

pub const DEFAULT_CONFIG_FILE: &str = "coinpulse.toml";
pub const DEFAULT_LOG_FILTER: &str = "coinpulse=info,coinpulse_core=info,coinpulse_scheduler=info";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("{name}: {message}")]
    Env { name: &'static str, message: String },

    #[error("Invalid config:\n - {}", .0.join("\n - "))]
    Invalid(Vec<String>),
}

/// Result of looking for a `.env` file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DotenvStatus {
    Loaded(PathBuf),
    NotFound,
    Failed(String),
}

impl DotenvStatus {
    pub fn from_result(result: Result<PathBuf, dotenvy::Error>) -> Self {
        match result {
            Ok(path) => Self::Loaded(path),
            Err(e) if e.not_found() => Self::NotFound,
            Err(e) => Self::Failed(e.to_string()),
        }
    }

    pub fn log(&self) {
        match self {
            Self::Loaded(path) => tracing::debug!(path = %path.display(), "loaded .env file"),
            Self::NotFound => tracing::debug!("no .env file found"),
            Self::Failed(e) => tracing::warn!(error = %e, "failed to load .env file"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub fetch_interval_secs: u64,
    pub etl_interval_secs: u64,
    /// How far back each scheduled ETL run looks.
    pub etl_window_days: u32,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            fetch_interval_secs: 60,
            etl_interval_secs: 30,
            etl_window_days: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    pub classifier_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            classifier_path: PathBuf::from("data/model/anomaly_classifier.json"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    pub enabled: bool,
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub feed: FeedConfig,
    pub schedule: ScheduleConfig,
    pub storage: StorageConfig,
    pub pipeline: PipelineConfig,
    pub dashboard: DashboardConfig,
    pub notify: NotifyConfig,
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            feed: FeedConfig::default(),
            schedule: ScheduleConfig::default(),
            storage: StorageConfig::default(),
            pipeline: PipelineConfig::default(),
            dashboard: DashboardConfig::default(),
            notify: NotifyConfig::default(),
            log_level: DEFAULT_LOG_FILTER.to_string(),
            log_format: LogFormat::Text,
        }
    }
}

impl AppConfig {
    /// Load configuration. An explicit `path` must exist; otherwise
    /// `coinpulse.toml` in the working directory is read when present.
    /// The `.env` outcome is returned rather than logged so the caller can
    /// report it once logging is set up.
    pub fn load(path: Option<&Path>) -> Result<(Self, DotenvStatus), ConfigError> {
        let dotenv = DotenvStatus::from_result(dotenvy::dotenv());

        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_FILE);
                if default_path.exists() {
                    Self::from_file(default_path)?
                } else {
                    Self::default()
                }
            }
        };

        config.apply_env(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok((config, dotenv))
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    /// Apply environment overrides. `lookup` returns the raw value of a
    /// variable, if set.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(key) = get("COINGECKO_API_KEY") {
            self.feed.api_key = Some(key);
        }
        if let Some(url) = get("COINPULSE_API_BASE_URL") {
            self.feed.base_url = url;
        }
        if let Some(raw) = get("COINPULSE_FETCH_PAGES") {
            self.feed.pages = parse_number(&raw, "COINPULSE_FETCH_PAGES")?;
        }
        if let Some(raw) = get("COINPULSE_PER_PAGE") {
            self.feed.per_page = parse_number(&raw, "COINPULSE_PER_PAGE")?;
        }
        if let Some(raw) = get("COINPULSE_FETCH_INTERVAL_SECS") {
            self.schedule.fetch_interval_secs = parse_number(&raw, "COINPULSE_FETCH_INTERVAL_SECS")?;
        }
        if let Some(raw) = get("COINPULSE_ETL_INTERVAL_SECS") {
            self.schedule.etl_interval_secs = parse_number(&raw, "COINPULSE_ETL_INTERVAL_SECS")?;
        }
        if let Some(raw) = get("COINPULSE_ETL_WINDOW_DAYS") {
            self.schedule.etl_window_days = parse_number(&raw, "COINPULSE_ETL_WINDOW_DAYS")?;
        }
        if let Some(dir) = get("COINPULSE_DATA_DIR") {
            self.storage.data_dir = PathBuf::from(dir);
        }
        if let Some(path) = get("COINPULSE_CLASSIFIER_PATH") {
            self.storage.classifier_path = PathBuf::from(path);
        }
        if let Some(raw) = get("COINPULSE_CONTAMINATION") {
            self.pipeline.anomaly.contamination = parse_number(&raw, "COINPULSE_CONTAMINATION")?;
        }
        if let Some(addr) = get("COINPULSE_BIND_ADDRESS") {
            self.dashboard.bind_address = addr;
        }
        if let Some(raw) = get("COINPULSE_PORT") {
            self.dashboard.port = parse_number(&raw, "COINPULSE_PORT")?;
        }
        if let Some(url) = get("COINPULSE_WEBHOOK_URL") {
            self.notify.webhook_url = Some(url);
            self.notify.enabled = true;
        }
        if let Some(level) = get("COINPULSE_LOG_LEVEL") {
            self.log_level = level;
        }
        if let Some(raw) = get("COINPULSE_LOG_FORMAT") {
            self.log_format = match raw.to_ascii_lowercase().as_str() {
                "text" | "pretty" => LogFormat::Text,
                "json" => LogFormat::Json,
                _ => {
                    return Err(ConfigError::Env {
                        name: "COINPULSE_LOG_FORMAT",
                        message: "must be one of: text, json".into(),
                    })
                }
            };
        }

        Ok(())
    }

    /// Check every section and report all problems at once.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut issues: Vec<String> = Vec::new();

        if url::Url::parse(&self.feed.base_url).is_err() {
            issues.push(format!("feed.base_url is not a valid URL: {}", self.feed.base_url));
        }
        if self.feed.pages == 0 {
            issues.push("feed.pages must be > 0".into());
        }
        if self.feed.per_page == 0 || self.feed.per_page > 250 {
            issues.push("feed.per_page must be in [1, 250]".into());
        }
        if self.feed.currency.trim().is_empty() {
            issues.push("feed.currency must not be empty".into());
        }

        if self.schedule.fetch_interval_secs == 0 {
            issues.push("schedule.fetch_interval_secs must be > 0".into());
        }
        if self.schedule.etl_interval_secs == 0 {
            issues.push("schedule.etl_interval_secs must be > 0".into());
        }
        if self.schedule.etl_window_days == 0 {
            issues.push("schedule.etl_window_days must be > 0".into());
        }

        if let Err(e) = self.pipeline.anomaly.validate() {
            issues.push(format!("pipeline.anomaly: {e}"));
        }

        if self.dashboard.socket_addr().is_err() {
            issues.push(format!(
                "dashboard.bind_address/port do not form a socket address: {}:{}",
                self.dashboard.bind_address, self.dashboard.port
            ));
        }
        if self.dashboard.refresh_secs == 0 {
            issues.push("dashboard.refresh_secs must be > 0".into());
        }

        if self.notify.enabled {
            match &self.notify.webhook_url {
                None => issues.push("notify.webhook_url is required when notify.enabled = true".into()),
                Some(url) if url::Url::parse(url).is_err() => {
                    issues.push(format!("notify.webhook_url is not a valid URL: {url}"))
                }
                Some(_) => {}
            }
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(issues))
        }
    }
}

fn parse_number<T: std::str::FromStr>(raw: &str, name: &'static str) -> Result<T, ConfigError> {
    raw.parse::<T>().map_err(|_| ConfigError::Env {
        name,
        message: format!("not a valid number: {raw}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use coinpulse_core::{BootstrapPolicy, DedupeKey};
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.schedule.fetch_interval_secs, 60);
        assert_eq!(config.schedule.etl_interval_secs, 30);
        assert_eq!(config.dashboard.port, 8080);
        assert_eq!(config.pipeline.anomaly.contamination, 0.1);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = AppConfig::from_toml(
            r#"
            log_format = "json"

            [feed]
            pages = 2

            [pipeline]
            bootstrap = "require_trained"
            dedupe_key = "asset"

            [pipeline.anomaly]
            contamination = 0.05
            "#,
        )
        .unwrap();

        assert_eq!(config.feed.pages, 2);
        assert_eq!(config.feed.per_page, 250);
        assert_eq!(config.pipeline.bootstrap, BootstrapPolicy::RequireTrained);
        assert_eq!(config.pipeline.dedupe_key, DedupeKey::Asset);
        assert_eq!(config.pipeline.anomaly.contamination, 0.05);
        assert_eq!(config.pipeline.anomaly.n_estimators, 100);
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.dashboard, DashboardConfig::default());
    }

    #[test]
    fn test_env_overrides_file_values() {
        let mut config = AppConfig::from_toml("[dashboard]\nport = 9000\n").unwrap();
        config
            .apply_env(env(&[
                ("COINGECKO_API_KEY", " demo-key "),
                ("COINPULSE_PORT", "9100"),
                ("COINPULSE_CONTAMINATION", "0.2"),
                ("COINPULSE_WEBHOOK_URL", "https://hooks.example.com/etl"),
                ("COINPULSE_DATA_DIR", ""),
            ]))
            .unwrap();

        assert_eq!(config.feed.api_key.as_deref(), Some("demo-key"));
        assert_eq!(config.dashboard.port, 9100);
        assert_eq!(config.pipeline.anomaly.contamination, 0.2);
        assert!(config.notify.enabled);
        assert_eq!(config.storage.data_dir, PathBuf::from("data"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_bad_env_number_is_rejected() {
        let mut config = AppConfig::default();
        let err = config
            .apply_env(env(&[("COINPULSE_FETCH_PAGES", "many")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Env { name: "COINPULSE_FETCH_PAGES", .. }));
    }

    #[test]
    fn test_validate_collects_every_issue() {
        let mut config = AppConfig::default();
        config.feed.per_page = 1000;
        config.schedule.etl_interval_secs = 0;
        config.pipeline.anomaly.contamination = 0.9;
        config.notify.enabled = true;

        let err = config.validate().unwrap_err();
        let ConfigError::Invalid(issues) = &err else {
            panic!("expected Invalid, got {err:?}");
        };
        assert_eq!(issues.len(), 4);
        assert!(err.to_string().starts_with("Invalid config:\n - feed.per_page"));
    }

    #[test]
    fn test_dotenv_status_is_reported_not_dropped() {
        let missing = dotenvy::Error::Io(std::io::Error::from(std::io::ErrorKind::NotFound));
        assert_eq!(DotenvStatus::from_result(Err(missing)), DotenvStatus::NotFound);

        let bad_line = dotenvy::Error::LineParse("KEY VALUE".to_string(), 3);
        assert!(matches!(DotenvStatus::from_result(Err(bad_line)), DotenvStatus::Failed(_)));

        assert_eq!(
            DotenvStatus::from_result(Ok(PathBuf::from(".env"))),
            DotenvStatus::Loaded(PathBuf::from(".env"))
        );
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let path = Path::new("no-such-dir/coinpulse.toml");
        assert!(matches!(AppConfig::from_file(path), Err(ConfigError::Read { .. })));
    }
}
