//! Runtime configuration: defaults, an optional CONL file, then environment

use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

pub const DEFAULT_CONFIG_FILE: &str = "spider.conl";
pub const API_KEY_ENV: &str = "DEEPSEEK_API_KEY";
pub const DB_PATH_ENV: &str = "DOUBAN_SPIDER_DB";

/// Size of the full listing
pub const LISTING_SIZE: u32 = 250;

/// Upper bound for the politeness delay between requests
const MAX_DELAY_SECS: f64 = 600.0;
/// Upper bound for the page and completion timeouts
const MAX_TIMEOUT_SECS: u64 = 600;
const MAX_RETRY_BACKOFF_MS: u64 = 60_000;

#[derive(Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Listing URL, paged with `?start=`
    pub base_url: String,
    pub pages: u32,
    pub per_page: u32,
    pub delay_min_secs: f64,
    pub delay_max_secs: f64,
    pub request_timeout_secs: u64,
    /// Extra attempts after the first failed page request
    pub fetch_retries: u32,
    /// Base delay for exponential backoff between retries
    pub retry_backoff_ms: u64,

    /// OpenAI-compatible API root (without `/chat/completions`)
    pub api_base: String,
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: f32,
    pub ai_timeout_secs: u64,
    pub ai_retries: u32,

    pub db_path: PathBuf,
    pub output_dir: PathBuf,
    /// Also append log lines to this file
    pub log_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: "https://movie.douban.com/top250".to_string(),
            pages: 10,
            per_page: 25,
            delay_min_secs: 1.0,
            delay_max_secs: 3.0,
            request_timeout_secs: 10,
            fetch_retries: 3,
            retry_backoff_ms: 2000,
            api_base: "https://api.deepseek.com".to_string(),
            api_key: None,
            model: "deepseek-chat".to_string(),
            temperature: 0.1,
            ai_timeout_secs: 30,
            ai_retries: 3,
            db_path: PathBuf::from("data/douban.db"),
            output_dir: PathBuf::from("analysis/output"),
            log_file: None,
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("base_url", &self.base_url)
            .field("pages", &self.pages)
            .field("per_page", &self.per_page)
            .field("delay_min_secs", &self.delay_min_secs)
            .field("delay_max_secs", &self.delay_max_secs)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("fetch_retries", &self.fetch_retries)
            .field("retry_backoff_ms", &self.retry_backoff_ms)
            .field("api_base", &self.api_base)
            .field("api_key", &self.api_key.as_ref().map(|_| "***"))
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("ai_timeout_secs", &self.ai_timeout_secs)
            .field("ai_retries", &self.ai_retries)
            .field("db_path", &self.db_path)
            .field("output_dir", &self.output_dir)
            .field("log_file", &self.log_file)
            .finish()
    }
}

impl Config {
    /// Build the effective configuration.
    ///
    /// An explicit `path` must exist. Without one, `spider.conl` in the working
    /// directory is used when present. Environment variables win over the file.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
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
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_conl(&content, &path.display().to_string())
    }

    pub fn from_conl(content: &str, origin: &str) -> Result<Self, ConfigError> {
        serde_conl::from_str(content).map_err(|e| ConfigError::Parse {
            path: origin.to_string(),
            message: e.to_string(),
        })
    }

    pub fn apply_env(&mut self) {
        self.apply_env_with(|key| std::env::var(key).ok());
    }

    /// Apply overrides from a variable lookup (the process environment in production)
    pub fn apply_env_with<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(key) = lookup(API_KEY_ENV).filter(|k| !k.trim().is_empty()) {
            self.api_key = Some(key.trim().to_string());
        }
        if let Some(path) = lookup(DB_PATH_ENV).filter(|p| !p.trim().is_empty()) {
            self.db_path = PathBuf::from(path);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.delay_min_secs < 0.0 || !self.delay_min_secs.is_finite() {
            return Err(ConfigError::Invalid {
                key: "delay_min_secs",
                message: format!("must be a non-negative number, got {}", self.delay_min_secs),
            });
        }
        if !(self.delay_min_secs..=MAX_DELAY_SECS).contains(&self.delay_max_secs) {
            return Err(ConfigError::Invalid {
                key: "delay_max_secs",
                message: format!(
                    "must be between delay_min_secs ({}) and {}, got {}",
                    self.delay_min_secs, MAX_DELAY_SECS, self.delay_max_secs
                ),
            });
        }
        for (key, secs) in [
            ("request_timeout_secs", self.request_timeout_secs),
            ("ai_timeout_secs", self.ai_timeout_secs),
        ] {
            if !(1..=MAX_TIMEOUT_SECS).contains(&secs) {
                return Err(ConfigError::Invalid {
                    key,
                    message: format!("must be between 1 and {}, got {}", MAX_TIMEOUT_SECS, secs),
                });
            }
        }
        if self.retry_backoff_ms > MAX_RETRY_BACKOFF_MS {
            return Err(ConfigError::Invalid {
                key: "retry_backoff_ms",
                message: format!(
                    "must be at most {}, got {}",
                    MAX_RETRY_BACKOFF_MS, self.retry_backoff_ms
                ),
            });
        }
        if self.per_page == 0 {
            return Err(ConfigError::Invalid {
                key: "per_page",
                message: "must be positive".to_string(),
            });
        }
        let listed = self.pages.checked_mul(self.per_page);
        if self.pages == 0 || listed.map_or(true, |n| n > LISTING_SIZE) {
            return Err(ConfigError::Invalid {
                key: "pages",
                message: format!(
                    "pages * per_page must be between 1 and {}, got {} * {}",
                    LISTING_SIZE, self.pages, self.per_page
                ),
            });
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(ConfigError::Invalid {
                key: "temperature",
                message: format!("must be within 0..=2, got {}", self.temperature),
            });
        }
        Ok(())
    }

    /// The API key, required whenever AI parsing runs
    pub fn require_api_key(&self) -> Result<&str, ConfigError> {
        self.api_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or(ConfigError::MissingApiKey)
    }

    /// Highest page number the listing can serve with the configured page size
    pub fn max_pages(&self) -> u32 {
        LISTING_SIZE / self.per_page.max(1)
    }

    pub fn delay_min(&self) -> Duration {
        Duration::from_secs_f64(self.delay_min_secs)
    }

    pub fn delay_max(&self) -> Duration {
        Duration::from_secs_f64(self.delay_max_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn ai_timeout(&self) -> Duration {
        Duration::from_secs(self.ai_timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.pages * config.per_page, LISTING_SIZE);
        assert_eq!(config.max_pages(), 10);
        assert_eq!(config.delay_min(), Duration::from_secs(1));
        assert_eq!(config.delay_max(), Duration::from_secs(3));
    }

    #[test]
    fn test_conl_overrides_defaults() {
        let content = "; test profile\nbase_url = http://localhost:9999/top250\npages = 2\nmodel = deepseek-reasoner\noutput_dir = out/charts\n";
        let config = Config::from_conl(content, "inline").unwrap();
        assert_eq!(config.base_url, "http://localhost:9999/top250");
        assert_eq!(config.pages, 2);
        assert_eq!(config.model, "deepseek-reasoner");
        assert_eq!(config.output_dir, PathBuf::from("out/charts"));
        assert_eq!(config.log_file, None);
        // Untouched keys keep their defaults
        assert_eq!(config.per_page, 25);
        assert_eq!(config.api_key, None);
    }

    #[test]
    fn test_conl_rejects_unknown_keys() {
        let err = Config::from_conl("pagez = 3\n", "inline").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config.apply_env_with(|key| match key {
            API_KEY_ENV => Some(" sk-test ".to_string()),
            DB_PATH_ENV => Some("/tmp/other.db".to_string()),
            _ => None,
        });
        assert_eq!(config.require_api_key().unwrap(), "sk-test");
        assert_eq!(config.db_path, PathBuf::from("/tmp/other.db"));
    }

    #[test]
    fn test_blank_env_key_is_ignored() {
        let mut config = Config::default();
        config.apply_env_with(|_| Some("   ".to_string()));
        assert!(matches!(
            config.require_api_key(),
            Err(ConfigError::MissingApiKey)
        ));
    }

    #[test]
    fn test_validate_rejects_inverted_delays() {
        let config = Config {
            delay_min_secs: 3.0,
            delay_max_secs: 1.0,
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                key: "delay_max_secs",
                ..
            })
        ));
    }

    #[test]
    fn test_validate_bounds_delays_and_timeouts() {
        let invalid_key = |config: Config| match config.validate() {
            Err(ConfigError::Invalid { key, .. }) => key,
            other => panic!("expected an invalid setting, got {:?}", other),
        };

        assert_eq!(
            invalid_key(Config {
                delay_max_secs: 1e300,
                ..Config::default()
            }),
            "delay_max_secs"
        );
        assert_eq!(
            invalid_key(Config {
                delay_max_secs: f64::NAN,
                ..Config::default()
            }),
            "delay_max_secs"
        );
        assert_eq!(
            invalid_key(Config {
                request_timeout_secs: 0,
                ..Config::default()
            }),
            "request_timeout_secs"
        );
        assert_eq!(
            invalid_key(Config {
                ai_timeout_secs: 0,
                ..Config::default()
            }),
            "ai_timeout_secs"
        );
        assert_eq!(
            invalid_key(Config {
                retry_backoff_ms: u64::MAX,
                ..Config::default()
            }),
            "retry_backoff_ms"
        );
    }

    #[test]
    fn test_validate_rejects_oversized_listing() {
        let config = Config {
            pages: 11,
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { key: "pages", .. })
        ));
    }

    #[test]
    fn test_debug_hides_api_key() {
        let config = Config {
            api_key: Some("sk-secret".to_string()),
            ..Config::default()
        };
        let debug = format!("{:?}", config);
        assert!(!debug.contains("sk-secret"));
        assert!(debug.contains("***"));
    }
}
