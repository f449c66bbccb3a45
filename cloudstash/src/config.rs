//! Layered configuration: defaults, a TOML file, and `CLOUDSTASH_*` environment variables.
//!
//! The raw [CloudstashConfig] holds human-readable values like `"7days"` or `"50GiB"`. It is
//! validated into typed [CacheSettings] before use.

use crate::object::{ObjectCacheOptions, RemoteErrorPolicy};
use crate::remote::retry::RetryPolicy;
use crate::store::eviction::{LruPolicy, is_valid_fraction};
use crate::table::TableCacheOptions;
use crate::util::humanbytes::{ParserError, parse_bytes_from_str};
use chrono::TimeDelta;
use config::builder::DefaultState;
use config::{Config, ConfigBuilder, ConfigError, Environment, File, Map, Source};
use directories::ProjectDirs;
use std::path::PathBuf;
use std::time::Duration;

pub const CONFIG_FILE_ENV_VAR: &str = "CLOUDSTASH_CONFIG_FILE";

#[derive(Clone, Debug, serde::Deserialize, PartialEq)]
pub struct CloudstashConfig {
    /// Empty to use the platform cache directory.
    pub cache_dir: String,
    /// Empty to keep table scans until the table changes.
    pub table_cache_life: String,
    pub on_remote_error: RemoteErrorPolicy,
    pub metadata_fallback: bool,

    pub eviction: EvictionConfig,
    pub retry: RetryConfig,
}

#[derive(Clone, Debug, serde::Deserialize, PartialEq)]
pub struct EvictionConfig {
    /// Empty for no limit.
    pub max_unused_age: String,
    /// Empty for no limit.
    pub max_size: String,
    #[serde(default)]
    pub max_fraction_of_free: Option<f64>,
}

#[derive(Clone, Debug, serde::Deserialize, PartialEq)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay: String,
    pub max_delay: String,
    pub multiplier: f64,
    pub jitter: bool,
}

impl CloudstashConfig {
    pub fn load() -> Result<Self, LoadConfigError> {
        ConfigLoader::new().add_default_sources().load()
    }
}

/// Validated settings of a cache.
#[derive(Clone, Debug, PartialEq)]
pub struct CacheSettings {
    pub cache_dir: PathBuf,
    pub table_cache_life: Option<TimeDelta>,
    pub eviction: LruPolicy,
    pub on_remote_error: RemoteErrorPolicy,
    pub metadata_fallback: bool,
    pub retry: RetryPolicy,
}

impl CacheSettings {
    /// Loads the configuration from the default sources and validates it.
    pub fn load() -> Result<Self, LoadConfigError> {
        CloudstashConfig::load()?.try_into()
    }

    pub fn object_options(&self) -> ObjectCacheOptions {
        ObjectCacheOptions {
            on_remote_error: self.on_remote_error,
            metadata_fallback: self.metadata_fallback,
        }
    }

    pub fn table_options(&self) -> TableCacheOptions {
        TableCacheOptions {
            cache_life: self.table_cache_life,
            on_remote_error: self.on_remote_error,
        }
    }
}

impl TryFrom<CloudstashConfig> for CacheSettings {
    type Error = LoadConfigError;

    fn try_from(config: CloudstashConfig) -> Result<Self, Self::Error> {
        let cache_dir = if config.cache_dir.is_empty() {
            default_cache_dir().ok_or(LoadConfigError::NoCacheDir)?
        } else {
            PathBuf::from(config.cache_dir)
        };

        let max_fraction_of_free = match config.eviction.max_fraction_of_free {
            Some(fraction) if !is_valid_fraction(fraction) => {
                return Err(LoadConfigError::OutOfRange {
                    key: "eviction.max_fraction_of_free",
                    value: fraction.to_string(),
                });
            }
            fraction => fraction,
        };
        if config.retry.max_attempts == 0 {
            return Err(LoadConfigError::OutOfRange {
                key: "retry.max_attempts",
                value: "0".to_string(),
            });
        }
        if config.retry.multiplier.is_nan() || config.retry.multiplier < 1.0 {
            return Err(LoadConfigError::OutOfRange {
                key: "retry.multiplier",
                value: config.retry.multiplier.to_string(),
            });
        }

        Ok(Self {
            cache_dir,
            table_cache_life: optional_time_delta("table_cache_life", &config.table_cache_life)?,
            eviction: LruPolicy {
                max_unused_age: optional_time_delta(
                    "eviction.max_unused_age",
                    &config.eviction.max_unused_age,
                )?,
                max_size: optional_size("eviction.max_size", &config.eviction.max_size)?,
                max_fraction_of_free,
            },
            on_remote_error: config.on_remote_error,
            metadata_fallback: config.metadata_fallback,
            retry: RetryPolicy {
                max_attempts: config.retry.max_attempts,
                initial_delay: duration("retry.initial_delay", &config.retry.initial_delay)?,
                max_delay: duration("retry.max_delay", &config.retry.max_delay)?,
                multiplier: config.retry.multiplier,
                jitter: config.retry.jitter,
            },
        })
    }
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", "cloudstash")
}

pub fn default_cache_dir() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.cache_dir().to_path_buf())
}

fn duration(key: &'static str, value: &str) -> Result<Duration, LoadConfigError> {
    humantime::parse_duration(value).map_err(|source| LoadConfigError::InvalidDuration { key, source })
}

fn optional_time_delta(key: &'static str, value: &str) -> Result<Option<TimeDelta>, LoadConfigError> {
    if value.is_empty() {
        return Ok(None);
    }
    let duration = duration(key, value)?;
    TimeDelta::from_std(duration)
        .map(Some)
        .map_err(|_| LoadConfigError::OutOfRange {
            key,
            value: value.to_string(),
        })
}

fn optional_size(key: &'static str, value: &str) -> Result<Option<u64>, LoadConfigError> {
    if value.is_empty() {
        return Ok(None);
    }
    parse_bytes_from_str(value)
        .map(Some)
        .map_err(|source| LoadConfigError::InvalidSize { key, source })
}

#[derive(Debug, thiserror::Error)]
pub enum LoadConfigError {
    #[error("configuration error: {0}")]
    ConfigError(#[from] ConfigError),
    #[error("invalid duration for {key}: {source}")]
    InvalidDuration {
        key: &'static str,
        source: humantime::DurationError,
    },
    #[error("invalid size for {key}: {source}")]
    InvalidSize {
        key: &'static str,
        source: ParserError,
    },
    #[error("value out of range for {key}: {value}")]
    OutOfRange { key: &'static str, value: String },
    #[error("no cache directory configured and no platform default available")]
    NoCacheDir,
}

pub struct ConfigLoader(ConfigBuilder<DefaultState>);

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    pub fn new() -> Self {
        ConfigLoader(Config::builder())
    }

    pub fn add_default_sources(self) -> Self {
        let config_file = std::env::var_os(CONFIG_FILE_ENV_VAR)
            .map(PathBuf::from)
            .or_else(|| project_dirs().map(|dirs| dirs.config_dir().join("config.toml")));
        let loader = match config_file {
            Some(path) => self.add_file_source(File::from(path).required(false)),
            None => self,
        };
        loader.add_environment_source(None)
    }

    pub fn add_file_source<T, F>(mut self, file: File<T, F>) -> Self
    where
        File<T, F>: Source + Send + Sync + 'static,
    {
        self.0 = self.0.add_source(file);
        self
    }

    pub fn add_environment_source(mut self, source: Option<Map<String, String>>) -> Self {
        self.0 = self.0.add_source(
            Environment::with_prefix("CLOUDSTASH")
                .separator("__")
                .prefix_separator("_")
                .try_parsing(true)
                .source(source),
        );
        self
    }

    pub fn load(self) -> Result<CloudstashConfig, LoadConfigError> {
        self.0
            .set_default("cache_dir", "")?
            .set_default("table_cache_life", "")?
            .set_default("on_remote_error", "propagate")?
            .set_default("metadata_fallback", true)?
            .set_default("eviction.max_unused_age", "7days")?
            .set_default("eviction.max_size", "10GiB")?
            .set_default("retry.max_attempts", 10)?
            .set_default("retry.initial_delay", "250ms")?
            .set_default("retry.max_delay", "30s")?
            .set_default("retry.multiplier", 2.0)?
            .set_default("retry.jitter", true)?
            .build()?
            .try_deserialize()
            .map_err(LoadConfigError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::{File, FileFormat, Map};
    use serial_test::serial;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn default_config() -> CloudstashConfig {
        CloudstashConfig {
            cache_dir: "".to_string(),
            table_cache_life: "".to_string(),
            on_remote_error: RemoteErrorPolicy::Propagate,
            metadata_fallback: true,
            eviction: EvictionConfig {
                max_unused_age: "7days".to_string(),
                max_size: "10GiB".to_string(),
                max_fraction_of_free: None,
            },
            retry: RetryConfig {
                max_attempts: 10,
                initial_delay: "250ms".to_string(),
                max_delay: "30s".to_string(),
                multiplier: 2.0,
                jitter: true,
            },
        }
    }

    fn customized_config() -> CloudstashConfig {
        CloudstashConfig {
            cache_dir: "/var/cache/cloudstash".to_string(),
            table_cache_life: "1h".to_string(),
            on_remote_error: RemoteErrorPolicy::ServeCached,
            metadata_fallback: false,
            eviction: EvictionConfig {
                max_unused_age: "14days".to_string(),
                max_size: "100GiB".to_string(),
                max_fraction_of_free: Some(0.5),
            },
            retry: RetryConfig {
                max_attempts: 3,
                initial_delay: "1s".to_string(),
                max_delay: "10s".to_string(),
                multiplier: 1.5,
                jitter: false,
            },
        }
    }

    #[test]
    fn test_configuration_defaults() {
        assert_eq!(ConfigLoader::new().load().unwrap(), default_config());
    }

    #[test]
    fn test_parses_toml_configuration() {
        let config = "
            cache_dir = '/var/cache/cloudstash'
            table_cache_life = '1h'
            on_remote_error = 'serve_cached'
            metadata_fallback = false

            [eviction]
            max_unused_age = '14days'
            max_size = '100GiB'
            max_fraction_of_free = 0.5

            [retry]
            max_attempts = 3
            initial_delay = '1s'
            max_delay = '10s'
            multiplier = 1.5
            jitter = false
        ";
        let file = File::from_str(config, FileFormat::Toml);
        let parsed_config = ConfigLoader::new().add_file_source(file).load().unwrap();
        assert_eq!(parsed_config, customized_config());
    }

    #[test]
    fn test_parses_environment_variables() {
        let env = Map::from([
            (
                "CLOUDSTASH_CACHE_DIR".to_string(),
                "/var/cache/cloudstash".to_string(),
            ),
            ("CLOUDSTASH_TABLE_CACHE_LIFE".to_string(), "1h".to_string()),
            (
                "CLOUDSTASH_ON_REMOTE_ERROR".to_string(),
                "serve_cached".to_string(),
            ),
            ("CLOUDSTASH_METADATA_FALLBACK".to_string(), "false".to_string()),
            (
                "CLOUDSTASH_EVICTION__MAX_UNUSED_AGE".to_string(),
                "14days".to_string(),
            ),
            (
                "CLOUDSTASH_EVICTION__MAX_SIZE".to_string(),
                "100GiB".to_string(),
            ),
            (
                "CLOUDSTASH_EVICTION__MAX_FRACTION_OF_FREE".to_string(),
                "0.5".to_string(),
            ),
            ("CLOUDSTASH_RETRY__MAX_ATTEMPTS".to_string(), "3".to_string()),
            ("CLOUDSTASH_RETRY__INITIAL_DELAY".to_string(), "1s".to_string()),
            ("CLOUDSTASH_RETRY__MAX_DELAY".to_string(), "10s".to_string()),
            ("CLOUDSTASH_RETRY__MULTIPLIER".to_string(), "1.5".to_string()),
            ("CLOUDSTASH_RETRY__JITTER".to_string(), "false".to_string()),
        ]);
        let parsed_config = ConfigLoader::new()
            .add_environment_source(Some(env))
            .load()
            .unwrap();
        assert_eq!(parsed_config, customized_config());
    }

    #[test]
    fn test_environment_overrides_file() {
        let file = File::from_str("table_cache_life = '1h'", FileFormat::Toml);
        let env = Map::from([("CLOUDSTASH_TABLE_CACHE_LIFE".to_string(), "2h".to_string())]);
        let parsed_config = ConfigLoader::new()
            .add_file_source(file)
            .add_environment_source(Some(env))
            .load()
            .unwrap();
        assert_eq!(parsed_config.table_cache_life, "2h");
    }

    #[test]
    fn test_validates_into_settings() {
        let settings = CacheSettings::try_from(customized_config()).unwrap();
        assert_eq!(
            settings,
            CacheSettings {
                cache_dir: PathBuf::from("/var/cache/cloudstash"),
                table_cache_life: Some(TimeDelta::hours(1)),
                eviction: LruPolicy {
                    max_unused_age: Some(TimeDelta::days(14)),
                    max_size: Some(100 * 1024 * 1024 * 1024),
                    max_fraction_of_free: Some(0.5),
                },
                on_remote_error: RemoteErrorPolicy::ServeCached,
                metadata_fallback: false,
                retry: RetryPolicy {
                    max_attempts: 3,
                    initial_delay: Duration::from_secs(1),
                    max_delay: Duration::from_secs(10),
                    multiplier: 1.5,
                    jitter: false,
                },
            }
        );
        assert_eq!(settings.table_options().cache_life, Some(TimeDelta::hours(1)));
        assert!(!settings.object_options().metadata_fallback);
    }

    #[test]
    fn test_default_settings_have_no_table_cache_life() {
        let config = CloudstashConfig {
            cache_dir: "cache".to_string(),
            ..default_config()
        };
        let settings = CacheSettings::try_from(config).unwrap();
        assert_eq!(settings.table_cache_life, None);
        assert_eq!(settings.eviction.max_size, Some(10 * 1024 * 1024 * 1024));
        assert_eq!(settings.retry, RetryPolicy::default());
    }

    #[test]
    fn test_rejects_invalid_values() {
        let invalid_duration = CloudstashConfig {
            cache_dir: "cache".to_string(),
            table_cache_life: "soon".to_string(),
            ..default_config()
        };
        assert!(matches!(
            CacheSettings::try_from(invalid_duration),
            Err(LoadConfigError::InvalidDuration {
                key: "table_cache_life",
                ..
            })
        ));

        let mut invalid_size = default_config();
        invalid_size.cache_dir = "cache".to_string();
        invalid_size.eviction.max_size = "lots".to_string();
        assert!(matches!(
            CacheSettings::try_from(invalid_size),
            Err(LoadConfigError::InvalidSize { .. })
        ));

        let mut invalid_fraction = default_config();
        invalid_fraction.cache_dir = "cache".to_string();
        invalid_fraction.eviction.max_fraction_of_free = Some(1.5);
        assert!(matches!(
            CacheSettings::try_from(invalid_fraction.clone()),
            Err(LoadConfigError::OutOfRange { .. })
        ));
        invalid_fraction.eviction.max_fraction_of_free = Some(f64::NAN);
        assert!(matches!(
            CacheSettings::try_from(invalid_fraction),
            Err(LoadConfigError::OutOfRange { .. })
        ));
    }

    #[test]
    #[serial]
    fn test_reads_config_file_from_environment() {
        let mut config_file = NamedTempFile::with_suffix(".toml").unwrap();
        config_file
            .write_all(b"cache_dir = '/tmp/cloudstash-test'\n")
            .unwrap();
        // SAFETY: serialized with all other tests touching the process environment
        unsafe { std::env::set_var(CONFIG_FILE_ENV_VAR, config_file.path()) };
        let config = ConfigLoader::new().add_default_sources().load();
        // SAFETY: see above
        unsafe { std::env::remove_var(CONFIG_FILE_ENV_VAR) };
        assert_eq!(config.unwrap().cache_dir, "/tmp/cloudstash-test");
    }
}
