//! Typed configuration, assembled by layering compiled-in defaults, an
//! optional TOML file, and environment variables, in that increasing
//! order of priority, into the single record the core consumes.

use crate::error::MonicoError;
use serde::Deserialize;
use std::collections::HashMap;

/// Locations searched, in order, for a config file. A later location
/// overrides keys set by an earlier one; all are optional.
pub const CONFIG_FILE_LOCATIONS: &[&str] = &[
    "/etc/monico/.monico.toml",
    "~/.monico.toml",
    "./.monico.toml",
];

/// Log filter level, consumed by the adapter's tracing subscriber setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    /// The `tracing`/`EnvFilter` directive string for this level.
    pub fn as_filter_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            LogLevel::Error => "error",
            LogLevel::Critical => "error",
        }
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Info
    }
}

impl std::str::FromStr for LogLevel {
    type Err = MonicoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "DEBUG" => Ok(LogLevel::Debug),
            "INFO" => Ok(LogLevel::Info),
            "WARNING" => Ok(LogLevel::Warning),
            "ERROR" => Ok(LogLevel::Error),
            "CRITICAL" => Ok(LogLevel::Critical),
            other => Err(MonicoError::ConfigurationError(format!(
                "invalid log level \"{other}\", expected one of DEBUG, INFO, WARNING, ERROR, CRITICAL"
            ))),
        }
    }
}

/// The typed configuration record passed from the adapter layer to the
/// core. At most one of `postgres_uri` / `sqlite_uri` is ever `Some` by
/// the time this is resolved via [`Config::resolve_backend`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    pub postgres_uri: Option<String>,
    pub sqlite_uri: Option<String>,
    #[serde(default)]
    pub log_level: LogLevel,
}

/// Which storage backend a [`Config`] resolves to, and the URI to reach it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendChoice {
    Postgres(String),
    Sqlite(String),
}

/// Default location of the embedded SQLite database when no backend is configured.
pub const DEFAULT_SQLITE_PATH_SUFFIX: &str = ".monic/monico.db";

impl Config {
    /// Resolves the configured storage backend, applying the "at most one
    /// of POSTGRES_URI / SQLITE_URI" rule and falling back to the default
    /// embedded database when neither is set.
    pub fn resolve_backend(&self) -> Result<BackendChoice, MonicoError> {
        match (&self.postgres_uri, &self.sqlite_uri) {
            (Some(_), Some(_)) => Err(MonicoError::ConfigurationError(
                "POSTGRES_URI and SQLITE_URI are mutually exclusive; set at most one".into(),
            )),
            (Some(uri), None) => Ok(BackendChoice::Postgres(uri.clone())),
            (None, Some(uri)) => Ok(BackendChoice::Sqlite(uri.clone())),
            (None, None) => {
                let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
                let path = format!("{home}/{DEFAULT_SQLITE_PATH_SUFFIX}");
                Ok(BackendChoice::Sqlite(format!("sqlite://{path}")))
            }
        }
    }
}

/// Loads a [`Config`] by layering defaults, an optional TOML file (first
/// match among [`CONFIG_FILE_LOCATIONS`] wins each key, later locations
/// override earlier ones), then environment variables.
pub struct ConfigLoader;

impl ConfigLoader {
    pub fn load(&self) -> Result<Config, MonicoError> {
        let mut config = Config::default();
        self.load_from_files(&mut config)?;
        self.load_from_env(&mut config, &std::env::vars().collect())?;
        Ok(config)
    }

    fn load_from_files(&self, config: &mut Config) -> Result<(), MonicoError> {
        for location in CONFIG_FILE_LOCATIONS {
            let path = shellexpand_home(location);
            let Ok(contents) = std::fs::read_to_string(&path) else {
                continue;
            };
            let file_config: FileConfig = toml::from_str(&contents).map_err(|e| {
                MonicoError::ConfigurationError(format!(
                    "failed to parse config file {path}: {e}"
                ))
            })?;
            if let Some(v) = file_config.postgres_uri {
                config.postgres_uri = Some(v);
            }
            if let Some(v) = file_config.sqlite_uri {
                config.sqlite_uri = Some(v);
            }
            if let Some(v) = file_config.log_level {
                config.log_level = v.parse()?;
            }
        }
        Ok(())
    }

    fn load_from_env(
        &self,
        config: &mut Config,
        environment: &HashMap<String, String>,
    ) -> Result<(), MonicoError> {
        if let Some(v) = environment.get("POSTGRES_URI") {
            config.postgres_uri = Some(v.clone());
        }
        if let Some(v) = environment.get("SQLITE_URI") {
            config.sqlite_uri = Some(v.clone());
        }
        if let Some(v) = environment.get("LOG_LEVEL") {
            config.log_level = v.parse()?;
        }
        Ok(())
    }
}

/// Mirrors [`Config`]'s optional fields, but `log_level` stays a raw string
/// until parsed. TOML files are user-edited text, so a typo should surface
/// as a `ConfigurationError`, not a deserialization panic.
#[derive(Debug, Deserialize, Default)]
struct FileConfig {
    postgres_uri: Option<String>,
    sqlite_uri: Option<String>,
    log_level: Option<String>,
}

fn shellexpand_home(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
        format!("{home}/{rest}")
    } else {
        path.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_embedded_backend_when_unset() {
        let config = Config::default();
        let backend = config.resolve_backend().unwrap();
        assert!(matches!(backend, BackendChoice::Sqlite(_)));
    }

    #[test]
    fn rejects_both_backends_set() {
        let config = Config {
            postgres_uri: Some("postgres://x".into()),
            sqlite_uri: Some("sqlite://x".into()),
            log_level: LogLevel::Info,
        };
        assert!(config.resolve_backend().is_err());
    }

    #[test]
    fn env_overrides_take_precedence() {
        let mut config = Config::default();
        let mut env = HashMap::new();
        env.insert("POSTGRES_URI".to_string(), "postgres://env".to_string());
        env.insert("LOG_LEVEL".to_string(), "DEBUG".to_string());
        ConfigLoader.load_from_env(&mut config, &env).unwrap();
        assert_eq!(config.postgres_uri.as_deref(), Some("postgres://env"));
        assert_eq!(config.log_level, LogLevel::Debug);
    }
}
