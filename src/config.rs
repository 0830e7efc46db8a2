//! Layered configuration: TOML file, then environment overlay under the
//! `PY_LOAD_EUDRAVIGILANCE_` prefix (`__` as the nested separator), then
//! explicit CLI flags, which win.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::errors::ConfigError;
use crate::model::{LoadMode, SchemaType};

const ENV_PREFIX: &str = "PY_LOAD_EUDRAVIGILANCE_";

#[derive(Debug, Clone, Deserialize, Default)]
pub struct DatabaseConfig {
    pub dsn: Option<String>,
    #[serde(default)]
    pub dialect: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    pub database: DatabaseConfig,
    pub source_uri: Option<String>,
    pub quarantine_uri: Option<String>,
    pub schema_type: Option<String>,
    pub mode: Option<String>,
    pub workers: Option<usize>,
    pub xsd_path: Option<PathBuf>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_dsn: String,
    pub database_dialect: String,
    pub source_uri: String,
    pub quarantine_uri: Option<String>,
    pub schema_type: SchemaType,
    pub mode: LoadMode,
    pub workers: usize,
    pub xsd_path: Option<PathBuf>,
    pub timeout_secs: u64,
}

/// Fields a CLI invocation may override. `None` means "not set on the
/// command line, fall through to env/file/defaults".
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub source_uri: Option<String>,
    pub mode: Option<LoadMode>,
    pub workers: Option<usize>,
    pub schema_type: Option<SchemaType>,
}

impl Config {
    pub fn load(toml_path: Option<&Path>, overrides: CliOverrides) -> Result<Config, ConfigError> {
        let mut file_config = match toml_path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound(path.to_path_buf()))?;
                toml::from_str(&text)?
            }
            None => FileConfig::default(),
        };

        apply_env(&mut file_config);

        let database_dsn = file_config
            .database
            .dsn
            .clone()
            .ok_or_else(|| ConfigError::Invalid("database.dsn is required".to_string()))?;

        let source_uri = overrides
            .source_uri
            .or(file_config.source_uri)
            .ok_or_else(|| ConfigError::Invalid("source_uri is required".to_string()))?;

        let quarantine_uri = file_config.quarantine_uri;

        let schema_type = overrides
            .schema_type
            .or_else(|| file_config.schema_type.as_deref().and_then(parse_schema_type))
            .unwrap_or(SchemaType::Normalized);

        let mode = overrides
            .mode
            .or_else(|| file_config.mode.as_deref().and_then(parse_load_mode))
            .unwrap_or(LoadMode::Delta);

        let workers = overrides
            .workers
            .or(file_config.workers)
            .unwrap_or_else(|| std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1));

        Ok(Config {
            database_dsn,
            database_dialect: file_config.database.dialect.unwrap_or_else(|| "postgres".to_string()),
            source_uri,
            quarantine_uri,
            schema_type,
            mode,
            workers,
            xsd_path: file_config.xsd_path,
            timeout_secs: file_config.timeout_secs.unwrap_or(300),
        })
    }
}

fn parse_schema_type(value: &str) -> Option<SchemaType> {
    match value {
        "normalized" => Some(SchemaType::Normalized),
        "audit" => Some(SchemaType::Audit),
        _ => None,
    }
}

fn parse_load_mode(value: &str) -> Option<LoadMode> {
    match value {
        "full" => Some(LoadMode::Full),
        "delta" => Some(LoadMode::Delta),
        _ => None,
    }
}

/// Overlays `PY_LOAD_EUDRAVIGILANCE_*` environment variables onto the
/// TOML-sourced config, `__` splitting into nested field names.
fn apply_env(config: &mut FileConfig) {
    for (key, value) in std::env::vars() {
        let Some(rest) = key.strip_prefix(ENV_PREFIX) else { continue };
        let path: Vec<String> = rest.split("__").map(|s| s.to_lowercase()).collect();

        match path.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
            ["database", "dsn"] => config.database.dsn = Some(value),
            ["database", "dialect"] => config.database.dialect = Some(value),
            ["source_uri"] => config.source_uri = Some(value),
            ["quarantine_uri"] => config.quarantine_uri = Some(value),
            ["schema_type"] => config.schema_type = Some(value),
            ["mode"] => config.mode = Some(value),
            ["workers"] => config.workers = value.parse().ok(),
            ["xsd_path"] => config.xsd_path = Some(PathBuf::from(value)),
            ["timeout_secs"] => config.timeout_secs = value.parse().ok(),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    // `apply_env` reads the whole process environment, so tests that set
    // PY_LOAD_EUDRAVIGILANCE_* vars must not run concurrently with each other.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn rejects_missing_source_uri() {
        let _guard = ENV_LOCK.lock().unwrap();
        let err = Config::load(None, CliOverrides::default()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn cli_override_wins_over_everything_else() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var(format!("{ENV_PREFIX}DATABASE__DSN"), "postgres://test");
        std::env::set_var(format!("{ENV_PREFIX}QUARANTINE_URI"), "/tmp/quarantine");
        std::env::set_var(format!("{ENV_PREFIX}SOURCE_URI"), "env-uri");
        let overrides = CliOverrides {
            source_uri: Some("cli-uri".to_string()),
            ..Default::default()
        };
        let config = Config::load(None, overrides).unwrap();
        assert_eq!(config.source_uri, "cli-uri");
        std::env::remove_var(format!("{ENV_PREFIX}SOURCE_URI"));
        std::env::remove_var(format!("{ENV_PREFIX}DATABASE__DSN"));
        std::env::remove_var(format!("{ENV_PREFIX}QUARANTINE_URI"));
    }

    #[test]
    fn defaults_to_delta_mode_and_normalized_schema() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var(format!("{ENV_PREFIX}DATABASE__DSN"), "postgres://test");
        let overrides = CliOverrides {
            source_uri: Some("local:///tmp/batch.xml".to_string()),
            ..Default::default()
        };
        std::env::set_var(format!("{ENV_PREFIX}QUARANTINE_URI"), "/tmp/quarantine");
        let config = Config::load(None, overrides).unwrap();
        assert_eq!(config.mode, LoadMode::Delta);
        assert_eq!(config.schema_type, SchemaType::Normalized);
        std::env::remove_var(format!("{ENV_PREFIX}DATABASE__DSN"));
        std::env::remove_var(format!("{ENV_PREFIX}QUARANTINE_URI"));
    }
}
