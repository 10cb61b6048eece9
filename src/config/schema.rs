use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File, FileFormat};
use hex::encode;
use serde::{de, Deserialize, Deserializer};
use sha2::{Digest, Sha256};
use sqlx::sqlite::SqliteJournalMode;

pub const DEFAULT_CONFIG_PATH: &str = "flowcore.toml";
pub const ENV_PREFIX: &str = "FLOWCORE";

#[derive(Deserialize, Debug, PartialEq, Eq, Clone, Default)]
pub struct FlowcoreConfig {
    #[serde(default)]
    pub catalog: Catalog,
    #[serde(default)]
    pub frontend: Frontend,
    #[serde(default)]
    pub runtime: Runtime,
}

#[derive(Deserialize, Debug, PartialEq, Eq, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Catalog {
    #[cfg(feature = "catalog-postgres")]
    Postgres(Postgres),
    Sqlite(Sqlite),
}

impl Default for Catalog {
    fn default() -> Self {
        Catalog::Sqlite(Sqlite {
            dsn: "sqlite://flowcore.sqlite".to_string(),
            journal_mode: SqliteJournalMode::Wal,
        })
    }
}

#[derive(Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct Postgres {
    pub dsn: String,
    #[serde(default = "default_schema")]
    pub schema: String,
}

#[derive(Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct Sqlite {
    pub dsn: String,
    #[serde(
        default = "default_journal_mode",
        deserialize_with = "deserialize_journal_mode"
    )]
    pub journal_mode: SqliteJournalMode,
}

fn default_schema() -> String {
    "public".to_string()
}

fn default_journal_mode() -> SqliteJournalMode {
    SqliteJournalMode::Wal
}

fn deserialize_journal_mode<'de, D>(deserializer: D) -> Result<SqliteJournalMode, D::Error>
where
    D: Deserializer<'de>,
{
    let value = String::deserialize(deserializer)?;
    SqliteJournalMode::from_str(&value)
        .map_err(|_| de::Error::custom(format!("unknown journal mode {value:?}")))
}

#[derive(Deserialize, Debug, PartialEq, Eq, Default, Clone)]
pub struct Frontend {
    #[serde(default)]
    pub http: HttpFrontend,
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub enum AccessSettings {
    Any,
    Off,
    Password { sha256_hash: String },
}

pub fn str_to_hex_hash(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    encode(hasher.finalize())
}

fn deserialize_access_settings<'de, D>(deserializer: D) -> Result<AccessSettings, D::Error>
where
    D: Deserializer<'de>,
{
    let value = String::deserialize(deserializer)?;
    Ok(match value.as_str() {
        "any" => AccessSettings::Any,
        "off" => AccessSettings::Off,
        hash => AccessSettings::Password {
            sha256_hash: hash.to_lowercase(),
        },
    })
}

#[derive(Deserialize, Debug, PartialEq, Eq, Clone)]
#[serde(default)]
pub struct HttpFrontend {
    pub bind_host: String,
    pub bind_port: u16,
    #[serde(deserialize_with = "deserialize_access_settings")]
    pub admin_access: AccessSettings,
    pub cors_allowed_origins: Vec<String>,
}

impl Default for HttpFrontend {
    fn default() -> Self {
        Self {
            bind_host: "127.0.0.1".to_string(),
            bind_port: 8080,
            admin_access: AccessSettings::Any,
            cors_allowed_origins: vec!["*".to_string()],
        }
    }
}

#[derive(Deserialize, Debug, PartialEq, Eq, Clone)]
#[serde(default)]
pub struct Runtime {
    /// Deadline for executing one endpoint flow
    pub request_timeout_ms: u64,
    /// Deadline for each physical DDL statement
    pub ddl_timeout_ms: u64,
}

impl Default for Runtime {
    fn default() -> Self {
        Self {
            request_timeout_ms: 30_000,
            ddl_timeout_ms: 10_000,
        }
    }
}

impl Runtime {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn ddl_timeout(&self) -> Duration {
        Duration::from_millis(self.ddl_timeout_ms)
    }
}

pub fn validate_config(config: FlowcoreConfig) -> Result<FlowcoreConfig, ConfigError> {
    if config.runtime.request_timeout_ms == 0 || config.runtime.ddl_timeout_ms == 0 {
        return Err(ConfigError::Message(
            "runtime.request_timeout_ms and runtime.ddl_timeout_ms must be greater than 0"
                .to_string(),
        ));
    }

    if let AccessSettings::Password { sha256_hash } = &config.frontend.http.admin_access {
        if sha256_hash.len() != 64 || !sha256_hash.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ConfigError::Message(
                "frontend.http.admin_access must be \"any\", \"off\" or the SHA-256 hash \
                of the admin token (64 hex characters)"
                    .to_string(),
            ));
        }
    }

    if let Some(origin) = config
        .frontend
        .http
        .cors_allowed_origins
        .iter()
        .find(|o| *o != "*" && !o.starts_with("http://") && !o.starts_with("https://"))
    {
        return Err(ConfigError::Message(format!(
            "frontend.http.cors_allowed_origins: {origin:?} is not \"*\" or an http(s) origin"
        )));
    }

    if let Catalog::Sqlite(Sqlite { dsn, .. }) = &config.catalog {
        if dsn.is_empty() {
            return Err(ConfigError::Message("catalog.dsn must not be empty".to_string()));
        }
    }

    Ok(config)
}

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .separator("__")
        .list_separator(",")
        .with_list_parse_key("frontend.http.cors_allowed_origins")
        .try_parsing(true)
}

/// Load the configuration file (if it exists) and overlay `FLOWCORE__*`
/// environment variables on top of it
pub fn load_config(path: &Path) -> Result<FlowcoreConfig, ConfigError> {
    let path = path
        .to_str()
        .ok_or_else(|| ConfigError::Message(format!("Invalid config path {path:?}")))?;

    Config::builder()
        .add_source(File::with_name(path).required(false))
        .add_source(environment())
        .build()?
        .try_deserialize()
        .and_then(validate_config)
}

// Load a config from a string (to test our structs are defined correctly)
pub fn load_config_from_string(
    config_str: &str,
    skip_validation: bool,
) -> Result<FlowcoreConfig, ConfigError> {
    let config = Config::builder().add_source(File::from_str(config_str, FileFormat::Toml));

    if skip_validation {
        config.build()?.try_deserialize()
    } else {
        config.build()?.try_deserialize().and_then(validate_config)
    }
}
