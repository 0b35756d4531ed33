use std::{collections::HashMap, env, str::FromStr, time::Duration};

use strum_macros::{Display, EnumString};

use super::util::file::deserialize_properties_file;

#[derive(Debug)]
pub enum ConfigDeserializeError {
    IOError(std::io::Error),
    InvalidValue(ConfigInvalidValueError)
}

#[derive(Debug)]
pub struct ConfigInvalidValueError {
    pub key: String,
    pub value: String
}

#[derive(Debug)]
pub struct ConfigMissingFieldError {
    pub field_name: String
}

impl std::fmt::Display for ConfigMissingFieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Missing required field '{}'", self.field_name)
    }
}
impl std::error::Error for ConfigMissingFieldError {}

impl std::fmt::Display for ConfigInvalidValueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Invalid value '{}' for '{}'", self.value, self.key)
    }
}

impl std::fmt::Display for ConfigDeserializeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let message = match self {
            Self::IOError(io_err) => io_err.to_string(),
            Self::InvalidValue(value_err) => value_err.to_string()
        };
        write!(f, "{}", message)
    }
}

impl std::error::Error for ConfigDeserializeError {
}

impl From<std::io::Error> for ConfigDeserializeError {
    fn from(e: std::io::Error) -> Self {
        ConfigDeserializeError::IOError(e)
    }
}

impl From<ConfigInvalidValueError> for ConfigDeserializeError {
    fn from(e: ConfigInvalidValueError) -> Self {
        ConfigDeserializeError::InvalidValue(e)
    }
}

const CONFIG_PATH_ENV_VARIABLE: &str = "PUNISH_CONFIG_PATH";
const MYSQL_PASSWORD_ENV_VARIABLE: &str = "PUNISH_MYSQL_PASSWORD";
const MONGO_URI_ENV_VARIABLE: &str = "PUNISH_MONGO_URI";

pub async fn deserialize_punish_config() -> Result<PunishConfig, ConfigDeserializeError> {
    let config_path = env::var(CONFIG_PATH_ENV_VARIABLE).unwrap_or("./config.properties".to_string());
    let map = deserialize_properties_file(&config_path).await?;
    let mut options = options_from_properties(&map)?;
    if let Ok(password) = env::var(MYSQL_PASSWORD_ENV_VARIABLE) {
        options.database.mysql_password = password;
    }
    if let Ok(uri) = env::var(MONGO_URI_ENV_VARIABLE) {
        options.database.mongo_uri = Some(uri);
    }
    Ok(PunishConfig { options })
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigInvalidValueError> {
    value.parse::<T>().map_err(|_| ConfigInvalidValueError { key: key.to_owned(), value: value.to_owned() })
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() { None } else { Some(value.to_owned()) }
}

pub fn options_from_properties(map: &HashMap<String, String>) -> Result<PunishConfigOptions, ConfigInvalidValueError> {
    let mut config = PunishConfigOptions::default();
    for (k, v) in map.iter() {
        let key = k.as_str();
        match key {
            "database.type" => { config.database.kind = parse_value(key, v)?; },
            "database.pool-size" => { config.database.pool_size = parse_value(key, v)?; },
            "database.sqlite.path" => { config.database.sqlite_path = v.to_string(); },
            "database.mysql.host" => { config.database.mysql_host = non_empty(v); },
            "database.mysql.port" => { config.database.mysql_port = parse_value(key, v)?; },
            "database.mysql.database" => { config.database.mysql_database = non_empty(v); },
            "database.mysql.username" => { config.database.mysql_username = v.to_string(); },
            "database.mysql.password" => { config.database.mysql_password = v.to_string(); },
            "database.mongodb.uri" => { config.database.mongo_uri = non_empty(v); },
            "database.mongodb.database" => { config.database.mongo_database = v.to_string(); },
            "cleanup.interval-seconds" => { config.cleanup.interval_seconds = parse_value(key, v)?; },
            "cleanup.initial-delay-seconds" => { config.cleanup.initial_delay_seconds = parse_value(key, v)?; },
            "cleanup.scope" => { config.cleanup.scope = parse_value(key, v)?; },
            "enable-ip-hashing" => { config.enable_ip_hashing = parse_value(key, v)?; },
            "webhooks.punishments" => { config.punishments_webhook_url = non_empty(v); },
            "log-file" => { config.log_file = non_empty(v); },
            _ => { warn!("Ignoring unknown config key '{}'", key); }
        }
    }
    Ok(config)
}

pub struct PunishConfig {
    pub options: PunishConfigOptions
}

pub struct PunishConfigOptions {
    pub database: DatabaseOptions,
    pub cleanup: CleanupOptions,
    pub enable_ip_hashing: bool,
    pub punishments_webhook_url: Option<String>,
    pub log_file: Option<String>
}

impl Default for PunishConfigOptions {
    fn default() -> Self {
        PunishConfigOptions {
            database: DatabaseOptions::default(),
            cleanup: CleanupOptions::default(),
            enable_ip_hashing: false,
            punishments_webhook_url: None,
            log_file: None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(ascii_case_insensitive)]
pub enum BackendKind {
    #[strum(serialize = "SQLITE")]
    Sqlite,
    #[strum(serialize = "MYSQL")]
    MySql,
    #[strum(serialize = "MONGODB")]
    MongoDb
}

/// Connection parameters for every backend; only the ones matching `kind`
/// are read.
#[derive(Debug, Clone)]
pub struct DatabaseOptions {
    pub kind: BackendKind,
    pub pool_size: u32,
    pub sqlite_path: String,
    pub mysql_host: Option<String>,
    pub mysql_port: u16,
    pub mysql_database: Option<String>,
    pub mysql_username: String,
    pub mysql_password: String,
    pub mongo_uri: Option<String>,
    pub mongo_database: String
}

impl Default for DatabaseOptions {
    fn default() -> Self {
        DatabaseOptions {
            kind: BackendKind::Sqlite,
            pool_size: 4,
            sqlite_path: String::from("./database.db"),
            mysql_host: None,
            mysql_port: 3306,
            mysql_database: None,
            mysql_username: String::from("root"),
            mysql_password: String::new(),
            mongo_uri: None,
            mongo_database: String::from("punishments")
        }
    }
}

/// Which punishments the periodic sweep inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum SweepScope {
    /// Only punishments currently held in the cache.
    Cache,
    /// The cache plus every active record in storage.
    Store
}

#[derive(Debug, Clone)]
pub struct CleanupOptions {
    pub interval_seconds: u64,
    pub initial_delay_seconds: u64,
    pub scope: SweepScope
}

impl CleanupOptions {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds.max(1))
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_secs(self.initial_delay_seconds)
    }
}

impl Default for CleanupOptions {
    fn default() -> Self {
        CleanupOptions { interval_seconds: 1_800, initial_delay_seconds: 60, scope: SweepScope::Store }
    }
}
