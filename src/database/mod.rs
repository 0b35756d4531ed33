use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::{BackendKind, DatabaseOptions, ConfigMissingFieldError};

use self::models::punishment::Punishment;

pub mod models;
pub mod cache;
pub mod memory;
pub mod mongo;
pub mod sql;

pub type DatabaseResult<T> = Result<T, DatabaseError>;

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("could not connect to the database: {0}")]
    Connection(String),

    #[error("could not establish the punishment schema: {0}")]
    Schema(String),

    #[error("query failed: {0}")]
    Query(String),

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("stored punishment {id} is corrupt: {problem}")]
    Corrupt { id: String, problem: String }
}

/// Storage for punishment records. Every implementation applies the same
/// filters (`active = true`, `ip = ?`) whatever its encoding, and must be
/// safe to call from many tasks at once.
#[async_trait]
pub trait PunishmentBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Inserts a new record.
    async fn save(&self, punishment: &Punishment) -> DatabaseResult<()>;

    /// Persists the mutable fields only (`active`, `ip`).
    async fn update(&self, punishment: &Punishment) -> DatabaseResult<()>;

    async fn load_all_active(&self) -> DatabaseResult<Vec<Punishment>>;

    /// Full history for one target, active or not.
    async fn load_for_target(&self, target_id: &str) -> DatabaseResult<Vec<Punishment>>;

    /// Full history for several targets in one round trip.
    async fn load_for_targets(&self, target_ids: &[String]) -> DatabaseResult<Vec<Punishment>>;

    /// Every active record banning `ip`, earliest first. Expired records are
    /// included; callers decide which one is enforced.
    async fn load_for_ip(&self, ip: &str) -> DatabaseResult<Vec<Punishment>>;

    /// Releases the underlying connections.
    async fn close(&self);
}

/// Opens the configured backend and materializes its schema. Any failure
/// here is fatal for the caller.
pub async fn connect(options: &DatabaseOptions) -> anyhow::Result<Arc<dyn PunishmentBackend>> {
    let backend: Arc<dyn PunishmentBackend> = match options.kind {
        BackendKind::Sqlite => {
            Arc::new(sql::SqlBackend::connect_sqlite(&options.sqlite_path, options.pool_size).await?)
        },
        BackendKind::MySql => {
            let host = required(&options.mysql_host, "database.mysql.host")?;
            let database = required(&options.mysql_database, "database.mysql.database")?;
            Arc::new(sql::SqlBackend::connect_mysql(
                host,
                options.mysql_port,
                database,
                &options.mysql_username,
                &options.mysql_password,
                options.pool_size
            ).await?)
        },
        BackendKind::MongoDb => {
            let uri = required(&options.mongo_uri, "database.mongodb.uri")?;
            Arc::new(mongo::MongoBackend::connect(uri, &options.mongo_database, options.pool_size).await?)
        }
    };
    info!("Connected to {} punishment storage successfully.", backend.name());
    Ok(backend)
}

fn required<'a>(value: &'a Option<String>, field_name: &str) -> Result<&'a str, ConfigMissingFieldError> {
    match value {
        Some(value) if !value.is_empty() => Ok(value.as_str()),
        _ => Err(ConfigMissingFieldError { field_name: field_name.to_owned() })
    }
}

/// Earliest first, ties broken by id so ordering is stable across backends.
pub fn sort_by_creation(punishments: &mut [Punishment]) {
    punishments.sort_by(|p1, p2| {
        p1.created_at.cmp(&p2.created_at).then_with(|| p1.id.cmp(&p2.id))
    });
}
