//! Relational storage over sqlx's `Any` driver, so the same statements serve
//! both the local SQLite file and a networked MySQL server.
//!
//! Columns are restricted to text and BIGINT because those are the only types
//! both drivers decode identically through `Any`: `created_at` holds epoch
//! milliseconds and `active` holds 0 or 1.

use std::{str::FromStr, time::Duration};

use async_trait::async_trait;
use reqwest::Url;
use sqlx::{any::{install_default_drivers, AnyPoolOptions}, AnyPool, FromRow};

use super::{DatabaseError, DatabaseResult, PunishmentBackend, sort_by_creation};
use super::models::punishment::{Punishment, PunishmentType};
use crate::util::time::from_millis;

const ACQUIRE_TIMEOUT_SECONDS: u64 = 5;
// stays under SQLite's historical limit of 999 host parameters
const MAX_BIND_PARAMETERS: usize = 500;

const CREATE_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS punishments (
        id VARCHAR(36) PRIMARY KEY,
        target_id VARCHAR(64) NOT NULL,
        type VARCHAR(20) NOT NULL,
        reason TEXT NOT NULL,
        issuer_id VARCHAR(64),
        created_at BIGINT NOT NULL,
        duration BIGINT,
        active BIGINT NOT NULL DEFAULT 1,
        ip VARCHAR(64)
    )
"#;

const SELECT_COLUMNS: &str =
    "SELECT id, target_id, type, reason, issuer_id, created_at, duration, active, ip FROM punishments";

#[derive(Debug, FromRow)]
struct PunishmentRow {
    id: String,
    target_id: String,
    #[sqlx(rename = "type")]
    kind: String,
    reason: String,
    issuer_id: Option<String>,
    created_at: i64,
    duration: Option<i64>,
    active: i64,
    ip: Option<String>
}

impl TryFrom<PunishmentRow> for Punishment {
    type Error = DatabaseError;

    fn try_from(row: PunishmentRow) -> Result<Self, Self::Error> {
        let kind = PunishmentType::from_str(&row.kind).map_err(|_| DatabaseError::Corrupt {
            id: row.id.clone(),
            problem: format!("unknown type '{}'", row.kind)
        })?;
        let created_at = from_millis(row.created_at).ok_or_else(|| DatabaseError::Corrupt {
            id: row.id.clone(),
            problem: format!("invalid created_at {}", row.created_at)
        })?;
        Ok(Punishment::restore(
            row.id,
            row.target_id,
            kind,
            row.reason,
            row.issuer_id,
            created_at,
            row.duration,
            row.ip,
            row.active != 0
        ))
    }
}

/// Rows that fail to decode are logged and skipped rather than failing the
/// whole load.
fn decode_rows(rows: Vec<PunishmentRow>) -> Vec<Punishment> {
    rows.into_iter().filter_map(|row| match Punishment::try_from(row) {
        Ok(punishment) => Some(punishment),
        Err(e) => {
            error!("Skipping stored punishment: {}", e);
            None
        }
    }).collect()
}

fn query_error(e: sqlx::Error) -> DatabaseError {
    DatabaseError::Query(e.to_string())
}

pub struct SqlBackend {
    pool: AnyPool,
    name: &'static str
}

impl SqlBackend {
    pub async fn connect_sqlite(path: &str, max_connections: u32) -> DatabaseResult<Self> {
        let url = format!("sqlite://{}?mode=rwc", path);
        Self::connect(&url, max_connections, "SQLite").await
    }

    pub async fn connect_mysql(
        host: &str,
        port: u16,
        database: &str,
        username: &str,
        password: &str,
        max_connections: u32
    ) -> DatabaseResult<Self> {
        let url = mysql_url(host, port, database, username, password)?;
        Self::connect(url.as_str(), max_connections, "MySQL").await
    }

    async fn connect(url: &str, max_connections: u32, name: &'static str) -> DatabaseResult<Self> {
        install_default_drivers();
        let pool = AnyPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(ACQUIRE_TIMEOUT_SECONDS))
            .connect(url)
            .await
            .map_err(|e| DatabaseError::Connection(format!("{}: {}", name, e)))?;
        let backend = Self { pool, name };
        backend.init_schema().await?;
        Ok(backend)
    }

    async fn init_schema(&self) -> DatabaseResult<()> {
        sqlx::query(CREATE_TABLE)
            .execute(&self.pool)
            .await
            .map_err(|e| DatabaseError::Schema(e.to_string()))?;
        Ok(())
    }
}

fn mysql_url(host: &str, port: u16, database: &str, username: &str, password: &str) -> DatabaseResult<Url> {
    let invalid = |field: &str| DatabaseError::Connection(format!("invalid MySQL {}", field));
    let mut url = Url::parse("mysql://localhost").map_err(|_| invalid("url"))?;
    url.set_host(Some(host)).map_err(|_| invalid("host"))?;
    url.set_port(Some(port)).map_err(|_| invalid("port"))?;
    url.set_username(username).map_err(|_| invalid("username"))?;
    if !password.is_empty() {
        url.set_password(Some(password)).map_err(|_| invalid("password"))?;
    }
    url.set_path(database);
    Ok(url)
}

#[async_trait]
impl PunishmentBackend for SqlBackend {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn save(&self, punishment: &Punishment) -> DatabaseResult<()> {
        sqlx::query(
            "INSERT INTO punishments (id, target_id, type, reason, issuer_id, created_at, duration, active, ip) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"
        )
            .bind(punishment.id.clone())
            .bind(punishment.target_id.clone())
            .bind(punishment.kind.to_string())
            .bind(punishment.reason.clone())
            .bind(punishment.issuer_id.clone())
            .bind(punishment.created_at.timestamp_millis())
            .bind(punishment.duration)
            .bind(i64::from(punishment.is_active()))
            .bind(punishment.banned_ip.clone())
            .execute(&self.pool)
            .await
            .map_err(query_error)?;
        Ok(())
    }

    async fn update(&self, punishment: &Punishment) -> DatabaseResult<()> {
        // active * ? never turns a lifted row back on
        sqlx::query("UPDATE punishments SET active = active * ?, ip = ? WHERE id = ?")
            .bind(i64::from(punishment.is_active()))
            .bind(punishment.banned_ip.clone())
            .bind(punishment.id.clone())
            .execute(&self.pool)
            .await
            .map_err(query_error)?;
        Ok(())
    }

    async fn load_all_active(&self) -> DatabaseResult<Vec<Punishment>> {
        let rows = sqlx::query_as::<_, PunishmentRow>(&format!("{} WHERE active = 1", SELECT_COLUMNS))
            .fetch_all(&self.pool)
            .await
            .map_err(query_error)?;
        let mut punishments = decode_rows(rows);
        sort_by_creation(&mut punishments);
        Ok(punishments)
    }

    async fn load_for_target(&self, target_id: &str) -> DatabaseResult<Vec<Punishment>> {
        let rows = sqlx::query_as::<_, PunishmentRow>(&format!("{} WHERE target_id = ?", SELECT_COLUMNS))
            .bind(target_id.to_owned())
            .fetch_all(&self.pool)
            .await
            .map_err(query_error)?;
        let mut punishments = decode_rows(rows);
        sort_by_creation(&mut punishments);
        Ok(punishments)
    }

    async fn load_for_targets(&self, target_ids: &[String]) -> DatabaseResult<Vec<Punishment>> {
        let mut punishments = Vec::new();
        for chunk in target_ids.chunks(MAX_BIND_PARAMETERS) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let sql = format!("{} WHERE target_id IN ({})", SELECT_COLUMNS, placeholders);
            let query = chunk.iter().fold(sqlx::query_as::<_, PunishmentRow>(&sql), |query, target_id| {
                query.bind(target_id.clone())
            });
            let rows = query.fetch_all(&self.pool).await.map_err(query_error)?;
            punishments.extend(decode_rows(rows));
        }
        sort_by_creation(&mut punishments);
        Ok(punishments)
    }

    async fn load_for_ip(&self, ip: &str) -> DatabaseResult<Vec<Punishment>> {
        let rows = sqlx::query_as::<_, PunishmentRow>(
            &format!("{} WHERE ip = ? AND active = 1 ORDER BY created_at ASC, id ASC", SELECT_COLUMNS)
        )
            .bind(ip.to_owned())
            .fetch_all(&self.pool)
            .await
            .map_err(query_error)?;
        Ok(decode_rows(rows))
    }

    async fn close(&self) {
        self.pool.close().await;
        info!("Closed {} punishment storage.", self.name);
    }
}
