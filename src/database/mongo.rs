use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use mongodb::{
    bson::{doc, Bson, serde_helpers::chrono_datetime_as_bson_datetime},
    options::{ClientOptions, FindOptions},
    Client, Collection, Cursor, IndexModel
};
use serde::{Serialize, Deserialize};

use super::{DatabaseError, DatabaseResult, PunishmentBackend};
use super::models::punishment::{Punishment, PunishmentType};

const COLLECTION_NAME: &str = "punishments";
const MIN_POOL_SIZE: u32 = 1;

/// Stored shape of a punishment. Field names follow the collection's
/// camelCase convention.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PunishmentDocument {
    #[serde(rename = "_id")]
    id: String,
    target_id: String,
    #[serde(rename = "type")]
    kind: PunishmentType,
    reason: String,
    #[serde(default)]
    issuer_id: Option<String>,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    created_at: DateTime<Utc>,
    #[serde(default)]
    duration: Option<i64>,
    active: bool,
    #[serde(default)]
    ip: Option<String>
}

impl From<&Punishment> for PunishmentDocument {
    fn from(punishment: &Punishment) -> Self {
        PunishmentDocument {
            id: punishment.id.clone(),
            target_id: punishment.target_id.clone(),
            kind: punishment.kind,
            reason: punishment.reason.clone(),
            issuer_id: punishment.issuer_id.clone(),
            created_at: punishment.created_at,
            duration: punishment.duration,
            active: punishment.is_active(),
            ip: punishment.banned_ip.clone()
        }
    }
}

impl From<PunishmentDocument> for Punishment {
    fn from(document: PunishmentDocument) -> Self {
        Punishment::restore(
            document.id,
            document.target_id,
            document.kind,
            document.reason,
            document.issuer_id,
            document.created_at,
            document.duration,
            document.ip,
            document.active
        )
    }
}

pub struct MongoBackend {
    client: Client,
    punishments: Collection<PunishmentDocument>
}

impl MongoBackend {
    pub async fn connect(uri: &str, database: &str, max_pool_size: u32) -> DatabaseResult<Self> {
        let connection_error = |e: mongodb::error::Error| DatabaseError::Connection(e.to_string());
        let mut client_options = ClientOptions::parse(uri).await.map_err(connection_error)?;
        client_options.min_pool_size = Some(MIN_POOL_SIZE);
        client_options.max_pool_size = Some(max_pool_size.max(MIN_POOL_SIZE));
        client_options.connect_timeout = Some(Duration::new(5, 0));
        client_options.server_selection_timeout = Some(Duration::new(5, 0));

        let client = Client::with_options(client_options).map_err(connection_error)?;
        let db = client.database(database);
        if let Err(e) = db.run_command(doc! { "ping": 1 }, None).await {
            return Err(DatabaseError::Connection(format!("Could not reach MongoDB. Is it running? ({})", e)));
        };

        let punishments = db.collection::<PunishmentDocument>(COLLECTION_NAME);
        for keys in [doc! { "targetId": 1 }, doc! { "ip": 1, "active": 1 }, doc! { "active": 1 }] {
            punishments.create_index(IndexModel::builder().keys(keys).build(), None)
                .await
                .map_err(|e| DatabaseError::Schema(e.to_string()))?;
        }
        Ok(MongoBackend { client, punishments })
    }

    async fn consume_cursor(cursor: Cursor<PunishmentDocument>) -> Vec<Punishment> {
        cursor.collect::<Vec<_>>().await.into_iter().filter_map(|result| match result {
            Ok(document) => Some(Punishment::from(document)),
            Err(e) => {
                error!("Skipping stored punishment: {}", e);
                None
            }
        }).collect()
    }

    fn by_creation() -> FindOptions {
        FindOptions::builder().sort(doc! { "createdAt": 1, "_id": 1 }).build()
    }
}

fn query_error(e: mongodb::error::Error) -> DatabaseError {
    DatabaseError::Query(e.to_string())
}

fn optional_string(value: &Option<String>) -> Bson {
    match value {
        Some(value) => Bson::String(value.clone()),
        None => Bson::Null
    }
}

#[async_trait]
impl PunishmentBackend for MongoBackend {
    fn name(&self) -> &'static str {
        "MongoDB"
    }

    async fn save(&self, punishment: &Punishment) -> DatabaseResult<()> {
        self.punishments.insert_one(PunishmentDocument::from(punishment), None)
            .await
            .map_err(query_error)?;
        Ok(())
    }

    async fn update(&self, punishment: &Punishment) -> DatabaseResult<()> {
        self.punishments.update_one(
            doc! { "_id": punishment.id.as_str() },
            // $min never turns a lifted record back on (false < true)
            doc! {
                "$min": { "active": punishment.is_active() },
                "$set": { "ip": optional_string(&punishment.banned_ip) }
            },
            None
        ).await.map_err(query_error)?;
        Ok(())
    }

    async fn load_all_active(&self) -> DatabaseResult<Vec<Punishment>> {
        let cursor = self.punishments.find(doc! { "active": true }, Self::by_creation())
            .await
            .map_err(query_error)?;
        Ok(Self::consume_cursor(cursor).await)
    }

    async fn load_for_target(&self, target_id: &str) -> DatabaseResult<Vec<Punishment>> {
        let cursor = self.punishments.find(doc! { "targetId": target_id }, Self::by_creation())
            .await
            .map_err(query_error)?;
        Ok(Self::consume_cursor(cursor).await)
    }

    async fn load_for_targets(&self, target_ids: &[String]) -> DatabaseResult<Vec<Punishment>> {
        if target_ids.is_empty() {
            return Ok(Vec::new());
        }
        let cursor = self.punishments.find(doc! { "targetId": { "$in": target_ids.to_vec() } }, Self::by_creation())
            .await
            .map_err(query_error)?;
        Ok(Self::consume_cursor(cursor).await)
    }

    async fn load_for_ip(&self, ip: &str) -> DatabaseResult<Vec<Punishment>> {
        let cursor = self.punishments.find(doc! { "ip": ip, "active": true }, Self::by_creation())
            .await
            .map_err(query_error)?;
        Ok(Self::consume_cursor(cursor).await)
    }

    async fn close(&self) {
        self.client.clone().shutdown().await;
        info!("Closed MongoDB punishment storage.");
    }
}
