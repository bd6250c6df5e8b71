use std::time::Duration;

use async_trait::async_trait;
use mongodb::bson::{doc, Bson, Document};
use mongodb::error::{Error as MongoError, ErrorKind, WriteFailure, RETRYABLE_WRITE_ERROR};
use mongodb::options::{ClientOptions, ServerApi, ServerApiVersion};
use mongodb::{Client, Collection, Database};
use serde_json::{Map, Value};
use tracing::info;

use crate::error::ApplyError;
use crate::reconcile::SinkIdentifier;
use crate::sink::DocumentSink;

const DUPLICATE_KEY: i32 = 11000;
const UNAUTHORIZED: i32 = 13;
const AUTHENTICATION_FAILED: i32 = 18;

#[derive(Debug, Clone)]
pub struct MongoSinkConfig {
    pub uri: String,
    pub database: String,
    pub collection: String,
    /// Bound for connecting and selecting a server.
    pub timeout: Duration,
}

/// MongoDB collection sink. The sink identifier is stored as `_id`.
pub struct MongoSink {
    database: Database,
    collection: Collection<Document>,
}

impl MongoSink {
    pub async fn connect(config: &MongoSinkConfig) -> Result<Self, ApplyError> {
        let mut options = ClientOptions::parse(&config.uri)
            .await
            .map_err(classify)?;
        options.app_name = Some("change-bridge".to_string());
        options.server_api = Some(ServerApi::builder().version(ServerApiVersion::V1).build());
        options.connect_timeout = Some(config.timeout);
        options.server_selection_timeout = Some(config.timeout);

        let client = Client::with_options(options).map_err(classify)?;
        let database = client.database(&config.database);
        let collection = database.collection::<Document>(&config.collection);

        Ok(Self {
            database,
            collection,
        })
    }

    pub async fn count_documents(&self) -> Result<u64, ApplyError> {
        self.collection
            .count_documents(doc! {})
            .await
            .map_err(classify)
    }

    /// Ping the deployment and log what the collection holds, like an operator
    /// would check before starting replication.
    pub async fn describe(&self) -> Result<(), ApplyError> {
        self.ping().await?;
        info!("Pinged the sink deployment, connection is healthy");

        let count = self.count_documents().await?;
        info!(
            database = self.database.name(),
            collection = self.collection.name(),
            documents = count,
            "Connected to sink collection"
        );
        Ok(())
    }
}

#[async_trait]
impl DocumentSink for MongoSink {
    fn name(&self) -> &'static str {
        "mongodb"
    }

    async fn upsert(
        &self,
        identifier: &SinkIdentifier,
        document: &Map<String, Value>,
    ) -> Result<(), ApplyError> {
        let id = identifier_bson(identifier);
        let mut replacement = mongodb::bson::to_document(document)
            .map_err(|e| ApplyError::Permanent(format!("document cannot be stored: {e}")))?;
        replacement.insert("_id", id.clone());

        self.collection
            .replace_one(doc! { "_id": id }, replacement)
            .upsert(true)
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn delete(&self, identifier: &SinkIdentifier) -> Result<(), ApplyError> {
        // Zero deleted documents is fine, the key is absent either way.
        self.collection
            .delete_one(doc! { "_id": identifier_bson(identifier) })
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), ApplyError> {
        self.database
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(classify)?;
        Ok(())
    }
}

fn identifier_bson(identifier: &SinkIdentifier) -> Bson {
    match identifier {
        SinkIdentifier::ObjectId(oid) => Bson::ObjectId(*oid),
        SinkIdentifier::String(s) => Bson::String(s.clone()),
        SinkIdentifier::Int(i) => Bson::Int64(*i),
    }
}

/// Sort driver errors into retry, skip and stop.
fn classify(err: MongoError) -> ApplyError {
    let message = err.to_string();

    match err.kind.as_ref() {
        ErrorKind::Authentication { .. } => ApplyError::Unauthorized(message),
        ErrorKind::Command(command)
            if command.code == UNAUTHORIZED || command.code == AUTHENTICATION_FAILED =>
        {
            ApplyError::Unauthorized(message)
        }
        ErrorKind::Io(_)
        | ErrorKind::ServerSelection { .. }
        | ErrorKind::ConnectionPoolCleared { .. } => ApplyError::Transient(message),
        _ if err.contains_label(RETRYABLE_WRITE_ERROR) => ApplyError::Transient(message),
        ErrorKind::Write(WriteFailure::WriteError(write)) if write.code == DUPLICATE_KEY => {
            ApplyError::Permanent(message)
        }
        ErrorKind::BsonSerialization(_) | ErrorKind::InvalidArgument { .. } => {
            ApplyError::Permanent(message)
        }
        // Anything else is retried, the attempt ceiling bounds how long.
        _ => ApplyError::Transient(message),
    }
}
