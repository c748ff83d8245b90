//! Change-notification source abstraction.
//!
//! The watched store surfaces writes as a lazy, effectively-infinite stream
//! of raw change records, terminated only by an explicit stop or an
//! unrecoverable source error. The in-process implementation is backed by a
//! broadcast channel that the host application publishes into after each
//! successful write.

use std::pin::Pin;

use async_trait::async_trait;
use futures_core::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_stream::{wrappers::errors::BroadcastStreamRecvError, wrappers::BroadcastStream};

/// A raw write notification as emitted by the watched store.
///
/// `full_document` carries the post-write state of the document for inserts
/// as well as updates and replaces.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRecord {
    pub operation_type: String,
    #[serde(default)]
    pub document_key: Option<Value>,
    #[serde(default)]
    pub full_document: Option<Value>,
}

impl ChangeRecord {
    pub fn new(operation_type: &str, document: Value) -> Self {
        Self {
            operation_type: operation_type.to_string(),
            document_key: document.get("_id").cloned().map(|id| serde_json::json!({ "_id": id })),
            full_document: Some(document),
        }
    }

    pub fn insert(document: Value) -> Self {
        Self::new("insert", document)
    }

    pub fn update(document: Value) -> Self {
        Self::new("update", document)
    }

    pub fn replace(document: Value) -> Self {
        Self::new("replace", document)
    }
}

#[derive(Error, Debug)]
pub enum SourceError {
    /// The consumer fell behind and the channel dropped records.
    #[error("change feed lagged behind by {0} records")]
    Lagged(u64),
    #[error("change feed transport error: {0}")]
    Transport(String),
}

/// Stream of raw change records, live until the source closes its side.
pub type ChangeStream = Pin<Box<dyn Stream<Item = Result<ChangeRecord, SourceError>> + Send>>;

/// A source of write notifications for the watched collection.
#[async_trait]
pub trait ChangeSource: Send + Sync {
    async fn subscribe(&self) -> Result<ChangeStream, SourceError>;
}

/// Publishing handle onto the in-process change feed.
///
/// Held by the write path of the host application; publishing with no live
/// subscription is a silent no-op so writes never block on the feed.
#[derive(Clone)]
pub struct ChangeFeedPublisher {
    sender: broadcast::Sender<ChangeRecord>,
}

impl ChangeFeedPublisher {
    pub fn publish(&self, record: ChangeRecord) {
        let _ = self.sender.send(record);
    }
}

/// Broadcast-backed change source for single-process deployments.
pub struct ChannelChangeSource {
    sender: broadcast::Sender<ChangeRecord>,
}

impl ChannelChangeSource {
    pub fn new(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn publisher(&self) -> ChangeFeedPublisher {
        ChangeFeedPublisher {
            sender: self.sender.clone(),
        }
    }
}

#[async_trait]
impl ChangeSource for ChannelChangeSource {
    async fn subscribe(&self) -> Result<ChangeStream, SourceError> {
        let stream = BroadcastStream::new(self.sender.subscribe());
        let stream = tokio_stream::StreamExt::map(stream, |item| match item {
            Ok(record) => Ok(record),
            Err(BroadcastStreamRecvError::Lagged(missed)) => Err(SourceError::Lagged(missed)),
        });
        Ok(Box::pin(stream))
    }
}
