//! Normalized domain events.
//!
//! A [`DomainEvent`] is built once per raw change record and discarded after
//! dispatch. Records that violate the event invariants (unknown operation,
//! missing document, missing tenant) fail normalization and are dropped by
//! the subscriber.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::source::ChangeRecord;

/// Document field that scopes an event to one tenant.
pub const TENANT_FIELD: &str = "organizationId";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Insert,
    Update,
    Replace,
}

impl OperationKind {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "insert" => Some(Self::Insert),
            "update" => Some(Self::Update),
            "replace" => Some(Self::Replace),
            _ => None,
        }
    }
}

#[derive(Error, Debug)]
pub enum NormalizeError {
    #[error("unsupported operation type `{0}`")]
    UnsupportedOperation(String),
    #[error("change record carries no full document")]
    MissingDocument,
    #[error("document has no organizationId field")]
    MissingTenant,
    #[error("change record carries no resolvable document id")]
    MissingDocumentId,
}

/// A normalized write event, scoped to one tenant.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainEvent {
    pub operation: OperationKind,
    pub tenant_id: String,
    pub document_id: String,
    pub document: Value,
}

impl DomainEvent {
    /// Normalizes a raw change record into a domain event.
    pub fn from_record(record: ChangeRecord) -> Result<Self, NormalizeError> {
        let operation = OperationKind::parse(&record.operation_type)
            .ok_or_else(|| NormalizeError::UnsupportedOperation(record.operation_type.clone()))?;

        let document = record.full_document.ok_or(NormalizeError::MissingDocument)?;

        let tenant_id = document
            .get(TENANT_FIELD)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(NormalizeError::MissingTenant)?
            .to_string();

        let document_id = record
            .document_key
            .as_ref()
            .and_then(|key| key.get("_id"))
            .or_else(|| document.get("_id"))
            .or_else(|| document.get("id"))
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .ok_or(NormalizeError::MissingDocumentId)?
            .to_string();

        Ok(Self {
            operation,
            tenant_id,
            document_id,
            document,
        })
    }
}
