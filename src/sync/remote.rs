//! Read-only view of the remote document store

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::error::SyncError;

/// A typed field value as the remote store reports it
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteValue {
    Null,
    Bool(bool),
    Integer(i64),
    Double(f64),
    String(String),
    Timestamp(DateTime<Utc>),
    /// Path of another document
    Reference(String),
    GeoPoint { latitude: f64, longitude: f64 },
    Array(Vec<RemoteValue>),
    Map(BTreeMap<String, RemoteValue>),
}

impl RemoteValue {
    pub fn is_null(&self) -> bool {
        matches!(self, RemoteValue::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            RemoteValue::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for RemoteValue {
    fn from(s: &str) -> Self {
        RemoteValue::String(s.to_string())
    }
}

impl From<String> for RemoteValue {
    fn from(s: String) -> Self {
        RemoteValue::String(s)
    }
}

impl From<i64> for RemoteValue {
    fn from(v: i64) -> Self {
        RemoteValue::Integer(v)
    }
}

impl From<f64> for RemoteValue {
    fn from(v: f64) -> Self {
        RemoteValue::Double(v)
    }
}

impl From<bool> for RemoteValue {
    fn from(v: bool) -> Self {
        RemoteValue::Bool(v)
    }
}

impl From<DateTime<Utc>> for RemoteValue {
    fn from(v: DateTime<Utc>) -> Self {
        RemoteValue::Timestamp(v)
    }
}

/// One document of a remote collection
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteDocument {
    /// Document id, the last segment of its path
    pub id: String,
    /// Fields that decoded cleanly
    pub fields: BTreeMap<String, RemoteValue>,
    /// Why part of the document could not be decoded. Such a document is
    /// skipped by the reconciler.
    pub malformed: Option<String>,
}

impl RemoteDocument {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: BTreeMap::new(),
            malformed: None,
        }
    }

    /// Flag the document as only partly decodable
    pub fn mark_malformed(mut self, reason: impl Into<String>) -> Self {
        self.malformed = Some(reason.into());
        self
    }

    /// Builder-style field setter
    pub fn with(mut self, field: &str, value: impl Into<RemoteValue>) -> Self {
        self.fields.insert(field.to_string(), value.into());
        self
    }

    pub fn get(&self, field: &str) -> Option<&RemoteValue> {
        self.fields.get(field)
    }
}

/// Source of remote documents. Implementations must not hold any local
/// store lock while fetching.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Every document currently in `collection`
    async fn list_documents(&self, collection: &str) -> Result<Vec<RemoteDocument>, SyncError>;
}

/// In-process remote store for tests and offline runs
#[derive(Default)]
pub struct MemoryRemoteStore {
    collections: RwLock<HashMap<String, BTreeMap<String, RemoteDocument>>>,
    unavailable: RwLock<HashMap<String, String>>,
    latency: RwLock<Option<Duration>>,
    fetches: RwLock<HashMap<String, u64>>,
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a document
    pub async fn put(&self, collection: &str, doc: RemoteDocument) {
        self.collections
            .write()
            .await
            .entry(collection.to_string())
            .or_default()
            .insert(doc.id.clone(), doc);
    }

    pub async fn remove(&self, collection: &str, doc_id: &str) -> Option<RemoteDocument> {
        self.collections
            .write()
            .await
            .get_mut(collection)
            .and_then(|docs| docs.remove(doc_id))
    }

    /// Make fetches of `collection` fail until cleared with `None`
    pub async fn set_unavailable(&self, collection: &str, message: Option<&str>) {
        let mut unavailable = self.unavailable.write().await;
        match message {
            Some(message) => {
                unavailable.insert(collection.to_string(), message.to_string());
            }
            None => {
                unavailable.remove(collection);
            }
        }
    }

    /// Delay every fetch by `latency`
    pub async fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.write().await = latency;
    }

    /// Number of fetches attempted for `collection`, failed ones included
    pub async fn fetch_count(&self, collection: &str) -> u64 {
        self.fetches.read().await.get(collection).copied().unwrap_or(0)
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn list_documents(&self, collection: &str) -> Result<Vec<RemoteDocument>, SyncError> {
        *self
            .fetches
            .write()
            .await
            .entry(collection.to_string())
            .or_default() += 1;

        let latency = *self.latency.read().await;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        if let Some(message) = self.unavailable.read().await.get(collection) {
            return Err(SyncError::Remote {
                collection: collection.to_string(),
                message: message.clone(),
            });
        }

        Ok(self
            .collections
            .read()
            .await
            .get(collection)
            .map(|docs| docs.values().cloned().collect())
            .unwrap_or_default())
    }
}
