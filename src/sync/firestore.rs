//! Firestore REST client
//!
//! Lists whole collections through `documents.list`, following
//! `nextPageToken` until the collection is exhausted. Typed Firestore values
//! are decoded into [`RemoteValue`].

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use super::remote::{RemoteDocument, RemoteStore, RemoteValue};
use crate::config::FirestoreConfig;
use crate::error::SyncError;

/// Firestore REST `documents.list` client
pub struct FirestoreClient {
    http: reqwest::Client,
    documents_url: String,
    page_size: u32,
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListDocumentsResponse {
    #[serde(default)]
    documents: Vec<FirestoreDocument>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FirestoreDocument {
    name: String,
    #[serde(default)]
    fields: BTreeMap<String, Value>,
}

impl FirestoreClient {
    /// Build a client for `project_id`. `request_timeout` bounds each page
    /// request.
    pub fn new(config: &FirestoreConfig, project_id: &str, request_timeout: Duration) -> Result<Self, SyncError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .user_agent(concat!("tally-store/", env!("CARGO_PKG_VERSION")))
            .build()?;

        let documents_url = format!(
            "{}/projects/{}/databases/{}/documents",
            config.base_url.trim_end_matches('/'),
            project_id,
            config.database
        );

        Ok(Self {
            http,
            documents_url,
            page_size: config.page_size.max(1),
            token: config.token.clone(),
        })
    }

    async fn fetch_page(
        &self,
        collection: &str,
        page_token: Option<&str>,
    ) -> Result<ListDocumentsResponse, SyncError> {
        let url = format!("{}/{}", self.documents_url, collection);
        let mut request = self
            .http
            .get(&url)
            .query(&[("pageSize", self.page_size.to_string())]);
        if let Some(token) = page_token {
            request = request.query(&[("pageToken", token)]);
        }
        if let Some(bearer) = &self.token {
            request = request.bearer_auth(bearer);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::Remote {
                collection: collection.to_string(),
                message: format!("HTTP {}: {}", status, body.trim()),
            });
        }

        response
            .json::<ListDocumentsResponse>()
            .await
            .map_err(|e| SyncError::Decode(format!("{} listing: {}", collection, e)))
    }
}

#[async_trait]
impl RemoteStore for FirestoreClient {
    async fn list_documents(&self, collection: &str) -> Result<Vec<RemoteDocument>, SyncError> {
        let mut documents = Vec::new();
        let mut page_token: Option<String> = None;
        let mut pages = 0u32;

        loop {
            let page = self.fetch_page(collection, page_token.as_deref()).await?;
            pages += 1;
            documents.extend(page.documents.into_iter().map(decode_document));

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        debug!(collection, pages, documents = documents.len(), "Listed remote collection");
        Ok(documents)
    }
}

/// Decode what can be decoded. A bad value marks the document malformed
/// instead of failing the whole listing.
fn decode_document(doc: FirestoreDocument) -> RemoteDocument {
    let id = doc.name.rsplit('/').next().unwrap_or_default();
    let mut problems = Vec::new();
    let mut decoded = if id.is_empty() {
        problems.push(format!("document name without id: {}", doc.name));
        RemoteDocument::new(doc.name.as_str())
    } else {
        RemoteDocument::new(id)
    };

    for (name, value) in &doc.fields {
        match decode_value(value) {
            Ok(value) => {
                decoded.fields.insert(name.clone(), value);
            }
            Err(e) => problems.push(format!("{}: {}", name, e)),
        }
    }

    if problems.is_empty() {
        decoded
    } else {
        warn!(doc_id = %decoded.id, problems = ?problems, "Remote document has undecodable fields");
        decoded.mark_malformed(problems.join("; "))
    }
}

/// Decode one Firestore typed value, e.g. `{"integerValue": "42"}`
pub fn decode_value(value: &Value) -> Result<RemoteValue, SyncError> {
    let Some((kind, inner)) = value.as_object().and_then(|o| o.iter().next()) else {
        return Err(SyncError::Decode(format!("Not a typed value: {}", value)));
    };

    let bad = || SyncError::Decode(format!("Invalid {}: {}", kind, inner));

    let decoded = match kind.as_str() {
        "nullValue" => RemoteValue::Null,
        "booleanValue" => RemoteValue::Bool(inner.as_bool().ok_or_else(bad)?),
        // int64 travels as a JSON string
        "integerValue" => {
            let parsed = match inner {
                Value::String(s) => s.parse::<i64>().ok(),
                other => other.as_i64(),
            };
            RemoteValue::Integer(parsed.ok_or_else(bad)?)
        }
        "doubleValue" => {
            let parsed = match inner {
                Value::String(s) => match s.as_str() {
                    "NaN" => Some(f64::NAN),
                    "Infinity" => Some(f64::INFINITY),
                    "-Infinity" => Some(f64::NEG_INFINITY),
                    other => other.parse::<f64>().ok(),
                },
                other => other.as_f64(),
            };
            RemoteValue::Double(parsed.ok_or_else(bad)?)
        }
        "stringValue" | "bytesValue" => RemoteValue::String(inner.as_str().ok_or_else(bad)?.to_string()),
        "timestampValue" => {
            let raw = inner.as_str().ok_or_else(bad)?;
            let ts = DateTime::parse_from_rfc3339(raw).map_err(|_| bad())?;
            RemoteValue::Timestamp(ts.with_timezone(&Utc))
        }
        "referenceValue" => RemoteValue::Reference(inner.as_str().ok_or_else(bad)?.to_string()),
        "geoPointValue" => RemoteValue::GeoPoint {
            latitude: inner.get("latitude").and_then(Value::as_f64).unwrap_or(0.0),
            longitude: inner.get("longitude").and_then(Value::as_f64).unwrap_or(0.0),
        },
        "arrayValue" => {
            let values = match inner.get("values").and_then(Value::as_array) {
                Some(values) => values.iter().map(decode_value).collect::<Result<Vec<_>, _>>()?,
                None => Vec::new(),
            };
            RemoteValue::Array(values)
        }
        "mapValue" => {
            let fields = match inner.get("fields").and_then(Value::as_object) {
                Some(fields) => fields
                    .iter()
                    .map(|(k, v)| Ok((k.clone(), decode_value(v)?)))
                    .collect::<Result<BTreeMap<_, _>, SyncError>>()?,
                None => BTreeMap::new(),
            };
            RemoteValue::Map(fields)
        }
        other => return Err(SyncError::Decode(format!("Unknown value type {}", other))),
    };

    Ok(decoded)
}
