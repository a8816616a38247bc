//! Cloud document API - HTTP communication with the Firestore REST endpoint
//!
//! Handles the two calls the engine needs:
//! - Replace a document, stamping `lastSync` with the server clock
//! - Fetch a document (404 = absent)
//!
//! Plain JSON is converted to and from Firestore's typed value encoding here,
//! so nothing above this module sees the wire format.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Map, Number, Value};
use url::Url;

use super::models::SyncConfig;

/// Document field stamped by the server at write time
pub const LAST_SYNC_FIELD: &str = "lastSync";

/// A fetched document: decoded fields plus the server's last update time
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    pub fields: Map<String, Value>,
    /// Opaque server revision marker (RFC 3339 update time)
    pub update_time: Option<String>,
}

/// Transport seam between the sync engine and a remote document store.
///
/// `FirestoreClient` is the production implementation; tests plug in an
/// in-memory store.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Replace `document_id` with `fields`, setting [`LAST_SYNC_FIELD`] to
    /// the server's time. Returns that time.
    async fn put_document(
        &self,
        document_id: &str,
        fields: Map<String, Value>,
    ) -> Result<DateTime<Utc>, SyncApiError>;

    /// Fetch `document_id`; `Ok(None)` when it does not exist
    async fn get_document(&self, document_id: &str) -> Result<Option<StoredDocument>, SyncApiError>;
}

/// API client for Firestore's REST interface
pub struct FirestoreClient {
    client: Client,
    base_url: String,
    project_id: String,
    collection: String,
    api_key: String,
}

impl FirestoreClient {
    /// Create a client from a validated configuration
    pub fn new(config: &SyncConfig) -> Result<Self, SyncApiError> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            project_id: config.project_id.clone(),
            collection: config.collection.clone(),
            api_key: config.access_key.clone(),
        })
    }

    fn documents_root(&self) -> String {
        format!("projects/{}/databases/(default)/documents", self.project_id)
    }

    fn document_name(&self, document_id: &str) -> String {
        format!("{}/{}/{}", self.documents_root(), self.collection, document_id)
    }

    fn endpoint(&self, path: &str) -> Result<Url, SyncApiError> {
        let mut url = Url::parse(&format!("{}/{}", self.base_url, path))
            .map_err(|e| SyncApiError::InvalidUrl(e.to_string()))?;
        url.query_pairs_mut().append_pair("key", &self.api_key);
        Ok(url)
    }
}

#[async_trait]
impl DocumentStore for FirestoreClient {
    async fn put_document(
        &self,
        document_id: &str,
        fields: Map<String, Value>,
    ) -> Result<DateTime<Utc>, SyncApiError> {
        let url = self.endpoint(&format!("{}:commit", self.documents_root()))?;

        let body = json!({
            "writes": [{
                "update": {
                    "name": self.document_name(document_id),
                    "fields": encode_fields(&fields),
                },
                "updateTransforms": [{
                    "fieldPath": LAST_SYNC_FIELD,
                    "setToServerValue": "REQUEST_TIME",
                }],
            }],
        });

        let response = self.client
            .post(url)
            .json(&body)
            .send()
            .await?;

        let commit: CommitResponse = handle_response(response).await?;
        commit.server_time()
    }

    async fn get_document(&self, document_id: &str) -> Result<Option<StoredDocument>, SyncApiError> {
        let url = self.endpoint(&self.document_name(document_id))?;

        let response = self.client
            .get(url)
            .send()
            .await?;

        // Missing document is not an error (first sync)
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let document: DocumentResponse = handle_response(response).await?;
        Ok(Some(StoredDocument {
            fields: decode_fields(&document.fields)?,
            update_time: document.update_time,
        }))
    }
}

// ============================================================================
// API Response Types
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommitResponse {
    #[serde(default)]
    write_results: Vec<WriteResult>,
    commit_time: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WriteResult {
    #[serde(default)]
    transform_results: Vec<Value>,
}

impl CommitResponse {
    /// Value written by the `REQUEST_TIME` transform, falling back to the
    /// commit time (they are equal on Firestore).
    fn server_time(&self) -> Result<DateTime<Utc>, SyncApiError> {
        let raw = self.write_results
            .first()
            .and_then(|w| w.transform_results.first())
            .and_then(|v| v.get("timestampValue"))
            .and_then(Value::as_str)
            .or(self.commit_time.as_deref())
            .ok_or_else(|| SyncApiError::InvalidResponse("commit response has no timestamp".to_string()))?;

        DateTime::parse_from_rfc3339(raw)
            .map(|d| d.with_timezone(&Utc))
            .map_err(|e| SyncApiError::InvalidResponse(format!("bad timestamp {}: {}", raw, e)))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DocumentResponse {
    #[serde(default)]
    fields: Map<String, Value>,
    update_time: Option<String>,
}

// ============================================================================
// Value Encoding
// ============================================================================

/// Encode a JSON object as a Firestore `fields` map
pub fn encode_fields(fields: &Map<String, Value>) -> Map<String, Value> {
    fields
        .iter()
        .map(|(k, v)| (k.clone(), encode_value(v)))
        .collect()
}

/// Encode one JSON value as a Firestore typed value
pub fn encode_value(value: &Value) -> Value {
    match value {
        Value::Null => json!({ "nullValue": null }),
        Value::Bool(b) => json!({ "booleanValue": b }),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                json!({ "integerValue": i.to_string() })
            } else if let Some(u) = n.as_u64() {
                // integerValue is a signed 64-bit field
                json!({ "doubleValue": u as f64 })
            } else {
                json!({ "doubleValue": n })
            }
        }
        Value::String(s) => json!({ "stringValue": s }),
        Value::Array(items) => {
            let values: Vec<Value> = items.iter().map(encode_value).collect();
            json!({ "arrayValue": { "values": values } })
        }
        Value::Object(map) => json!({ "mapValue": { "fields": encode_fields(map) } }),
    }
}

/// Decode a Firestore `fields` map into a plain JSON object
pub fn decode_fields(fields: &Map<String, Value>) -> Result<Map<String, Value>, SyncApiError> {
    fields
        .iter()
        .map(|(k, v)| decode_value(v).map(|decoded| (k.clone(), decoded)))
        .collect()
}

/// Decode one Firestore typed value
pub fn decode_value(value: &Value) -> Result<Value, SyncApiError> {
    let typed = value
        .as_object()
        .and_then(|o| o.iter().next())
        .map(|(k, v)| (k.as_str(), v))
        .ok_or_else(|| SyncApiError::InvalidResponse(format!("untyped value: {}", value)))?;

    let decoded = match typed {
        ("nullValue", _) => Value::Null,
        ("booleanValue", b) => Value::Bool(b.as_bool().unwrap_or(false)),
        ("integerValue", raw) => {
            let parsed = match raw {
                Value::String(s) => s.parse::<i64>().ok(),
                Value::Number(n) => n.as_i64(),
                _ => None,
            };
            parsed
                .map(|i| Value::Number(i.into()))
                .ok_or_else(|| SyncApiError::InvalidResponse(format!("bad integerValue: {}", raw)))?
        }
        // Non-finite doubles arrive as strings and have no JSON form
        ("doubleValue", raw) => raw
            .as_f64()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ("stringValue", s) | ("timestampValue", s) | ("referenceValue", s) | ("bytesValue", s) => s.clone(),
        ("geoPointValue", point) => point.clone(),
        ("arrayValue", array) => {
            let items = match array.get("values").and_then(Value::as_array) {
                Some(values) => values.iter().map(decode_value).collect::<Result<Vec<_>, _>>()?,
                None => Vec::new(),
            };
            Value::Array(items)
        }
        ("mapValue", map) => {
            let fields = match map.get("fields").and_then(Value::as_object) {
                Some(fields) => decode_fields(fields)?,
                None => Map::new(),
            };
            Value::Object(fields)
        }
        (other, _) => {
            return Err(SyncApiError::InvalidResponse(format!("unknown value type: {}", other)));
        }
    };

    Ok(decoded)
}

// ============================================================================
// Error Handling
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum SyncApiError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Invalid endpoint URL: {0}")]
    InvalidUrl(String),

    #[error("Unauthorized - check the access key")]
    Unauthorized,

    #[error("Permission denied by store rules")]
    PermissionDenied,

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    #[error("Invalid response from server: {0}")]
    InvalidResponse(String),
}

/// Handle successful JSON response
async fn handle_response<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, SyncApiError> {
    let status = response.status();

    if status.is_success() {
        response.json::<T>().await
            .map_err(|e| SyncApiError::InvalidResponse(e.to_string()))
    } else {
        Err(handle_error(response).await)
    }
}

/// Convert error response to SyncApiError
async fn handle_error(response: reqwest::Response) -> SyncApiError {
    let status = response.status();

    match status {
        StatusCode::UNAUTHORIZED => SyncApiError::Unauthorized,
        StatusCode::FORBIDDEN => SyncApiError::PermissionDenied,
        StatusCode::TOO_MANY_REQUESTS => SyncApiError::RateLimitExceeded,
        s if s.is_server_error() => {
            let msg = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            SyncApiError::ServerError(format!("{}: {}", status, msg))
        }
        _ => {
            let msg = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            SyncApiError::NetworkError(format!("{}: {}", status, msg))
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
