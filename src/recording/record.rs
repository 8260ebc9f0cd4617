//! Lifecycle record of one HTTP exchange

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use hyper::header::{HeaderMap, CONTENT_TYPE};
use hyper::http::request::Parts;
use hyper::StatusCode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use static_assertions::assert_impl_all;

use crate::{Result, TapwireError};

/// Ordered header list, names kept verbatim
pub type HeaderList = Vec<(String, String)>;

/// Terminal state of an exchange
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Still in flight
    Pending,
    /// Network completed without error
    Succeeded,
    /// Network or caller reported a failure
    Failed(String),
}

impl Outcome {
    /// Whether the outcome is still open
    #[must_use]
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => f.write_str("pending"),
            Self::Succeeded => f.write_str("succeeded"),
            Self::Failed(description) => write!(f, "failed: {description}"),
        }
    }
}

/// Response metadata, captured once
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseSnapshot {
    /// HTTP status code
    pub status: u16,
    /// Response headers in arrival order
    pub headers: HeaderList,
    /// MIME type from `Content-Type`, without parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

impl ResponseSnapshot {
    /// Build a snapshot from response metadata
    #[must_use]
    pub fn new(status: StatusCode, headers: &HeaderMap) -> Self {
        let mime_type = headers
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(';').next())
            .map(|essence| essence.trim().to_ascii_lowercase())
            .filter(|essence| !essence.is_empty());

        Self {
            status: status.as_u16(),
            headers: header_list(headers),
            mime_type,
        }
    }
}

/// Everything captured about one exchange.
///
/// Fields are only reachable through methods that enforce the lifecycle:
/// the response snapshot is written once, the body only grows, the outcome
/// leaves `Pending` exactly once and [`finalize`](Self::finalize) is the
/// last write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestRecord {
    id: String,
    created_at_ms: u64,
    method: String,
    url: String,
    request_headers: HeaderList,
    #[serde(default, with = "hex_bytes", skip_serializing_if = "Option::is_none")]
    request_body: Option<Vec<u8>>,
    #[serde(default, with = "hex_bytes", skip_serializing_if = "Option::is_none")]
    response_body: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    duration_ms: Option<f64>,
    outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    response: Option<ResponseSnapshot>,
}

assert_impl_all!(RequestRecord: Send, Sync, Clone);

impl RequestRecord {
    /// Snapshot a request. `body` is `None` when it is streamed and not captured yet.
    #[must_use]
    pub fn new(parts: &Parts, body: Option<&[u8]>) -> Self {
        let url = parts.uri.to_string();
        Self {
            id: generate_record_id(&url),
            created_at_ms: unix_millis(SystemTime::now()),
            method: parts.method.to_string(),
            url,
            request_headers: header_list(&parts.headers),
            request_body: body.map(<[u8]>::to_vec),
            response_body: None,
            duration_ms: None,
            outcome: Outcome::Pending,
            response: None,
        }
    }

    /// Opaque record id
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Creation time in milliseconds since the Unix epoch
    #[must_use]
    pub fn created_at_ms(&self) -> u64 {
        self.created_at_ms
    }

    /// Request method
    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Request URL
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Request headers
    #[must_use]
    pub fn request_headers(&self) -> &[(String, String)] {
        &self.request_headers
    }

    /// Case-insensitive request header lookup (first match)
    #[must_use]
    pub fn request_header(&self, name: &str) -> Option<&str> {
        self.request_headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Request body, if captured
    #[must_use]
    pub fn request_body(&self) -> Option<&[u8]> {
        self.request_body.as_deref()
    }

    /// Response metadata, if received
    #[must_use]
    pub fn response(&self) -> Option<&ResponseSnapshot> {
        self.response.as_ref()
    }

    /// Accumulated response body, absent until the first chunk
    #[must_use]
    pub fn response_body(&self) -> Option<&[u8]> {
        self.response_body.as_deref()
    }

    /// Current outcome
    #[must_use]
    pub fn outcome(&self) -> &Outcome {
        &self.outcome
    }

    /// Failure description, if the exchange failed
    #[must_use]
    pub fn error_description(&self) -> Option<&str> {
        match &self.outcome {
            Outcome::Failed(description) => Some(description),
            _ => None,
        }
    }

    /// Elapsed milliseconds, set at finalization
    #[must_use]
    pub fn duration_ms(&self) -> Option<f64> {
        self.duration_ms
    }

    /// Whether finalization has happened
    #[must_use]
    pub fn is_finalized(&self) -> bool {
        self.duration_ms.is_some()
    }

    /// Record response metadata
    ///
    /// # Errors
    ///
    /// Returns error if a response was already recorded or the outcome is terminal
    pub fn set_response(&mut self, snapshot: ResponseSnapshot) -> Result<()> {
        self.ensure_pending("set response")?;
        if self.response.is_some() {
            return Err(TapwireError::InvalidTransition(format!(
                "record {}: response already set",
                self.id
            )));
        }
        self.response = Some(snapshot);
        Ok(())
    }

    /// Append a chunk of response body
    ///
    /// # Errors
    ///
    /// Returns error if the outcome is terminal
    pub fn append_body(&mut self, chunk: &[u8]) -> Result<()> {
        self.ensure_pending("append body")?;
        self.response_body
            .get_or_insert_with(Vec::new)
            .extend_from_slice(chunk);
        Ok(())
    }

    /// Mark the exchange as completed successfully
    ///
    /// # Errors
    ///
    /// Returns error if the outcome is terminal or no response was recorded
    pub fn mark_succeeded(&mut self) -> Result<()> {
        self.ensure_pending("mark succeeded")?;
        if self.response.is_none() {
            return Err(TapwireError::InvalidTransition(format!(
                "record {}: cannot succeed without a response",
                self.id
            )));
        }
        self.outcome = Outcome::Succeeded;
        Ok(())
    }

    /// Mark the exchange as failed
    ///
    /// # Errors
    ///
    /// Returns error if the outcome is terminal
    pub fn mark_failed(&mut self, description: impl Into<String>) -> Result<()> {
        self.ensure_pending("mark failed")?;
        self.outcome = Outcome::Failed(description.into());
        Ok(())
    }

    /// Final write: request body snapshot (when available) and duration.
    ///
    /// # Errors
    ///
    /// Returns error if the record was already finalized
    pub fn finalize(&mut self, request_body: Option<Vec<u8>>, duration: Duration) -> Result<()> {
        if self.is_finalized() {
            return Err(TapwireError::InvalidTransition(format!(
                "record {}: already finalized",
                self.id
            )));
        }
        if request_body.is_some() {
            self.request_body = request_body;
        }
        self.duration_ms = Some(duration.as_secs_f64() * 1000.0);
        Ok(())
    }

    fn ensure_pending(&self, action: &str) -> Result<()> {
        if self.outcome.is_pending() && !self.is_finalized() {
            Ok(())
        } else {
            Err(TapwireError::InvalidTransition(format!(
                "record {}: cannot {action} after {:?}",
                self.id, self.outcome
            )))
        }
    }
}

/// Convert a header map into an ordered list.
///
/// Names come out in the lowercase form `HeaderName` normalizes to.
fn header_list(headers: &HeaderMap) -> HeaderList {
    headers
        .iter()
        .map(|(name, value)| (name.as_str().to_string(), header_text(value.as_bytes())))
        .collect()
}

/// Header value as text; non-UTF-8 values map one char per byte (Latin-1)
fn header_text(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => bytes.iter().copied().map(char::from).collect(),
    }
}

fn unix_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}

/// Generate a record id from the URL, the clock and a process counter
fn generate_record_id(url: &str) -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    hasher.update(timestamp.to_le_bytes());
    hasher.update(COUNTER.fetch_add(1, Ordering::Relaxed).to_le_bytes());

    let digest = hasher.finalize();
    hex::encode(&digest[..16])
}

/// Bodies are stored as hex strings so text formats stay readable
mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer.serialize_str(&hex::encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|text| hex::decode(text).map_err(serde::de::Error::custom))
            .transpose()
    }
}
