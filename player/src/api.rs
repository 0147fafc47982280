//! Billboard API client.
//!
//! One authenticated surface for the three calls the device makes: the
//! paginated batch fetch that feeds playback, the periodic heartbeat, and
//! best-effort device event logging.

use std::time::Duration;

use anyhow::Result;
use serde::Deserialize;
use thiserror::Error;

use crate::auth::{Signer, HEADER_DEVICE_ID, HEADER_SIGNATURE, HEADER_TIMESTAMP};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const FETCH_TIMEOUT: Duration = Duration::from_secs(10);
const POST_TIMEOUT: Duration = Duration::from_secs(5);

/// How requests prove who they are.
#[derive(Debug, Clone)]
pub enum Auth {
    /// Per-request HMAC headers derived from the device identity.
    Hmac(Signer),
    /// Legacy static `Authorization` value from the config file.
    Static(String),
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("billboard request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("billboard response carried no URLs")]
    EmptyBatch,
    #[error("billboard response was not valid JSON: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl ApiError {
    /// Protocol errors mean "no new batch"; everything else is transient
    /// network trouble.
    pub fn is_protocol(&self) -> bool {
        matches!(self, ApiError::EmptyBatch | ApiError::Malformed(_))
    }
}

/// One page of the content schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub urls: Vec<String>,
    pub next_cursor: u64,
    /// True when the server signalled the end of a full schedule cycle.
    pub wrapped: bool,
}

#[derive(Debug, Deserialize)]
struct BillboardResponse {
    #[serde(default)]
    response: Option<BillboardInner>,
}

#[derive(Debug, Deserialize)]
struct BillboardInner {
    #[serde(default)]
    data: Vec<BillboardEntry>,
    #[serde(default)]
    message: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct BillboardEntry {
    #[serde(default)]
    url: Option<String>,
}

pub struct ApiClient {
    http: reqwest::Client,
    base: String,
    billboard_id: String,
    auth: Auth,
}

impl ApiClient {
    pub fn new(base: String, billboard_id: String, auth: Auth) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            base,
            billboard_id,
            auth,
        })
    }

    /// Fetch the batch at `cursor`.
    pub async fn fetch(&self, cursor: u64) -> Result<Batch, ApiError> {
        let url = format!("{}/view/billboard", self.base);
        let index = cursor.to_string();
        let request = self
            .http
            .get(&url)
            .query(&[("id", self.billboard_id.as_str()), ("index", index.as_str())])
            .timeout(FETCH_TIMEOUT);

        let body = self
            .apply_auth(request, b"")
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        parse_batch(cursor, &body)
    }

    /// Tell the server this device is alive.
    pub async fn heartbeat(&self) -> Result<(), ApiError> {
        self.signed_post("device/askforevent", b"{}".to_vec())
            .await
    }

    /// Report a device event. `data` is event-specific context.
    pub async fn log_event(
        &self,
        event_type: &str,
        data: serde_json::Value,
    ) -> Result<(), ApiError> {
        let payload = serde_json::json!({
            "type": event_type,
            "idempotency_key": uuid::Uuid::new_v4().to_string(),
            "data": data,
        });
        let body = serde_json::to_vec(&payload)?;
        self.signed_post("device/logdeviceevent", body).await
    }

    async fn signed_post(&self, endpoint: &str, body: Vec<u8>) -> Result<(), ApiError> {
        let url = format!("{}/{}", self.base, endpoint);
        let request = self
            .http
            .post(&url)
            .header("content-type", "application/json")
            .timeout(POST_TIMEOUT);

        // Sign the exact bytes that go on the wire.
        self.apply_auth(request, &body)
            .body(body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    fn apply_auth(&self, request: reqwest::RequestBuilder, body: &[u8]) -> reqwest::RequestBuilder {
        match &self.auth {
            Auth::Hmac(signer) => {
                let h = signer.headers(body);
                request
                    .header(HEADER_DEVICE_ID, h.device_id)
                    .header(HEADER_TIMESTAMP, h.timestamp)
                    .header(HEADER_SIGNATURE, h.signature)
            }
            Auth::Static(value) => request.header("authorization", value.clone()),
        }
    }
}

/// Parse one billboard response body against the cursor that was queried.
fn parse_batch(cursor: u64, body: &str) -> Result<Batch, ApiError> {
    let parsed: BillboardResponse = serde_json::from_str(body)?;
    let inner = parsed.response;

    let urls: Vec<String> = inner
        .as_ref()
        .map(|r| r.data.as_slice())
        .unwrap_or_default()
        .iter()
        .filter_map(|entry| entry.url.as_deref())
        .filter_map(normalize_url)
        .collect();

    if urls.is_empty() {
        return Err(ApiError::EmptyBatch);
    }

    let next_cursor = inner
        .and_then(|r| r.message)
        .and_then(|m| parse_cursor(&m))
        .unwrap_or(cursor);

    Ok(Batch {
        urls,
        wrapped: next_cursor < cursor,
        next_cursor,
    })
}

fn parse_cursor(value: &serde_json::Value) -> Option<u64> {
    match value {
        serde_json::Value::String(s) => s.trim().parse().ok(),
        serde_json::Value::Number(n) => n.as_u64(),
        _ => None,
    }
}

/// Strip the junk the API is known to attach to URLs: trailing CR,
/// whitespace, and commas. Returns `None` for lines that normalize away.
pub fn normalize_url(raw: &str) -> Option<String> {
    let cleaned = raw
        .trim()
        .trim_end_matches(|c: char| c == ',' || c.is_whitespace());
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_urls_and_next_cursor() {
        let body = r#"{"response":{"data":[{"url":"https://x/y/a.png"},{"url":"https://x/y/b.mp4"}],"message":"3"}}"#;
        let batch = parse_batch(2, body).unwrap();
        assert_eq!(batch.urls, vec!["https://x/y/a.png", "https://x/y/b.mp4"]);
        assert_eq!(batch.next_cursor, 3);
        assert!(!batch.wrapped);
    }

    #[test]
    fn numeric_cursor_is_accepted() {
        let body = r#"{"response":{"data":[{"url":"https://x/a.png"}],"message":4}}"#;
        assert_eq!(parse_batch(2, body).unwrap().next_cursor, 4);
    }

    #[test]
    fn malformed_cursor_defaults_to_queried_cursor() {
        for message in ["\"\"", "\"later\"", "\"-1\"", "null", "[1]"] {
            let body = format!(
                r#"{{"response":{{"data":[{{"url":"https://x/a.png"}}],"message":{message}}}}}"#
            );
            let batch = parse_batch(7, &body).unwrap();
            assert_eq!(batch.next_cursor, 7, "message={message}");
            assert!(!batch.wrapped);
        }
    }

    #[test]
    fn missing_message_keeps_cursor() {
        let body = r#"{"response":{"data":[{"url":"https://x/a.png"}]}}"#;
        assert_eq!(parse_batch(5, body).unwrap().next_cursor, 5);
    }

    #[test]
    fn wrap_is_detected_when_server_goes_backwards() {
        let body = r#"{"response":{"data":[{"url":"https://x/a.png"}],"message":"0"}}"#;
        let batch = parse_batch(7, body).unwrap();
        assert!(batch.wrapped);
        assert_eq!(batch.next_cursor, 0);
    }

    #[test]
    fn empty_batch_is_a_protocol_error() {
        for body in [
            r#"{"response":{"data":[],"message":"1"}}"#,
            r#"{"response":{"message":"1"}}"#,
            r#"{}"#,
        ] {
            let err = parse_batch(0, body).unwrap_err();
            assert!(matches!(err, ApiError::EmptyBatch), "body={body}");
            assert!(err.is_protocol());
        }
    }

    #[test]
    fn urls_are_normalized_in_place() {
        let body = "{\"response\":{\"data\":[{\"url\":\"https://x/a.png,\\r\"},{\"url\":\"   \"},{\"url\":\"https://x/b.mp4  \"}],\"message\":\"1\"}}";
        let batch = parse_batch(0, body).unwrap();
        assert_eq!(batch.urls, vec!["https://x/a.png", "https://x/b.mp4"]);
    }

    #[test]
    fn normalize_strips_any_mix_of_trailing_junk() {
        for raw in [
            "https://x/a.png",
            "https://x/a.png\r",
            "https://x/a.png,",
            "https://x/a.png, \r",
            "  https://x/a.png,,\t",
        ] {
            assert_eq!(normalize_url(raw).as_deref(), Some("https://x/a.png"));
        }
        assert_eq!(normalize_url(" ,\r"), None);
        assert_eq!(normalize_url(""), None);
    }

    #[test]
    fn non_json_body_is_a_protocol_error() {
        let err = parse_batch(0, "<html>502</html>").unwrap_err();
        assert!(err.is_protocol());
    }
}
