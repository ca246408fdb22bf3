//! Remote application of pending changes.

use std::future::Future;

use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::error::{Error, Result};
use crate::models::{ChangeOperation, PendingChange};
use crate::util::{compact_text, is_http_url, normalize_text_option};

/// Server state of an entity as reported by the remote
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteSnapshot {
    /// Server version, when the remote tracks one
    pub version: Option<i64>,
    /// Entity fields, `null` when the entity does not exist remotely
    pub data: Value,
}

/// How a remote apply failed
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    /// Timeouts, throttling, 5xx and transport failures
    #[error("Transient remote error: {0}")]
    Transient(String),
    /// The change was based on a version the server no longer holds
    #[error("Version conflict (server version {:?})", .server.version)]
    VersionConflict { server: RemoteSnapshot },
    /// The server refused the change for good
    #[error("Remote rejected change: {0}")]
    Rejected(String),
}

pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

/// Authoritative store the processor replays changes against.
pub trait RemoteStore: Send + Sync + 'static {
    /// Apply one change. On success returns the entity as stored remotely
    /// (`data` is `null` after a delete).
    fn apply(&self, change: &PendingChange) -> impl Future<Output = RemoteResult<RemoteSnapshot>> + Send;
}

/// `RemoteStore` speaking JSON over HTTP.
///
/// - create: `POST {base}/v1/entities/{type}`
/// - update: `PUT {base}/v1/entities/{type}/{id}`
/// - delete: `DELETE {base}/v1/entities/{type}/{id}`
///
/// The base version travels in `If-Match`. Successful responses and
/// conflict responses carry `{ "version": n, "data": { ... } }`.
#[derive(Clone)]
pub struct HttpRemoteStore {
    base_url: String,
    client: reqwest::Client,
}

impl HttpRemoteStore {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let base_url = normalize_text_option(Some(base_url.into()))
            .filter(|url| is_http_url(url))
            .ok_or_else(|| {
                Error::Config("remote base URL must include http:// or https://".to_string())
            })?;

        let client = reqwest::Client::builder()
            .build()
            .map_err(|error| Error::Config(format!("failed to build HTTP client: {error}")))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn endpoint(&self, change: &PendingChange) -> (Method, String) {
        let entity_type = urlencoding::encode(&change.entity_type);
        let entity_id = urlencoding::encode(&change.entity_id);
        match change.operation {
            ChangeOperation::Create => (
                Method::POST,
                format!("{}/v1/entities/{entity_type}", self.base_url),
            ),
            ChangeOperation::Update => (
                Method::PUT,
                format!("{}/v1/entities/{entity_type}/{entity_id}", self.base_url),
            ),
            ChangeOperation::Delete => (
                Method::DELETE,
                format!("{}/v1/entities/{entity_type}/{entity_id}", self.base_url),
            ),
        }
    }
}

impl RemoteStore for HttpRemoteStore {
    async fn apply(&self, change: &PendingChange) -> RemoteResult<RemoteSnapshot> {
        let (method, url) = self.endpoint(change);
        let mut request = self
            .client
            .request(method, &url)
            .header("Accept", "application/json")
            .header("X-Change-Id", change.id.as_str());

        if let Some(version) = change.base_version {
            request = request.header("If-Match", version.to_string());
        }
        if change.operation == ChangeOperation::Create {
            let mut body = change.payload.clone();
            if let Some(fields) = body.as_object_mut() {
                fields
                    .entry("id")
                    .or_insert_with(|| Value::String(change.entity_id.clone()));
            }
            request = request.json(&body);
        } else if change.operation == ChangeOperation::Update {
            request = request.json(&change.payload);
        }

        let response = request
            .send()
            .await
            .map_err(|error| RemoteError::Transient(format!("request to {url} failed: {error}")))?;

        let status = response.status();
        // An unread success body may have carried the new version; retry.
        let body = match response.text().await {
            Ok(body) => body,
            Err(error) if status.is_success() => {
                return Err(RemoteError::Transient(format!(
                    "reading response from {url} failed: {error}"
                )));
            }
            Err(_) => String::new(),
        };

        if status.is_success() {
            return Ok(parse_snapshot(&body));
        }
        Err(classify_status(status, &body))
    }
}

#[derive(Debug, Deserialize)]
struct SnapshotBody {
    version: Option<i64>,
    data: Option<Value>,
}

/// Parse a `{ version, data }` envelope. A bare JSON object is taken as the
/// entity itself; an empty body means "no entity".
fn parse_snapshot(body: &str) -> RemoteSnapshot {
    if body.trim().is_empty() {
        return RemoteSnapshot::default();
    }

    if let Ok(SnapshotBody {
        version,
        data: Some(data),
    }) = serde_json::from_str::<SnapshotBody>(body)
    {
        return RemoteSnapshot { version, data };
    }

    let data = serde_json::from_str::<Value>(body).unwrap_or(Value::Null);
    RemoteSnapshot {
        version: data.get("version").and_then(Value::as_i64),
        data,
    }
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: Option<String>,
    message: Option<String>,
}

fn describe_failure(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<ErrorBody>(body) {
        if let Some(message) = payload.message.or(payload.error) {
            return format!("{} ({})", compact_text(&message), status.as_u16());
        }
    }

    let trimmed = body.trim();
    if trimmed.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("{} ({})", compact_text(trimmed), status.as_u16())
    }
}

/// Map a non-success HTTP status onto the remote error taxonomy.
pub fn classify_status(status: StatusCode, body: &str) -> RemoteError {
    match status.as_u16() {
        409 | 412 => RemoteError::VersionConflict {
            server: parse_snapshot(body),
        },
        408 | 429 | 500..=599 => RemoteError::Transient(describe_failure(status, body)),
        _ => RemoteError::Rejected(describe_failure(status, body)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChangeId, ChangeStatus};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn change(operation: ChangeOperation, payload: Value, base_version: Option<i64>) -> PendingChange {
        PendingChange {
            id: ChangeId::new(),
            entity_type: "task".to_string(),
            entity_id: "t1".to_string(),
            entity_label: None,
            operation,
            payload,
            base_version,
            base_snapshot: None,
            queued_at: 0,
            retry_count: 0,
            last_error: None,
            status: ChangeStatus::Pending,
            next_attempt_at: None,
        }
    }

    #[test]
    fn new_rejects_non_http_url() {
        assert!(HttpRemoteStore::new("ftp://example.com").is_err());
        assert!(HttpRemoteStore::new("  ").is_err());
    }

    #[test]
    fn status_classification() {
        assert!(matches!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE, ""),
            RemoteError::Transient(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, ""),
            RemoteError::Transient(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::UNPROCESSABLE_ENTITY, r#"{"message":"bad title"}"#),
            RemoteError::Rejected(message) if message == "bad title (422)"
        ));
        assert_eq!(
            classify_status(
                StatusCode::CONFLICT,
                r#"{"version":7,"data":{"title":"server"}}"#
            ),
            RemoteError::VersionConflict {
                server: RemoteSnapshot {
                    version: Some(7),
                    data: json!({ "title": "server" }),
                }
            }
        );
    }

    #[test]
    fn bare_entity_body_is_accepted() {
        let snapshot = parse_snapshot(r#"{"title":"a","version":3}"#);
        assert_eq!(snapshot.version, Some(3));
        assert_eq!(snapshot.data["title"], "a");
        assert_eq!(parse_snapshot(""), RemoteSnapshot::default());
    }

    #[tokio::test]
    async fn update_sends_if_match_and_parses_snapshot() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("PUT", "/v1/entities/task/t1")
            .match_header("if-match", "3")
            .match_body(mockito::Matcher::Json(json!({ "title": "local" })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"version":4,"data":{"title":"local"}}"#)
            .create_async()
            .await;

        let remote = HttpRemoteStore::new(server.url()).unwrap();
        let snapshot = remote
            .apply(&change(ChangeOperation::Update, json!({ "title": "local" }), Some(3)))
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(snapshot.version, Some(4));
        assert_eq!(snapshot.data, json!({ "title": "local" }));
    }

    #[tokio::test]
    async fn create_posts_payload_with_id() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/entities/task")
            .match_body(mockito::Matcher::PartialJson(json!({ "id": "t1" })))
            .with_status(201)
            .with_body(r#"{"version":1,"data":{"id":"t1","title":"new"}}"#)
            .create_async()
            .await;

        let remote = HttpRemoteStore::new(server.url()).unwrap();
        let snapshot = remote
            .apply(&change(ChangeOperation::Create, json!({ "title": "new" }), None))
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(snapshot.version, Some(1));
    }

    #[tokio::test]
    async fn stale_version_is_a_conflict() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("PUT", "/v1/entities/task/t1")
            .with_status(412)
            .with_body(r#"{"version":9,"data":{"title":"server"}}"#)
            .create_async()
            .await;

        let remote = HttpRemoteStore::new(server.url()).unwrap();
        let error = remote
            .apply(&change(ChangeOperation::Update, json!({ "title": "local" }), Some(3)))
            .await
            .unwrap_err();

        match error {
            RemoteError::VersionConflict { server } => {
                assert_eq!(server.version, Some(9));
                assert_eq!(server.data, json!({ "title": "server" }));
            }
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn delete_with_empty_body_succeeds() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("DELETE", "/v1/entities/task/t1")
            .with_status(204)
            .create_async()
            .await;

        let remote = HttpRemoteStore::new(server.url()).unwrap();
        let snapshot = remote
            .apply(&change(ChangeOperation::Delete, Value::Null, Some(2)))
            .await
            .unwrap();
        assert_eq!(snapshot, RemoteSnapshot::default());
    }

    #[tokio::test]
    async fn truncated_success_body_is_transient() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("PUT", "/v1/entities/task/t1")
            .with_status(200)
            .with_chunked_body(|writer| {
                writer.write_all(br#"{"version":3,"da"#)?;
                Err(std::io::Error::other("connection reset"))
            })
            .create_async()
            .await;

        let remote = HttpRemoteStore::new(server.url()).unwrap();
        let error = remote
            .apply(&change(ChangeOperation::Update, json!({ "title": "a" }), Some(2)))
            .await
            .unwrap_err();
        assert!(matches!(
            error,
            RemoteError::Transient(message) if message.contains("reading response")
        ));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn unreachable_server_is_transient() {
        let remote = HttpRemoteStore::new("http://127.0.0.1:9").unwrap();
        let error = remote
            .apply(&change(ChangeOperation::Update, json!({}), None))
            .await
            .unwrap_err();
        assert!(matches!(error, RemoteError::Transient(_)));
    }
}
