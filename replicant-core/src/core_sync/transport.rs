/*
    transport.rs - Network seams of the sync subsystem

    StreamTransport opens one long-lived streaming request and yields its
    raw events (status, body chunks, end, failure). SyncBackend covers the
    request/response endpoints. Both are traits so the connection manager
    and the client can be driven by scripted implementations in tests.

    The HTTP implementations use reqwest:
    - GET {base}{endpoint}?params, body consumed via bytes_stream()
    - GET {base}{elements_path}?change_id=N
    - POST {base}{path} with {"change_id": N, "data": payload}
    - GET {base}{health_path} -> {"healthy": bool}
    - GET {base}{schema_path} -> {"schema_version": "..."}
*/

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};

use super::errors::{Result, SyncError};
use super::types::{IncrementalUpdate, Version};
use crate::config::ServerConfig;

/// Raw event of one streaming request
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Response status line received
    Header { status: u16 },
    /// Next piece of the body, split at arbitrary byte boundaries
    Chunk(Bytes),
    /// Body ended
    Finished,
    /// Request failed at the network level
    Failed(String),
}

/// Event stream of one open request. Dropping it aborts the request.
pub type TransportStream = BoxStream<'static, TransportEvent>;

/// Query parameters of a stream request
pub type Params = Vec<(String, String)>;

/// Opens streaming requests
#[async_trait]
pub trait StreamTransport: Send + Sync {
    async fn open(&self, endpoint: &str, params: &Params) -> TransportStream;
}

/// Request/response endpoints of the server
#[async_trait]
pub trait SyncBackend: Send + Sync {
    /// Everything since `since`, or a full snapshot for `None`.
    async fn get_elements(&self, since: Option<Version>) -> Result<IncrementalUpdate>;

    /// Mutating request. The server refuses with 403 when `version` is too
    /// far behind to be replayed.
    async fn request(&self, path: &str, payload: Value, version: Version) -> Result<Value>;

    async fn is_healthy(&self) -> Result<bool>;

    async fn schema_version(&self) -> Result<String>;
}

fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// reqwest based stream transport
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>, connect_timeout: Duration) -> Result<Self> {
        // no overall timeout, the body is open-ended
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    pub fn from_config(config: &ServerConfig) -> Result<Self> {
        Self::new(config.base_url.clone(), config.request_timeout)
    }
}

#[async_trait]
impl StreamTransport for HttpTransport {
    async fn open(&self, endpoint: &str, params: &Params) -> TransportStream {
        let url = join_url(&self.base_url, endpoint);
        debug!(%url, "opening stream");

        let response = match self.client.get(&url).query(params).send().await {
            Ok(response) => response,
            Err(e) => {
                warn!(%url, error = %e, "stream request failed");
                return stream::once(async move { TransportEvent::Failed(e.to_string()) }).boxed();
            }
        };

        let status = response.status().as_u16();
        let header = stream::once(async move { TransportEvent::Header { status } });
        let body = response.bytes_stream().map(|chunk| match chunk {
            Ok(bytes) => TransportEvent::Chunk(bytes),
            Err(e) => TransportEvent::Failed(e.to_string()),
        });
        let end = stream::once(async { TransportEvent::Finished });

        header.chain(body).chain(end).boxed()
    }
}

#[derive(Debug, Deserialize)]
struct HealthResponse {
    #[serde(default)]
    healthy: bool,
}

#[derive(Debug, Deserialize)]
struct SchemaResponse {
    schema_version: String,
}

/// reqwest based backend
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    config: ServerConfig,
}

impl HttpBackend {
    pub fn new(config: ServerConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        join_url(&self.config.base_url, path)
    }
}

#[async_trait]
impl SyncBackend for HttpBackend {
    async fn get_elements(&self, since: Option<Version>) -> Result<IncrementalUpdate> {
        let mut request = self.client.get(self.url(&self.config.elements_path));
        if let Some(version) = since {
            request = request.query(&[("change_id", version)]);
        }
        let response = request.send().await?;
        if response.status() == StatusCode::FORBIDDEN {
            return Err(SyncError::VersionTooOld(since.unwrap_or(0)));
        }
        let update = response
            .error_for_status()?
            .json::<IncrementalUpdate>()
            .await?;
        debug!(
            from = update.from_version,
            to = update.to_version,
            full = update.full,
            "elements received"
        );
        Ok(update)
    }

    async fn request(&self, path: &str, payload: Value, version: Version) -> Result<Value> {
        let response = self
            .client
            .post(self.url(path))
            .json(&json!({ "change_id": version, "data": payload }))
            .send()
            .await?;

        if response.status() == StatusCode::FORBIDDEN {
            return Err(SyncError::VersionTooOld(version));
        }
        Ok(response.error_for_status()?.json::<Value>().await?)
    }

    async fn is_healthy(&self) -> Result<bool> {
        let health = self
            .client
            .get(self.url(&self.config.health_path))
            .send()
            .await?
            .error_for_status()?
            .json::<HealthResponse>()
            .await?;
        Ok(health.healthy)
    }

    async fn schema_version(&self) -> Result<String> {
        let schema = self
            .client
            .get(self.url(&self.config.schema_path))
            .send()
            .await?
            .error_for_status()?
            .json::<SchemaResponse>()
            .await?;
        Ok(schema.schema_version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_url() {
        assert_eq!(join_url("http://h/", "/system/health"), "http://h/system/health");
        assert_eq!(join_url("http://h", "system/health"), "http://h/system/health");
    }

    #[test]
    fn test_health_response_defaults_to_unhealthy() {
        let health: HealthResponse = serde_json::from_str("{}").unwrap();
        assert!(!health.healthy);
        let health: HealthResponse = serde_json::from_str(r#"{"healthy": true}"#).unwrap();
        assert!(health.healthy);
    }

    /// Answer one request with `status` and an empty body.
    async fn respond_once(status: &'static str) -> ServerConfig {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 4096];
            let _ = socket.read(&mut request).await;
            let response = format!(
                "HTTP/1.1 {}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
                status
            );
            let _ = socket.write_all(response.as_bytes()).await;
        });

        ServerConfig {
            base_url: format!("http://{}", addr),
            request_timeout: Duration::from_secs(5),
            ..ServerConfig::default()
        }
    }

    #[tokio::test]
    async fn test_elements_forbidden_is_version_too_old() {
        let backend = HttpBackend::new(respond_once("403 Forbidden").await).unwrap();
        assert!(matches!(
            backend.get_elements(Some(10)).await,
            Err(SyncError::VersionTooOld(10))
        ));
    }

    #[tokio::test]
    async fn test_elements_server_error_stays_http() {
        let backend = HttpBackend::new(respond_once("502 Bad Gateway").await).unwrap();
        assert!(matches!(
            backend.get_elements(Some(10)).await,
            Err(SyncError::Http { status: 502, .. })
        ));
    }

    #[tokio::test]
    async fn test_request_forbidden_is_version_too_old() {
        let backend = HttpBackend::new(respond_once("403 Forbidden").await).unwrap();
        assert!(matches!(
            backend.request("/system/action", json!({}), 7).await,
            Err(SyncError::VersionTooOld(7))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_server_yields_failed_event() {
        let transport = HttpTransport::new("http://127.0.0.1:9", Duration::from_millis(200)).unwrap();
        let events: Vec<_> = transport.open("/system/autoupdate", &Vec::new()).await.collect().await;
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], TransportEvent::Failed(_)));
    }
}
