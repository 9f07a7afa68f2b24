//! Transport layer for outbound service calls
//!
//! - Transport trait: one request, one reply
//! - MockTransport: scripted replies for tests
//! - TcpTransport: framed JSON over TCP, optionally TLS

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use buildmaster_protocol::{Response, RpcError, ServiceRequest, MAX_FRAME_BYTES};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use rustls::pki_types::ServerName;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use super::tls::{certificate_rejection, client_config, client_config_with_roots, roots_from_pem_file};
use super::ServiceError;
use crate::config::EndpointConfig;
use crate::timeout::TimeoutConfig;

/// A call to a service action, before the endpoint token is attached.
#[derive(Debug, Clone, PartialEq)]
pub struct CallRequest {
    pub action: String,
    pub body: Value,
}

impl CallRequest {
    pub fn new(action: impl Into<String>, body: Value) -> Self {
        Self {
            action: action.into(),
            body,
        }
    }
}

/// Request/reply transport to one service endpoint.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Endpoint label used in errors and logs.
    fn endpoint(&self) -> &str;

    async fn call(&self, request: &CallRequest) -> Result<Value, ServiceError>;
}

/// Scripted reply for [`MockTransport`]
#[derive(Debug, Clone)]
pub enum MockReply {
    Ok(Value),
    Err(RpcError),
}

/// Mock transport for testing: records calls, returns scripted replies
#[derive(Debug, Default)]
pub struct MockTransport {
    replies: Mutex<HashMap<String, MockReply>>,
    calls: Mutex<Vec<CallRequest>>,
    delay: Mutex<Option<Duration>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
        match mutex.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Reply to `action` with `body` from now on.
    pub fn reply(&self, action: &str, body: Value) -> &Self {
        Self::guard(&self.replies).insert(action.to_string(), MockReply::Ok(body));
        self
    }

    /// Fail `action` with a service-side error from now on.
    pub fn fail(&self, action: &str, error: RpcError) -> &Self {
        Self::guard(&self.replies).insert(action.to_string(), MockReply::Err(error));
        self
    }

    /// Hold every reply for `delay`.
    pub fn set_delay(&self, delay: Option<Duration>) {
        *Self::guard(&self.delay) = delay;
    }

    /// Calls received so far.
    pub fn calls(&self) -> Vec<CallRequest> {
        Self::guard(&self.calls).clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn endpoint(&self) -> &str {
        "mock"
    }

    async fn call(&self, request: &CallRequest) -> Result<Value, ServiceError> {
        Self::guard(&self.calls).push(request.clone());
        let delay = *Self::guard(&self.delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let reply = Self::guard(&self.replies).get(&request.action).cloned();
        match reply {
            Some(MockReply::Ok(body)) => Ok(body),
            Some(MockReply::Err(error)) => Err(ServiceError::Remote {
                endpoint: "mock".to_string(),
                error,
            }),
            None => Ok(Value::Object(Default::default())),
        }
    }
}

/// Framed JSON over TCP, with optional TLS.
pub struct TcpTransport {
    endpoint: String,
    host: String,
    token: SecretString,
    tls: Option<TlsConnector>,
    call_timeout: Duration,
}

impl TcpTransport {
    pub fn new(config: &EndpointConfig, timeouts: &TimeoutConfig) -> Result<Self, ServiceError> {
        let endpoint = config.addr();
        let tls = if config.uses_tls {
            let client = match &config.ca_file {
                Some(ca_file) => roots_from_pem_file(ca_file)
                    .and_then(|roots| client_config_with_roots(roots).map_err(|e| e.to_string())),
                None => client_config(config.validate_cert).map_err(|e| e.to_string()),
            }
            .map_err(|reason| ServiceError::Connect {
                endpoint: endpoint.clone(),
                reason: format!("TLS setup failed: {}", reason),
            })?;
            Some(TlsConnector::from(client))
        } else {
            None
        };

        Ok(Self {
            endpoint,
            host: config.host.clone(),
            token: SecretString::from(config.token.expose_secret().to_string()),
            tls,
            call_timeout: config.call_timeout(timeouts),
        })
    }

    /// Replace the TLS client config (e.g. to trust a private CA).
    pub fn with_tls_config(mut self, config: Arc<rustls::ClientConfig>) -> Self {
        self.tls = Some(TlsConnector::from(config));
        self
    }

    async fn call_inner(&self, request: &CallRequest) -> Result<Value, ServiceError> {
        let stream = TcpStream::connect(&self.endpoint)
            .await
            .map_err(|e| ServiceError::Connect {
                endpoint: self.endpoint.clone(),
                reason: e.to_string(),
            })?;
        let _ = stream.set_nodelay(true);

        match &self.tls {
            Some(connector) => {
                let server_name = ServerName::try_from(self.host.as_str())
                    .map_err(|e| ServiceError::Connect {
                        endpoint: self.endpoint.clone(),
                        reason: format!("invalid server name: {}", e),
                    })?
                    .to_owned();
                // The handshake completes before any request byte is written.
                let tls_stream = connector.connect(server_name, stream).await.map_err(|e| {
                    match certificate_rejection(&e) {
                        Some(reason) => ServiceError::Certificate {
                            endpoint: self.endpoint.clone(),
                            reason,
                        },
                        None => ServiceError::Connect {
                            endpoint: self.endpoint.clone(),
                            reason: format!("TLS handshake failed: {}", e),
                        },
                    }
                })?;
                self.exchange(tls_stream, request).await
            }
            None => self.exchange(stream, request).await,
        }
    }

    async fn exchange<S>(&self, stream: S, request: &CallRequest) -> Result<Value, ServiceError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let codec = LengthDelimitedCodec::builder()
            .max_frame_length(MAX_FRAME_BYTES)
            .new_codec();
        let mut framed = Framed::new(stream, codec);

        let envelope = ServiceRequest::new(
            request.action.clone(),
            self.token.expose_secret(),
            request.body.clone(),
        );
        let payload = serde_json::to_vec(&envelope).map_err(|e| self.protocol(e.to_string()))?;
        framed.send(Bytes::from(payload)).await.map_err(|e| ServiceError::Io {
            endpoint: self.endpoint.clone(),
            source: e,
        })?;

        let frame = framed
            .next()
            .await
            .ok_or_else(|| self.protocol("connection closed before reply".to_string()))?
            .map_err(|e| ServiceError::Io {
                endpoint: self.endpoint.clone(),
                source: e,
            })?;

        let response: Response = serde_json::from_slice(&frame).map_err(|e| self.protocol(e.to_string()))?;
        response.into_result().map_err(|error| ServiceError::Remote {
            endpoint: self.endpoint.clone(),
            error,
        })
    }

    fn protocol(&self, message: String) -> ServiceError {
        ServiceError::Protocol {
            endpoint: self.endpoint.clone(),
            message,
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn call(&self, request: &CallRequest) -> Result<Value, ServiceError> {
        tracing::debug!(endpoint = %self.endpoint, action = %request.action, "service call");
        match tokio::time::timeout(self.call_timeout, self.call_inner(request)).await {
            Ok(result) => result,
            Err(_) => Err(ServiceError::Timeout {
                endpoint: self.endpoint.clone(),
                after_ms: self.call_timeout.as_millis() as u64,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_mock_records_and_replies() {
        let mock = MockTransport::new();
        mock.reply("poll", json!({"branches": []}));

        let reply = mock.call(&CallRequest::new("poll", json!({"repo_id": "r"}))).await.unwrap();
        assert_eq!(reply, json!({"branches": []}));
        assert_eq!(mock.calls()[0].body["repo_id"], "r");

        let unscripted = mock.call(&CallRequest::new("other", Value::Null)).await.unwrap();
        assert_eq!(unscripted, json!({}));
    }

    #[tokio::test]
    async fn test_mock_scripted_failure() {
        let mock = MockTransport::new();
        mock.fail("remove-all", RpcError::internal("db down"));

        let err = mock.call(&CallRequest::new("remove-all", json!({}))).await.unwrap_err();
        assert!(matches!(err, ServiceError::Remote { .. }));
    }

    #[tokio::test]
    async fn test_connection_refused_is_connect_error() {
        // Bind then drop to get a port nothing listens on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let transport = TcpTransport::new(
            &EndpointConfig::new("127.0.0.1", port, "t"),
            &TimeoutConfig::default(),
        )
        .unwrap();
        let err = transport.call(&CallRequest::new("poll", json!({}))).await.unwrap_err();
        assert!(matches!(err, ServiceError::Connect { .. }));
    }

    #[tokio::test]
    async fn test_plaintext_round_trip() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
            let frame = framed.next().await.unwrap().unwrap();
            let request: ServiceRequest = serde_json::from_slice(&frame).unwrap();
            let reply = Response::success("", json!({"action": request.action, "token": request.token}));
            framed
                .send(Bytes::from(serde_json::to_vec(&reply).unwrap()))
                .await
                .unwrap();
        });

        let transport = TcpTransport::new(
            &EndpointConfig::new("127.0.0.1", port, "secret-token"),
            &TimeoutConfig::default(),
        )
        .unwrap();
        let reply = transport.call(&CallRequest::new("get-secrets", json!({}))).await.unwrap();

        assert_eq!(reply["action"], "get-secrets");
        assert_eq!(reply["token"], "secret-token");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_silent_peer_times_out() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let _server = tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let endpoint = EndpointConfig::new("127.0.0.1", port, "t").with_call_timeout(Duration::from_millis(100));
        let transport = TcpTransport::new(&endpoint, &TimeoutConfig::default()).unwrap();
        let err = transport.call(&CallRequest::new("poll", json!({}))).await.unwrap_err();
        assert!(matches!(err, ServiceError::Timeout { after_ms: 100, .. }));
    }
}
