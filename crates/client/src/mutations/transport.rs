//! Mutation transport: the HTTP side of an optimistic mutation.

use std::time::Duration;

use async_trait::async_trait;
use chatsync_shared::{try_problem_detail, ApiError};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::session::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationMethod {
    Post,
    Patch,
}

impl MutationMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            MutationMethod::Post => "POST",
            MutationMethod::Patch => "PATCH",
        }
    }
}

/// One entity-scoped mutation request.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationCall {
    pub method: MutationMethod,
    pub path: String,
    pub body: Value,
}

/// `{ success, unverified?, message?, <entity-specific fields> }`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MutationResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub unverified: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl MutationResponse {
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn unverified() -> Self {
        Self {
            unverified: true,
            ..Self::default()
        }
    }

    pub fn with_field(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(name.to_string(), value.into());
        self
    }

    pub fn flag(&self, name: &str) -> Option<bool> {
        self.fields.get(name).and_then(Value::as_bool)
    }

    /// First integer field among `names`.
    pub fn count(&self, names: &[&str]) -> Option<i64> {
        names
            .iter()
            .find_map(|name| self.fields.get(*name).and_then(Value::as_i64))
    }
}

/// Executes mutation calls. Timeouts are the transport's job.
#[async_trait]
pub trait MutationTransport: Send + Sync + 'static {
    async fn execute(&self, call: &MutationCall) -> Result<MutationResponse, ApiError>;
}

/// Mutation transport over `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpMutationTransport {
    client: Client,
    base_url: String,
    session: Session,
}

impl HttpMutationTransport {
    pub fn new(
        base_url: impl Into<String>,
        timeout: Duration,
        session: Session,
    ) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ApiError::Network(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            session,
        })
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        let base = self.base_url.trim_end_matches('/');
        let path = path.trim_start_matches('/');
        format!("{base}/{path}")
    }
}

#[async_trait]
impl MutationTransport for HttpMutationTransport {
    async fn execute(&self, call: &MutationCall) -> Result<MutationResponse, ApiError> {
        let url = self.url(&call.path);
        let mut rb = match call.method {
            MutationMethod::Post => self.client.post(&url),
            MutationMethod::Patch => self.client.patch(&url),
        };
        if let Some(token) = self.session.token() {
            rb = rb.bearer_auth(token);
        }

        crate::log_debug!("{} {}", call.method.as_str(), url);
        let resp = rb
            .json(&call.body)
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;

        let status = resp.status().as_u16();
        let is_success = resp.status().is_success();
        let text = resp
            .text()
            .await
            .map_err(|e| ApiError::Network(format!("failed to read body: {e}")))?;

        if is_success {
            if text.trim().is_empty() {
                return Ok(MutationResponse::ok());
            }
            return serde_json::from_str(&text).map_err(|e| ApiError::Deserialize(e.to_string()));
        }

        if status == 401 || status == 403 {
            let mut response = MutationResponse::unverified();
            response.message = try_problem_detail(&text);
            return Ok(response);
        }

        // Endpoints may still answer a failure in the mutation shape.
        match serde_json::from_str::<MutationResponse>(&text) {
            Ok(mut response) if response.message.is_some() || response.unverified => {
                response.success = false;
                Ok(response)
            }
            _ => Err(ApiError::Http { status, body: text }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one canned response and return the raw request.
    async fn serve_once(status: &str, body: &str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let response = format!(
            "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
            body.len()
        );
        let task = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 8192];
            let mut request = Vec::new();
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request).to_string();
                if let Some(head_end) = text.find("\r\n\r\n") {
                    let length = text[..head_end]
                        .lines()
                        .find_map(|l| {
                            l.to_ascii_lowercase()
                                .strip_prefix("content-length:")
                                .map(|v| v.trim().parse::<usize>().unwrap_or(0))
                        })
                        .unwrap_or(0);
                    if request.len() >= head_end + 4 + length || n == 0 {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
            String::from_utf8_lossy(&request).to_string()
        });
        (base, task)
    }

    fn transport(base: &str) -> HttpMutationTransport {
        HttpMutationTransport::new(
            base,
            Duration::from_secs(5),
            Session::authenticated("alice", Some("tok".into())),
        )
        .unwrap()
    }

    fn like_call() -> MutationCall {
        MutationCall {
            method: MutationMethod::Post,
            path: "/api/posts/post-42/likes".into(),
            body: json!({}),
        }
    }

    #[test]
    fn response_helpers() {
        let resp: MutationResponse =
            serde_json::from_str(r#"{"success":true,"liked":true,"likes":11}"#).unwrap();
        assert!(resp.success);
        assert!(!resp.unverified);
        assert_eq!(resp.flag("liked"), Some(true));
        assert_eq!(resp.count(&["count", "likes"]), Some(11));
        assert_eq!(resp.count(&["count"]), None);
    }

    #[tokio::test]
    async fn success_body_is_parsed_and_request_is_authenticated() {
        let (base, server) = serve_once("200 OK", r#"{"success":true,"liked":true}"#).await;
        let resp = transport(&base).execute(&like_call()).await.unwrap();
        assert!(resp.success);
        assert_eq!(resp.flag("liked"), Some(true));

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /api/posts/post-42/likes"));
        assert!(request.to_ascii_lowercase().contains("authorization: bearer tok"));
    }

    #[tokio::test]
    async fn auth_failures_are_unverified() {
        let (base, _server) = serve_once(
            "401 Unauthorized",
            r#"{"type":"about:blank","title":"Unauthorized","status":401}"#,
        )
        .await;
        let resp = transport(&base).execute(&like_call()).await.unwrap();
        assert!(resp.unverified);
        assert_eq!(resp.message.as_deref(), Some("Unauthorized"));
    }

    #[tokio::test]
    async fn failure_in_mutation_shape_is_a_result() {
        let (base, _server) =
            serve_once("429 Too Many Requests", r#"{"success":false,"message":"rate limited"}"#).await;
        let resp = transport(&base).execute(&like_call()).await.unwrap();
        assert!(!resp.success);
        assert_eq!(resp.message.as_deref(), Some("rate limited"));
    }

    #[tokio::test]
    async fn other_failures_are_errors() {
        let (base, _server) = serve_once("500 Internal Server Error", "oops").await;
        let err = transport(&base).execute(&like_call()).await.unwrap_err();
        assert_eq!(
            err,
            ApiError::Http {
                status: 500,
                body: "oops".into()
            }
        );
    }
}
