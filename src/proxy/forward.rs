//! HTTP forwarding — sends the request to a selected upstream node

use crate::store::UpstreamNode;
use bytes::Bytes;
use std::time::Duration;

/// Headers that must not be forwarded in either direction
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Response from an upstream attempt
#[derive(Debug)]
pub struct ForwardOutcome {
    pub status: u16,
    pub headers: http::HeaderMap,
    pub body: Bytes,
}

/// Failure of one upstream attempt
#[derive(Debug)]
pub enum ForwardError {
    /// TCP connect failed; another node may succeed
    Connect(String),
    /// The node accepted but did not answer in time
    Timeout(String),
    /// Not worth retrying (malformed response, body read failure)
    Fatal(String),
}

impl ForwardError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ForwardError::Connect(_) | ForwardError::Timeout(_))
    }
}

impl std::fmt::Display for ForwardError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ForwardError::Connect(cause) => write!(f, "connect failed: {}", cause),
            ForwardError::Timeout(cause) => write!(f, "timed out: {}", cause),
            ForwardError::Fatal(cause) => write!(f, "upstream error: {}", cause),
        }
    }
}

/// Pooled client used for every upstream request
pub struct HttpForwarder {
    client: reqwest::Client,
}

impl HttpForwarder {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(100)
            .build()
            .unwrap_or_default();
        Self { client }
    }

    /// Forward one attempt to `node`
    pub async fn forward(
        &self,
        node: &UpstreamNode,
        method: &http::Method,
        path_and_query: &str,
        headers: &http::HeaderMap,
        host_override: Option<&str>,
        body: Bytes,
        timeout: Duration,
    ) -> Result<ForwardOutcome, ForwardError> {
        let url = format!("http://{}:{}{}", node.host, node.port, path_and_query);

        let mut request = self
            .client
            .request(method.clone(), &url)
            .timeout(timeout)
            .body(body);

        for (name, value) in headers {
            if is_hop_by_hop(name.as_str()) || name == &http::header::HOST {
                continue;
            }
            request = request.header(name, value);
        }
        if let Some(host) = host_override {
            request = request.header(http::header::HOST, host);
        }

        let response = request.send().await.map_err(classify)?;

        let status = response.status().as_u16();
        let mut resp_headers = http::HeaderMap::new();
        for (name, value) in response.headers() {
            if !is_hop_by_hop(name.as_str()) {
                resp_headers.insert(name.clone(), value.clone());
            }
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| ForwardError::Fatal(e.to_string()))?;

        Ok(ForwardOutcome {
            status,
            headers: resp_headers,
            body,
        })
    }
}

impl Default for HttpForwarder {
    fn default() -> Self {
        Self::new()
    }
}

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

fn classify(e: reqwest::Error) -> ForwardError {
    if e.is_timeout() {
        ForwardError::Timeout(e.to_string())
    } else if e.is_connect() {
        ForwardError::Connect(e.to_string())
    } else {
        ForwardError::Fatal(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn node(host: &str, port: u16) -> UpstreamNode {
        UpstreamNode {
            host: host.to_string(),
            port,
            weight: 1,
        }
    }

    async fn spawn_backend(response: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let (mut stream, _) = match listener.accept().await {
                    Ok(s) => s,
                    Err(_) => break,
                };
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 8192];
                    let _ = stream.read(&mut buf).await;
                    let _ = stream.write_all(response.as_bytes()).await;
                    let _ = stream.shutdown().await;
                });
            }
        });
        port
    }

    #[test]
    fn test_hop_by_hop_detection() {
        assert!(is_hop_by_hop("Connection"));
        assert!(is_hop_by_hop("transfer-encoding"));
        assert!(!is_hop_by_hop("content-type"));
        assert!(!is_hop_by_hop("x-custom"));
    }

    #[tokio::test]
    async fn test_forward_success() {
        let port = spawn_backend(
            "HTTP/1.1 200 OK\r\nContent-Length: 11\r\nX-Backend: b1\r\nConnection: close\r\n\r\nhello world",
        )
        .await;

        let forwarder = HttpForwarder::new();
        let outcome = forwarder
            .forward(
                &node("127.0.0.1", port),
                &http::Method::GET,
                "/hello",
                &http::HeaderMap::new(),
                None,
                Bytes::new(),
                Duration::from_secs(5),
            )
            .await
            .unwrap();

        assert_eq!(outcome.status, 200);
        assert_eq!(outcome.body, Bytes::from("hello world"));
        assert_eq!(outcome.headers.get("x-backend").unwrap(), "b1");
        // Hop-by-hop headers do not pass through
        assert!(outcome.headers.get("connection").is_none());
    }

    #[tokio::test]
    async fn test_forward_connect_refused_is_retryable() {
        let forwarder = HttpForwarder::new();
        let err = forwarder
            .forward(
                &node("127.0.0.1", 1),
                &http::Method::GET,
                "/",
                &http::HeaderMap::new(),
                None,
                Bytes::new(),
                Duration::from_secs(2),
            )
            .await
            .unwrap_err();

        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_forward_timeout_is_retryable() {
        // A listener that accepts and never answers
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    drop(stream);
                });
            }
        });

        let forwarder = HttpForwarder::new();
        let err = forwarder
            .forward(
                &node("127.0.0.1", port),
                &http::Method::GET,
                "/",
                &http::HeaderMap::new(),
                None,
                Bytes::new(),
                Duration::from_millis(200),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ForwardError::Timeout(_)));
        assert!(err.is_retryable());
    }
}
