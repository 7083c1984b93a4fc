/// Outbound calls to backend targets
use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use log::debug;
use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;

/// Headers that describe a single connection and are never passed on
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub const X_FORWARDED_FOR: &str = "x-forwarded-for";
pub const X_REQUEST_ID: &str = "x-request-id";

/// Request handed to the forwarder after transformation
#[derive(Debug, Clone)]
pub struct ForwardRequest {
    pub method: Method,
    /// Path plus query string, appended to the backend base URL
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub client_ip: IpAddr,
    pub request_id: String,
}

/// Normalized backend response
#[derive(Debug, Clone)]
pub struct BackendResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Classified backend failure
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("backend did not respond within {0:?}")]
    Timeout(Duration),

    #[error("backend unreachable: {0}")]
    ConnectionRefused(String),

    #[error("backend returned {status}")]
    Backend5xx {
        status: StatusCode,
        response: BackendResponse,
    },

    #[error("malformed backend response: {0}")]
    MalformedResponse(String),
}

impl ForwardError {
    /// Metric label for the failure class
    pub fn kind(&self) -> &'static str {
        match self {
            ForwardError::Timeout(_) => "timeout",
            ForwardError::ConnectionRefused(_) => "connection_refused",
            ForwardError::Backend5xx { .. } => "backend_5xx",
            ForwardError::MalformedResponse(_) => "malformed_response",
        }
    }
}

/// Single-attempt outbound call; implementations never retry
#[async_trait]
pub trait Forwarder: Send + Sync {
    async fn forward(
        &self,
        target: &str,
        request: ForwardRequest,
        timeout: Duration,
    ) -> Result<BackendResponse, ForwardError>;
}

/// Forwarder backed by a pooled reqwest client
#[derive(Debug, Clone)]
pub struct HttpForwarder {
    client: reqwest::Client,
}

impl HttpForwarder {
    pub fn new() -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(100)
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .build()?;

        Ok(Self { client })
    }

    async fn send(
        &self,
        url: &str,
        request: ForwardRequest,
        timeout: Duration,
    ) -> Result<BackendResponse, ForwardError> {
        let headers = upstream_headers(&request);

        let response = self
            .client
            .request(request.method, url)
            .headers(headers)
            .body(request.body)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| classify(e, timeout))?;

        let status = response.status();
        let headers = strip_hop_by_hop(response.headers());
        let body = response.bytes().await.map_err(|e| classify(e, timeout))?;

        Ok(BackendResponse {
            status,
            headers,
            body,
        })
    }
}

#[async_trait]
impl Forwarder for HttpForwarder {
    async fn forward(
        &self,
        target: &str,
        request: ForwardRequest,
        timeout: Duration,
    ) -> Result<BackendResponse, ForwardError> {
        let url = format!("{}{}", target.trim_end_matches('/'), request.path_and_query);
        debug!("Forwarding {} {}", request.method, url);

        let response = match tokio::time::timeout(timeout, self.send(&url, request, timeout)).await
        {
            Ok(result) => result?,
            Err(_) => return Err(ForwardError::Timeout(timeout)),
        };

        if response.status.is_server_error() {
            return Err(ForwardError::Backend5xx {
                status: response.status,
                response,
            });
        }

        Ok(response)
    }
}

fn classify(error: reqwest::Error, timeout: Duration) -> ForwardError {
    if error.is_timeout() {
        ForwardError::Timeout(timeout)
    } else if error.is_connect() {
        ForwardError::ConnectionRefused(error.to_string())
    } else {
        ForwardError::MalformedResponse(error.to_string())
    }
}

pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}

/// Copy headers, dropping hop-by-hop ones and any named by `Connection`
pub fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    let named_by_connection: Vec<String> = headers
        .get_all(http::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|v| v.trim().to_ascii_lowercase())
        .filter(|v| !v.is_empty())
        .collect();

    let mut filtered = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let name_str = name.as_str();
        if is_hop_by_hop(name_str) || named_by_connection.iter().any(|c| c == name_str) {
            continue;
        }
        filtered.append(name.clone(), value.clone());
    }
    filtered
}

/// Headers for the backend call. Host and Content-Length are recomputed by
/// the client since the body may have been rewritten.
fn upstream_headers(request: &ForwardRequest) -> HeaderMap {
    let mut headers = strip_hop_by_hop(&request.headers);
    headers.remove(http::header::HOST);
    headers.remove(http::header::CONTENT_LENGTH);

    let client_ip = request.client_ip.to_string();
    let forwarded_for = match headers
        .get(X_FORWARDED_FOR)
        .and_then(|v| v.to_str().ok())
    {
        Some(existing) if !existing.trim().is_empty() => format!("{}, {}", existing, client_ip),
        _ => client_ip,
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
        headers.insert(HeaderName::from_static(X_FORWARDED_FOR), value);
    }

    if let Ok(value) = HeaderValue::from_str(&request.request_id) {
        headers.insert(HeaderName::from_static(X_REQUEST_ID), value);
    }

    headers
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddr};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    const OK_RESPONSE: &str = "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 11\r\nConnection: close\r\n\r\n{\"ok\":true}";
    const UNAVAILABLE_RESPONSE: &str =
        "HTTP/1.1 503 Service Unavailable\r\nContent-Length: 4\r\nConnection: close\r\n\r\ndown";

    /// Accept one connection, report the request head and reply with `response`
    async fn serve_once(response: &'static str) -> (SocketAddr, oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                let mut received = Vec::new();
                let mut buf = [0u8; 1024];
                while !received.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => received.extend_from_slice(&buf[..n]),
                    }
                }
                let _ = tx.send(String::from_utf8_lossy(&received).to_string());
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });

        (addr, rx)
    }

    fn request(path: &str) -> ForwardRequest {
        let mut headers = HeaderMap::new();
        headers.insert("accept", HeaderValue::from_static("application/json"));
        headers.insert("connection", HeaderValue::from_static("keep-alive, x-secret"));
        headers.insert("x-secret", HeaderValue::from_static("hop"));
        headers.insert(X_FORWARDED_FOR, HeaderValue::from_static("203.0.113.9"));

        ForwardRequest {
            method: Method::GET,
            path_and_query: path.to_string(),
            headers,
            body: Bytes::new(),
            client_ip: IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3)),
            request_id: "req-123".to_string(),
        }
    }

    #[tokio::test]
    async fn test_forward_success() {
        let (addr, head) = serve_once(OK_RESPONSE).await;
        let forwarder = HttpForwarder::new().unwrap();

        let response = forwarder
            .forward(
                &format!("http://{}/", addr),
                request("/api/users/1?full=true"),
                Duration::from_secs(5),
            )
            .await
            .unwrap();

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.body, Bytes::from_static(b"{\"ok\":true}"));
        assert!(response.headers.get("connection").is_none());

        let head = head.await.unwrap().to_ascii_lowercase();
        assert!(head.starts_with("get /api/users/1?full=true http/1.1"));
        assert!(head.contains("x-forwarded-for: 203.0.113.9, 10.1.2.3"));
        assert!(head.contains("x-request-id: req-123"));
        assert!(!head.contains("x-secret"));
    }

    #[tokio::test]
    async fn test_forward_classifies_5xx() {
        let (addr, _head) = serve_once(UNAVAILABLE_RESPONSE).await;
        let forwarder = HttpForwarder::new().unwrap();

        let err = forwarder
            .forward(&format!("http://{}", addr), request("/"), Duration::from_secs(5))
            .await
            .unwrap_err();

        match err {
            ForwardError::Backend5xx { status, response } => {
                assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
                assert_eq!(response.body, Bytes::from_static(b"down"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_forward_classifies_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let forwarder = HttpForwarder::new().unwrap();
        let err = forwarder
            .forward(&format!("http://{}", addr), request("/"), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "connection_refused");
    }

    #[tokio::test]
    async fn test_forward_classifies_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((socket, _)) = listener.accept().await {
                tokio::time::sleep(Duration::from_secs(5)).await;
                drop(socket);
            }
        });

        let forwarder = HttpForwarder::new().unwrap();
        let err = forwarder
            .forward(
                &format!("http://{}", addr),
                request("/"),
                Duration::from_millis(100),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ForwardError::Timeout(_)));
    }

    #[test]
    fn test_strip_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("connection", HeaderValue::from_static("close"));
        headers.insert("content-type", HeaderValue::from_static("text/plain"));
        headers.append("set-cookie", HeaderValue::from_static("a=1"));
        headers.append("set-cookie", HeaderValue::from_static("b=2"));

        let filtered = strip_hop_by_hop(&headers);
        assert!(filtered.get("transfer-encoding").is_none());
        assert!(filtered.get("connection").is_none());
        assert_eq!(filtered.get_all("set-cookie").iter().count(), 2);
        assert_eq!(filtered.get("content-type").unwrap(), "text/plain");
    }
}
