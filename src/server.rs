/// HTTP/1.1 listener adapter around the gateway core
use anyhow::{Context, Result};
use bytes::Bytes;
use http::{header, HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use log::{debug, error, info, warn};
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::gateway::{ApiGateway, GatewayRequest, GatewayResponse};
use crate::metrics::PrometheusMetrics;

/// Serves the gateway and, optionally, the Prometheus exposition endpoint
pub struct GatewayServer {
    gateway: Arc<ApiGateway>,
    metrics: Option<Arc<PrometheusMetrics>>,
}

impl GatewayServer {
    pub fn new(gateway: Arc<ApiGateway>, metrics: Option<Arc<PrometheusMetrics>>) -> Self {
        Self { gateway, metrics }
    }

    /// Bind the configured addresses and serve until `shutdown` resolves
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let (http_addr, metrics_addr, metrics_path) = {
            let config = self.gateway.config();
            (
                config.server.http_addr,
                config.metrics.metrics_addr,
                config.metrics.metrics_path.clone(),
            )
        };

        let listener = TcpListener::bind(http_addr)
            .await
            .with_context(|| format!("Failed to bind to {}", http_addr))?;
        info!("HTTP server listening on {}", http_addr);

        let metrics_listener = match (&self.metrics, metrics_addr) {
            (Some(_), Some(addr)) => {
                let listener = TcpListener::bind(addr)
                    .await
                    .with_context(|| format!("Failed to bind metrics listener to {}", addr))?;
                info!("Metrics available at http://{}{}", addr, metrics_path);
                Some(listener)
            }
            _ => None,
        };

        self.serve(listener, metrics_listener, shutdown).await
    }

    /// Serve on already bound listeners
    pub async fn serve(
        self,
        listener: TcpListener,
        metrics_listener: Option<TcpListener>,
        shutdown: impl Future<Output = ()>,
    ) -> Result<()> {
        let config = self.gateway.config();
        let max_body = config.server.max_request_body;
        let shutdown_timeout = config.server.shutdown_timeout;
        let purge_interval = config.store.purge_interval;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut connections = JoinSet::new();

        let janitor = {
            let gateway = self.gateway.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(purge_interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    gateway.purge_expired();
                }
            })
        };

        let metrics_task = match (self.metrics.clone(), metrics_listener) {
            (Some(metrics), Some(listener)) => Some(tokio::spawn(serve_metrics(
                metrics,
                config.metrics.metrics_path.clone(),
                listener,
                shutdown_rx.clone(),
            ))),
            _ => None,
        };

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, remote_addr)) => {
                            let gateway = self.gateway.clone();
                            let shutdown_rx = shutdown_rx.clone();
                            connections.spawn(async move {
                                if let Err(e) =
                                    serve_connection(gateway, stream, remote_addr, max_body, shutdown_rx).await
                                {
                                    debug!("Connection error from {}: {}", remote_addr, e);
                                }
                            });
                        }
                        Err(e) => error!("Failed to accept connection: {}", e),
                    }
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                _ = &mut shutdown => {
                    info!("Shutdown signal received, stopping listener");
                    break;
                }
            }
        }

        let _ = shutdown_tx.send(true);
        janitor.abort();

        info!(
            "Waiting up to {:?} for {} connections to close",
            shutdown_timeout,
            connections.len()
        );
        let drain = async { while connections.join_next().await.is_some() {} };
        if tokio::time::timeout(shutdown_timeout, drain).await.is_err() {
            warn!(
                "Shutdown timeout reached, {} connections still active",
                connections.len()
            );
            connections.abort_all();
        }

        if let Some(task) = metrics_task {
            let _ = task.await;
        }

        info!("Server stopped");
        Ok(())
    }
}

async fn serve_connection(
    gateway: Arc<ApiGateway>,
    stream: TcpStream,
    remote_addr: SocketAddr,
    max_body: usize,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), hyper::Error> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req: Request<Incoming>| {
        let gateway = gateway.clone();
        async move { handle_request(gateway, req, remote_addr, max_body).await }
    });

    let conn = http1::Builder::new().serve_connection(io, service);
    tokio::pin!(conn);

    tokio::select! {
        result = conn.as_mut() => result,
        _ = shutdown.changed() => {
            conn.as_mut().graceful_shutdown();
            conn.await
        }
    }
}

async fn handle_request(
    gateway: Arc<ApiGateway>,
    req: Request<Incoming>,
    remote_addr: SocketAddr,
    max_body: usize,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let (parts, body) = req.into_parts();

    let (body, unreadable) = match Limited::new(body, max_body).collect().await {
        Ok(collected) => (collected.to_bytes(), None),
        Err(e) => (Bytes::new(), Some(e.to_string())),
    };

    let request = GatewayRequest::new(
        parts.method,
        parts.uri.path(),
        parts.uri.query(),
        parts.headers,
        body,
        remote_addr.ip(),
    );

    let response = match unreadable {
        Some(reason) => {
            warn!("Rejected request body from {}: {}", remote_addr, reason);
            gateway.reject_malformed(
                &request,
                format!("request body is too large or could not be read: {}", reason),
            )
        }
        None => gateway.handle(request).await,
    };

    Ok(into_http_response(response))
}

fn into_http_response(response: GatewayResponse) -> Response<Full<Bytes>> {
    let mut http_response = Response::new(Full::new(response.body));
    *http_response.status_mut() = response.status;
    *http_response.headers_mut() = response.headers;
    http_response
}

fn plain_response(status: StatusCode, message: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(message.as_bytes())));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}

async fn serve_metrics(
    metrics: Arc<PrometheusMetrics>,
    path: String,
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
) {
    let path: Arc<str> = Arc::from(path);

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, remote_addr)) => {
                        let metrics = metrics.clone();
                        let path = path.clone();
                        tokio::spawn(async move {
                            let service = service_fn(move |req: Request<Incoming>| {
                                let response = metrics_response(&metrics, &path, &req);
                                async move { Ok::<_, Infallible>(response) }
                            });
                            if let Err(e) = http1::Builder::new()
                                .serve_connection(TokioIo::new(stream), service)
                                .await
                            {
                                debug!("Metrics connection error from {}: {}", remote_addr, e);
                            }
                        });
                    }
                    Err(e) => error!("Failed to accept metrics connection: {}", e),
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

fn metrics_response(
    metrics: &PrometheusMetrics,
    path: &str,
    req: &Request<Incoming>,
) -> Response<Full<Bytes>> {
    if req.method() != Method::GET || req.uri().path() != path {
        return plain_response(StatusCode::NOT_FOUND, "not found");
    }

    match metrics.export_metrics() {
        Ok(text) => {
            let mut response = Response::new(Full::new(Bytes::from(text)));
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            response
        }
        Err(e) => {
            error!("Failed to export metrics: {}", e);
            plain_response(StatusCode::INTERNAL_SERVER_ERROR, "metrics unavailable")
        }
    }
}
