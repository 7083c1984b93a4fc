/// Core request pipeline of the gateway
use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use bytes::Bytes;
use http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use log::{debug, info, warn};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::{
    auth::{AllowAll, ApiKeyAuthorizer, AuthDecision, Authorizer},
    cache::{CacheStatus, ResponseCache},
    clock::{Clock, SystemClock},
    config::{validate_routes, Config, RouteConfig},
    error::GatewayError,
    forwarder::{
        BackendResponse, ForwardError, ForwardRequest, Forwarder, HttpForwarder, X_REQUEST_ID,
    },
    load_balancer::LoadBalancer,
    metrics::{
        MetricEvent, MetricSink, NoopSink, TAG_BACKEND_ERROR, TAG_CACHE_STORE, TAG_ERROR,
        TAG_RATELIMIT_STORE,
    },
    rate_limiter::{RateLimitDecision, RateLimiter},
    routes::{Route, RouteManager},
    store::{CacheStore, CounterStore, MemoryCacheStore, MemoryCounterStore},
    transform::{transform_request, transform_response},
};

pub const X_RESPONSE_TIME: &str = "x-response-time";
pub const X_CACHE: &str = "x-cache";
pub const X_RATELIMIT_LIMIT: &str = "x-ratelimit-limit";
pub const X_RATELIMIT_REMAINING: &str = "x-ratelimit-remaining";
pub const X_RATELIMIT_RESET: &str = "x-ratelimit-reset";

/// Normalized inbound request handed over by the listener
#[derive(Debug, Clone)]
pub struct GatewayRequest {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub client_ip: IpAddr,
}

impl GatewayRequest {
    pub fn new(
        method: Method,
        path: impl Into<String>,
        query: Option<&str>,
        headers: HeaderMap,
        body: Bytes,
        client_ip: IpAddr,
    ) -> Self {
        Self {
            method,
            path: path.into(),
            query: query.map(str::to_string),
            headers,
            body,
            client_ip,
        }
    }

    pub fn path_and_query(&self) -> String {
        match self.query.as_deref() {
            Some(query) if !query.is_empty() => format!("{}?{}", self.path, query),
            _ => self.path.clone(),
        }
    }
}

/// Response produced for every request, successful or not
#[derive(Debug, Clone)]
pub struct GatewayResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl GatewayResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    fn from_backend(mut response: BackendResponse) -> Self {
        // The listener frames the body itself
        response.headers.remove(header::CONTENT_LENGTH);
        Self {
            status: response.status,
            headers: response.headers,
            body: response.body,
        }
    }

    fn error(error: &GatewayError) -> Self {
        let body = serde_json::json!({
            "error": error.code(),
            "message": error.to_string(),
        });

        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );

        Self {
            status: error.status(),
            headers,
            body: Bytes::from(body.to_string()),
        }
    }
}

/// Request context that carries information throughout the request lifecycle
#[derive(Debug)]
pub struct RequestContext {
    /// Unique request ID for tracing
    pub request_id: String,
    /// Request start time
    pub started_at: Instant,
    /// Route that matched this request
    pub route: Option<Arc<Route>>,
    /// Rate limit identifier
    pub identifier: Option<String>,
    /// Backend target the request was forwarded to
    pub backend: Option<String>,
    pub rate_limit: Option<RateLimitDecision>,
    pub rate_limited: bool,
    pub cache_status: Option<CacheStatus>,
    /// Metric tags collected along the way
    pub tags: Vec<(String, String)>,
}

impl RequestContext {
    pub fn new(request_id: String) -> Self {
        Self {
            request_id,
            started_at: Instant::now(),
            route: None,
            identifier: None,
            backend: None,
            rate_limit: None,
            rate_limited: false,
            cache_status: None,
            tags: Vec::new(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn tag(&mut self, key: &str, value: impl Into<String>) {
        self.tags.push((key.to_string(), value.into()));
    }

    /// What is left of the route's end-to-end deadline
    pub fn remaining_budget(&self) -> Option<Duration> {
        self.route
            .as_ref()
            .map(|route| route.config.timeout.saturating_sub(self.elapsed()))
    }
}

/// Routes and their backend state, swapped as one unit on reload
struct RouteSnapshot {
    routes: RouteManager,
    balancer: LoadBalancer,
}

impl RouteSnapshot {
    fn build(routes: &[RouteConfig], failure_threshold: u32) -> Result<Self> {
        let routes = RouteManager::new(routes)?;
        let balancer = LoadBalancer::new(routes.get_routes(), failure_threshold)?;
        Ok(Self { routes, balancer })
    }
}

/// Assembles a gateway, defaulting every collaborator that is not supplied
pub struct GatewayBuilder {
    config: Arc<Config>,
    clock: Option<Arc<dyn Clock>>,
    counter_store: Option<Arc<dyn CounterStore>>,
    cache_store: Option<Arc<dyn CacheStore>>,
    forwarder: Option<Arc<dyn Forwarder>>,
    authorizer: Option<Arc<dyn Authorizer>>,
    metric_sink: Option<Arc<dyn MetricSink>>,
}

impl GatewayBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn counter_store(mut self, store: Arc<dyn CounterStore>) -> Self {
        self.counter_store = Some(store);
        self
    }

    pub fn cache_store(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.cache_store = Some(store);
        self
    }

    pub fn forwarder(mut self, forwarder: Arc<dyn Forwarder>) -> Self {
        self.forwarder = Some(forwarder);
        self
    }

    pub fn authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = Some(authorizer);
        self
    }

    pub fn metric_sink(mut self, sink: Arc<dyn MetricSink>) -> Self {
        self.metric_sink = Some(sink);
        self
    }

    pub fn build(self) -> Result<ApiGateway> {
        let config = self.config;
        config.validate()?;

        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock) as Arc<dyn Clock>);
        let counter_store = self.counter_store.unwrap_or_else(|| {
            Arc::new(MemoryCounterStore::new(clock.clone())) as Arc<dyn CounterStore>
        });
        let cache_store = self.cache_store.unwrap_or_else(|| {
            Arc::new(MemoryCacheStore::new(
                config.store.max_cache_entries,
                clock.clone(),
            )) as Arc<dyn CacheStore>
        });
        let forwarder = match self.forwarder {
            Some(forwarder) => forwarder,
            None => Arc::new(HttpForwarder::new().context("Failed to build HTTP client")?),
        };
        let authorizer = self
            .authorizer
            .unwrap_or_else(|| default_authorizer(&config));
        let metric_sink = self
            .metric_sink
            .unwrap_or_else(|| Arc::new(NoopSink) as Arc<dyn MetricSink>);

        let snapshot = RouteSnapshot::build(&config.routes, config.load_balancing.failure_threshold)?;
        info!("Gateway initialized with {} routes", snapshot.routes.route_count());

        let operation_timeout = config.store.operation_timeout;
        Ok(ApiGateway {
            rate_limiter: RateLimiter::new(counter_store, clock.clone(), operation_timeout),
            cache: ResponseCache::new(
                cache_store,
                clock.clone(),
                operation_timeout,
                config.store.max_cached_body,
            ),
            snapshot: ArcSwap::from_pointee(snapshot),
            config,
            clock,
            forwarder,
            authorizer,
            metric_sink,
            request_counter: AtomicU64::new(0),
        })
    }
}

fn default_authorizer(config: &Config) -> Arc<dyn Authorizer> {
    if config.auth.required || !config.auth.api_keys.is_empty() {
        Arc::new(ApiKeyAuthorizer::new(&config.auth))
    } else {
        Arc::new(AllowAll)
    }
}

/// The gateway core: a listener-agnostic request pipeline
pub struct ApiGateway {
    config: Arc<Config>,
    snapshot: ArcSwap<RouteSnapshot>,
    clock: Arc<dyn Clock>,
    rate_limiter: RateLimiter,
    cache: ResponseCache,
    forwarder: Arc<dyn Forwarder>,
    authorizer: Arc<dyn Authorizer>,
    metric_sink: Arc<dyn MetricSink>,
    request_counter: AtomicU64,
}

impl ApiGateway {
    /// Create a gateway with in-memory stores and the HTTP forwarder
    pub fn new(config: Arc<Config>) -> Result<Self> {
        Self::builder(config).build()
    }

    pub fn builder(config: Arc<Config>) -> GatewayBuilder {
        GatewayBuilder {
            config,
            clock: None,
            counter_store: None,
            cache_store: None,
            forwarder: None,
            authorizer: None,
            metric_sink: None,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn route_count(&self) -> usize {
        self.snapshot.load().routes.route_count()
    }

    /// Replace the route table. Backend counters start over; requests in
    /// flight finish on the snapshot they started with.
    pub fn reload(&self, routes: &[RouteConfig]) -> Result<()> {
        validate_routes(routes)?;
        let snapshot = RouteSnapshot::build(routes, self.config.load_balancing.failure_threshold)?;
        let count = snapshot.routes.route_count();
        self.snapshot.store(Arc::new(snapshot));
        info!("Reloaded route table with {} routes", count);
        Ok(())
    }

    /// Drop expired rate limit windows
    pub fn purge_expired(&self) {
        self.rate_limiter.purge_expired();
    }

    /// Run one request through the pipeline. Every exit emits exactly one
    /// metric event.
    pub async fn handle(&self, request: GatewayRequest) -> GatewayResponse {
        let snapshot = self.snapshot.load_full();
        let mut ctx = RequestContext::new(self.request_id_for(&request));
        let method = request.method.clone();
        let path = request.path.clone();

        let outcome = self.process(&snapshot, &mut ctx, request).await;
        self.finish(&mut ctx, outcome, &method, &path)
    }

    /// Answer a request whose body the listener could not read. Goes through
    /// the same exit path as `handle`, so it is decorated, counted and logged.
    pub fn reject_malformed(
        &self,
        request: &GatewayRequest,
        reason: impl Into<String>,
    ) -> GatewayResponse {
        let mut ctx = RequestContext::new(self.request_id_for(request));
        let outcome = Err(GatewayError::MalformedRequest(reason.into()));
        self.finish(&mut ctx, outcome, &request.method, &request.path)
    }

    /// Open connections currently leased across a route's backends
    pub fn open_connections(&self, route_name: &str) -> Option<usize> {
        self.snapshot.load().balancer.pool(route_name).map(|pool| {
            pool.backends()
                .iter()
                .map(|backend| backend.open_connections())
                .sum()
        })
    }

    fn finish(
        &self,
        ctx: &mut RequestContext,
        outcome: Result<GatewayResponse, GatewayError>,
        method: &Method,
        path: &str,
    ) -> GatewayResponse {
        let mut response = match outcome {
            Ok(response) => response,
            Err(e) => self.error_response(ctx, &e),
        };

        let latency = ctx.elapsed();
        self.decorate(ctx, &mut response, latency);
        self.emit_metrics(ctx, &response, latency);
        log_completion(ctx, method, path, response.status, latency);

        response
    }

    async fn process(
        &self,
        snapshot: &RouteSnapshot,
        ctx: &mut RequestContext,
        request: GatewayRequest,
    ) -> Result<GatewayResponse, GatewayError> {
        if !request.path.starts_with('/') {
            return Err(GatewayError::MalformedRequest(format!(
                "path '{}' must start with '/'",
                request.path
            )));
        }
        if request.body.len() > self.config.server.max_request_body {
            return Err(GatewayError::MalformedRequest(format!(
                "body of {} bytes exceeds the {} byte limit",
                request.body.len(),
                self.config.server.max_request_body
            )));
        }

        let route = snapshot
            .routes
            .find_route(&request.method, &request.path)
            .ok_or_else(|| GatewayError::RouteNotFound {
                method: request.method.to_string(),
                path: request.path.clone(),
            })?;
        ctx.route = Some(route.clone());

        // Authorization
        let identity = match self.authorizer.authorize(&request).await {
            AuthDecision::Allow(identity) => identity,
            AuthDecision::Deny { status, reason } => {
                return Err(GatewayError::Unauthorized { status, reason });
            }
        };
        if let Some(scope) = identity.missing_scope(&route.config.scopes) {
            return Err(GatewayError::Unauthorized {
                status: StatusCode::FORBIDDEN,
                reason: format!("missing required scope '{}'", scope),
            });
        }
        let identifier = identity.rate_limit_key(request.client_ip);

        // Rate limiting
        if let Some(decision) = self
            .rate_limiter
            .allow(&identifier, &route, ctx.remaining_budget())
            .await
        {
            ctx.rate_limit = Some(decision);
            if decision.degraded {
                ctx.tag(TAG_RATELIMIT_STORE, "degraded");
            }
            if !decision.allowed {
                ctx.rate_limited = true;
                ctx.identifier = Some(identifier);
                return Err(GatewayError::RateLimited {
                    limit: decision.limit,
                    reset_at: decision.reset_at,
                    retry_after_secs: decision.retry_after_secs(self.clock.now_secs()),
                });
            }
        }
        ctx.identifier = Some(identifier);

        // Cache lookup
        let signature = route
            .is_cache_enabled_for_method(&request.method)
            .then(|| ResponseCache::signature(&route, &request));
        if let Some(signature) = &signature {
            match self.cache.get(signature, ctx.remaining_budget()).await {
                Ok(Some(entry)) => {
                    ctx.cache_status = Some(CacheStatus::Hit);
                    let mut response = GatewayResponse::from_backend(entry.to_response());
                    set_header(
                        &mut response.headers,
                        "age",
                        entry.age_secs(self.clock.now_millis()),
                    );
                    return Ok(response);
                }
                Ok(None) => ctx.cache_status = Some(CacheStatus::Miss),
                Err(e) => {
                    warn!(
                        "Cache store unavailable for request {}, treating as miss: {}",
                        ctx.request_id, e
                    );
                    ctx.tag(TAG_CACHE_STORE, "unavailable");
                    ctx.cache_status = Some(CacheStatus::Miss);
                }
            }
        }

        // Backend selection
        let lease = snapshot
            .balancer
            .pick(&route, request.client_ip)
            .ok_or_else(|| {
                ForwardError::ConnectionRefused(format!(
                    "no backend pool for route '{}'",
                    route.name()
                ))
            })?;
        ctx.backend = Some(lease.target().to_string());

        let forward_request = ForwardRequest {
            path_and_query: request.path_and_query(),
            body: transform_request(&request.body, route.request_rules()),
            method: request.method,
            headers: request.headers,
            client_ip: request.client_ip,
            request_id: ctx.request_id.clone(),
        };

        // Forwarding, bounded by what is left of the deadline
        let route_timeout = route.config.timeout;
        let budget = ctx.remaining_budget().unwrap_or(route_timeout);
        let outcome = if budget.is_zero() {
            Err(ForwardError::Timeout(route_timeout))
        } else {
            match tokio::time::timeout(
                budget,
                self.forwarder.forward(lease.target(), forward_request, budget),
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(_) => Err(ForwardError::Timeout(route_timeout)),
            }
        };
        lease.record_outcome(outcome.is_ok());
        lease.release();

        let mut backend_response = match outcome {
            Ok(response) => response,
            Err(e) => {
                warn!(
                    "Backend {} failed for request {}: {}",
                    ctx.backend.as_deref().unwrap_or("-"),
                    ctx.request_id,
                    e
                );
                ctx.tag(TAG_BACKEND_ERROR, e.kind());
                return Err(e.into());
            }
        };

        backend_response.body = transform_response(&backend_response.body, route.response_rules());
        backend_response.headers.remove(header::CONTENT_LENGTH);

        // Cache population
        if let (Some(signature), Some(policy)) = (&signature, route.cache_policy()) {
            match self
                .cache
                .put(signature, &backend_response, policy.ttl, ctx.remaining_budget())
                .await
            {
                Ok(true) => {}
                Ok(false) => debug!("Response for request {} is not cacheable", ctx.request_id),
                Err(e) => {
                    warn!("Failed to cache response for request {}: {}", ctx.request_id, e);
                    ctx.tag(TAG_CACHE_STORE, "unavailable");
                }
            }
        }

        Ok(GatewayResponse::from_backend(backend_response))
    }

    fn error_response(&self, ctx: &mut RequestContext, error: &GatewayError) -> GatewayResponse {
        ctx.tag(TAG_ERROR, error.code());
        let mut response = GatewayResponse::error(error);

        if let GatewayError::RateLimited {
            retry_after_secs, ..
        } = error
        {
            set_header(&mut response.headers, "retry-after", retry_after_secs);
        }

        response
    }

    /// Headers added on every exit path
    fn decorate(&self, ctx: &RequestContext, response: &mut GatewayResponse, latency: Duration) {
        let headers = &mut response.headers;
        set_header(headers, X_REQUEST_ID, &ctx.request_id);
        set_header(headers, X_RESPONSE_TIME, format!("{}ms", latency.as_millis()));

        if let Some(decision) = &ctx.rate_limit {
            set_header(headers, X_RATELIMIT_LIMIT, decision.limit);
            set_header(headers, X_RATELIMIT_REMAINING, decision.remaining);
            set_header(headers, X_RATELIMIT_RESET, decision.reset_at);
        }

        if let Some(status) = ctx.cache_status {
            set_header(headers, X_CACHE, status.as_str());
        }
    }

    fn emit_metrics(&self, ctx: &RequestContext, response: &GatewayResponse, latency: Duration) {
        let event = MetricEvent {
            route: ctx.route.as_ref().map(|r| r.name().to_string()),
            status: response.status.as_u16(),
            latency,
            cache_hit: ctx.cache_status == Some(CacheStatus::Hit),
            rate_limited: ctx.rate_limited,
            backend: ctx.backend.clone(),
            tags: ctx.tags.clone(),
        };

        if let Err(e) = self.metric_sink.emit(&event) {
            warn!("Failed to emit metrics for request {}: {}", ctx.request_id, e);
        }
    }

    /// Keep a caller-supplied request id, otherwise generate one
    fn request_id_for(&self, request: &GatewayRequest) -> String {
        if let Some(id) = request
            .headers
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|id| !id.is_empty() && id.len() <= 128)
        {
            return id.to_string();
        }

        let counter = self.request_counter.fetch_add(1, Ordering::Relaxed);
        format!("req-{:016x}-{:08x}", self.clock.now_millis(), counter)
    }
}

fn set_header(headers: &mut HeaderMap, name: &'static str, value: impl ToString) {
    if let Ok(value) = HeaderValue::from_str(&value.to_string()) {
        headers.insert(HeaderName::from_static(name), value);
    }
}

fn log_completion(
    ctx: &RequestContext,
    method: &Method,
    path: &str,
    status: StatusCode,
    latency: Duration,
) {
    // Route misses are expected traffic, not failures
    let log_level = if status.is_server_error() {
        log::Level::Error
    } else if status.is_client_error() && ctx.route.is_some() {
        log::Level::Warn
    } else {
        log::Level::Info
    };

    log::log!(
        log_level,
        "Request {} completed: {} {} -> {} ({}ms) [{}]",
        ctx.request_id,
        method,
        path,
        status.as_u16(),
        latency.as_millis(),
        ctx.backend.as_deref().unwrap_or("no-backend")
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use async_trait::async_trait;
    use std::net::Ipv4Addr;
    use crate::store::StoreError;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    const SCENARIO: &str = r#"
server:
  http_addr: "127.0.0.1:0"
auth:
  required: true
  api_keys:
    - key: "k-1"
      user_id: "ada"
      scopes: ["users:read"]
routes:
  - name: users
    path: /api/users/*
    method: GET
    backends: ["http://backend-0", "http://backend-1"]
    algorithm: round_robin
    rate_limit: { requests: 2, window: 60s }
    cache: { enabled: true, ttl: 30s }
    scopes: ["users:read"]
  - name: admin
    path: /admin/*
    backends: ["http://admin"]
    scopes: ["admin"]
"#;

    #[derive(Clone, Copy)]
    enum Reply {
        Json(&'static str),
        Status(u16),
        Refused,
        Hang,
    }

    struct StubForwarder {
        reply: Reply,
        calls: AtomicUsize,
        targets: Mutex<Vec<String>>,
        bodies: Mutex<Vec<Bytes>>,
    }

    impl StubForwarder {
        fn new(reply: Reply) -> Self {
            Self {
                reply,
                calls: AtomicUsize::new(0),
                targets: Mutex::new(Vec::new()),
                bodies: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Forwarder for StubForwarder {
        async fn forward(
            &self,
            target: &str,
            request: ForwardRequest,
            timeout: Duration,
        ) -> Result<BackendResponse, ForwardError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.targets.lock().unwrap().push(target.to_string());
            self.bodies.lock().unwrap().push(request.body.clone());

            match self.reply {
                Reply::Json(body) => {
                    let mut headers = HeaderMap::new();
                    headers.insert(
                        header::CONTENT_TYPE,
                        HeaderValue::from_static("application/json"),
                    );
                    Ok(BackendResponse {
                        status: StatusCode::OK,
                        headers,
                        body: Bytes::from_static(body.as_bytes()),
                    })
                }
                Reply::Status(code) => {
                    let status = StatusCode::from_u16(code).unwrap();
                    let response = BackendResponse {
                        status,
                        headers: HeaderMap::new(),
                        body: Bytes::new(),
                    };
                    if status.is_server_error() {
                        Err(ForwardError::Backend5xx { status, response })
                    } else {
                        Ok(response)
                    }
                }
                Reply::Refused => Err(ForwardError::ConnectionRefused(
                    "connection refused".to_string(),
                )),
                Reply::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Err(ForwardError::Timeout(timeout))
                }
            }
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<MetricEvent>>,
    }

    impl RecordingSink {
        fn events(&self) -> Vec<MetricEvent> {
            self.events.lock().unwrap().clone()
        }
    }

    impl MetricSink for RecordingSink {
        fn emit(&self, event: &MetricEvent) -> Result<()> {
            self.events.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    struct FailingSink;

    impl MetricSink for FailingSink {
        fn emit(&self, _event: &MetricEvent) -> Result<()> {
            Err(anyhow::anyhow!("sink offline"))
        }
    }

    /// Counter and cache store whose backing service is down
    struct UnreachableStore;

    #[async_trait]
    impl CounterStore for UnreachableStore {
        async fn incr(&self, _key: &str, _ttl: Duration) -> Result<u64, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        async fn get(&self, _key: &str) -> Result<Option<u64>, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }
    }

    #[async_trait]
    impl CacheStore for UnreachableStore {
        async fn get(&self, _key: &str) -> Result<Option<Bytes>, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        async fn put(&self, _key: &str, _value: Bytes, _ttl: Duration) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }
    }

    struct Harness {
        gateway: ApiGateway,
        forwarder: Arc<StubForwarder>,
        sink: Arc<RecordingSink>,
        clock: Arc<ManualClock>,
    }

    fn harness(yaml: &str, reply: Reply) -> Harness {
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        let forwarder = Arc::new(StubForwarder::new(reply));
        let sink = Arc::new(RecordingSink::default());
        let clock = Arc::new(ManualClock::default());

        let gateway = ApiGateway::builder(Arc::new(config))
            .clock(clock.clone())
            .forwarder(forwarder.clone())
            .metric_sink(sink.clone())
            .build()
            .unwrap();

        Harness {
            gateway,
            forwarder,
            sink,
            clock,
        }
    }

    fn request(method: Method, path: &str, api_key: Option<&'static str>) -> GatewayRequest {
        let mut headers = HeaderMap::new();
        if let Some(key) = api_key {
            headers.insert("x-api-key", HeaderValue::from_static(key));
        }
        GatewayRequest::new(
            method,
            path,
            None,
            headers,
            Bytes::new(),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
        )
    }

    fn get(path: &str) -> GatewayRequest {
        request(Method::GET, path, Some("k-1"))
    }

    #[tokio::test]
    async fn test_rate_limit_cache_and_balancing_scenario() {
        let h = harness(SCENARIO, Reply::Json(r#"{"id":1}"#));
        let window_reset = h.clock.now_secs() + 60;

        let first = h.gateway.handle(get("/api/users/1")).await;
        assert_eq!(first.status, StatusCode::OK);
        assert_eq!(first.body, Bytes::from_static(br#"{"id":1}"#));
        assert_eq!(first.header(X_CACHE), Some("MISS"));
        assert_eq!(first.header(X_RATELIMIT_LIMIT), Some("2"));
        assert_eq!(first.header(X_RATELIMIT_REMAINING), Some("1"));
        assert_eq!(
            first.header(X_RATELIMIT_RESET),
            Some(window_reset.to_string().as_str())
        );
        assert!(first.header(X_RESPONSE_TIME).unwrap().ends_with("ms"));
        assert!(first.header(X_REQUEST_ID).unwrap().starts_with("req-"));
        assert_eq!(h.forwarder.calls(), 1);
        assert_eq!(h.forwarder.targets.lock().unwrap()[0], "http://backend-0");

        let second = h.gateway.handle(get("/api/users/1")).await;
        assert_eq!(second.status, StatusCode::OK);
        assert_eq!(second.header(X_CACHE), Some("HIT"));
        assert_eq!(second.header(X_RATELIMIT_REMAINING), Some("0"));
        assert_eq!(second.body, first.body);
        assert_eq!(h.forwarder.calls(), 1);

        let third = h.gateway.handle(get("/api/users/1")).await;
        assert_eq!(third.status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(third.header(X_RATELIMIT_REMAINING), Some("0"));
        assert_eq!(third.header("retry-after"), Some("60"));
        assert_eq!(h.forwarder.calls(), 1);

        let events = h.sink.events();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].backend.as_deref(), Some("http://backend-0"));
        assert!(!events[0].cache_hit);
        assert!(events[1].cache_hit);
        assert!(events[1].backend.is_none());
        assert!(events[2].rate_limited);
        assert_eq!(events[2].status, 429);
    }

    #[tokio::test]
    async fn test_cache_expires_after_ttl() {
        let yaml = r#"
server:
  http_addr: "127.0.0.1:0"
routes:
  - name: catalog
    path: /catalog/*
    backends: ["http://catalog"]
    cache: { enabled: true, ttl: 30s }
"#;
        let h = harness(yaml, Reply::Json("[]"));
        let anon = || request(Method::GET, "/catalog/items", None);

        h.gateway.handle(anon()).await;
        h.clock.advance(Duration::from_secs(29));
        let cached = h.gateway.handle(anon()).await;
        assert_eq!(cached.header(X_CACHE), Some("HIT"));
        assert_eq!(cached.header("age"), Some("29"));
        assert_eq!(h.forwarder.calls(), 1);

        h.clock.advance(Duration::from_secs(2));
        let refreshed = h.gateway.handle(anon()).await;
        assert_eq!(refreshed.header(X_CACHE), Some("MISS"));
        assert_eq!(h.forwarder.calls(), 2);

        // POST on the same route is never cached
        let post = h
            .gateway
            .handle(request(Method::POST, "/catalog/items", None))
            .await;
        assert_eq!(post.status, StatusCode::OK);
        assert!(post.header(X_CACHE).is_none());
        assert_eq!(h.forwarder.calls(), 3);
    }

    #[tokio::test]
    async fn test_unknown_route_is_404_miss() {
        let h = harness(SCENARIO, Reply::Json("{}"));

        let response = h.gateway.handle(get("/nowhere")).await;
        assert_eq!(response.status, StatusCode::NOT_FOUND);
        assert!(response.header(X_REQUEST_ID).is_some());
        assert_eq!(h.forwarder.calls(), 0);

        let events = h.sink.events();
        assert_eq!(events.len(), 1);
        assert!(events[0].route.is_none());
        assert_eq!(events[0].tag(TAG_ERROR), Some("route_not_found"));
    }

    #[tokio::test]
    async fn test_auth_rejections() {
        let h = harness(SCENARIO, Reply::Json("{}"));

        let missing = h
            .gateway
            .handle(request(Method::GET, "/api/users/1", None))
            .await;
        assert_eq!(missing.status, StatusCode::UNAUTHORIZED);

        let bad = h
            .gateway
            .handle(request(Method::GET, "/api/users/1", Some("wrong")))
            .await;
        assert_eq!(bad.status, StatusCode::UNAUTHORIZED);

        let forbidden = h.gateway.handle(get("/admin/settings")).await;
        assert_eq!(forbidden.status, StatusCode::FORBIDDEN);
        let body: serde_json::Value = serde_json::from_slice(&forbidden.body).unwrap();
        assert_eq!(body["error"], "unauthorized");

        assert_eq!(h.forwarder.calls(), 0);
        assert_eq!(h.sink.events().len(), 3);
    }

    #[tokio::test]
    async fn test_backend_failures_map_to_502() {
        for reply in [Reply::Refused, Reply::Status(503)] {
            let h = harness(SCENARIO, reply);
            let response = h.gateway.handle(get("/api/users/1")).await;
            assert_eq!(response.status, StatusCode::BAD_GATEWAY);

            let events = h.sink.events();
            assert_eq!(events.len(), 1);
            assert!(events[0].tag(TAG_BACKEND_ERROR).is_some());
        }
    }

    #[tokio::test]
    async fn test_backend_4xx_passes_through_uncached() {
        let h = harness(SCENARIO, Reply::Status(404));

        let first = h.gateway.handle(get("/api/users/404")).await;
        assert_eq!(first.status, StatusCode::NOT_FOUND);
        assert_eq!(first.header(X_CACHE), Some("MISS"));

        let second = h.gateway.handle(get("/api/users/404")).await;
        assert_eq!(second.header(X_CACHE), Some("MISS"));
        assert_eq!(h.forwarder.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_route_timeout_maps_to_504() {
        let yaml = r#"
server:
  http_addr: "127.0.0.1:0"
routes:
  - name: slow
    path: /slow
    backends: ["http://slow"]
    timeout: 2s
"#;
        let h = harness(yaml, Reply::Hang);

        let response = h.gateway.handle(request(Method::GET, "/slow", None)).await;
        assert_eq!(response.status, StatusCode::GATEWAY_TIMEOUT);

        let events = h.sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].tag(TAG_BACKEND_ERROR), Some("timeout"));
        assert_eq!(events[0].backend.as_deref(), Some("http://slow"));
    }

    #[tokio::test]
    async fn test_transforms_apply_both_ways() {
        let yaml = r#"
server:
  http_addr: "127.0.0.1:0"
routes:
  - name: profile
    path: /profile
    method: POST
    backends: ["http://profile"]
    transform:
      request:
        add: { source: "gateway" }
      response:
        rename: { name: "full_name" }
"#;
        let h = harness(yaml, Reply::Json(r#"{"name":"Ada Lovelace"}"#));

        let mut req = request(Method::POST, "/profile", None);
        req.body = Bytes::from_static(br#"{"x":1}"#);
        let response = h.gateway.handle(req).await;

        let body: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
        assert_eq!(body, serde_json::json!({"full_name": "Ada Lovelace"}));

        let sent: serde_json::Value =
            serde_json::from_slice(&h.forwarder.bodies.lock().unwrap()[0]).unwrap();
        assert_eq!(sent, serde_json::json!({"x": 1, "source": "gateway"}));
    }

    #[tokio::test]
    async fn test_sink_failure_does_not_fail_request() {
        let config: Config = serde_yaml::from_str(SCENARIO).unwrap();
        let gateway = ApiGateway::builder(Arc::new(config))
            .clock(Arc::new(ManualClock::default()))
            .forwarder(Arc::new(StubForwarder::new(Reply::Json("{}"))))
            .metric_sink(Arc::new(FailingSink))
            .build()
            .unwrap();

        let response = gateway.handle(get("/api/users/1")).await;
        assert_eq!(response.status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_inbound_request_id_is_kept() {
        let h = harness(SCENARIO, Reply::Json("{}"));
        let mut req = get("/api/users/7");
        req.headers
            .insert(X_REQUEST_ID, HeaderValue::from_static("abc-123"));

        let response = h.gateway.handle(req).await;
        assert_eq!(response.header(X_REQUEST_ID), Some("abc-123"));
    }

    #[tokio::test]
    async fn test_reload_swaps_routes() {
        let h = harness(SCENARIO, Reply::Json("{}"));
        assert_eq!(h.gateway.route_count(), 2);

        let replacement: Vec<RouteConfig> = serde_yaml::from_str(
            r#"
- name: orders
  path: /api/orders/*
  backends: ["http://orders"]
"#,
        )
        .unwrap();
        h.gateway.reload(&replacement).unwrap();
        assert_eq!(h.gateway.route_count(), 1);

        let old = h.gateway.handle(get("/api/users/1")).await;
        assert_eq!(old.status, StatusCode::NOT_FOUND);
        let new = h.gateway.handle(get("/api/orders/9")).await;
        assert_eq!(new.status, StatusCode::OK);

        let mut invalid = replacement.clone();
        invalid[0].backends.clear();
        assert!(h.gateway.reload(&invalid).is_err());
        assert_eq!(h.gateway.route_count(), 1);
    }

    #[tokio::test]
    async fn test_store_outage_degrades_without_blocking() {
        let config: Config = serde_yaml::from_str(SCENARIO).unwrap();
        let forwarder = Arc::new(StubForwarder::new(Reply::Json(r#"{"id":1}"#)));
        let sink = Arc::new(RecordingSink::default());
        let store = Arc::new(UnreachableStore);
        let gateway = ApiGateway::builder(Arc::new(config))
            .clock(Arc::new(ManualClock::default()))
            .counter_store(store.clone())
            .cache_store(store)
            .forwarder(forwarder.clone())
            .metric_sink(sink.clone())
            .build()
            .unwrap();

        let first = gateway.handle(get("/api/users/1")).await;
        assert_eq!(first.status, StatusCode::OK);
        assert_eq!(first.header(X_CACHE), Some("MISS"));
        assert_eq!(first.header(X_RATELIMIT_REMAINING), Some("1"));
        assert_eq!(forwarder.calls(), 1);

        // Nothing was stored, so the repeat goes to the backend again
        let second = gateway.handle(get("/api/users/1")).await;
        assert_eq!(second.status, StatusCode::OK);
        assert_eq!(second.header(X_CACHE), Some("MISS"));
        assert_eq!(forwarder.calls(), 2);

        // The local fallback still enforces the quota
        let third = gateway.handle(get("/api/users/1")).await;
        assert_eq!(third.status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(forwarder.calls(), 2);

        let events = sink.events();
        assert_eq!(events.len(), 3);
        for event in &events {
            assert_eq!(event.tag(TAG_RATELIMIT_STORE), Some("degraded"));
        }
        assert_eq!(events[0].tag(TAG_CACHE_STORE), Some("unavailable"));
        assert_eq!(events[1].tag(TAG_CACHE_STORE), Some("unavailable"));
        assert!(!events[1].cache_hit);
        assert!(events[2].rate_limited);
    }

    #[tokio::test]
    async fn test_leases_released_after_backend_errors() {
        for reply in [Reply::Refused, Reply::Status(503), Reply::Json("{}")] {
            let h = harness(SCENARIO, reply);
            for id in 1..=2 {
                h.gateway.handle(get(&format!("/api/users/{}", id))).await;
            }
            assert_eq!(h.forwarder.calls(), 2);
            assert_eq!(h.gateway.open_connections("users"), Some(0));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_leases_released_after_timeout_and_cancellation() {
        let yaml = r#"
server:
  http_addr: "127.0.0.1:0"
routes:
  - name: slow
    path: /slow
    backends: ["http://slow-0", "http://slow-1"]
    algorithm: least_connections
    timeout: 2s
"#;
        let h = harness(yaml, Reply::Hang);

        let timed_out = h.gateway.handle(request(Method::GET, "/slow", None)).await;
        assert_eq!(timed_out.status, StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(h.gateway.open_connections("slow"), Some(0));

        // Caller gives up before the route deadline and drops the request
        let abandoned = tokio::time::timeout(
            Duration::from_millis(100),
            h.gateway.handle(request(Method::GET, "/slow", None)),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(h.forwarder.calls(), 2);
        assert_eq!(h.gateway.open_connections("slow"), Some(0));
        assert_eq!(h.gateway.open_connections("missing"), None);
    }

    #[tokio::test]
    async fn test_rejected_body_is_counted_and_tagged() {
        let h = harness(SCENARIO, Reply::Json("{}"));

        let response = h
            .gateway
            .reject_malformed(&get("/api/users/1"), "body exceeds the size limit");
        assert_eq!(response.status, StatusCode::BAD_REQUEST);
        assert!(response.header(X_REQUEST_ID).unwrap().starts_with("req-"));
        assert!(response.header(X_RESPONSE_TIME).is_some());
        assert_eq!(h.forwarder.calls(), 0);

        let events = h.sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status, 400);
        assert_eq!(events[0].tag(TAG_ERROR), Some("malformed_request"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_requests_respect_quota() {
        let yaml = r#"
server:
  http_addr: "127.0.0.1:0"
routes:
  - name: burst
    path: /burst
    backends: ["http://a", "http://b"]
    algorithm: least_connections
    rate_limit: { requests: 10, window: 60s }
"#;
        let h = harness(yaml, Reply::Json("{}"));
        let gateway = Arc::new(h.gateway);

        let handles: Vec<_> = (0..50)
            .map(|_| {
                let gateway = gateway.clone();
                tokio::spawn(async move {
                    gateway
                        .handle(request(Method::GET, "/burst", None))
                        .await
                        .status
                })
            })
            .collect();

        let mut ok = 0;
        let mut limited = 0;
        for handle in handles {
            let status = handle.await.unwrap();
            if status == StatusCode::OK {
                ok += 1;
            } else if status == StatusCode::TOO_MANY_REQUESTS {
                limited += 1;
            } else {
                panic!("unexpected status {status}");
            }
        }

        assert_eq!(ok, 10);
        assert_eq!(limited, 40);
        assert_eq!(h.forwarder.calls(), 10);
        assert_eq!(h.sink.events().len(), 50);
    }
}
