//! Prism - request-routing and traffic-control core for an API gateway
//!
//! Prism sits between clients and backend services and decides, for every
//! inbound request, what happens to it:
//! - Route matching on path templates and methods, hot-swappable at runtime
//! - Authorization through a pluggable delegate with per-route scopes
//! - Fixed-window rate limiting on a shared counter store with local fallback
//! - Response caching keyed by a canonical request signature
//! - Load balancing (round robin, least connections, IP hash) with reachability tracking
//! - JSON body transformation in both directions
//! - One metric event and one structured log line per request

pub mod auth;
pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod forwarder;
pub mod gateway;
pub mod load_balancer;
pub mod metrics;
pub mod rate_limiter;
pub mod routes;
pub mod server;
pub mod store;
pub mod transform;

pub use auth::{AuthDecision, Authorizer, Identity};
pub use cache::{CacheEntry, CacheStatus, ResponseCache};
pub use config::*;
pub use error::GatewayError;
pub use forwarder::{BackendResponse, ForwardError, ForwardRequest, Forwarder, HttpForwarder};
pub use gateway::{ApiGateway, GatewayBuilder, GatewayRequest, GatewayResponse, RequestContext};
pub use load_balancer::{BackendLease, LoadBalancer};
pub use metrics::{MetricEvent, MetricSink, PrometheusMetrics};
pub use rate_limiter::{RateLimitDecision, RateLimiter};
pub use routes::{Route, RouteManager};
pub use server::GatewayServer;
