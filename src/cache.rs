/// Response caching keyed by canonical request signature
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::forwarder::BackendResponse;
use crate::gateway::GatewayRequest;
use crate::routes::{split_path, Route};
use crate::store::{with_timeout, CacheStore, StoreError};

/// Cache status reported in the `X-Cache` header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::Hit => "HIT",
            CacheStatus::Miss => "MISS",
        }
    }
}

/// Cached response entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    #[serde(with = "body_base64")]
    pub body: Bytes,
    /// Milliseconds since the UNIX epoch
    pub stored_at_ms: u64,
    pub ttl_secs: u64,
}

impl CacheEntry {
    pub fn is_fresh(&self, now_ms: u64) -> bool {
        now_ms < self.stored_at_ms + self.ttl_secs * 1000
    }

    pub fn age_secs(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.stored_at_ms) / 1000
    }

    /// Rebuild a backend response from the stored parts
    pub fn to_response(&self) -> BackendResponse {
        let mut headers = HeaderMap::with_capacity(self.headers.len());
        for (name, value) in &self.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                headers.append(name, value);
            }
        }

        BackendResponse {
            status: StatusCode::from_u16(self.status).unwrap_or(StatusCode::OK),
            headers,
            body: self.body.clone(),
        }
    }
}

mod body_base64 {
    use base64::prelude::BASE64_STANDARD;
    use base64::Engine;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64_STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64_STANDARD
            .decode(encoded)
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

/// Response cache over a shared cache store
pub struct ResponseCache {
    store: Arc<dyn CacheStore>,
    clock: Arc<dyn Clock>,
    operation_timeout: Duration,
    /// Largest body that will be stored
    max_body_size: usize,
}

impl ResponseCache {
    pub fn new(
        store: Arc<dyn CacheStore>,
        clock: Arc<dyn Clock>,
        operation_timeout: Duration,
        max_body_size: usize,
    ) -> Self {
        Self {
            store,
            clock,
            operation_timeout,
            max_body_size,
        }
    }

    /// Canonical signature: method, normalized path, sorted query and the
    /// route's cache-varying headers, namespaced by route name
    pub fn signature(route: &Route, request: &GatewayRequest) -> String {
        let mut key = format!(
            "cache:{}:{} /{}",
            route.name(),
            request.method.as_str(),
            split_path(&request.path).join("/")
        );

        if let Some(query) = request.query.as_deref().filter(|q| !q.is_empty()) {
            let mut pairs: Vec<(String, String)> = url::form_urlencoded::parse(query.as_bytes())
                .into_owned()
                .collect();
            pairs.sort();
            let canonical = url::form_urlencoded::Serializer::new(String::new())
                .extend_pairs(pairs)
                .finish();
            key.push('?');
            key.push_str(&canonical);
        }

        for name in &route.vary_headers {
            let values: Vec<&str> = request
                .headers
                .get_all(name.as_str())
                .iter()
                .filter_map(|v| v.to_str().ok())
                .collect();
            key.push('|');
            key.push_str(name);
            key.push('=');
            key.push_str(&values.join(","));
        }

        key
    }

    /// Look up a fresh entry. Store failures surface as errors so the caller
    /// can tag them; they must be treated as a miss.
    pub async fn get(
        &self,
        signature: &str,
        budget: Option<Duration>,
    ) -> Result<Option<CacheEntry>, StoreError> {
        let limit = self.bound(budget);
        let Some(bytes) = with_timeout(limit, self.store.get(signature)).await? else {
            return Ok(None);
        };

        let entry: CacheEntry = match serde_json::from_slice(&bytes) {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Discarding undecodable cache entry {}: {}", signature, e);
                return Ok(None);
            }
        };

        if entry.is_fresh(self.clock.now_millis()) {
            Ok(Some(entry))
        } else {
            Ok(None)
        }
    }

    /// Store a response when it is cacheable; returns whether it was stored
    pub async fn put(
        &self,
        signature: &str,
        response: &BackendResponse,
        ttl: Duration,
        budget: Option<Duration>,
    ) -> Result<bool, StoreError> {
        if !self.is_cacheable(response) {
            return Ok(false);
        }

        let entry = CacheEntry {
            status: response.status.as_u16(),
            headers: response
                .headers
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|v| (name.as_str().to_string(), v.to_string()))
                })
                .collect(),
            body: response.body.clone(),
            stored_at_ms: self.clock.now_millis(),
            ttl_secs: ttl.as_secs().max(1),
        };

        let encoded =
            serde_json::to_vec(&entry).map_err(|e| StoreError::Codec(e.to_string()))?;
        let limit = self.bound(budget);
        with_timeout(limit, self.store.put(signature, Bytes::from(encoded), ttl)).await?;

        debug!("Cached response with key: {} (TTL: {:?})", signature, ttl);
        Ok(true)
    }

    /// Only 2xx responses that do not opt out and fit the size limit
    pub fn is_cacheable(&self, response: &BackendResponse) -> bool {
        if !response.status.is_success() {
            return false;
        }

        if response.body.len() > self.max_body_size {
            return false;
        }

        if let Some(cache_control) = response.headers.get(http::header::CACHE_CONTROL) {
            if let Ok(cc) = cache_control.to_str() {
                let cc = cc.to_ascii_lowercase();
                if cc.contains("no-store") || cc.contains("private") {
                    return false;
                }
            }
        }

        // Never share a response that sets cookies
        !response.headers.contains_key(http::header::SET_COOKIE)
    }

    fn bound(&self, budget: Option<Duration>) -> Duration {
        budget.map_or(self.operation_timeout, |b| b.min(self.operation_timeout))
    }
}
