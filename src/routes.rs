/// Request routing: path patterns and the precedence-ordered route table
use anyhow::{anyhow, Result};
use http::Method;
use log::debug;
use smallstr::SmallString;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{is_any_method, RateLimitConfig, RouteCacheConfig, RouteConfig, TransformRules};

type Segment = SmallString<[u8; 16]>;

/// Literal path segments with an optional trailing wildcard.
///
/// `/api/users/*` matches `/api/users/1` and `/api/users/1/posts` but not
/// `/api/users`; the wildcard consumes one or more remaining segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPattern {
    literals: Vec<Segment>,
    wildcard: bool,
}

impl PathPattern {
    /// Parse a pattern such as `/api/users/*`
    pub fn parse(pattern: &str) -> Result<Self> {
        if !pattern.starts_with('/') {
            return Err(anyhow!("Path pattern '{}' must start with '/'", pattern));
        }

        let segments: Vec<&str> = split_path(pattern);
        let mut literals = Vec::with_capacity(segments.len());
        let mut wildcard = false;

        for (index, segment) in segments.iter().enumerate() {
            if *segment == "*" {
                if index != segments.len() - 1 {
                    return Err(anyhow!(
                        "Wildcard must be the last segment in '{}'",
                        pattern
                    ));
                }
                wildcard = true;
            } else if segment.contains('*') {
                return Err(anyhow!(
                    "Partial wildcard segment '{}' is not supported in '{}'",
                    segment,
                    pattern
                ));
            } else {
                literals.push(Segment::from_str(segment));
            }
        }

        Ok(Self { literals, wildcard })
    }

    /// Number of literal segments, the primary precedence key
    pub fn literal_count(&self) -> usize {
        self.literals.len()
    }

    pub fn has_wildcard(&self) -> bool {
        self.wildcard
    }

    /// Compare against an already split request path
    pub fn matches(&self, path_segments: &[&str]) -> bool {
        let prefix_len = self.literals.len();
        let length_ok = if self.wildcard {
            path_segments.len() > prefix_len
        } else {
            path_segments.len() == prefix_len
        };

        length_ok
            && self
                .literals
                .iter()
                .zip(path_segments)
                .all(|(literal, segment)| literal.as_str() == *segment)
    }
}

/// Split a path into its non-empty segments
pub fn split_path(path: &str) -> Vec<&str> {
    path.trim_matches('/')
        .split('/')
        .filter(|s| !s.is_empty())
        .collect()
}

/// Compiled route ready for matching
#[derive(Debug, Clone)]
pub struct Route {
    /// Original route configuration
    pub config: RouteConfig,
    /// Parsed path pattern
    pub pattern: PathPattern,
    /// Method restriction; `None` matches any method
    pub method: Option<Method>,
    /// Lower-cased names of cache-varying request headers
    pub vary_headers: Vec<String>,
}

impl Route {
    /// Create a compiled route from configuration
    pub fn new(config: RouteConfig) -> Result<Self> {
        let pattern = PathPattern::parse(&config.path)?;

        let method = match config.method.as_deref() {
            None => None,
            Some(m) if is_any_method(m) => None,
            Some(m) => Some(
                Method::from_bytes(m.to_ascii_uppercase().as_bytes())
                    .map_err(|e| anyhow!("Invalid method '{}' on route '{}': {}", m, config.name, e))?,
            ),
        };

        let mut vary_headers: Vec<String> = config
            .cache
            .as_ref()
            .map(|c| c.vary_headers.iter().map(|h| h.to_ascii_lowercase()).collect())
            .unwrap_or_default();
        vary_headers.sort();
        vary_headers.dedup();

        Ok(Self {
            config,
            pattern,
            method,
            vary_headers,
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn matches_method(&self, method: &Method) -> bool {
        self.method.as_ref().map_or(true, |m| m == method)
    }

    pub fn rate_limit(&self) -> Option<&RateLimitConfig> {
        self.config.rate_limit.as_ref()
    }

    /// Cache policy, only when caching is switched on
    pub fn cache_policy(&self) -> Option<&RouteCacheConfig> {
        self.config.cache.as_ref().filter(|c| c.enabled)
    }

    /// Caching applies to GET requests on routes that enable it
    pub fn is_cache_enabled_for_method(&self, method: &Method) -> bool {
        self.cache_policy().is_some() && method == Method::GET
    }

    pub fn request_rules(&self) -> Option<&TransformRules> {
        self.config
            .transform
            .as_ref()
            .and_then(|t| t.request.as_ref())
            .filter(|rules| !rules.is_empty())
    }

    pub fn response_rules(&self) -> Option<&TransformRules> {
        self.config
            .transform
            .as_ref()
            .and_then(|t| t.response.as_ref())
            .filter(|rules| !rules.is_empty())
    }
}

/// Route manager holding routes in precedence order
pub struct RouteManager {
    /// Routes sorted by descending specificity
    routes: Vec<Arc<Route>>,
    /// Route lookup by name
    route_by_name: HashMap<String, Arc<Route>>,
}

impl RouteManager {
    /// Compile and order a route snapshot
    pub fn new(route_configs: &[RouteConfig]) -> Result<Self> {
        let mut routes = Vec::with_capacity(route_configs.len());
        let mut route_by_name = HashMap::with_capacity(route_configs.len());

        for config in route_configs {
            if route_by_name.contains_key(&config.name) {
                return Err(anyhow!("Duplicate route name: {}", config.name));
            }

            let route = Arc::new(Route::new(config.clone())?);
            route_by_name.insert(config.name.clone(), route.clone());
            routes.push(route);
        }

        // More literal segments first, then exact method before any method.
        // The sort is stable so configuration order breaks remaining ties.
        routes.sort_by(|a, b| {
            b.pattern
                .literal_count()
                .cmp(&a.pattern.literal_count())
                .then_with(|| a.method.is_none().cmp(&b.method.is_none()))
        });

        debug!("Loaded {} routes", routes.len());
        for route in &routes {
            debug!(
                "Route '{}': {} {} -> {:?}",
                route.name(),
                route.method.as_ref().map_or("*", |m| m.as_str()),
                route.config.path,
                route.config.backends
            );
        }

        Ok(Self {
            routes,
            route_by_name,
        })
    }

    /// Find the first matching route in precedence order
    pub fn find_route(&self, method: &Method, path: &str) -> Option<Arc<Route>> {
        let segments = split_path(path);

        let found = self
            .routes
            .iter()
            .find(|route| route.matches_method(method) && route.pattern.matches(&segments))
            .cloned();

        match &found {
            Some(route) => debug!("Route '{}' matched for {} {}", route.name(), method, path),
            None => debug!("No route matched for {} {}", method, path),
        }
        found
    }

    /// Get a route by name
    pub fn get_route(&self, name: &str) -> Option<Arc<Route>> {
        self.route_by_name.get(name).cloned()
    }

    /// Routes in precedence order
    pub fn get_routes(&self) -> &[Arc<Route>] {
        &self.routes
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }
}
