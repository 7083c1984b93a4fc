/// Authorization delegate seam and the built-in API key authorizer
use async_trait::async_trait;
use http::StatusCode;
use log::debug;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;

use crate::config::AuthConfig;
use crate::gateway::GatewayRequest;

/// Who is calling, as established by the authorization delegate
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    pub api_key: Option<String>,
    pub user_id: Option<String>,
    pub scopes: HashSet<String>,
}

impl Identity {
    /// Rate-limit identifier: API key, then user id, then caller IP
    pub fn rate_limit_key(&self, client_ip: IpAddr) -> String {
        if let Some(key) = &self.api_key {
            format!("key:{}", key)
        } else if let Some(user) = &self.user_id {
            format!("user:{}", user)
        } else {
            format!("ip:{}", client_ip)
        }
    }

    /// First required scope this identity lacks
    pub fn missing_scope<'a>(&self, required: &'a [String]) -> Option<&'a str> {
        required
            .iter()
            .find(|scope| !self.scopes.contains(scope.as_str()))
            .map(String::as_str)
    }
}

/// Outcome of authorization
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthDecision {
    Allow(Identity),
    /// Reject with 401 or 403
    Deny { status: StatusCode, reason: String },
}

impl AuthDecision {
    pub fn unauthenticated(reason: impl Into<String>) -> Self {
        AuthDecision::Deny {
            status: StatusCode::UNAUTHORIZED,
            reason: reason.into(),
        }
    }

    pub fn forbidden(reason: impl Into<String>) -> Self {
        AuthDecision::Deny {
            status: StatusCode::FORBIDDEN,
            reason: reason.into(),
        }
    }
}

/// External credential check consulted once per matched request
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(&self, request: &GatewayRequest) -> AuthDecision;
}

/// Lets every caller through anonymously
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

#[async_trait]
impl Authorizer for AllowAll {
    async fn authorize(&self, _request: &GatewayRequest) -> AuthDecision {
        AuthDecision::Allow(Identity::default())
    }
}

#[derive(Debug, Clone)]
struct KeyGrant {
    user_id: Option<String>,
    scopes: HashSet<String>,
}

/// Validates an API key header against configured keys
#[derive(Debug, Clone)]
pub struct ApiKeyAuthorizer {
    header: String,
    required: bool,
    keys: HashMap<String, KeyGrant>,
}

impl ApiKeyAuthorizer {
    pub fn new(config: &AuthConfig) -> Self {
        let keys = config
            .api_keys
            .iter()
            .map(|k| {
                (
                    k.key.clone(),
                    KeyGrant {
                        user_id: k.user_id.clone(),
                        scopes: k.scopes.iter().cloned().collect(),
                    },
                )
            })
            .collect();

        Self {
            header: config.header.to_ascii_lowercase(),
            required: config.required,
            keys,
        }
    }

    /// Validate API key
    fn validate_api_key(&self, key: &str) -> Option<&KeyGrant> {
        self.keys.get(key)
    }
}

#[async_trait]
impl Authorizer for ApiKeyAuthorizer {
    async fn authorize(&self, request: &GatewayRequest) -> AuthDecision {
        let presented = request
            .headers
            .get(self.header.as_str())
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty());

        let Some(key) = presented else {
            if self.required {
                return AuthDecision::unauthenticated("API key header missing");
            }
            return AuthDecision::Allow(Identity::default());
        };

        match self.validate_api_key(key) {
            Some(grant) => AuthDecision::Allow(Identity {
                api_key: Some(key.to_string()),
                user_id: grant.user_id.clone(),
                scopes: grant.scopes.clone(),
            }),
            None => {
                debug!("Rejected unknown API key from {}", request.client_ip);
                AuthDecision::unauthenticated("Invalid API key")
            }
        }
    }
}
