//! API authentication.

use axum::{
    body::Body,
    extract::State,
    http::{header::AUTHORIZATION, Request, StatusCode},
    middleware::Next,
    response::Response,
};

use crate::config::Config;

#[derive(Clone, Debug, Default)]
pub struct SecurityConfig {
    /// Bearer token required on every route but `/health`. `None` disables auth.
    pub api_key: Option<String>,
    /// Allowed CORS origins. `None` allows any origin.
    pub cors_origins: Option<Vec<String>>,
}

impl SecurityConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            api_key: config.api_key.clone(),
            cors_origins: config.cors_origins.clone(),
        }
    }

    /// No authentication, any origin (for local use and tests).
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn with_api_key(key: impl Into<String>) -> Self {
        Self {
            api_key: Some(key.into()),
            cors_origins: None,
        }
    }
}

pub async fn auth_middleware(
    State(config): State<SecurityConfig>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let Some(expected) = &config.api_key else {
        return Ok(next.run(request).await);
    };

    let token = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "));

    match token {
        Some(token) if token == expected => Ok(next.run(request).await),
        Some(_) => {
            tracing::warn!("invalid API key provided");
            Err(StatusCode::UNAUTHORIZED)
        }
        None => {
            tracing::warn!("missing or malformed Authorization header");
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_has_no_auth() {
        let config = SecurityConfig::disabled();
        assert!(config.api_key.is_none());
        assert!(config.cors_origins.is_none());
    }

    #[test]
    fn reads_key_and_origins_from_config() {
        let config = Config {
            api_key: Some("secret".into()),
            cors_origins: Some(vec!["http://localhost:5173".into()]),
            ..Config::default()
        };
        let security = SecurityConfig::from_config(&config);
        assert_eq!(security.api_key.as_deref(), Some("secret"));
        assert_eq!(security.cors_origins.map(|o| o.len()), Some(1));
    }
}
