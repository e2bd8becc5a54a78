//! Token authentication for the push endpoints.
//!
//! Every transport resolves an opaque bearer token to a [`UserId`] before a
//! connection is registered. Two strategies are supported, combined by
//! [`TokenResolver`]: local HS256 verification against a configured secret
//! (the fast path), and delegation to the identity provider's user-info
//! endpoint when no secret is configured or verification fails.
//!
//! Token placement: the `Authorization: Bearer` header is preferred and is
//! checked first; the `token` query parameter is accepted as well because
//! browsers cannot set custom headers on WebSocket handshakes or native
//! `EventSource` streams.

use crate::config::PushConfig;
use crate::error::AuthError;
use crate::types::UserId;
use async_trait::async_trait;
use axum::{
    extract::{FromRequestParts, Query},
    http::{HeaderMap, StatusCode, request::Parts},
    response::{IntoResponse, Response},
};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::Deserialize;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

/// Resolves a token string to the user it belongs to.
///
/// The transport servers depend on this trait, not on a concrete strategy,
/// so embedding applications can plug in their own validation.
#[async_trait]
pub trait TokenValidator: Send + Sync + 'static {
    async fn validate_token(&self, token: &str) -> Result<UserId, AuthError>;
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    #[allow(dead_code)]
    exp: i64,
}

/// Local HS256 verification against a shared secret. The `sub` claim is the
/// user id; expiry is enforced.
pub struct JwtValidator {
    decoding: DecodingKey,
    validation: Validation,
}

impl JwtValidator {
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        Self {
            decoding: DecodingKey::from_secret(secret),
            validation,
        }
    }
}

#[async_trait]
impl TokenValidator for JwtValidator {
    async fn validate_token(&self, token: &str) -> Result<UserId, AuthError> {
        let data = decode::<Claims>(token, &self.decoding, &self.validation)
            .map_err(|e| AuthError::InvalidToken(e.to_string()))?;
        Ok(data.claims.sub)
    }
}

#[derive(Debug, Deserialize)]
struct IdentityUser {
    id: String,
}

/// Asks the identity provider to resolve the token to a user, for tokens the
/// server cannot verify locally.
pub struct IdentityProviderValidator {
    http: reqwest::Client,
    base_url: String,
    service_key: String,
}

impl IdentityProviderValidator {
    pub fn new(base_url: impl Into<String>, service_key: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            service_key: service_key.into(),
        }
    }
}

#[async_trait]
impl TokenValidator for IdentityProviderValidator {
    async fn validate_token(&self, token: &str) -> Result<UserId, AuthError> {
        let url = format!("{}/auth/v1/user", self.base_url.trim_end_matches('/'));
        let response = self
            .http
            .get(&url)
            .bearer_auth(token)
            .header("apikey", &self.service_key)
            .send()
            .await
            .map_err(|e| AuthError::Resolution(e.to_string()))?;

        if !response.status().is_success() {
            return Err(AuthError::InvalidToken(format!(
                "identity provider returned {}",
                response.status()
            )));
        }

        let user: IdentityUser = response
            .json()
            .await
            .map_err(|e| AuthError::Resolution(e.to_string()))?;
        Ok(user.id)
    }
}

/// Combines the local JWT fast path with identity-provider fallback.
pub struct TokenResolver {
    jwt: Option<JwtValidator>,
    identity: Option<IdentityProviderValidator>,
}

impl TokenResolver {
    pub fn new(jwt: Option<JwtValidator>, identity: Option<IdentityProviderValidator>) -> Self {
        Self { jwt, identity }
    }

    /// Builds a resolver from the configured environment surface. Fails if
    /// neither a JWT secret nor identity-provider credentials are present.
    pub fn from_config(config: &PushConfig) -> Result<Self, AuthError> {
        let jwt = config
            .jwt_secret
            .as_deref()
            .map(|secret| JwtValidator::new(secret.as_bytes()));
        let identity = match (&config.identity_provider_url, &config.identity_provider_key) {
            (Some(url), Some(key)) => Some(IdentityProviderValidator::new(url, key)),
            _ => None,
        };
        if jwt.is_none() && identity.is_none() {
            return Err(AuthError::Resolution(
                "no JWT secret and no identity provider configured".to_string(),
            ));
        }
        Ok(Self { jwt, identity })
    }
}

#[async_trait]
impl TokenValidator for TokenResolver {
    async fn validate_token(&self, token: &str) -> Result<UserId, AuthError> {
        let jwt_failure = match &self.jwt {
            Some(jwt) => match jwt.validate_token(token).await {
                Ok(user_id) => {
                    debug!("token verified locally");
                    return Ok(user_id);
                }
                Err(e) => Some(e),
            },
            None => None,
        };

        if let Some(identity) = &self.identity {
            if jwt_failure.is_some() {
                debug!("local verification failed, falling back to identity provider");
            }
            return identity.validate_token(token).await;
        }

        Err(jwt_failure.unwrap_or(AuthError::MissingToken))
    }
}

/// The authenticated-user extractor shared by the SSE and polling endpoints.
///
/// Rejects with a structured 401 body before any stream starts. The
/// WebSocket endpoint authenticates after the upgrade instead so it can
/// deliver the error as a frame.
#[derive(Debug)]
pub struct PushAuth(pub UserId);

#[derive(Deserialize)]
struct TokenQuery {
    token: String,
}

impl<S> FromRequestParts<S> for PushAuth
where
    S: TokenValidator + Send + Sync + 'static,
{
    type Rejection = Response;

    fn from_request_parts(
        parts: &mut Parts,
        state: &S,
    ) -> impl Future<Output = Result<Self, Self::Rejection>> + Send {
        Box::pin(async move {
            let token = match bearer_token(&parts.headers) {
                Some(t) => Some(t),
                None => Query::<TokenQuery>::from_request_parts(parts, state)
                    .await
                    .ok()
                    .map(|Query(q)| q.token),
            };

            let Some(token) = token else {
                return Err(unauthorized(&AuthError::MissingToken));
            };

            match state.validate_token(&token).await {
                Ok(user_id) => Ok(PushAuth(user_id)),
                Err(e) => {
                    warn!("rejecting connection: {e}");
                    Err(unauthorized(&e))
                }
            }
        })
    }
}

fn unauthorized(error: &AuthError) -> Response {
    let body = axum::Json(serde_json::json!({
        "type": "error",
        "message": error.to_string(),
    }));
    (StatusCode::UNAUTHORIZED, body).into_response()
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get("Authorization")
        .and_then(|header| header.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer ").map(|token| token.to_owned()))
}

/// Wrapper over `Arc<dyn TokenValidator>` so shared server state can expose
/// the trait without naming the concrete strategy.
#[derive(Clone)]
pub struct SharedValidator(pub Arc<dyn TokenValidator>);

#[async_trait]
impl TokenValidator for SharedValidator {
    async fn validate_token(&self, token: &str) -> Result<UserId, AuthError> {
        self.0.validate_token(token).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{EncodingKey, Header, encode};
    use serde::Serialize;

    #[derive(Serialize)]
    struct TestClaims {
        sub: String,
        exp: i64,
    }

    fn token(secret: &[u8], sub: &str, exp: i64) -> String {
        encode(
            &Header::default(),
            &TestClaims {
                sub: sub.to_string(),
                exp,
            },
            &EncodingKey::from_secret(secret),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn jwt_validator_accepts_valid_token() {
        let validator = JwtValidator::new(b"push-secret");
        let exp = chrono::Utc::now().timestamp() + 600;
        let token = token(b"push-secret", "user-42", exp);
        assert_eq!(validator.validate_token(&token).await.unwrap(), "user-42");
    }

    #[tokio::test]
    async fn jwt_validator_rejects_wrong_secret_and_expired() {
        let validator = JwtValidator::new(b"push-secret");
        let exp = chrono::Utc::now().timestamp() + 600;

        let forged = token(b"other-secret", "user-42", exp);
        assert!(matches!(
            validator.validate_token(&forged).await,
            Err(AuthError::InvalidToken(_))
        ));

        let expired = token(b"push-secret", "user-42", chrono::Utc::now().timestamp() - 600);
        assert!(validator.validate_token(&expired).await.is_err());
    }

    #[tokio::test]
    async fn resolver_requires_some_strategy() {
        let config = PushConfig::default();
        assert!(TokenResolver::from_config(&config).is_err());

        let config = PushConfig {
            jwt_secret: Some("s3cret".to_string()),
            ..PushConfig::default()
        };
        let resolver = TokenResolver::from_config(&config).unwrap();
        let exp = chrono::Utc::now().timestamp() + 600;
        let token = token(b"s3cret", "u1", exp);
        assert_eq!(resolver.validate_token(&token).await.unwrap(), "u1");
    }

    #[test]
    fn bearer_header_is_stripped() {
        let mut headers = HeaderMap::new();
        headers.insert("Authorization", "Bearer abc.def".parse().unwrap());
        assert_eq!(bearer_token(&headers), Some("abc.def".to_string()));

        let mut headers = HeaderMap::new();
        headers.insert("Authorization", "Basic abc".parse().unwrap());
        assert_eq!(bearer_token(&headers), None);
    }
}
