//! Identity gate: Cloudflare Access JWT verification plus the upload
//! allowlist.
//!
//! Tokens are RS256 JWTs minted by the identity proxy; their signatures are
//! checked against the team's JWKS. The key set is process-scoped state with
//! a time-based expiry, refreshed on expiry or when a token references an
//! unknown `kid` (key rotation). Access rotates keys rarely, so the forced
//! refetch on a bad `kid` is not a hot path.

use crate::AppState;
use crate::errors::AppError;
use axum::{
    extract::{Request, State},
    http::{HeaderMap, StatusCode, header},
    middleware::Next,
    response::Response,
};
use jsonwebtoken::{
    Algorithm, DecodingKey, Validation, decode, decode_header,
    jwk::{Jwk, JwkSet},
};
use serde::Deserialize;
use std::{
    collections::HashSet,
    sync::Arc,
    time::{Duration, Instant},
};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, error};

/// Header set by Cloudflare Access on proxied requests.
const TOKEN_HEADER: &str = "cf-access-jwt-assertion";
/// Cookie fallback used by browser sessions.
const TOKEN_COOKIE: &str = "CF_Authorization";

const JWKS_FETCH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Unauthorized")]
    Unauthorized,
    #[error("could not fetch JWKS: {0}")]
    JwksUnavailable(String),
}

/// Claims we care about from the access token. Everything else is validated
/// structurally (signature, expiry, audience) and then ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct Claims {
    pub email: Option<String>,
}

struct CachedJwks {
    fetched_at: Instant,
    set: JwkSet,
}

/// Process-scoped JWT verifier with a read-through JWKS cache.
#[derive(Clone)]
pub struct AuthVerifier {
    http: reqwest::Client,
    certs_url: String,
    policy_aud: String,
    cache_ttl: Duration,
    jwks: Arc<RwLock<Option<CachedJwks>>>,
}

impl AuthVerifier {
    pub fn new(certs_url: String, policy_aud: String, cache_ttl: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            certs_url,
            policy_aud,
            cache_ttl,
            jwks: Arc::new(RwLock::new(None)),
        }
    }

    /// Validate signature, expiry, and audience; return the claims.
    pub async fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        let header = decode_header(token).map_err(|_| AuthError::Unauthorized)?;
        let kid = header.kid.ok_or(AuthError::Unauthorized)?;
        let jwk = self.jwk_for(&kid).await?;
        let key = DecodingKey::from_jwk(&jwk).map_err(|_| AuthError::Unauthorized)?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_audience(&[&self.policy_aud]);

        let data = decode::<Claims>(token, &key, &validation).map_err(|err| {
            debug!("token rejected: {}", err);
            AuthError::Unauthorized
        })?;
        Ok(data.claims)
    }

    /// Look up a signing key, serving from cache while fresh and refetching
    /// on expiry or unknown `kid`.
    async fn jwk_for(&self, kid: &str) -> Result<Jwk, AuthError> {
        if let Some(cached) = self.jwks.read().await.as_ref() {
            if cached.fetched_at.elapsed() < self.cache_ttl {
                if let Some(jwk) = cached.set.find(kid) {
                    return Ok(jwk.clone());
                }
            }
        }

        let set = self.fetch_jwks().await?;
        let jwk = set.find(kid).cloned();
        *self.jwks.write().await = Some(CachedJwks {
            fetched_at: Instant::now(),
            set,
        });

        jwk.ok_or(AuthError::Unauthorized)
    }

    async fn fetch_jwks(&self) -> Result<JwkSet, AuthError> {
        debug!(url = %self.certs_url, "refreshing JWKS");
        let resp = self
            .http
            .get(&self.certs_url)
            .timeout(JWKS_FETCH_TIMEOUT)
            .send()
            .await
            .and_then(|resp| resp.error_for_status())
            .map_err(|err| AuthError::JwksUnavailable(err.to_string()))?;

        resp.json::<JwkSet>()
            .await
            .map_err(|err| AuthError::JwksUnavailable(err.to_string()))
    }
}

/// Axum middleware guarding every image route.
///
/// With auth disabled there is no verifier; requests pass through without
/// claims and the allowlist check is skipped too.
pub async fn require_auth(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let Some(verifier) = state.auth.as_ref() else {
        return Ok(next.run(req).await);
    };

    let token = extract_token(req.headers())
        .ok_or_else(|| AppError::new(StatusCode::UNAUTHORIZED, "Unauthorized"))?;
    let claims = verifier.verify(&token).await?;
    req.extensions_mut().insert(claims);
    Ok(next.run(req).await)
}

/// Pull the access token from the header or the session cookie.
pub fn extract_token(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(TOKEN_HEADER).and_then(|v| v.to_str().ok()) {
        if !value.is_empty() {
            return Some(value.to_string());
        }
    }
    let cookies = headers.get(header::COOKIE)?.to_str().ok()?;
    cookie_value(cookies, TOKEN_COOKIE).map(String::from)
}

fn cookie_value<'a>(cookies: &'a str, name: &str) -> Option<&'a str> {
    cookies
        .split(';')
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value)
}

/// Read the set of emails allowed to upload.
///
/// Re-read on every POST so edits take effect without a restart. A missing
/// or malformed file fails closed as a 500.
pub async fn load_allowlist(path: &str) -> Result<HashSet<String>, AppError> {
    let raw = tokio::fs::read_to_string(path).await.map_err(|err| {
        error!(path, "could not read allowlist: {}", err);
        AppError::internal("Internal Server Error")
    })?;
    serde_json::from_str(&raw).map_err(|err| {
        error!(path, "could not parse allowlist: {}", err);
        AppError::internal("Internal Server Error")
    })
}

/// The allowlist check for write operations.
pub fn ensure_email_allowed(claims: &Claims, allowlist: &HashSet<String>) -> Result<(), AppError> {
    let email = claims
        .email
        .as_deref()
        .filter(|email| !email.is_empty())
        .ok_or_else(|| AppError::new(StatusCode::UNAUTHORIZED, "Unauthorized"))?;

    if allowlist.contains(email) {
        Ok(())
    } else {
        Err(AppError::new(StatusCode::FORBIDDEN, "Forbidden"))
    }
}
