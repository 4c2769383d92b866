//! HTTP middleware: CORS, security headers, request logging and bearer
//! authentication.

use axum::{
    extract::{FromRef, FromRequestParts, Request},
    http::{
        header::{self, HeaderName},
        request::Parts,
        HeaderMap, HeaderValue, Method,
    },
    middleware::Next,
    response::Response,
};
use tower_http::cors::CorsLayer;

use crate::auth::{AuthError, Authenticator};
use crate::config::DEFAULT_CLIENT_URL;
use crate::db::Database;
use crate::error::ApiError;
use crate::models::User;

/// Headers added to every response.
const SECURITY_HEADERS: &[(&str, &str)] = &[
    ("content-security-policy", "default-src 'self'"),
    ("cross-origin-opener-policy", "same-origin"),
    ("cross-origin-resource-policy", "same-origin"),
    ("referrer-policy", "no-referrer"),
    ("strict-transport-security", "max-age=15552000; includeSubDomains"),
    ("x-content-type-options", "nosniff"),
    ("x-dns-prefetch-control", "off"),
    ("x-download-options", "noopen"),
    ("x-frame-options", "SAMEORIGIN"),
    ("x-permitted-cross-domain-policies", "none"),
];

/// The one browser origin allowed to call the API and open the realtime
/// channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllowedOrigin(pub HeaderValue);

impl AllowedOrigin {
    pub fn from_client_url(client_url: &str) -> Self {
        let origin = HeaderValue::from_str(client_url.trim_end_matches('/')).unwrap_or_else(|_| {
            tracing::warn!(
                "Invalid CLIENT_URL {:?}, falling back to {}",
                client_url,
                DEFAULT_CLIENT_URL
            );
            HeaderValue::from_static(DEFAULT_CLIENT_URL)
        });
        Self(origin)
    }

    pub fn matches(&self, origin: &HeaderValue) -> bool {
        self.0.as_bytes() == origin.as_bytes()
    }
}

/// CORS for the allowed origin, with credentials.
pub fn cors_layer(origin: &AllowedOrigin) -> CorsLayer {
    CorsLayer::new()
        .allow_origin(origin.0.clone())
        .allow_credentials(true)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
}

pub async fn security_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    for &(name, value) in SECURITY_HEADERS {
        headers.insert(
            HeaderName::from_static(name),
            HeaderValue::from_static(value),
        );
    }
    response
}

/// Development request log.
pub async fn log_requests(request: Request, next: Next) -> Response {
    tracing::info!("{} {}", request.method(), request.uri().path());
    next.run(request).await
}

/// Extract the token from an `Authorization: Bearer <token>` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ")?.trim();
    (!token.is_empty()).then_some(token)
}

/// Resolve a bearer token to the user it was issued to.
pub fn authenticate(db: &Database, auth: &Authenticator, token: &str) -> Result<User, ApiError> {
    let claims = auth.verify_token(token)?;
    let user = db
        .get_user(claims.user_id()?)?
        .ok_or(AuthError::InvalidToken)?;
    Ok(user)
}

/// The authenticated user making the request.
pub struct AuthUser(pub User);

impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
    Database: FromRef<S>,
    Authenticator: FromRef<S>,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers).ok_or(AuthError::MissingToken)?;
        let db = Database::from_ref(state);
        let auth = Authenticator::from_ref(state);
        authenticate(&db, &auth, token).map(AuthUser)
    }
}
