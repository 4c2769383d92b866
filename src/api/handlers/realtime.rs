use std::sync::Arc;

use axum::{
    extract::{
        rejection::QueryRejection,
        ws::{rejection::WebSocketUpgradeRejection, WebSocketUpgrade},
        Query, State,
    },
    http::{header, HeaderMap},
    response::Response,
};
use serde::Deserialize;

use crate::api::middleware::{authenticate, bearer_token, AllowedOrigin};
use crate::auth::{AuthError, Authenticator};
use crate::collab::{serve_connection, CollabHub};
use crate::config::ServerConfig;
use crate::db::Database;
use crate::error::{ApiError, ApiResult};

#[derive(Debug, Deserialize)]
pub struct SocketQuery {
    pub token: Option<String>,
}

/// Upgrade to the realtime channel.
///
/// Browsers cannot set headers on a WebSocket handshake, so the token may
/// come as `?token=`. Extractor failures are taken as `Result`s so they
/// answer with the error envelope.
#[allow(clippy::too_many_arguments)]
pub async fn upgrade(
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    State(db): State<Database>,
    State(hub): State<CollabHub>,
    State(auth): State<Authenticator>,
    State(config): State<Arc<ServerConfig>>,
    State(allowed): State<AllowedOrigin>,
    headers: HeaderMap,
    query: Result<Query<SocketQuery>, QueryRejection>,
) -> ApiResult<Response> {
    if let Some(origin) = headers.get(header::ORIGIN) {
        if !allowed.matches(origin) {
            tracing::warn!("Rejected realtime connection from origin {:?}", origin);
            return Err(ApiError::Forbidden("Origin not allowed".to_string()));
        }
    }

    let Query(query) = query?;
    let token = query
        .token
        .as_deref()
        .or_else(|| bearer_token(&headers))
        .ok_or(AuthError::MissingToken)?;
    let user = authenticate(&db, &auth, token)?;

    Ok(ws?
        .max_message_size(config.body_limit)
        .on_upgrade(move |socket| serve_connection(socket, hub, user)))
}
