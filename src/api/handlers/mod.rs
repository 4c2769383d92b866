pub mod auth;
pub mod documents;
pub mod realtime;
pub mod versions;

use axum::Json;
use chrono::{SecondsFormat, Utc};
use uuid::Uuid;

use crate::db::Database;
use crate::error::ApiError;
use crate::models::Role;

// ============================================================
// Health
// ============================================================

pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "success",
        "message": "Server is running",
        "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
    }))
}

pub async fn not_found() -> ApiError {
    ApiError::NotFound("Route not found".to_string())
}

// ============================================================
// Access control
// ============================================================

/// The user's role on a document. Missing documents are 404, documents the
/// user has no access to are 403.
fn require_member(db: &Database, document_id: Uuid, user_id: Uuid) -> Result<Role, ApiError> {
    db.get_document_role(document_id, user_id)?
        .ok_or_else(|| ApiError::Forbidden("You do not have access to this document".to_string()))
}

fn require_editor(db: &Database, document_id: Uuid, user_id: Uuid) -> Result<Role, ApiError> {
    let role = require_member(db, document_id, user_id)?;
    if !role.can_edit() {
        return Err(ApiError::Forbidden(
            "You have read-only access to this document".to_string(),
        ));
    }
    Ok(role)
}

fn require_owner(db: &Database, document_id: Uuid, user_id: Uuid) -> Result<(), ApiError> {
    match require_member(db, document_id, user_id)? {
        Role::Owner => Ok(()),
        _ => Err(ApiError::Forbidden(
            "Only the owner can do that".to_string(),
        )),
    }
}

/// Trimmed text, or `None` if it is blank.
fn non_blank(text: Option<String>) -> Option<String> {
    text.map(|t| t.trim().to_string()).filter(|t| !t.is_empty())
}
