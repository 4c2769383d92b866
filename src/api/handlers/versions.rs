use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use uuid::Uuid;

use super::{non_blank, require_editor, require_member};
use crate::api::middleware::AuthUser;
use crate::collab::CollabHub;
use crate::db::Database;
use crate::error::{success, ApiError, ApiJson, ApiResult, Envelope};
use crate::models::*;

pub async fn list_versions(
    State(db): State<Database>,
    AuthUser(user): AuthUser,
    Path(document_id): Path<Uuid>,
) -> ApiResult<Json<Envelope<Vec<VersionSummary>>>> {
    require_member(&db, document_id, user.id)?;
    Ok(success(db.get_versions(document_id)?))
}

pub async fn create_version(
    State(db): State<Database>,
    State(hub): State<CollabHub>,
    AuthUser(user): AuthUser,
    Path(document_id): Path<Uuid>,
    ApiJson(input): ApiJson<CreateVersionInput>,
) -> ApiResult<(StatusCode, Json<Envelope<Version>>)> {
    require_editor(&db, document_id, user.id)?;
    let version = hub
        .snapshot_now(document_id, non_blank(input.label), Some(user.id))
        .await?;
    Ok((StatusCode::CREATED, success(version)))
}

pub async fn get_version(
    State(db): State<Database>,
    AuthUser(user): AuthUser,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Envelope<Version>>> {
    let version = db
        .get_version(id)?
        .ok_or_else(|| ApiError::not_found("Version"))?;
    require_member(&db, version.document_id, user.id)?;
    Ok(success(version))
}

/// Make a version's content current again, keeping what it replaces as a
/// new version.
pub async fn restore_version(
    State(db): State<Database>,
    State(hub): State<CollabHub>,
    AuthUser(user): AuthUser,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Envelope<Document>>> {
    let version = db
        .get_version(id)?
        .ok_or_else(|| ApiError::not_found("Version"))?;
    let document_id = version.document_id;
    require_editor(&db, document_id, user.id)?;

    let label = format!("Before restore of v{}", version.number);
    let (_, live) = hub
        .restore(document_id, &version.content, label, user.id)
        .await?;

    let mut document = db
        .get_document(document_id)?
        .ok_or_else(|| ApiError::not_found("Document"))?;
    document.content = live.content;
    document.revision = live.revision;

    tracing::info!(
        document_id = %document_id,
        version = version.number,
        "Restored version"
    );
    Ok(success(document))
}
