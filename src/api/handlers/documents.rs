use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use uuid::Uuid;

use super::{non_blank, require_editor, require_member, require_owner};
use crate::api::middleware::AuthUser;
use crate::collab::{CollabHub, Participant};
use crate::db::Database;
use crate::error::{success, ApiError, ApiJson, ApiResult, Envelope};
use crate::models::*;

// ============================================================
// Documents
// ============================================================

pub async fn list_documents(
    State(db): State<Database>,
    AuthUser(user): AuthUser,
) -> ApiResult<Json<Envelope<Vec<DocumentSummary>>>> {
    Ok(success(db.get_documents_for_user(user.id)?))
}

pub async fn create_document(
    State(db): State<Database>,
    AuthUser(user): AuthUser,
    ApiJson(input): ApiJson<CreateDocumentInput>,
) -> ApiResult<(StatusCode, Json<Envelope<Document>>)> {
    let title = non_blank(Some(input.title))
        .ok_or_else(|| ApiError::BadRequest("Title is required".to_string()))?;

    let document = db.create_document(
        user.id,
        CreateDocumentInput {
            title,
            content: input.content,
        },
    )?;
    tracing::info!(document_id = %document.id, owner_id = %user.id, "Created document");
    Ok((StatusCode::CREATED, success(document)))
}

pub async fn get_document(
    State(db): State<Database>,
    State(hub): State<CollabHub>,
    AuthUser(user): AuthUser,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Envelope<Document>>> {
    require_member(&db, id, user.id)?;
    let mut document = db
        .get_document(id)?
        .ok_or_else(|| ApiError::not_found("Document"))?;

    if let Some(live) = hub.live_state(id).await {
        document.content = live.content;
        document.revision = live.revision;
    }
    Ok(success(document))
}

pub async fn update_document(
    State(db): State<Database>,
    State(hub): State<CollabHub>,
    AuthUser(user): AuthUser,
    Path(id): Path<Uuid>,
    ApiJson(input): ApiJson<UpdateDocumentInput>,
) -> ApiResult<Json<Envelope<Document>>> {
    require_editor(&db, id, user.id)?;
    let title = match input.title {
        Some(title) => Some(
            non_blank(Some(title))
                .ok_or_else(|| ApiError::BadRequest("Title cannot be empty".to_string()))?,
        ),
        None => None,
    };

    let mut document = db
        .update_document(id, UpdateDocumentInput { title })?
        .ok_or_else(|| ApiError::not_found("Document"))?;
    if let Some(live) = hub.live_state(id).await {
        document.content = live.content;
        document.revision = live.revision;
    }
    Ok(success(document))
}

pub async fn delete_document(
    State(db): State<Database>,
    State(hub): State<CollabHub>,
    AuthUser(user): AuthUser,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    require_owner(&db, id, user.id)?;
    if !db.delete_document(id)? {
        return Err(ApiError::not_found("Document"));
    }
    hub.close_document(id).await;

    tracing::info!(document_id = %id, "Deleted document");
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================
// Collaborators
// ============================================================

pub async fn list_collaborators(
    State(db): State<Database>,
    AuthUser(user): AuthUser,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Envelope<Vec<Collaborator>>>> {
    require_member(&db, id, user.id)?;
    Ok(success(db.get_collaborators(id)?))
}

pub async fn add_collaborator(
    State(db): State<Database>,
    AuthUser(user): AuthUser,
    Path(id): Path<Uuid>,
    ApiJson(input): ApiJson<AddCollaboratorInput>,
) -> ApiResult<(StatusCode, Json<Envelope<Collaborator>>)> {
    require_owner(&db, id, user.id)?;
    if input.role == Role::Owner {
        return Err(ApiError::BadRequest(
            "Collaborators can be editors or viewers".to_string(),
        ));
    }

    let collaborator = db
        .get_user_by_email(&input.email)?
        .ok_or_else(|| ApiError::not_found("User"))?;
    if collaborator.id == user.id {
        return Err(ApiError::BadRequest(
            "The owner already has access".to_string(),
        ));
    }

    let added = db.upsert_collaborator(id, &collaborator, input.role)?;
    Ok((StatusCode::CREATED, success(added)))
}

pub async fn remove_collaborator(
    State(db): State<Database>,
    AuthUser(user): AuthUser,
    Path((id, user_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<StatusCode> {
    require_owner(&db, id, user.id)?;
    if db.remove_collaborator(id, user_id)? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found("Collaborator"))
    }
}

/// Users connected to the document's live session right now.
pub async fn list_participants(
    State(db): State<Database>,
    State(hub): State<CollabHub>,
    AuthUser(user): AuthUser,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Envelope<Vec<Participant>>>> {
    require_member(&db, id, user.id)?;
    Ok(success(hub.participants(id).await))
}
