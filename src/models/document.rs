use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An editable text document.
///
/// `content` and `revision` in the store may trail the live collaboration
/// session by up to one flush interval; the HTTP layer reads through the
/// session when one is active.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub title: String,
    pub content: String,
    /// Number of operations applied since creation. Strictly increasing.
    pub revision: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A document listing entry without its content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentSummary {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub title: String,
    pub revision: u64,
    /// The requesting user's role on this document.
    pub role: Role,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A user's access level on a document.
///
/// - `Owner`: created the document; may delete it and manage collaborators
/// - `Editor`: may edit content, rename, snapshot and restore versions
/// - `Viewer`: may read and join live sessions without editing
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Owner,
    Editor,
    Viewer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Owner => "owner",
            Self::Editor => "editor",
            Self::Viewer => "viewer",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "owner" => Some(Self::Owner),
            "editor" => Some(Self::Editor),
            "viewer" => Some(Self::Viewer),
            _ => None,
        }
    }

    pub fn can_edit(&self) -> bool {
        matches!(self, Self::Owner | Self::Editor)
    }
}

/// Input for creating a new document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateDocumentInput {
    pub title: String,
    /// Initial content. Defaults to empty.
    #[serde(default)]
    pub content: Option<String>,
}

/// Input for updating document metadata.
///
/// Content is deliberately absent: it only changes through the realtime
/// channel or a version restore, so that every change gets a revision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateDocumentInput {
    pub title: Option<String>,
}

/// A user with access to a document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Collaborator {
    pub user_id: Uuid,
    pub name: String,
    pub email: String,
    pub role: Role,
    pub added_at: DateTime<Utc>,
}

/// Input for granting a user access to a document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddCollaboratorInput {
    pub email: String,
    pub role: Role,
}
