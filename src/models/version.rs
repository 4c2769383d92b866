use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An immutable snapshot of a document's content.
///
/// Versions are numbered per document starting at 1. They are created on
/// request, periodically by the collaboration session, and when the last
/// participant leaves a session with unsaved changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Version {
    pub id: Uuid,
    pub document_id: Uuid,
    pub number: u64,
    pub label: Option<String>,
    pub content: String,
    /// Document revision the snapshot was taken at.
    pub revision: u64,
    /// Who triggered the snapshot. `None` for system snapshots.
    pub author_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// A version listing entry without its content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VersionSummary {
    pub id: Uuid,
    pub document_id: Uuid,
    pub number: u64,
    pub label: Option<String>,
    pub revision: u64,
    pub author_id: Option<Uuid>,
    /// Content length in characters.
    pub length: u64,
    pub created_at: DateTime<Utc>,
}

impl From<&Version> for VersionSummary {
    fn from(version: &Version) -> Self {
        Self {
            id: version.id,
            document_id: version.document_id,
            number: version.number,
            label: version.label.clone(),
            revision: version.revision,
            author_id: version.author_id,
            length: version.content.chars().count() as u64,
            created_at: version.created_at,
        }
    }
}

/// Input for `POST /api/versions/document/{document_id}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateVersionInput {
    #[serde(default)]
    pub label: Option<String>,
}

/// Store-level input for recording a snapshot.
#[derive(Debug, Clone)]
pub struct NewVersion {
    pub document_id: Uuid,
    pub label: Option<String>,
    pub content: String,
    pub revision: u64,
    pub author_id: Option<Uuid>,
}
