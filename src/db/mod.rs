mod schema;

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Result;
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, Row};
use uuid::Uuid;

use crate::models::*;

/// Domain failures raised inside the store.
///
/// Carried through `anyhow::Error` and recovered by the HTTP layer with
/// `downcast_ref`, so store methods keep returning `anyhow::Result`.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("{0}")]
    Conflict(String),
}

pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn open(path: PathBuf) -> Result<Self> {
        let parent = path
            .parent()
            .ok_or_else(|| anyhow::anyhow!("Database path has no parent directory"))?;
        std::fs::create_dir_all(parent)?;
        let conn = Connection::open(&path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::from_connection(conn)
    }

    pub fn open_default() -> Result<Self> {
        let dirs = directories::ProjectDirs::from("", "", "docsync")
            .ok_or_else(|| anyhow::anyhow!("Could not determine data directory"))?;
        let db_path = dirs.data_dir().join("docsync.db");
        Self::open(db_path)
    }

    pub fn open_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow::anyhow!("database lock poisoned"))
    }

    pub fn migrate(&self) -> Result<()> {
        let conn = self.conn()?;
        schema::run_migrations(&conn)
    }

    // ============================================================
    // User operations
    // ============================================================

    pub fn create_user(&self, input: NewUser) -> Result<User> {
        let email = normalize_email(&input.email);
        if self.get_user_by_email(&email)?.is_some() {
            return Err(StoreError::Conflict("Email is already registered".to_string()).into());
        }

        let conn = self.conn()?;
        let id = Uuid::new_v4();
        let now = Utc::now();

        conn.execute(
            "INSERT INTO users (id, name, email, password_hash, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)",
            (
                id.to_string(),
                input.name.trim(),
                &email,
                &input.password_hash,
                now.to_rfc3339(),
                now.to_rfc3339(),
            ),
        )?;

        Ok(User {
            id,
            name: input.name.trim().to_string(),
            email,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn get_user(&self, id: Uuid) -> Result<Option<User>> {
        let conn = self.conn()?;
        let user = conn
            .query_row(
                "SELECT id, name, email, created_at, updated_at FROM users WHERE id = ?",
                [id.to_string()],
                user_from_row,
            )
            .optional()?;
        Ok(user)
    }

    pub fn get_user_by_email(&self, email: &str) -> Result<Option<User>> {
        Ok(self.get_user_credentials(email)?.map(|c| c.user))
    }

    pub fn get_user_credentials(&self, email: &str) -> Result<Option<UserCredentials>> {
        let conn = self.conn()?;
        let credentials = conn
            .query_row(
                "SELECT id, name, email, created_at, updated_at, password_hash
                 FROM users WHERE email = ?",
                [normalize_email(email)],
                |row| {
                    Ok(UserCredentials {
                        user: user_from_row(row)?,
                        password_hash: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(credentials)
    }

    // ============================================================
    // Document operations
    // ============================================================

    pub fn create_document(&self, owner_id: Uuid, input: CreateDocumentInput) -> Result<Document> {
        let conn = self.conn()?;
        let id = Uuid::new_v4();
        let now = Utc::now();
        let content = input.content.unwrap_or_default();

        conn.execute(
            "INSERT INTO documents (id, owner_id, title, content, revision, created_at, updated_at)
             VALUES (?, ?, ?, ?, 0, ?, ?)",
            (
                id.to_string(),
                owner_id.to_string(),
                &input.title,
                &content,
                now.to_rfc3339(),
                now.to_rfc3339(),
            ),
        )?;

        Ok(Document {
            id,
            owner_id,
            title: input.title,
            content,
            revision: 0,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn get_document(&self, id: Uuid) -> Result<Option<Document>> {
        let conn = self.conn()?;
        let document = conn
            .query_row(
                "SELECT id, owner_id, title, content, revision, created_at, updated_at
                 FROM documents WHERE id = ?",
                [id.to_string()],
                document_from_row,
            )
            .optional()?;
        Ok(document)
    }

    /// Documents the user owns or collaborates on, most recently updated first.
    pub fn get_documents_for_user(&self, user_id: Uuid) -> Result<Vec<DocumentSummary>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT d.id, d.owner_id, d.title, d.revision, d.created_at, d.updated_at,
                    CASE WHEN d.owner_id = ?1 THEN 'owner' ELSE c.role END AS role
             FROM documents d
             LEFT JOIN document_collaborators c ON c.document_id = d.id AND c.user_id = ?1
             WHERE d.owner_id = ?1 OR c.user_id IS NOT NULL
             ORDER BY d.updated_at DESC, d.title",
        )?;

        let documents = stmt
            .query_map([user_id.to_string()], |row| {
                Ok(DocumentSummary {
                    id: parse_uuid(row.get::<_, String>(0)?),
                    owner_id: parse_uuid(row.get::<_, String>(1)?),
                    title: row.get(2)?,
                    revision: row.get::<_, i64>(3)? as u64,
                    created_at: parse_datetime(row.get::<_, String>(4)?),
                    updated_at: parse_datetime(row.get::<_, String>(5)?),
                    role: Role::from_str(&row.get::<_, String>(6)?).unwrap_or(Role::Viewer),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(documents)
    }

    pub fn update_document(&self, id: Uuid, input: UpdateDocumentInput) -> Result<Option<Document>> {
        let Some(existing) = self.get_document(id)? else {
            return Ok(None);
        };

        let conn = self.conn()?;
        let now = Utc::now();
        let title = input.title.unwrap_or(existing.title);

        conn.execute(
            "UPDATE documents SET title = ?, updated_at = ? WHERE id = ?",
            (&title, now.to_rfc3339(), id.to_string()),
        )?;

        Ok(Some(Document {
            title,
            updated_at: now,
            ..existing
        }))
    }

    /// Write back content produced by the collaboration layer.
    ///
    /// Returns false if the document no longer exists.
    pub fn save_document_content(&self, id: Uuid, content: &str, revision: u64) -> Result<bool> {
        let conn = self.conn()?;
        let rows = conn.execute(
            "UPDATE documents SET content = ?, revision = ?, updated_at = ? WHERE id = ?",
            (
                content,
                revision as i64,
                Utc::now().to_rfc3339(),
                id.to_string(),
            ),
        )?;
        Ok(rows > 0)
    }

    pub fn delete_document(&self, id: Uuid) -> Result<bool> {
        let conn = self.conn()?;
        let rows = conn.execute("DELETE FROM documents WHERE id = ?", [id.to_string()])?;
        Ok(rows > 0)
    }

    /// The user's role on a document, or `None` without access.
    ///
    /// Fails with [`StoreError::NotFound`] if the document does not exist.
    pub fn get_document_role(&self, document_id: Uuid, user_id: Uuid) -> Result<Option<Role>> {
        let conn = self.conn()?;
        let owner: Option<String> = conn
            .query_row(
                "SELECT owner_id FROM documents WHERE id = ?",
                [document_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;

        let Some(owner) = owner else {
            return Err(StoreError::NotFound("Document").into());
        };
        if parse_uuid(owner) == user_id {
            return Ok(Some(Role::Owner));
        }

        let role: Option<String> = conn
            .query_row(
                "SELECT role FROM document_collaborators WHERE document_id = ? AND user_id = ?",
                [document_id.to_string(), user_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;

        Ok(role.as_deref().and_then(Role::from_str))
    }

    // ============================================================
    // Collaborator operations
    // ============================================================

    /// Grant or change a user's role on a document.
    pub fn upsert_collaborator(&self, document_id: Uuid, user: &User, role: Role) -> Result<Collaborator> {
        if role == Role::Owner {
            anyhow::bail!("Collaborators cannot be granted the owner role");
        }

        let conn = self.conn()?;
        let now = Utc::now();

        conn.execute(
            "INSERT INTO document_collaborators (document_id, user_id, role, added_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT (document_id, user_id) DO UPDATE SET role = excluded.role",
            (
                document_id.to_string(),
                user.id.to_string(),
                role.as_str(),
                now.to_rfc3339(),
            ),
        )?;

        let added_at: String = conn.query_row(
            "SELECT added_at FROM document_collaborators WHERE document_id = ? AND user_id = ?",
            [document_id.to_string(), user.id.to_string()],
            |row| row.get(0),
        )?;

        Ok(Collaborator {
            user_id: user.id,
            name: user.name.clone(),
            email: user.email.clone(),
            role,
            added_at: parse_datetime(added_at),
        })
    }

    pub fn get_collaborators(&self, document_id: Uuid) -> Result<Vec<Collaborator>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT u.id, u.name, u.email, c.role, c.added_at
             FROM document_collaborators c
             JOIN users u ON u.id = c.user_id
             WHERE c.document_id = ?
             ORDER BY c.added_at, u.name",
        )?;

        let collaborators = stmt
            .query_map([document_id.to_string()], |row| {
                Ok(Collaborator {
                    user_id: parse_uuid(row.get::<_, String>(0)?),
                    name: row.get(1)?,
                    email: row.get(2)?,
                    role: Role::from_str(&row.get::<_, String>(3)?).unwrap_or(Role::Viewer),
                    added_at: parse_datetime(row.get::<_, String>(4)?),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(collaborators)
    }

    pub fn remove_collaborator(&self, document_id: Uuid, user_id: Uuid) -> Result<bool> {
        let conn = self.conn()?;
        let rows = conn.execute(
            "DELETE FROM document_collaborators WHERE document_id = ? AND user_id = ?",
            [document_id.to_string(), user_id.to_string()],
        )?;
        Ok(rows > 0)
    }

    // ============================================================
    // Version operations
    // ============================================================

    /// Record a snapshot, numbering it after the document's latest version.
    pub fn create_version(&self, input: NewVersion) -> Result<Version> {
        let conn = self.conn()?;
        let id = Uuid::new_v4();
        let now = Utc::now();

        let number: i64 = conn.query_row(
            "SELECT COALESCE(MAX(number), 0) + 1 FROM versions WHERE document_id = ?",
            [input.document_id.to_string()],
            |row| row.get(0),
        )?;

        conn.execute(
            "INSERT INTO versions (id, document_id, number, label, content, revision, author_id, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            (
                id.to_string(),
                input.document_id.to_string(),
                number,
                &input.label,
                &input.content,
                input.revision as i64,
                input.author_id.map(|u| u.to_string()),
                now.to_rfc3339(),
            ),
        )?;

        Ok(Version {
            id,
            document_id: input.document_id,
            number: number as u64,
            label: input.label,
            content: input.content,
            revision: input.revision,
            author_id: input.author_id,
            created_at: now,
        })
    }

    pub fn get_version(&self, id: Uuid) -> Result<Option<Version>> {
        let conn = self.conn()?;
        let version = conn
            .query_row(
                "SELECT id, document_id, number, label, content, revision, author_id, created_at
                 FROM versions WHERE id = ?",
                [id.to_string()],
                version_from_row,
            )
            .optional()?;
        Ok(version)
    }

    /// Versions of a document, newest first.
    pub fn get_versions(&self, document_id: Uuid) -> Result<Vec<VersionSummary>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, document_id, number, label, revision, author_id, length(content), created_at
             FROM versions WHERE document_id = ? ORDER BY number DESC",
        )?;

        let versions = stmt
            .query_map([document_id.to_string()], |row| {
                Ok(VersionSummary {
                    id: parse_uuid(row.get::<_, String>(0)?),
                    document_id: parse_uuid(row.get::<_, String>(1)?),
                    number: row.get::<_, i64>(2)? as u64,
                    label: row.get(3)?,
                    revision: row.get::<_, i64>(4)? as u64,
                    author_id: row.get::<_, Option<String>>(5)?.map(parse_uuid),
                    length: row.get::<_, i64>(6)? as u64,
                    created_at: parse_datetime(row.get::<_, String>(7)?),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(versions)
    }

    /// Revision of the most recent snapshot, if any.
    pub fn get_latest_version_revision(&self, document_id: Uuid) -> Result<Option<u64>> {
        let conn = self.conn()?;
        let revision: Option<i64> = conn.query_row(
            "SELECT MAX(revision) FROM versions WHERE document_id = ?",
            [document_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(revision.map(|r| r as u64))
    }
}

impl Clone for Database {
    fn clone(&self) -> Self {
        Self {
            conn: self.conn.clone(),
        }
    }
}

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: parse_uuid(row.get::<_, String>(0)?),
        name: row.get(1)?,
        email: row.get(2)?,
        created_at: parse_datetime(row.get::<_, String>(3)?),
        updated_at: parse_datetime(row.get::<_, String>(4)?),
    })
}

fn document_from_row(row: &Row<'_>) -> rusqlite::Result<Document> {
    Ok(Document {
        id: parse_uuid(row.get::<_, String>(0)?),
        owner_id: parse_uuid(row.get::<_, String>(1)?),
        title: row.get(2)?,
        content: row.get(3)?,
        revision: row.get::<_, i64>(4)? as u64,
        created_at: parse_datetime(row.get::<_, String>(5)?),
        updated_at: parse_datetime(row.get::<_, String>(6)?),
    })
}

fn version_from_row(row: &Row<'_>) -> rusqlite::Result<Version> {
    Ok(Version {
        id: parse_uuid(row.get::<_, String>(0)?),
        document_id: parse_uuid(row.get::<_, String>(1)?),
        number: row.get::<_, i64>(2)? as u64,
        label: row.get(3)?,
        content: row.get(4)?,
        revision: row.get::<_, i64>(5)? as u64,
        author_id: row.get::<_, Option<String>>(6)?.map(parse_uuid),
        created_at: parse_datetime(row.get::<_, String>(7)?),
    })
}

fn parse_uuid(s: String) -> Uuid {
    Uuid::parse_str(&s).unwrap_or_else(|_| Uuid::nil())
}

fn parse_datetime(s: String) -> chrono::DateTime<Utc> {
    chrono::DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("docsync.db");
        let db = Database::open(path.clone()).unwrap();
        db.migrate().unwrap();
        assert!(path.exists());
    }

    #[test]
    fn foreign_keys_cascade_document_deletes() {
        let db = Database::open_memory().unwrap();
        db.migrate().unwrap();
        let user = db
            .create_user(NewUser {
                name: "Ada".into(),
                email: "ada@example.com".into(),
                password_hash: "x".into(),
            })
            .unwrap();
        let doc = db
            .create_document(
                user.id,
                CreateDocumentInput {
                    title: "Notes".into(),
                    content: None,
                },
            )
            .unwrap();
        db.create_version(NewVersion {
            document_id: doc.id,
            label: None,
            content: String::new(),
            revision: 0,
            author_id: Some(user.id),
        })
        .unwrap();

        assert!(db.delete_document(doc.id).unwrap());
        assert!(db.get_versions(doc.id).unwrap().is_empty());
    }
}
