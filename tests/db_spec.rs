use docsync::db::{Database, StoreError};
use docsync::models::*;
use speculate2::speculate;
use uuid::Uuid;

fn create_test_user(db: &Database, name: &str) -> User {
    db.create_user(NewUser {
        name: name.to_string(),
        email: format!("{}@example.com", name.to_lowercase()),
        password_hash: "$2b$04$hash".to_string(),
    })
    .expect("Failed to create user")
}

fn create_test_document(db: &Database, owner: &User, title: &str) -> Document {
    db.create_document(
        owner.id,
        CreateDocumentInput {
            title: title.to_string(),
            content: Some("hello".to_string()),
        },
    )
    .expect("Failed to create document")
}

fn snapshot(db: &Database, document: &Document, content: &str, revision: u64) -> Version {
    db.create_version(NewVersion {
        document_id: document.id,
        label: None,
        content: content.to_string(),
        revision,
        author_id: Some(document.owner_id),
    })
    .expect("Failed to create version")
}

speculate! {
    before {
        let db = Database::open_memory().expect("Failed to create in-memory database");
        db.migrate().expect("Failed to run migrations");
    }

    describe "users" {
        it "normalizes the email on create" {
            let user = db.create_user(NewUser {
                name: "  Ada  ".to_string(),
                email: " Ada@Example.COM ".to_string(),
                password_hash: "hash".to_string(),
            }).expect("Failed to create user");

            assert_eq!(user.name, "Ada");
            assert_eq!(user.email, "ada@example.com");
        }

        it "rejects a duplicate email as a conflict" {
            create_test_user(&db, "Ada");
            let err = db.create_user(NewUser {
                name: "Other".to_string(),
                email: "ADA@example.com".to_string(),
                password_hash: "hash".to_string(),
            }).unwrap_err();

            assert!(matches!(err.downcast_ref::<StoreError>(), Some(StoreError::Conflict(_))));
        }

        it "finds credentials by email in any case" {
            let user = create_test_user(&db, "Ada");
            let credentials = db.get_user_credentials("ADA@EXAMPLE.COM")
                .expect("Query failed")
                .expect("User not found");

            assert_eq!(credentials.user, user);
            assert_eq!(credentials.password_hash, "$2b$04$hash");
        }

        it "returns None for an unknown user" {
            assert!(db.get_user(Uuid::new_v4()).expect("Query failed").is_none());
            assert!(db.get_user_by_email("nobody@example.com").expect("Query failed").is_none());
        }
    }

    describe "documents" {
        it "creates a document at revision zero" {
            let owner = create_test_user(&db, "Ada");
            let document = create_test_document(&db, &owner, "Notes");

            assert_eq!(document.revision, 0);
            assert_eq!(document.content, "hello");
            assert_eq!(document.owner_id, owner.id);
        }

        it "defaults content to empty" {
            let owner = create_test_user(&db, "Ada");
            let document = db.create_document(owner.id, CreateDocumentInput {
                title: "Blank".to_string(),
                content: None,
            }).expect("Failed to create");

            assert_eq!(document.content, "");
        }

        it "saves content with its revision" {
            let owner = create_test_user(&db, "Ada");
            let document = create_test_document(&db, &owner, "Notes");

            assert!(db.save_document_content(document.id, "hello world", 3).expect("Save failed"));
            let stored = db.get_document(document.id).expect("Query failed").expect("Missing");
            assert_eq!(stored.content, "hello world");
            assert_eq!(stored.revision, 3);

            assert!(!db.save_document_content(Uuid::new_v4(), "x", 1).expect("Save failed"));
        }

        it "updates the title only" {
            let owner = create_test_user(&db, "Ada");
            let document = create_test_document(&db, &owner, "Notes");

            let updated = db.update_document(document.id, UpdateDocumentInput {
                title: Some("Renamed".to_string()),
            }).expect("Update failed").expect("Missing");

            assert_eq!(updated.title, "Renamed");
            assert_eq!(updated.content, "hello");
            assert!(db.update_document(Uuid::new_v4(), UpdateDocumentInput { title: None })
                .expect("Update failed")
                .is_none());
        }

        it "lists owned and shared documents, most recently updated first" {
            let ada = create_test_user(&db, "Ada");
            let grace = create_test_user(&db, "Grace");
            let own = create_test_document(&db, &ada, "Own");
            let shared = create_test_document(&db, &grace, "Shared");
            create_test_document(&db, &grace, "Private");
            db.upsert_collaborator(shared.id, &ada, Role::Viewer).expect("Share failed");

            std::thread::sleep(std::time::Duration::from_millis(5));
            db.save_document_content(own.id, "newer", 1).expect("Save failed");

            let documents = db.get_documents_for_user(ada.id).expect("Query failed");
            assert_eq!(documents.len(), 2);
            assert_eq!(documents[0].id, own.id);
            assert_eq!(documents[0].role, Role::Owner);
            assert_eq!(documents[1].id, shared.id);
            assert_eq!(documents[1].role, Role::Viewer);
        }

        it "deletes a document" {
            let owner = create_test_user(&db, "Ada");
            let document = create_test_document(&db, &owner, "Notes");

            assert!(db.delete_document(document.id).expect("Delete failed"));
            assert!(!db.delete_document(document.id).expect("Delete failed"));
            assert!(db.get_document(document.id).expect("Query failed").is_none());
        }
    }

    describe "roles" {
        it "reports the owner" {
            let owner = create_test_user(&db, "Ada");
            let document = create_test_document(&db, &owner, "Notes");

            assert_eq!(db.get_document_role(document.id, owner.id).expect("Query failed"), Some(Role::Owner));
        }

        it "reports collaborators and strangers" {
            let owner = create_test_user(&db, "Ada");
            let editor = create_test_user(&db, "Grace");
            let stranger = create_test_user(&db, "Eve");
            let document = create_test_document(&db, &owner, "Notes");
            db.upsert_collaborator(document.id, &editor, Role::Editor).expect("Share failed");

            assert_eq!(db.get_document_role(document.id, editor.id).expect("Query failed"), Some(Role::Editor));
            assert_eq!(db.get_document_role(document.id, stranger.id).expect("Query failed"), None);
        }

        it "fails with not found for a missing document" {
            let owner = create_test_user(&db, "Ada");
            let err = db.get_document_role(Uuid::new_v4(), owner.id).unwrap_err();
            assert_eq!(err.downcast_ref::<StoreError>(), Some(&StoreError::NotFound("Document")));
        }
    }

    describe "collaborators" {
        it "updates the role when added twice" {
            let owner = create_test_user(&db, "Ada");
            let grace = create_test_user(&db, "Grace");
            let document = create_test_document(&db, &owner, "Notes");

            db.upsert_collaborator(document.id, &grace, Role::Viewer).expect("Share failed");
            let updated = db.upsert_collaborator(document.id, &grace, Role::Editor).expect("Share failed");
            assert_eq!(updated.role, Role::Editor);

            let collaborators = db.get_collaborators(document.id).expect("Query failed");
            assert_eq!(collaborators.len(), 1);
            assert_eq!(collaborators[0].email, "grace@example.com");
            assert_eq!(collaborators[0].role, Role::Editor);
        }

        it "refuses the owner role" {
            let owner = create_test_user(&db, "Ada");
            let grace = create_test_user(&db, "Grace");
            let document = create_test_document(&db, &owner, "Notes");

            assert!(db.upsert_collaborator(document.id, &grace, Role::Owner).is_err());
        }

        it "removes a collaborator" {
            let owner = create_test_user(&db, "Ada");
            let grace = create_test_user(&db, "Grace");
            let document = create_test_document(&db, &owner, "Notes");
            db.upsert_collaborator(document.id, &grace, Role::Editor).expect("Share failed");

            assert!(db.remove_collaborator(document.id, grace.id).expect("Remove failed"));
            assert!(!db.remove_collaborator(document.id, grace.id).expect("Remove failed"));
            assert_eq!(db.get_document_role(document.id, grace.id).expect("Query failed"), None);
        }
    }

    describe "versions" {
        it "numbers versions per document from one" {
            let owner = create_test_user(&db, "Ada");
            let first = create_test_document(&db, &owner, "First");
            let second = create_test_document(&db, &owner, "Second");

            assert_eq!(snapshot(&db, &first, "a", 1).number, 1);
            assert_eq!(snapshot(&db, &first, "ab", 2).number, 2);
            assert_eq!(snapshot(&db, &second, "x", 1).number, 1);
        }

        it "lists summaries newest first" {
            let owner = create_test_user(&db, "Ada");
            let document = create_test_document(&db, &owner, "Notes");
            snapshot(&db, &document, "a", 1);
            snapshot(&db, &document, "añb", 4);

            let versions = db.get_versions(document.id).expect("Query failed");
            assert_eq!(versions.len(), 2);
            assert_eq!(versions[0].number, 2);
            assert_eq!(versions[0].length, 3);
            assert_eq!(versions[1].number, 1);
        }

        it "gets a full version by id" {
            let owner = create_test_user(&db, "Ada");
            let document = create_test_document(&db, &owner, "Notes");
            let created = snapshot(&db, &document, "content", 7);

            let found = db.get_version(created.id).expect("Query failed").expect("Missing");
            assert_eq!(found.content, "content");
            assert_eq!(found.revision, 7);
            assert_eq!(found.author_id, Some(owner.id));
        }

        it "reports the latest snapshotted revision" {
            let owner = create_test_user(&db, "Ada");
            let document = create_test_document(&db, &owner, "Notes");
            assert_eq!(db.get_latest_version_revision(document.id).expect("Query failed"), None);

            snapshot(&db, &document, "a", 5);
            snapshot(&db, &document, "b", 9);
            assert_eq!(db.get_latest_version_revision(document.id).expect("Query failed"), Some(9));
        }
    }
}
