//! Domain models for docsync.
//!
//! # Core Concepts
//!
//! - [`User`]: An account that authenticates with a bearer token.
//! - [`Document`]: Editable text owned by one user and shared with
//!   collaborators under a [`Role`].
//! - [`Version`]: Append-only snapshots of a document's content, numbered per
//!   document.
//!
//! Live collaboration sessions are not persisted; they live in
//! [`crate::collab`] and write back through the store.

mod document;
mod user;
mod version;

pub use document::*;
pub use user::*;
pub use version::*;
