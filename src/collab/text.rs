//! The shared text of a live document.
//!
//! Each room holds one authoritative Yrs document. Clients keep replicas
//! built from [`SharedText::encode_state`] and exchange Yrs v1 updates with
//! the room; the CRDT merges concurrent edits, so the server never rebases
//! anything itself.
//!
//! Positions are UTF-16 code units, the unit Yjs clients index text by.

use yrs::updates::decoder::Decode;
use yrs::{
    Assoc, Doc, GetString, IndexedSequence, OffsetKind, Options, ReadTxn, StateVector,
    StickyIndex, Text, TextRef, Transact, Update,
};

use super::CollabError;

/// Name of the root text type every replica edits.
pub const TEXT_NAME: &str = "content";

pub struct SharedText {
    doc: Doc,
    text: TextRef,
}

impl SharedText {
    pub fn new(content: &str) -> Self {
        let doc = Doc::with_options(Options {
            offset_kind: OffsetKind::Utf16,
            ..Options::default()
        });
        let text = doc.get_or_insert_text(TEXT_NAME);
        if !content.is_empty() {
            let mut txn = doc.transact_mut();
            text.insert(&mut txn, 0, content);
        }
        Self { doc, text }
    }

    pub fn content(&self) -> String {
        let txn = self.doc.transact();
        self.text.get_string(&txn)
    }

    /// Length in UTF-16 code units.
    pub fn len(&self) -> u32 {
        let txn = self.doc.transact();
        self.text.len(&txn)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The whole document as a single update.
    pub fn encode_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Integrate an update produced by a replica.
    pub fn apply_update(&self, update: &[u8]) -> Result<(), CollabError> {
        let update =
            Update::decode_v1(update).map_err(|e| CollabError::InvalidUpdate(e.to_string()))?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| CollabError::InvalidUpdate(e.to_string()))
    }

    /// Make the text equal to `content`, editing only the span between the
    /// common prefix and suffix. Returns the update, or `None` if the text
    /// already matches.
    pub fn replace(&self, content: &str) -> Option<Vec<u8>> {
        let current = self.content();
        if current == content {
            return None;
        }

        let (prefix_bytes, index) = common_prefix(&current, content);
        let old_rest = &current[prefix_bytes..];
        let new_rest = &content[prefix_bytes..];
        let suffix_bytes = common_suffix(old_rest, new_rest);
        let removed = &old_rest[..old_rest.len() - suffix_bytes];
        let inserted = &new_rest[..new_rest.len() - suffix_bytes];

        let mut txn = self.doc.transact_mut();
        if !removed.is_empty() {
            self.text.remove_range(&mut txn, index, utf16_len(removed));
        }
        if !inserted.is_empty() {
            self.text.insert(&mut txn, index, inserted);
        }
        Some(txn.encode_update_v1())
    }

    /// Pin a position to the character after it so it moves with edits.
    pub fn anchor(&self, index: u32) -> Option<StickyIndex> {
        let mut txn = self.doc.transact_mut();
        self.text.sticky_index(&mut txn, index, Assoc::After)
    }

    pub fn resolve(&self, anchor: &StickyIndex) -> Option<u32> {
        let txn = self.doc.transact();
        anchor.get_offset(&txn).map(|offset| offset.index)
    }
}

/// Common prefix length as (bytes, UTF-16 units).
fn common_prefix(a: &str, b: &str) -> (usize, u32) {
    let mut bytes = 0;
    let mut units = 0;
    for (x, y) in a.chars().zip(b.chars()) {
        if x != y {
            break;
        }
        bytes += x.len_utf8();
        units += x.len_utf16() as u32;
    }
    (bytes, units)
}

fn common_suffix(a: &str, b: &str) -> usize {
    a.chars()
        .rev()
        .zip(b.chars().rev())
        .take_while(|(x, y)| x == y)
        .map(|(x, _)| x.len_utf8())
        .sum()
}

fn utf16_len(s: &str) -> u32 {
    s.encode_utf16().count() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn replica(server: &SharedText) -> SharedText {
        let replica = SharedText::new("");
        replica.apply_update(&server.encode_state()).unwrap();
        replica
    }

    fn insert(replica: &SharedText, index: u32, chunk: &str) -> Vec<u8> {
        let mut txn = replica.doc.transact_mut();
        replica.text.insert(&mut txn, index, chunk);
        txn.encode_update_v1()
    }

    #[test]
    fn replicas_start_from_the_encoded_state() {
        let server = SharedText::new("hello");
        assert_eq!(replica(&server).content(), "hello");
    }

    #[test]
    fn concurrent_inserts_converge() {
        let server = SharedText::new("abc");
        let ada = replica(&server);
        let grace = replica(&server);

        let from_ada = insert(&ada, 0, "X");
        let from_grace = insert(&grace, 3, "Y");
        server.apply_update(&from_ada).unwrap();
        server.apply_update(&from_grace).unwrap();
        ada.apply_update(&from_grace).unwrap();
        grace.apply_update(&from_ada).unwrap();

        assert_eq!(server.content(), "XabcY");
        assert_eq!(ada.content(), server.content());
        assert_eq!(grace.content(), server.content());
    }

    #[test]
    fn malformed_update_is_rejected() {
        let server = SharedText::new("abc");
        let err = server.apply_update(&[1, 2, 3]).unwrap_err();
        assert!(matches!(err, CollabError::InvalidUpdate(_)));
        assert_eq!(server.content(), "abc");
    }

    #[test]
    fn replace_edits_only_the_changed_span() {
        let server = SharedText::new("hello world");
        let follower = replica(&server);

        let update = server.replace("hello there world").unwrap();
        follower.apply_update(&update).unwrap();

        assert_eq!(server.content(), "hello there world");
        assert_eq!(follower.content(), "hello there world");
        assert!(server.replace("hello there world").is_none());
    }

    #[test]
    fn replace_handles_multibyte_text() {
        let server = SharedText::new("añ😀b");
        assert_eq!(server.len(), 5);
        server.replace("a😀😀b").unwrap();
        assert_eq!(server.content(), "a😀😀b");
        server.replace("").unwrap();
        assert!(server.is_empty());
    }

    #[test]
    fn anchors_follow_edits_before_them() {
        let server = SharedText::new("hello");
        let anchor = server.anchor(3).unwrap();
        let editor = replica(&server);

        server.apply_update(&insert(&editor, 0, ">> ")).unwrap();

        assert_eq!(server.resolve(&anchor), Some(6));
    }
}
