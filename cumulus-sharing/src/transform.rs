//! Identifier rewriting of file documents crossing instance boundaries.
//!
//! Only the owner of a sharing rewrites identifiers: documents it sends are
//! xored with the recipient's key, and documents it receives are xored back
//! with the same key. Recipients keep the identifiers they were given.

use crate::rule::Rule;
use crate::xor::XorKey;
use cumulus_types::doctype::ROOT_DIR_ID;
use cumulus_types::{Document, FileDoc};

/// Prepares a file or directory for a recipient.
///
/// Drops the local-only `path` of directories and rewrites the id. The
/// parent id is dropped for the sharing roots (the rule's values), so
/// identifiers of ancestors outside the sharing never leave the instance;
/// any other parent id is rewritten.
pub fn transform_file_to_sent(mut file: FileDoc, key: &XorKey, rule: &Rule) -> FileDoc {
    if file.is_dir() {
        file.path = None;
    }
    let is_root = rule.values.iter().any(|value| *value == file.id);
    file.id = key.apply(&file.id);
    file.dir_id = if is_root {
        None
    } else {
        file.dir_id.as_deref().map(|dir_id| key.apply(dir_id))
    };
    file
}

/// Maps a file received from a recipient back to local identifiers.
///
/// A sharing root keeps the parent it has locally, since the recipient's
/// parent id means nothing here.
pub fn transform_file_received(
    mut file: FileDoc,
    key: &XorKey,
    rule: &Rule,
    local: Option<&FileDoc>,
) -> FileDoc {
    file.id = key.apply(&file.id);
    file.path = None;
    let is_root = rule.values.iter().any(|value| *value == file.id);
    file.dir_id = if is_root {
        Some(
            local
                .and_then(|local| local.dir_id.clone())
                .unwrap_or_else(|| ROOT_DIR_ID.to_string()),
        )
    } else {
        file.dir_id.as_deref().map(|dir_id| key.apply(dir_id))
    };
    file
}

/// [`transform_file_to_sent`] on a generic document.
///
/// Tombstones carry no file fields; only their id is rewritten.
pub fn document_to_sent(doc: &Document, key: &XorKey, rule: &Rule) -> cumulus_types::Result<Document> {
    if doc.deleted {
        let mut tombstone = doc.clone();
        tombstone.id = key.apply(&doc.id);
        return Ok(tombstone);
    }
    transform_file_to_sent(FileDoc::from_document(doc)?, key, rule).into_document()
}

/// [`transform_file_received`] on a generic document.
pub fn document_received(
    doc: &Document,
    key: &XorKey,
    rule: &Rule,
    local: Option<&FileDoc>,
) -> cumulus_types::Result<Document> {
    if doc.deleted {
        let mut tombstone = doc.clone();
        tombstone.id = key.apply(&doc.id);
        return Ok(tombstone);
    }
    transform_file_received(FileDoc::from_document(doc)?, key, rule, local).into_document()
}
