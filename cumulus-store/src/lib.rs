//! Document store and file content collaborators.
//!
//! The sharing engine treats the revisioned document store and the file
//! content store as black boxes. This crate defines the interfaces it
//! consumes, plus in-memory implementations backed by
//! [`cumulus_revs::RevisionTree`] that embedders and tests can use.
//!
//! # Forced writes
//!
//! Replication needs the receiving store to end up with the exact revision
//! chain the sender has. [`DocumentStore::bulk_force_write`] inserts the
//! given chain into the document's revision tree without any optimistic
//! concurrency check; the current body is then the one of the winning leaf.

mod error;
mod memory;
mod vfs;

pub use error::{StoreError, StoreResult};
pub use memory::MemoryDocStore;
pub use vfs::{MemoryVfs, Vfs};

use cumulus_types::Document;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A document body together with its revision chain, oldest first.
///
/// The last element of `revisions` is the document's `_rev`. On the wire
/// the chain travels next to the body as `_revisions`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevisionedDoc {
    #[serde(flatten)]
    pub doc: Document,
    #[serde(rename = "_revisions")]
    pub revisions: Vec<String>,
}

/// One entry of a doctype's change feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    /// Store-wide sequence number of the last write to this document.
    pub seq: u64,
    pub id: String,
    pub rev: String,
    pub deleted: bool,
}

/// Revision-diff request or response: document id to revisions.
pub type RevsMap = BTreeMap<String, Vec<String>>;

/// The revisioned document store.
pub trait DocumentStore: Send + Sync {
    /// Returns the current (winning) revision of a live document.
    fn get(&self, doctype: &str, id: &str) -> StoreResult<Option<Document>>;

    /// Returns the current revision of a document, deleted or not, with
    /// its revision chain.
    fn get_with_revisions(&self, doctype: &str, id: &str) -> StoreResult<Option<RevisionedDoc>>;

    /// Creates a document. An empty id is replaced by a generated one.
    fn create(&self, doctype: &str, doc: Document) -> StoreResult<Document>;

    /// Updates a document. `doc.rev` must be the current revision.
    fn update(&self, doctype: &str, doc: Document) -> StoreResult<Document>;

    /// Deletes a document, leaving a tombstone revision.
    fn delete(&self, doctype: &str, doc: &Document) -> StoreResult<Document>;

    /// Live documents whose selector value is one of `values`.
    ///
    /// A `None` selector matches on the document id.
    fn find_by_field(
        &self,
        doctype: &str,
        selector: Option<&str>,
        values: &[String],
    ) -> StoreResult<Vec<Document>>;

    /// For each document, the given revisions this store does not know.
    ///
    /// Documents with nothing missing are omitted from the response.
    fn revs_diff(&self, doctype: &str, revs: &RevsMap) -> StoreResult<RevsMap>;

    /// Writes documents with their exact revision chains, bypassing the
    /// optimistic concurrency check.
    fn bulk_force_write(&self, doctype: &str, docs: Vec<RevisionedDoc>) -> StoreResult<()>;

    /// Documents of a doctype written after sequence `since`, in write
    /// order. Each document appears once, with its current revision.
    fn changes(&self, doctype: &str, since: u64, limit: usize) -> StoreResult<Vec<Change>>;
}
