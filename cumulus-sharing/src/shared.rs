//! Shared-document index.
//!
//! One [`SharedRef`] per shared document records which sharings reference
//! it, under which rule, and the revisions seen locally. The index is
//! updated from track events under the `"<domain>/shared"` lock and its
//! change sequence is the feed the replicator reads.

use crate::engine::SharingEngine;
use crate::error::SharingResult;
use crate::lock::shared_lock_name;
use crate::rule::Verb;
use cumulus_types::doctype::{FILES, FILE_TYPE};
use cumulus_types::{DocRef, Document, SharingId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// How one sharing references a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedInfo {
    /// Index of the matching rule in the sharing.
    pub rule: usize,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub removed: bool,
    /// The document has binary content (a regular file).
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub binary: bool,
}

/// Index entry of a shared document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedRef {
    pub key: DocRef,
    /// Revisions seen locally, oldest first.
    #[serde(default)]
    pub revisions: Vec<String>,
    #[serde(default)]
    pub infos: BTreeMap<SharingId, SharedInfo>,
}

impl SharedRef {
    pub fn new(key: DocRef) -> Self {
        Self {
            key,
            revisions: Vec::new(),
            infos: BTreeMap::new(),
        }
    }

    /// Appends a revision unless it already is the tail of the chain.
    pub fn append_revision(&mut self, rev: &str) -> bool {
        if self.current_rev() == Some(rev) {
            return false;
        }
        self.revisions.push(rev.to_string());
        true
    }

    pub fn current_rev(&self) -> Option<&str> {
        self.revisions.last().map(String::as_str)
    }

    pub fn info(&self, sharing_id: &SharingId) -> Option<&SharedInfo> {
        self.infos.get(sharing_id)
    }

    pub fn is_shared_with(&self, sharing_id: &SharingId) -> bool {
        self.infos.contains_key(sharing_id)
    }

    /// Kind of the last change, as seen by a sharing.
    pub fn verb_for(&self, sharing_id: &SharingId) -> Verb {
        match self.info(sharing_id) {
            Some(info) if info.removed => Verb::Deleted,
            _ if self.revisions.len() <= 1 => Verb::Created,
            _ => Verb::Updated,
        }
    }

    /// Applies a track event to the entry.
    ///
    /// The rule index is only recorded the first time the sharing sees
    /// the document.
    pub fn record(&mut self, event: &TrackRequest) {
        let binary = event.is_binary();
        let info = self
            .infos
            .entry(event.sharing_id.clone())
            .or_insert(SharedInfo {
                rule: event.rule,
                removed: false,
                binary,
            });
        if event.verb == Verb::Deleted || event.doc.deleted {
            info.removed = true;
        }
        if let Some(rev) = event.doc.rev.as_deref() {
            self.append_revision(rev);
        }
    }
}

/// A local change to track for one sharing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackRequest {
    pub sharing_id: SharingId,
    /// Index of the matching rule.
    pub rule: usize,
    pub verb: Verb,
    pub doctype: String,
    pub doc: Document,
}

impl TrackRequest {
    pub fn doc_ref(&self) -> DocRef {
        DocRef::new(self.doctype.clone(), self.doc.id.clone())
    }

    /// Regular files have binary content; directories and other doctypes
    /// do not.
    pub fn is_binary(&self) -> bool {
        self.doctype == FILES && self.doc.get_str("type") == Some(FILE_TYPE)
    }
}

impl SharingEngine {
    /// Updates the index entry of the document a track event is about.
    ///
    /// Runs under the `"<domain>/shared"` lock so concurrent events on the
    /// same document are not lost.
    pub async fn update_shared(&self, event: &TrackRequest) -> SharingResult<SharedRef> {
        let _guard = self
            .locks()
            .write(&shared_lock_name(&self.config().domain))
            .await;
        let key = event.doc_ref();
        let mut shared = self
            .store()
            .get_shared_ref(&key)?
            .unwrap_or_else(|| SharedRef::new(key));
        shared.record(event);
        let seq = self.store().put_shared_ref(&shared)?;
        debug!("Tracked {} for sharing {} (seq {})", shared.key, event.sharing_id, seq);
        Ok(shared)
    }

    /// Drops a revoked sharing from every index entry, under the same lock
    /// as [`update_shared`](Self::update_shared). Returns the number of
    /// entries touched.
    pub async fn detach_shared(&self, sharing_id: &SharingId) -> SharingResult<usize> {
        let _guard = self
            .locks()
            .write(&shared_lock_name(&self.config().domain))
            .await;
        self.store().remove_sharing_refs(sharing_id)
    }
}
