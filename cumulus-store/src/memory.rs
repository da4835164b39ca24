//! In-memory document store.
//!
//! Every document keeps its full [`RevisionTree`] and the body of each
//! revision that was written with content. Revisions are content-addressed:
//! the hash part is derived from the body and the parent revision, so the
//! same edit on the same parent always yields the same revision.

use crate::{Change, DocumentStore, RevisionedDoc, RevsMap, StoreError, StoreResult};
use cumulus_revs::{compare_revs, generation, RevisionTree};
use cumulus_types::Document;
use sha2::{Digest, Sha256};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use tracing::debug;

#[derive(Debug, Clone)]
struct StoredDoc {
    tree: RevisionTree,
    bodies: HashMap<String, Document>,
    seq: u64,
}

impl StoredDoc {
    /// The body of the winning leaf, falling back to the best leaf that
    /// has a body when the winner is a bare stub.
    fn current(&self) -> Option<&Document> {
        let mut leaves = self.tree.leaves();
        leaves.sort_by(|a, b| compare_revs(b, a));
        leaves.into_iter().find_map(|rev| self.bodies.get(rev))
    }
}

/// A [`DocumentStore`] kept in process memory.
#[derive(Debug, Default)]
pub struct MemoryDocStore {
    docs: RwLock<HashMap<(String, String), StoredDoc>>,
    last_seq: AtomicU64,
}

impl MemoryDocStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the revision tree of a document, if known.
    pub fn revision_tree(&self, doctype: &str, id: &str) -> Option<RevisionTree> {
        let docs = self.docs.read().unwrap_or_else(PoisonError::into_inner);
        docs.get(&key(doctype, id)).map(|stored| stored.tree.clone())
    }

    /// Number of documents (live or deleted) of a doctype.
    pub fn count(&self, doctype: &str) -> usize {
        let docs = self.docs.read().unwrap_or_else(PoisonError::into_inner);
        docs.keys().filter(|(dt, _)| dt == doctype).count()
    }

    fn next_seq(&self) -> u64 {
        self.last_seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn write_revision(&self, doctype: &str, doc: Document, parent: Option<&str>) -> StoreResult<Document> {
        let mut docs = self.docs.write().unwrap_or_else(PoisonError::into_inner);
        let entry_key = key(doctype, &doc.id);
        let current = docs.get(&entry_key).and_then(StoredDoc::current).and_then(|d| d.rev.clone());
        if current.as_deref() != parent {
            return Err(StoreError::Conflict(format!(
                "{doctype}/{}: expected {:?}, got {:?}",
                doc.id, current, parent
            )));
        }

        let rev = next_revision(&doc, parent)?;
        let mut body = doc;
        body.rev = Some(rev.clone());

        let seq = self.next_seq();
        let stored = docs.entry(entry_key).or_insert_with(|| StoredDoc {
            tree: RevisionTree::new(rev.clone()),
            bodies: HashMap::new(),
            seq,
        });
        stored.seq = seq;
        if let Some(parent) = parent {
            stored.tree.insert_after(&rev, parent);
        }
        stored.bodies.insert(rev.clone(), body.clone());
        debug!("Wrote {}/{} at {}", doctype, body.id, rev);
        Ok(body)
    }
}

impl DocumentStore for MemoryDocStore {
    fn get(&self, doctype: &str, id: &str) -> StoreResult<Option<Document>> {
        let docs = self.docs.read().unwrap_or_else(PoisonError::into_inner);
        Ok(docs
            .get(&key(doctype, id))
            .and_then(StoredDoc::current)
            .filter(|doc| !doc.deleted)
            .cloned())
    }

    fn get_with_revisions(&self, doctype: &str, id: &str) -> StoreResult<Option<RevisionedDoc>> {
        let docs = self.docs.read().unwrap_or_else(PoisonError::into_inner);
        let Some(stored) = docs.get(&key(doctype, id)) else {
            return Ok(None);
        };
        let Some(doc) = stored.current() else {
            return Ok(None);
        };
        let rev = doc.rev.as_deref().unwrap_or_default();
        let revisions = stored
            .tree
            .chain_to(rev)
            .ok_or_else(|| StoreError::InvalidData(format!("{doctype}/{id}: {rev} not in tree")))?;
        Ok(Some(RevisionedDoc {
            doc: doc.clone(),
            revisions,
        }))
    }

    fn create(&self, doctype: &str, mut doc: Document) -> StoreResult<Document> {
        if doc.id.is_empty() {
            doc.id = uuid::Uuid::new_v4().simple().to_string();
        }
        doc.rev = None;
        self.write_revision(doctype, doc, None)
    }

    fn update(&self, doctype: &str, doc: Document) -> StoreResult<Document> {
        let parent = doc
            .rev
            .clone()
            .ok_or_else(|| StoreError::InvalidData(format!("{doctype}/{}: missing _rev", doc.id)))?;
        self.write_revision(doctype, doc, Some(&parent))
    }

    fn delete(&self, doctype: &str, doc: &Document) -> StoreResult<Document> {
        let mut tombstone = Document::new(doc.id.clone());
        tombstone.rev = doc.rev.clone();
        tombstone.deleted = true;
        self.update(doctype, tombstone)
    }

    fn find_by_field(
        &self,
        doctype: &str,
        selector: Option<&str>,
        values: &[String],
    ) -> StoreResult<Vec<Document>> {
        let docs = self.docs.read().unwrap_or_else(PoisonError::into_inner);
        let mut found: Vec<Document> = docs
            .iter()
            .filter(|((dt, _), _)| dt == doctype)
            .filter_map(|(_, stored)| stored.current())
            .filter(|doc| !doc.deleted)
            .filter(|doc| {
                doc.selector_value(selector)
                    .is_some_and(|value| values.iter().any(|v| v == value))
            })
            .cloned()
            .collect();
        found.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(found)
    }

    fn revs_diff(&self, doctype: &str, revs: &RevsMap) -> StoreResult<RevsMap> {
        let docs = self.docs.read().unwrap_or_else(PoisonError::into_inner);
        let mut missing = RevsMap::new();
        for (id, candidates) in revs {
            let stored = docs.get(&key(doctype, id));
            let unknown: Vec<String> = candidates
                .iter()
                .filter(|rev| !stored.is_some_and(|s| s.tree.contains(rev)))
                .cloned()
                .collect();
            if !unknown.is_empty() {
                missing.insert(id.clone(), unknown);
            }
        }
        Ok(missing)
    }

    fn bulk_force_write(&self, doctype: &str, docs: Vec<RevisionedDoc>) -> StoreResult<()> {
        let mut store = self.docs.write().unwrap_or_else(PoisonError::into_inner);
        for RevisionedDoc { mut doc, revisions } in docs {
            let Some(rev) = revisions.last().cloned() else {
                return Err(StoreError::InvalidData(format!(
                    "{doctype}/{}: empty revision chain",
                    doc.id
                )));
            };
            doc.rev = Some(rev.clone());
            let id = doc.id.clone();
            match store.entry(key(doctype, &id)) {
                Entry::Occupied(mut entry) => {
                    let stored = entry.get_mut();
                    if stored.tree.contains(&rev) && stored.bodies.contains_key(&rev) {
                        continue;
                    }
                    if !stored.tree.insert_chain(&revisions) {
                        return Err(StoreError::Conflict(format!(
                            "{doctype}/{id}: chain ending at {rev} does not descend from {}",
                            stored.tree.rev
                        )));
                    }
                    stored.bodies.insert(rev.clone(), doc);
                    stored.seq = self.next_seq();
                }
                Entry::Vacant(entry) => {
                    let tree = RevisionTree::from_chain(&revisions)
                        .ok_or_else(|| StoreError::InvalidData("empty revision chain".to_string()))?;
                    let mut bodies = HashMap::new();
                    bodies.insert(rev.clone(), doc);
                    let seq = self.next_seq();
                    entry.insert(StoredDoc { tree, bodies, seq });
                }
            }
            debug!("Force-wrote {}/{} at {}", doctype, id, rev);
        }
        Ok(())
    }

    fn changes(&self, doctype: &str, since: u64, limit: usize) -> StoreResult<Vec<Change>> {
        let docs = self.docs.read().unwrap_or_else(PoisonError::into_inner);
        let mut changes: Vec<Change> = docs
            .iter()
            .filter(|((dt, _), stored)| dt == doctype && stored.seq > since)
            .filter_map(|((_, id), stored)| {
                stored.current().map(|doc| Change {
                    seq: stored.seq,
                    id: id.clone(),
                    rev: doc.rev.clone().unwrap_or_default(),
                    deleted: doc.deleted,
                })
            })
            .collect();
        changes.sort_by_key(|change| change.seq);
        changes.truncate(limit);
        Ok(changes)
    }
}

fn key(doctype: &str, id: &str) -> (String, String) {
    (doctype.to_string(), id.to_string())
}

/// `"<generation+1>-<hash>"` where the hash covers the body and the parent.
fn next_revision(doc: &Document, parent: Option<&str>) -> StoreResult<String> {
    let mut hasher = Sha256::new();
    hasher.update(parent.unwrap_or_default().as_bytes());
    hasher.update(serde_json::to_vec(&doc.fields)?);
    hasher.update([u8::from(doc.deleted)]);
    let digest = hex::encode(hasher.finalize());
    let next = parent.map_or(0, generation) + 1;
    Ok(format!("{next}-{}", &digest[..32]))
}
