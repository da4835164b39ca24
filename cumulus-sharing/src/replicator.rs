//! Replication of shared documents between members.
//!
//! The outbound side reads the shared-document index from the member's
//! checkpoint, asks the member which revisions it misses and pushes those
//! documents with their revision chains. Regular files are left to the
//! uploader. The inbound side answers revision diffs and merges pushed
//! documents through the conflict resolver before a forced write.

use crate::engine::SharingEngine;
use crate::error::{SharingError, SharingResult};
use crate::jobs::JobMessage;
use crate::lock::replicate_lock_name;
use crate::protocol::{BulkDocs, RevsDiff};
use crate::rule::Verb;
use crate::shared::{SharedRef, TrackRequest};
use crate::sharing::Sharing;
use crate::store::CheckpointKind;
use crate::transform::{document_received, document_to_sent};
use crate::xor::XorKey;
use cumulus_revs::{detect_conflict, generation, mixup_chain_to_resolve_conflict, ConflictStatus};
use cumulus_store::{RevisionedDoc, RevsMap};
use cumulus_types::doctype::FILES;
use cumulus_types::{DocRef, FileDoc, MemberId, SharingId};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// What to do with a document pushed by a member.
#[derive(Debug)]
pub(crate) enum Resolution {
    /// Force-write this chain.
    Write(RevisionedDoc),
    /// The local revision wins; the incoming one is dropped.
    Lost {
        incoming: RevisionedDoc,
        local: RevisionedDoc,
    },
    /// Already known.
    Skip,
}

impl SharingEngine {
    /// Replicate worker: pushes pending changes to every member this
    /// instance replicates with. Returns the number of documents sent.
    ///
    /// On the owner those are the ready recipients; on a recipient, the
    /// owner, unless every rule is read-only. Failures are collected per
    /// member and reported together.
    pub async fn replicate(&self, sharing_id: &SharingId) -> SharingResult<usize> {
        let _guard = self
            .locks()
            .write(&replicate_lock_name(&self.config().domain, sharing_id.as_str()))
            .await;
        let mut sharing = self.store().load_sharing(sharing_id)?;
        if !sharing.active {
            debug!("Sharing {} is not active, nothing to replicate", sharing_id);
            return Ok(0);
        }

        let mut sent = 0;
        let mut errors = Vec::new();
        for member_id in replication_targets(&sharing)? {
            match self.replicate_member(&mut sharing, &member_id).await {
                Ok(count) => sent += count,
                Err(e) => {
                    warn!("Replication of sharing {} to member {} failed: {}", sharing_id, member_id, e);
                    errors.push((member_id, e.to_string()));
                }
            }
        }
        if errors.is_empty() {
            Ok(sent)
        } else {
            Err(SharingError::Replication(errors))
        }
    }

    async fn replicate_member(&self, sharing: &mut Sharing, member_id: &MemberId) -> SharingResult<usize> {
        let key = outbound_key(sharing, member_id)?;
        let limit = self.config().changes_limit.max(1);
        let mut since = self
            .store()
            .get_checkpoint(&sharing.id, member_id, CheckpointKind::Replicator)?;
        info!("Replicating sharing {} to member {} from seq {}", sharing.id, member_id, since);

        let mut sent = 0;
        loop {
            let page = self.store().shared_refs_since(since, limit)?;
            let Some(&(last, _)) = page.last() else {
                break;
            };
            let full = page.len() >= limit;
            let candidates: Vec<SharedRef> = page
                .into_iter()
                .map(|(_, shared)| shared)
                .filter(|shared| replicable(sharing, shared, false))
                .collect();
            if !candidates.is_empty() {
                sent += self
                    .push_documents(sharing, member_id, key.as_ref(), &candidates)
                    .await?;
            }
            self.store()
                .set_checkpoint(&sharing.id, member_id, CheckpointKind::Replicator, last)?;
            since = last;
            if !full {
                break;
            }
        }
        info!("Replicated {} document(s) of sharing {} to member {}", sent, sharing.id, member_id);
        Ok(sent)
    }

    async fn push_documents(
        &self,
        sharing: &mut Sharing,
        member_id: &MemberId,
        key: Option<&XorKey>,
        candidates: &[SharedRef],
    ) -> SharingResult<usize> {
        let mut request = RevsDiff::new();
        let mut local_ids: HashMap<DocRef, (String, usize)> = HashMap::new();
        for shared in candidates {
            let Some(info) = shared.info(&sharing.id) else {
                continue;
            };
            let doctype = &shared.key.doctype;
            let remote_id = remote_id(key, doctype, &shared.key.id);
            request
                .entry(doctype.clone())
                .or_default()
                .insert(remote_id.clone(), shared.revisions.clone());
            local_ids.insert(DocRef::new(doctype.clone(), remote_id), (shared.key.id.clone(), info.rule));
        }

        let sharing_id = sharing.id.clone();
        let peer = self.peer();
        let missing = self
            .call_member(sharing, member_id, |instance, token| {
                let (sharing_id, request) = (&sharing_id, &request);
                async move { peer.revs_diff(&instance, sharing_id, &token, request).await }
            })
            .await?;

        let mut docs = BulkDocs::new();
        for (doctype, entries) in missing {
            for remote_id in entries.into_keys() {
                let Some((local_id, rule)) = local_ids.get(&DocRef::new(doctype.clone(), remote_id)) else {
                    continue;
                };
                let Some(mut revisioned) = self.docs().get_with_revisions(&doctype, local_id)? else {
                    continue;
                };
                if let Some(key) = key.filter(|_| doctype == FILES) {
                    revisioned.doc = document_to_sent(&revisioned.doc, key, sharing.rule(*rule)?)?;
                }
                docs.entry(doctype.clone()).or_default().push(revisioned);
            }
        }

        let batch_size = self.config().batch_size.max(1);
        let mut sent = 0;
        for (doctype, all) in docs {
            for chunk in all.chunks(batch_size) {
                let batch = BulkDocs::from([(doctype.clone(), chunk.to_vec())]);
                self.call_member(sharing, member_id, |instance, token| {
                    let (sharing_id, batch) = (&sharing_id, &batch);
                    async move { peer.bulk_docs(&instance, sharing_id, &token, batch).await }
                })
                .await?;
                sent += chunk.len();
                debug!("Pushed {} {} document(s) to member {}", chunk.len(), doctype, member_id);
            }
        }
        Ok(sent)
    }

    // ── Inbound ──────────────────────────────────────────────────

    /// Answers a member's revision diff: which of its revisions this
    /// instance does not have, in the member's identifiers.
    pub fn handle_revs_diff(
        &self,
        sharing: &Sharing,
        member_id: &MemberId,
        request: &RevsDiff,
    ) -> SharingResult<RevsDiff> {
        let key = inbound_key(sharing, member_id)?;
        let mut response = RevsDiff::new();
        for (doctype, revs) in request {
            check_doctype(sharing, doctype)?;
            let local: RevsMap = revs
                .iter()
                .map(|(id, revs)| (remote_id(key.as_ref(), doctype, id), revs.clone()))
                .collect();
            let missing: RevsMap = self
                .docs()
                .revs_diff(doctype, &local)?
                .into_iter()
                .map(|(id, revs)| (remote_id(key.as_ref(), doctype, &id), revs))
                .collect();
            if !missing.is_empty() {
                response.insert(doctype.clone(), missing);
            }
        }
        Ok(response)
    }

    /// Merges documents pushed by a member. Returns the number written.
    pub async fn apply_bulk_docs(
        &self,
        sharing: &Sharing,
        member_id: &MemberId,
        docs: BulkDocs,
    ) -> SharingResult<usize> {
        check_writable(sharing)?;
        let key = inbound_key(sharing, member_id)?;
        let mut written = 0;
        for (doctype, incoming) in docs {
            check_doctype(sharing, &doctype)?;
            let mut writes = Vec::new();
            for mut revisioned in incoming {
                if let Some(key) = key.as_ref().filter(|_| doctype == FILES) {
                    revisioned.doc = self.received_file(sharing, &revisioned, key)?;
                }
                let Some(rule) = self.rule_for_incoming(sharing, &doctype, &revisioned)? else {
                    warn!("No rule of sharing {} accepts {}/{}", sharing.id, doctype, revisioned.doc.id);
                    continue;
                };
                if !self.accepts_change(sharing, rule, &doctype, &revisioned)? {
                    warn!(
                        "Rule {} of sharing {} does not take this change to {}/{} from member {}",
                        rule, sharing.id, doctype, revisioned.doc.id, member_id
                    );
                    continue;
                }
                match self.resolve_incoming(&doctype, revisioned)? {
                    Resolution::Write(doc) => writes.push((rule, doc)),
                    Resolution::Lost { incoming, .. } => {
                        debug!("Ignored stale {}/{} from member {}", doctype, incoming.doc.id, member_id);
                    }
                    Resolution::Skip => {}
                }
            }
            written += self.write_received(sharing, &doctype, writes).await?;
        }
        if written > 0 && sharing.owner {
            self.schedule(JobMessage::Replicate {
                sharing_id: sharing.id.clone(),
                errors: 0,
            })
            .await?;
        }
        Ok(written)
    }

    /// Maps a file pushed to the owner back to local identifiers.
    pub(crate) fn received_file(
        &self,
        sharing: &Sharing,
        incoming: &RevisionedDoc,
        key: &XorKey,
    ) -> SharingResult<cumulus_types::Document> {
        let local_id = key.apply(&incoming.doc.id);
        let rule = match self.store().get_shared_ref(&DocRef::new(FILES, local_id.clone()))? {
            Some(shared) => shared.info(&sharing.id).map(|info| info.rule),
            None => None,
        }
        .or_else(|| sharing.rules.iter().position(|r| !r.local && r.is_files()));
        let Some(rule) = rule else {
            return Err(SharingError::InvalidSharing("no files rule".to_string()));
        };
        let local = match self.docs().get(FILES, &local_id)? {
            Some(doc) => Some(FileDoc::from_document(&doc)?),
            None => None,
        };
        Ok(document_received(&incoming.doc, key, sharing.rule(rule)?, local.as_ref())?)
    }

    /// The rule an incoming document falls under.
    ///
    /// Known documents keep the rule they were indexed with. A recipient
    /// takes whatever its owner sends for a shared doctype; the owner
    /// only takes new documents a rule selects, or files created inside a
    /// shared directory.
    pub(crate) fn rule_for_incoming(
        &self,
        sharing: &Sharing,
        doctype: &str,
        incoming: &RevisionedDoc,
    ) -> SharingResult<Option<usize>> {
        let known = self
            .store()
            .get_shared_ref(&DocRef::new(doctype, incoming.doc.id.clone()))?
            .and_then(|shared| shared.info(&sharing.id).map(|info| info.rule));
        if known.is_some() {
            return Ok(known);
        }
        if !sharing.owner {
            return Ok(sharing.rules.iter().position(|r| !r.local && r.doctype == doctype));
        }
        if let Some(rule) = sharing.rules.iter().position(|r| r.accept(doctype, &incoming.doc)) {
            return Ok(Some(rule));
        }
        match incoming.doc.get_str("dir_id") {
            Some(dir_id) if doctype == FILES => Ok(self
                .store()
                .get_shared_ref(&DocRef::new(FILES, dir_id))?
                .and_then(|parent| parent.info(&sharing.id).map(|info| info.rule))),
            _ => Ok(None),
        }
    }

    /// Returns true if the rule lets a member's change reach this
    /// instance. Recipients take whatever their owner sends; the owner
    /// only takes the kinds of change the rule synchronizes.
    pub(crate) fn accepts_change(
        &self,
        sharing: &Sharing,
        rule: usize,
        doctype: &str,
        incoming: &RevisionedDoc,
    ) -> SharingResult<bool> {
        if !sharing.owner {
            return Ok(true);
        }
        let verb = if incoming.doc.deleted {
            Verb::Deleted
        } else if self.docs().get(doctype, &incoming.doc.id)?.is_some() {
            Verb::Updated
        } else {
            Verb::Created
        };
        Ok(sharing.rule(rule)?.propagates(verb, false))
    }

    /// Decides how an incoming chain merges with the local document.
    ///
    /// The local current revision is checked against the incoming chain:
    /// when it is part of it the chain is a plain continuation; when the
    /// incoming tip wins, the local revision is made an ancestor of the
    /// newer part of the chain so both instances converge on one leaf.
    pub(crate) fn resolve_incoming(&self, doctype: &str, mut incoming: RevisionedDoc) -> SharingResult<Resolution> {
        let Some(tip) = incoming.revisions.last().cloned() else {
            return Err(SharingError::InvalidSharing(format!(
                "{doctype}/{}: empty revision chain",
                incoming.doc.id
            )));
        };
        incoming.doc.rev = Some(tip.clone());
        let Some(local) = self.docs().get_with_revisions(doctype, &incoming.doc.id)? else {
            return Ok(Resolution::Write(incoming));
        };
        let probe = RevsMap::from([(incoming.doc.id.clone(), vec![tip])]);
        if self.docs().revs_diff(doctype, &probe)?.is_empty() {
            return Ok(Resolution::Skip);
        }

        let local_rev = local.doc.rev.clone().unwrap_or_default();
        match detect_conflict(&local_rev, &incoming.revisions) {
            ConflictStatus::NoConflict => Ok(Resolution::Write(incoming)),
            ConflictStatus::WonConflict => {
                let chain = mixup_chain_to_resolve_conflict(&local_rev, &incoming.revisions);
                if chain.len() > 1 {
                    incoming.revisions = chain;
                }
                Ok(Resolution::Write(incoming))
            }
            ConflictStatus::LostConflict => Ok(Resolution::Lost { incoming, local }),
        }
    }

    /// Force-writes received documents of one doctype and indexes them.
    pub(crate) async fn write_received(
        &self,
        sharing: &Sharing,
        doctype: &str,
        docs: Vec<(usize, RevisionedDoc)>,
    ) -> SharingResult<usize> {
        if docs.is_empty() {
            return Ok(0);
        }
        let revisioned: Vec<RevisionedDoc> = docs.iter().map(|(_, doc)| doc.clone()).collect();
        self.docs().bulk_force_write(doctype, revisioned)?;
        for (rule, received) in &docs {
            let verb = if received.doc.deleted {
                Verb::Deleted
            } else if received.doc.rev.as_deref().map_or(0, generation) <= 1 {
                Verb::Created
            } else {
                Verb::Updated
            };
            self.update_shared(&TrackRequest {
                sharing_id: sharing.id.clone(),
                rule: *rule,
                verb,
                doctype: doctype.to_string(),
                doc: received.doc.clone(),
            })
            .await?;
        }
        debug!("Wrote {} received {} document(s) for sharing {}", docs.len(), doctype, sharing.id);
        Ok(docs.len())
    }
}

/// Members this instance pushes changes to.
pub(crate) fn replication_targets(sharing: &Sharing) -> SharingResult<Vec<MemberId>> {
    if sharing.owner {
        Ok(sharing.ready_members().map(|m| m.id).collect())
    } else if sharing.read_only() {
        Ok(Vec::new())
    } else {
        Ok(vec![sharing.owner_member()?.id])
    }
}

/// True if the entry has a change for this sharing that leaves the
/// instance. `binary` selects regular files (uploader) or everything else
/// (replicator).
pub(crate) fn replicable(sharing: &Sharing, shared: &SharedRef, binary: bool) -> bool {
    let Some(info) = shared.info(&sharing.id) else {
        return false;
    };
    if info.binary != binary {
        return false;
    }
    sharing
        .rule(info.rule)
        .is_ok_and(|rule| rule.propagates(shared.verb_for(&sharing.id), sharing.owner))
}

/// The key identifiers sent to a member are rewritten with. Only the
/// owner rewrites.
pub(crate) fn outbound_key(sharing: &Sharing, member_id: &MemberId) -> SharingResult<Option<XorKey>> {
    if !sharing.owner {
        return Ok(None);
    }
    Ok(Some(sharing.member(member_id)?.credentials()?.xor_key.clone()))
}

/// The key identifiers received from a member are mapped back with.
pub(crate) fn inbound_key(sharing: &Sharing, member_id: &MemberId) -> SharingResult<Option<XorKey>> {
    outbound_key(sharing, member_id)
}

fn remote_id(key: Option<&XorKey>, doctype: &str, id: &str) -> String {
    match key {
        Some(key) if doctype == FILES => key.apply(id),
        _ => id.to_string(),
    }
}

/// The owner of a sharing without any `sync` policy takes no change
/// from its recipients.
pub(crate) fn check_writable(sharing: &Sharing) -> SharingResult<()> {
    if sharing.owner && sharing.read_only() {
        return Err(SharingError::Forbidden(format!(
            "sharing {} is read-only for its recipients",
            sharing.id
        )));
    }
    Ok(())
}

fn check_doctype(sharing: &Sharing, doctype: &str) -> SharingResult<()> {
    if sharing.rules.iter().any(|r| !r.local && r.doctype == doctype) {
        Ok(())
    } else {
        Err(SharingError::InvalidSharing(format!(
            "doctype {doctype} is not shared by {}",
            sharing.id
        )))
    }
}
