//! File uploads.
//!
//! Regular files carry binary content, so they do not travel through the
//! bulk document push. The uploader sends the metadata of each changed
//! file first; the receiver answers with an upload key when it needs the
//! content, and the content follows under that key.

use crate::engine::SharingEngine;
use crate::error::{SharingError, SharingResult};
use crate::jobs::JobMessage;
use crate::lock::upload_lock_name;
use crate::protocol::FileMetadataResponse;
use crate::replicator::{
    check_writable, inbound_key, outbound_key, replicable, replication_targets, Resolution,
};
use crate::shared::SharedRef;
use crate::sharing::Sharing;
use crate::store::CheckpointKind;
use crate::transform::document_to_sent;
use crate::xor::{conflict_id, XorKey};
use cumulus_revs::{conflict_name, hash_part};
use cumulus_store::RevisionedDoc;
use cumulus_types::doctype::{FILES, FILE_TYPE};
use cumulus_types::{MemberId, SharingId};
use rand::RngCore;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Upload keys not used within this delay are dropped.
const UPLOAD_KEY_TTL: Duration = Duration::from_secs(60 * 60);

/// Metadata of a file waiting for its content.
#[derive(Debug, Clone)]
pub struct PendingUpload {
    pub sharing_id: SharingId,
    pub member_id: MemberId,
    pub rule: usize,
    pub file: RevisionedDoc,
    created_at: Instant,
}

/// Upload keys handed out to members, with what they stand for.
#[derive(Debug, Default)]
pub struct PendingUploads {
    entries: Mutex<HashMap<String, PendingUpload>>,
}

impl PendingUploads {
    /// Registers a file and returns the key its content is expected under.
    pub fn insert(&self, sharing_id: SharingId, member_id: MemberId, rule: usize, file: RevisionedDoc) -> String {
        let mut bytes = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        let key = hex::encode(bytes);
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.retain(|_, pending| pending.created_at.elapsed() < UPLOAD_KEY_TTL);
        entries.insert(
            key.clone(),
            PendingUpload {
                sharing_id,
                member_id,
                rule,
                file,
                created_at: Instant::now(),
            },
        );
        key
    }

    /// Removes the entry of a key issued to this member of this sharing.
    pub fn take(&self, key: &str, sharing_id: &SharingId, member_id: &MemberId) -> Option<PendingUpload> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let matches = entries.get(key).is_some_and(|pending| {
            pending.sharing_id == *sharing_id
                && pending.member_id == *member_id
                && pending.created_at.elapsed() < UPLOAD_KEY_TTL
        });
        if matches { entries.remove(key) } else { None }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SharingEngine {
    /// Upload worker: sends changed files to every member this instance
    /// replicates with. Returns the number of files sent.
    pub async fn upload(&self, sharing_id: &SharingId) -> SharingResult<usize> {
        let _guard = self
            .locks()
            .write(&upload_lock_name(&self.config().domain, sharing_id.as_str()))
            .await;
        let mut sharing = self.store().load_sharing(sharing_id)?;
        if !sharing.active {
            return Ok(0);
        }

        let mut sent = 0;
        let mut errors = Vec::new();
        for member_id in replication_targets(&sharing)? {
            match self.upload_member(&mut sharing, &member_id).await {
                Ok(count) => sent += count,
                Err(e) => {
                    warn!("Upload for sharing {} to member {} failed: {}", sharing_id, member_id, e);
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

    async fn upload_member(&self, sharing: &mut Sharing, member_id: &MemberId) -> SharingResult<usize> {
        let key = outbound_key(sharing, member_id)?;
        let batch = self.config().upload_batch_size.max(1);
        let mut since = self
            .store()
            .get_checkpoint(&sharing.id, member_id, CheckpointKind::Upload)?;

        let mut sent = 0;
        loop {
            let page = self.store().shared_refs_since(since, batch)?;
            let Some(&(last, _)) = page.last() else {
                break;
            };
            let full = page.len() >= batch;
            let mut uploaded = 0;
            for (_, shared) in &page {
                if !replicable(sharing, shared, true) {
                    continue;
                }
                if self.upload_file(sharing, member_id, key.as_ref(), shared).await? {
                    uploaded += 1;
                }
            }
            self.store()
                .set_checkpoint(&sharing.id, member_id, CheckpointKind::Upload, last)?;
            if uploaded > 0 {
                info!("Uploaded {} file(s) of sharing {} to member {}", uploaded, sharing.id, member_id);
            }
            sent += uploaded;
            since = last;
            if !full {
                break;
            }
        }
        Ok(sent)
    }

    /// Sends one file: metadata, then content if the member asks for it.
    async fn upload_file(
        &self,
        sharing: &mut Sharing,
        member_id: &MemberId,
        key: Option<&XorKey>,
        shared: &SharedRef,
    ) -> SharingResult<bool> {
        let Some(info) = shared.info(&sharing.id) else {
            return Ok(false);
        };
        let Some(local) = self.docs().get_with_revisions(FILES, &shared.key.id)? else {
            debug!("File {} is gone, nothing to upload", shared.key.id);
            return Ok(false);
        };
        let mut outgoing = local.clone();
        if let Some(key) = key {
            outgoing.doc = document_to_sent(&local.doc, key, sharing.rule(info.rule)?)?;
        }

        let sharing_id = sharing.id.clone();
        let peer = self.peer();
        let response = self
            .call_member(sharing, member_id, |instance, token| {
                let (sharing_id, outgoing) = (&sharing_id, &outgoing);
                async move { peer.put_file_metadata(&instance, sharing_id, &token, outgoing).await }
            })
            .await?;

        if let Some(upload_key) = response.key {
            let content = self.vfs().read_content(&local.doc.id)?;
            self.call_member(sharing, member_id, |instance, token| {
                let (sharing_id, upload_key, content) = (&sharing_id, &upload_key, content.clone());
                async move {
                    peer.put_file_content(&instance, sharing_id, &token, upload_key, content)
                        .await
                }
            })
            .await?;
            debug!("Sent content of {} to member {}", local.doc.id, member_id);
        }
        Ok(true)
    }

    // ── Inbound ──────────────────────────────────────────────────

    /// Handles the metadata of a file pushed by a member.
    ///
    /// Files whose content this instance already has are written at once.
    /// Otherwise the metadata is kept aside and an upload key is returned.
    /// A file that lost a conflict while its content differs is kept as a
    /// renamed copy instead of being dropped.
    pub async fn receive_file_metadata(
        &self,
        sharing: &Sharing,
        member_id: &MemberId,
        mut incoming: RevisionedDoc,
    ) -> SharingResult<FileMetadataResponse> {
        check_writable(sharing)?;
        if let Some(key) = inbound_key(sharing, member_id)? {
            incoming.doc = self.received_file(sharing, &incoming, &key)?;
        }
        let Some(rule) = self.rule_for_incoming(sharing, FILES, &incoming)? else {
            return Err(SharingError::InvalidSharing(format!(
                "no rule of sharing {} accepts file {}",
                sharing.id, incoming.doc.id
            )));
        };
        if !self.accepts_change(sharing, rule, FILES, &incoming)? {
            return Err(SharingError::Forbidden(format!(
                "rule {} of sharing {} does not take this change to file {}",
                rule, sharing.id, incoming.doc.id
            )));
        }

        let file = match self.resolve_incoming(FILES, incoming)? {
            Resolution::Skip => return Ok(FileMetadataResponse::default()),
            Resolution::Write(file) => file,
            Resolution::Lost { incoming, local } => {
                if !diverged(&incoming, &local) {
                    debug!("Ignored stale file {} from member {}", incoming.doc.id, member_id);
                    return Ok(FileMetadataResponse::default());
                }
                fork(incoming)
            }
        };

        if !self.needs_content(&file)? {
            self.write_received(sharing, FILES, vec![(rule, file)]).await?;
            self.after_receive(sharing).await?;
            return Ok(FileMetadataResponse::default());
        }
        let key = self
            .pending_uploads()
            .insert(sharing.id.clone(), *member_id, rule, file);
        Ok(FileMetadataResponse { key: Some(key) })
    }

    /// Handles the content of a file whose metadata was accepted earlier.
    pub async fn receive_file_content(
        &self,
        sharing: &Sharing,
        member_id: &MemberId,
        key: &str,
        content: &[u8],
    ) -> SharingResult<()> {
        let pending = self
            .pending_uploads()
            .take(key, &sharing.id, member_id)
            .ok_or_else(|| SharingError::InvalidSharing(format!("unknown upload key {key}")))?;
        self.vfs().write_content(&pending.file.doc.id, content)?;
        self.write_received(sharing, FILES, vec![(pending.rule, pending.file)])
            .await?;
        self.after_receive(sharing).await
    }

    /// The owner forwards what it receives to the other members.
    async fn after_receive(&self, sharing: &Sharing) -> SharingResult<()> {
        if !sharing.owner {
            return Ok(());
        }
        self.schedule(JobMessage::Upload {
            sharing_id: sharing.id.clone(),
            errors: 0,
        })
        .await
    }

    fn needs_content(&self, file: &RevisionedDoc) -> SharingResult<bool> {
        if file.doc.deleted || file.doc.get_str("type") != Some(FILE_TYPE) {
            return Ok(false);
        }
        if !self.vfs().has_content(&file.doc.id) {
            return Ok(true);
        }
        let local_md5 = self
            .docs()
            .get(FILES, &file.doc.id)?
            .and_then(|doc| doc.get_str("md5sum").map(str::to_string));
        Ok(local_md5.as_deref() != file.doc.get_str("md5sum"))
    }
}

/// Both sides hold a regular file with different content.
fn diverged(incoming: &RevisionedDoc, local: &RevisionedDoc) -> bool {
    !incoming.doc.deleted
        && !local.doc.deleted
        && incoming.doc.get_str("type") == Some(FILE_TYPE)
        && incoming.doc.get_str("md5sum") != local.doc.get_str("md5sum")
}

/// A renamed copy of a file that lost a conflict, with an identifier
/// derived from its revision so every retry forks to the same document.
fn fork(mut incoming: RevisionedDoc) -> RevisionedDoc {
    let rev = incoming.doc.rev.clone().unwrap_or_default();
    incoming.doc.id = conflict_id(&incoming.doc.id, &rev);
    if let Some(name) = incoming.doc.get_str("name") {
        let suffix: String = hash_part(&rev).unwrap_or("conflict").chars().take(8).collect();
        let renamed = conflict_name(name, &suffix);
        incoming.doc.fields.insert("name".to_string(), renamed.into());
    }
    incoming.revisions = vec![rev];
    incoming
}
