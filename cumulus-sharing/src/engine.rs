//! Sharing engine: the service object every job and handler runs against.
//!
//! The engine owns the configuration and its collaborators (persistent
//! store, document store, file content, job scheduler, locks, peer client
//! and dispatcher cache). Lifecycle operations that talk to peers live
//! here; replication and uploads are in their own modules.

use crate::cache::SharingCache;
use crate::config::SharingConfig;
use crate::error::{SharingError, SharingResult};
use crate::jobs::{JobMessage, JobRequest, JobScheduler};
use crate::lock::{sharing_lock_name, LockManager};
use crate::member::{AccessToken, Credentials, Member, MemberStatus};
use crate::peer::PeerClient;
use crate::protocol::{ClientRegistration, SharingRequest};
use crate::rule::{validate_rules, Verb};
use crate::shared::TrackRequest;
use crate::sharing::Sharing;
use crate::store::SharingStore;
use crate::upload::PendingUploads;
use chrono::Utc;
use cumulus_revs::generation;
use cumulus_store::{DocumentStore, Vfs};
use cumulus_types::doctype::{DIR_TYPE, FILES};
use cumulus_types::{DocRef, Document, MemberId, SharingId};
use futures::future::join_all;
use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::OwnedRwLockWriteGuard;
use tracing::{debug, info, warn};

/// Software id announced when registering OAuth clients on peers.
const SOFTWARE_ID: &str = "github.com/cumulus-cloud/cumulus";

/// The sharing engine.
pub struct SharingEngine {
    config: SharingConfig,
    store: Arc<SharingStore>,
    docs: Arc<dyn DocumentStore>,
    vfs: Arc<dyn Vfs>,
    scheduler: Arc<dyn JobScheduler>,
    locks: Arc<LockManager>,
    cache: SharingCache,
    peer: PeerClient,
    pending_uploads: PendingUploads,
}

impl SharingEngine {
    /// Creates an engine with its own lock manager.
    pub fn new(
        config: SharingConfig,
        store: Arc<SharingStore>,
        docs: Arc<dyn DocumentStore>,
        vfs: Arc<dyn Vfs>,
        scheduler: Arc<dyn JobScheduler>,
    ) -> SharingResult<Self> {
        let peer = PeerClient::new(config.http_timeout())?;
        let cache = SharingCache::new(config.cache_ttl());
        Ok(Self {
            config,
            store,
            docs,
            vfs,
            scheduler,
            locks: Arc::new(LockManager::new()),
            cache,
            peer,
            pending_uploads: PendingUploads::default(),
        })
    }

    /// Shares a lock manager with other services of the instance.
    #[must_use]
    pub fn with_locks(mut self, locks: Arc<LockManager>) -> Self {
        self.locks = locks;
        self
    }

    pub fn config(&self) -> &SharingConfig {
        &self.config
    }

    pub fn store(&self) -> &SharingStore {
        &self.store
    }

    pub fn docs(&self) -> &dyn DocumentStore {
        self.docs.as_ref()
    }

    pub fn vfs(&self) -> &dyn Vfs {
        self.vfs.as_ref()
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub(crate) fn peer(&self) -> &PeerClient {
        &self.peer
    }

    pub(crate) fn pending_uploads(&self) -> &PendingUploads {
        &self.pending_uploads
    }

    /// Where peers send users back after consenting.
    pub fn redirect_uri(&self) -> String {
        format!("{}/sharings/answer", self.config.instance_url.trim_end_matches('/'))
    }

    async fn lock_sharing(&self, sharing_id: &SharingId) -> OwnedRwLockWriteGuard<()> {
        self.locks
            .write(&sharing_lock_name(&self.config.domain, sharing_id.as_str()))
            .await
    }

    pub(crate) async fn schedule(&self, message: JobMessage) -> SharingResult<()> {
        self.scheduler.push(JobRequest::now(message)).await
    }

    // ── Persistence ──────────────────────────────────────────────

    pub fn get_sharing(&self, sharing_id: &SharingId) -> SharingResult<Sharing> {
        self.store.load_sharing(sharing_id)
    }

    pub fn list_sharings(&self) -> SharingResult<Vec<Sharing>> {
        self.store.list_sharings(false)
    }

    pub(crate) fn save_sharing(&self, sharing: &Sharing) -> SharingResult<()> {
        self.store.save_sharing(sharing)?;
        self.cache.clear();
        Ok(())
    }

    // ── Creation ─────────────────────────────────────────────────

    /// Validates and persists a new sharing owned by this instance, then
    /// indexes every document its rules match.
    pub async fn create_sharing(&self, mut sharing: Sharing) -> SharingResult<Sharing> {
        if !sharing.owner {
            return Err(SharingError::InvalidSharing(
                "only the owner creates a sharing".to_string(),
            ));
        }
        sharing.validate()?;
        sharing.active = true;
        sharing.touch();
        self.save_sharing(&sharing)?;
        let tracked = self.initial_fan_out(&sharing).await?;
        info!(
            "Created sharing {} with {} rule(s), {} document(s) shared",
            sharing.id,
            sharing.rules.len(),
            tracked
        );
        Ok(sharing)
    }

    async fn initial_fan_out(&self, sharing: &Sharing) -> SharingResult<usize> {
        let mut tracked = 0;
        for (index, rule) in sharing.rules.iter().enumerate() {
            if rule.local {
                continue;
            }
            let mut docs = self
                .docs
                .find_by_field(&rule.doctype, rule.selector.as_deref(), &rule.values)?;
            if rule.is_files() {
                docs = self.with_descendants(docs)?;
            }
            for doc in docs {
                let event = TrackRequest {
                    sharing_id: sharing.id.clone(),
                    rule: index,
                    verb: Verb::Created,
                    doctype: rule.doctype.clone(),
                    doc,
                };
                self.update_shared(&event).await?;
                tracked += 1;
            }
        }
        Ok(tracked)
    }

    /// The given files plus everything below the directories among them.
    fn with_descendants(&self, roots: Vec<Document>) -> SharingResult<Vec<Document>> {
        let mut seen: HashSet<String> = roots.iter().map(|doc| doc.id.clone()).collect();
        let mut queue: VecDeque<String> = roots
            .iter()
            .filter(|doc| doc.get_str("type") == Some(DIR_TYPE))
            .map(|doc| doc.id.clone())
            .collect();
        let mut all = roots;
        while let Some(dir_id) = queue.pop_front() {
            for child in self.docs.find_by_field(FILES, Some("dir_id"), &[dir_id])? {
                if !seen.insert(child.id.clone()) {
                    continue;
                }
                if child.get_str("type") == Some(DIR_TYPE) {
                    queue.push_back(child.id.clone());
                }
                all.push(child);
            }
        }
        Ok(all)
    }

    // ── Members and credentials ──────────────────────────────────

    /// Adds a recipient to a persisted sharing.
    pub async fn add_contact(
        &self,
        sharing_id: &SharingId,
        name: Option<String>,
        email: Option<String>,
        instance: Option<String>,
    ) -> SharingResult<MemberId> {
        let _guard = self.lock_sharing(sharing_id).await;
        let mut sharing = self.store.load_sharing(sharing_id)?;
        let member_id = sharing.add_contact(name, email, instance)?;
        self.save_sharing(&sharing)?;
        Ok(member_id)
    }

    /// Registers an OAuth client for us on a member's instance.
    pub async fn register_client(&self, sharing_id: &SharingId, member_id: &MemberId) -> SharingResult<()> {
        let _guard = self.lock_sharing(sharing_id).await;
        let mut sharing = self.store.load_sharing(sharing_id)?;
        let instance = sharing.member(member_id)?.instance()?.to_string();
        let registration = ClientRegistration {
            redirect_uris: vec![self.redirect_uri()],
            client_name: format!("Sharing {}", sharing.id),
            client_kind: "sharing".to_string(),
            software_id: SOFTWARE_ID.to_string(),
            client_uri: self.config.instance_url.clone(),
        };
        let client = self.peer.register_client(&instance, &registration).await?;
        info!("Registered OAuth client {} on {}", client.client_id, instance);
        sharing.member_mut(member_id)?.credentials_mut()?.client = Some(client);
        sharing.touch();
        self.save_sharing(&sharing)
    }

    /// The consent URL on a member's instance.
    pub fn generate_oauth_url(&self, sharing_id: &SharingId, member_id: &MemberId) -> SharingResult<String> {
        let sharing = self.store.load_sharing(sharing_id)?;
        sharing.generate_oauth_url(member_id, &self.redirect_uri())
    }

    /// Exchanges a member's refresh token for a new access token and
    /// persists it. Returns the new access token.
    pub async fn refresh_token(&self, sharing: &mut Sharing, member_id: &MemberId) -> SharingResult<String> {
        let member = sharing.member(member_id)?;
        let instance = member.instance()?.to_string();
        let client = member.client()?.clone();
        let refresh = member
            .credentials()?
            .access_token
            .as_ref()
            .map(|token| token.refresh_token.clone())
            .filter(|refresh| !refresh.is_empty())
            .ok_or_else(|| SharingError::Auth(format!("no refresh token for member {member_id}")))?;

        let token = self.peer.refresh_token(&instance, &client, &refresh).await?;
        let access = token.access_token.clone();
        {
            let _guard = self.lock_sharing(&sharing.id).await;
            let mut stored = self.store.load_sharing(&sharing.id)?;
            stored.member_mut(member_id)?.credentials_mut()?.access_token = Some(token.clone());
            self.save_sharing(&stored)?;
        }
        sharing.member_mut(member_id)?.credentials_mut()?.access_token = Some(token);
        info!("Refreshed access token of member {} for sharing {}", member_id, sharing.id);
        Ok(access)
    }

    /// Calls a member's instance with its access token; on an
    /// authorization failure, refreshes the token and retries once.
    pub(crate) async fn call_member<T, F, Fut>(
        &self,
        sharing: &mut Sharing,
        member_id: &MemberId,
        call: F,
    ) -> SharingResult<T>
    where
        F: Fn(String, String) -> Fut,
        Fut: Future<Output = SharingResult<T>>,
    {
        let (instance, token) = {
            let member = sharing.member(member_id)?;
            (member.instance()?.to_string(), member.access_token()?.to_string())
        };
        match call(instance.clone(), token).await {
            Err(e) if e.is_unauthorized() => {
                debug!("Token of member {} rejected, refreshing", member_id);
                let token = self.refresh_token(sharing, member_id).await?;
                call(instance, token).await
            }
            other => other,
        }
    }

    /// Sends the sharing to every member not invited yet that has an
    /// instance URL. Members without one are left for mail delivery.
    pub async fn send_invitations(&self, sharing_id: &SharingId) -> SharingResult<usize> {
        let _guard = self.lock_sharing(sharing_id).await;
        let mut sharing = self.store.load_sharing(sharing_id)?;
        if !sharing.owner {
            return Err(SharingError::InvalidSharing(
                "only the owner sends invitations".to_string(),
            ));
        }
        let invited: Vec<MemberId> = sharing
            .recipients()
            .filter(|m| m.status == MemberStatus::MailNotSent)
            .map(|m| m.id)
            .collect();

        let mut sent = 0;
        let mut errors = Vec::new();
        for member_id in invited {
            let Some(instance) = sharing.member(&member_id)?.instance.clone() else {
                debug!("Member {} has no instance, invitation left to mail", member_id);
                continue;
            };
            let request = SharingRequest::for_member(&sharing, &member_id)?;
            match self.peer.put_sharing(&instance, &request).await {
                Ok(()) => {
                    sharing.member_mut(&member_id)?.status = MemberStatus::Pending;
                    sent += 1;
                }
                Err(e) => {
                    warn!("Failed to invite member {}: {}", member_id, e);
                    errors.push((member_id, e.to_string()));
                }
            }
        }
        sharing.touch();
        self.save_sharing(&sharing)?;
        if errors.is_empty() {
            Ok(sent)
        } else {
            Err(SharingError::Replication(errors))
        }
    }

    /// Owner side: a member consented. Records its token and the client
    /// id it calls us with, and schedules the first replication.
    pub async fn accept(
        &self,
        sharing_id: &SharingId,
        state: &str,
        token: AccessToken,
        inbound_client_id: &str,
    ) -> SharingResult<MemberId> {
        let member_id = {
            let _guard = self.lock_sharing(sharing_id).await;
            let mut sharing = self.store.load_sharing(sharing_id)?;
            let member_id = sharing.accept(state, token, inbound_client_id)?;
            self.save_sharing(&sharing)?;
            member_id
        };
        self.schedule_transfers(sharing_id).await?;
        Ok(member_id)
    }

    /// Recipient side: persists a sharing an owner sent us.
    pub async fn receive_request(&self, request: SharingRequest) -> SharingResult<Sharing> {
        validate_rules(&request.rules)?;
        if request.members.first().map(|m| m.status) != Some(MemberStatus::Owner) {
            return Err(SharingError::InvalidSharing(
                "the first member must be the owner".to_string(),
            ));
        }
        if !request.members.iter().any(|m| m.id == request.recipient) {
            return Err(SharingError::MemberNotFound(request.recipient));
        }

        let _guard = self.lock_sharing(&request.id).await;
        if self.store.get_sharing(&request.id)?.is_some() {
            return Err(SharingError::InvalidSharing(format!(
                "sharing {} already exists",
                request.id
            )));
        }

        let now = Utc::now();
        let mut sharing = Sharing {
            id: request.id.clone(),
            owner: false,
            open: request.open,
            description: request.description.clone(),
            app_slug: request.app_slug.clone(),
            rules: request.rules.clone(),
            members: request.members.iter().map(Member::public).collect(),
            local_member: Some(request.recipient),
            active: false,
            revoked: false,
            created_at: now,
            updated_at: now,
        };
        if let Some(owner) = sharing.members.first_mut() {
            let mut credentials = Credentials::new();
            credentials.state = request.state.clone();
            owner.credentials = Some(credentials);
        }
        let local = sharing.member_mut(&request.recipient)?;
        if local.status == MemberStatus::MailNotSent {
            local.status = MemberStatus::Pending;
        }
        sharing.touch();
        self.save_sharing(&sharing)?;
        info!("Received sharing {} ({})", sharing.id, sharing.description);
        Ok(sharing)
    }

    /// Recipient side: consent went through. Records the token to call
    /// the owner and the client id the owner calls us with.
    pub async fn activate(
        &self,
        sharing_id: &SharingId,
        token: AccessToken,
        inbound_client_id: &str,
    ) -> SharingResult<()> {
        {
            let _guard = self.lock_sharing(sharing_id).await;
            let mut sharing = self.store.load_sharing(sharing_id)?;
            if sharing.owner {
                return Err(SharingError::InvalidSharing(
                    "the owner accepts members instead".to_string(),
                ));
            }
            if sharing.revoked {
                return Err(SharingError::InvalidSharing("sharing is revoked".to_string()));
            }
            let local_id = sharing
                .local_member
                .ok_or_else(|| SharingError::InvalidSharing("no local member".to_string()))?;
            let owner_id = sharing.owner_member()?.id;
            let credentials = sharing.member_mut(&owner_id)?.credentials_mut()?;
            credentials.access_token = Some(token);
            credentials.inbound_client_id = Some(inbound_client_id.to_string());
            sharing.member_mut(&local_id)?.status = MemberStatus::Ready;
            sharing.active = true;
            sharing.touch();
            self.save_sharing(&sharing)?;
            info!("Activated sharing {}", sharing_id);
        }
        self.schedule_transfers(sharing_id).await
    }

    async fn schedule_transfers(&self, sharing_id: &SharingId) -> SharingResult<()> {
        let sharing = self.store.load_sharing(sharing_id)?;
        if !sharing.owner && sharing.read_only() {
            return Ok(());
        }
        self.schedule(JobMessage::Replicate {
            sharing_id: sharing_id.clone(),
            errors: 0,
        })
        .await?;
        if sharing.rules.iter().any(|rule| rule.is_files() && !rule.local) {
            self.schedule(JobMessage::Upload {
                sharing_id: sharing_id.clone(),
                errors: 0,
            })
            .await?;
        }
        Ok(())
    }

    // ── Revocation ───────────────────────────────────────────────

    /// Best-effort notification of a revoked member. Failures are logged,
    /// local revocation goes on regardless.
    async fn notify_revoked(&self, sharing: &Sharing, member_id: &MemberId) {
        let Ok(member) = sharing.member(member_id) else {
            return;
        };
        if !member.is_ready() {
            return;
        }
        let (Ok(instance), Ok(token)) = (member.instance(), member.access_token()) else {
            return;
        };
        if let Err(e) = self.peer.delete_sharing(instance, &sharing.id, token, true).await {
            warn!("Failed to notify member {} of revocation: {}", member_id, e);
        }
        if sharing.read_only() {
            return;
        }
        if let Ok(client) = member.client() {
            if let Err(e) = self.peer.delete_client(instance, client).await {
                warn!("Failed to delete OAuth client on {}: {}", instance, e);
            }
        }
    }

    /// Owner side: revokes one member.
    pub async fn revoke_member(&self, sharing_id: &SharingId, member_id: &MemberId) -> SharingResult<()> {
        let _guard = self.lock_sharing(sharing_id).await;
        let mut sharing = self.store.load_sharing(sharing_id)?;
        if !sharing.owner {
            return Err(SharingError::InvalidSharing(
                "only the owner revokes members".to_string(),
            ));
        }
        self.notify_revoked(&sharing, member_id).await;
        sharing.revoke_member_locally(member_id)?;
        self.save_sharing(&sharing)?;
        info!("Revoked member {} of sharing {}", member_id, sharing_id);
        Ok(())
    }

    /// Owner side: revokes every member and deactivates the sharing.
    pub async fn revoke(&self, sharing_id: &SharingId) -> SharingResult<()> {
        let _guard = self.lock_sharing(sharing_id).await;
        let mut sharing = self.store.load_sharing(sharing_id)?;
        if !sharing.owner {
            return Err(SharingError::InvalidSharing(
                "recipients leave a sharing instead".to_string(),
            ));
        }
        let members: Vec<MemberId> = sharing
            .recipients()
            .filter(|m| !m.is_revoked())
            .map(|m| m.id)
            .collect();
        join_all(members.iter().map(|id| self.notify_revoked(&sharing, id))).await;
        sharing.revoke_locally();
        self.save_sharing(&sharing)?;
        let detached = self.detach_shared(sharing_id).await?;
        info!("Revoked sharing {} ({} document(s) detached)", sharing_id, detached);
        Ok(())
    }

    /// Recipient side: leaves the sharing.
    pub async fn revoke_self(&self, sharing_id: &SharingId) -> SharingResult<()> {
        let _guard = self.lock_sharing(sharing_id).await;
        let mut sharing = self.store.load_sharing(sharing_id)?;
        if sharing.owner {
            return Err(SharingError::InvalidSharing(
                "the owner revokes the sharing instead".to_string(),
            ));
        }
        let owner = sharing.owner_member()?;
        if let (Ok(instance), Ok(token)) = (owner.instance(), owner.access_token()) {
            if let Err(e) = self.peer.delete_sharing(instance, sharing_id, token, false).await {
                warn!("Failed to notify owner of sharing {}: {}", sharing_id, e);
            }
        }
        sharing.revoke_locally();
        self.save_sharing(&sharing)?;
        self.detach_shared(sharing_id).await?;
        info!("Left sharing {}", sharing_id);
        Ok(())
    }

    /// Handles `DELETE /sharings/{id}` from an authenticated member.
    ///
    /// `recursive` comes from an owner revoking us; otherwise a recipient
    /// is leaving the sharing we own.
    pub async fn receive_revocation(
        &self,
        sharing_id: &SharingId,
        from: &MemberId,
        recursive: bool,
    ) -> SharingResult<()> {
        let _guard = self.lock_sharing(sharing_id).await;
        let mut sharing = self.store.load_sharing(sharing_id)?;
        if recursive {
            if sharing.owner || sharing.owner_member()?.id != *from {
                return Err(SharingError::InvalidSharing(
                    "only the owner revokes a sharing".to_string(),
                ));
            }
            sharing.revoke_locally();
            self.save_sharing(&sharing)?;
            self.detach_shared(sharing_id).await?;
            info!("Sharing {} revoked by its owner", sharing_id);
        } else {
            if !sharing.owner {
                return Err(SharingError::InvalidSharing(
                    "members leave through the owner".to_string(),
                ));
            }
            sharing.revoke_member_locally(from)?;
            self.save_sharing(&sharing)?;
            info!("Member {} left sharing {}", from, sharing_id);
        }
        Ok(())
    }

    // ── Inbound authentication ───────────────────────────────────

    /// Resolves the member calling us with an OAuth client id.
    pub fn authenticate(&self, sharing_id: &SharingId, client_id: &str) -> SharingResult<(Sharing, MemberId)> {
        let sharing = self.store.load_sharing(sharing_id)?;
        let member = sharing
            .member_by_client(client_id)
            .ok_or_else(|| SharingError::Auth("unknown client".to_string()))?;
        let allowed = if sharing.owner {
            member.is_ready()
        } else {
            member.status == MemberStatus::Owner
        };
        if !allowed || !sharing.active {
            return Err(SharingError::Auth(format!(
                "member {} may not call sharing {}",
                member.id, sharing.id
            )));
        }
        let member_id = member.id;
        Ok((sharing, member_id))
    }

    // ── Dispatcher ───────────────────────────────────────────────

    fn active_sharings_for(&self, doctype: &str) -> SharingResult<Arc<Vec<Sharing>>> {
        if let Some(sharings) = self.cache.get(doctype) {
            return Ok(sharings);
        }
        let sharings: Vec<Sharing> = self
            .store
            .list_sharings(true)?
            .into_iter()
            .filter(|s| s.rules.iter().any(|r| !r.local && r.doctype == doctype))
            .collect();
        Ok(self.cache.set(doctype, sharings))
    }

    /// Enqueues a track job for every active sharing the changed document
    /// belongs to. Returns the number of jobs.
    pub async fn on_document_change(&self, doctype: &str, doc: &Document, verb: Verb) -> SharingResult<usize> {
        let sharings = self.active_sharings_for(doctype)?;
        if sharings.is_empty() {
            return Ok(0);
        }
        let shared = self.store.get_shared_ref(&DocRef::new(doctype, doc.id.clone()))?;
        let parent = match doc.get_str("dir_id") {
            Some(dir_id) if doctype == FILES => self.store.get_shared_ref(&DocRef::new(FILES, dir_id))?,
            _ => None,
        };

        let mut queued = 0;
        for sharing in sharings.iter() {
            let known = shared
                .as_ref()
                .and_then(|s| s.info(&sharing.id))
                .or_else(|| parent.as_ref().and_then(|p| p.info(&sharing.id)))
                .map(|info| info.rule);
            let rule = known.or_else(|| {
                sharing
                    .rules
                    .iter()
                    .position(|rule| rule.accept(doctype, doc))
            });
            let Some(rule) = rule else {
                continue;
            };
            self.schedule(JobMessage::Track(TrackRequest {
                sharing_id: sharing.id.clone(),
                rule,
                verb,
                doctype: doctype.to_string(),
                doc: doc.clone(),
            }))
            .await?;
            queued += 1;
        }
        Ok(queued)
    }

    /// Feeds the document store's changes since `since` to the
    /// dispatcher. Returns the sequence to resume from.
    pub async fn process_changes(&self, doctype: &str, since: u64) -> SharingResult<u64> {
        let mut last = since;
        for change in self.docs.changes(doctype, since, self.config.changes_limit)? {
            if let Some(current) = self.docs.get_with_revisions(doctype, &change.id)? {
                let verb = if current.doc.deleted {
                    Verb::Deleted
                } else if generation(&change.rev) <= 1 {
                    Verb::Created
                } else {
                    Verb::Updated
                };
                self.on_document_change(doctype, &current.doc, verb).await?;
            }
            last = change.seq;
        }
        Ok(last)
    }

    // ── Jobs ─────────────────────────────────────────────────────

    /// Executes one job within its worker's timeout. Failed replicate and
    /// upload jobs schedule a retry job with a longer delay, until the
    /// retry budget is spent.
    pub async fn run_job(&self, message: JobMessage) -> SharingResult<()> {
        let timeout = self.config.job(message.worker()).timeout();
        let outcome = match tokio::time::timeout(timeout, self.execute(&message)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(SharingError::Timeout),
        };
        if let Err(e) = &outcome {
            self.schedule_retry(&message, e).await;
        }
        outcome
    }

    async fn execute(&self, message: &JobMessage) -> SharingResult<()> {
        match message {
            JobMessage::Track(request) => self.track(request).await,
            JobMessage::Replicate { sharing_id, .. } => self.replicate(sharing_id).await.map(|_| ()),
            JobMessage::Upload { sharing_id, .. } => self.upload(sharing_id).await.map(|_| ()),
        }
    }

    async fn schedule_retry(&self, message: &JobMessage, error: &SharingError) {
        if !error.is_retryable() {
            return;
        }
        let Some((retry, errors)) = message.retry() else {
            return;
        };
        if errors >= self.config.max_retries {
            warn!(
                "{} job gave up after {} error(s): {}",
                message.worker().as_str(),
                errors + 1,
                error
            );
            return;
        }
        let delay = self.config.job(message.worker()).backoff(errors);
        info!(
            "Retrying {} job in {:?} ({} previous error(s))",
            message.worker().as_str(),
            delay,
            errors + 1
        );
        if let Err(e) = self.scheduler.push(JobRequest::delayed(retry, delay)).await {
            warn!("Failed to schedule retry: {}", e);
        }
    }

    /// Track worker: indexes the change, then schedules its propagation
    /// when the rule's policy for the change is not `none`.
    pub async fn track(&self, request: &TrackRequest) -> SharingResult<()> {
        let shared = self.update_shared(request).await?;
        let sharing = self.store.load_sharing(&request.sharing_id)?;
        if !sharing.active {
            return Ok(());
        }
        let Some(info) = shared.info(&sharing.id) else {
            return Ok(());
        };
        let rule = sharing.rule(info.rule)?;
        if !rule.propagates(request.verb, sharing.owner) {
            debug!("{:?} of {} stays local", request.verb, shared.key);
            return Ok(());
        }
        let message = if info.binary {
            JobMessage::Upload {
                sharing_id: sharing.id.clone(),
                errors: 0,
            }
        } else {
            JobMessage::Replicate {
                sharing_id: sharing.id.clone(),
                errors: 0,
            }
        };
        self.schedule(message).await
    }
}
