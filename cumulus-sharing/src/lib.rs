//! Sharing and replication engine for Cumulus instances.
//!
//! A sharing is an agreement between an owner and one or more recipients,
//! each on their own instance, to replicate a subset of documents. This
//! crate tracks which documents are shared, manages the members and their
//! credentials, and replicates changes between instances.
//!
//! # Architecture
//!
//! ## Components
//!
//! - **Rules**: select the shared documents and the propagation policy of
//!   each kind of change
//! - **Shared index**: one entry per shared document, with the sharings
//!   referencing it and the revisions seen locally; its change sequence
//!   feeds replication
//! - **Members**: lifecycle and credentials of every participant
//! - **Replicator**: pushes missing revisions with `_revs_diff` and
//!   `_bulk_docs`, and merges what it receives through the conflict
//!   resolver
//! - **Uploader**: sends regular files, metadata first, content on demand
//! - **Engine**: lifecycle operations, change dispatch and job execution
//!
//! ## Replication Process
//!
//! 1. **Dispatch**: a local change enqueues a `track` job per sharing
//! 2. **Track**: the shared index is updated and, when the rule's policy
//!    propagates the change, a `replicate` or `upload` job is queued
//! 3. **Diff**: the member says which revisions it misses
//! 4. **Push**: the missing documents are sent with their revision chains
//! 5. **Merge**: the member resolves conflicts and force-writes the chains
//!
//! # Example
//!
//! ```
//! use cumulus_sharing::{Member, Rule, Sharing};
//!
//! let owner = Member::owner(Some("Alice".to_string()), None, "https://alice.example");
//! let rule = Rule::new("notes", "io.cozy.notes", vec!["note1".to_string()]);
//! let mut sharing = Sharing::new("My notes", vec![rule], owner);
//! sharing
//!     .add_contact(Some("Bob".to_string()), None, Some("https://bob.example".to_string()))
//!     .unwrap();
//! assert!(sharing.validate().is_ok());
//! ```

pub mod api;
mod cache;
mod config;
mod engine;
mod error;
pub mod jobs;
pub mod lock;
pub mod member;
mod peer;
pub mod protocol;
mod replicator;
pub mod rule;
pub mod shared;
pub mod sharing;
pub mod store;
pub mod transform;
pub mod upload;
pub mod xor;

pub use api::{build_router, ApiState, StaticTokens, TokenVerifier};
pub use cache::SharingCache;
pub use config::{JobConfig, SharingConfig};
pub use engine::SharingEngine;
pub use error::{SharingError, SharingResult};
pub use jobs::{ChannelScheduler, JobMessage, JobRequest, JobRunner, JobScheduler, MemoryScheduler, WorkerKind};
pub use lock::LockManager;
pub use member::{AccessToken, Credentials, Member, MemberStatus, OAuthClient};
pub use peer::PeerClient;
pub use protocol::{BulkDocs, ClientRegistration, FileMetadataResponse, RevsDiff, SharingRequest};
pub use rule::{Policy, Rule, Verb};
pub use shared::{SharedInfo, SharedRef, TrackRequest};
pub use sharing::Sharing;
pub use store::{CheckpointKind, SharingStore};
pub use xor::XorKey;
