//! Error types for the sharing layer.

use cumulus_store::StoreError;
use cumulus_types::MemberId;
use thiserror::Error;

/// Result type for sharing operations.
pub type SharingResult<T> = Result<T, SharingError>;

/// Errors that can occur in sharing operations.
#[derive(Debug, Error)]
pub enum SharingError {
    /// A sharing must have at least one rule.
    #[error("a sharing must have at least one rule")]
    NoRules,

    /// A sharing must have at least one member besides its owner.
    #[error("a sharing must have at least one recipient")]
    NoRecipients,

    /// A rule failed validation.
    #[error("invalid rule: {0}")]
    InvalidRule(String),

    /// The operation is not allowed in the sharing's current state.
    #[error("invalid sharing: {0}")]
    InvalidSharing(String),

    /// The member has no instance URL.
    #[error("member has no instance URL")]
    MissingUrl,

    /// No OAuth client has been registered for the member.
    #[error("no OAuth client registered for this member")]
    NoOAuthClient,

    /// The member may not make this change.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Member not found in the sharing.
    #[error("member not found: {0}")]
    MemberNotFound(MemberId),

    /// Sharing not found.
    #[error("sharing not found: {0}")]
    SharingNotFound(String),

    /// Transport failure while talking to a peer.
    #[error("network error: {0}")]
    Network(String),

    /// The peer answered with a non-success status.
    #[error("peer responded {status}: {body}")]
    Peer { status: u16, body: String },

    /// Authentication or token exchange failed.
    #[error("authentication error: {0}")]
    Auth(String),

    /// Failures accumulated across members.
    #[error("{} member(s) failed: {}", .0.len(), format_member_errors(.0))]
    Replication(Vec<(MemberId, String)>),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Document store error.
    #[error("document store error: {0}")]
    Store(#[from] StoreError),

    /// A document could not be interpreted.
    #[error("invalid document: {0}")]
    Document(#[from] cumulus_types::Error),

    /// Timeout.
    #[error("operation timed out")]
    Timeout,

    /// The job queue is closed.
    #[error("channel closed")]
    ChannelClosed,
}

impl SharingError {
    /// Returns true for failures a new background job may overcome.
    ///
    /// Validation and state errors are never retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network(_)
                | Self::Peer { .. }
                | Self::Auth(_)
                | Self::Replication(_)
                | Self::Storage(_)
                | Self::Store(_)
                | Self::Timeout
        )
    }

    /// Returns true when the peer rejected our access token.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Peer { status: 401 | 403, .. })
    }
}

fn format_member_errors(errors: &[(MemberId, String)]) -> String {
    errors
        .iter()
        .map(|(member, error)| format!("{member}: {error}"))
        .collect::<Vec<_>>()
        .join("; ")
}
