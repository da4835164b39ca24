//! Members of a sharing and the secrets attached to each of them.
//!
//! Public member state and private credentials live in a single record
//! addressed by [`MemberId`]. Revoking a member drops its credentials; the
//! secret types zeroize their memory when dropped.

use crate::error::{SharingError, SharingResult};
use crate::xor::XorKey;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use cumulus_types::MemberId;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size in bytes of the random `state` token, before encoding.
const STATE_SIZE: usize = 24;

/// Lifecycle of a member.
///
/// `owner` is only used for the owner's own record; `revoked` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MemberStatus {
    Owner,
    MailNotSent,
    Pending,
    Ready,
    Revoked,
}

impl MemberStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Owner => "owner",
            Self::MailNotSent => "mail-not-sent",
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Revoked => "revoked",
        }
    }
}

impl fmt::Display for MemberStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An OAuth client registered on a peer instance.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct OAuthClient {
    pub client_id: String,
    pub client_secret: String,
    /// Token allowing to update or delete the registration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration_token: Option<String>,
}

impl fmt::Debug for OAuthClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthClient")
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .finish()
    }
}

/// An access/refresh token pair issued by a peer.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct AccessToken {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: String,
    #[serde(default)]
    pub scope: String,
}

impl AccessToken {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
            scope: String::new(),
        }
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .field("scope", &self.scope)
            .finish()
    }
}

/// Secrets of one member pairing.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct Credentials {
    /// One-time token carried through the authorize step.
    pub state: String,
    /// Our client registered on the member's instance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<OAuthClient>,
    /// Token to call the member's instance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<AccessToken>,
    /// Obfuscation key for identifiers exchanged with this member.
    pub xor_key: XorKey,
    /// Client id the member uses when calling us back.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inbound_client_id: Option<String>,
}

impl Credentials {
    /// Fresh credentials with a random `state` and obfuscation key.
    pub fn new() -> Self {
        let mut bytes = [0u8; STATE_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        let state = URL_SAFE_NO_PAD.encode(bytes);
        bytes.zeroize();
        Self {
            state,
            client: None,
            access_token: None,
            xor_key: XorKey::generate(),
            inbound_client_id: None,
        }
    }
}

impl Default for Credentials {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("state", &"[REDACTED]")
            .field("client", &self.client)
            .field("access_token", &self.access_token)
            .field("xor_key", &self.xor_key)
            .field("inbound_client_id", &self.inbound_client_id)
            .finish()
    }
}

/// A participant of a sharing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub id: MemberId,
    pub status: MemberStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// URL of the member's instance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Credentials>,
}

impl Member {
    /// The owner's own record.
    pub fn owner(name: Option<String>, email: Option<String>, instance: impl Into<String>) -> Self {
        Self {
            id: MemberId::new(),
            status: MemberStatus::Owner,
            name,
            email,
            instance: Some(instance.into()),
            credentials: None,
        }
    }

    /// A new recipient, not yet invited, with fresh credentials.
    pub fn contact(name: Option<String>, email: Option<String>, instance: Option<String>) -> Self {
        Self {
            id: MemberId::new(),
            status: MemberStatus::MailNotSent,
            name,
            email,
            instance,
            credentials: Some(Credentials::new()),
        }
    }

    /// The record without its secrets, as sent to other members.
    pub fn public(&self) -> Self {
        Self {
            id: self.id,
            status: self.status,
            name: self.name.clone(),
            email: self.email.clone(),
            instance: self.instance.clone(),
            credentials: None,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.status == MemberStatus::Ready
    }

    pub fn is_revoked(&self) -> bool {
        self.status == MemberStatus::Revoked
    }

    pub fn instance(&self) -> SharingResult<&str> {
        self.instance.as_deref().ok_or(SharingError::MissingUrl)
    }

    pub fn credentials(&self) -> SharingResult<&Credentials> {
        self.credentials
            .as_ref()
            .ok_or_else(|| SharingError::InvalidSharing(format!("member {} has no credentials", self.id)))
    }

    pub fn credentials_mut(&mut self) -> SharingResult<&mut Credentials> {
        let id = self.id;
        self.credentials
            .as_mut()
            .ok_or_else(|| SharingError::InvalidSharing(format!("member {id} has no credentials")))
    }

    /// The registered OAuth client for this member's instance.
    pub fn client(&self) -> SharingResult<&OAuthClient> {
        self.credentials()?.client.as_ref().ok_or(SharingError::NoOAuthClient)
    }

    /// The token used to call this member's instance.
    pub fn access_token(&self) -> SharingResult<&str> {
        self.credentials()?
            .access_token
            .as_ref()
            .map(|token| token.access_token.as_str())
            .ok_or_else(|| SharingError::Auth(format!("no access token for member {}", self.id)))
    }

    /// Marks the member revoked and drops its secrets.
    pub fn revoke(&mut self) {
        self.status = MemberStatus::Revoked;
        self.credentials = None;
    }
}
