//! Messages exchanged between instances.

use crate::error::SharingResult;
use crate::member::Member;
use crate::rule::Rule;
use crate::sharing::Sharing;
use cumulus_store::{RevisionedDoc, RevsMap};
use cumulus_types::{MemberId, SharingId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Revision-diff request or response, per doctype.
pub type RevsDiff = BTreeMap<String, RevsMap>;

/// Documents of a forced bulk write, per doctype.
pub type BulkDocs = BTreeMap<String, Vec<RevisionedDoc>>;

/// Description of a sharing sent to a new member (`PUT /sharings/{id}`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharingRequest {
    pub id: SharingId,
    pub description: String,
    #[serde(default)]
    pub app_slug: String,
    #[serde(default)]
    pub open: bool,
    pub rules: Vec<Rule>,
    /// Members without their secrets; the first one is the owner.
    pub members: Vec<Member>,
    /// The member this request is addressed to.
    pub recipient: MemberId,
    /// The recipient's `state` token, to present when consenting.
    pub state: String,
}

impl SharingRequest {
    pub fn for_member(sharing: &Sharing, recipient: &MemberId) -> SharingResult<Self> {
        let member = sharing.member(recipient)?;
        Ok(Self {
            id: sharing.id.clone(),
            description: sharing.description.clone(),
            app_slug: sharing.app_slug.clone(),
            open: sharing.open,
            rules: sharing.rules.clone(),
            members: sharing.members.iter().map(Member::public).collect(),
            recipient: member.id,
            state: member.credentials()?.state.clone(),
        })
    }
}

/// Answer to a file metadata push.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadataResponse {
    /// Key to upload the content under, when the peer needs it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

/// Dynamic OAuth client registration request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRegistration {
    pub redirect_uris: Vec<String>,
    pub client_name: String,
    pub client_kind: String,
    pub software_id: String,
    pub client_uri: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ClientRegistrationResponse {
    pub client_id: String,
    pub client_secret: String,
    #[serde(default)]
    pub registration_access_token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

/// Error body returned by the inbound router.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}
