//! The sharing aggregate.
//!
//! A [`Sharing`] composes the rules, the members and the state of one
//! agreement between instances. The methods here are the synchronous part
//! of the lifecycle; everything that talks to a peer or to storage lives on
//! [`crate::SharingEngine`].

use crate::error::{SharingError, SharingResult};
use crate::member::{AccessToken, Member, MemberStatus};
use crate::rule::{validate_rules, Rule};
use chrono::{DateTime, Utc};
use cumulus_types::{MemberId, SharingId};
use serde::{Deserialize, Serialize};
use tracing::info;

/// An agreement to replicate a subset of documents between instances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sharing {
    pub id: SharingId,
    /// True on the instance that created the sharing.
    pub owner: bool,
    /// Recipients may invite other members.
    #[serde(default)]
    pub open: bool,
    pub description: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub app_slug: String,
    pub rules: Vec<Rule>,
    /// On the owner, `members[0]` is the owner's own record.
    pub members: Vec<Member>,
    /// The member record of this instance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_member: Option<MemberId>,
    pub active: bool,
    #[serde(default)]
    pub revoked: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Sharing {
    /// A new sharing owned by this instance.
    pub fn new(description: impl Into<String>, rules: Vec<Rule>, owner: Member) -> Self {
        let now = Utc::now();
        let local_member = Some(owner.id);
        Self {
            id: SharingId::new(),
            owner: true,
            open: false,
            description: description.into(),
            app_slug: String::new(),
            rules,
            members: vec![owner],
            local_member,
            active: false,
            revoked: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Checks the sharing can be created: at least one valid rule and at
    /// least one recipient.
    pub fn validate(&self) -> SharingResult<()> {
        validate_rules(&self.rules)?;
        if self.recipients().next().is_none() {
            return Err(SharingError::NoRecipients);
        }
        Ok(())
    }

    /// Members other than the owner.
    pub fn recipients(&self) -> impl Iterator<Item = &Member> {
        self.members.iter().filter(|m| m.status != MemberStatus::Owner)
    }

    /// Recipients that accepted the sharing.
    pub fn ready_members(&self) -> impl Iterator<Item = &Member> {
        self.recipients().filter(|m| m.is_ready())
    }

    pub fn member(&self, id: &MemberId) -> SharingResult<&Member> {
        self.members
            .iter()
            .find(|m| m.id == *id)
            .ok_or(SharingError::MemberNotFound(*id))
    }

    pub fn member_mut(&mut self, id: &MemberId) -> SharingResult<&mut Member> {
        self.members
            .iter_mut()
            .find(|m| m.id == *id)
            .ok_or(SharingError::MemberNotFound(*id))
    }

    /// The owner's record; on a recipient, the member it replicates with.
    pub fn owner_member(&self) -> SharingResult<&Member> {
        self.members
            .first()
            .ok_or_else(|| SharingError::InvalidSharing("sharing has no members".to_string()))
    }

    /// The member whose credentials carry the given `state` token.
    pub fn member_by_state(&self, state: &str) -> SharingResult<&Member> {
        self.members
            .iter()
            .find(|m| m.credentials.as_ref().is_some_and(|c| c.state == state))
            .ok_or_else(|| SharingError::InvalidSharing("unknown state".to_string()))
    }

    /// The member that authenticates to us with this OAuth client.
    pub fn member_by_client(&self, client_id: &str) -> Option<&Member> {
        self.members.iter().find(|m| {
            m.credentials
                .as_ref()
                .and_then(|c| c.inbound_client_id.as_deref())
                == Some(client_id)
        })
    }

    pub fn rule(&self, index: usize) -> SharingResult<&Rule> {
        self.rules
            .get(index)
            .ok_or_else(|| SharingError::InvalidSharing(format!("no rule at index {index}")))
    }

    /// True when no rule lets recipients send changes back.
    pub fn read_only(&self) -> bool {
        self.rules.iter().all(Rule::read_only)
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Appends a recipient in `mail-not-sent`, with a fresh obfuscation
    /// key and `state` token.
    pub fn add_contact(
        &mut self,
        name: Option<String>,
        email: Option<String>,
        instance: Option<String>,
    ) -> SharingResult<MemberId> {
        if !self.owner && !self.open {
            return Err(SharingError::InvalidSharing(
                "only the owner can add members".to_string(),
            ));
        }
        if self.revoked {
            return Err(SharingError::InvalidSharing("sharing is revoked".to_string()));
        }
        let member = Member::contact(name, email, instance);
        let id = member.id;
        self.members.push(member);
        self.touch();
        info!("Added contact {} to sharing {}", id, self.id);
        Ok(id)
    }

    /// The consent URL on a member's instance.
    ///
    /// Requires the member's instance URL and a registered OAuth client.
    pub fn generate_oauth_url(&self, member_id: &MemberId, redirect_uri: &str) -> SharingResult<String> {
        let member = self.member(member_id)?;
        if member.status == MemberStatus::Owner {
            return Err(SharingError::InvalidSharing(
                "no authorization needed for the owner".to_string(),
            ));
        }
        let instance = member.instance()?;
        let credentials = member.credentials()?;
        let client = credentials.client.as_ref().ok_or(SharingError::NoOAuthClient)?;
        Ok(format!(
            "{}/auth/authorize?client_id={}&redirect_uri={}&response_type=code&scope={}&sharing_id={}&state={}",
            instance.trim_end_matches('/'),
            urlencoding::encode(&client.client_id),
            urlencoding::encode(redirect_uri),
            urlencoding::encode(&self.scope()),
            urlencoding::encode(self.id.as_str()),
            urlencoding::encode(&credentials.state),
        ))
    }

    /// The OAuth scope covering the doctypes of the rules.
    pub fn scope(&self) -> String {
        let mut doctypes: Vec<&str> = self
            .rules
            .iter()
            .filter(|rule| !rule.local)
            .map(|rule| rule.doctype.as_str())
            .collect();
        doctypes.sort_unstable();
        doctypes.dedup();
        doctypes.join(" ")
    }

    /// Records a member's consent: the token to call its instance and the
    /// client id it will use to call us.
    pub fn accept(
        &mut self,
        state: &str,
        token: AccessToken,
        inbound_client_id: impl Into<String>,
    ) -> SharingResult<MemberId> {
        if !self.owner {
            return Err(SharingError::InvalidSharing(
                "only the owner accepts members".to_string(),
            ));
        }
        let member_id = self.member_by_state(state)?.id;
        let member = self.member_mut(&member_id)?;
        match member.status {
            MemberStatus::MailNotSent | MemberStatus::Pending | MemberStatus::Ready => {}
            status => {
                return Err(SharingError::InvalidSharing(format!(
                    "cannot accept a member in status {status}"
                )));
            }
        }
        let credentials = member.credentials_mut()?;
        credentials.access_token = Some(token);
        credentials.inbound_client_id = Some(inbound_client_id.into());
        member.status = MemberStatus::Ready;
        self.active = true;
        self.touch();
        info!("Member {} accepted sharing {}", member_id, self.id);
        Ok(member_id)
    }

    /// Marks a member revoked and drops its credentials.
    ///
    /// The sharing is deactivated once no recipient is left.
    pub fn revoke_member_locally(&mut self, member_id: &MemberId) -> SharingResult<()> {
        let member = self.member_mut(member_id)?;
        if member.status == MemberStatus::Owner {
            return Err(SharingError::InvalidSharing("the owner cannot be revoked".to_string()));
        }
        member.revoke();
        if self.recipients().all(Member::is_revoked) {
            self.active = false;
        }
        self.touch();
        Ok(())
    }

    /// Deactivates the sharing and drops every secret.
    pub fn revoke_locally(&mut self) {
        for member in &mut self.members {
            if member.status != MemberStatus::Owner {
                member.status = MemberStatus::Revoked;
            }
            member.credentials = None;
        }
        self.active = false;
        self.revoked = true;
        self.touch();
    }
}
