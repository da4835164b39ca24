//! Declarative sharing rules.
//!
//! A [`Rule`] selects the documents of one doctype that belong to a sharing
//! and says, per kind of change, how those changes propagate.

use crate::error::{SharingError, SharingResult};
use cumulus_types::{doctype, Document};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Propagation policy of one kind of change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Policy {
    /// The change stays local.
    #[default]
    None,
    /// Changes flow from the owner to the recipients only.
    Push,
    /// Changes flow both ways.
    Sync,
    /// Removing the document revokes the sharing. Only valid for removals.
    Revoke,
}

impl Policy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Push => "push",
            Self::Sync => "sync",
            Self::Revoke => "revoke",
        }
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Policy {
    type Err = SharingError;

    /// Case-insensitive; an empty token means `none`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Ok(Self::None),
            "push" => Ok(Self::Push),
            "sync" => Ok(Self::Sync),
            "revoke" => Ok(Self::Revoke),
            other => Err(SharingError::InvalidRule(format!("unknown policy {other:?}"))),
        }
    }
}

impl TryFrom<String> for Policy {
    type Error = SharingError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Policy> for String {
    fn from(policy: Policy) -> Self {
        policy.as_str().to_string()
    }
}

/// Kind of local change that triggered a track event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verb {
    Created,
    Updated,
    Deleted,
}

/// What is shared, and how its changes propagate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub title: String,
    pub doctype: String,
    /// Field matched against `values`; the document id when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    #[serde(default)]
    pub values: Vec<String>,
    /// Local rules describe the sharing but never match documents.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub local: bool,
    #[serde(default)]
    pub add: Policy,
    #[serde(default)]
    pub update: Policy,
    #[serde(default)]
    pub remove: Policy,
}

impl Rule {
    /// Creates a rule matching documents by id, with every policy `none`.
    pub fn new(title: impl Into<String>, doctype: impl Into<String>, values: Vec<String>) -> Self {
        Self {
            title: title.into(),
            doctype: doctype.into(),
            selector: None,
            values,
            local: false,
            add: Policy::None,
            update: Policy::None,
            remove: Policy::None,
        }
    }

    /// Sets the three policies, builder style.
    #[must_use]
    pub fn with_policies(mut self, add: Policy, update: Policy, remove: Policy) -> Self {
        self.add = add;
        self.update = update;
        self.remove = remove;
        self
    }

    /// Sets the selector field, builder style.
    #[must_use]
    pub fn with_selector(mut self, selector: impl Into<String>) -> Self {
        self.selector = Some(selector.into());
        self
    }

    /// Parses a rule from loosely typed JSON.
    ///
    /// Unknown policy tokens are reported as an invalid rule.
    pub fn from_json(value: serde_json::Value) -> SharingResult<Self> {
        serde_json::from_value(value).map_err(|e| SharingError::InvalidRule(e.to_string()))
    }

    pub fn validate(&self) -> SharingResult<()> {
        if self.title.trim().is_empty() {
            return Err(SharingError::InvalidRule("missing title".to_string()));
        }
        if self.doctype.trim().is_empty() {
            return Err(SharingError::InvalidRule(format!("{}: missing doctype", self.title)));
        }
        if self.values.is_empty() {
            return Err(SharingError::InvalidRule(format!("{}: missing values", self.title)));
        }
        if !self.is_files() && doctype::is_blocked(&self.doctype) {
            return Err(SharingError::InvalidRule(format!(
                "{}: doctype {} cannot be shared",
                self.title, self.doctype
            )));
        }
        if self.add == Policy::Revoke || self.update == Policy::Revoke {
            return Err(SharingError::InvalidRule(format!(
                "{}: revoke is only allowed for removals",
                self.title
            )));
        }
        Ok(())
    }

    /// Returns true if this rule selects `doc`.
    pub fn accept(&self, doctype: &str, doc: &Document) -> bool {
        if self.local || self.doctype != doctype {
            return false;
        }
        doc.selector_value(self.selector.as_deref())
            .is_some_and(|value| self.values.iter().any(|v| v == value))
    }

    pub fn policy_for(&self, verb: Verb) -> Policy {
        match verb {
            Verb::Created => self.add,
            Verb::Updated => self.update,
            Verb::Deleted => self.remove,
        }
    }

    /// Returns true if a change of this kind leaves the instance.
    ///
    /// The owner sends changes for `push`, `sync` and `revoke`; recipients
    /// only send back what is synchronized.
    pub fn propagates(&self, verb: Verb, from_owner: bool) -> bool {
        match self.policy_for(verb) {
            Policy::None => false,
            Policy::Sync => true,
            Policy::Push | Policy::Revoke => from_owner,
        }
    }

    pub fn is_files(&self) -> bool {
        self.doctype == doctype::FILES
    }

    /// Returns true when no change ever flows back to the owner.
    pub fn read_only(&self) -> bool {
        ![self.add, self.update, self.remove].contains(&Policy::Sync)
    }
}

/// Validates the rule set of a sharing.
pub fn validate_rules(rules: &[Rule]) -> SharingResult<()> {
    if rules.is_empty() {
        return Err(SharingError::NoRules);
    }
    rules.iter().try_for_each(Rule::validate)
}
