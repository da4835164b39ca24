//! Tagged document representation.
//!
//! A [`Document`] has the handful of fields the sharing engine reasons about
//! (`_id`, `_rev`, `_deleted`) as typed members, and everything else in an
//! open extension bag. File documents get a further typed view, [`FileDoc`],
//! so that identifier and path rewriting goes through named fields.

use crate::doctype::{DIR_TYPE, FILE_TYPE};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A revisioned JSON document.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Document {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    #[serde(rename = "_deleted", default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Document {
    /// Creates an empty document with the given id.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    /// Sets a field, builder style.
    #[must_use]
    pub fn with(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(field.to_string(), value.into());
        self
    }

    /// Returns a field of the extension bag.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Returns a field as a string, if it is one.
    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.fields.get(field).and_then(Value::as_str)
    }

    /// Returns the value a rule selector designates.
    ///
    /// `id` (or no selector) is the document identifier; any other selector
    /// is looked up in the extension bag and must be a string.
    pub fn selector_value(&self, selector: Option<&str>) -> Option<&str> {
        match selector {
            None | Some("") | Some("id") | Some("_id") => Some(&self.id),
            Some(field) => self.get_str(field),
        }
    }
}

/// Kind of a file-system node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    File,
    Directory,
}

impl FileKind {
    /// Returns the value stored in the `type` field.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::File => FILE_TYPE,
            Self::Directory => DIR_TYPE,
        }
    }
}

/// Typed view of an `io.cozy.files` document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileDoc {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    #[serde(rename = "type")]
    pub kind: FileKind,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir_id: Option<String>,
    /// Absolute path, only maintained locally for directories.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub md5sum: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl FileDoc {
    /// Returns true for directories.
    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }

    /// Builds the typed view from a generic document.
    pub fn from_document(doc: &Document) -> crate::Result<Self> {
        let value = serde_json::to_value(doc)?;
        serde_json::from_value(value).map_err(|e| crate::Error::InvalidFile(format!("{}: {e}", doc.id)))
    }

    /// Converts back into a generic document.
    pub fn into_document(self) -> crate::Result<Document> {
        let value = serde_json::to_value(self)?;
        Ok(serde_json::from_value(value)?)
    }
}
