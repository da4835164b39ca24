//! Core type definitions for the Cumulus sharing engine.
//!
//! This crate defines the fundamental types shared by every layer:
//! - Sharing, member and document identifiers
//! - Doctype constants and the reserved-doctype list
//! - The tagged [`Document`] representation exchanged between instances
//!
//! Storage, revision tracking and the sharing protocol itself live in
//! their own crates.

pub mod doctype;
mod document;
mod ids;

pub use document::{Document, FileDoc, FileKind};
pub use ids::{DocRef, MemberId, SharingId};

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in type operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid UUID: {0}")]
    InvalidUuid(#[from] uuid::Error),

    #[error("invalid document reference: {0}")]
    InvalidDocRef(String),

    #[error("invalid file document: {0}")]
    InvalidFile(String),
}
