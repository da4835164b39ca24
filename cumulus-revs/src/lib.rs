//! Revision trees and deterministic conflict resolution.
//!
//! A revision is a `"<generation>-<hash>"` string attached to one state of a
//! document. This crate knows nothing about document content; it answers two
//! questions from revision strings alone:
//!
//! - [`RevisionTree`]: what is the lineage of a document, and does it carry
//!   unresolved conflicts (several leaves)?
//! - [`detect_conflict`]: given a revision and a known chain, does the
//!   revision continue the chain, and if not, which side keeps its data?
//!
//! The outcome of a conflict only depends on the two revision strings
//! involved, so every instance reaches the same decision regardless of the
//! order in which it received the updates.

mod conflict;
mod revision;
mod tree;

pub use conflict::{
    conflict_name, detect_conflict, mixup_chain_to_resolve_conflict, ConflictStatus,
};
pub use revision::{compare_revs, generation, hash_part};
pub use tree::RevisionTree;
