//! Conflict detection between an incoming revision and a known chain.

use crate::revision::generation;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Outcome of comparing a revision with a known chain.
///
/// This is a control-flow value, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictStatus {
    /// The revision is part of the chain.
    NoConflict,
    /// The chain's tip is greater: the revision is folded in below the
    /// chain's newer tail, which stays the head.
    WonConflict,
    /// The revision is at least as recent as the chain's tip: the chain is
    /// rejected as stale.
    LostConflict,
}

/// Compares `rev` with the most recent element of `chain`.
///
/// The comparison only looks at generations, then at the full revision
/// strings, so both instances involved in a conflict reach mirrored
/// decisions. An empty chain always loses.
#[must_use]
pub fn detect_conflict(rev: &str, chain: &[String]) -> ConflictStatus {
    let Some(tip) = chain.last() else {
        return ConflictStatus::LostConflict;
    };
    if chain.iter().any(|known| known == rev) {
        return ConflictStatus::NoConflict;
    }
    match generation(tip).cmp(&generation(rev)) {
        Ordering::Greater => ConflictStatus::WonConflict,
        Ordering::Less => ConflictStatus::LostConflict,
        Ordering::Equal if tip.as_str() > rev => ConflictStatus::WonConflict,
        Ordering::Equal => ConflictStatus::LostConflict,
    }
}

/// Builds a chain starting at `rev` and continuing with every element of
/// `chain` whose generation is strictly greater.
///
/// Force-writing this chain makes `rev` an ancestor of the chain's newer
/// tail instead of a sibling branch.
#[must_use]
pub fn mixup_chain_to_resolve_conflict(rev: &str, chain: &[String]) -> Vec<String> {
    let floor = generation(rev);
    std::iter::once(rev.to_string())
        .chain(chain.iter().filter(|r| generation(r) > floor).cloned())
        .collect()
}

/// Deterministic alternate name for a diverged copy.
///
/// `"notes.txt"` with suffix `"2"` becomes `"notes (2).txt"`. A trailing
/// `" (...)"` marker left by a previous conflict is replaced rather than
/// stacked. Names starting with a dot keep their whole text as the base.
#[must_use]
pub fn conflict_name(name: &str, suffix: &str) -> String {
    let (base, ext) = match name.rfind('.') {
        Some(dot) if dot > 0 => name.split_at(dot),
        _ => (name, ""),
    };
    let base = match base.rfind(" (") {
        Some(open) if open > 0 && base.ends_with(')') => &base[..open],
        _ => base,
    };
    format!("{base} ({suffix}){ext}")
}
