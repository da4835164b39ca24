//! Helpers over `"<generation>-<hash>"` revision strings.

use std::cmp::Ordering;

/// Separator between the generation and the hash of a revision.
pub const SEPARATOR: char = '-';

/// Returns the generation of a revision: its integer prefix.
///
/// Malformed input yields 0.
#[must_use]
pub fn generation(rev: &str) -> u64 {
    let prefix = rev.split_once(SEPARATOR).map_or(rev, |(prefix, _)| prefix);
    prefix.parse().unwrap_or(0)
}

/// Returns the hash part of a revision, if it has one.
#[must_use]
pub fn hash_part(rev: &str) -> Option<&str> {
    rev.split_once(SEPARATOR).map(|(_, hash)| hash)
}

/// Orders two revisions by generation, then lexicographically.
///
/// This is the order used to pick a deterministic winner among leaves.
#[must_use]
pub fn compare_revs(a: &str, b: &str) -> Ordering {
    generation(a)
        .cmp(&generation(b))
        .then_with(|| a.cmp(b))
}
