//! Eviction planning under quota pressure.

use crate::Timestamp;

/// An entry that may be evicted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Candidate {
    pub key: String,
    pub last_modified: Timestamp,
    pub size: usize,
}

/// Pick the entries to evict to free `needed` bytes, oldest first.
///
/// Returns a prefix of the candidates ordered by `last_modified` (ties by
/// key). If all candidates together free less than `needed`, all of them are
/// returned and the caller's retry decides the outcome.
pub(crate) fn plan(mut candidates: Vec<Candidate>, needed: usize) -> Vec<Candidate> {
    candidates.sort_by(|a, b| {
        a.last_modified
            .cmp(&b.last_modified)
            .then_with(|| a.key.cmp(&b.key))
    });

    let mut freed = 0;
    let mut chosen = Vec::new();
    for candidate in candidates {
        if freed >= needed {
            break;
        }
        freed += candidate.size;
        chosen.push(candidate);
    }
    chosen
}
