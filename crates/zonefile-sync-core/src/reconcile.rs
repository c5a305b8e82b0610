//! Key-set reconciliation between a remote snapshot and the local directory.
//!
//! Only key membership is compared. Every remote key is rewritten on
//! bootstrap regardless of local content, so content drift never needs
//! detecting here.

use std::collections::{BTreeMap, BTreeSet};

use crate::model::Key;

/// Local keys absent from the remote key set (`local \ remote`).
pub fn diff<'a, R, L>(remote: R, local: L) -> BTreeSet<Key>
where
    R: IntoIterator<Item = &'a Key>,
    L: IntoIterator<Item = &'a Key>,
{
    let remote: BTreeSet<&Key> = remote.into_iter().collect();
    local
        .into_iter()
        .filter(|key| !remote.contains(key))
        .cloned()
        .collect()
}

/// Deletions needed to match `local` to the keys of `records`.
pub fn deletions_for(records: &BTreeMap<Key, String>, local: &BTreeSet<Key>) -> BTreeSet<Key> {
    diff(records.keys(), local)
}
