use std::collections::BTreeMap;

use crate::error::SyncError;

/// Domain identifier; maps 1:1 to a file name in the managed directory.
pub type Key = String;

/// Commit point assigned by the remote store.
pub type Revision = i64;

/// Current committed value for a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZonefileRecord {
    pub key: Key,
    pub content: String,
}

/// Point-in-time read of every key under a prefix.
///
/// All writes up to and including `revision` are reflected in `records`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub records: BTreeMap<Key, String>,
    pub revision: Revision,
}

/// One item of a change stream.
///
/// `Failed` terminates the stream: nothing follows it.
#[derive(Debug)]
pub enum ChangeEvent {
    Upsert(ZonefileRecord),
    Delete(Key),
    Failed(SyncError),
}
