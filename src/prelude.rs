//! Re-exports of the types most callers need.

pub use crate::id::{
    Blake2b, Blake3, ContentHash, EntryId, HashProtocol, NoteId, ReplicaId, TargetId,
};
pub use crate::import::{comments_from_json, ReviewComment};
pub use crate::merge::{MergePolicy, Resolution};
pub use crate::note::{now_ns, Note, NoteEntry, Parents};
pub use crate::replica::{History, Replica, SetError};
pub use crate::store::memory::MemoryStore;
pub use crate::store::objectstore::ObjectStoreRemote;
pub use crate::store::{
    HeadStore, NoteStore, NoteStoreGet, NoteStorePut, TargetStore, UpdateResult,
};
pub use crate::sync::{FetchSummary, PushSummary, RemoteTracker, SyncPhase};
