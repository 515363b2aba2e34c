//! The local replica: the crate's high-level API.
//!
//! A [`Replica`] wraps a storage backend and exposes the annotation
//! operations: storing note payloads, setting and appending heads, reading
//! history and importing review comments. Synchronization with remote
//! replicas lives in [`crate::sync`] and is implemented as further methods on
//! this type.
//!
//! ## Basic usage
//!
//! ```rust,ignore
//! use ed25519_dalek::SigningKey;
//! use rand::rngs::OsRng;
//! use scholia::prelude::*;
//!
//! let mut store = MemoryStore::new();
//! store.register_target(target);
//! let mut replica = Replica::new(store, SigningKey::generate(&mut OsRng));
//!
//! let note = Note::new("discussion", "drew", now_ns(), &b"looks good"[..]);
//! let note_id = replica.put_note(&note).expect("put note");
//! let entry_id = replica.append("discussion", target, note_id).expect("append");
//! assert_eq!(replica.head("discussion", target).expect("head"), Some(entry_id));
//! ```
//!
//! ## Concurrency discipline
//!
//! `set`, `append` and merge adoption on a given `(namespace, target)` key
//! are serialized by the head store's compare-and-swap: a write only lands if
//! the head still equals the parent the writer observed, otherwise it fails
//! with `StaleParent` and the caller re-reads the head and retries. Different
//! targets and different namespaces are independent. An entry blob is always
//! fully stored before its head is published, so an interrupted operation
//! never leaves a half-linked chain behind.

use std::collections::BinaryHeap;
use std::collections::HashSet;
use std::fmt;

use ed25519_dalek::SigningKey;

use crate::id::Blake3;
use crate::id::EntryId;
use crate::id::HashProtocol;
use crate::id::NoteId;
use crate::id::ReplicaId;
use crate::id::TargetId;
use crate::import;
use crate::import::ReviewComment;
use crate::merge::MergePolicy;
use crate::note::Note;
use crate::note::NoteEntry;
use crate::note::Parents;
use crate::store::HeadStore;
use crate::store::NoteStore;
use crate::store::NoteStoreGet;
use crate::store::TargetStore;
use crate::store::UpdateResult;

/// A local replica of the annotation store.
///
/// Generic over its storage backend; [`crate::store::memory::MemoryStore`]
/// is the usual choice for local state. The signing key authenticates every
/// entry this replica creates.
pub struct Replica<Storage>
where
    Storage: NoteStore<Blake3> + HeadStore<Blake3> + TargetStore<Blake3>,
{
    pub(crate) storage: Storage,
    pub(crate) replica_id: ReplicaId,
    pub(crate) signing_key: SigningKey,
    pub(crate) policy: MergePolicy,
}

#[derive(Debug)]
pub enum SetError<Storage>
where
    Storage: NoteStore<Blake3> + HeadStore<Blake3> + TargetStore<Blake3>,
{
    /// The target is not present in the surrounding object store.
    UnknownTarget(TargetId<Blake3>),
    /// The supplied parent is not the current head. Expected, recoverable:
    /// re-read the head and retry.
    StaleParent {
        expected: Option<EntryId<Blake3>>,
        current: Option<EntryId<Blake3>>,
    },
    /// The note payload belongs to a different namespace than the tree being
    /// written.
    NamespaceMismatch {
        note_namespace: String,
        namespace: String,
    },
    TargetCheck(Storage::ExistsError),
    StorageReader(Storage::ReaderError),
    StorageGet(<Storage::Reader as NoteStoreGet<Blake3>>::GetError),
    StoragePut(Storage::PutError),
    HeadRead(Storage::HeadError),
    HeadUpdate(Storage::UpdateError),
}

#[derive(Debug)]
pub enum ReadError<Storage>
where
    Storage: NoteStore<Blake3> + HeadStore<Blake3> + TargetStore<Blake3>,
{
    StorageReader(Storage::ReaderError),
    StorageGet(<Storage::Reader as NoteStoreGet<Blake3>>::GetError),
}

#[derive(Debug)]
pub enum ImportError<Storage>
where
    Storage: NoteStore<Blake3> + HeadStore<Blake3> + TargetStore<Blake3>,
{
    /// The comment batch was empty; no entry was created. A caller error,
    /// never retried automatically.
    EmptyImport,
    StoragePut(Storage::PutError),
    Set(SetError<Storage>),
}

impl<Storage> Replica<Storage>
where
    Storage: NoteStore<Blake3> + HeadStore<Blake3> + TargetStore<Blake3>,
{
    /// Creates a replica with a fresh random replica id and the default
    /// merge policy.
    pub fn new(storage: Storage, signing_key: SigningKey) -> Self {
        Self::with_replica_id(storage, signing_key, ReplicaId::random())
    }

    /// Same as [`new`](Replica::new) but with an explicit replica id, for
    /// callers that persist their identity across runs.
    pub fn with_replica_id(storage: Storage, signing_key: SigningKey, replica_id: ReplicaId) -> Self {
        Replica {
            storage,
            replica_id,
            signing_key,
            policy: MergePolicy::default(),
        }
    }

    pub fn replica_id(&self) -> ReplicaId {
        self.replica_id
    }

    /// Replaces the merge policy.
    pub fn set_policy(&mut self, policy: MergePolicy) {
        self.policy = policy;
    }

    /// Mutable access to the underlying storage backend.
    pub fn storage_mut(&mut self) -> &mut Storage {
        &mut self.storage
    }

    /// Consume the replica and return the underlying storage backend.
    pub fn into_storage(self) -> Storage {
        self.storage
    }

    /// Stores a note payload. Idempotent: an already-present payload keeps
    /// its id and the store does not grow.
    pub fn put_note(&mut self, note: &Note) -> Result<NoteId<Blake3>, Storage::PutError> {
        self.storage.put_note(note)
    }

    /// Reads a note payload back by id.
    pub fn note(&mut self, id: NoteId<Blake3>) -> Result<Note, ReadError<Storage>> {
        let reader = self.storage.reader().map_err(ReadError::StorageReader)?;
        reader.note(id).map_err(ReadError::StorageGet)
    }

    /// Reads an entry back by id.
    pub fn entry(&mut self, id: EntryId<Blake3>) -> Result<NoteEntry<Blake3>, ReadError<Storage>> {
        let reader = self.storage.reader().map_err(ReadError::StorageReader)?;
        reader.entry(id).map_err(ReadError::StorageGet)
    }

    /// Returns the current head entry for `(namespace, target)`, if any.
    pub fn head(
        &mut self,
        namespace: &str,
        target: TargetId<Blake3>,
    ) -> Result<Option<EntryId<Blake3>>, Storage::HeadError> {
        self.storage.head(namespace, target)
    }

    /// Creates a new head entry for `(namespace, target)`.
    ///
    /// `parent` is the caller's claim about the current head (`None` claims
    /// there is none yet) and is compare-and-swapped as such; a mismatch
    /// fails with [`SetError::StaleParent`] so a concurrent append is never
    /// silently discarded.
    ///
    /// # Errors
    /// * [`SetError::UnknownTarget`] if the target does not exist in the
    ///   object store.
    /// * [`SetError::StaleParent`] if `parent` is not the current head.
    pub fn set(
        &mut self,
        namespace: &str,
        target: TargetId<Blake3>,
        note: NoteId<Blake3>,
        parent: Option<EntryId<Blake3>>,
    ) -> Result<EntryId<Blake3>, SetError<Storage>> {
        if !self
            .storage
            .target_exists(target)
            .map_err(SetError::TargetCheck)?
        {
            return Err(SetError::UnknownTarget(target));
        }

        // Cheap early stale check; the authoritative one is the CAS below.
        let current = self
            .storage
            .head(namespace, target)
            .map_err(SetError::HeadRead)?;
        if current != parent {
            return Err(SetError::StaleParent {
                expected: parent,
                current,
            });
        }

        let reader = self.storage.reader().map_err(SetError::StorageReader)?;
        let stored = reader.note(note).map_err(SetError::StorageGet)?;
        if stored.namespace != namespace {
            return Err(SetError::NamespaceMismatch {
                note_namespace: stored.namespace,
                namespace: namespace.to_string(),
            });
        }

        let (parents, clock) = match parent {
            Some(p) => {
                let parent_entry = reader.entry(p).map_err(SetError::StorageGet)?;
                (Parents::One(p), parent_entry.clock + 1)
            }
            None => (Parents::None, 0),
        };

        let entry = NoteEntry::signed(
            &self.signing_key,
            target,
            namespace,
            note,
            parents,
            self.replica_id,
            clock,
        );
        let id = self
            .storage
            .put_entry(&entry)
            .map_err(SetError::StoragePut)?;

        match self
            .storage
            .update(namespace, target, parent, id)
            .map_err(SetError::HeadUpdate)?
        {
            UpdateResult::Success() => Ok(id),
            UpdateResult::Conflict(current) => Err(SetError::StaleParent {
                expected: parent,
                current,
            }),
        }
    }

    /// Appends a note on top of the current head.
    ///
    /// Equivalent to `set(namespace, target, note, current_head)`. Can still
    /// fail with [`SetError::StaleParent`] if another writer lands between
    /// the head read and the update; retry in that case.
    pub fn append(
        &mut self,
        namespace: &str,
        target: TargetId<Blake3>,
        note: NoteId<Blake3>,
    ) -> Result<EntryId<Blake3>, SetError<Storage>> {
        let head = self
            .storage
            .head(namespace, target)
            .map_err(SetError::HeadRead)?;
        self.set(namespace, target, note, head)
    }

    /// Returns a lazy newest-first walk over the history of
    /// `(namespace, target)`.
    ///
    /// The iterator is finite, deduplicated across merge parents and
    /// restartable: cloning it restarts the walk from its current snapshot.
    pub fn history(
        &mut self,
        namespace: &str,
        target: TargetId<Blake3>,
    ) -> Result<History<Blake3, Storage::Reader>, HistoryError<Storage>> {
        let head = self
            .storage
            .head(namespace, target)
            .map_err(HistoryError::HeadRead)?;
        let reader = self
            .storage
            .reader()
            .map_err(HistoryError::StorageReader)?;
        History::new(reader, head).map_err(HistoryError::StorageGet)
    }

    /// Imports a batch of review comments as one aggregated note appended to
    /// `(namespace, target)`.
    ///
    /// The comments must arrive oldest-first from the platform client; they
    /// are not re-sorted here.
    pub fn import(
        &mut self,
        namespace: &str,
        target: TargetId<Blake3>,
        comments: &[ReviewComment],
    ) -> Result<EntryId<Blake3>, ImportError<Storage>> {
        if comments.is_empty() {
            return Err(ImportError::EmptyImport);
        }
        let note = import::aggregate(namespace, comments);
        let note_id = self
            .storage
            .put_note(&note)
            .map_err(ImportError::StoragePut)?;
        self.append(namespace, target, note_id)
            .map_err(ImportError::Set)
    }
}

#[derive(Debug)]
pub enum HistoryError<Storage>
where
    Storage: NoteStore<Blake3> + HeadStore<Blake3> + TargetStore<Blake3>,
{
    HeadRead(Storage::HeadError),
    StorageReader(Storage::ReaderError),
    StorageGet(<Storage::Reader as NoteStoreGet<Blake3>>::GetError),
}

struct Frontier<H>
where
    H: HashProtocol,
{
    clock: u64,
    id: EntryId<H>,
    entry: NoteEntry<H>,
}

impl<H: HashProtocol> Clone for Frontier<H> {
    fn clone(&self) -> Self {
        Frontier {
            clock: self.clock,
            id: self.id,
            entry: self.entry.clone(),
        }
    }
}

impl<H: HashProtocol> PartialEq for Frontier<H> {
    fn eq(&self, other: &Self) -> bool {
        self.clock == other.clock && self.id == other.id
    }
}

impl<H: HashProtocol> Eq for Frontier<H> {}

impl<H: HashProtocol> PartialOrd for Frontier<H> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<H: HashProtocol> Ord for Frontier<H> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Max-heap order: higher clocks first, entry id as a deterministic
        // tie-break.
        (self.clock, self.id).cmp(&(other.clock, other.id))
    }
}

/// Lazy newest-first walk over an append chain.
///
/// Entries are yielded in descending logical clock order with the entry id
/// breaking ties, so chains containing merge entries still read newest-first
/// and deterministically.
pub struct History<H, G>
where
    H: HashProtocol,
    G: NoteStoreGet<H>,
{
    reader: G,
    frontier: BinaryHeap<Frontier<H>>,
    visited: HashSet<EntryId<H>>,
}

impl<H, G> Clone for History<H, G>
where
    H: HashProtocol,
    G: NoteStoreGet<H> + Clone,
{
    fn clone(&self) -> Self {
        History {
            reader: self.reader.clone(),
            frontier: self.frontier.clone(),
            visited: self.visited.clone(),
        }
    }
}

impl<H, G> fmt::Debug for History<H, G>
where
    H: HashProtocol,
    G: NoteStoreGet<H>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "History")
    }
}

impl<H, G> History<H, G>
where
    H: HashProtocol,
    G: NoteStoreGet<H>,
{
    /// Starts a walk from `head`; an empty head yields an empty history.
    pub fn new(reader: G, head: Option<EntryId<H>>) -> Result<Self, G::GetError> {
        let mut frontier = BinaryHeap::new();
        if let Some(id) = head {
            let entry = reader.entry(id)?;
            frontier.push(Frontier {
                clock: entry.clock,
                id,
                entry,
            });
        }
        Ok(History {
            reader,
            frontier,
            visited: HashSet::new(),
        })
    }
}

impl<H, G> Iterator for History<H, G>
where
    H: HashProtocol,
    G: NoteStoreGet<H>,
{
    type Item = Result<(EntryId<H>, NoteEntry<H>), G::GetError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let top = self.frontier.pop()?;
            if !self.visited.insert(top.id) {
                continue;
            }
            for parent in top.entry.parents.iter() {
                if !self.visited.contains(&parent) {
                    match self.reader.entry(parent) {
                        Ok(entry) => self.frontier.push(Frontier {
                            clock: entry.clock,
                            id: parent,
                            entry,
                        }),
                        Err(e) => return Some(Err(e)),
                    }
                }
            }
            return Some(Ok((top.id, top.entry)));
        }
    }
}
