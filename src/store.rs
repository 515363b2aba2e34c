//! Storage traits for note payloads, entries and per-namespace head maps.
//!
//! The design separates storage concerns from the data model and reduces the
//! mutable state of a replica to an absolute minimum. Note and entry blobs
//! are content-addressed and immutable, so the blob side of a store has no
//! notion of time, order or history and can be backed by almost anything. The
//! only mutable state is the head map: one `(namespace, target) -> entry`
//! pointer per annotated target, updated exclusively through a
//! compare-and-swap. This optimistic concurrency control keeps heads
//! consistent without locking and can be emulated by many storage systems
//! (for example by using conditional writes on S3).
//!
//! Two backends ship with the crate: [`memory::MemoryStore`] for local state
//! and tests, and [`objectstore::ObjectStoreRemote`] for remote replicas
//! reachable through any `object_store` URL.

pub mod memory;
pub mod objectstore;

use std::collections::HashSet;
use std::error::Error;
use std::fmt;
use std::fmt::Debug;

use crate::id::EntryId;
use crate::id::HashProtocol;
use crate::id::NoteId;
use crate::id::TargetId;
use crate::note::Note;
use crate::note::NoteEntry;

/// The `NoteStorePut` trait is used to store note and entry blobs.
///
/// Both operations are idempotent: storing an already-present object is a
/// no-op that returns the existing id. There is no deletion surface; garbage
/// collection of unreferenced payloads is a housekeeping concern outside this
/// crate.
pub trait NoteStorePut<H: HashProtocol> {
    type PutError: Error + Debug + Send + Sync + 'static;

    fn put_note(&mut self, note: &Note) -> Result<NoteId<H>, Self::PutError>;

    fn put_entry(&mut self, entry: &NoteEntry<H>) -> Result<EntryId<H>, Self::PutError>;
}

/// The `NoteStoreGet` trait is used to retrieve stored blobs.
///
/// Lookups of absent objects fail with the implementation's not-found error;
/// use [`NoteStoreGet::contains_entry`] to probe without treating absence as
/// a failure.
pub trait NoteStoreGet<H: HashProtocol> {
    type GetError: Error + Debug + Send + Sync + 'static;

    fn note(&self, id: NoteId<H>) -> Result<Note, Self::GetError>;

    fn entry(&self, id: EntryId<H>) -> Result<NoteEntry<H>, Self::GetError>;

    fn contains_entry(&self, id: EntryId<H>) -> Result<bool, Self::GetError>;
}

/// A writable blob store that can hand out consistent read snapshots.
///
/// The reader is a snapshot: blobs stored after [`NoteStore::reader`] was
/// called may not be visible through it. Since blobs are immutable and
/// content-addressed, a stale reader is never wrong, merely incomplete.
pub trait NoteStore<H: HashProtocol>: NoteStorePut<H> {
    type Reader: NoteStoreGet<H> + Clone + Send + Debug + 'static;
    type ReaderError: Error + Debug + Send + Sync + 'static;

    fn reader(&mut self) -> Result<Self::Reader, Self::ReaderError>;
}

/// Outcome of a compare-and-swap head update.
pub enum UpdateResult<H>
where
    H: HashProtocol,
{
    Success(),
    /// The head's current value did not match `old`. Carries the observed
    /// value for conflict resolution.
    Conflict(Option<EntryId<H>>),
}

impl<H> fmt::Debug for UpdateResult<H>
where
    H: HashProtocol,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateResult::Success() => write!(f, "Success"),
            UpdateResult::Conflict(current) => f.debug_tuple("Conflict").field(current).finish(),
        }
    }
}

/// Per-namespace head maps: the only mutable state of a replica.
pub trait HeadStore<H: HashProtocol> {
    type TargetsError: Error + Debug + Send + Sync + 'static;
    type HeadError: Error + Debug + Send + Sync + 'static;
    type UpdateError: Error + Debug + Send + Sync + 'static;

    type TargetsIter<'a>: Iterator<Item = Result<TargetId<H>, Self::TargetsError>>
    where
        Self: 'a;

    /// Lists every target that has a head in `namespace`.
    fn targets<'a>(
        &'a mut self,
        namespace: &str,
    ) -> Result<Self::TargetsIter<'a>, Self::TargetsError>;

    /// Retrieves the current head entry for `(namespace, target)`, if any.
    fn head(
        &mut self,
        namespace: &str,
        target: TargetId<H>,
    ) -> Result<Option<EntryId<H>>, Self::HeadError>;

    /// Atomically replaces the head for `(namespace, target)`.
    ///
    /// # Parameters
    /// * `old` - Expected current head (`None` if creating the first head).
    /// * `new` - Entry to update the head to.
    ///
    /// Succeeds only when the stored head equals `old`; otherwise returns
    /// [`UpdateResult::Conflict`] with the observed head and changes nothing.
    fn update(
        &mut self,
        namespace: &str,
        target: TargetId<H>,
        old: Option<EntryId<H>>,
        new: EntryId<H>,
    ) -> Result<UpdateResult<H>, Self::UpdateError>;
}

/// Existence checks against the external object store that owns the target
/// objects themselves.
///
/// Targets are never created through this crate; referential integrity is
/// checked against this trait when entries are written or merged.
pub trait TargetStore<H: HashProtocol> {
    type ExistsError: Error + Debug + Send + Sync + 'static;

    fn target_exists(&mut self, target: TargetId<H>) -> Result<bool, Self::ExistsError>;
}

#[derive(Debug)]
pub enum TransferError<LoadErr, ProbeErr, StoreErr> {
    Load(LoadErr),
    Probe(ProbeErr),
    Store(StoreErr),
}

impl<LoadErr, ProbeErr, StoreErr> fmt::Display for TransferError<LoadErr, ProbeErr, StoreErr> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to transfer entry chain")
    }
}

impl<LoadErr, ProbeErr, StoreErr> Error for TransferError<LoadErr, ProbeErr, StoreErr>
where
    LoadErr: Debug + Error + 'static,
    ProbeErr: Debug + Error + 'static,
    StoreErr: Debug + Error + 'static,
{
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Load(e) => Some(e),
            Self::Probe(e) => Some(e),
            Self::Store(e) => Some(e),
        }
    }
}

/// Copies the entry chain reachable from `head` out of `source` into `dest`,
/// along with the notes the entries reference.
///
/// The walk stops descending as soon as `probe` (a reader over `dest`)
/// already contains an entry, so repeated synchronization only moves what
/// changed since the destination last saw this chain. Returns the number of
/// entries copied.
pub fn transfer_chain<H, SR, DR, D>(
    source: &SR,
    dest: &mut D,
    probe: &DR,
    head: EntryId<H>,
) -> Result<usize, TransferError<SR::GetError, DR::GetError, D::PutError>>
where
    H: HashProtocol,
    SR: NoteStoreGet<H>,
    DR: NoteStoreGet<H>,
    D: NoteStorePut<H>,
{
    let mut visited = HashSet::new();
    let mut stack = vec![head];
    let mut moved = 0;

    while let Some(id) = stack.pop() {
        if !visited.insert(id) {
            continue;
        }
        if probe.contains_entry(id).map_err(TransferError::Probe)? {
            continue;
        }

        let entry = source.entry(id).map_err(TransferError::Load)?;
        let note = source.note(entry.note).map_err(TransferError::Load)?;
        dest.put_note(&note).map_err(TransferError::Store)?;

        for parent in entry.parents.iter() {
            stack.push(parent);
        }
        dest.put_entry(&entry).map_err(TransferError::Store)?;
        moved += 1;
    }

    Ok(moved)
}
