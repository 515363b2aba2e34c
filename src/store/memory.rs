//! In-memory storage backend.
//!
//! Blobs live in a snapshot map so readers observe a consistent view while
//! writes continue; heads and registered targets live behind the mutable
//! store handle, which gives the per-key compare-and-swap its required
//! single-writer discipline.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::HashSet;
use std::convert::Infallible;
use std::error::Error;
use std::fmt;
use std::fmt::Debug;
use std::marker::PhantomData;

use bytes::Bytes;
use reft_light::{Apply, ReadHandle, WriteHandle};

use crate::id::EntryId;
use crate::id::HashProtocol;
use crate::id::NoteId;
use crate::id::RawHash;
use crate::id::TargetId;
use crate::note::DecodeError;
use crate::note::Note;
use crate::note::NoteEntry;
use crate::store::HeadStore;
use crate::store::NoteStore;
use crate::store::NoteStoreGet;
use crate::store::NoteStorePut;
use crate::store::TargetStore;
use crate::store::UpdateResult;

enum MemoryStoreOps {
    Insert(RawHash, Bytes),
}

type MemoryBlobMap = BTreeMap<RawHash, Bytes>;

impl Apply<MemoryBlobMap, ()> for MemoryStoreOps {
    fn apply_first(
        &mut self,
        first: &mut MemoryBlobMap,
        _second: &MemoryBlobMap,
        _auxiliary: &mut (),
    ) {
        match self {
            // Blobs are content-addressed, so insertion is idempotent and an
            // existing blob is left untouched.
            MemoryStoreOps::Insert(hash, bytes) => {
                first.entry(*hash).or_insert_with(|| bytes.clone());
            }
        }
    }
}

/// An in-memory replica store.
///
/// Backs local replicas and doubles as a lightweight remote in tests.
pub struct MemoryStore<H: HashProtocol> {
    blobs: WriteHandle<MemoryStoreOps, MemoryBlobMap, ()>,
    heads: HashMap<(String, TargetId<H>), EntryId<H>>,
    targets: HashSet<TargetId<H>>,
}

impl<H: HashProtocol> Debug for MemoryStore<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MemoryStore")
    }
}

impl<H: HashProtocol> MemoryStore<H> {
    pub fn new() -> MemoryStore<H> {
        MemoryStore {
            blobs: reft_light::new::<MemoryStoreOps, MemoryBlobMap, ()>(MemoryBlobMap::new(), ()),
            heads: HashMap::new(),
            targets: HashSet::new(),
        }
    }

    /// Marks a target object as present in the surrounding object store.
    ///
    /// Stands in for the external store that owns the targets themselves;
    /// entries can only attach to registered targets.
    pub fn register_target(&mut self, target: TargetId<H>) {
        self.targets.insert(target);
    }
}

impl<H: HashProtocol> Default for MemoryStore<H> {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot reader over a [`MemoryStore`]'s blobs.
pub struct MemoryStoreReader<H: HashProtocol> {
    read_handle: ReadHandle<MemoryBlobMap>,
    _hasher: PhantomData<fn(H) -> ()>,
}

impl<H: HashProtocol> Clone for MemoryStoreReader<H> {
    fn clone(&self) -> Self {
        MemoryStoreReader {
            read_handle: self.read_handle.clone(),
            _hasher: PhantomData,
        }
    }
}

impl<H: HashProtocol> Debug for MemoryStoreReader<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MemoryStoreReader")
    }
}

impl<H: HashProtocol> MemoryStoreReader<H> {
    fn new(read_handle: ReadHandle<MemoryBlobMap>) -> Self {
        MemoryStoreReader {
            read_handle,
            _hasher: PhantomData,
        }
    }

    /// Number of blobs visible through this snapshot.
    pub fn len(&self) -> usize {
        self.read_handle
            .enter()
            .map(|blobs| blobs.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn raw(&self, hash: &RawHash) -> Option<Bytes> {
        self.read_handle.enter()?.get(hash).cloned()
    }
}

#[derive(Debug)]
pub enum MemoryStoreGetError {
    /// The requested blob does not exist in the store.
    NotFound(),
    /// The blob exists but its bytes do not decode as the requested type.
    Decode(DecodeError),
}

impl fmt::Display for MemoryStoreGetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryStoreGetError::NotFound() => write!(f, "blob not found in memory store"),
            MemoryStoreGetError::Decode(e) => write!(f, "blob decoding failed: {e}"),
        }
    }
}

impl Error for MemoryStoreGetError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            MemoryStoreGetError::NotFound() => None,
            MemoryStoreGetError::Decode(e) => Some(e),
        }
    }
}

impl<H: HashProtocol> NoteStoreGet<H> for MemoryStoreReader<H> {
    type GetError = MemoryStoreGetError;

    fn note(&self, id: NoteId<H>) -> Result<Note, Self::GetError> {
        let bytes = self.raw(&id.raw).ok_or(MemoryStoreGetError::NotFound())?;
        Note::decode(&bytes).map_err(MemoryStoreGetError::Decode)
    }

    fn entry(&self, id: EntryId<H>) -> Result<NoteEntry<H>, Self::GetError> {
        let bytes = self.raw(&id.raw).ok_or(MemoryStoreGetError::NotFound())?;
        NoteEntry::decode(&bytes).map_err(MemoryStoreGetError::Decode)
    }

    fn contains_entry(&self, id: EntryId<H>) -> Result<bool, Self::GetError> {
        Ok(self.raw(&id.raw).is_some())
    }
}

impl<H: HashProtocol> NoteStorePut<H> for MemoryStore<H> {
    type PutError = Infallible;

    fn put_note(&mut self, note: &Note) -> Result<NoteId<H>, Self::PutError> {
        let bytes = note.encode();
        let id: NoteId<H> = note.id();
        self.blobs
            .append(MemoryStoreOps::Insert(id.raw, Bytes::from(bytes)));
        Ok(id)
    }

    fn put_entry(&mut self, entry: &NoteEntry<H>) -> Result<EntryId<H>, Self::PutError> {
        let bytes = entry.encode();
        let id = entry.id();
        self.blobs
            .append(MemoryStoreOps::Insert(id.raw, Bytes::from(bytes)));
        Ok(id)
    }
}

impl<H: HashProtocol> NoteStore<H> for MemoryStore<H> {
    type Reader = MemoryStoreReader<H>;
    type ReaderError = Infallible;

    fn reader(&mut self) -> Result<Self::Reader, Self::ReaderError> {
        Ok(MemoryStoreReader::new(self.blobs.publish().clone()))
    }
}

impl<H: HashProtocol> HeadStore<H> for MemoryStore<H> {
    type TargetsError = Infallible;
    type HeadError = Infallible;
    type UpdateError = Infallible;

    type TargetsIter<'a> = std::vec::IntoIter<Result<TargetId<H>, Infallible>>;

    fn targets<'a>(
        &'a mut self,
        namespace: &str,
    ) -> Result<Self::TargetsIter<'a>, Self::TargetsError> {
        Ok(self
            .heads
            .keys()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, target)| Ok(*target))
            .collect::<Vec<_>>()
            .into_iter())
    }

    fn head(
        &mut self,
        namespace: &str,
        target: TargetId<H>,
    ) -> Result<Option<EntryId<H>>, Self::HeadError> {
        Ok(self.heads.get(&(namespace.to_string(), target)).copied())
    }

    fn update(
        &mut self,
        namespace: &str,
        target: TargetId<H>,
        old: Option<EntryId<H>>,
        new: EntryId<H>,
    ) -> Result<UpdateResult<H>, Self::UpdateError> {
        let key = (namespace.to_string(), target);
        let current = self.heads.get(&key);
        if current != old.as_ref() {
            return Ok(UpdateResult::Conflict(current.copied()));
        }
        self.heads.insert(key, new);
        Ok(UpdateResult::Success())
    }
}

impl<H: HashProtocol> TargetStore<H> for MemoryStore<H> {
    type ExistsError = Infallible;

    fn target_exists(&mut self, target: TargetId<H>) -> Result<bool, Self::ExistsError> {
        Ok(self.targets.contains(&target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::Blake3;
    use crate::id::ContentHash;

    #[test]
    fn put_is_idempotent_and_deduplicates() {
        let mut store: MemoryStore<Blake3> = MemoryStore::new();
        let note = Note::new("discussion", "drew", 7, &b"hello"[..]);

        let first = store.put_note(&note).unwrap();
        let second = store.put_note(&note).unwrap();
        assert_eq!(first, second);
        assert_eq!(store.reader().unwrap().len(), 1);
    }

    #[test]
    fn get_absent_blob_fails() {
        let mut store: MemoryStore<Blake3> = MemoryStore::new();
        let reader = store.reader().unwrap();
        let id: NoteId<Blake3> = ContentHash::digest(b"never stored");
        assert!(matches!(
            reader.note(id),
            Err(MemoryStoreGetError::NotFound())
        ));
    }
}
