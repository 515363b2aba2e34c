//! Remote replica backed by an [`object_store`] compatible service.
//!
//! All data is stored in an external service (e.g. S3, a local directory or
//! an in-memory store) via the `object_store` crate. Blobs are written with
//! create-if-absent semantics; heads are compare-and-swapped with conditional
//! writes keyed on the stored object's version, which is what makes the
//! non-fast-forward push refusal reliable without any server-side logic.
//!
//! Credentials and transient-failure retries are `object_store`'s concern
//! and are configured through the URL and the backend's own options.

use std::array::TryFromSliceError;
use std::convert::TryInto;
use std::error::Error;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use futures::StreamExt;
use hex::FromHex;
use hex::FromHexError;
use object_store::UpdateVersion;
use object_store::{self, parse_url, path::Path, ObjectStore, PutMode};
use tokio::runtime::Runtime;
use url::Url;

use crate::id::ContentHash;
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

const HEAD_INFIX: &str = "heads";
const BLOB_INFIX: &str = "blobs";
const OBJECT_INFIX: &str = "objects";

/// A remote replica reachable through an [`object_store`] URL.
pub struct ObjectStoreRemote<H> {
    store: Arc<dyn ObjectStore>,
    prefix: Path,
    // Bridges the async object_store API into the synchronous store traits.
    runtime: Arc<Runtime>,
    _hasher: PhantomData<fn(H) -> ()>,
}

impl<H> fmt::Debug for ObjectStoreRemote<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectStoreRemote")
            .field("prefix", &self.prefix)
            .finish()
    }
}

#[derive(Debug)]
pub enum OpenError {
    Store(object_store::Error),
    Runtime(std::io::Error),
}

impl fmt::Display for OpenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpenError::Store(e) => write!(f, "failed to open object store: {e}"),
            OpenError::Runtime(e) => write!(f, "failed to start bridge runtime: {e}"),
        }
    }
}

impl Error for OpenError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            OpenError::Store(e) => Some(e),
            OpenError::Runtime(e) => Some(e),
        }
    }
}

impl<H> ObjectStoreRemote<H> {
    /// Creates a remote pointing at the object store described by `url`.
    pub fn with_url(url: &Url) -> Result<ObjectStoreRemote<H>, OpenError> {
        let (store, path) = parse_url(url).map_err(OpenError::Store)?;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(OpenError::Runtime)?;
        Ok(ObjectStoreRemote {
            store: Arc::from(store),
            prefix: path,
            runtime: Arc::new(runtime),
            _hasher: PhantomData,
        })
    }

    fn blob_path(&self, raw: &RawHash) -> Path {
        self.prefix.child(BLOB_INFIX).child(hex::encode(raw))
    }

    fn head_path(&self, namespace: &str, target: &TargetId<H>) -> Path {
        self.prefix
            .child(HEAD_INFIX)
            .child(namespace)
            .child(hex::encode(target.raw))
    }

    fn put_blob(&mut self, raw: &RawHash, bytes: Vec<u8>) -> Result<(), object_store::Error> {
        let path = self.blob_path(raw);
        let bytes = bytes::Bytes::from(bytes);
        let result = self
            .runtime
            .block_on(self.store.put_opts(&path, bytes.into(), PutMode::Create.into()));
        match result {
            Ok(_) | Err(object_store::Error::AlreadyExists { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Snapshot-free reader over a remote's blobs; every call is a round trip.
pub struct ObjectStoreReader<H> {
    store: Arc<dyn ObjectStore>,
    prefix: Path,
    runtime: Arc<Runtime>,
    _hasher: PhantomData<fn(H) -> ()>,
}

impl<H> Clone for ObjectStoreReader<H> {
    fn clone(&self) -> Self {
        ObjectStoreReader {
            store: self.store.clone(),
            prefix: self.prefix.clone(),
            runtime: self.runtime.clone(),
            _hasher: PhantomData,
        }
    }
}

impl<H> fmt::Debug for ObjectStoreReader<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectStoreReader")
            .field("prefix", &self.prefix)
            .finish()
    }
}

#[derive(Debug)]
pub enum ObjectStoreGetError {
    /// The requested blob does not exist on the remote.
    NotFound(),
    /// The blob exists but its bytes do not decode as the requested type.
    Decode(DecodeError),
    Store(object_store::Error),
}

impl fmt::Display for ObjectStoreGetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectStoreGetError::NotFound() => write!(f, "blob not found on remote"),
            ObjectStoreGetError::Decode(e) => write!(f, "blob decoding failed: {e}"),
            ObjectStoreGetError::Store(e) => write!(f, "object store error: {e}"),
        }
    }
}

impl Error for ObjectStoreGetError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ObjectStoreGetError::NotFound() => None,
            ObjectStoreGetError::Decode(e) => Some(e),
            ObjectStoreGetError::Store(e) => Some(e),
        }
    }
}

impl<H> ObjectStoreReader<H> {
    fn raw(&self, raw_hash: &RawHash) -> Result<bytes::Bytes, ObjectStoreGetError> {
        let path = self.prefix.child(BLOB_INFIX).child(hex::encode(raw_hash));
        let result = self.runtime.block_on(async {
            let object = self.store.get(&path).await?;
            object.bytes().await
        });
        match result {
            Ok(bytes) => Ok(bytes),
            Err(object_store::Error::NotFound { .. }) => Err(ObjectStoreGetError::NotFound()),
            Err(e) => Err(ObjectStoreGetError::Store(e)),
        }
    }
}

impl<H> NoteStoreGet<H> for ObjectStoreReader<H>
where
    H: HashProtocol,
{
    type GetError = ObjectStoreGetError;

    fn note(&self, id: NoteId<H>) -> Result<Note, Self::GetError> {
        let bytes = self.raw(&id.raw)?;
        Note::decode(&bytes).map_err(ObjectStoreGetError::Decode)
    }

    fn entry(&self, id: EntryId<H>) -> Result<NoteEntry<H>, Self::GetError> {
        let bytes = self.raw(&id.raw)?;
        NoteEntry::decode(&bytes).map_err(ObjectStoreGetError::Decode)
    }

    fn contains_entry(&self, id: EntryId<H>) -> Result<bool, Self::GetError> {
        let path = self.prefix.child(BLOB_INFIX).child(hex::encode(id.raw));
        match self.runtime.block_on(self.store.head(&path)) {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(ObjectStoreGetError::Store(e)),
        }
    }
}

impl<H> NoteStorePut<H> for ObjectStoreRemote<H>
where
    H: HashProtocol,
{
    type PutError = object_store::Error;

    fn put_note(&mut self, note: &Note) -> Result<NoteId<H>, Self::PutError> {
        let id: NoteId<H> = note.id();
        self.put_blob(&id.raw, note.encode())?;
        Ok(id)
    }

    fn put_entry(&mut self, entry: &NoteEntry<H>) -> Result<EntryId<H>, Self::PutError> {
        let id = entry.id();
        self.put_blob(&id.raw, entry.encode())?;
        Ok(id)
    }
}

impl<H> NoteStore<H> for ObjectStoreRemote<H>
where
    H: HashProtocol,
{
    type Reader = ObjectStoreReader<H>;
    type ReaderError = std::convert::Infallible;

    fn reader(&mut self) -> Result<Self::Reader, Self::ReaderError> {
        Ok(ObjectStoreReader {
            store: self.store.clone(),
            prefix: self.prefix.clone(),
            runtime: self.runtime.clone(),
            _hasher: PhantomData,
        })
    }
}

#[derive(Debug)]
pub enum ListTargetsError {
    List(object_store::Error),
    NotAFile(&'static str),
    BadNameHex(FromHexError),
}

impl fmt::Display for ListTargetsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListTargetsError::List(e) => write!(f, "failed to list heads: {e}"),
            ListTargetsError::NotAFile(what) => write!(f, "unexpected head object: {what}"),
            ListTargetsError::BadNameHex(e) => write!(f, "head object has a bad name: {e}"),
        }
    }
}

impl Error for ListTargetsError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ListTargetsError::List(e) => Some(e),
            ListTargetsError::NotAFile(_) => None,
            ListTargetsError::BadNameHex(e) => Some(e),
        }
    }
}

#[derive(Debug)]
pub enum PullHeadError {
    Store(object_store::Error),
    BadStoredHead(TryFromSliceError),
}

impl From<object_store::Error> for PullHeadError {
    fn from(e: object_store::Error) -> Self {
        PullHeadError::Store(e)
    }
}

impl From<TryFromSliceError> for PullHeadError {
    fn from(e: TryFromSliceError) -> Self {
        PullHeadError::BadStoredHead(e)
    }
}

impl fmt::Display for PullHeadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PullHeadError::Store(e) => write!(f, "failed to read head: {e}"),
            PullHeadError::BadStoredHead(e) => write!(f, "stored head is malformed: {e}"),
        }
    }
}

impl Error for PullHeadError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            PullHeadError::Store(e) => Some(e),
            PullHeadError::BadStoredHead(e) => Some(e),
        }
    }
}

#[derive(Debug)]
pub enum PushHeadError {
    Store(object_store::Error),
    BadStoredHead(TryFromSliceError),
}

impl From<object_store::Error> for PushHeadError {
    fn from(e: object_store::Error) -> Self {
        PushHeadError::Store(e)
    }
}

impl From<TryFromSliceError> for PushHeadError {
    fn from(e: TryFromSliceError) -> Self {
        PushHeadError::BadStoredHead(e)
    }
}

impl fmt::Display for PushHeadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PushHeadError::Store(e) => write!(f, "failed to update head: {e}"),
            PushHeadError::BadStoredHead(e) => write!(f, "stored head is malformed: {e}"),
        }
    }
}

impl Error for PushHeadError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            PushHeadError::Store(e) => Some(e),
            PushHeadError::BadStoredHead(e) => Some(e),
        }
    }
}

impl<H> HeadStore<H> for ObjectStoreRemote<H>
where
    H: HashProtocol,
{
    type TargetsError = ListTargetsError;
    type HeadError = PullHeadError;
    type UpdateError = PushHeadError;

    type TargetsIter<'a> = std::vec::IntoIter<Result<TargetId<H>, ListTargetsError>>;

    fn targets<'a>(
        &'a mut self,
        namespace: &str,
    ) -> Result<Self::TargetsIter<'a>, Self::TargetsError> {
        let prefix = self.prefix.child(HEAD_INFIX).child(namespace);
        let metas = self
            .runtime
            .block_on(self.store.list(Some(&prefix)).collect::<Vec<_>>());
        let listed = metas
            .into_iter()
            .map(|r| match r {
                Ok(meta) => {
                    let name = meta
                        .location
                        .filename()
                        .ok_or(ListTargetsError::NotAFile("no filename"))?;
                    let raw = RawHash::from_hex(name).map_err(ListTargetsError::BadNameHex)?;
                    Ok(ContentHash::new(raw))
                }
                Err(e) => Err(ListTargetsError::List(e)),
            })
            .collect::<Vec<_>>();
        Ok(listed.into_iter())
    }

    fn head(
        &mut self,
        namespace: &str,
        target: TargetId<H>,
    ) -> Result<Option<EntryId<H>>, Self::HeadError> {
        let path = self.head_path(namespace, &target);
        let result = self.runtime.block_on(async {
            match self.store.get(&path).await {
                Ok(object) => Ok(Some(object.bytes().await?)),
                Err(object_store::Error::NotFound { .. }) => Ok(None),
                Err(e) => Err(e),
            }
        });
        match result? {
            Some(bytes) => {
                let raw: RawHash = (&bytes[..]).try_into()?;
                Ok(Some(ContentHash::new(raw)))
            }
            None => Ok(None),
        }
    }

    fn update(
        &mut self,
        namespace: &str,
        target: TargetId<H>,
        old: Option<EntryId<H>>,
        new: EntryId<H>,
    ) -> Result<UpdateResult<H>, Self::UpdateError> {
        let path = self.head_path(namespace, &target);
        let new_bytes = bytes::Bytes::copy_from_slice(&new.raw);
        if let Some(old_id) = old {
            let mut result = self.runtime.block_on(self.store.get(&path));
            loop {
                match result {
                    Ok(object) => {
                        let version = UpdateVersion {
                            e_tag: object.meta.e_tag.clone(),
                            version: object.meta.version.clone(),
                        };
                        let stored_bytes = self.runtime.block_on(object.bytes())?;
                        let stored: RawHash = (&stored_bytes[..]).try_into()?;
                        let stored_id = ContentHash::new(stored);
                        if old_id != stored_id {
                            return Ok(UpdateResult::Conflict(Some(stored_id)));
                        }
                        match self.runtime.block_on(self.store.put_opts(
                            &path,
                            new_bytes.clone().into(),
                            PutMode::Update(version).into(),
                        )) {
                            Ok(_) => return Ok(UpdateResult::Success()),
                            Err(object_store::Error::Precondition { .. }) => {
                                result = self.runtime.block_on(self.store.get(&path));
                                continue;
                            }
                            Err(e) => return Err(PushHeadError::Store(e)),
                        }
                    }
                    Err(object_store::Error::NotFound { .. }) => {
                        return Ok(UpdateResult::Conflict(None));
                    }
                    Err(e) => return Err(PushHeadError::Store(e)),
                }
            }
        } else {
            loop {
                match self.runtime.block_on(self.store.put_opts(
                    &path,
                    new_bytes.clone().into(),
                    PutMode::Create.into(),
                )) {
                    Ok(_) => return Ok(UpdateResult::Success()),
                    Err(object_store::Error::AlreadyExists { .. }) => {
                        match self.runtime.block_on(self.store.get(&path)) {
                            Ok(object) => {
                                let bytes = self.runtime.block_on(object.bytes())?;
                                let raw: RawHash = (&bytes[..]).try_into()?;
                                return Ok(UpdateResult::Conflict(Some(ContentHash::new(raw))));
                            }
                            Err(object_store::Error::NotFound { .. }) => continue,
                            Err(e) => return Err(PushHeadError::Store(e)),
                        }
                    }
                    Err(e) => return Err(PushHeadError::Store(e)),
                }
            }
        }
    }
}

impl<H> TargetStore<H> for ObjectStoreRemote<H>
where
    H: HashProtocol,
{
    type ExistsError = object_store::Error;

    fn target_exists(&mut self, target: TargetId<H>) -> Result<bool, Self::ExistsError> {
        let path = self
            .prefix
            .child(OBJECT_INFIX)
            .child(hex::encode(target.raw));
        match self.runtime.block_on(self.store.head(&path)) {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }
}
