//! Identifier types for the annotation store.
//!
//! Everything addressable in the store is named by a 256 bit digest of its
//! canonical byte encoding: target objects, note payloads and note entries.
//! The digest function is pluggable via [`HashProtocol`] so that replicas can
//! agree on an identifier scheme out of band; [`Blake3`] is the default and
//! [`Blake2b`] is provided as an alternative.
//!
//! Replicas themselves are named by a random 128 bit [`ReplicaId`]. Replica
//! ids are not content-addressed: they exist to break ties deterministically
//! when two replicas annotate the same target concurrently.

use std::fmt;
use std::hash::Hash;
use std::marker::PhantomData;

use digest::typenum::U32;
use digest::Digest;
use hex::FromHex;
use hex::FromHexError;
use rand::RngCore;

/// The length of a content digest in bytes.
pub const HASH_LEN: usize = 32;

/// Raw bytes of a content digest.
pub type RawHash = [u8; HASH_LEN];

/// The length of a replica id in bytes.
pub const REPLICA_ID_LEN: usize = 16;

/// A trait for hash functions usable as the store's identifier scheme.
///
/// Implemented by any [`Digest`] with a 256 bit output. The `NAME` is used as
/// the protocol prefix when digests are rendered as strings, so two replicas
/// can detect a protocol mismatch early.
pub trait HashProtocol: Digest<OutputSize = U32> + Clone + Send + 'static {
    const NAME: &'static str;
}

use blake2::Blake2b as Blake2bUnsized;
pub type Blake2b = Blake2bUnsized<U32>;

pub use blake3::Hasher as Blake3;

impl HashProtocol for Blake2b {
    const NAME: &'static str = "blake2";
}

impl HashProtocol for Blake3 {
    const NAME: &'static str = "blake3";
}

/// Marker for digests that address target objects (e.g. commits).
///
/// Targets are created and owned by an external object store; this crate only
/// references them.
pub struct TargetObject;

/// Marker for digests that address note payloads.
pub struct NotePayload;

/// Marker for digests that address note entries.
pub struct EntryRecord;

/// A content digest tagged with the hash protocol and the kind of object it
/// addresses.
///
/// The kind marker `K` only exists at the type level and keeps target, note
/// and entry identifiers from being confused with one another; the raw bytes
/// carry no such distinction.
#[repr(transparent)]
pub struct ContentHash<H, K> {
    pub raw: RawHash,
    _marker: PhantomData<fn(H, K) -> ()>,
}

/// Identifier of a target object.
pub type TargetId<H> = ContentHash<H, TargetObject>;

/// Identifier of a note payload.
pub type NoteId<H> = ContentHash<H, NotePayload>;

/// Identifier of a note entry.
pub type EntryId<H> = ContentHash<H, EntryRecord>;

impl<H, K> ContentHash<H, K> {
    /// Wraps raw digest bytes without recomputing anything.
    pub const fn new(raw: RawHash) -> Self {
        Self {
            raw,
            _marker: PhantomData,
        }
    }

    /// Reinterprets this digest as addressing a different kind of object.
    ///
    /// This changes only the compile-time marker. It is used at storage
    /// boundaries where blobs of all kinds share one content-addressed key
    /// space.
    pub fn retag<K2>(self) -> ContentHash<H, K2> {
        ContentHash::new(self.raw)
    }
}

impl<H, K> ContentHash<H, K>
where
    H: HashProtocol,
{
    /// Hashes `bytes` with the protocol `H`.
    pub fn digest(bytes: &[u8]) -> Self {
        Self::new(H::digest(bytes).into())
    }

    /// Parses a digest from a plain hex string.
    pub fn from_hex(hex: &str) -> Result<Self, FromHexError> {
        let raw = RawHash::from_hex(hex)?;
        Ok(Self::new(raw))
    }

    /// Renders the digest as lowercase hex without the protocol prefix.
    pub fn to_hex(&self) -> String {
        hex::encode(self.raw)
    }
}

impl<H, K> Copy for ContentHash<H, K> {}

impl<H, K> Clone for ContentHash<H, K> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<H, K> PartialEq for ContentHash<H, K> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl<H, K> Eq for ContentHash<H, K> {}

impl<H, K> PartialOrd for ContentHash<H, K> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<H, K> Ord for ContentHash<H, K> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        Ord::cmp(&self.raw, &other.raw)
    }
}

impl<H, K> Hash for ContentHash<H, K> {
    fn hash<S: std::hash::Hasher>(&self, state: &mut S) {
        Hash::hash(&self.raw, state);
    }
}

impl<H, K> fmt::Debug for ContentHash<H, K>
where
    H: HashProtocol,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({self})")
    }
}

impl<H, K> fmt::Display for ContentHash<H, K>
where
    H: HashProtocol,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", H::NAME, hex::encode(self.raw))
    }
}

/// An error that can occur when parsing a protocol-prefixed digest string.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParseHashError {
    BadProtocol,
    BadHex(FromHexError),
}

impl From<FromHexError> for ParseHashError {
    fn from(value: FromHexError) -> Self {
        ParseHashError::BadHex(value)
    }
}

impl fmt::Display for ParseHashError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseHashError::BadProtocol => write!(f, "digest string has the wrong hash protocol"),
            ParseHashError::BadHex(e) => write!(f, "digest string is not valid hex: {e}"),
        }
    }
}

impl std::error::Error for ParseHashError {}

impl<H, K> ContentHash<H, K>
where
    H: HashProtocol,
{
    /// Parses a `protocol:hex` digest string as rendered by [`Display`].
    ///
    /// [`Display`]: fmt::Display
    pub fn parse(s: &str) -> Result<Self, ParseHashError> {
        let protocol = H::NAME;
        if !(s.starts_with(protocol) && s[protocol.len()..].starts_with(':')) {
            return Err(ParseHashError::BadProtocol);
        }
        let raw = RawHash::from_hex(&s[protocol.len() + 1..])?;
        Ok(Self::new(raw))
    }
}

/// A random 128 bit replica identifier.
///
/// Generated once per replica and attached to every entry that replica
/// creates. Besides attribution it serves as the deterministic tie-break in
/// merge ordering, so it must be unique among the replicas of one store.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReplicaId(pub [u8; REPLICA_ID_LEN]);

impl ReplicaId {
    /// Generates a fresh random replica id.
    pub fn random() -> Self {
        let mut rng = rand::thread_rng();
        let mut raw = [0; REPLICA_ID_LEN];
        rng.fill_bytes(&mut raw[..]);
        ReplicaId(raw)
    }

    /// Parses a replica id from a hex string.
    pub fn from_hex(hex: &str) -> Result<Self, FromHexError> {
        Ok(ReplicaId(<[u8; REPLICA_ID_LEN]>::from_hex(hex)?))
    }
}

impl AsRef<[u8]> for ReplicaId {
    fn as_ref(&self) -> &[u8] {
        &self.0[..]
    }
}

impl fmt::Debug for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReplicaId({self})")
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_string_roundtrip() {
        let id: NoteId<Blake3> = ContentHash::digest(b"marginal note");
        let s = id.to_string();
        let parsed = NoteId::<Blake3>::parse(&s).expect("roundtrip should succeed");
        assert_eq!(id, parsed);
    }

    #[test]
    fn parse_rejects_wrong_protocol() {
        let id: NoteId<Blake3> = ContentHash::digest(b"marginal note");
        let s = id.to_string();
        let err = NoteId::<Blake2b>::parse(&s).expect_err("blake2 must not accept blake3 strings");
        assert_eq!(err, ParseHashError::BadProtocol);
    }

    #[test]
    fn parse_rejects_bad_hex() {
        let err = NoteId::<Blake3>::parse("blake3:XYZ").expect_err("bad hex must fail");
        assert!(matches!(err, ParseHashError::BadHex(..)));
    }

    #[test]
    fn replica_ids_are_distinct() {
        assert_ne!(ReplicaId::random(), ReplicaId::random());
    }
}
