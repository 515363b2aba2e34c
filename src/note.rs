//! The annotation data model: note payloads and note entries.
//!
//! A [`Note`] is an immutable payload attached to a target object. Notes are
//! content-addressed over all of their fields, so two textually identical
//! notes authored at different times remain distinct objects. A [`NoteEntry`]
//! is one link in the append chain for a `(namespace, target)` pair: it
//! references the note payload, up to two parent entries and the replica that
//! created it, and is signed with that replica's key.
//!
//! Both types have a canonical length-prefixed byte encoding. The digest of
//! that encoding is the object's identity, which is why the encoding must be
//! deterministic and must never change for already-written data.

use std::fmt;

use bytes::Bytes;
use ed25519::Signature;
use ed25519_dalek::SignatureError;
use ed25519_dalek::SigningKey;
use ed25519_dalek::VerifyingKey;
use hifitime::Epoch;
use signature::Signer;
use signature::Verifier;

use crate::id::ContentHash;
use crate::id::EntryId;
use crate::id::HashProtocol;
use crate::id::NoteId;
use crate::id::ReplicaId;
use crate::id::TargetId;
use crate::id::HASH_LEN;
use crate::id::REPLICA_ID_LEN;

/// Returns the current wall clock as nanoseconds on the TAI scale.
///
/// Only used to stamp freshly authored notes; merge payloads derive their
/// timestamp from their inputs instead so that both replicas synthesize the
/// same bytes.
pub fn now_ns() -> u64 {
    Epoch::now()
        .expect("system time")
        .to_tai_duration()
        .total_nanoseconds() as u64
}

/// An immutable note payload.
///
/// Owned and deduplicated by the note store; entries reference notes by id
/// and never mutate them. A superseded note stays in the store as part of the
/// target's history.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Note {
    /// The namespace this note belongs to. Included in the identity so equal
    /// text in different namespaces stays distinct.
    pub namespace: String,
    /// Free-form author string.
    pub author: String,
    /// Creation time in nanoseconds. The primary merge ordering key.
    pub created_at: u64,
    /// The payload bytes.
    pub content: Bytes,
}

impl Note {
    pub fn new(
        namespace: impl Into<String>,
        author: impl Into<String>,
        created_at: u64,
        content: impl Into<Bytes>,
    ) -> Self {
        Note {
            namespace: namespace.into(),
            author: author.into(),
            created_at,
            content: content.into(),
        }
    }

    /// The canonical encoding of this note.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            2 + self.namespace.len() + 2 + self.author.len() + 8 + 4 + self.content.len(),
        );
        put_str16(&mut out, &self.namespace);
        put_str16(&mut out, &self.author);
        out.extend_from_slice(&self.created_at.to_le_bytes());
        out.extend_from_slice(&(self.content.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.content);
        out
    }

    /// Decodes a note from its canonical encoding.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut cursor = Cursor::new(bytes);
        let namespace = cursor.take_str16()?;
        let author = cursor.take_str16()?;
        let created_at = cursor.take_u64()?;
        let len = cursor.take_u32()? as usize;
        let content = Bytes::copy_from_slice(cursor.take(len)?);
        cursor.finish()?;
        Ok(Note {
            namespace,
            author,
            created_at,
            content,
        })
    }

    /// The content address of this note under the hash protocol `H`.
    pub fn id<H: HashProtocol>(&self) -> NoteId<H> {
        ContentHash::digest(&self.encode())
    }
}

/// Parent links of a note entry.
///
/// An ordinary entry has at most one parent; only merge entries carry two.
/// This tagged representation is what distinguishes the two shapes, there is
/// no separate merge entry type.
pub enum Parents<H> {
    None,
    One(EntryId<H>),
    Two(EntryId<H>, EntryId<H>),
}

impl<H> Parents<H> {
    /// Iterates the parent ids in encoding order.
    pub fn iter(&self) -> impl Iterator<Item = EntryId<H>> + '_ {
        let (a, b) = match self {
            Parents::None => (None, None),
            Parents::One(p) => (Some(*p), None),
            Parents::Two(p, q) => (Some(*p), Some(*q)),
        };
        a.into_iter().chain(b)
    }

    pub fn count(&self) -> usize {
        match self {
            Parents::None => 0,
            Parents::One(_) => 1,
            Parents::Two(_, _) => 2,
        }
    }
}

impl<H> Copy for Parents<H> {}

impl<H> Clone for Parents<H> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<H> PartialEq for Parents<H> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Parents::None, Parents::None) => true,
            (Parents::One(a), Parents::One(b)) => a == b,
            (Parents::Two(a, b), Parents::Two(c, d)) => a == c && b == d,
            _ => false,
        }
    }
}

impl<H> Eq for Parents<H> {}

impl<H> fmt::Debug for Parents<H>
where
    H: HashProtocol,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Parents::None => write!(f, "Parents::None"),
            Parents::One(p) => write!(f, "Parents::One({p})"),
            Parents::Two(p, q) => write!(f, "Parents::Two({p}, {q})"),
        }
    }
}

/// One link in the append chain for a `(namespace, target)` pair.
///
/// Entries are immutable and content-addressed like notes. The signature
/// covers every field except itself and the signer's key, so an entry proves
/// which replica key produced it.
pub struct NoteEntry<H> {
    pub target: TargetId<H>,
    pub namespace: String,
    pub note: NoteId<H>,
    pub parents: Parents<H>,
    /// The replica that created this entry. Tie-break key in merge ordering.
    pub replica: ReplicaId,
    /// Logical clock: zero at origin, `max(parent clocks) + 1` otherwise.
    pub clock: u64,
    pub signed_by: [u8; 32],
    pub signature: [u8; 64],
}

impl<H> Clone for NoteEntry<H> {
    fn clone(&self) -> Self {
        NoteEntry {
            target: self.target,
            namespace: self.namespace.clone(),
            note: self.note,
            parents: self.parents,
            replica: self.replica,
            clock: self.clock,
            signed_by: self.signed_by,
            signature: self.signature,
        }
    }
}

impl<H> PartialEq for NoteEntry<H> {
    fn eq(&self, other: &Self) -> bool {
        self.target == other.target
            && self.namespace == other.namespace
            && self.note == other.note
            && self.parents == other.parents
            && self.replica == other.replica
            && self.clock == other.clock
            && self.signed_by == other.signed_by
            && self.signature == other.signature
    }
}

impl<H> Eq for NoteEntry<H> {}

impl<H> fmt::Debug for NoteEntry<H>
where
    H: HashProtocol,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NoteEntry")
            .field("target", &self.target)
            .field("namespace", &self.namespace)
            .field("note", &self.note)
            .field("parents", &self.parents)
            .field("replica", &self.replica)
            .field("clock", &self.clock)
            .finish()
    }
}

impl<H> NoteEntry<H>
where
    H: HashProtocol,
{
    /// Builds and signs a new entry with `signing_key`.
    pub fn signed(
        signing_key: &SigningKey,
        target: TargetId<H>,
        namespace: impl Into<String>,
        note: NoteId<H>,
        parents: Parents<H>,
        replica: ReplicaId,
        clock: u64,
    ) -> Self {
        let namespace = namespace.into();
        let signable = signable_bytes(&target, &namespace, &note, &parents, &replica, clock);
        let signature: Signature = signing_key.sign(&signable);
        NoteEntry {
            target,
            namespace,
            note,
            parents,
            replica,
            clock,
            signed_by: signing_key.verifying_key().to_bytes(),
            signature: signature.to_bytes(),
        }
    }

    /// True for merge entries (two parents).
    pub fn is_merge(&self) -> bool {
        matches!(self.parents, Parents::Two(_, _))
    }

    /// The content address of this entry.
    pub fn id(&self) -> EntryId<H> {
        ContentHash::digest(&self.encode())
    }

    /// The canonical encoding of this entry.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = signable_bytes(
            &self.target,
            &self.namespace,
            &self.note,
            &self.parents,
            &self.replica,
            self.clock,
        );
        out.extend_from_slice(&self.signed_by);
        out.extend_from_slice(&self.signature);
        out
    }

    /// Decodes an entry from its canonical encoding.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut cursor = Cursor::new(bytes);
        let namespace = cursor.take_str16()?;
        let target = ContentHash::new(cursor.take_hash()?);
        let note = ContentHash::new(cursor.take_hash()?);
        let parents = match cursor.take_u8()? {
            0 => Parents::None,
            1 => Parents::One(ContentHash::new(cursor.take_hash()?)),
            2 => Parents::Two(
                ContentHash::new(cursor.take_hash()?),
                ContentHash::new(cursor.take_hash()?),
            ),
            tag => return Err(DecodeError::BadParentTag(tag)),
        };
        let mut replica = [0; REPLICA_ID_LEN];
        replica.copy_from_slice(cursor.take(REPLICA_ID_LEN)?);
        let clock = cursor.take_u64()?;
        let mut signed_by = [0; 32];
        signed_by.copy_from_slice(cursor.take(32)?);
        let mut signature = [0; 64];
        signature.copy_from_slice(cursor.take(64)?);
        cursor.finish()?;
        Ok(NoteEntry {
            target,
            namespace,
            note,
            parents,
            replica: ReplicaId(replica),
            clock,
            signed_by,
            signature,
        })
    }

    /// Validates that the entry's signature matches its signer key.
    pub fn verify(&self) -> Result<(), ValidationError> {
        let pubkey =
            VerifyingKey::from_bytes(&self.signed_by).map_err(|_| ValidationError::BadKey)?;
        let signature = Signature::from_bytes(&self.signature);
        let signable = signable_bytes(
            &self.target,
            &self.namespace,
            &self.note,
            &self.parents,
            &self.replica,
            self.clock,
        );
        pubkey.verify(&signable, &signature)?;
        Ok(())
    }
}

fn signable_bytes<H>(
    target: &TargetId<H>,
    namespace: &str,
    note: &NoteId<H>,
    parents: &Parents<H>,
    replica: &ReplicaId,
    clock: u64,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + namespace.len() + 2 * HASH_LEN + 1 + 2 * HASH_LEN + 24);
    put_str16(&mut out, namespace);
    out.extend_from_slice(&target.raw);
    out.extend_from_slice(&note.raw);
    out.push(parents.count() as u8);
    for parent in parents.iter() {
        out.extend_from_slice(&parent.raw);
    }
    out.extend_from_slice(&replica.0);
    out.extend_from_slice(&clock.to_le_bytes());
    out
}

#[derive(Debug)]
pub enum ValidationError {
    BadKey,
    FailedValidation,
}

impl From<SignatureError> for ValidationError {
    fn from(_: SignatureError) -> Self {
        ValidationError::FailedValidation
    }
}

/// An error that can occur when decoding a canonical note or entry encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// The encoding ended before a field was complete.
    UnexpectedEnd,
    /// Bytes remained after the last field.
    TrailingBytes,
    /// A string field was not valid UTF-8.
    BadUtf8,
    /// The parent count tag was not 0, 1 or 2.
    BadParentTag(u8),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::UnexpectedEnd => write!(f, "encoding ended mid-field"),
            DecodeError::TrailingBytes => write!(f, "encoding has trailing bytes"),
            DecodeError::BadUtf8 => write!(f, "string field is not valid UTF-8"),
            DecodeError::BadParentTag(tag) => write!(f, "bad parent count tag {tag}"),
        }
    }
}

impl std::error::Error for DecodeError {}

fn put_str16(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u16).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
}

struct Cursor<'a> {
    rest: &'a [u8],
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Cursor { rest: bytes }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.rest.len() < n {
            return Err(DecodeError::UnexpectedEnd);
        }
        let (head, tail) = self.rest.split_at(n);
        self.rest = tail;
        Ok(head)
    }

    fn take_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn take_u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn take_u64(&mut self) -> Result<u64, DecodeError> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn take_hash(&mut self) -> Result<[u8; HASH_LEN], DecodeError> {
        Ok(self.take(HASH_LEN)?.try_into().unwrap())
    }

    fn take_str16(&mut self) -> Result<String, DecodeError> {
        let len = u16::from_le_bytes(self.take(2)?.try_into().unwrap()) as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::BadUtf8)
    }

    fn finish(self) -> Result<(), DecodeError> {
        if self.rest.is_empty() {
            Ok(())
        } else {
            Err(DecodeError::TrailingBytes)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::Blake3;
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;

    #[test]
    fn note_identity_covers_all_fields() {
        let a = Note::new("discussion", "drew", 7, &b"same text"[..]);
        let b = Note::new("discussion", "drew", 8, &b"same text"[..]);
        assert_ne!(a.id::<Blake3>(), b.id::<Blake3>());
        assert_eq!(a.id::<Blake3>(), a.clone().id::<Blake3>());
    }

    #[test]
    fn entry_signature_verifies() {
        let key = SigningKey::generate(&mut OsRng);
        let target = ContentHash::digest(b"target object");
        let note = Note::new("discussion", "drew", 7, &b"hello"[..]);
        let entry = NoteEntry::<Blake3>::signed(
            &key,
            target,
            "discussion",
            note.id(),
            Parents::None,
            ReplicaId::random(),
            0,
        );
        entry.verify().expect("freshly signed entry must verify");

        let mut tampered = entry.clone();
        tampered.clock = 1;
        assert!(tampered.verify().is_err());
    }

    #[test]
    fn entry_decode_rejects_bad_parent_tag() {
        let key = SigningKey::generate(&mut OsRng);
        let target = ContentHash::digest(b"target object");
        let entry = NoteEntry::<Blake3>::signed(
            &key,
            target,
            "discussion",
            ContentHash::digest(b"payload"),
            Parents::None,
            ReplicaId::random(),
            0,
        );
        let mut bytes = entry.encode();
        // The parent tag sits right after the namespace and two digests.
        let tag_at = 2 + "discussion".len() + 64;
        bytes[tag_at] = 9;
        assert_eq!(
            NoteEntry::<Blake3>::decode(&bytes),
            Err(DecodeError::BadParentTag(9))
        );
    }
}
