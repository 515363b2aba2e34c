#![allow(dead_code)]

use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use scholia::prelude::*;

/// Derives a deterministic target id from a seed, standing in for an object
/// that exists in the surrounding object store.
pub fn target(seed: &[u8]) -> TargetId<Blake3> {
    ContentHash::digest(seed)
}

/// A replica over fresh in-memory storage with the given targets registered.
pub fn replica_with_targets(targets: &[TargetId<Blake3>]) -> Replica<MemoryStore<Blake3>> {
    let mut store = MemoryStore::new();
    for t in targets {
        store.register_target(*t);
    }
    Replica::new(store, SigningKey::generate(&mut OsRng))
}

pub fn note(namespace: &str, author: &str, created_at: u64, text: &str) -> Note {
    Note::new(namespace, author, created_at, text.as_bytes().to_vec())
}
