//! Deterministic reconciliation of diverged append chains.
//!
//! When two replicas hold different heads for the same `(namespace, target)`
//! pair and neither is an ancestor of the other, the chains have diverged and
//! must be merged. The resolver finds the entries unique to each side since
//! the common ancestor (no common ancestor is legal: the replicas may have
//! annotated the target independently from scratch) and synthesizes a merge
//! note whose content is the ordered concatenation of the divergent notes.
//!
//! The concatenation order is `(created_at, replica, note id)` ascending.
//! Because that key is derived purely from the divergent entries themselves,
//! merging A into B and merging B into A produce byte-identical payloads: the
//! merge is commutative and associative over the set of divergent entries,
//! independent of which side is "local". Reproducible fixtures depend on this
//! rule, so it must not be weakened to any last-writer-wins shortcut.

use std::collections::HashMap;

use itertools::Itertools;

use crate::id::EntryId;
use crate::id::HashProtocol;
use crate::note::Note;
use crate::note::NoteEntry;
use crate::store::NoteStoreGet;

/// Author recorded on synthesized merge notes.
pub const MERGE_AUTHOR: &str = "merge";

/// Default separator between concatenated divergent notes.
pub const DEFAULT_DELIMITER: &str = "\n---\n";

/// Per-namespace merge configuration.
///
/// Ordered concatenation is the only strategy; what can vary per namespace is
/// the delimiter placed between the concatenated notes.
#[derive(Debug, Clone)]
pub struct MergePolicy {
    default_delimiter: String,
    per_namespace: HashMap<String, String>,
}

impl MergePolicy {
    pub fn new(delimiter: impl Into<String>) -> Self {
        MergePolicy {
            default_delimiter: delimiter.into(),
            per_namespace: HashMap::new(),
        }
    }

    /// Overrides the delimiter for one namespace.
    pub fn with_namespace_delimiter(
        mut self,
        namespace: impl Into<String>,
        delimiter: impl Into<String>,
    ) -> Self {
        self.per_namespace
            .insert(namespace.into(), delimiter.into());
        self
    }

    pub fn delimiter(&self, namespace: &str) -> &str {
        self.per_namespace
            .get(namespace)
            .unwrap_or(&self.default_delimiter)
    }
}

impl Default for MergePolicy {
    fn default() -> Self {
        MergePolicy::new(DEFAULT_DELIMITER)
    }
}

/// What the resolver decided for a pair of heads.
pub enum Resolution<H>
where
    H: HashProtocol,
{
    /// The remote head equals the local head or is one of its ancestors;
    /// nothing to do.
    UpToDate,
    /// The remote head is a strict descendant of the local head; adopt it
    /// without synthesizing anything.
    FastForward(EntryId<H>),
    /// The chains diverged; a merge note must be created.
    Merge(MergeOutcome<H>),
}

/// The synthesized merge, not yet stored or signed.
///
/// The caller stores the note, wraps it in a two-parent entry and publishes
/// that entry as the new head.
pub struct MergeOutcome<H>
where
    H: HashProtocol,
{
    pub note: Note,
    /// Local and remote head, in that order.
    pub parents: (EntryId<H>, EntryId<H>),
    /// Logical clock for the merge entry.
    pub clock: u64,
}

/// Collects every entry reachable from `from`, keyed by id.
///
/// Bounded by chain length; merge entries contribute both parents.
pub fn ancestor_entries<H, G>(
    reader: &G,
    from: EntryId<H>,
) -> Result<HashMap<EntryId<H>, NoteEntry<H>>, G::GetError>
where
    H: HashProtocol,
    G: NoteStoreGet<H>,
{
    let mut visited: HashMap<EntryId<H>, NoteEntry<H>> = HashMap::new();
    let mut stack = vec![from];

    while let Some(id) = stack.pop() {
        if visited.contains_key(&id) {
            continue;
        }
        let entry = reader.entry(id)?;
        for parent in entry.parents.iter() {
            stack.push(parent);
        }
        visited.insert(id, entry);
    }

    Ok(visited)
}

/// Reconciles `local` and `remote` heads for one target.
///
/// Fast-forward and up-to-date cases are recognized before any merge work
/// happens; they are the common, cheap path. Every entry reachable from
/// either head must be present in `reader` — the synchronization engine
/// transfers the remote chain into local storage before invoking this.
pub fn resolve<H, G>(
    reader: &G,
    policy: &MergePolicy,
    namespace: &str,
    local: EntryId<H>,
    remote: EntryId<H>,
) -> Result<Resolution<H>, G::GetError>
where
    H: HashProtocol,
    G: NoteStoreGet<H>,
{
    if local == remote {
        return Ok(Resolution::UpToDate);
    }

    let local_chain = ancestor_entries(reader, local)?;
    if local_chain.contains_key(&remote) {
        return Ok(Resolution::UpToDate);
    }

    let remote_chain = ancestor_entries(reader, remote)?;
    if remote_chain.contains_key(&local) {
        return Ok(Resolution::FastForward(remote));
    }

    // Diverged. Everything past the shared ancestry gets concatenated; the
    // shared entries themselves are already part of both histories.
    let mut divergent = Vec::new();
    for (id, entry) in &local_chain {
        if !remote_chain.contains_key(id) {
            divergent.push((entry, reader.note(entry.note)?));
        }
    }
    for (id, entry) in &remote_chain {
        if !local_chain.contains_key(id) {
            divergent.push((entry, reader.note(entry.note)?));
        }
    }

    let divergent = divergent
        .into_iter()
        .sorted_by_key(|(entry, note)| (note.created_at, entry.replica, entry.note))
        .collect::<Vec<_>>();

    let delimiter = policy.delimiter(namespace).as_bytes();
    let mut content = Vec::new();
    for (i, (_, note)) in divergent.iter().enumerate() {
        if i > 0 {
            content.extend_from_slice(delimiter);
        }
        content.extend_from_slice(&note.content);
    }

    // Derived purely from the inputs so both replicas synthesize the same
    // payload bytes.
    let created_at = divergent
        .iter()
        .map(|(_, note)| note.created_at)
        .max()
        .expect("diverged heads have divergent entries");

    let note = Note::new(namespace, MERGE_AUTHOR, created_at, content);
    let clock = local_chain[&local].clock.max(remote_chain[&remote].clock) + 1;

    Ok(Resolution::Merge(MergeOutcome {
        note,
        parents: (local, remote),
        clock,
    }))
}
