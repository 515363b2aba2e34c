//! Synchronization of namespace trees between replicas.
//!
//! Fetch and push are caller-initiated and proceed per `(remote, namespace)`.
//! Fetch walks every target the remote knows: absent targets are adopted
//! directly, equal heads are a no-op, strict descendants fast-forward, and
//! genuinely diverged chains go through the merge resolver. Push is the
//! mirror image but refuses to move a remote head it cannot prove is an
//! ancestor of the new one; such a refusal surfaces as
//! [`PushError::Rejected`] and the caller fetches (triggering a merge) and
//! retries.
//!
//! Entry and note blobs are transferred before any head is updated, and
//! heads only move through the storage compare-and-swap, so a failed or
//! cancelled sync leaves the local tree untouched. Transient transport
//! failures are retried inside the transport backend, not here; whatever
//! error escapes it is terminal for the attempt.

use std::collections::HashMap;
use std::fmt;

use tracing::debug;

use crate::id::Blake3;
use crate::id::EntryId;
use crate::id::HashProtocol;
use crate::id::TargetId;
use crate::merge;
use crate::merge::Resolution;
use crate::note::NoteEntry;
use crate::note::Parents;
use crate::replica::Replica;
use crate::store::transfer_chain;
use crate::store::HeadStore;
use crate::store::NoteStore;
use crate::store::NoteStoreGet;
use crate::store::TargetStore;
use crate::store::TransferError;
use crate::store::UpdateResult;

/// Where a `(remote, namespace)` pair currently is in its sync lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    Fetching,
    Reconciling,
    Pushing,
    /// The last fetch attempt ended in a terminal failure.
    FetchFailed,
    /// The last push attempt was refused as non-fast-forward.
    PushRejected,
}

/// Per-remote synchronization state.
///
/// Tracks the last-synced remote tip for every `(namespace, target)` pair so
/// push can skip unmodified targets, plus the per-namespace sync phase.
/// Dropping the tracker is how a remote is removed.
pub struct RemoteTracker<H>
where
    H: HashProtocol,
{
    name: String,
    phases: HashMap<String, SyncPhase>,
    tips: HashMap<(String, TargetId<H>), EntryId<H>>,
}

impl<H> fmt::Debug for RemoteTracker<H>
where
    H: HashProtocol,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTracker")
            .field("name", &self.name)
            .field("phases", &self.phases)
            .finish()
    }
}

impl<H> RemoteTracker<H>
where
    H: HashProtocol,
{
    pub fn new(name: impl Into<String>) -> Self {
        RemoteTracker {
            name: name.into(),
            phases: HashMap::new(),
            tips: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn phase(&self, namespace: &str) -> SyncPhase {
        self.phases
            .get(namespace)
            .copied()
            .unwrap_or(SyncPhase::Idle)
    }

    /// The remote head recorded at the end of the last successful sync of
    /// this target, if any.
    pub fn tip(&self, namespace: &str, target: TargetId<H>) -> Option<EntryId<H>> {
        self.tips.get(&(namespace.to_string(), target)).copied()
    }

    fn set_phase(&mut self, namespace: &str, phase: SyncPhase) {
        self.phases.insert(namespace.to_string(), phase);
    }

    fn set_tip(&mut self, namespace: &str, target: TargetId<H>, tip: EntryId<H>) {
        self.tips.insert((namespace.to_string(), target), tip);
    }
}

/// Counts of what a fetch did, by reconciliation path.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FetchSummary {
    /// Targets absent locally whose remote head was adopted directly.
    pub adopted: usize,
    /// Targets fast-forwarded to a strictly descendant remote head.
    pub fast_forwarded: usize,
    /// Targets that required a merge entry.
    pub merged: usize,
    /// Targets whose heads already agreed (or where local was ahead).
    pub unchanged: usize,
}

/// Counts of what a push did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PushSummary {
    /// Targets whose remote head was created or fast-forwarded.
    pub updated: usize,
    /// Targets already in sync.
    pub unchanged: usize,
}

#[derive(Debug)]
pub enum FetchError<Local, Remote>
where
    Local: NoteStore<Blake3> + HeadStore<Blake3> + TargetStore<Blake3>,
    Remote: NoteStore<Blake3> + HeadStore<Blake3>,
{
    RemoteTargets(Remote::TargetsError),
    RemoteHead(Remote::HeadError),
    RemoteReader(Remote::ReaderError),
    LocalReader(Local::ReaderError),
    LocalGet(<Local::Reader as NoteStoreGet<Blake3>>::GetError),
    LocalPut(Local::PutError),
    LocalHead(Local::HeadError),
    LocalUpdate(Local::UpdateError),
    TargetCheck(Local::ExistsError),
    Transfer(
        TransferError<
            <Remote::Reader as NoteStoreGet<Blake3>>::GetError,
            <Local::Reader as NoteStoreGet<Blake3>>::GetError,
            Local::PutError,
        >,
    ),
    /// The merge resolver was needed but the target is unknown to the local
    /// object store. The conflicting remote head is surfaced unmerged and
    /// the local tree is left as it was.
    UnknownTarget {
        target: TargetId<Blake3>,
        remote_head: EntryId<Blake3>,
    },
}

#[derive(Debug)]
pub enum PushError<Local, Remote>
where
    Local: NoteStore<Blake3> + HeadStore<Blake3> + TargetStore<Blake3>,
    Remote: NoteStore<Blake3> + HeadStore<Blake3>,
{
    LocalTargets(Local::TargetsError),
    LocalHead(Local::HeadError),
    LocalReader(Local::ReaderError),
    LocalGet(<Local::Reader as NoteStoreGet<Blake3>>::GetError),
    RemoteHead(Remote::HeadError),
    RemoteReader(Remote::ReaderError),
    RemoteUpdate(Remote::UpdateError),
    Transfer(
        TransferError<
            <Local::Reader as NoteStoreGet<Blake3>>::GetError,
            <Remote::Reader as NoteStoreGet<Blake3>>::GetError,
            Remote::PutError,
        >,
    ),
    /// Non-fast-forward: the remote head moved and is not an ancestor of the
    /// local head. Expected, recoverable: fetch (triggering a merge) and
    /// retry the push.
    Rejected {
        target: TargetId<Blake3>,
        remote_head: Option<EntryId<Blake3>>,
    },
}

impl<Storage> Replica<Storage>
where
    Storage: NoteStore<Blake3> + HeadStore<Blake3> + TargetStore<Blake3>,
{
    /// Fetches `namespace` from a remote replica and reconciles every target
    /// the remote knows into the local tree.
    pub fn fetch<R>(
        &mut self,
        remote: &mut R,
        tracker: &mut RemoteTracker<Blake3>,
        namespace: &str,
    ) -> Result<FetchSummary, FetchError<Storage, R>>
    where
        R: NoteStore<Blake3> + HeadStore<Blake3>,
    {
        tracker.set_phase(namespace, SyncPhase::Fetching);
        let result = self.fetch_inner(remote, tracker, namespace);
        let phase = match &result {
            Ok(_) => SyncPhase::Idle,
            Err(_) => SyncPhase::FetchFailed,
        };
        tracker.set_phase(namespace, phase);
        result
    }

    fn fetch_inner<R>(
        &mut self,
        remote: &mut R,
        tracker: &mut RemoteTracker<Blake3>,
        namespace: &str,
    ) -> Result<FetchSummary, FetchError<Storage, R>>
    where
        R: NoteStore<Blake3> + HeadStore<Blake3>,
    {
        let remote_targets = {
            let listing = remote
                .targets(namespace)
                .map_err(FetchError::RemoteTargets)?;
            listing
                .collect::<Result<Vec<_>, _>>()
                .map_err(FetchError::RemoteTargets)?
        };
        let remote_reader = remote.reader().map_err(FetchError::RemoteReader)?;
        let mut summary = FetchSummary::default();

        for target in remote_targets {
            let Some(remote_head) = remote
                .head(namespace, target)
                .map_err(FetchError::RemoteHead)?
            else {
                continue;
            };

            let local_head = self
                .storage
                .head(namespace, target)
                .map_err(FetchError::LocalHead)?;
            if local_head == Some(remote_head) {
                tracker.set_tip(namespace, target, remote_head);
                summary.unchanged += 1;
                continue;
            }

            // Pull the remote chain into local storage before touching any
            // head, so reconciliation reads only local state and a failure
            // here leaves the tree untouched.
            let probe = self.storage.reader().map_err(FetchError::LocalReader)?;
            transfer_chain(&remote_reader, &mut self.storage, &probe, remote_head)
                .map_err(FetchError::Transfer)?;

            tracker.set_phase(namespace, SyncPhase::Reconciling);
            loop {
                let local_head = self
                    .storage
                    .head(namespace, target)
                    .map_err(FetchError::LocalHead)?;

                let Some(local_head) = local_head else {
                    match self
                        .storage
                        .update(namespace, target, None, remote_head)
                        .map_err(FetchError::LocalUpdate)?
                    {
                        UpdateResult::Success() => {
                            debug!(remote = tracker.name(), namespace, target = %target, "adopted remote head");
                            summary.adopted += 1;
                            break;
                        }
                        // A local write landed concurrently; reconcile
                        // against it.
                        UpdateResult::Conflict(_) => continue,
                    }
                };

                let reader = self.storage.reader().map_err(FetchError::LocalReader)?;
                match merge::resolve(&reader, &self.policy, namespace, local_head, remote_head)
                    .map_err(FetchError::LocalGet)?
                {
                    Resolution::UpToDate => {
                        summary.unchanged += 1;
                        break;
                    }
                    Resolution::FastForward(new_head) => {
                        match self
                            .storage
                            .update(namespace, target, Some(local_head), new_head)
                            .map_err(FetchError::LocalUpdate)?
                        {
                            UpdateResult::Success() => {
                                debug!(remote = tracker.name(), namespace, target = %target, "fast-forwarded");
                                summary.fast_forwarded += 1;
                                break;
                            }
                            UpdateResult::Conflict(_) => continue,
                        }
                    }
                    Resolution::Merge(outcome) => {
                        if !self
                            .storage
                            .target_exists(target)
                            .map_err(FetchError::TargetCheck)?
                        {
                            return Err(FetchError::UnknownTarget {
                                target,
                                remote_head,
                            });
                        }

                        let note_id = self
                            .storage
                            .put_note(&outcome.note)
                            .map_err(FetchError::LocalPut)?;
                        let entry = NoteEntry::signed(
                            &self.signing_key,
                            target,
                            namespace,
                            note_id,
                            Parents::Two(outcome.parents.0, outcome.parents.1),
                            self.replica_id,
                            outcome.clock,
                        );
                        let entry_id = self
                            .storage
                            .put_entry(&entry)
                            .map_err(FetchError::LocalPut)?;
                        match self
                            .storage
                            .update(namespace, target, Some(local_head), entry_id)
                            .map_err(FetchError::LocalUpdate)?
                        {
                            UpdateResult::Success() => {
                                debug!(remote = tracker.name(), namespace, target = %target, "merged diverged heads");
                                summary.merged += 1;
                                break;
                            }
                            UpdateResult::Conflict(_) => continue,
                        }
                    }
                }
            }

            tracker.set_tip(namespace, target, remote_head);
        }

        Ok(summary)
    }

    /// Pushes every locally-modified target of `namespace` to the remote.
    ///
    /// Never overwrites a remote head it has not proven is an ancestor of
    /// the local one.
    pub fn push<R>(
        &mut self,
        remote: &mut R,
        tracker: &mut RemoteTracker<Blake3>,
        namespace: &str,
    ) -> Result<PushSummary, PushError<Storage, R>>
    where
        R: NoteStore<Blake3> + HeadStore<Blake3>,
    {
        tracker.set_phase(namespace, SyncPhase::Pushing);
        let result = self.push_inner(remote, tracker, namespace);
        let phase = match &result {
            Ok(_) => SyncPhase::Idle,
            Err(PushError::Rejected { .. }) => SyncPhase::PushRejected,
            // Transport or storage trouble: the attempt is over but nothing
            // was half-applied, so the pair just returns to idle.
            Err(_) => SyncPhase::Idle,
        };
        tracker.set_phase(namespace, phase);
        result
    }

    fn push_inner<R>(
        &mut self,
        remote: &mut R,
        tracker: &mut RemoteTracker<Blake3>,
        namespace: &str,
    ) -> Result<PushSummary, PushError<Storage, R>>
    where
        R: NoteStore<Blake3> + HeadStore<Blake3>,
    {
        let local_targets = {
            let listing = self
                .storage
                .targets(namespace)
                .map_err(PushError::LocalTargets)?;
            listing
                .collect::<Result<Vec<_>, _>>()
                .map_err(PushError::LocalTargets)?
        };
        let local_reader = self.storage.reader().map_err(PushError::LocalReader)?;
        let remote_probe = remote.reader().map_err(PushError::RemoteReader)?;
        let mut summary = PushSummary::default();

        for target in local_targets {
            let Some(local_head) = self
                .storage
                .head(namespace, target)
                .map_err(PushError::LocalHead)?
            else {
                continue;
            };

            if tracker.tip(namespace, target) == Some(local_head) {
                summary.unchanged += 1;
                continue;
            }

            let remote_head = remote
                .head(namespace, target)
                .map_err(PushError::RemoteHead)?;

            if remote_head == Some(local_head) {
                tracker.set_tip(namespace, target, local_head);
                summary.unchanged += 1;
                continue;
            }

            if let Some(remote_head) = remote_head {
                // Only move the remote head if it is provably part of our
                // history; anything else would discard entries we have never
                // seen.
                let ancestry =
                    merge::ancestor_entries(&local_reader, local_head).map_err(PushError::LocalGet)?;
                if !ancestry.contains_key(&remote_head) {
                    debug!(remote = tracker.name(), namespace, target = %target, "push rejected: remote advanced");
                    return Err(PushError::Rejected {
                        target,
                        remote_head: Some(remote_head),
                    });
                }
            }

            transfer_chain(&local_reader, remote, &remote_probe, local_head)
                .map_err(PushError::Transfer)?;

            match remote
                .update(namespace, target, remote_head, local_head)
                .map_err(PushError::RemoteUpdate)?
            {
                UpdateResult::Success() => {
                    debug!(remote = tracker.name(), namespace, target = %target, "pushed head");
                    tracker.set_tip(namespace, target, local_head);
                    summary.updated += 1;
                }
                // The remote moved between our read and the swap.
                UpdateResult::Conflict(current) => {
                    return Err(PushError::Rejected {
                        target,
                        remote_head: current,
                    });
                }
            }
        }

        Ok(summary)
    }
}
