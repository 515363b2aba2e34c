//! Scholia is a distributed annotation store: it attaches mutable,
//! appendable notes (review discussions, test results, sign-offs) to
//! otherwise-immutable content-addressed objects without altering those
//! objects' identity, and synchronizes the notes between independent
//! replicas.
//!
//! The design is inspired by Git's notes mechanism but reduces the mutable
//! state of a replica to an absolute minimum. Note payloads and note entries
//! are immutable, content-addressed blobs; the only thing that ever changes
//! is a per-namespace map from target id to the current head entry, and that
//! map only moves through a compare-and-swap. History is the chain of parent
//! links behind a head: ordinary entries carry one parent, merge entries
//! carry two.
//!
//! When two replicas diverge on a target, reconciliation is deterministic:
//! the entries unique to each side since the common ancestor are concatenated
//! in `(created_at, replica)` order into a merge note, so both replicas
//! synthesize byte-identical payloads no matter which side initiates the
//! exchange. There is no central authority and no last-writer-wins.
//!
//! ## Layout
//!
//! - [`id`] — hash protocol, content digests, replica ids.
//! - [`note`] — note payloads, entries, canonical encodings, signing.
//! - [`store`] — storage traits plus the in-memory and `object_store`
//!   backends.
//! - [`replica`] — the high-level API: `set`, `append`, `head`, `history`,
//!   `import`.
//! - [`merge`] — the deterministic conflict resolver.
//! - [`sync`] — fetch/push against remote replicas.
//! - [`import`] — review-comment adaptation.
//!
//! ## Git parallels
//!
//! - A namespace is a notes ref; a head entry is the tip commit of that ref
//!   for one annotated object.
//! - `append` commits on top of the current tip; a stale parent is rejected
//!   instead of silently overwritten.
//! - `fetch` adopts, fast-forwards or merges; `push` refuses non-fast-forward
//!   updates and the caller fetches and retries.
//!
//! These parallels should help readers leverage their Git knowledge when
//! working with annotation replicas.

pub mod id;
pub mod import;
pub mod merge;
pub mod note;
pub mod prelude;
pub mod replica;
pub mod store;
pub mod sync;
