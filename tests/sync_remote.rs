use scholia::prelude::*;
use scholia::sync::PushError;
use url::Url;

mod util;
use util::{note, replica_with_targets, target};

#[test]
fn fetch_is_idempotent_when_the_remote_is_unchanged() {
    let c1 = target(b"c1");
    let mut origin = replica_with_targets(&[c1]);
    let mut mirror = replica_with_targets(&[c1]);

    let note_id = origin
        .put_note(&note("discussion", "lena", 1, "hello"))
        .unwrap();
    let head = origin.append("discussion", c1, note_id).unwrap();

    let mut tracker = RemoteTracker::new("origin");
    let first = mirror
        .fetch(origin.storage_mut(), &mut tracker, "discussion")
        .expect("first fetch");
    assert_eq!(first.adopted, 1);
    assert_eq!(mirror.head("discussion", c1).unwrap(), Some(head));

    let second = mirror
        .fetch(origin.storage_mut(), &mut tracker, "discussion")
        .expect("second fetch");
    assert_eq!(second, FetchSummary { unchanged: 1, ..Default::default() });
    assert_eq!(
        mirror.head("discussion", c1).unwrap(),
        Some(head),
        "an unchanged remote must leave the head entry id untouched"
    );
    assert_eq!(tracker.phase("discussion"), SyncPhase::Idle);
}

#[test]
fn push_then_fetch_fast_forwards_the_peer() {
    let c1 = target(b"c1");
    let mut author = replica_with_targets(&[c1]);
    let mut reviewer = replica_with_targets(&[c1]);
    let mut hub: MemoryStore<Blake3> = MemoryStore::new();
    let mut author_tracker = RemoteTracker::new("hub");
    let mut reviewer_tracker = RemoteTracker::new("hub");

    let first = author
        .put_note(&note("discussion", "lena", 1, "first"))
        .unwrap();
    author.append("discussion", c1, first).unwrap();
    author
        .push(&mut hub, &mut author_tracker, "discussion")
        .expect("push");

    reviewer
        .fetch(&mut hub, &mut reviewer_tracker, "discussion")
        .expect("fetch");

    let second = author
        .put_note(&note("discussion", "lena", 2, "second"))
        .unwrap();
    let new_head = author.append("discussion", c1, second).unwrap();
    let pushed = author
        .push(&mut hub, &mut author_tracker, "discussion")
        .expect("push");
    assert_eq!(pushed.updated, 1);

    let fetched = reviewer
        .fetch(&mut hub, &mut reviewer_tracker, "discussion")
        .expect("fetch");
    assert_eq!(fetched.fast_forwarded, 1);
    assert_eq!(reviewer.head("discussion", c1).unwrap(), Some(new_head));
}

#[test]
fn non_fast_forward_push_is_rejected_until_fetched() {
    let c1 = target(b"c1");
    let mut author = replica_with_targets(&[c1]);
    let mut reviewer = replica_with_targets(&[c1]);
    let mut hub: MemoryStore<Blake3> = MemoryStore::new();
    let mut author_tracker = RemoteTracker::new("hub");
    let mut reviewer_tracker = RemoteTracker::new("hub");

    let ours = author
        .put_note(&note("discussion", "lena", 100, "ours"))
        .unwrap();
    author.append("discussion", c1, ours).unwrap();
    author
        .push(&mut hub, &mut author_tracker, "discussion")
        .expect("push");

    let theirs = reviewer
        .put_note(&note("discussion", "ravi", 200, "theirs"))
        .unwrap();
    reviewer.append("discussion", c1, theirs).unwrap();

    match reviewer.push(&mut hub, &mut reviewer_tracker, "discussion") {
        Err(PushError::Rejected { target, .. }) => assert_eq!(target, c1),
        other => panic!("expected Rejected, got {other:?}"),
    }
    assert_eq!(reviewer_tracker.phase("discussion"), SyncPhase::PushRejected);

    // The prescribed recovery: fetch (which merges) and retry the push.
    let fetched = reviewer
        .fetch(&mut hub, &mut reviewer_tracker, "discussion")
        .expect("fetch");
    assert_eq!(fetched.merged, 1);
    let retried = reviewer
        .push(&mut hub, &mut reviewer_tracker, "discussion")
        .expect("retried push");
    assert_eq!(retried.updated, 1);

    let merged_head = reviewer.head("discussion", c1).unwrap();
    let fetched = author
        .fetch(&mut hub, &mut author_tracker, "discussion")
        .expect("author fetch");
    assert_eq!(fetched.fast_forwarded, 1);
    assert_eq!(author.head("discussion", c1).unwrap(), merged_head);

    let history: Vec<_> = author
        .history("discussion", c1)
        .expect("history")
        .collect::<Result<Vec<_>, _>>()
        .expect("complete chain");
    assert_eq!(history.len(), 3, "merge entry plus both originals");
    assert!(history[0].1.is_merge());
}

#[test]
fn unmodified_targets_are_skipped_on_push() {
    let c1 = target(b"c1");
    let mut author = replica_with_targets(&[c1]);
    let mut hub: MemoryStore<Blake3> = MemoryStore::new();
    let mut tracker = RemoteTracker::new("hub");

    let note_id = author
        .put_note(&note("discussion", "lena", 1, "hello"))
        .unwrap();
    let head = author.append("discussion", c1, note_id).unwrap();
    author.push(&mut hub, &mut tracker, "discussion").expect("push");
    assert_eq!(tracker.tip("discussion", c1), Some(head));

    let again = author.push(&mut hub, &mut tracker, "discussion").expect("push");
    assert_eq!(again, PushSummary { unchanged: 1, ..Default::default() });
}

#[test]
fn replicas_synchronize_through_an_object_store_url() {
    let c1 = target(b"c1");
    let mut author = replica_with_targets(&[c1]);
    let mut reviewer = replica_with_targets(&[c1]);

    let url = Url::parse("memory:///notes").unwrap();
    let mut hub = ObjectStoreRemote::<Blake3>::with_url(&url).unwrap();
    let mut author_tracker = RemoteTracker::new("hub");
    let mut reviewer_tracker = RemoteTracker::new("hub");

    let note_id = author
        .put_note(&note("discussion", "lena", 1, "hello"))
        .unwrap();
    let head = author.append("discussion", c1, note_id).unwrap();
    author
        .push(&mut hub, &mut author_tracker, "discussion")
        .expect("push");

    let fetched = reviewer
        .fetch(&mut hub, &mut reviewer_tracker, "discussion")
        .expect("fetch");
    assert_eq!(fetched.adopted, 1);
    assert_eq!(reviewer.head("discussion", c1).unwrap(), Some(head));

    let reply = reviewer
        .put_note(&note("discussion", "ravi", 2, "reply"))
        .unwrap();
    let new_head = reviewer.append("discussion", c1, reply).unwrap();
    reviewer
        .push(&mut hub, &mut reviewer_tracker, "discussion")
        .expect("push");

    let fetched = author
        .fetch(&mut hub, &mut author_tracker, "discussion")
        .expect("fetch");
    assert_eq!(fetched.fast_forwarded, 1);
    assert_eq!(author.head("discussion", c1).unwrap(), Some(new_head));
}

#[test]
fn replicas_synchronize_through_a_directory_remote() {
    let dir = tempfile::tempdir().unwrap();
    let url = Url::from_directory_path(dir.path()).unwrap();
    let mut hub = ObjectStoreRemote::<Blake3>::with_url(&url).unwrap();

    let c1 = target(b"c1");
    let mut author = replica_with_targets(&[c1]);
    let mut mirror = replica_with_targets(&[c1]);
    let mut author_tracker = RemoteTracker::new("dir");
    let mut mirror_tracker = RemoteTracker::new("dir");

    let note_id = author
        .put_note(&note("acceptance", "lena", 1, "approved"))
        .unwrap();
    let head = author.append("acceptance", c1, note_id).unwrap();
    author
        .push(&mut hub, &mut author_tracker, "acceptance")
        .expect("push");

    let fetched = mirror
        .fetch(&mut hub, &mut mirror_tracker, "acceptance")
        .expect("fetch");
    assert_eq!(fetched.adopted, 1);
    assert_eq!(mirror.head("acceptance", c1).unwrap(), Some(head));
}
