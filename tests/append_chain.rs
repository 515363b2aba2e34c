use scholia::prelude::*;
use scholia::replica::SetError;

mod util;
use util::{note, replica_with_targets, target};

#[test]
fn append_builds_a_newest_first_chain() {
    let c1 = target(b"c1");
    let mut replica = replica_with_targets(&[c1]);

    let mut entry_ids = Vec::new();
    for (i, text) in ["first", "second", "third"].iter().enumerate() {
        let note_id = replica
            .put_note(&note("discussion", "drew", i as u64 + 1, text))
            .unwrap();
        entry_ids.push(replica.append("discussion", c1, note_id).expect("append"));
    }

    assert_eq!(replica.head("discussion", c1).unwrap(), Some(entry_ids[2]));

    let history: Vec<_> = replica
        .history("discussion", c1)
        .expect("history")
        .collect::<Result<Vec<_>, _>>()
        .expect("complete chain");

    let walked: Vec<_> = history.iter().map(|(id, _)| *id).collect();
    let mut expected = entry_ids.clone();
    expected.reverse();
    assert_eq!(walked, expected, "history must be exact reverse creation order");

    // Each entry links to its predecessor.
    assert_eq!(history[0].1.parents, Parents::One(entry_ids[1]));
    assert_eq!(history[2].1.parents, Parents::None);
    assert_eq!(history[0].1.clock, 2);
}

#[test]
fn set_with_stale_parent_is_rejected() {
    let c1 = target(b"c1");
    let mut replica = replica_with_targets(&[c1]);

    let first = replica
        .put_note(&note("discussion", "drew", 1, "hello"))
        .unwrap();
    let head = replica.append("discussion", c1, first).unwrap();

    let second = replica
        .put_note(&note("discussion", "drew", 2, "again"))
        .unwrap();
    replica.append("discussion", c1, second).unwrap();

    // Claiming the old head (or no head at all) must not clobber the chain.
    let third = replica
        .put_note(&note("discussion", "drew", 3, "stale"))
        .unwrap();
    match replica.set("discussion", c1, third, Some(head)) {
        Err(SetError::StaleParent { .. }) => {}
        other => panic!("expected StaleParent, got {other:?}"),
    }
    match replica.set("discussion", c1, third, None) {
        Err(SetError::StaleParent { .. }) => {}
        other => panic!("expected StaleParent, got {other:?}"),
    }
}

#[test]
fn unknown_targets_are_refused() {
    let known = target(b"known");
    let unknown = target(b"unknown");
    let mut replica = replica_with_targets(&[known]);

    let note_id = replica
        .put_note(&note("discussion", "drew", 1, "hello"))
        .unwrap();
    match replica.set("discussion", unknown, note_id, None) {
        Err(SetError::UnknownTarget(t)) => assert_eq!(t, unknown),
        other => panic!("expected UnknownTarget, got {other:?}"),
    }
    assert_eq!(replica.head("discussion", unknown).unwrap(), None);
}

#[test]
fn namespaces_are_isolated() {
    let c1 = target(b"c1");
    let mut replica = replica_with_targets(&[c1]);

    let discussion = replica
        .put_note(&note("github-comments", "drew", 1, "hello"))
        .unwrap();
    let discussion_head = replica.append("github-comments", c1, discussion).unwrap();

    let signoff = replica
        .put_note(&note("acceptance", "sam", 2, "approved"))
        .unwrap();
    replica.append("acceptance", c1, signoff).unwrap();

    assert_eq!(
        replica.head("github-comments", c1).unwrap(),
        Some(discussion_head),
        "appending in one namespace must not move another namespace's head"
    );
}

#[test]
fn notes_are_bound_to_their_namespace() {
    let c1 = target(b"c1");
    let mut replica = replica_with_targets(&[c1]);

    let foreign = replica
        .put_note(&note("acceptance", "sam", 1, "approved"))
        .unwrap();
    match replica.set("github-comments", c1, foreign, None) {
        Err(SetError::NamespaceMismatch { .. }) => {}
        other => panic!("expected NamespaceMismatch, got {other:?}"),
    }
}

#[test]
fn history_is_restartable() {
    let c1 = target(b"c1");
    let mut replica = replica_with_targets(&[c1]);

    for i in 0..4u64 {
        let note_id = replica
            .put_note(&note("discussion", "drew", i, &format!("note {i}")))
            .unwrap();
        replica.append("discussion", c1, note_id).unwrap();
    }

    let mut walk = replica.history("discussion", c1).expect("history");
    let fresh = walk.clone();
    walk.next().unwrap().unwrap();
    walk.next().unwrap().unwrap();

    let rest = walk.count();
    let full = fresh.count();
    assert_eq!(rest, 2);
    assert_eq!(full, 4, "a cloned walk restarts from its snapshot");
}
