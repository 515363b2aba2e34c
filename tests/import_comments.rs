use scholia::prelude::*;
use scholia::replica::ImportError;

mod util;
use util::{replica_with_targets, target};

fn comment(author: &str, created_at: u64, body: &str) -> ReviewComment {
    ReviewComment {
        author: author.to_string(),
        created_at,
        body: body.to_string(),
    }
}

#[test]
fn empty_imports_create_nothing() {
    let c2 = target(b"c2");
    let mut replica = replica_with_targets(&[c2]);

    match replica.import("github-comments", c2, &[]) {
        Err(ImportError::EmptyImport) => {}
        other => panic!("expected EmptyImport, got {other:?}"),
    }
    assert_eq!(replica.head("github-comments", c2).unwrap(), None);
}

#[test]
fn a_batch_becomes_one_aggregated_entry() {
    let c1 = target(b"c1");
    let mut replica = replica_with_targets(&[c1]);

    let comments = vec![
        comment("drew", 5, "does this handle merges?"),
        comment("sam", 9, "yes, see the resolver"),
    ];
    let entry_id = replica
        .import("github-comments", c1, &comments)
        .expect("import");

    assert_eq!(replica.head("github-comments", c1).unwrap(), Some(entry_id));
    let entry = replica.entry(entry_id).unwrap();
    let payload = replica.note(entry.note).unwrap();
    let text = std::str::from_utf8(&payload.content).unwrap();
    assert_eq!(
        text,
        "author: drew\ndate: 5\n\ndoes this handle merges?\n\nauthor: sam\ndate: 9\n\nyes, see the resolver\n"
    );

    let history_len = replica
        .history("github-comments", c1)
        .expect("history")
        .count();
    assert_eq!(history_len, 1, "one batch, one entry");
}

#[test]
fn reimporting_the_same_batch_shares_the_payload() {
    let c1 = target(b"c1");
    let mut replica = replica_with_targets(&[c1]);
    let comments = vec![comment("drew", 5, "ping")];

    let first = replica
        .import("github-comments", c1, &comments)
        .expect("import");
    let second = replica
        .import("github-comments", c1, &comments)
        .expect("reimport");

    let first_note = replica.entry(first).unwrap().note;
    let second_note = replica.entry(second).unwrap().note;
    assert_eq!(first_note, second_note, "identical batches deduplicate");
    assert_ne!(first, second, "but each import appends its own entry");
}

#[test]
fn platform_json_imports_end_to_end() {
    let c1 = target(b"c1");
    let mut replica = replica_with_targets(&[c1]);

    let text = r#"[
        {"author": "drew", "created_at": 5, "body": "does this handle merges?"},
        {"author": "sam", "created_at": 9, "body": "yes"}
    ]"#;
    let comments = comments_from_json(text).expect("parse");
    let entry_id = replica
        .import("github-comments", c1, &comments)
        .expect("import");

    let entry = replica.entry(entry_id).unwrap();
    let payload = replica.note(entry.note).unwrap();
    assert_eq!(payload.created_at, 9);
    assert_eq!(payload.namespace, "github-comments");
}
