use cumulus_store::{DocumentStore, MemoryDocStore, MemoryVfs, RevisionedDoc, RevsMap, StoreError, Vfs};
use cumulus_types::Document;
use pretty_assertions::assert_eq;

const DOCTYPE: &str = "io.cozy.tests";

fn chain(revs: &[&str]) -> Vec<String> {
    revs.iter().map(|r| r.to_string()).collect()
}

// ── Local writes ─────────────────────────────────────────────────

#[test]
fn create_assigns_first_generation() {
    let store = MemoryDocStore::new();
    let doc = store.create(DOCTYPE, Document::new("doc1").with("title", "a")).unwrap();
    let rev = doc.rev.unwrap();
    assert!(rev.starts_with("1-"));
    assert_eq!(rev.len(), 2 + 32);
}

#[test]
fn create_generates_missing_id() {
    let store = MemoryDocStore::new();
    let doc = store.create(DOCTYPE, Document::default()).unwrap();
    assert_eq!(doc.id.len(), 32);
}

#[test]
fn revisions_are_content_addressed() {
    let a = MemoryDocStore::new();
    let b = MemoryDocStore::new();
    let ra = a.create(DOCTYPE, Document::new("d").with("x", 1)).unwrap();
    let rb = b.create(DOCTYPE, Document::new("d").with("x", 1)).unwrap();
    assert_eq!(ra.rev, rb.rev);
}

#[test]
fn update_requires_current_revision() {
    let store = MemoryDocStore::new();
    let created = store.create(DOCTYPE, Document::new("doc1").with("n", 1)).unwrap();

    let updated = store.update(DOCTYPE, created.clone().with("n", 2)).unwrap();
    assert!(updated.rev.as_deref().unwrap().starts_with("2-"));

    let stale = store.update(DOCTYPE, created.with("n", 3));
    assert!(matches!(stale, Err(StoreError::Conflict(_))));
}

#[test]
fn update_without_rev_is_invalid() {
    let store = MemoryDocStore::new();
    let result = store.update(DOCTYPE, Document::new("x"));
    assert!(matches!(result, Err(StoreError::InvalidData(_))));
}

#[test]
fn delete_hides_document_but_keeps_revisions() {
    let store = MemoryDocStore::new();
    let created = store.create(DOCTYPE, Document::new("doc1")).unwrap();
    let tombstone = store.delete(DOCTYPE, &created).unwrap();
    assert!(tombstone.deleted);

    assert!(store.get(DOCTYPE, "doc1").unwrap().is_none());
    let with_revs = store.get_with_revisions(DOCTYPE, "doc1").unwrap().unwrap();
    assert!(with_revs.doc.deleted);
    assert_eq!(with_revs.revisions.len(), 2);
}

// ── Queries ──────────────────────────────────────────────────────

#[test]
fn find_by_field_matches_id_or_selector() {
    let store = MemoryDocStore::new();
    store.create(DOCTYPE, Document::new("a").with("tag", "red")).unwrap();
    store.create(DOCTYPE, Document::new("b").with("tag", "blue")).unwrap();
    store.create("io.cozy.other", Document::new("c").with("tag", "red")).unwrap();

    let by_id = store.find_by_field(DOCTYPE, None, &["b".to_string()]).unwrap();
    assert_eq!(by_id.len(), 1);
    assert_eq!(by_id[0].id, "b");

    let by_tag = store.find_by_field(DOCTYPE, Some("tag"), &["red".to_string()]).unwrap();
    assert_eq!(by_tag.len(), 1);
    assert_eq!(by_tag[0].id, "a");
}

#[test]
fn revs_diff_lists_unknown_revisions() {
    let store = MemoryDocStore::new();
    let doc = store.create(DOCTYPE, Document::new("a")).unwrap();
    let known = doc.rev.unwrap();

    let mut request = RevsMap::new();
    request.insert("a".to_string(), vec![known.clone(), "2-zzz".to_string()]);
    request.insert("b".to_string(), vec!["1-bbb".to_string()]);

    let missing = store.revs_diff(DOCTYPE, &request).unwrap();
    assert_eq!(missing.get("a").unwrap(), &chain(&["2-zzz"]));
    assert_eq!(missing.get("b").unwrap(), &chain(&["1-bbb"]));

    let mut up_to_date = RevsMap::new();
    up_to_date.insert("a".to_string(), vec![known]);
    assert!(store.revs_diff(DOCTYPE, &up_to_date).unwrap().is_empty());
}

// ── Forced writes ────────────────────────────────────────────────

#[test]
fn force_write_reproduces_the_exact_chain() {
    let store = MemoryDocStore::new();
    let revisions = chain(&["1-aaa", "2-bbb", "3-ccc"]);
    store
        .bulk_force_write(
            DOCTYPE,
            vec![RevisionedDoc {
                doc: Document::new("x").with("v", 3),
                revisions: revisions.clone(),
            }],
        )
        .unwrap();

    let fetched = store.get_with_revisions(DOCTYPE, "x").unwrap().unwrap();
    assert_eq!(fetched.revisions, revisions);
    assert_eq!(fetched.doc.rev.as_deref(), Some("3-ccc"));
}

#[test]
fn force_write_of_a_diverging_chain_picks_deterministic_winner() {
    let store = MemoryDocStore::new();
    let write = |revs: &[&str], v: i64| {
        store
            .bulk_force_write(
                DOCTYPE,
                vec![RevisionedDoc {
                    doc: Document::new("x").with("v", v),
                    revisions: chain(revs),
                }],
            )
            .unwrap();
    };
    write(&["1-aaa", "2-bbb"], 2);
    write(&["1-aaa", "2-ccc"], 3);

    let tree = store.revision_tree(DOCTYPE, "x").unwrap();
    assert!(tree.has_conflicts());
    let current = store.get(DOCTYPE, "x").unwrap().unwrap();
    assert_eq!(current.rev.as_deref(), Some("2-ccc"));
    assert_eq!(current.get("v"), Some(&serde_json::json!(3)));
}

#[test]
fn force_write_twice_is_a_noop() {
    let store = MemoryDocStore::new();
    let doc = RevisionedDoc {
        doc: Document::new("x"),
        revisions: chain(&["1-aaa", "2-bbb"]),
    };
    store.bulk_force_write(DOCTYPE, vec![doc.clone()]).unwrap();
    let once = store.revision_tree(DOCTYPE, "x").unwrap();
    store.bulk_force_write(DOCTYPE, vec![doc]).unwrap();
    assert_eq!(store.revision_tree(DOCTYPE, "x").unwrap(), once);
    assert_eq!(store.count(DOCTYPE), 1);
}

#[test]
fn force_write_rejects_empty_chain() {
    let store = MemoryDocStore::new();
    let result = store.bulk_force_write(
        DOCTYPE,
        vec![RevisionedDoc {
            doc: Document::new("x"),
            revisions: vec![],
        }],
    );
    assert!(matches!(result, Err(StoreError::InvalidData(_))));
}

#[test]
fn force_write_of_an_unrelated_lineage_is_a_conflict() {
    let store = MemoryDocStore::new();
    let original = RevisionedDoc {
        doc: Document::new("x").with("title", "original"),
        revisions: chain(&["1-aaa"]),
    };
    store.bulk_force_write(DOCTYPE, vec![original]).unwrap();

    let foreign = RevisionedDoc {
        doc: Document::new("x").with("title", "foreign"),
        revisions: chain(&["1-bbb", "2-ccc"]),
    };
    let result = store.bulk_force_write(DOCTYPE, vec![foreign]);
    assert!(matches!(result, Err(StoreError::Conflict(_))));

    let tree = store.revision_tree(DOCTYPE, "x").unwrap();
    assert!(!tree.contains("2-ccc"));
    assert_eq!(store.get(DOCTYPE, "x").unwrap().unwrap().get_str("title"), Some("original"));
}

// ── Vfs ──────────────────────────────────────────────────────────

#[test]
fn memory_vfs_roundtrip() {
    let vfs = MemoryVfs::new();
    assert!(!vfs.has_content("f1"));
    assert!(matches!(vfs.read_content("f1"), Err(StoreError::NotFound(_))));

    vfs.write_content("f1", b"hello").unwrap();
    assert!(vfs.has_content("f1"));
    assert_eq!(vfs.read_content("f1").unwrap(), b"hello".to_vec());
}

// ── Change feed ──────────────────────────────────────────────────

#[test]
fn changes_are_ordered_and_deduplicated() {
    use cumulus_store::Change;

    let store = MemoryDocStore::new();
    let a = store.create(DOCTYPE, Document::new("a")).unwrap();
    store.create(DOCTYPE, Document::new("b")).unwrap();
    let a2 = store.update(DOCTYPE, a.with("n", 1)).unwrap();
    store.create("io.cozy.other", Document::new("c")).unwrap();

    let changes = store.changes(DOCTYPE, 0, 10).unwrap();
    let ids: Vec<&str> = changes.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids, vec!["b", "a"]);
    assert_eq!(changes[1].rev, a2.rev.clone().unwrap());

    let after_b: Vec<Change> = store.changes(DOCTYPE, changes[0].seq, 10).unwrap();
    assert_eq!(after_b.len(), 1);
    assert_eq!(after_b[0].id, "a");

    assert_eq!(store.changes(DOCTYPE, 0, 1).unwrap().len(), 1);
}

#[test]
fn revisioned_doc_wire_format() {
    let doc = RevisionedDoc {
        doc: Document::new("x").with("title", "hello"),
        revisions: chain(&["1-aaa", "2-bbb"]),
    };
    let value = serde_json::to_value(&doc).unwrap();
    assert_eq!(
        value,
        serde_json::json!({"_id": "x", "title": "hello", "_revisions": ["1-aaa", "2-bbb"]})
    );
    let back: RevisionedDoc = serde_json::from_value(value).unwrap();
    assert_eq!(back, doc);
}
