use cumulus_sharing::jobs::{JobMessage, MemoryScheduler};
use cumulus_sharing::member::{AccessToken, Member, MemberStatus, OAuthClient};
use cumulus_sharing::protocol::{BulkDocs, RevsDiff};
use cumulus_sharing::rule::{Policy, Rule};
use cumulus_sharing::sharing::Sharing;
use cumulus_sharing::store::{CheckpointKind, SharingStore};
use cumulus_sharing::{SharingConfig, SharingEngine, SharingError};
use cumulus_store::{DocumentStore, MemoryDocStore, MemoryVfs, RevisionedDoc, RevsMap};
use cumulus_types::doctype::FILES;
use cumulus_types::{Document, MemberId};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

struct Harness {
    engine: Arc<SharingEngine>,
    docs: Arc<MemoryDocStore>,
    jobs: Arc<MemoryScheduler>,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn harness() -> Harness {
    init_tracing();
    let docs = Arc::new(MemoryDocStore::new());
    let jobs = Arc::new(MemoryScheduler::new());
    let engine = SharingEngine::new(
        SharingConfig::default(),
        Arc::new(SharingStore::open_in_memory().unwrap()),
        docs.clone(),
        Arc::new(MemoryVfs::new()),
        jobs.clone(),
    )
    .unwrap();
    Harness {
        engine: Arc::new(engine),
        docs,
        jobs,
    }
}

fn tests_rule() -> Rule {
    Rule::new("tests", "io.cozy.tests", vec!["doc1".to_string()]).with_policies(
        Policy::Sync,
        Policy::Sync,
        Policy::Sync,
    )
}

/// Owner-side sharing with two contacts on `instance`, the first of which
/// accepted.
async fn accepted_sharing(h: &Harness, instance: &str, rules: Vec<Rule>) -> (Sharing, MemberId, MemberId) {
    let owner = Member::owner(Some("Alice".to_string()), None, "https://alice.example");
    let mut sharing = Sharing::new("tests", rules, owner);
    let bob = sharing
        .add_contact(Some("Bob".to_string()), None, Some(instance.to_string()))
        .unwrap();
    let carol = sharing
        .add_contact(Some("Carol".to_string()), None, Some(instance.to_string()))
        .unwrap();
    sharing.member_mut(&bob).unwrap().credentials_mut().unwrap().client = Some(OAuthClient {
        client_id: "client-on-bob".to_string(),
        client_secret: "secret".to_string(),
        registration_token: None,
    });
    let sharing = h.engine.create_sharing(sharing).await.unwrap();
    let state = sharing.member(&bob).unwrap().credentials().unwrap().state.clone();
    h.engine
        .accept(&sharing.id, &state, AccessToken::new("token-1", "refresh-1"), "bob-client")
        .await
        .unwrap();
    (h.engine.get_sharing(&sharing.id).unwrap(), bob, carol)
}

// ── Outbound ────────────────────────────────────────────────────

#[tokio::test]
async fn replicate_pushes_to_ready_members_only() {
    let server = MockServer::start().await;
    let h = harness();
    let doc = h.docs.create("io.cozy.tests", Document::new("doc1").with("title", "hello")).unwrap();
    let rev = doc.rev.clone().unwrap();
    let (sharing, bob, carol) = accepted_sharing(&h, &server.uri(), vec![tests_rule()]).await;

    // Carol is invited but has not answered yet.
    Mock::given(method("PUT"))
        .and(path(format!("/sharings/{}", sharing.id)))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    assert_eq!(h.engine.send_invitations(&sharing.id).await.unwrap(), 1);
    let sharing = h.engine.get_sharing(&sharing.id).unwrap();
    assert_eq!(sharing.member(&carol).unwrap().status, MemberStatus::Pending);

    Mock::given(method("POST"))
        .and(path(format!("/sharings/{}/_revs_diff", sharing.id)))
        .and(header("authorization", "Bearer token-1"))
        .and(body_partial_json(json!({ "io.cozy.tests": { "doc1": [rev.clone()] } })))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "io.cozy.tests": { "doc1": [rev.clone()] } })),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(format!("/sharings/{}/_bulk_docs", sharing.id)))
        .and(body_partial_json(json!({
            "io.cozy.tests": [{ "_id": "doc1", "_rev": rev.clone(), "title": "hello", "_revisions": [rev.clone()] }]
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let sent = h.engine.replicate(&sharing.id).await.unwrap();
    assert_eq!(sent, 1);

    let checkpoint = h
        .engine
        .store()
        .get_checkpoint(&sharing.id, &bob, CheckpointKind::Replicator)
        .unwrap();
    assert!(checkpoint > 0);
    assert_eq!(
        h.engine
            .store()
            .get_checkpoint(&sharing.id, &carol, CheckpointKind::Replicator)
            .unwrap(),
        0
    );
}

#[tokio::test]
async fn nothing_missing_means_no_push() {
    let server = MockServer::start().await;
    let h = harness();
    h.docs.create("io.cozy.tests", Document::new("doc1")).unwrap();
    let (sharing, _, _) = accepted_sharing(&h, &server.uri(), vec![tests_rule()]).await;

    Mock::given(method("POST"))
        .and(path(format!("/sharings/{}/_revs_diff", sharing.id)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(format!("/sharings/{}/_bulk_docs", sharing.id)))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    assert_eq!(h.engine.replicate(&sharing.id).await.unwrap(), 0);
    // The checkpoint moved: a second run has nothing to diff.
    assert_eq!(h.engine.replicate(&sharing.id).await.unwrap(), 0);
}

#[tokio::test]
async fn failure_keeps_the_checkpoint_and_reports_the_member() {
    let server = MockServer::start().await;
    let h = harness();
    h.docs.create("io.cozy.tests", Document::new("doc1")).unwrap();
    let (sharing, bob, _) = accepted_sharing(&h, &server.uri(), vec![tests_rule()]).await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let err = h.engine.replicate(&sharing.id).await.unwrap_err();
    assert!(matches!(&err, SharingError::Replication(errors) if errors.len() == 1 && errors[0].0 == bob));
    assert_eq!(
        h.engine
            .store()
            .get_checkpoint(&sharing.id, &bob, CheckpointKind::Replicator)
            .unwrap(),
        0
    );
}

#[tokio::test]
async fn rejected_token_is_refreshed_once() {
    let server = MockServer::start().await;
    let h = harness();
    h.docs.create("io.cozy.tests", Document::new("doc1")).unwrap();
    let (sharing, bob, _) = accepted_sharing(&h, &server.uri(), vec![tests_rule()]).await;

    Mock::given(method("POST"))
        .and(path(format!("/sharings/{}/_revs_diff", sharing.id)))
        .and(header("authorization", "Bearer token-1"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/auth/access_token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "access_token": "token-2" })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(format!("/sharings/{}/_revs_diff", sharing.id)))
        .and(header("authorization", "Bearer token-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&server)
        .await;

    h.engine.replicate(&sharing.id).await.unwrap();

    let stored = h.engine.get_sharing(&sharing.id).unwrap();
    let token = stored.member(&bob).unwrap().credentials().unwrap().access_token.clone().unwrap();
    assert_eq!(token.access_token, "token-2");
    assert_eq!(token.refresh_token, "refresh-1");
}

#[tokio::test]
async fn owner_sends_obfuscated_file_identifiers() {
    let server = MockServer::start().await;
    let h = harness();
    let photos = h
        .docs
        .create(
            FILES,
            Document::new("photos")
                .with("type", "directory")
                .with("name", "photos")
                .with("dir_id", "io.cozy.files.root-dir")
                .with("path", "/photos"),
        )
        .unwrap();
    let files_rule = Rule::new("photos", FILES, vec!["photos".to_string()]).with_policies(
        Policy::Sync,
        Policy::Sync,
        Policy::Sync,
    );
    let (sharing, bob, _) = accepted_sharing(&h, &server.uri(), vec![files_rule]).await;
    let key = sharing.member(&bob).unwrap().credentials().unwrap().xor_key.clone();
    let remote_id = key.apply("photos");
    let rev = photos.rev.clone().unwrap();

    Mock::given(method("POST"))
        .and(path(format!("/sharings/{}/_revs_diff", sharing.id)))
        .respond_with(move |request: &Request| {
            let diff: RevsDiff = serde_json::from_slice(&request.body).unwrap();
            ResponseTemplate::new(200).set_body_json(diff)
        })
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(format!("/sharings/{}/_bulk_docs", sharing.id)))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    assert_eq!(h.engine.replicate(&sharing.id).await.unwrap(), 1);

    let requests = server.received_requests().await.unwrap();
    let bulk = requests
        .iter()
        .find(|r| r.url.path().ends_with("/_bulk_docs"))
        .unwrap();
    let docs: BulkDocs = serde_json::from_slice(&bulk.body).unwrap();
    let sent = &docs[FILES][0];
    assert_eq!(sent.doc.id, remote_id);
    assert_eq!(sent.doc.get("dir_id"), None, "the sharing root loses its parent");
    assert_eq!(sent.doc.get("path"), None);
    assert_eq!(sent.revisions, vec![rev]);
}

// ── Inbound ─────────────────────────────────────────────────────

fn revisioned(id: &str, chain: &[&str], title: &str) -> RevisionedDoc {
    let mut doc = Document::new(id).with("title", title);
    doc.rev = chain.last().map(|r| r.to_string());
    RevisionedDoc {
        doc,
        revisions: chain.iter().map(|r| r.to_string()).collect(),
    }
}

#[tokio::test]
async fn revs_diff_reports_unknown_revisions() {
    let h = harness();
    let (sharing, bob, _) = accepted_sharing(&h, "http://127.0.0.1:9", vec![tests_rule()]).await;
    h.docs
        .bulk_force_write("io.cozy.tests", vec![revisioned("doc1", &["1-aaa"], "v1")])
        .unwrap();

    let request = RevsDiff::from([(
        "io.cozy.tests".to_string(),
        RevsMap::from([
            ("doc1".to_string(), vec!["1-aaa".to_string(), "2-bbb".to_string()]),
            ("doc9".to_string(), vec!["1-zzz".to_string()]),
        ]),
    )]);
    let missing = h.engine.handle_revs_diff(&sharing, &bob, &request).unwrap();
    assert_eq!(
        missing["io.cozy.tests"],
        RevsMap::from([
            ("doc1".to_string(), vec!["2-bbb".to_string()]),
            ("doc9".to_string(), vec!["1-zzz".to_string()]),
        ])
    );

    let other = RevsDiff::from([("io.cozy.secrets".to_string(), RevsMap::new())]);
    assert!(matches!(
        h.engine.handle_revs_diff(&sharing, &bob, &other),
        Err(SharingError::InvalidSharing(_))
    ));
}

#[tokio::test]
async fn continuation_is_written() {
    let h = harness();
    let (sharing, bob, _) = accepted_sharing(&h, "http://127.0.0.1:9", vec![tests_rule()]).await;
    h.docs
        .bulk_force_write("io.cozy.tests", vec![revisioned("doc1", &["1-aaa"], "v1")])
        .unwrap();
    h.jobs.take();

    let docs = BulkDocs::from([(
        "io.cozy.tests".to_string(),
        vec![revisioned("doc1", &["1-aaa", "2-bbb"], "v2")],
    )]);
    assert_eq!(h.engine.apply_bulk_docs(&sharing, &bob, docs).await.unwrap(), 1);

    let current = h.docs.get("io.cozy.tests", "doc1").unwrap().unwrap();
    assert_eq!(current.rev.as_deref(), Some("2-bbb"));
    assert_eq!(current.get_str("title"), Some("v2"));
    let jobs = h.jobs.take();
    assert!(jobs.iter().any(|j| matches!(j.message, JobMessage::Replicate { .. })));
}

#[tokio::test]
async fn newer_incoming_branch_wins_and_adopts_the_local_revision() {
    let h = harness();
    let (sharing, bob, _) = accepted_sharing(&h, "http://127.0.0.1:9", vec![tests_rule()]).await;
    h.docs
        .bulk_force_write("io.cozy.tests", vec![revisioned("doc1", &["1-aaa", "2-bbb"], "local")])
        .unwrap();

    let docs = BulkDocs::from([(
        "io.cozy.tests".to_string(),
        vec![revisioned("doc1", &["1-aaa", "2-ccc", "3-ddd"], "remote")],
    )]);
    h.engine.apply_bulk_docs(&sharing, &bob, docs).await.unwrap();

    let current = h.docs.get_with_revisions("io.cozy.tests", "doc1").unwrap().unwrap();
    assert_eq!(current.doc.get_str("title"), Some("remote"));
    assert_eq!(current.revisions, vec!["1-aaa", "2-bbb", "3-ddd"]);
    assert!(!h.docs.revision_tree("io.cozy.tests", "doc1").unwrap().has_conflicts());
}

#[tokio::test]
async fn stale_incoming_revision_is_ignored() {
    let h = harness();
    let (sharing, bob, _) = accepted_sharing(&h, "http://127.0.0.1:9", vec![tests_rule()]).await;
    h.docs
        .bulk_force_write("io.cozy.tests", vec![revisioned("doc1", &["1-aaa", "2-bbb", "3-ccc"], "local")])
        .unwrap();

    let docs = BulkDocs::from([(
        "io.cozy.tests".to_string(),
        vec![revisioned("doc1", &["1-aaa", "2-zzz"], "remote")],
    )]);
    assert_eq!(h.engine.apply_bulk_docs(&sharing, &bob, docs).await.unwrap(), 0);
    let current = h.docs.get("io.cozy.tests", "doc1").unwrap().unwrap();
    assert_eq!(current.get_str("title"), Some("local"));
}

#[tokio::test]
async fn same_generation_conflict_converges_on_the_greater_revision() {
    let h = harness();
    let (sharing, bob, _) = accepted_sharing(&h, "http://127.0.0.1:9", vec![tests_rule()]).await;
    h.docs
        .bulk_force_write("io.cozy.tests", vec![revisioned("doc1", &["1-aaa", "2-bbb"], "local")])
        .unwrap();

    let greater = BulkDocs::from([(
        "io.cozy.tests".to_string(),
        vec![revisioned("doc1", &["1-aaa", "2-ccc"], "remote")],
    )]);
    h.engine.apply_bulk_docs(&sharing, &bob, greater).await.unwrap();
    let current = h.docs.get("io.cozy.tests", "doc1").unwrap().unwrap();
    assert_eq!(current.rev.as_deref(), Some("2-ccc"));

    let lesser = BulkDocs::from([(
        "io.cozy.tests".to_string(),
        vec![revisioned("doc1", &["1-aaa", "2-abc"], "older")],
    )]);
    assert_eq!(h.engine.apply_bulk_docs(&sharing, &bob, lesser).await.unwrap(), 0);
    let current = h.docs.get("io.cozy.tests", "doc1").unwrap().unwrap();
    assert_eq!(current.rev.as_deref(), Some("2-ccc"));
}

#[tokio::test]
async fn owner_only_accepts_new_documents_its_rules_select() {
    let h = harness();
    let (sharing, bob, _) = accepted_sharing(&h, "http://127.0.0.1:9", vec![tests_rule()]).await;

    let docs = BulkDocs::from([(
        "io.cozy.tests".to_string(),
        vec![
            revisioned("doc1", &["1-aaa"], "selected"),
            revisioned("intruder", &["1-bbb"], "not selected"),
        ],
    )]);
    assert_eq!(h.engine.apply_bulk_docs(&sharing, &bob, docs).await.unwrap(), 1);
    assert!(h.docs.get("io.cozy.tests", "doc1").unwrap().is_some());
    assert!(h.docs.get("io.cozy.tests", "intruder").unwrap().is_none());
}

#[tokio::test]
async fn replayed_push_is_a_no_op() {
    let h = harness();
    let (sharing, bob, _) = accepted_sharing(&h, "http://127.0.0.1:9", vec![tests_rule()]).await;
    let docs = BulkDocs::from([(
        "io.cozy.tests".to_string(),
        vec![revisioned("doc1", &["1-aaa", "2-bbb"], "v2")],
    )]);
    assert_eq!(h.engine.apply_bulk_docs(&sharing, &bob, docs.clone()).await.unwrap(), 1);
    assert_eq!(h.engine.apply_bulk_docs(&sharing, &bob, docs).await.unwrap(), 0);
}

#[tokio::test]
async fn owner_of_a_push_only_sharing_refuses_member_writes() {
    let h = harness();
    let push = Rule::new("tests", "io.cozy.tests", vec!["doc1".to_string()]).with_policies(
        Policy::Push,
        Policy::Push,
        Policy::Push,
    );
    let (sharing, bob, _) = accepted_sharing(&h, "http://127.0.0.1:9", vec![push]).await;
    assert!(sharing.read_only());
    h.docs
        .bulk_force_write("io.cozy.tests", vec![revisioned("doc1", &["1-aaa"], "from owner")])
        .unwrap();

    let docs = BulkDocs::from([(
        "io.cozy.tests".to_string(),
        vec![revisioned("doc1", &["1-aaa", "9-ffff"], "overwritten by member")],
    )]);
    assert!(matches!(
        h.engine.apply_bulk_docs(&sharing, &bob, docs).await,
        Err(SharingError::Forbidden(_))
    ));
    let current = h.docs.get("io.cozy.tests", "doc1").unwrap().unwrap();
    assert_eq!(current.get_str("title"), Some("from owner"));
}

#[tokio::test]
async fn owner_skips_changes_the_rule_does_not_synchronize() {
    let h = harness();
    let rule = Rule::new("tests", "io.cozy.tests", vec!["doc1".to_string(), "doc2".to_string()])
        .with_policies(Policy::Sync, Policy::Push, Policy::Push);
    let (sharing, bob, _) = accepted_sharing(&h, "http://127.0.0.1:9", vec![rule]).await;
    h.docs
        .bulk_force_write("io.cozy.tests", vec![revisioned("doc1", &["1-aaa"], "from owner")])
        .unwrap();

    let docs = BulkDocs::from([(
        "io.cozy.tests".to_string(),
        vec![
            revisioned("doc1", &["1-aaa", "2-bbb"], "edited by member"),
            revisioned("doc2", &["1-ccc"], "created by member"),
        ],
    )]);
    assert_eq!(h.engine.apply_bulk_docs(&sharing, &bob, docs).await.unwrap(), 1);
    let doc1 = h.docs.get("io.cozy.tests", "doc1").unwrap().unwrap();
    assert_eq!(doc1.get_str("title"), Some("from owner"));
    let doc2 = h.docs.get("io.cozy.tests", "doc2").unwrap().unwrap();
    assert_eq!(doc2.get_str("title"), Some("created by member"));
}
