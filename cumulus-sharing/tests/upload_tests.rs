use cumulus_sharing::jobs::{JobMessage, MemoryScheduler};
use cumulus_sharing::member::{AccessToken, Member};
use cumulus_sharing::protocol::SharingRequest;
use cumulus_sharing::rule::{Policy, Rule};
use cumulus_sharing::sharing::Sharing;
use cumulus_sharing::store::{CheckpointKind, SharingStore};
use cumulus_sharing::xor::conflict_id;
use cumulus_sharing::{SharingConfig, SharingEngine, SharingError};
use cumulus_store::{DocumentStore, MemoryDocStore, MemoryVfs, RevisionedDoc, Vfs};
use cumulus_types::doctype::FILES;
use cumulus_types::{Document, MemberId};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;
use wiremock::matchers::{body_partial_json, body_string, header, method, path, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct Harness {
    engine: Arc<SharingEngine>,
    docs: Arc<MemoryDocStore>,
    vfs: Arc<MemoryVfs>,
    jobs: Arc<MemoryScheduler>,
}

fn harness() -> Harness {
    let docs = Arc::new(MemoryDocStore::new());
    let vfs = Arc::new(MemoryVfs::new());
    let jobs = Arc::new(MemoryScheduler::new());
    let engine = SharingEngine::new(
        SharingConfig::default(),
        Arc::new(SharingStore::open_in_memory().unwrap()),
        docs.clone(),
        vfs.clone(),
        jobs.clone(),
    )
    .unwrap();
    Harness {
        engine: Arc::new(engine),
        docs,
        vfs,
        jobs,
    }
}

fn files_rule() -> Rule {
    Rule::new("shared folder", FILES, vec!["shared".to_string()]).with_policies(
        Policy::Sync,
        Policy::Sync,
        Policy::Sync,
    )
}

fn directory(id: &str, parent: &str) -> Document {
    Document::new(id)
        .with("type", "directory")
        .with("name", id)
        .with("dir_id", parent)
        .with("path", format!("/{id}"))
}

fn file(id: &str, parent: &str, md5: &str) -> Document {
    Document::new(id)
        .with("type", "file")
        .with("name", format!("{id}.pdf"))
        .with("dir_id", parent)
        .with("md5sum", md5)
}

fn revisioned(doc: Document, chain: &[&str]) -> RevisionedDoc {
    let mut doc = doc;
    doc.rev = chain.last().map(|r| r.to_string());
    RevisionedDoc {
        doc,
        revisions: chain.iter().map(|r| r.to_string()).collect(),
    }
}

/// Owner-side files sharing with one accepted recipient.
async fn owner_sharing(h: &Harness, instance: &str) -> (Sharing, MemberId) {
    owner_sharing_with(h, instance, files_rule()).await
}

async fn owner_sharing_with(h: &Harness, instance: &str, rule: Rule) -> (Sharing, MemberId) {
    let owner = Member::owner(Some("Alice".to_string()), None, "https://alice.example");
    let mut sharing = Sharing::new("files", vec![rule], owner);
    let bob = sharing
        .add_contact(Some("Bob".to_string()), None, Some(instance.to_string()))
        .unwrap();
    sharing.add_contact(Some("Carol".to_string()), None, None).unwrap();
    let sharing = h.engine.create_sharing(sharing).await.unwrap();
    let state = sharing.member(&bob).unwrap().credentials().unwrap().state.clone();
    h.engine
        .accept(&sharing.id, &state, AccessToken::new("token-1", "refresh-1"), "bob-client")
        .await
        .unwrap();
    (h.engine.get_sharing(&sharing.id).unwrap(), bob)
}

/// Recipient-side files sharing, activated. Returns the owner's member id.
async fn recipient_sharing(h: &Harness) -> (Sharing, MemberId) {
    let owner = Member::owner(Some("Alice".to_string()), None, "https://alice.example");
    let owner_id = owner.id;
    let mut remote = Sharing::new("files", vec![files_rule()], owner);
    let me = remote.add_contact(Some("Bob".to_string()), None, None).unwrap();
    let request = SharingRequest::for_member(&remote, &me).unwrap();
    let received = h.engine.receive_request(request).await.unwrap();
    h.engine
        .activate(&received.id, AccessToken::new("to-owner", "r"), "owner-client")
        .await
        .unwrap();
    (h.engine.get_sharing(&received.id).unwrap(), owner_id)
}

// ── Sending ─────────────────────────────────────────────────────

#[tokio::test]
async fn upload_sends_metadata_then_requested_content() {
    let server = MockServer::start().await;
    let h = harness();
    h.docs.create(FILES, directory("shared", "io.cozy.files.root-dir")).unwrap();
    h.docs.create(FILES, file("report", "shared", "m1")).unwrap();
    h.vfs.write_content("report", b"quarterly numbers").unwrap();
    let (sharing, bob) = owner_sharing(&h, &server.uri()).await;
    let key = sharing.member(&bob).unwrap().credentials().unwrap().xor_key.clone();
    let remote_id = key.apply("report");

    Mock::given(method("PUT"))
        .and(path(format!("/sharings/{}/io.cozy.files/{}/metadata", sharing.id, remote_id)))
        .and(header("authorization", "Bearer token-1"))
        .and(body_partial_json(json!({
            "_id": remote_id.clone(),
            "dir_id": key.apply("shared"),
            "name": "report.pdf",
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "key": "upload-1" })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path(format!("/sharings/{}/io.cozy.files/upload-1", sharing.id)))
        .and(header("content-type", "application/octet-stream"))
        .and(body_string("quarterly numbers"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    assert_eq!(h.engine.upload(&sharing.id).await.unwrap(), 1);
    assert!(
        h.engine
            .store()
            .get_checkpoint(&sharing.id, &bob, CheckpointKind::Upload)
            .unwrap()
            > 0
    );
}

#[tokio::test]
async fn content_is_skipped_when_the_member_has_it() {
    let server = MockServer::start().await;
    let h = harness();
    h.docs.create(FILES, directory("shared", "io.cozy.files.root-dir")).unwrap();
    h.docs.create(FILES, file("report", "shared", "m1")).unwrap();
    let (sharing, _) = owner_sharing(&h, &server.uri()).await;

    Mock::given(method("PUT"))
        .and(path_regex(r"/metadata$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&server)
        .await;

    assert_eq!(h.engine.upload(&sharing.id).await.unwrap(), 1);
    // Only the metadata call was made; content was never read.
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

// ── Receiving ───────────────────────────────────────────────────

#[tokio::test]
async fn recipient_asks_for_missing_content() {
    let h = harness();
    let (sharing, owner) = recipient_sharing(&h).await;

    let incoming = revisioned(file("report", "shared", "m1"), &["1-abc"]);
    let response = h
        .engine
        .receive_file_metadata(&sharing, &owner, incoming)
        .await
        .unwrap();
    let key = response.key.unwrap();
    assert!(h.docs.get(FILES, "report").unwrap().is_none(), "nothing is written before the content");

    h.engine
        .receive_file_content(&sharing, &owner, &key, b"quarterly numbers")
        .await
        .unwrap();
    let written = h.docs.get(FILES, "report").unwrap().unwrap();
    assert_eq!(written.rev.as_deref(), Some("1-abc"));
    assert_eq!(h.vfs.read_content("report").unwrap(), b"quarterly numbers".to_vec());

    // Keys are single use.
    assert!(matches!(
        h.engine.receive_file_content(&sharing, &owner, &key, b"again").await,
        Err(SharingError::InvalidSharing(_))
    ));
}

#[tokio::test]
async fn known_content_is_written_without_a_key() {
    let h = harness();
    let (sharing, owner) = recipient_sharing(&h).await;
    h.docs
        .bulk_force_write(FILES, vec![revisioned(file("report", "shared", "m1"), &["1-abc"])])
        .unwrap();
    h.vfs.write_content("report", b"same").unwrap();

    let renamed = file("report", "shared", "m1").with("name", "final.pdf");
    let response = h
        .engine
        .receive_file_metadata(&sharing, &owner, revisioned(renamed, &["1-abc", "2-def"]))
        .await
        .unwrap();
    assert_eq!(response.key, None);

    let written = h.docs.get(FILES, "report").unwrap().unwrap();
    assert_eq!(written.rev.as_deref(), Some("2-def"));
    assert_eq!(written.get_str("name"), Some("final.pdf"));
}

#[tokio::test]
async fn diverged_file_is_kept_as_a_renamed_copy() {
    let h = harness();
    let (sharing, owner) = recipient_sharing(&h).await;
    h.docs
        .bulk_force_write(
            FILES,
            vec![revisioned(file("report", "shared", "local-md5"), &["1-abc", "2-bbb", "3-fff"])],
        )
        .unwrap();
    h.vfs.write_content("report", b"local edit").unwrap();

    let incoming = revisioned(file("report", "shared", "remote-md5"), &["1-abc", "2-ddd"]);
    let response = h
        .engine
        .receive_file_metadata(&sharing, &owner, incoming)
        .await
        .unwrap();
    let key = response.key.unwrap();
    h.engine
        .receive_file_content(&sharing, &owner, &key, b"remote edit")
        .await
        .unwrap();

    let original = h.docs.get(FILES, "report").unwrap().unwrap();
    assert_eq!(original.rev.as_deref(), Some("3-fff"));
    assert_eq!(h.vfs.read_content("report").unwrap(), b"local edit".to_vec());

    let copy_id = conflict_id("report", "2-ddd");
    let copy = h.docs.get(FILES, &copy_id).unwrap().unwrap();
    assert_eq!(copy.get_str("name"), Some("report (ddd).pdf"));
    assert_eq!(h.vfs.read_content(&copy_id).unwrap(), b"remote edit".to_vec());
}

#[tokio::test]
async fn stale_identical_file_is_ignored() {
    let h = harness();
    let (sharing, owner) = recipient_sharing(&h).await;
    h.docs
        .bulk_force_write(FILES, vec![revisioned(file("report", "shared", "m1"), &["1-abc", "2-ccc", "3-fff"])])
        .unwrap();

    let incoming = revisioned(file("report", "shared", "m1"), &["1-abc", "2-ddd"]);
    let response = h
        .engine
        .receive_file_metadata(&sharing, &owner, incoming)
        .await
        .unwrap();
    assert_eq!(response.key, None);
    assert_eq!(h.docs.count(FILES), 1);
}

#[tokio::test]
async fn owner_maps_received_files_back_and_forwards_them() {
    let h = harness();
    h.docs.create(FILES, directory("shared", "io.cozy.files.root-dir")).unwrap();
    let (sharing, bob) = owner_sharing(&h, "http://127.0.0.1:9").await;
    h.jobs.take();
    let key = sharing.member(&bob).unwrap().credentials().unwrap().xor_key.clone();

    let incoming = revisioned(
        file(&key.apply("newfile"), &key.apply("shared"), "m1").with("name", "newfile.pdf"),
        &["1-abc"],
    );
    let response = h
        .engine
        .receive_file_metadata(&sharing, &bob, incoming)
        .await
        .unwrap();
    let upload_key = response.key.unwrap();
    h.engine
        .receive_file_content(&sharing, &bob, &upload_key, b"from bob")
        .await
        .unwrap();

    let written = h.docs.get(FILES, "newfile").unwrap().unwrap();
    assert_eq!(written.get_str("dir_id"), Some("shared"));
    assert_eq!(h.vfs.read_content("newfile").unwrap(), b"from bob".to_vec());
    let jobs = h.jobs.take();
    assert!(jobs.iter().any(|j| matches!(j.message, JobMessage::Upload { .. })));
}

#[tokio::test]
async fn owner_of_a_push_only_folder_refuses_files_from_members() {
    let h = harness();
    h.docs.create(FILES, directory("shared", "io.cozy.files.root-dir")).unwrap();
    let push = Rule::new("shared folder", FILES, vec!["shared".to_string()]).with_policies(
        Policy::Push,
        Policy::Push,
        Policy::Push,
    );
    let (sharing, bob) = owner_sharing_with(&h, "http://127.0.0.1:9", push).await;
    assert!(sharing.read_only());
    let key = sharing.member(&bob).unwrap().credentials().unwrap().xor_key.clone();

    let incoming = revisioned(
        file(&key.apply("newfile"), &key.apply("shared"), "m1").with("name", "newfile.pdf"),
        &["1-abc"],
    );
    assert!(matches!(
        h.engine.receive_file_metadata(&sharing, &bob, incoming).await,
        Err(SharingError::Forbidden(_))
    ));
    assert!(h.docs.get(FILES, "newfile").unwrap().is_none());
}

#[tokio::test]
async fn owner_refuses_file_updates_its_rule_only_pushes() {
    let h = harness();
    h.docs.create(FILES, directory("shared", "io.cozy.files.root-dir")).unwrap();
    let report = h.docs.create(FILES, file("report", "shared", "m1")).unwrap();
    let rule = Rule::new("shared folder", FILES, vec!["shared".to_string()]).with_policies(
        Policy::Sync,
        Policy::Push,
        Policy::Push,
    );
    let (sharing, bob) = owner_sharing_with(&h, "http://127.0.0.1:9", rule).await;
    let key = sharing.member(&bob).unwrap().credentials().unwrap().xor_key.clone();
    let local_rev = report.rev.clone().unwrap();

    let incoming = revisioned(
        file(&key.apply("report"), &key.apply("shared"), "m2"),
        &[local_rev.as_str(), "9-ffff"],
    );
    assert!(matches!(
        h.engine.receive_file_metadata(&sharing, &bob, incoming).await,
        Err(SharingError::Forbidden(_))
    ));
    let current = h.docs.get(FILES, "report").unwrap().unwrap();
    assert_eq!(current.rev, Some(local_rev));
    assert_eq!(current.get_str("md5sum"), Some("m1"));
}

#[tokio::test]
async fn upload_key_belongs_to_the_member_it_was_given_to() {
    let h = harness();
    let (sharing, owner) = recipient_sharing(&h).await;
    let response = h
        .engine
        .receive_file_metadata(&sharing, &owner, revisioned(file("report", "shared", "m1"), &["1-abc"]))
        .await
        .unwrap();
    let key = response.key.unwrap();
    assert!(
        h.engine
            .receive_file_content(&sharing, &MemberId::new(), &key, b"x")
            .await
            .is_err()
    );
}
