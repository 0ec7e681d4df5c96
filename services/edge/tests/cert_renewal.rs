
use std::sync::Arc;

use harness::{make_cert, tls_handshake, write_domain, EdgeHandle};
use tollgate_edge::certs::{CERTIFICATE_CHAIN_FILE, PRIVATE_KEY_FILE};
use tollgate_edge::renewal::{CommandTool, RenewalOutcome, RenewalScheduler, RenewalState};
use tollgate_edge::RenewalError;

/// A tool that copies staged files over the live ones, then exits with `status`.
fn copy_tool(staged: &std::path::Path, live: &std::path::Path, status: i32) -> CommandTool {
    let script = format!(
        "cp {staged}/{chain} {staged}/{key} {live}/ && exit {status}",
        staged = staged.display(),
        live = live.display(),
        chain = CERTIFICATE_CHAIN_FILE,
        key = PRIVATE_KEY_FILE,
    );
    CommandTool::new("sh", ["-c".to_string(), script])
}

#[tokio::test]
async fn renewed_certificate_is_served_to_new_handshakes() {
    let live = tempfile::tempdir().unwrap();
    let staged = tempfile::tempdir().unwrap();
    let old = make_cert("example.test");
    let new = make_cert("example.test");
    write_domain(live.path(), "example.test", &old);
    write_domain(staged.path(), "example.test", &new);

    let edge = EdgeHandle::spawn(Vec::new(), live.path(), Some("example.test"), 1)
        .await
        .unwrap();
    assert_eq!(
        tls_handshake(edge.https_addr, "example.test").await.unwrap(),
        old.der
    );

    let tool = copy_tool(
        &staged.path().join("example.test"),
        &live.path().join("example.test"),
        0,
    );
    let scheduler = RenewalScheduler::new(Arc::clone(&edge.store), Arc::new(tool));

    let outcome = scheduler.trigger().await.unwrap();
    assert_eq!(outcome, RenewalOutcome::Renewed { domain_count: 1 });
    assert_eq!(scheduler.state(), RenewalState::Idle);

    assert_eq!(
        tls_handshake(edge.https_addr, "example.test").await.unwrap(),
        new.der
    );
}

#[tokio::test]
async fn failed_renewal_keeps_serving_old_certificate() {
    let live = tempfile::tempdir().unwrap();
    let staged = tempfile::tempdir().unwrap();
    let old = make_cert("example.test");
    write_domain(live.path(), "example.test", &old);
    write_domain(staged.path(), "example.test", &make_cert("example.test"));

    let edge = EdgeHandle::spawn(Vec::new(), live.path(), Some("example.test"), 1)
        .await
        .unwrap();

    // The files change on disk, but the tool reports failure.
    let tool = copy_tool(
        &staged.path().join("example.test"),
        &live.path().join("example.test"),
        2,
    );
    let scheduler = RenewalScheduler::new(Arc::clone(&edge.store), Arc::new(tool));

    let err = scheduler.trigger().await.unwrap_err();
    assert!(matches!(err, RenewalError::ExitStatus { code: Some(2), .. }));

    assert_eq!(
        tls_handshake(edge.https_addr, "example.test").await.unwrap(),
        old.der
    );
}

#[tokio::test]
async fn reload_picks_up_new_domain() {
    let live = tempfile::tempdir().unwrap();
    write_domain(live.path(), "example.test", &make_cert("example.test"));

    let edge = EdgeHandle::spawn(Vec::new(), live.path(), Some("example.test"), 1)
        .await
        .unwrap();

    let added = make_cert("new.example.test");
    write_domain(live.path(), "new.example.test", &added);

    let tool = CommandTool::new("false", Vec::<String>::new());
    let scheduler = RenewalScheduler::new(Arc::clone(&edge.store), Arc::new(tool));

    let outcome = scheduler.reload().await.unwrap();
    assert_eq!(outcome, RenewalOutcome::Reloaded { domain_count: 2 });
    assert_eq!(
        tls_handshake(edge.https_addr, "new.example.test").await.unwrap(),
        added.der
    );
}
