//! End-to-end replication over an in-memory duplex transport.

use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use drift_docs::actor::{DocsHandle, DocsOptions};
use drift_docs::store::memory::MemStore;
use drift_docs::{DocId, RevFlags, RevId};
use drift_repl::{checkpoint_key, Checkpoint, Mode, Replicator, SessionOptions};

fn setup_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn spawn_docs(name: &str) -> DocsHandle {
    DocsHandle::spawn(MemStore::default(), DocsOptions::default(), name)
}

fn doc_id(i: usize) -> DocId {
    format!("doc-{i:04}").parse().unwrap()
}

fn rev_id(i: usize) -> RevId {
    format!("1-{i:08x}").parse().unwrap()
}

async fn put_docs(docs: &DocsHandle, range: std::ops::Range<usize>) {
    for i in range {
        docs.put_revision(
            doc_id(i),
            Some(rev_id(i)),
            None,
            Some(Bytes::from(format!("{{\"i\":{i}}}"))),
            RevFlags::NONE,
            false,
        )
        .await
        .unwrap();
    }
}

async fn wait_for<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..1000 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

async fn assert_converged(a: &DocsHandle, b: &DocsHandle, count: usize) {
    for i in 0..count {
        let mut doc = b
            .get_document(doc_id(i), true)
            .await
            .unwrap()
            .unwrap_or_else(|| panic!("{} missing", doc_id(i)));
        let mut original = a.get_document(doc_id(i), true).await.unwrap().unwrap();
        assert_eq!(doc.rev_id(), original.rev_id(), "winner differs for {}", doc_id(i));
    }
}

async fn read_checkpoint(docs: &DocsHandle, key: &str) -> Option<Checkpoint> {
    let body = docs.get_meta(format!("checkpoint/{key}")).await.unwrap()?;
    Checkpoint::from_json(&body).ok()
}

#[tokio::test]
async fn one_shot_push_converges() {
    setup_logging();
    let docs_a = spawn_docs("a");
    let docs_b = spawn_docs("b");
    put_docs(&docs_a, 0..100).await;

    let (a_io, b_io) = tokio::io::duplex(64 * 1024);
    let options = SessionOptions::pushing(Mode::OneShot)
        .with_checkpoint_save_delay(Duration::from_millis(50));
    let key = checkpoint_key("b", &options);

    let mut a = Replicator::spawn(a_io, "b", docs_a.clone(), options);
    let b = Replicator::spawn(b_io, "a", docs_b.clone(), SessionOptions::passive());

    a.join().await.unwrap();

    assert_eq!(docs_b.last_sequence().await.unwrap(), 100);
    assert_converged(&docs_a, &docs_b, 100).await;

    // The final flush wrote local=100 on this side.
    let checkpoint = read_checkpoint(&docs_a, &key).await.unwrap();
    assert_eq!(checkpoint.local, 100);

    a.stop().await.unwrap();
    b.stop().await.unwrap();
}

#[tokio::test]
async fn continuous_push_follows_new_changes() {
    setup_logging();
    let docs_a = spawn_docs("a");
    let docs_b = spawn_docs("b");
    put_docs(&docs_a, 0..20).await;

    let (a_io, b_io) = tokio::io::duplex(64 * 1024);
    let options = SessionOptions::pushing(Mode::Continuous)
        .with_checkpoint_save_delay(Duration::from_millis(25));
    let key = checkpoint_key("b", &options);

    let a = Replicator::spawn(a_io, "b", docs_a.clone(), options);
    let b = Replicator::spawn(b_io, "a", docs_b.clone(), SessionOptions::passive());

    wait_for("initial backlog", || {
        let docs_b = docs_b.clone();
        async move { docs_b.last_sequence().await.unwrap() == 20 }
    })
    .await;

    // New writes while the session is live get picked up from the feed.
    put_docs(&docs_a, 20..50).await;
    wait_for("live changes", || {
        let docs_b = docs_b.clone();
        async move { docs_b.last_sequence().await.unwrap() == 50 }
    })
    .await;
    assert_converged(&docs_a, &docs_b, 50).await;

    // The debounced checkpointer catches up shortly after.
    wait_for("checkpoint save", || {
        let docs_a = docs_a.clone();
        let key = key.clone();
        async move {
            matches!(
                read_checkpoint(&docs_a, &key).await,
                Some(checkpoint) if checkpoint.local == 50
            )
        }
    })
    .await;

    a.stop().await.unwrap();
    b.stop().await.unwrap();
}

#[tokio::test]
async fn interrupted_push_resumes_from_checkpoint() {
    setup_logging();
    let docs_a = spawn_docs("a");
    let docs_b = spawn_docs("b");
    let options = SessionOptions::pushing(Mode::OneShot)
        .with_checkpoint_save_delay(Duration::from_millis(50));
    let key = checkpoint_key("b", &options);

    // First half, then the connection goes away.
    put_docs(&docs_a, 0..50).await;
    {
        let (a_io, b_io) = tokio::io::duplex(64 * 1024);
        let mut a = Replicator::spawn(a_io, "b", docs_a.clone(), options.clone());
        let b = Replicator::spawn(b_io, "a", docs_b.clone(), SessionOptions::passive());
        a.join().await.unwrap();
        a.stop().await.unwrap();
        b.stop().await.unwrap();
    }
    assert_eq!(read_checkpoint(&docs_a, &key).await.unwrap().local, 50);
    assert_eq!(docs_b.last_sequence().await.unwrap(), 50);

    // Second half on a fresh connection resumes at 51; nothing is re-sent,
    // so the passive side stores exactly 50 more sequences.
    put_docs(&docs_a, 50..100).await;
    {
        let (a_io, b_io) = tokio::io::duplex(64 * 1024);
        let mut a = Replicator::spawn(a_io, "b", docs_a.clone(), options.clone());
        let b = Replicator::spawn(b_io, "a", docs_b.clone(), SessionOptions::passive());
        a.join().await.unwrap();
        a.stop().await.unwrap();
        b.stop().await.unwrap();
    }

    assert_eq!(docs_b.last_sequence().await.unwrap(), 100);
    assert_converged(&docs_a, &docs_b, 100).await;
    assert_eq!(read_checkpoint(&docs_a, &key).await.unwrap().local, 100);
}

#[tokio::test]
async fn one_shot_pull_converges() {
    setup_logging();
    let docs_a = spawn_docs("a");
    let docs_b = spawn_docs("b");
    put_docs(&docs_a, 0..30).await;

    let (a_io, b_io) = tokio::io::duplex(64 * 1024);
    let options = SessionOptions::pulling(Mode::OneShot)
        .with_checkpoint_save_delay(Duration::from_millis(50));
    let key = checkpoint_key("a", &options);

    let a = Replicator::spawn(a_io, "b", docs_a.clone(), SessionOptions::passive());
    let mut b = Replicator::spawn(b_io, "a", docs_b.clone(), options);

    b.join().await.unwrap();

    assert_eq!(docs_b.last_sequence().await.unwrap(), 30);
    assert_converged(&docs_a, &docs_b, 30).await;

    // The puller tracked the peer's sequences.
    let checkpoint = read_checkpoint(&docs_b, &key).await.unwrap();
    assert_eq!(checkpoint.remote, 30);

    b.stop().await.unwrap();
    a.stop().await.unwrap();
}

#[tokio::test]
async fn push_deletes_and_updates() {
    setup_logging();
    let docs_a = spawn_docs("a");
    let docs_b = spawn_docs("b");
    put_docs(&docs_a, 0..5).await;
    // Update one document and tombstone another.
    docs_a
        .put_revision(
            doc_id(0),
            None,
            Some(rev_id(0)),
            Some(Bytes::from_static(b"{\"v\":2}")),
            RevFlags::NONE,
            false,
        )
        .await
        .unwrap();
    docs_a
        .put_revision(
            doc_id(1),
            None,
            Some(rev_id(1)),
            None,
            RevFlags::DELETED,
            false,
        )
        .await
        .unwrap();

    let (a_io, b_io) = tokio::io::duplex(64 * 1024);
    let mut a = Replicator::spawn(
        a_io,
        "b",
        docs_a.clone(),
        SessionOptions::pushing(Mode::OneShot),
    );
    let b = Replicator::spawn(b_io, "a", docs_b.clone(), SessionOptions::passive());
    a.join().await.unwrap();

    assert_converged(&docs_a, &docs_b, 5).await;
    let mut tombstoned = docs_b.get_document(doc_id(1), true).await.unwrap().unwrap();
    assert_eq!(tombstoned.rev_id().unwrap().gen(), 2);
    assert!(tombstoned
        .flags()
        .contains(drift_docs::DocFlags::DELETED));

    a.stop().await.unwrap();
    b.stop().await.unwrap();
}
