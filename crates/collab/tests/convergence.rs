//! End-to-end convergence across session channels.

use std::sync::Arc;
use std::time::Duration;

use collab::{LocalHub, RoomId, RoomTransport, SessionChannel};
use coscribe_core::SyncSettings;
use crdt::{Document, ReplicaId};

fn fast_settings() -> SyncSettings {
    let mut settings = SyncSettings::default();
    settings.reconnect.base_ms = 10;
    settings.reconnect.cap_ms = 50;
    settings.sync_timeout_ms = 200;
    settings
}

async fn converged(a: &Document, b: &Document) -> bool {
    for _ in 0..50 {
        let left = a.to_text().unwrap();
        if !left.is_empty() && left == b.to_text().unwrap() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    a.to_text().unwrap() == b.to_text().unwrap()
}

#[tokio::test]
async fn test_concurrent_inserts_from_two_clients_converge() {
    let hub = Arc::new(LocalHub::new());
    let room = RoomId::derive("p1", "main", "src/index.ts");

    let doc_a = Arc::new(Document::new(ReplicaId::from_u64(1)));
    let doc_b = Arc::new(Document::new(ReplicaId::from_u64(2)));

    // Both clients edit before either has seen the other.
    doc_a.insert(0, "const x=1;").unwrap();
    doc_b.insert(0, "// header\n").unwrap();

    let a = SessionChannel::connect(
        Arc::clone(&hub) as Arc<dyn RoomTransport>,
        room.clone(),
        Arc::clone(&doc_a),
        fast_settings(),
    );
    a.wait_synced().await.unwrap();

    let b = SessionChannel::connect(
        Arc::clone(&hub) as Arc<dyn RoomTransport>,
        room,
        Arc::clone(&doc_b),
        fast_settings(),
    );
    b.wait_synced().await.unwrap();

    assert!(converged(&doc_a, &doc_b).await);
    let text = doc_a.to_text().unwrap();
    assert!(text.contains("const x=1;"));
    assert!(text.contains("// header\n"));
    assert_eq!(text.len(), "const x=1;// header\n".len());

    a.disconnect();
    b.disconnect();
}

#[tokio::test]
async fn test_edits_during_link_loss_are_buffered_and_flushed() {
    let hub = Arc::new(LocalHub::new());
    let room = RoomId::derive("p1", "main", "src/lib.rs");

    let doc_a = Arc::new(Document::new(ReplicaId::from_u64(1)));
    let doc_b = Arc::new(Document::new(ReplicaId::from_u64(2)));

    let a = SessionChannel::connect(
        Arc::clone(&hub) as Arc<dyn RoomTransport>,
        room.clone(),
        Arc::clone(&doc_a),
        fast_settings(),
    );
    a.wait_synced().await.unwrap();
    let b = SessionChannel::connect(
        Arc::clone(&hub) as Arc<dyn RoomTransport>,
        room.clone(),
        Arc::clone(&doc_b),
        fast_settings(),
    );
    b.wait_synced().await.unwrap();

    doc_a.insert(0, "fn main() {}").unwrap();
    assert!(converged(&doc_a, &doc_b).await);

    // Kill a's link. Edits on both sides continue.
    hub.sever(&room, doc_a.replica());
    tokio::time::sleep(Duration::from_millis(50)).await;

    doc_a.insert(12, "\n// from a").unwrap();
    doc_b.insert(12, "\n// from b").unwrap();

    // Local edits applied immediately, peers unaware for now.
    assert!(doc_a.to_text().unwrap().contains("// from a"));
    assert!(!doc_a.to_text().unwrap().contains("// from b"));

    // a reconnects on its own; both sides reconcile.
    assert!(converged(&doc_a, &doc_b).await);
    let text = doc_a.to_text().unwrap();
    assert!(text.contains("// from a"));
    assert!(text.contains("// from b"));

    a.disconnect();
    b.disconnect();
}

#[tokio::test]
async fn test_three_clients_converge() {
    let hub = Arc::new(LocalHub::new());
    let room = RoomId::derive("p1", "main", "notes.md");

    let docs: Vec<Arc<Document>> = (1..=3)
        .map(|id| Arc::new(Document::new(ReplicaId::from_u64(id))))
        .collect();

    let mut sessions = Vec::new();
    for doc in &docs {
        let session = SessionChannel::connect(
            Arc::clone(&hub) as Arc<dyn RoomTransport>,
            room.clone(),
            Arc::clone(doc),
            fast_settings(),
        );
        session.wait_synced().await.unwrap();
        sessions.push(session);
    }

    docs[0].insert(0, "alpha ").unwrap();
    docs[1].insert(0, "beta ").unwrap();
    docs[2].insert(0, "gamma ").unwrap();

    assert!(converged(&docs[0], &docs[1]).await);
    assert!(converged(&docs[1], &docs[2]).await);

    for session in &sessions {
        session.disconnect();
    }
}
