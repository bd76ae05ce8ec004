//! Tests for `src/registry.rs` and `src/db.rs`: known-sender persistence.

use std::sync::Arc;

use chrono::Utc;

use moltbot_watcher::db::StateDb;
use moltbot_watcher::registry::SenderRegistry;

#[test]
fn in_memory_registry_grows_monotonically() {
    let registry = SenderRegistry::in_memory();
    assert!(registry.is_empty());

    assert!(registry.lookup_or_insert("telegram", "alice"));
    assert!(!registry.lookup_or_insert("telegram", "alice"));
    assert!(registry.lookup_or_insert("whatsapp", "alice"));

    assert_eq!(registry.len(), 2);
    assert!(registry.contains("telegram", "alice"));
    assert!(!registry.contains("telegram", "bob"));
}

#[tokio::test]
async fn insert_sender_reports_new_rows_only() {
    let dir = tempfile::tempdir().expect("temp dir");
    let db = StateDb::open(&dir.path().join("state.db")).await.expect("open db");

    assert!(db.insert_sender("telegram", "alice", Utc::now()).await.expect("insert"));
    assert!(!db.insert_sender("telegram", "alice", Utc::now()).await.expect("insert"));

    let senders = db.load_senders().await.expect("load");
    assert_eq!(senders, vec![("telegram".to_owned(), "alice".to_owned())]);
    db.close().await;
}

#[tokio::test]
async fn persistent_registry_survives_restart() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("nested").join("state.db");

    {
        let db = Arc::new(StateDb::open(&path).await.expect("open db"));
        let registry = SenderRegistry::persistent(Arc::clone(&db))
            .await
            .expect("load registry");
        assert!(registry.observe("telegram", "alice", Utc::now()).await);
        assert!(registry.observe("telegram", "bob", Utc::now()).await);
        db.close().await;
    }

    let db = Arc::new(StateDb::open(&path).await.expect("reopen db"));
    let registry = SenderRegistry::persistent(Arc::clone(&db))
        .await
        .expect("reload registry");
    assert_eq!(registry.len(), 2);
    assert!(!registry.observe("telegram", "alice", Utc::now()).await);
    assert!(registry.observe("telegram", "carol", Utc::now()).await);
    db.close().await;
}
