//! Persistence integration tests.
//!
//! Verifies:
//! - Documents, conflicts and warnings survive a RocksDB reopen
//! - A restarted server recovers unresolved conflicts and can resolve them
//! - External edits under a filesystem store reach subscribers via polling

use specboard_sync::api::SyncApi;
use specboard_sync::config::{ServerConfig, WatcherConfig};
use specboard_sync::conflict::{Conflict, ConflictType, Resolution, ResolveRequest};
use specboard_sync::protocol::{ChangeEvent, DocumentType, FileChangeKind};
use specboard_sync::server::SyncServer;
use specboard_sync::storage::{
    ConflictStore, DocumentStore, FsDocumentStore, MemoryConflictStore, RocksStore, StoreConfig,
};
use specboard_sync::watcher::{ManualChangeSource, PollingWatcher};

use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn rocks_server(store: Arc<RocksStore>) -> SyncServer {
    SyncServer::new(
        ServerConfig::default(),
        store.clone(),
        store,
        Arc::new(ManualChangeSource::new()),
    )
}

fn sample_conflict() -> Conflict {
    Conflict::new(
        "alpha",
        DocumentType::Tasks,
        "- [x] one\n- [ ] two",
        "- [ ] one\n- [ ] two\n- [ ] three",
        Some("- [ ] one\n- [ ] two".into()),
        100,
        200,
        ConflictType::SimultaneousEdit,
    )
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[test]
fn test_documents_survive_reopen() {
    let dir = tempdir().unwrap();
    let config = StoreConfig::for_testing(dir.path().join("db"));

    {
        let store = RocksStore::open(config.clone()).unwrap();
        store.write("alpha", DocumentType::Design, "# Design\n\nv1").unwrap();
        store.write("alpha", DocumentType::Design, "# Design\n\nv2").unwrap();
        store.write("beta", DocumentType::Design, "# Other").unwrap();
    }

    let store = RocksStore::open(config).unwrap();
    assert_eq!(
        store.read("alpha", DocumentType::Design).unwrap().as_deref(),
        Some("# Design\n\nv2")
    );
    assert_eq!(store.read("beta", DocumentType::Design).unwrap().as_deref(), Some("# Other"));
    assert_eq!(store.read("alpha", DocumentType::Tasks).unwrap(), None);
}

#[test]
fn test_conflicts_and_warnings_survive_reopen() {
    let dir = tempdir().unwrap();
    let config = StoreConfig::for_testing(dir.path().join("db"));
    let conflict = sample_conflict();

    {
        let store = Arc::new(RocksStore::open(config.clone()).unwrap());
        let server = rocks_server(store);
        server.conflicts().record(&conflict).unwrap();
        server
            .conflicts()
            .raise_integrity_warning("alpha", "alpha/config.json", vec!["invalid JSON".into()], Vec::new())
            .unwrap();
    }

    let store = Arc::new(RocksStore::open(config).unwrap());
    assert_eq!(store.list_conflicts("alpha").unwrap(), vec![conflict.clone()]);
    assert_eq!(store.list_warnings("alpha").unwrap().len(), 1);

    let server = rocks_server(store);
    assert_eq!(server.recover().unwrap(), (1, 1));
}

#[tokio::test]
async fn test_resolve_after_restart() {
    let dir = tempdir().unwrap();
    let config = StoreConfig::for_testing(dir.path().join("db"));
    let conflict = sample_conflict();

    {
        let store = Arc::new(RocksStore::open(config.clone()).unwrap());
        rocks_server(store).record_conflict(&conflict).await.unwrap();
    }

    {
        let store = Arc::new(RocksStore::open(config.clone()).unwrap());
        let server = rocks_server(store);
        let preview = server.merge_preview(conflict.id).await.unwrap();
        assert!(preview.success);
        assert_eq!(preview.merged_content, "- [x] one\n- [ ] two\n- [ ] three");

        let outcome = server
            .resolve_conflict(&ResolveRequest {
                conflict_id: conflict.id,
                resolution: Resolution::Merge,
                manual_content: None,
                resolved_by: "restarted".into(),
            })
            .await
            .unwrap();
        assert_eq!(outcome.content, preview.merged_content);
    }

    let store = RocksStore::open(config).unwrap();
    assert!(store.list_conflicts("alpha").unwrap().is_empty());
    assert_eq!(
        store.read("alpha", DocumentType::Tasks).unwrap().as_deref(),
        Some("- [x] one\n- [ ] two\n- [ ] three")
    );
    assert_eq!(store.counts().unwrap(), (0, 0));
}

#[tokio::test]
async fn test_polling_watcher_reports_external_edits() {
    let dir = tempdir().unwrap();
    let documents = Arc::new(FsDocumentStore::new(dir.path()));
    documents.write("alpha", DocumentType::Tasks, "- [ ] one").unwrap();

    let watcher = PollingWatcher::new(
        documents.clone(),
        WatcherConfig {
            poll_interval: Duration::from_millis(20),
        },
    );
    let server = SyncServer::new(
        ServerConfig::default(),
        documents.clone(),
        Arc::new(MemoryConflictStore::new()),
        Arc::new(watcher),
    );

    let mut subscription = server.subscribe("alpha").await.unwrap();
    assert!(matches!(
        subscription.next().await,
        Some(Ok(ChangeEvent::Connected { .. }))
    ));
    assert!(server.watcher_status("alpha").await.unwrap());

    // Edited outside the engine
    std::fs::write(documents.document_path("alpha", DocumentType::Tasks), "- [x] one").unwrap();

    let event = tokio::time::timeout(Duration::from_secs(2), subscription.next())
        .await
        .expect("edit not detected")
        .expect("stream ended")
        .unwrap();
    match event {
        ChangeEvent::FileChanged { relative_path, kind, .. } => {
            assert_eq!(relative_path, "tasks.md");
            assert_eq!(kind, FileChangeKind::Modified);
        }
        other => panic!("expected fileChanged, got {other:?}"),
    }
    let event = subscription.next().await.unwrap().unwrap();
    assert!(matches!(
        event,
        ChangeEvent::DocumentChanged { document_type: DocumentType::Tasks, .. }
    ));
    assert_eq!(server.fetch_document("alpha", DocumentType::Tasks).await.unwrap(), "- [x] one");

    // Writes through the server are observed by the watcher, not announced twice
    server
        .save_document("alpha", DocumentType::Design, "# Design")
        .await
        .unwrap();
    let event = tokio::time::timeout(Duration::from_secs(2), subscription.next())
        .await
        .expect("write not detected")
        .unwrap()
        .unwrap();
    match event {
        ChangeEvent::FileChanged { relative_path, kind, .. } => {
            assert_eq!(relative_path, "design.md");
            assert_eq!(kind, FileChangeKind::Created);
        }
        other => panic!("expected fileChanged, got {other:?}"),
    }
}
