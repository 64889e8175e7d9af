//! Integration tests for the WebSocket event stream and RPC endpoint.
//!
//! These tests start a real server on a free port and talk to it through
//! `RemoteApi`, verifying the full pipeline from store write to client event.

use specboard_sync::api::{Subscription, SyncApi};
use specboard_sync::client::RemoteApi;
use specboard_sync::config::{ServerConfig, SessionConfig};
use specboard_sync::conflict::{Conflict, ConflictType, Resolution, ResolveRequest};
use specboard_sync::error::SyncError;
use specboard_sync::protocol::{ChangeEvent, DocumentType, FileChangeKind};
use specboard_sync::server::SyncServer;
use specboard_sync::session::{ConnectionStatus, SessionEvent, SyncSession};
use std::sync::Arc;
use tokio::time::{timeout, Duration};
use uuid::Uuid;

/// Start a server on a free port, return it with its base URL.
async fn start_test_server(token: Option<&str>) -> (SyncServer, String) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        heartbeat_interval: Duration::from_secs(3600),
        token: token.map(str::to_string),
        ..ServerConfig::default()
    };
    let server = SyncServer::in_memory(config);
    let running = server.clone();
    tokio::spawn(async move {
        let _ = running.serve(listener).await;
    });
    (server, format!("ws://127.0.0.1:{port}"))
}

async fn next_event(subscription: &mut Subscription) -> ChangeEvent {
    timeout(Duration::from_secs(2), subscription.next())
        .await
        .expect("timed out waiting for event")
        .expect("stream ended")
        .expect("stream failed")
}

/// Status code of a handshake the server is expected to reject.
async fn handshake_status(url: &str) -> u16 {
    match tokio_tungstenite::connect_async(url).await {
        Ok(_) => panic!("handshake to {url} was accepted"),
        Err(e) => SyncError::from(e).status_code(),
    }
}

/// Poll until `check` holds or two seconds pass.
async fn eventually<F, Fut>(check: F) -> bool
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn test_subscribe_receives_connected_then_changes() {
    let (_server, url) = start_test_server(None).await;
    let api = RemoteApi::new(&url, None);

    let mut subscription = api.subscribe("alpha").await.unwrap();
    assert!(matches!(next_event(&mut subscription).await, ChangeEvent::Connected { .. }));

    api.save_document("alpha", DocumentType::Tasks, "- [ ] one").await.unwrap();

    match next_event(&mut subscription).await {
        ChangeEvent::FileChanged {
            relative_path,
            kind,
            ..
        } => {
            assert_eq!(relative_path, "tasks.md");
            assert_eq!(kind, FileChangeKind::Modified);
        }
        other => panic!("expected fileChanged, got {other:?}"),
    }
    match next_event(&mut subscription).await {
        ChangeEvent::DocumentChanged { document_type, .. } => assert_eq!(document_type, DocumentType::Tasks),
        other => panic!("expected documentChanged, got {other:?}"),
    }
}

#[tokio::test]
async fn test_subscribers_see_same_order() {
    let (server, url) = start_test_server(None).await;
    let api = RemoteApi::new(&url, None);

    let mut first = api.subscribe("alpha").await.unwrap();
    let mut second = api.subscribe("alpha").await.unwrap();
    next_event(&mut first).await;
    next_event(&mut second).await;

    let paths = ["requirements.md", "design.md", "tasks.md"];
    for path in paths {
        server
            .publish(ChangeEvent::file_changed("alpha", path, FileChangeKind::Modified))
            .await;
    }

    for subscription in [&mut first, &mut second] {
        for expected in paths {
            match next_event(subscription).await {
                ChangeEvent::FileChanged { relative_path, .. } => assert_eq!(relative_path, expected),
                other => panic!("expected fileChanged, got {other:?}"),
            }
        }
    }
}

#[tokio::test]
async fn test_projects_are_isolated() {
    let (server, url) = start_test_server(None).await;
    let api = RemoteApi::new(&url, None);

    let mut alpha = api.subscribe("alpha").await.unwrap();
    let mut beta = api.subscribe("beta").await.unwrap();
    next_event(&mut alpha).await;
    next_event(&mut beta).await;

    server.publish(ChangeEvent::document_changed("beta", DocumentType::Design)).await;
    match next_event(&mut beta).await {
        ChangeEvent::DocumentChanged { project_id, .. } => assert_eq!(project_id, "beta"),
        other => panic!("expected documentChanged, got {other:?}"),
    }
    assert!(timeout(Duration::from_millis(100), alpha.next()).await.is_err());
}

#[tokio::test]
async fn test_heartbeats_carry_watcher_state() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = SyncServer::in_memory(ServerConfig {
        heartbeat_interval: Duration::from_millis(50),
        ..ServerConfig::default()
    });
    let running = server.clone();
    tokio::spawn(async move {
        let _ = running.serve(listener).await;
    });

    let api = RemoteApi::new(format!("ws://127.0.0.1:{port}"), None);
    let mut subscription = api.subscribe("alpha").await.unwrap();
    next_event(&mut subscription).await;

    match next_event(&mut subscription).await {
        ChangeEvent::Heartbeat { is_watching, .. } => assert!(is_watching),
        other => panic!("expected heartbeat, got {other:?}"),
    }
}

#[tokio::test]
async fn test_watcher_released_when_last_subscription_drops() {
    let (server, url) = start_test_server(None).await;
    let api = RemoteApi::new(&url, None);

    let mut first = api.subscribe("alpha").await.unwrap();
    let mut second = api.subscribe("alpha").await.unwrap();
    next_event(&mut first).await;
    next_event(&mut second).await;
    assert!(api.watcher_status("alpha").await.unwrap());

    drop(first);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(api.watcher_status("alpha").await.unwrap());

    drop(second);
    assert!(eventually(|| {
        let server = server.clone();
        async move { !server.watchers().is_watching("alpha") }
    }).await);
    assert!(eventually(|| {
        let server = server.clone();
        async move { server.stats().await.active_subscriptions == 0 }
    }).await);
}

#[tokio::test]
async fn test_handshake_rejections() {
    let (_server, url) = start_test_server(Some("s3cret")).await;

    let anonymous = RemoteApi::new(&url, None);
    assert_eq!(anonymous.subscribe("alpha").await.unwrap_err(), SyncError::Unauthorized);

    let wrong = RemoteApi::new(&url, Some("guess".into()));
    assert_eq!(wrong.subscribe("alpha").await.unwrap_err(), SyncError::Unauthorized);

    assert_eq!(handshake_status(&format!("{url}/nowhere?token=s3cret")).await, 404);
    assert_eq!(handshake_status(&format!("{url}/events/a%20b?token=s3cret")).await, 400);

    let authorized = RemoteApi::new(&url, Some("s3cret".into()));
    assert!(authorized.subscribe("alpha").await.is_ok());
}

#[tokio::test]
async fn test_rpc_requires_token() {
    let (_server, url) = start_test_server(Some("s3cret")).await;

    let wrong = RemoteApi::new(&url, Some("guess".into()));
    assert_eq!(wrong.watcher_status("alpha").await.unwrap_err(), SyncError::Unauthorized);

    let authorized = RemoteApi::new(&url, Some("s3cret".into()));
    assert!(!authorized.watcher_status("alpha").await.unwrap());
}

#[tokio::test]
async fn test_rpc_error_codes() {
    let (_server, url) = start_test_server(None).await;
    let api = RemoteApi::new(&url, None);

    let err = api.fetch_document("alpha", DocumentType::Design).await.unwrap_err();
    assert_eq!(err.status_code(), 404);

    let err = api.watcher_status("a/b").await.unwrap_err();
    assert_eq!(err.status_code(), 400);

    let request = ResolveRequest {
        conflict_id: Uuid::new_v4(),
        resolution: Resolution::Local,
        manual_content: None,
        resolved_by: "tester".into(),
    };
    let err = api.resolve_conflict(&request).await.unwrap_err();
    assert_eq!(err.status_code(), 404);

    let conflict = Conflict::new(
        "alpha",
        DocumentType::Design,
        "a\nlocal\nc",
        "a\nremote\nc",
        Some("a\nb\nc".into()),
        1,
        2,
        ConflictType::SimultaneousEdit,
    );
    api.record_conflict(&conflict).await.unwrap();
    let request = ResolveRequest {
        conflict_id: conflict.id,
        resolution: Resolution::Merge,
        manual_content: None,
        resolved_by: "tester".into(),
    };
    let err = api.resolve_conflict(&request).await.unwrap_err();
    assert_eq!(err, SyncError::MergeIncomplete(1));
    assert_eq!(err.status_code(), 409);

    // Still listed after the failed merge
    assert_eq!(api.list_conflicts("alpha").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_conflict_workflow_over_rpc() {
    let (_server, url) = start_test_server(None).await;
    let api = RemoteApi::new(&url, None);

    let conflict = Conflict::new(
        "alpha",
        DocumentType::Requirements,
        "# R\nlocal line\nend",
        "# R\nmiddle\nend\nremote tail",
        Some("# R\nmiddle\nend".into()),
        10,
        20,
        ConflictType::SimultaneousEdit,
    );
    api.record_conflict(&conflict).await.unwrap();

    let listed = api.list_conflicts("alpha").await.unwrap();
    assert_eq!(listed, vec![conflict.clone()]);

    let preview = api.merge_preview(conflict.id).await.unwrap();
    assert!(preview.success);
    assert_eq!(preview.merged_content, "# R\nlocal line\nend\nremote tail");

    let outcome = api
        .resolve_conflict(&ResolveRequest {
            conflict_id: conflict.id,
            resolution: Resolution::Merge,
            manual_content: None,
            resolved_by: "tester".into(),
        })
        .await
        .unwrap();
    assert_eq!(outcome.content, preview.merged_content);
    assert_eq!(
        api.fetch_document("alpha", DocumentType::Requirements).await.unwrap(),
        preview.merged_content
    );
    assert!(api.list_conflicts("alpha").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_integrity_warnings_over_rpc() {
    let (_server, url) = start_test_server(None).await;
    let api = RemoteApi::new(&url, None);

    let warning = api
        .raise_warning(
            "alpha",
            "alpha/config.json",
            vec!["invalid JSON".into()],
            Vec::new(),
        )
        .await
        .unwrap();
    assert_eq!(api.list_warnings("alpha").await.unwrap(), vec![warning.clone()]);

    api.dismiss_warning(warning.id).await.unwrap();
    assert!(api.list_warnings("alpha").await.unwrap().is_empty());
    assert_eq!(api.dismiss_warning(warning.id).await.unwrap_err().status_code(), 404);
}

#[tokio::test]
async fn test_session_over_websocket() {
    let (server, url) = start_test_server(None).await;
    let api: Arc<dyn SyncApi> = Arc::new(RemoteApi::new(&url, None));
    let session = SyncSession::new("alpha", api, SessionConfig::default()).unwrap();
    let mut events = session.subscribe_events();

    session.start_sync().await.unwrap();
    assert_eq!(session.status().connection_status, ConnectionStatus::Connected);

    // A second client writes
    let other = RemoteApi::new(&url, None);
    other
        .save_document("alpha", DocumentType::Design, "# Design\n\nv2")
        .await
        .unwrap();

    let updated = timeout(Duration::from_secs(2), async {
        loop {
            if let Ok(SessionEvent::DocumentUpdated { content, .. }) = events.recv().await {
                return content;
            }
        }
    })
    .await
    .expect("no safe update received");
    assert_eq!(updated, "# Design\n\nv2");
    assert_eq!(session.document(DocumentType::Design).local_content, "# Design\n\nv2");

    session.close().await;
    assert!(eventually(|| {
        let server = server.clone();
        async move { !server.watchers().is_watching("alpha") }
    }).await);
}

#[tokio::test]
async fn test_server_stats_track_connections() {
    let (server, url) = start_test_server(None).await;
    let api = RemoteApi::new(&url, None);

    let mut subscription = api.subscribe("alpha").await.unwrap();
    next_event(&mut subscription).await;
    api.watcher_status("alpha").await.unwrap();

    let stats = server.stats().await;
    assert_eq!(stats.total_connections, 2);
    assert_eq!(stats.active_subscriptions, 1);
    assert!(stats.rpc_requests >= 1);

    drop(subscription);
    assert!(eventually(|| {
        let server = server.clone();
        async move { server.stats().await.active_connections == 1 }
    }).await);
}
