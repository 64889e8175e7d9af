//! Event stream server and RPC endpoint.
//!
//! Architecture:
//! ```text
//!  ChangeSource ──publish──► ChannelManager ──► ProjectChannel (per project)
//!                                                   │ broadcast
//!                              ┌────────────────────┼────────────────────┐
//!                              ▼                    ▼                    ▼
//!                        subscription         subscription         subscription
//!                     (connected, events,   (in process, mpsc)    (/events/{id},
//!                       heartbeats)                                 WebSocket)
//! ```
//!
//! Every subscription attaches itself as a holder of the project's change
//! source and detaches when it ends. `/rpc` carries the remaining
//! [`SyncApi`] calls as JSON request/response frames.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::api::{dispatch, Subscription, SyncApi};
use crate::broadcast::{ChannelManager, ProjectChannel};
use crate::config::ServerConfig;
use crate::conflict::{Conflict, ConflictManager, IntegrityWarning, Resolution, ResolveOutcome, ResolveRequest};
use crate::error::SyncError;
use crate::merge::MergeResult;
use crate::protocol::{validate_project_id, ChangeEvent, DocumentType, FileChangeKind, RpcRequest, RpcResponse};
use crate::storage::{ConflictStore, DocumentStore, MemoryConflictStore, MemoryDocumentStore};
use crate::watcher::{ChangeSource, ManualChangeSource, WatcherRegistry};

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub active_subscriptions: u64,
    pub events_published: u64,
    pub rpc_requests: u64,
}

/// Where a WebSocket handshake is routed.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Route {
    Events(String),
    Rpc { authorized: bool },
}

/// The event stream server.
#[derive(Clone)]
pub struct SyncServer {
    config: ServerConfig,
    channels: Arc<ChannelManager>,
    watchers: Arc<WatcherRegistry>,
    documents: Arc<dyn DocumentStore>,
    conflicts: Arc<ConflictManager>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    pub fn new(
        config: ServerConfig,
        documents: Arc<dyn DocumentStore>,
        conflict_store: Arc<dyn ConflictStore>,
        source: Arc<dyn ChangeSource>,
    ) -> Self {
        let channels = Arc::new(ChannelManager::new(config.broadcast_capacity));
        let watchers = Arc::new(WatcherRegistry::new(source, channels.clone()));
        let conflicts = Arc::new(ConflictManager::new(documents.clone(), conflict_store));
        Self {
            config,
            channels,
            watchers,
            documents,
            conflicts,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// In-memory stores and a manually driven change source.
    pub fn in_memory(config: ServerConfig) -> Self {
        Self::new(
            config,
            Arc::new(MemoryDocumentStore::new()),
            Arc::new(MemoryConflictStore::new()),
            Arc::new(ManualChangeSource::new()),
        )
    }

    /// Report unresolved conflicts and warnings left from a previous run.
    pub fn recover(&self) -> Result<(usize, usize), SyncError> {
        let (conflicts, warnings) = self.conflicts.store().counts()?;
        if conflicts + warnings > 0 {
            log::info!("Recovered {conflicts} unresolved conflict(s) and {warnings} integrity warning(s)");
        }
        Ok((conflicts, warnings))
    }

    /// Inject an event into a project's stream.
    pub async fn publish(&self, event: ChangeEvent) -> usize {
        let delivered = self.channels.publish(event).await;
        self.stats.write().await.events_published += 1;
        delivered
    }

    /// Start listening for WebSocket connections.
    pub async fn run(&self) -> Result<(), SyncError> {
        let listener = TcpListener::bind(&self.config.bind_addr)
            .await
            .map_err(|e| SyncError::Transport(format!("bind {}: {e}", self.config.bind_addr)))?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), SyncError> {
        self.recover()?;
        if let Ok(addr) = listener.local_addr() {
            log::info!("Sync server listening on {addr}");
        }

        loop {
            let (stream, addr) = listener
                .accept()
                .await
                .map_err(|e| SyncError::Transport(e.to_string()))?;
            log::debug!("New TCP connection from {addr}");

            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, addr).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(self, stream: TcpStream, addr: SocketAddr) -> Result<(), SyncError> {
        let mut route = None;
        let token = self.config.token.clone();
        let ws = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
            match route_request(req, token.as_deref()) {
                Ok(r) => {
                    route = Some(r);
                    Ok(resp)
                }
                Err((status, reason)) => {
                    log::warn!("Rejected handshake from {addr} for {}: {reason}", req.uri());
                    let mut err = ErrorResponse::new(Some(reason));
                    *err.status_mut() = status;
                    Err(err)
                }
            }
        })
        .await?;

        let Some(route) = route else {
            return Err(SyncError::Protocol("handshake completed without a route".into()));
        };

        {
            let mut s = self.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }
        log::info!("WebSocket connection established from {addr} ({route:?})");

        let result = match route {
            Route::Events(project_id) => self.serve_events(ws, &project_id).await,
            Route::Rpc { authorized } => self.serve_rpc(ws, authorized).await,
        };

        self.stats.write().await.active_connections -= 1;
        log::info!("Connection closed from {addr}");
        result
    }

    async fn serve_events(&self, ws: WebSocketStream<TcpStream>, project_id: &str) -> Result<(), SyncError> {
        let (mut ws_sender, mut ws_receiver) = ws.split();
        let mut subscription = match self.subscribe(project_id).await {
            Ok(subscription) => subscription,
            Err(e) => {
                log::warn!("Subscription to '{project_id}' refused: {e}");
                ws_sender.send(Message::Close(None)).await?;
                return Err(e);
            }
        };

        loop {
            tokio::select! {
                event = subscription.next() => {
                    match event {
                        Some(Ok(event)) => {
                            let frame = event.encode()?;
                            ws_sender.send(Message::Text(frame.into())).await?;
                        }
                        Some(Err(e)) => return Err(e),
                        None => break,
                    }
                }
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Ping(data))) => ws_sender.send(Message::Pong(data)).await?,
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(e)) => {
                            log::debug!("Event stream for '{project_id}' ended: {e}");
                            break;
                        }
                        Some(Ok(_)) => {}
                    }
                }
            }
        }
        Ok(())
    }

    async fn serve_rpc(&self, ws: WebSocketStream<TcpStream>, authorized: bool) -> Result<(), SyncError> {
        let (mut ws_sender, mut ws_receiver) = ws.split();

        while let Some(msg) = ws_receiver.next().await {
            let text = match msg? {
                Message::Text(text) => text,
                Message::Ping(data) => {
                    ws_sender.send(Message::Pong(data)).await?;
                    continue;
                }
                Message::Close(_) => break,
                _ => continue,
            };

            self.stats.write().await.rpc_requests += 1;
            let response = match RpcRequest::decode(text.as_str()) {
                Ok(request) => {
                    let result = if authorized || self.token_matches(request.token.as_deref()) {
                        dispatch(self, request.call).await
                    } else {
                        Err(SyncError::Unauthorized)
                    };
                    RpcResponse::from_result(request.id, result)
                }
                Err(e) => RpcResponse::from_result(0, Err(e.into())),
            };
            ws_sender.send(Message::Text(response.encode()?.into())).await?;
        }
        Ok(())
    }

    fn token_matches(&self, token: Option<&str>) -> bool {
        match &self.config.token {
            Some(expected) => token == Some(expected.as_str()),
            None => true,
        }
    }

    /// Register a subscription and spawn the task that feeds it.
    async fn open_stream(&self, project_id: &str) -> Result<Subscription, SyncError> {
        let channel = self.channels.get_or_create(project_id).await;
        if channel.subscriber_count().await >= self.config.max_subscribers_per_project {
            return Err(SyncError::InvalidRequest(format!(
                "project '{project_id}' has too many subscribers"
            )));
        }

        let id = Uuid::new_v4();
        if let Err(e) = self.watchers.attach(project_id, id).await {
            self.channels.remove_if_empty(project_id).await;
            return Err(e);
        }
        // Subscribed before `connected` is sent, so nothing published after it is missed
        let rx = channel.add_subscriber(id).await;
        let (tx, out) = mpsc::channel(self.config.broadcast_capacity.max(1));

        self.stats.write().await.active_subscriptions += 1;
        log::debug!("Subscription {id} opened for project '{project_id}'");
        tokio::spawn(self.clone().forward(id, channel, rx, tx));

        Ok(Subscription::new(id, project_id, out, None))
    }

    /// Relay one subscription until its receiver goes away or the channel closes.
    async fn forward(
        self,
        id: Uuid,
        channel: Arc<ProjectChannel>,
        mut rx: broadcast::Receiver<ChangeEvent>,
        tx: mpsc::Sender<Result<ChangeEvent, SyncError>>,
    ) {
        let project_id = channel.project_id().to_string();
        let period = self.config.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);

        if tx.send(Ok(ChangeEvent::connected(&project_id))).await.is_ok() {
            loop {
                tokio::select! {
                    event = rx.recv() => {
                        match event {
                            Ok(event) => {
                                if tx.send(Ok(event)).await.is_err() {
                                    break;
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(n)) => channel.record_lagged(n),
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                    _ = heartbeat.tick() => {
                        let event = ChangeEvent::heartbeat(&project_id, self.watchers.is_watching(&project_id));
                        if tx.send(Ok(event)).await.is_err() {
                            break;
                        }
                    }
                    _ = tx.closed() => break,
                }
            }
        }

        channel.remove_subscriber(&id).await;
        if let Err(e) = self.watchers.detach(&project_id, id).await {
            log::error!("Failed to detach subscription {id} from '{project_id}': {e}");
        }
        self.channels.remove_if_empty(&project_id).await;
        self.stats.write().await.active_subscriptions -= 1;
        log::debug!("Subscription {id} closed for project '{project_id}'");
    }

    /// Announce a write the change source will not notice by itself.
    async fn announce_write(&self, project_id: &str, document_type: DocumentType) {
        if self.watchers.source().observes_writes() {
            return;
        }
        self.publish(ChangeEvent::file_changed(
            project_id,
            document_type.file_name(),
            FileChangeKind::Modified,
        ))
        .await;
        self.publish(ChangeEvent::document_changed(project_id, document_type)).await;
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn channels(&self) -> &Arc<ChannelManager> {
        &self.channels
    }

    pub fn watchers(&self) -> &Arc<WatcherRegistry> {
        &self.watchers
    }

    pub fn conflicts(&self) -> &Arc<ConflictManager> {
        &self.conflicts
    }
}

/// Route a handshake, or the status and reason it is rejected with.
fn route_request(req: &Request, token: Option<&str>) -> Result<Route, (StatusCode, String)> {
    let uri = req.uri();
    let supplied = uri.query().and_then(|q| {
        q.split('&')
            .find_map(|pair| pair.strip_prefix("token="))
    });
    let authorized = match token {
        Some(expected) => supplied == Some(expected),
        None => true,
    };

    let path = uri.path();
    if path == "/rpc" {
        return Ok(Route::Rpc { authorized });
    }

    let Some(project_id) = path.strip_prefix("/events/") else {
        return Err((StatusCode::NOT_FOUND, format!("no route for {path}")));
    };
    if !authorized {
        return Err((StatusCode::UNAUTHORIZED, "missing or invalid token".into()));
    }
    validate_project_id(project_id).map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    Ok(Route::Events(project_id.to_string()))
}

#[async_trait]
impl SyncApi for SyncServer {
    async fn subscribe(&self, project_id: &str) -> Result<Subscription, SyncError> {
        validate_project_id(project_id)?;
        self.open_stream(project_id).await
    }

    async fn start_watcher(&self, project_id: &str, holder: Uuid) -> Result<(), SyncError> {
        validate_project_id(project_id)?;
        self.watchers.attach(project_id, holder).await
    }

    async fn stop_watcher(&self, project_id: &str, holder: Uuid) -> Result<(), SyncError> {
        validate_project_id(project_id)?;
        self.watchers.detach(project_id, holder).await
    }

    async fn watcher_status(&self, project_id: &str) -> Result<bool, SyncError> {
        validate_project_id(project_id)?;
        Ok(self.watchers.is_watching(project_id))
    }

    async fn fetch_document(&self, project_id: &str, document_type: DocumentType) -> Result<String, SyncError> {
        validate_project_id(project_id)?;
        self.documents
            .read(project_id, document_type)?
            .ok_or_else(|| SyncError::NotFound(format!("{project_id}/{}", document_type.file_name())))
    }

    async fn save_document(
        &self,
        project_id: &str,
        document_type: DocumentType,
        content: &str,
    ) -> Result<(), SyncError> {
        validate_project_id(project_id)?;
        self.documents.write(project_id, document_type, content)?;
        log::debug!("Saved {project_id}/{}", document_type.file_name());
        self.announce_write(project_id, document_type).await;
        Ok(())
    }

    async fn list_conflicts(&self, project_id: &str) -> Result<Vec<Conflict>, SyncError> {
        validate_project_id(project_id)?;
        self.conflicts.list_conflicts(project_id)
    }

    async fn record_conflict(&self, conflict: &Conflict) -> Result<(), SyncError> {
        validate_project_id(&conflict.project_id)?;
        self.conflicts.record(conflict)
    }

    async fn resolve_conflict(&self, request: &ResolveRequest) -> Result<ResolveOutcome, SyncError> {
        let outcome = self.conflicts.resolve_conflict(request)?;
        if outcome.resolution != Resolution::Remote {
            self.announce_write(&outcome.project_id, outcome.document_type).await;
        }
        Ok(outcome)
    }

    async fn merge_preview(&self, conflict_id: Uuid) -> Result<MergeResult, SyncError> {
        self.conflicts.compute_merge(conflict_id)
    }

    async fn raise_warning(
        &self,
        project_id: &str,
        file_path: &str,
        errors: Vec<String>,
        warnings: Vec<String>,
    ) -> Result<IntegrityWarning, SyncError> {
        validate_project_id(project_id)?;
        self.conflicts
            .raise_integrity_warning(project_id, file_path, errors, warnings)
    }

    async fn list_warnings(&self, project_id: &str) -> Result<Vec<IntegrityWarning>, SyncError> {
        validate_project_id(project_id)?;
        self.conflicts.list_integrity_warnings(project_id)
    }

    async fn dismiss_warning(&self, warning_id: Uuid) -> Result<(), SyncError> {
        self.conflicts.dismiss_integrity_warning(warning_id)
    }
}
