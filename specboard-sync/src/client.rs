//! WebSocket client implementing [`SyncApi`] against a remote `SyncServer`.
//!
//! Each subscription owns its own `/events/{projectId}` connection, read by a
//! background task that feeds the subscription channel. RPC calls share one
//! lazily opened `/rpc` connection; a transport failure drops it and the next
//! call reconnects.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use crate::api::{Subscription, SyncApi};
use crate::conflict::{Conflict, IntegrityWarning, ResolveOutcome, ResolveRequest};
use crate::error::SyncError;
use crate::merge::MergeResult;
use crate::protocol::{ChangeEvent, DocumentType, RpcCall, RpcReply, RpcRequest, RpcResponse};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Events buffered between the socket reader and the subscriber.
const SUBSCRIPTION_BUFFER: usize = 256;

pub struct RemoteApi {
    /// Base URL, e.g. `ws://127.0.0.1:4455`
    server_url: String,
    token: Option<String>,
    rpc: Mutex<Option<WsStream>>,
    next_id: AtomicU64,
}

impl RemoteApi {
    pub fn new(server_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            server_url: server_url.into().trim_end_matches('/').to_string(),
            token,
            rpc: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    fn url(&self, path: &str) -> String {
        match &self.token {
            Some(token) => format!("{}{path}?token={token}", self.server_url),
            None => format!("{}{path}", self.server_url),
        }
    }

    /// Send one RPC call and wait for its response.
    pub async fn call(&self, call: RpcCall) -> Result<RpcReply, SyncError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = RpcRequest {
            id,
            token: self.token.clone(),
            call,
        };
        let frame = request.encode()?;

        let mut guard = self.rpc.lock().await;
        if guard.is_none() {
            let (ws, _) = tokio_tungstenite::connect_async(self.url("/rpc")).await?;
            log::debug!("RPC connection opened to {}", self.server_url);
            *guard = Some(ws);
        }
        let Some(ws) = guard.as_mut() else {
            return Err(SyncError::Transport("RPC connection unavailable".into()));
        };

        match Self::exchange(ws, id, frame).await {
            Ok(response) => response.into_result(),
            Err(e) => {
                // Broken connection; reopen on the next call
                *guard = None;
                Err(e)
            }
        }
    }

    async fn exchange(ws: &mut WsStream, id: u64, frame: String) -> Result<RpcResponse, SyncError> {
        ws.send(Message::Text(frame.into())).await?;
        while let Some(msg) = ws.next().await {
            match msg? {
                Message::Text(text) => {
                    let response = RpcResponse::decode(text.as_str())?;
                    if response.id == id || response.id == 0 {
                        return Ok(response);
                    }
                    log::warn!("Discarding RPC response {} while waiting for {id}", response.id);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
        Err(SyncError::Transport("RPC connection closed".into()))
    }

    async fn read_events(
        mut ws: WsStream,
        project_id: String,
        tx: mpsc::Sender<Result<ChangeEvent, SyncError>>,
    ) {
        loop {
            tokio::select! {
                msg = ws.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => match ChangeEvent::decode(text.as_str()) {
                            Ok(event) => {
                                if tx.send(Ok(event)).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => log::warn!("Ignoring undecodable event for '{project_id}': {e}"),
                        },
                        Some(Ok(Message::Ping(data))) => {
                            if ws.send(Message::Pong(data)).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::debug!("Event stream for '{project_id}' closed by server");
                            return;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            let _ = tx.send(Err(e.into())).await;
                            return;
                        }
                    }
                }
                _ = tx.closed() => break,
            }
        }
        let _ = ws.close(None).await;
    }
}

fn unexpected(reply: RpcReply) -> SyncError {
    SyncError::Protocol(format!("unexpected reply {reply:?}"))
}

#[async_trait]
impl SyncApi for RemoteApi {
    async fn subscribe(&self, project_id: &str) -> Result<Subscription, SyncError> {
        let (ws, _) = tokio_tungstenite::connect_async(self.url(&format!("/events/{project_id}"))).await?;
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let task = tokio::spawn(Self::read_events(ws, project_id.to_string(), tx));
        Ok(Subscription::new(Uuid::new_v4(), project_id, rx, Some(task.abort_handle())))
    }

    async fn start_watcher(&self, project_id: &str, holder: Uuid) -> Result<(), SyncError> {
        match self
            .call(RpcCall::StartWatcher {
                project_id: project_id.to_string(),
                holder,
            })
            .await?
        {
            RpcReply::Ack => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn stop_watcher(&self, project_id: &str, holder: Uuid) -> Result<(), SyncError> {
        match self
            .call(RpcCall::StopWatcher {
                project_id: project_id.to_string(),
                holder,
            })
            .await?
        {
            RpcReply::Ack => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn watcher_status(&self, project_id: &str) -> Result<bool, SyncError> {
        match self
            .call(RpcCall::WatcherStatus {
                project_id: project_id.to_string(),
            })
            .await?
        {
            RpcReply::WatcherStatus(watching) => Ok(watching),
            other => Err(unexpected(other)),
        }
    }

    async fn fetch_document(&self, project_id: &str, document_type: DocumentType) -> Result<String, SyncError> {
        match self
            .call(RpcCall::FetchDocument {
                project_id: project_id.to_string(),
                document_type,
            })
            .await?
        {
            RpcReply::Document(content) => Ok(content),
            other => Err(unexpected(other)),
        }
    }

    async fn save_document(
        &self,
        project_id: &str,
        document_type: DocumentType,
        content: &str,
    ) -> Result<(), SyncError> {
        match self
            .call(RpcCall::SaveDocument {
                project_id: project_id.to_string(),
                document_type,
                content: content.to_string(),
            })
            .await?
        {
            RpcReply::Ack => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn list_conflicts(&self, project_id: &str) -> Result<Vec<Conflict>, SyncError> {
        match self
            .call(RpcCall::ListConflicts {
                project_id: project_id.to_string(),
            })
            .await?
        {
            RpcReply::Conflicts(conflicts) => Ok(conflicts),
            other => Err(unexpected(other)),
        }
    }

    async fn record_conflict(&self, conflict: &Conflict) -> Result<(), SyncError> {
        match self
            .call(RpcCall::RecordConflict {
                conflict: conflict.clone(),
            })
            .await?
        {
            RpcReply::Ack => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn resolve_conflict(&self, request: &ResolveRequest) -> Result<ResolveOutcome, SyncError> {
        match self
            .call(RpcCall::ResolveConflict {
                request: request.clone(),
            })
            .await?
        {
            RpcReply::Resolved(outcome) => Ok(outcome),
            other => Err(unexpected(other)),
        }
    }

    async fn merge_preview(&self, conflict_id: Uuid) -> Result<MergeResult, SyncError> {
        match self.call(RpcCall::MergePreview { conflict_id }).await? {
            RpcReply::Merge(result) => Ok(result),
            other => Err(unexpected(other)),
        }
    }

    async fn raise_warning(
        &self,
        project_id: &str,
        file_path: &str,
        errors: Vec<String>,
        warnings: Vec<String>,
    ) -> Result<IntegrityWarning, SyncError> {
        match self
            .call(RpcCall::RaiseWarning {
                project_id: project_id.to_string(),
                file_path: file_path.to_string(),
                errors,
                warnings,
            })
            .await?
        {
            RpcReply::Warning(warning) => Ok(warning),
            other => Err(unexpected(other)),
        }
    }

    async fn list_warnings(&self, project_id: &str) -> Result<Vec<IntegrityWarning>, SyncError> {
        match self
            .call(RpcCall::ListWarnings {
                project_id: project_id.to_string(),
            })
            .await?
        {
            RpcReply::Warnings(warnings) => Ok(warnings),
            other => Err(unexpected(other)),
        }
    }

    async fn dismiss_warning(&self, warning_id: Uuid) -> Result<(), SyncError> {
        match self.call(RpcCall::DismissWarning { warning_id }).await? {
            RpcReply::Ack => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urls() {
        let api = RemoteApi::new("ws://127.0.0.1:4455/", None);
        assert_eq!(api.url("/rpc"), "ws://127.0.0.1:4455/rpc");

        let api = RemoteApi::new("ws://127.0.0.1:4455", Some("s3cret".into()));
        assert_eq!(api.url("/events/alpha"), "ws://127.0.0.1:4455/events/alpha?token=s3cret");
    }

    #[tokio::test]
    async fn test_unreachable_server_is_transport_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let api = RemoteApi::new(format!("ws://127.0.0.1:{port}"), None);
        let err = api.subscribe("alpha").await.unwrap_err();
        assert!(err.is_retryable());
        let err = api.watcher_status("alpha").await.unwrap_err();
        assert!(err.is_retryable());
    }
}
