//! Wire protocol for the project event stream and the RPC endpoint.
//!
//! Event frames are JSON text frames:
//! ```text
//! { "event": "documentChanged:tasks",
//!   "data":  { "projectId": "alpha", "relativePath": "tasks.md", "timestamp": 1700000000000 } }
//! ```
//!
//! Event names: `connected`, `heartbeat`, `fileChanged`,
//! `documentChanged:{type}`, `watcherError`. Every payload carries
//! `projectId` and `timestamp` (milliseconds since the Unix epoch).
//!
//! RPC frames are `{id, token?, call}` requests answered by `{id, result | error}`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::SystemTime;
use uuid::Uuid;

use crate::conflict::{Conflict, IntegrityWarning, ResolveOutcome, ResolveRequest};
use crate::error::SyncError;
use crate::merge::MergeResult;

/// Milliseconds since the Unix epoch.
pub fn timestamp_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Project ids are `[A-Za-z0-9._-]+` and never `.` or `..`.
pub fn validate_project_id(project_id: &str) -> Result<(), SyncError> {
    let valid = !project_id.is_empty()
        && project_id != "."
        && project_id != ".."
        && project_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(SyncError::InvalidRequest(format!("invalid project id '{project_id}'")))
    }
}

/// The synchronized document kinds of a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentType {
    Requirements,
    Design,
    Tasks,
    Config,
}

impl DocumentType {
    pub const ALL: [DocumentType; 4] = [
        DocumentType::Requirements,
        DocumentType::Design,
        DocumentType::Tasks,
        DocumentType::Config,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentType::Requirements => "requirements",
            DocumentType::Design => "design",
            DocumentType::Tasks => "tasks",
            DocumentType::Config => "config",
        }
    }

    /// Path of the document relative to the project root.
    pub fn file_name(&self) -> &'static str {
        match self {
            DocumentType::Requirements => "requirements.md",
            DocumentType::Design => "design.md",
            DocumentType::Tasks => "tasks.md",
            DocumentType::Config => "config.json",
        }
    }

    pub fn from_relative_path(path: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.file_name() == path)
    }
}

impl fmt::Display for DocumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ProtocolError::UnknownDocumentType(s.to_string()))
    }
}

/// What happened to a file observed by the change source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileChangeKind {
    Created,
    Modified,
    Removed,
}

/// Events relayed from the change source to every subscriber of a project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    /// First event of every subscription.
    Connected { project_id: String, timestamp: u64 },
    /// Periodic liveness signal.
    Heartbeat {
        project_id: String,
        timestamp: u64,
        is_watching: bool,
    },
    FileChanged {
        project_id: String,
        relative_path: String,
        kind: FileChangeKind,
        timestamp: u64,
    },
    /// The authoritative copy of a document changed.
    DocumentChanged {
        project_id: String,
        document_type: DocumentType,
        relative_path: String,
        timestamp: u64,
    },
    WatcherError {
        project_id: String,
        message: String,
        timestamp: u64,
    },
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectedPayload {
    project_id: String,
    timestamp: u64,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HeartbeatPayload {
    project_id: String,
    timestamp: u64,
    is_watching: bool,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileChangedPayload {
    project_id: String,
    relative_path: String,
    kind: FileChangeKind,
    timestamp: u64,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DocumentChangedPayload {
    project_id: String,
    relative_path: String,
    timestamp: u64,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WatcherErrorPayload {
    project_id: String,
    message: String,
    timestamp: u64,
}

#[derive(Serialize, Deserialize)]
struct EventFrame {
    event: String,
    data: serde_json::Value,
}

const DOCUMENT_CHANGED_PREFIX: &str = "documentChanged:";

impl ChangeEvent {
    pub fn connected(project_id: impl Into<String>) -> Self {
        ChangeEvent::Connected {
            project_id: project_id.into(),
            timestamp: timestamp_now(),
        }
    }

    pub fn heartbeat(project_id: impl Into<String>, is_watching: bool) -> Self {
        ChangeEvent::Heartbeat {
            project_id: project_id.into(),
            timestamp: timestamp_now(),
            is_watching,
        }
    }

    pub fn file_changed(
        project_id: impl Into<String>,
        relative_path: impl Into<String>,
        kind: FileChangeKind,
    ) -> Self {
        ChangeEvent::FileChanged {
            project_id: project_id.into(),
            relative_path: relative_path.into(),
            kind,
            timestamp: timestamp_now(),
        }
    }

    pub fn document_changed(project_id: impl Into<String>, document_type: DocumentType) -> Self {
        ChangeEvent::DocumentChanged {
            project_id: project_id.into(),
            document_type,
            relative_path: document_type.file_name().to_string(),
            timestamp: timestamp_now(),
        }
    }

    pub fn watcher_error(project_id: impl Into<String>, message: impl Into<String>) -> Self {
        ChangeEvent::WatcherError {
            project_id: project_id.into(),
            message: message.into(),
            timestamp: timestamp_now(),
        }
    }

    /// Event name as it appears on the wire.
    pub fn event_name(&self) -> String {
        match self {
            ChangeEvent::Connected { .. } => "connected".to_string(),
            ChangeEvent::Heartbeat { .. } => "heartbeat".to_string(),
            ChangeEvent::FileChanged { .. } => "fileChanged".to_string(),
            ChangeEvent::DocumentChanged { document_type, .. } => {
                format!("{DOCUMENT_CHANGED_PREFIX}{document_type}")
            }
            ChangeEvent::WatcherError { .. } => "watcherError".to_string(),
        }
    }

    pub fn project_id(&self) -> &str {
        match self {
            ChangeEvent::Connected { project_id, .. }
            | ChangeEvent::Heartbeat { project_id, .. }
            | ChangeEvent::FileChanged { project_id, .. }
            | ChangeEvent::DocumentChanged { project_id, .. }
            | ChangeEvent::WatcherError { project_id, .. } => project_id,
        }
    }

    pub fn timestamp(&self) -> u64 {
        match self {
            ChangeEvent::Connected { timestamp, .. }
            | ChangeEvent::Heartbeat { timestamp, .. }
            | ChangeEvent::FileChanged { timestamp, .. }
            | ChangeEvent::DocumentChanged { timestamp, .. }
            | ChangeEvent::WatcherError { timestamp, .. } => *timestamp,
        }
    }

    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        let data = match self.clone() {
            ChangeEvent::Connected { project_id, timestamp } => {
                serde_json::to_value(ConnectedPayload { project_id, timestamp })
            }
            ChangeEvent::Heartbeat {
                project_id,
                timestamp,
                is_watching,
            } => serde_json::to_value(HeartbeatPayload {
                project_id,
                timestamp,
                is_watching,
            }),
            ChangeEvent::FileChanged {
                project_id,
                relative_path,
                kind,
                timestamp,
            } => serde_json::to_value(FileChangedPayload {
                project_id,
                relative_path,
                kind,
                timestamp,
            }),
            ChangeEvent::DocumentChanged {
                project_id,
                relative_path,
                timestamp,
                ..
            } => serde_json::to_value(DocumentChangedPayload {
                project_id,
                relative_path,
                timestamp,
            }),
            ChangeEvent::WatcherError {
                project_id,
                message,
                timestamp,
            } => serde_json::to_value(WatcherErrorPayload {
                project_id,
                message,
                timestamp,
            }),
        }
        .map_err(|e| ProtocolError::SerializationError(e.to_string()))?;

        let frame = EventFrame {
            event: self.event_name(),
            data,
        };
        serde_json::to_string(&frame).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Parse a JSON text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let frame: EventFrame = serde_json::from_str(text)
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;

        fn payload<T: serde::de::DeserializeOwned>(data: serde_json::Value) -> Result<T, ProtocolError> {
            serde_json::from_value(data).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
        }

        let event = match frame.event.as_str() {
            "connected" => {
                let p: ConnectedPayload = payload(frame.data)?;
                ChangeEvent::Connected {
                    project_id: p.project_id,
                    timestamp: p.timestamp,
                }
            }
            "heartbeat" => {
                let p: HeartbeatPayload = payload(frame.data)?;
                ChangeEvent::Heartbeat {
                    project_id: p.project_id,
                    timestamp: p.timestamp,
                    is_watching: p.is_watching,
                }
            }
            "fileChanged" => {
                let p: FileChangedPayload = payload(frame.data)?;
                ChangeEvent::FileChanged {
                    project_id: p.project_id,
                    relative_path: p.relative_path,
                    kind: p.kind,
                    timestamp: p.timestamp,
                }
            }
            "watcherError" => {
                let p: WatcherErrorPayload = payload(frame.data)?;
                ChangeEvent::WatcherError {
                    project_id: p.project_id,
                    message: p.message,
                    timestamp: p.timestamp,
                }
            }
            name => match name.strip_prefix(DOCUMENT_CHANGED_PREFIX) {
                Some(doc_type) => {
                    let document_type = doc_type.parse()?;
                    let p: DocumentChangedPayload = payload(frame.data)?;
                    ChangeEvent::DocumentChanged {
                        project_id: p.project_id,
                        document_type,
                        relative_path: p.relative_path,
                        timestamp: p.timestamp,
                    }
                }
                None => return Err(ProtocolError::UnknownEvent(name.to_string())),
            },
        };
        Ok(event)
    }
}

// ─── RPC ──────────────────────────────────────────────────────────────

/// Calls accepted on the `/rpc` endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum RpcCall {
    StartWatcher { project_id: String, holder: Uuid },
    StopWatcher { project_id: String, holder: Uuid },
    WatcherStatus { project_id: String },
    FetchDocument { project_id: String, document_type: DocumentType },
    SaveDocument {
        project_id: String,
        document_type: DocumentType,
        content: String,
    },
    ListConflicts { project_id: String },
    RecordConflict { conflict: Conflict },
    ResolveConflict { request: ResolveRequest },
    MergePreview { conflict_id: Uuid },
    RaiseWarning {
        project_id: String,
        file_path: String,
        errors: Vec<String>,
        warnings: Vec<String>,
    },
    ListWarnings { project_id: String },
    DismissWarning { warning_id: Uuid },
}

/// Successful RPC results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum RpcReply {
    Ack,
    WatcherStatus(bool),
    Document(String),
    Conflicts(Vec<Conflict>),
    Resolved(ResolveOutcome),
    Merge(MergeResult),
    Warning(IntegrityWarning),
    Warnings(Vec<IntegrityWarning>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    pub call: RpcCall,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcErrorBody {
    pub code: u16,
    pub error: SyncError,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<RpcReply>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorBody>,
}

impl RpcRequest {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

impl RpcResponse {
    pub fn from_result(id: u64, result: Result<RpcReply, SyncError>) -> Self {
        match result {
            Ok(reply) => Self {
                id,
                result: Some(reply),
                error: None,
            },
            Err(error) => Self {
                id,
                result: None,
                error: Some(RpcErrorBody {
                    code: error.status_code(),
                    error,
                }),
            },
        }
    }

    pub fn into_result(self) -> Result<RpcReply, SyncError> {
        match (self.result, self.error) {
            (_, Some(body)) => Err(body.error),
            (Some(reply), None) => Ok(reply),
            (None, None) => Err(SyncError::Protocol(format!("response {} carries no result", self.id))),
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Unknown event: {0}")]
    UnknownEvent(String),
    #[error("Unknown document type: {0}")]
    UnknownDocumentType(String),
    #[error("Connection closed")]
    ConnectionClosed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_project_id_validation() {
        assert!(validate_project_id("alpha-1.v2_x").is_ok());
        for bad in ["", ".", "..", "a/b", "a b", "ü"] {
            assert_eq!(validate_project_id(bad).unwrap_err().status_code(), 400, "{bad}");
        }
    }

    #[test]
    fn test_document_changed_frame() {
        let event = ChangeEvent::DocumentChanged {
            project_id: "alpha".into(),
            document_type: DocumentType::Tasks,
            relative_path: "tasks.md".into(),
            timestamp: 42,
        };
        let text = event.encode().unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["event"], "documentChanged:tasks");
        assert_eq!(value["data"]["projectId"], "alpha");
        assert_eq!(value["data"]["relativePath"], "tasks.md");
        assert_eq!(value["data"]["timestamp"], 42);

        assert_eq!(ChangeEvent::decode(&text).unwrap(), event);
    }

    #[test]
    fn test_heartbeat_frame_fields() {
        let event = ChangeEvent::Heartbeat {
            project_id: "alpha".into(),
            timestamp: 7,
            is_watching: false,
        };
        let text = event.encode().unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["event"], "heartbeat");
        assert_eq!(value["data"]["isWatching"], false);
    }

    #[test]
    fn test_event_names() {
        assert_eq!(ChangeEvent::connected("p").event_name(), "connected");
        assert_eq!(ChangeEvent::heartbeat("p", true).event_name(), "heartbeat");
        assert_eq!(
            ChangeEvent::file_changed("p", "notes.md", FileChangeKind::Created).event_name(),
            "fileChanged"
        );
        assert_eq!(
            ChangeEvent::document_changed("p", DocumentType::Config).event_name(),
            "documentChanged:config"
        );
        assert_eq!(ChangeEvent::watcher_error("p", "boom").event_name(), "watcherError");
    }

    #[test]
    fn test_decode_watcher_error_from_foreign_producer() {
        let text = r#"{"event":"watcherError","data":{"projectId":"p","message":"inotify limit","timestamp":9}}"#;
        match ChangeEvent::decode(text).unwrap() {
            ChangeEvent::WatcherError { message, timestamp, .. } => {
                assert_eq!(message, "inotify limit");
                assert_eq!(timestamp, 9);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_decode_unknown_event() {
        let text = r#"{"event":"somethingElse","data":{}}"#;
        assert!(matches!(ChangeEvent::decode(text), Err(ProtocolError::UnknownEvent(_))));
    }

    #[test]
    fn test_decode_unknown_document_type() {
        let text = r#"{"event":"documentChanged:blog","data":{"projectId":"p","relativePath":"x","timestamp":1}}"#;
        assert!(matches!(
            ChangeEvent::decode(text),
            Err(ProtocolError::UnknownDocumentType(_))
        ));
    }

    #[test]
    fn test_decode_garbage() {
        assert!(ChangeEvent::decode("not json").is_err());
    }

    #[test]
    fn test_document_type_paths() {
        for doc_type in DocumentType::ALL {
            assert_eq!(DocumentType::from_relative_path(doc_type.file_name()), Some(doc_type));
            assert_eq!(doc_type.as_str().parse::<DocumentType>().unwrap(), doc_type);
        }
        assert_eq!(DocumentType::from_relative_path("README.md"), None);
    }

    #[test]
    fn test_rpc_error_response() {
        let response = RpcResponse::from_result(5, Err(SyncError::NotFound("conflict x".into())));
        let text = response.encode().unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["error"]["code"], 404);
        assert!(value.get("result").is_none());

        let decoded = RpcResponse::decode(&text).unwrap();
        assert_eq!(decoded.into_result(), Err(SyncError::NotFound("conflict x".into())));
    }

    #[test]
    fn test_rpc_request_shape() {
        let request = RpcRequest {
            id: 1,
            token: None,
            call: RpcCall::FetchDocument {
                project_id: "alpha".into(),
                document_type: DocumentType::Design,
            },
        };
        let text = request.encode().unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["call"]["method"], "fetchDocument");
        assert_eq!(value["call"]["params"]["projectId"], "alpha");
        assert_eq!(value["call"]["params"]["documentType"], "design");
        assert_eq!(RpcRequest::decode(&text).unwrap(), request);
    }
}
