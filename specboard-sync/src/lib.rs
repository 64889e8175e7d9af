//! # specboard-sync
//!
//! Change-notification and conflict engine for project documents.
//!
//! Keeps every open client of a project's documents (`requirements.md`,
//! `design.md`, `tasks.md`, `config.json`) consistent with the authoritative
//! copy on the server, and surfaces conflicts instead of silently losing edits.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   /events/{id}   ┌─────────────┐   start/stop   ┌──────────────┐
//! │ SyncSession │ ◄──────────────── │ SyncServer  │ ─────────────► │ ChangeSource │
//! │ (per client │      JSON         │  (central)  │                │ (watcher)    │
//! │  + project) │ ────────────────► │             │ ◄───────────── │              │
//! └──────┬──────┘   /rpc           └──────┬──────┘   ChangeEvent  └──────────────┘
//!        │                                 │
//!        ▼                                 ▼
//! ┌─────────────┐                 ┌─────────────────┐
//! │ Document    │                 │ ChannelManager  │ fan-out per project
//! │ trackers    │                 │ ConflictManager │ conflicts, merges,
//! └─────────────┘                 │ DocumentStore   │ integrity warnings
//!                                 └─────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON change events and RPC frames
//! - [`broadcast`]: per-project fan-out with lag accounting
//! - [`watcher`]: reference-counted change sources
//! - [`server`]: WebSocket server and in-process [`api::SyncApi`]
//! - [`client`]: [`api::SyncApi`] over WebSocket
//! - [`session`]: per-client sync state machine with reconnect backoff
//! - [`tracker`]: dirty tracking and conflict detection per document
//! - [`conflict`] / [`merge`]: conflict records, resolution and three-way merge
//! - [`integrity`] / [`observers`]: validation and derived views
//! - [`storage`]: document and conflict stores (memory, filesystem, RocksDB)

pub mod api;
pub mod broadcast;
pub mod client;
pub mod config;
pub mod conflict;
pub mod error;
pub mod integrity;
pub mod merge;
pub mod observers;
pub mod protocol;
pub mod server;
pub mod session;
pub mod storage;
pub mod tracker;
pub mod watcher;

// Re-exports for convenience
pub use api::{dispatch, Subscription, SyncApi};
pub use broadcast::{ChannelManager, ChannelStats, ProjectChannel};
pub use client::RemoteApi;
pub use config::{ServerConfig, SessionConfig, WatcherConfig};
pub use conflict::{
    Conflict, ConflictManager, ConflictType, IntegrityWarning, Resolution, ResolveOutcome,
    ResolveRequest,
};
pub use error::SyncError;
pub use integrity::{check_document, IntegrityReport};
pub use merge::{has_conflict_markers, three_way_merge, LineConflict, MergeResult};
pub use observers::{ContextObserver, ProgressObserver, TaskProgress};
pub use protocol::{ChangeEvent, DocumentType, FileChangeKind, ProtocolError, RpcCall, RpcReply};
pub use server::{ServerStats, SyncServer};
pub use session::{ConnectionStatus, SaveOutcome, SessionEvent, SyncSession, SyncStatus};
pub use storage::{
    ConflictStore, DocumentStore, FsDocumentStore, MemoryConflictStore, MemoryDocumentStore,
    RocksStore, StoreConfig, StoreError,
};
pub use tracker::{DocumentSnapshot, DocumentSyncTracker, RemoteOutcome, WriteOrigin};
pub use watcher::{ChangeSource, ManualChangeSource, PollingWatcher, WatcherRegistry};
