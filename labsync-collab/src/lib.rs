//! # labsync-collab: shared lab-instrument state with undo and hardware RPC
//!
//! Many clients observe and edit one versioned JSON document per instrument
//! page. Writes are optimistic (the revision is the concurrency token),
//! every accepted change is pushed to subscribers, and commands reach the
//! hardware through an HTTP gateway.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌──────────────┐
//! │ StateClient │ ◄─────────────────► │ StateServer  │
//! │ (per UI)    │     JSON frames     │ (central)    │
//! └─────────────┘                     └──────┬───────┘
//!                           ┌────────────────┼─────────────────┐
//!                           ▼                ▼                 ▼
//!                   ┌───────────────┐ ┌─────────────┐ ┌──────────────────┐
//!                   │ HistoryEngine │ │ RpcGateway  │ │ ChannelScheduler │
//!                   │ undo · redo   │ │ POST /rpc   │ │ round-robin tick │
//!                   └──┬─────────┬──┘ └──────▲──────┘ └───┬──────────┬───┘
//!                      │         │           │            │ read     │ call
//!                      ▼         ▼           └────────────┼──────────┘
//!               DocumentStore  EventBus ◄─────────────────┘
//!               HistoryFile    (fan-out)
//! ```
//!
//! ## Modules
//!
//! - [`storage`]: Atomic JSON files for pages, endpoints and history
//! - [`broadcast`]: Per-document event fan-out
//! - [`history`]: Revisioned store with bounded undo/redo
//! - [`gateway`]: Outbound RPC with timeout and reply normalization
//! - [`scheduler`]: Channel cycling, at most one channel powered
//! - [`protocol`]: JSON wire frames
//! - [`server`]: WebSocket server
//! - [`client`]: WebSocket client with conflict retry
//! - [`config`]: File and environment configuration

pub mod storage;
pub mod broadcast;
pub mod history;
pub mod gateway;
pub mod scheduler;
pub mod protocol;
pub mod server;
pub mod client;
pub mod config;

#[cfg(test)]
mod test_support;

// Re-exports for convenience
pub use storage::{DocumentStore, EndpointRegistry, HistoryFile, StoreError};
pub use broadcast::{BroadcastGroup, BroadcastStats, EventBus, ListenerHandle, SnapshotEvent, Subscription};
pub use history::{HistoryEngine, HistoryError};
pub use gateway::{GatewayError, RpcCall, RpcGateway, DEFAULT_RPC_TIMEOUT};
pub use scheduler::{ChannelPlan, ChannelScheduler, SchedulerConfig, TickOutcome};
pub use protocol::{ProtocolError, Request, ServerFrame};
pub use server::{ServerConfig, ServerStats, Services, StateServer};
pub use client::{ClientEvent, ConnectionState, StateClient};
pub use config::{ConfigError, GatewayConfig, HistoryConfig, LabConfig, StorageConfig};
