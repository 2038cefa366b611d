//! # Tidepool Client
//!
//! Client-side networking core for the tidepool ledger store: per-server
//! pools of long-lived connections with multiplexed request/response
//! correlation, per-request timeouts, demand-driven reconnect, and a
//! pluggable authentication handshake.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │              StoreClient (facade)               │
//! │  address → pool map, ordered executor, reaper   │
//! ├─────────────────────────────────────────────────┤
//! │           ChannelPool (per server)              │
//! │  N channels, hash-routed by caller key          │
//! ├─────────────────────────────────────────────────┤
//! │         ServerChannel (per connection)          │
//! │  connect → auth → serve state machine,          │
//! │  pending-op queue, completion registry          │
//! ├─────────────────────────────────────────────────┤
//! │              wire (frame codec)                 │
//! │  length-prefixed frames, packed headers         │
//! └─────────────────────────────────────────────────┘
//! ```
//!
//! Submitting an operation picks a channel (`hash(routing key) % N`),
//! registers a completion keyed by (ledger, entry), and writes a frame.
//! Responses are correlated back through the completion registry and the
//! user callback runs on the ordered executor, which serializes callbacks
//! per ledger id. Every submitted operation resolves its callback exactly
//! once: via a response, a write failure, the timeout scan, a disconnect,
//! or client shutdown.
//!
//! ## Quick start
//!
//! ```ignore
//! use tidepool_client::{ClientConfig, StoreClient};
//! use tidepool_core::{ServerAddress, TokioProviders};
//!
//! let client = StoreClient::new(TokioProviders::new(), ClientConfig::default());
//! let addr = ServerAddress::new("store-1.local", 3181);
//! client.add_entry(&addr, ledger, &master_key, entry, payload,
//!     Box::new(|rc, ledger, entry, addr| { /* quorum bookkeeping */ }), 0);
//! ```

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

pub mod auth;
pub mod channel;
pub mod completion;
pub mod config;
pub mod error;
pub mod ordered;
pub mod pool;
pub mod stats;
pub mod wire;

mod client;

pub use auth::{
    AuthCompletion, AuthMessage, AuthProviderFactory, ClientAuthProvider, NullAuthFactory,
};
pub use channel::{ConnectionState, PendingOp, ServerChannel};
pub use client::StoreClient;
pub use completion::{CompletionKey, CompletionRegistry, ReadCallback, WriteCallback};
pub use config::ClientConfig;
pub use error::ErrorCode;
pub use ordered::{ExecutorClosed, OrderedExecutor};
pub use pool::ChannelPool;
pub use stats::{ChannelStats, OpStats, OpStatsSnapshot};
pub use wire::{
    EntryId, LAST_ADD_CONFIRMED, LedgerId, MASTER_KEY_LENGTH, MAX_FRAME_LENGTH, MasterKey,
    PROTOCOL_VERSION,
};
