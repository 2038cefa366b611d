//! # tidepool-core
//!
//! Environment abstractions for the tidepool ledger store client.
//!
//! Tidepool client code never talks to the runtime directly. Everything the
//! client needs from the outside world — sockets, clocks, task spawning —
//! goes through a small set of provider traits, so the same protocol logic
//! can run against real Tokio I/O in production and against scripted or
//! failing implementations in tests.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                tidepool-client                       │
//! │   Uses: NetworkProvider, TimeProvider, TaskProvider  │
//! └───────────────────────┬──────────────────────────────┘
//!                         │ depends on traits
//!          ┌──────────────┴──────────────┐
//!          ▼                             ▼
//!   ┌─────────────────┐         ┌──────────────────┐
//!   │     Tests       │         │   Production     │
//!   │ mock providers  │         │ TokioNetworkProv.│
//!   │ scripted peers  │         │ TokioTimeProvider│
//!   └─────────────────┘         └──────────────────┘
//! ```
//!
//! The design is single-core: provider traits are `?Send` and tasks are
//! spawned onto the current thread. Do not call tokio directly from client
//! code — go through the providers.
//!
//! | Trait | Production | Purpose |
//! |-------|------------|---------|
//! | [`NetworkProvider`] | [`TokioNetworkProvider`] | Dial storage nodes |
//! | [`TimeProvider`] | [`TokioTimeProvider`] | Sleep, timeout, now() |
//! | [`TaskProvider`] | [`TokioTaskProvider`] | Local task spawning |
//!
//! The client is a pure dialer; there is deliberately no listen/accept
//! surface here.
//!
//! The crate also carries the [`MessageCodec`] serialization seam (with a
//! [`JsonCodec`] default) and [`ServerAddress`], the host+port identity of a
//! storage node.

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

mod codec;
mod network;
mod providers;
mod task;
mod time;
mod types;

pub use codec::{CodecError, JsonCodec, MessageCodec};
pub use network::{NetworkProvider, TcpOptions, TokioNetworkProvider};
pub use providers::{Providers, TokioProviders};
pub use task::{TaskProvider, TokioTaskProvider};
pub use time::{TimeError, TimeProvider, TokioTimeProvider};
pub use types::{AddressParseError, ServerAddress};
