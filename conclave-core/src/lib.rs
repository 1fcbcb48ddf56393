//! # conclave-core
//!
//! Environment abstractions for the conclave replication engine.
//!
//! The engine never talks to the operating system directly. Time, networking,
//! task spawning and randomness are reached through a small set of provider
//! traits, so the same protocol code can run against the real tokio runtime
//! in production or against a deterministic harness in tests.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                  Engine code                         │
//! │   Uses: TimeProvider, NetworkProvider, TaskProvider  │
//! └───────────────────────┬──────────────────────────────┘
//!                         │ depends on traits
//!                         ▼
//!               ┌─────────────────────┐
//!               │   TokioProviders    │
//!               │   (real I/O, one    │
//!               │    scheduler thread)│
//!               └─────────────────────┘
//! ```
//!
//! The engine is single-threaded by design: no trait here carries a `Send`
//! bound, and the production task provider spawns onto a tokio `LocalSet`.
//!
//! ## Contents
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`time`](TimeProvider) | Sleep, timeout and monotonic now() |
//! | [`network`](NetworkProvider) | Connect, bind, accept |
//! | [`task`](TaskProvider) | Spawning `!Send` tasks |
//! | [`random`](RandomProvider) | Peer selection and jitter |
//! | [`codec`](MessageCodec) | Pluggable body serialization |
//! | [`address`](NetworkAddress) | Addresses and node identities |

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

mod address;
mod codec;
mod network;
mod providers;
mod random;
mod task;
mod time;

pub use address::{AddressParseError, NetworkAddress, NodeUid};
pub use codec::{CodecError, JsonCodec, MessageCodec};
pub use network::{NetworkProvider, TcpListenerTrait, TokioNetworkProvider, TokioTcpListener};
pub use providers::{Providers, TokioProviders};
pub use random::{RandomProvider, TokioRandomProvider};
pub use task::{TaskProvider, TokioTaskProvider};
pub use time::{TimeError, TimeProvider, TokioTimeProvider};
