//! # Conclave: replicated total-order message delivery
//!
//! Conclave is a Multi-Paxos engine that delivers a totally ordered
//! stream of client messages identically to every live member of a
//! group, with dynamic membership and peer-snapshot recovery.
//!
//! ## The slot space
//!
//! The total order is indexed by [`Synode`]s — `(group, msgno, node)`
//! triples ordered by `(msgno, node)`. Every member *owns* one slot per
//! message number; only the owner may get a real value chosen there,
//! everyone else is limited to no-ops. That asymmetry buys two things:
//! proposers rarely collide (each proposes into its own slots), and
//! unused slots can be collapsed with a single broadcast instead of a
//! full round.
//!
//! ```text
//! msgno:      4        5        6        7
//!          ┌──────┬──────┬──────┬──────┐
//! node 0   │ "A"  │ noop │ "C"  │  ?   │   ← slots owned by node 0
//! node 1   │ noop │ "B"  │ noop │  ?   │   ← slots owned by node 1
//! node 2   │ noop │ noop │ noop │  ?   │   ← slots owned by node 2
//!          └──────┴──────┴──────┴──────┘
//! delivery order: (4,0) (4,1) (4,2) (5,0) (5,1) ...
//! ```
//!
//! ## The task graph
//!
//! Everything runs as cooperative tasks on one scheduler thread:
//!
//! | Task | Responsibility |
//! |------|----------------|
//! | proposer pool | batch client messages, drive Paxos rounds |
//! | acceptor/learner (per connection) | apply inbound protocol messages |
//! | executor | deliver decided values in order, apply reconfigurations |
//! | sweeper | no-op our own unused slots |
//! | detector / alive | liveness tracking, view changes, pings |
//! | peer (per member) | outbound connection, replies, reconnect |
//!
//! The *event horizon* H bounds how far anyone may run ahead of the
//! executor, which simultaneously backpressures proposers and gives
//! reconfigurations their activation delay: a configuration decided at
//! synod `k` governs synods from `k + H + 1`.
//!
//! ## Crate organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`synode`] | Synods and ballots |
//! | [`site`] | Configurations and their history |
//! | [`msg`] | The protocol message and payload types |
//! | [`machine`] | The per-synod Paxos state machine |
//! | [`cache`] | Bounded machine cache with pinning |
//! | [`engine`] | Shared state: cursors, sites, queues |
//! | [`proposer`] | The proposer pool |
//! | [`acceptor`] | Inbound dispatch |
//! | [`executor`] | Ordered delivery and exit logic |
//! | [`sweeper`] | Idle-slot collapse |
//! | [`detector`] | Liveness and views |
//! | [`reconfig`] | Membership and horizon changes |
//! | [`recovery`] | Snapshots and join-time catch-up |
//! | [`fsm`] | The lifecycle state machine |
//! | [`wire`] | Framing and the version handshake |
//! | [`net`] | Listener and peer connection tasks |

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

pub mod acceptor;
pub mod app;
pub mod cache;
pub mod config;
pub mod detector;
pub mod engine;
pub mod executor;
pub mod fsm;
pub mod machine;
pub mod msg;
pub mod net;
pub mod peer;
pub mod proposer;
pub mod queue;
pub mod reconfig;
pub mod recovery;
pub mod site;
pub mod sweeper;
pub mod synode;
pub mod wire;

pub use app::{Application, DeliveryStatus, NullApplication};
pub use config::EngineConfig;
pub use engine::{Engine, Env, FatalError};
pub use fsm::{FsmEvent, FsmState};
pub use msg::{AppData, Cargo, ClientReply, Member, Op, PaxMsg, ProtoVersion};
pub use site::{EVENT_HORIZON_MAX, EVENT_HORIZON_MIN, Site};
pub use synode::{Ballot, NULL_SYNODE, Synode};
