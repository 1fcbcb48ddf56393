//! Outbound peer handles.
//!
//! A [`Peer`] is the engine-side handle for one remote member: an outbound
//! message queue drained by a sender task, plus the connection health flags
//! the detector and the fast-skip heuristic consume. The handle itself is
//! plain state; the tasks that move bytes live in [`crate::net`].

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::time::Duration;

use conclave_core::NetworkAddress;
use tokio::sync::Notify;

use crate::msg::{PaxMsg, ProtoVersion};

/// Handle for one remote member.
pub struct Peer {
    /// Where the member listens.
    pub address: NetworkAddress,

    /// Negotiated protocol version for the outbound connection.
    pub proto: Cell<ProtoVersion>,

    /// Whether the outbound connection is currently up.
    pub connected: Cell<bool>,

    /// Set when the connection was aborted; cleared on reconnect.
    /// The detector treats unreachable peers as silent.
    pub unreachable: Cell<bool>,

    /// Set when the peer is known dead enough that the executor may
    /// fast-skip its slots without a full read round.
    pub fast_skip_allowed: Cell<bool>,

    /// Set when the peer was removed from the group; messages from
    /// invalid peers are not dispatched.
    pub invalid: Cell<bool>,

    /// Last time anything arrived from this peer.
    pub last_active: Cell<Duration>,

    /// Ping-storm guard: when a peer keeps probing us although we are
    /// booted, its outbound connection is likely half-broken.
    pub last_ping_received: Cell<Duration>,
    /// Pings received inside the current gathering window.
    pub pings_received: Cell<u32>,

    /// Last time a protocol mismatch against this peer was logged.
    pub last_proto_warning: Cell<Option<Duration>>,

    /// Whether a connection-pumping task owns this peer already.
    pub pump_started: Cell<bool>,

    queue: RefCell<VecDeque<PaxMsg>>,
    queued: Notify,
}

/// Pings inside the gathering window after which the outbound connection
/// is shut down so it can be re-established cleanly.
pub const PINGS_BEFORE_CONNECTION_SHUTDOWN: u32 = 3;

/// Length of the ping gathering window.
pub const PING_WINDOW: Duration = Duration::from_secs(5);

impl Peer {
    /// Create a handle for a member at the given address.
    pub fn new(address: NetworkAddress) -> Self {
        Self {
            address,
            proto: Cell::new(ProtoVersion::CURRENT),
            connected: Cell::new(false),
            unreachable: Cell::new(false),
            fast_skip_allowed: Cell::new(false),
            invalid: Cell::new(false),
            last_active: Cell::new(Duration::ZERO),
            last_ping_received: Cell::new(Duration::ZERO),
            pings_received: Cell::new(0),
            last_proto_warning: Cell::new(None),
            pump_started: Cell::new(false),
            queue: RefCell::new(VecDeque::new()),
            queued: Notify::new(),
        }
    }

    /// Queue a message for sending.
    pub fn send(&self, msg: PaxMsg) {
        self.queue.borrow_mut().push_back(msg);
        self.queued.notify_one();
    }

    /// Put a message back at the front of the queue, preserving order
    /// after a failed write.
    pub fn requeue(&self, msg: PaxMsg) {
        self.queue.borrow_mut().push_front(msg);
        self.queued.notify_one();
    }

    /// Take the next queued message, waiting until one arrives.
    pub async fn next_outbound(&self) -> PaxMsg {
        loop {
            if let Some(msg) = self.queue.borrow_mut().pop_front() {
                return msg;
            }
            self.queued.notified().await;
        }
    }

    /// Drain everything queued right now. Used by test harnesses that
    /// route messages without sockets.
    pub fn drain(&self) -> Vec<PaxMsg> {
        self.queue.borrow_mut().drain(..).collect()
    }

    /// Note inbound activity from this peer.
    pub fn note_active(&self, now: Duration) {
        self.last_active.set(now);
        self.unreachable.set(false);
    }

    /// Record an incoming ping and decide whether the outbound connection
    /// should be shut down because the peer clearly cannot reach us the
    /// normal way.
    pub fn record_ping(&self, now: Duration) -> bool {
        if now.saturating_sub(self.last_ping_received.get()) < PING_WINDOW {
            self.pings_received.set(self.pings_received.get() + 1);
        } else {
            self.pings_received.set(1);
        }
        self.last_ping_received.set(now);

        self.connected.get() && self.pings_received.get() == PINGS_BEFORE_CONNECTION_SHUTDOWN
    }

    /// Mark the peer aborted: connection down, silence assumed.
    pub fn mark_unreachable(&self) {
        self.connected.set(false);
        self.unreachable.set(true);
    }
}
