//! Structured sequence numbers and ballots.
//!
//! A [`Synode`] names one slot in the total order: `(group_id, msgno, node)`.
//! The order over slots is lexicographic on `(msgno, node)` — first all
//! slots of message number N (one per member), then all slots of N+1, and
//! so on. `group_id` is a namespace: synods from different groups never
//! compare, they belong to different incarnations of the service.
//!
//! A synod is *owned* by the member whose index equals `synode.node`. Only
//! the owner may get a non-noop value chosen there; everyone else is
//! restricted to `no_op`, which is what makes the fast skip path safe.
//!
//! A [`Ballot`] orders competing proposals within one synod.

use serde::{Deserialize, Serialize};

/// One slot in the total order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Synode {
    /// Namespace: identifies the group incarnation.
    pub group_id: u32,
    /// Message number, the major component of the order.
    pub msgno: u64,
    /// Owning member index, the minor component of the order.
    pub node: u16,
}

/// The null synode: not a valid slot, used as "unset".
pub const NULL_SYNODE: Synode = Synode {
    group_id: 0,
    msgno: 0,
    node: 0,
};

impl Synode {
    /// Create a new synode.
    pub const fn new(group_id: u32, msgno: u64, node: u16) -> Self {
        Self {
            group_id,
            msgno,
            node,
        }
    }

    /// Whether this is the null synode.
    pub fn is_null(&self) -> bool {
        *self == NULL_SYNODE
    }

    /// Strictly-before in the total order. Only meaningful within one group.
    pub fn before(&self, other: &Synode) -> bool {
        (self.msgno, self.node) < (other.msgno, other.node)
    }

    /// Strictly-after in the total order. Only meaningful within one group.
    pub fn after(&self, other: &Synode) -> bool {
        (self.msgno, self.node) > (other.msgno, other.node)
    }

    /// Whether two synods live in different groups.
    pub fn group_mismatch(&self, other: &Synode) -> bool {
        self.group_id != other.group_id
    }

    /// The next slot in the total order, given the member count of the
    /// site the slot belongs to.
    pub fn incr(&self, max_nodes: u16) -> Synode {
        let mut next = *self;
        next.node += 1;
        if max_nodes == 0 || next.node >= max_nodes {
            next.node = 0;
            next.msgno += 1;
        }
        next
    }

    /// The first slot of the next message number.
    pub fn incr_msgno(&self) -> Synode {
        Synode::new(self.group_id, self.msgno + 1, 0)
    }

    /// Same slot with a different owning node.
    pub fn with_node(&self, node: u16) -> Synode {
        Synode::new(self.group_id, self.msgno, node)
    }
}

impl std::fmt::Display for Synode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{{:x} {} {}}}", self.group_id, self.msgno, self.node)
    }
}

/// Orders competing proposals within a synod.
///
/// `cnt = -1` means "never promised" — any real proposal beats it.
/// Lexicographic order on `(cnt, node)` breaks ties between members that
/// picked the same count.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Ballot {
    /// Proposal count. `-1` denotes "never promised".
    pub cnt: i32,
    /// Member that issued this ballot.
    pub node: u16,
}

impl Ballot {
    /// Create a new ballot.
    pub const fn new(cnt: i32, node: u16) -> Self {
        Self { cnt, node }
    }

    /// The initial ballot: never promised.
    pub const fn initial(node: u16) -> Self {
        Self { cnt: -1, node }
    }

    /// Bump the count by a large saturating delta so any in-flight round
    /// loses. Used when forcing delivery during quorum-loss recovery.
    pub fn force_bump(&mut self) {
        let delta = (i32::MAX - self.cnt.max(0)) / 3;
        self.cnt += delta;
    }
}

impl Default for Ballot {
    fn default() -> Self {
        Self { cnt: -1, node: 0 }
    }
}

impl std::fmt::Display for Ballot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ballot({} {})", self.cnt, self.node)
    }
}
