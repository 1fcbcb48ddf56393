//! Protocol messages.
//!
//! One message type, [`PaxMsg`], travels between members for every purpose:
//! Paxos rounds, learns, liveness pings, boot/snapshot exchange and client
//! commands. The [`Op`] tag selects the handler; the optional payload chain
//! carries client data or a configuration command.
//!
//! Tags are stable: they are the wire contract between protocol versions,
//! so variants are never reordered or removed.

use conclave_core::{NetworkAddress, NodeUid};
use serde::{Deserialize, Serialize};

use crate::synode::{Ballot, NULL_SYNODE, Synode};

/// Protocol version spoken on a connection.
///
/// Negotiated at connect time: the client advertises its maximum, the peer
/// answers the common maximum. Capabilities are keyed off the version.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ProtoVersion(pub u16);

impl ProtoVersion {
    /// Oldest version this implementation can speak.
    pub const BASE: ProtoVersion = ProtoVersion(1);
    /// First version that supports reconfigurable event horizons.
    pub const HORIZON_AWARE: ProtoVersion = ProtoVersion(2);
    /// First version that drops intermediate forced configs and views.
    pub const IGNORES_INTERMEDIATE_FORCED: ProtoVersion = ProtoVersion(3);
    /// Newest version this implementation speaks.
    pub const CURRENT: ProtoVersion = ProtoVersion(3);

    /// Whether a group at this version may reconfigure its event horizon.
    pub fn reconfigurable_horizon(&self) -> bool {
        *self >= Self::HORIZON_AWARE
    }

    /// Whether members at this version ignore forced configs that are not
    /// the one being waited for.
    pub fn ignores_intermediate_forced(&self) -> bool {
        *self >= Self::IGNORES_INTERMEDIATE_FORCED
    }
}

impl std::fmt::Display for ProtoVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// One member in a configuration: where it listens and who it is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    /// The member's listening address.
    pub address: NetworkAddress,
    /// Identity of this incarnation of the member.
    pub uid: NodeUid,
    /// Highest protocol version the member speaks.
    pub max_proto: ProtoVersion,
}

impl Member {
    /// Create a member record at the current protocol version.
    pub fn new(address: NetworkAddress, uid: NodeUid) -> Self {
        Self {
            address,
            uid,
            max_proto: ProtoVersion::CURRENT,
        }
    }
}

/// Message operation tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Op {
    /// A client command entering the engine.
    ClientMsg,
    /// Machine created, nothing sent yet.
    Initial,
    /// Paxos phase 1 request.
    Prepare,
    /// Phase 1 acknowledgment carrying a previously accepted value.
    AckPrepare,
    /// Phase 1 acknowledgment with nothing accepted.
    AckPrepareEmpty,
    /// Paxos phase 2 request.
    Accept,
    /// Phase 2 acknowledgment.
    AckAccept,
    /// Phase 2 acknowledgment that also requests a skip of the replier's
    /// own slot at the same message number.
    MultiAckAccept,
    /// Broadcast of a chosen value.
    Learn,
    /// Compact learn: ballot only, receiver already holds the value.
    TinyLearn,
    /// Learn replayed during recovery catch-up.
    RecoverLearn,
    /// Collapse a slot to `no_op` without a round.
    Skip,
    /// Ask a peer for the outcome of a synod.
    Read,
    /// Liveness beacon.
    IAmAlive,
    /// Liveness probe.
    AreYouAlive,
    /// Recovering node asking for a snapshot.
    NeedBoot,
    /// Snapshot of config history + application state.
    Snapshot,
    /// "That synod is long gone" — told to a node too far behind.
    Die,
    /// Reply to a client command.
    ClientReply,
}

/// Whether a proposed/learned value is a real payload or a filler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ValueKind {
    /// A client payload.
    #[default]
    Normal,
    /// The hole-filling no-op.
    NoOp,
}

/// Client reply codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientReply {
    /// Request accepted.
    Ok,
    /// Request rejected.
    Fail,
    /// Not ready, try again.
    Retry,
}

/// Payload intent of an [`AppData`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Cargo {
    /// Opaque application bytes.
    App(Vec<u8>),
    /// Bootstrap configuration: the initial member list.
    UnifiedBoot(Vec<Member>),
    /// Add members to the group.
    AddNode(Vec<Member>),
    /// Remove members from the group.
    RemoveNode(Vec<Member>),
    /// Replace the member list without a quorum of the old one.
    ForceConfig(Vec<Member>),
    /// Reconfigure the event horizon.
    SetEventHorizon(u32),
    /// Query the current event horizon.
    GetEventHorizon,
    /// Query the decided payloads of specific synods.
    GetSynodeAppData(Vec<Synode>),
    /// Resize the machine cache.
    SetCacheLimit(u64),
    /// Register an address whose true removal the detector should report.
    SetNotifyTrulyRemove(String),
    /// Membership view as seen by the detector.
    View(Vec<bool>),
    /// Identity advertisement inside a `need_boot`.
    BootIdentity(Member),
    /// Ask the engine to stop and exit.
    TerminateAndExit,
    /// Exit and retire the group id.
    Exit,
    /// Terminate, retiring the group id.
    Reset,
    /// Terminate without retiring the group id.
    RemoveReset,
    /// Turn this connection into a local signalling connection.
    ConvertIntoLocalServer,
    /// Arbitrator toggles, acknowledged but otherwise inert.
    EnableArbitrator,
    /// See [`Cargo::EnableArbitrator`].
    DisableArbitrator,
}

impl Cargo {
    /// Whether this payload is a configuration command.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Cargo::UnifiedBoot(_)
                | Cargo::AddNode(_)
                | Cargo::RemoveNode(_)
                | Cargo::SetEventHorizon(_)
                | Cargo::ForceConfig(_)
        )
    }

    /// Whether this payload is a view message.
    pub fn is_view(&self) -> bool {
        matches!(self, Cargo::View(_))
    }
}

/// Identity a proposer stamps on a payload so it can recognize its own
/// value when the round settles: the proposer's process id plus the synod
/// it first tried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UniqueId {
    /// Process id of the branding proposer.
    pub group_id: u32,
    /// Synod the payload was first proposed at.
    pub synode: Synode,
}

/// One client payload (or command) with its bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppData {
    /// Group the payload is aimed at; 0 means "whatever group".
    pub group_id: u32,
    /// For config commands: the synod the command was proposed at
    /// (its boot key). Determines the new site's activation point.
    pub app_key: Synode,
    /// Log sequence number: sender order, survives retransmission.
    pub lsn: u64,
    /// Brand identifying the proposer's attempt.
    pub unique_id: UniqueId,
    /// What the payload is.
    pub cargo: Cargo,
}

impl AppData {
    /// A payload carrying opaque application bytes.
    pub fn app(data: Vec<u8>) -> Self {
        Self {
            group_id: 0,
            app_key: NULL_SYNODE,
            lsn: 0,
            unique_id: UniqueId::default(),
            cargo: Cargo::App(data),
        }
    }

    /// A payload carrying a command, aimed at a group.
    pub fn command(group_id: u32, cargo: Cargo) -> Self {
        Self {
            group_id,
            app_key: Synode::new(group_id, 0, 0),
            lsn: 0,
            unique_id: UniqueId::default(),
            cargo,
        }
    }

    /// Approximate payload size for batching limits.
    pub fn size(&self) -> usize {
        match &self.cargo {
            Cargo::App(data) => data.len(),
            _ => std::mem::size_of::<Self>(),
        }
    }
}

/// A configuration as exported into a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigExport {
    /// First synod the configuration governs.
    pub start: Synode,
    /// Synod the configuration was proposed at.
    pub boot_key: Synode,
    /// Member list.
    pub nodes: Vec<Member>,
    /// Event horizon.
    pub event_horizon: u32,
    /// Group protocol version.
    pub x_proto: ProtoVersion,
}

/// Snapshot shipped to a recovering node: the exported configuration
/// history, the application's own snapshot blob, and the log window the
/// sender will replay as `recover_learn`s.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineSnapshot {
    /// Configuration history, newest first.
    pub configs: Vec<ConfigExport>,
    /// Opaque application snapshot.
    pub app_snap: Vec<u8>,
    /// Every synod at or below this is covered by `app_snap`.
    pub log_start: Synode,
    /// Highest synod the sender knew when exporting.
    pub log_end: Synode,
}

impl EngineSnapshot {
    /// Highest boot key in the exported history, used to rank snapshots.
    pub fn highest_boot_key(&self) -> Synode {
        self.configs
            .iter()
            .map(|c| c.boot_key)
            .fold(NULL_SYNODE, |acc, bk| if bk.after(&acc) { bk } else { acc })
    }
}

/// The decided payloads of one synod, as returned to a client query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SynodeAppData {
    /// The synod queried.
    pub synode: Synode,
    /// Its decided payload chain; empty when undecided or uncached.
    pub payloads: Vec<AppData>,
}

/// The protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaxMsg {
    /// Sending member index.
    pub from: u16,
    /// Destination member index.
    pub to: u16,
    /// Group the message belongs to.
    pub group_id: u32,
    /// Operation.
    pub op: Op,
    /// Target synod.
    pub synode: Synode,
    /// Ballot of the proposal this message carries or answers.
    pub proposal: Ballot,
    /// Ballot being acknowledged. Acks reference only the ballot, never
    /// the proposal message itself, which keeps replies cycle-free.
    pub reply_to: Ballot,
    /// Whether the value is a payload or a no-op.
    pub value_kind: ValueKind,
    /// Payload chain. Empty for pure protocol messages.
    pub payloads: Vec<AppData>,
    /// Bypass horizon and majority checks (quorum-loss recovery).
    pub force_delivery: bool,
    /// Sender's delivered cursor, piggybacked for the detector.
    pub delivered: Synode,
    /// Sender's view of the highest synod, piggybacked.
    pub max_synode: Synode,
    /// Snapshot payload for [`Op::Snapshot`].
    pub snapshot: Option<Box<EngineSnapshot>>,
    /// Response payload for `GetSynodeAppData`.
    pub synode_app_data: Vec<SynodeAppData>,
    /// Response payload for `GetEventHorizon`.
    pub event_horizon: Option<u32>,
    /// Reply code for [`Op::ClientReply`].
    pub cli_err: Option<ClientReply>,
}

/// Node index used when a message has no meaningful member destination.
pub const VOID_NODE: u16 = u16::MAX;

impl PaxMsg {
    /// A blank message for the given synod.
    pub fn new(synode: Synode) -> Self {
        Self {
            from: VOID_NODE,
            to: VOID_NODE,
            group_id: synode.group_id,
            op: Op::Initial,
            synode,
            proposal: Ballot::default(),
            reply_to: Ballot::default(),
            value_kind: ValueKind::Normal,
            payloads: Vec::new(),
            force_delivery: false,
            delivered: NULL_SYNODE,
            max_synode: NULL_SYNODE,
            snapshot: None,
            synode_app_data: Vec::new(),
            event_horizon: None,
            cli_err: None,
        }
    }

    /// A blank message with an operation set.
    pub fn for_op(op: Op, synode: Synode) -> Self {
        let mut msg = Self::new(synode);
        msg.op = op;
        msg
    }

    /// First payload in the chain, if any.
    pub fn first_cargo(&self) -> Option<&Cargo> {
        self.payloads.first().map(|a| &a.cargo)
    }

    /// Whether the message value is the no-op filler.
    pub fn is_noop(&self) -> bool {
        self.value_kind == ValueKind::NoOp
    }

    /// Turn this message into a no-op of the given protocol op.
    pub fn make_noop(&mut self, op: Op) {
        self.op = op;
        self.value_kind = ValueKind::NoOp;
        self.payloads.clear();
    }

    /// A reply template: same synod, addressed back at the sender.
    pub fn reply_template(&self, op: Op) -> PaxMsg {
        let mut reply = PaxMsg::for_op(op, self.synode);
        reply.group_id = self.group_id;
        reply.to = self.from;
        reply.reply_to = self.proposal;
        reply
    }

    /// Whether a learned message matches a proposal by brand.
    pub fn matches_mine(&self, mine: &PaxMsg) -> bool {
        match (self.payloads.first(), mine.payloads.first()) {
            (Some(learned), Some(proposed)) => learned.unique_id == proposed.unique_id,
            _ => false,
        }
    }
}
