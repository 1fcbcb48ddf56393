//! The per-synod Paxos state machine.
//!
//! One [`Machine`] exists (in cache) for every reachable synod. It holds the
//! three classic roles at once:
//!
//! - **acceptor**: the promise ballot and the accepted proposal,
//! - **proposer**: the round this node is driving, if any,
//! - **learner**: the chosen value once known.
//!
//! Every handler is a pure transition on [`PaxState`]: it takes the incoming
//! message, mutates the state, and returns the outgoing message (if any).
//! Side effects — sending, waking waiters, installing configurations — are
//! the dispatcher's business, which is what makes these transitions unit
//! testable in isolation.
//!
//! ## Safety invariants
//!
//! - `acceptor.promise` never decreases.
//! - Once `learner.msg` is set it never changes: learns are idempotent and
//!   re-learns are ignored.
//! - A no-op prepare may slip past the promise check when the accepted
//!   value is already a no-op (`noop_match`) — both sides agree on the
//!   outcome, so no harm is possible.

use std::rc::Rc;
use std::time::Duration;

use tokio::sync::Notify;

use crate::msg::{Op, PaxMsg, ValueKind};
use crate::site::Site;
use crate::synode::{Ballot, Synode};

/// Bitset of member indices that answered a phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeSet(u64);

impl NodeSet {
    /// Empty set.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Remove every member.
    pub fn clear(&mut self) {
        self.0 = 0;
    }

    /// Add a member index.
    pub fn set(&mut self, node: u16) {
        if node < 64 {
            self.0 |= 1 << node;
        }
    }

    /// Whether a member index is present.
    pub fn contains(&self, node: u16) -> bool {
        node < 64 && self.0 & (1 << node) != 0
    }

    /// Number of members present.
    pub fn count(&self) -> u32 {
        self.0.count_ones()
    }
}

/// How many answers decide a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Consensus {
    /// Strictly more than half the members.
    #[default]
    Majority,
    /// Every member.
    All,
}

/// Quorum evaluation context: the governing site, the consensus mode, and
/// the forced configuration if a quorum-loss recovery is in progress.
pub struct QuorumRule<'a> {
    /// Site whose members vote.
    pub site: &'a Site,
    /// Majority or unanimity.
    pub consensus: Consensus,
    /// When set, only answers from members of this configuration count,
    /// and all of them are required.
    pub forced: Option<&'a Site>,
}

impl QuorumRule<'_> {
    /// Whether the answer set decides the phase.
    pub fn reached(&self, answers: &NodeSet) -> bool {
        if let Some(forced) = self.forced {
            // Count only voters that survive into the forced config.
            let mut count = 0u32;
            for (idx, member) in self.site.nodes.iter().enumerate() {
                if answers.contains(idx as u16) && forced.has_address(member) {
                    count += 1;
                }
            }
            return count as usize == forced.nodes.len();
        }
        let n = self.site.nodes.len() as u32;
        match self.consensus {
            Consensus::Majority => answers.count() * 2 > n,
            Consensus::All => answers.count() == n,
        }
    }
}

/// Acceptor role state.
#[derive(Debug, Default)]
pub struct AcceptorState {
    /// Highest ballot promised.
    pub promise: Ballot,
    /// Accepted proposal, if any.
    pub msg: Option<Rc<PaxMsg>>,
}

/// Proposer role state.
#[derive(Debug, Default)]
pub struct ProposerState {
    /// Ballot currently driven.
    pub bal: Ballot,
    /// The value being proposed.
    pub msg: Option<Rc<PaxMsg>>,
    /// Members that answered phase 1 of `bal`.
    pub prep_nodeset: NodeSet,
    /// Members that answered phase 2 of `bal`.
    pub prop_nodeset: NodeSet,
    /// Last ballot for which phase 2 was issued; guards double-sends.
    pub sent_prop: Ballot,
    /// Last ballot for which a learn was issued; guards double-sends.
    pub sent_learn: Ballot,
}

/// Learner role state.
#[derive(Debug, Default)]
pub struct LearnerState {
    /// The chosen value, once known.
    pub msg: Option<Rc<PaxMsg>>,
}

/// Outcome of a tiny learn.
#[derive(Debug, PartialEq, Eq)]
pub enum TinyLearnOutcome {
    /// The referenced ballot matched our accepted value; now learned.
    Learned,
    /// We do not hold the value; ask the owner with a read.
    NeedRead,
    /// Already finished, nothing to do.
    AlreadyFinished,
}

/// The mutable Paxos state for one synod.
#[derive(Debug)]
pub struct PaxState {
    /// The synod this machine decides.
    pub synode: Synode,
    /// Acceptor role.
    pub acceptor: AcceptorState,
    /// Proposer role.
    pub proposer: ProposerState,
    /// Learner role.
    pub learner: LearnerState,
    /// Current operation stage, for introspection and the sweeper.
    pub stage: Op,
    /// Deliver regardless of horizon and majority bookkeeping.
    pub force_delivery: bool,
    /// This node is the one driving a forced configuration.
    pub enforcer: bool,
    /// Last activity, feeds cache decisions and `recently_active`.
    pub last_modified: Duration,
    /// Held by a proposer task for the duration of a round.
    pub locked: bool,
}

impl PaxState {
    fn new(synode: Synode) -> Self {
        Self {
            synode,
            acceptor: AcceptorState::default(),
            proposer: ProposerState::default(),
            learner: LearnerState::default(),
            stage: Op::Initial,
            force_delivery: false,
            enforcer: false,
            last_modified: Duration::ZERO,
            locked: false,
        }
    }

    /// Whether the synod outcome is known.
    pub fn finished(&self) -> bool {
        self.learner.msg.is_some()
    }

    /// Whether some proposal has been accepted.
    pub fn accepted(&self) -> bool {
        self.acceptor.msg.is_some()
    }

    /// Whether the machine saw activity within the window.
    pub fn recently_active(&self, now: Duration, window: Duration) -> bool {
        self.last_modified != Duration::ZERO
            && now.saturating_sub(self.last_modified) < window
    }

    /// Whether the sweeper may collapse this slot: untouched by any round.
    pub fn idle(&self) -> bool {
        !self.locked
            && !self.force_delivery
            && self.acceptor.promise.cnt <= 0
            && !self.accepted()
            && !self.finished()
    }

    fn noop_match(&self, m: &PaxMsg) -> bool {
        m.is_noop()
            && self
                .acceptor
                .msg
                .as_ref()
                .is_some_and(|accepted| accepted.is_noop())
    }

    /// Teach a node that missed the outcome: a learn reply carrying the
    /// chosen value. `TinyLearn` when the value has no payload (a no-op),
    /// full `Learn` otherwise.
    pub fn learn_for_ignorant(&self, m: &PaxMsg) -> Option<PaxMsg> {
        let learned = self.learner.msg.as_ref()?;
        let mut reply = m.reply_template(Op::Learn);
        reply.proposal = learned.proposal;
        reply.value_kind = learned.value_kind;
        reply.payloads = learned.payloads.clone();
        if reply.payloads.is_empty() {
            reply.op = Op::TinyLearn;
        }
        Some(reply)
    }

    /// Phase 1 acceptor decision.
    ///
    /// A higher ballot gets a promise; an equal-or-lower one is ignored,
    /// except when both the incoming proposal and our accepted value are
    /// no-ops, where answering is harmless and avoids a stall.
    pub fn handle_prepare(&mut self, m: &PaxMsg, now: Duration) -> Option<PaxMsg> {
        if self.finished() {
            return self.learn_for_ignorant(m);
        }

        let greater = m.proposal > self.acceptor.promise;
        if !greater && !self.noop_match(m) {
            return None;
        }
        self.last_modified = now;
        if greater {
            self.acceptor.promise = m.proposal;
        }

        let reply = match &self.acceptor.msg {
            Some(accepted) => {
                let mut reply = m.reply_template(Op::AckPrepare);
                reply.proposal = accepted.proposal;
                reply.value_kind = accepted.value_kind;
                reply.payloads = accepted.payloads.clone();
                reply
            }
            None => {
                let mut reply = m.reply_template(Op::AckPrepareEmpty);
                reply.proposal = m.proposal;
                reply
            }
        };
        Some(reply)
    }

    /// Phase 2 acceptor decision.
    ///
    /// `skip_next` turns the acknowledgment into a `MultiAckAccept`, which
    /// additionally asks the proposer to skip our own slot at the same
    /// message number (fast-skip companion).
    pub fn handle_accept(&mut self, m: &PaxMsg, now: Duration, skip_next: bool) -> Option<PaxMsg> {
        if self.finished() {
            return self.learn_for_ignorant(m);
        }
        if self.acceptor.promise > m.proposal && !self.noop_match(m) {
            return None;
        }
        self.last_modified = now;
        self.acceptor.msg = Some(Rc::new(m.clone()));
        let op = if skip_next {
            Op::MultiAckAccept
        } else {
            Op::AckAccept
        };
        // The acknowledgment repeats the accepted ballot; the proposer's
        // learn gate keys off it.
        let mut reply = m.reply_template(op);
        reply.proposal = m.proposal;
        Some(reply)
    }

    /// Phase 1 proposer decision: account the answer, adopt a
    /// higher-ballot accepted value if the ack carries one, and when a
    /// fresh majority exists, produce the phase 2 message.
    pub fn handle_ack_prepare(&mut self, m: &PaxMsg, rule: &QuorumRule<'_>) -> Option<PaxMsg> {
        if self.finished() {
            return None;
        }
        if m.reply_to != self.proposer.bal {
            return None;
        }
        if rule.site.is_member() {
            self.proposer.prep_nodeset.set(m.from);
        }

        // Adopt a previously accepted value with a higher ballot than what
        // we are currently proposing; classic Paxos value constraint.
        if m.op == Op::AckPrepare {
            let adopt = self
                .proposer
                .msg
                .as_ref()
                .is_some_and(|mine| m.proposal > mine.proposal);
            if adopt {
                self.proposer.msg = Some(Rc::new(m.clone()));
            }
        }

        if m.reply_to > self.proposer.sent_prop {
            return self.check_propose(rule);
        }
        None
    }

    fn check_propose(&mut self, rule: &QuorumRule<'_>) -> Option<PaxMsg> {
        if !rule.reached(&self.proposer.prep_nodeset) {
            return None;
        }
        let value = self.proposer.msg.as_ref()?;
        let mut accept = PaxMsg::for_op(Op::Accept, self.synode);
        accept.proposal = self.proposer.bal;
        accept.value_kind = value.value_kind;
        accept.payloads = value.payloads.clone();
        accept.force_delivery = self.force_delivery;

        // The adopted value now travels under our ballot.
        let mut mine = (**value).clone();
        mine.proposal = self.proposer.bal;
        self.proposer.msg = Some(Rc::new(mine));

        self.proposer.prop_nodeset.clear();
        self.proposer.sent_prop = self.proposer.bal;
        Some(accept)
    }

    /// Phase 2 proposer decision: account the answer and, on a fresh
    /// majority, produce the learn broadcast (compact when
    /// `no_duplicate_payload` holds).
    pub fn handle_ack_accept(
        &mut self,
        m: &PaxMsg,
        rule: &QuorumRule<'_>,
        no_duplicate_payload: bool,
    ) -> Option<PaxMsg> {
        if !rule.site.is_member() || m.from == crate::msg::VOID_NODE {
            return None;
        }
        if m.reply_to != self.proposer.bal {
            return None;
        }
        self.proposer.prop_nodeset.set(m.from);
        if m.proposal > self.proposer.sent_learn {
            return self.check_learn(rule, no_duplicate_payload);
        }
        None
    }

    fn check_learn(&mut self, rule: &QuorumRule<'_>, no_duplicate_payload: bool) -> Option<PaxMsg> {
        if !rule.reached(&self.proposer.prop_nodeset) {
            return None;
        }
        let value = self.proposer.msg.as_ref()?;
        let mut learn = PaxMsg::for_op(Op::Learn, self.synode);
        learn.proposal = self.proposer.bal;
        learn.value_kind = value.value_kind;
        learn.force_delivery = self.force_delivery;
        if no_duplicate_payload {
            learn.op = Op::TinyLearn;
        } else {
            learn.payloads = value.payloads.clone();
        }
        self.proposer.sent_learn = self.proposer.bal;
        Some(learn)
    }

    /// Record a chosen value. Returns whether the value is news.
    pub fn learn(&mut self, m: Rc<PaxMsg>, now: Duration) -> bool {
        self.last_modified = now;
        if self.finished() {
            return false;
        }
        self.stage = Op::Learn;
        self.acceptor.msg = Some(m.clone());
        self.learner.msg = Some(m);
        true
    }

    /// A compact learn: only valid when our accepted ballot matches.
    pub fn tiny_learn(&mut self, m: &PaxMsg, now: Duration) -> TinyLearnOutcome {
        if self.finished() {
            return TinyLearnOutcome::AlreadyFinished;
        }
        match &self.acceptor.msg {
            Some(accepted) if accepted.proposal == m.proposal => {
                let mut full = (**accepted).clone();
                full.op = Op::Learn;
                self.last_modified = now;
                self.learn(Rc::new(full), now);
                TinyLearnOutcome::Learned
            }
            _ => TinyLearnOutcome::NeedRead,
        }
    }

    /// Collapse the slot to a no-op. Returns whether the state changed.
    pub fn skip(&mut self, now: Duration) -> bool {
        if self.finished() {
            return false;
        }
        let mut noop = PaxMsg::for_op(Op::Learn, self.synode);
        noop.value_kind = ValueKind::NoOp;
        self.stage = Op::Skip;
        self.learn(Rc::new(noop), now)
    }

    /// Begin a three-phase round: bump the ballot past everything seen
    /// (and past the reserved two-phase ballot `(0, _)`) and produce the
    /// prepare message.
    pub fn start_round_3p(&mut self, nodeno: u16, value_kind: ValueKind) -> PaxMsg {
        self.proposer.bal = Ballot::new(
            self.proposer.bal.cnt.max(self.acceptor.promise.cnt).max(0) + 1,
            nodeno,
        );
        self.proposer.prep_nodeset.clear();
        self.stage = Op::Prepare;

        let mut prepare = PaxMsg::for_op(Op::Prepare, self.synode);
        prepare.proposal = self.proposer.bal;
        prepare.value_kind = value_kind;
        prepare.force_delivery = self.force_delivery;
        prepare
    }

    /// Begin a two-phase round at the reserved ballot `(0, node)`: legal
    /// only for the synod owner on a slot nobody prepared yet.
    pub fn start_round_2p(&mut self, nodeno: u16) -> Option<PaxMsg> {
        let value = self.proposer.msg.as_ref()?;
        self.proposer.bal = Ballot::new(0, nodeno);
        self.proposer.prep_nodeset.clear();
        self.proposer.prop_nodeset.clear();
        self.proposer.sent_prop = self.proposer.bal;
        self.stage = Op::Accept;

        let mut accept = PaxMsg::for_op(Op::Accept, self.synode);
        accept.proposal = self.proposer.bal;
        accept.value_kind = value.value_kind;
        accept.payloads = value.payloads.clone();
        accept.force_delivery = self.force_delivery;

        let mut mine = (**value).clone();
        mine.proposal = self.proposer.bal;
        self.proposer.msg = Some(Rc::new(mine));
        Some(accept)
    }

    /// Mark the machine forced. The enforcer additionally bumps its ballot
    /// with a saturating delta so any in-flight round loses.
    pub fn force(&mut self, enforcer: bool) {
        if !self.enforcer && enforcer {
            self.proposer.bal.force_bump();
        }
        self.force_delivery = true;
        self.enforcer = enforcer;
    }
}

/// A cached machine: the state plus its condition variable and pin count.
///
/// The cache owns machines; everyone else holds `Rc` clones. Pins keep a
/// machine out of eviction while a task is in the middle of a
/// multi-suspension round on it.
pub struct Machine {
    /// The synod this machine decides.
    pub synode: Synode,
    state: std::cell::RefCell<PaxState>,
    /// Condition variable: notified whenever the machine makes progress.
    pub rv: Notify,
    pins: std::cell::Cell<usize>,
    /// LRU stamp maintained by the cache.
    pub lru: std::cell::Cell<u64>,
    /// Accounted payload bytes of the learned value.
    pub size: std::cell::Cell<u64>,
}

impl Machine {
    /// Create a fresh machine for a synod.
    pub fn new(synode: Synode) -> Self {
        Self {
            synode,
            state: std::cell::RefCell::new(PaxState::new(synode)),
            rv: Notify::new(),
            pins: std::cell::Cell::new(0),
            lru: std::cell::Cell::new(0),
            size: std::cell::Cell::new(0),
        }
    }

    /// Borrow the state mutably. Never hold across a suspension point.
    pub fn state_mut(&self) -> std::cell::RefMut<'_, PaxState> {
        self.state.borrow_mut()
    }

    /// Borrow the state immutably. Never hold across a suspension point.
    pub fn state(&self) -> std::cell::Ref<'_, PaxState> {
        self.state.borrow()
    }

    /// Pin against eviction.
    pub fn pin(&self) {
        self.pins.set(self.pins.get() + 1);
    }

    /// Release a pin.
    pub fn unpin(&self) {
        let pins = self.pins.get();
        debug_assert!(pins > 0, "unbalanced unpin");
        self.pins.set(pins.saturating_sub(1));
    }

    /// Whether any task holds a pin.
    pub fn pinned(&self) -> bool {
        self.pins.get() > 0
    }

    /// Wake every task waiting on this machine.
    pub fn wakeup(&self) {
        self.rv.notify_waiters();
    }
}

/// RAII pin guard.
pub struct Pin {
    machine: Rc<Machine>,
}

impl Pin {
    /// Pin a machine for the lifetime of the guard.
    pub fn new(machine: Rc<Machine>) -> Self {
        machine.pin();
        Self { machine }
    }

    /// The pinned machine.
    pub fn machine(&self) -> &Rc<Machine> {
        &self.machine
    }
}

impl Drop for Pin {
    fn drop(&mut self) {
        self.machine.unpin();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::{AppData, Member, ProtoVersion};
    use conclave_core::{NetworkAddress, NodeUid};
    use std::net::{IpAddr, Ipv4Addr};

    fn test_site(n: u16) -> Site {
        let members: Vec<Member> = (0..n)
            .map(|i| {
                Member::new(
                    NetworkAddress::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 13000 + i),
                    NodeUid::new(1, i as u64),
                )
            })
            .collect();
        let self_addr = members[0].address;
        Site::new(members, 10, ProtoVersion::CURRENT, &self_addr)
    }

    fn rule(site: &Site) -> QuorumRule<'_> {
        QuorumRule {
            site,
            consensus: Consensus::Majority,
            forced: None,
        }
    }

    fn synode() -> Synode {
        Synode::new(1, 5, 0)
    }

    fn now() -> Duration {
        Duration::from_secs(1)
    }

    fn prepare_at(cnt: i32, node: u16) -> PaxMsg {
        let mut m = PaxMsg::for_op(Op::Prepare, synode());
        m.from = node;
        m.proposal = Ballot::new(cnt, node);
        m
    }

    fn accept_at(cnt: i32, node: u16, payload: &[u8]) -> PaxMsg {
        let mut m = PaxMsg::for_op(Op::Accept, synode());
        m.from = node;
        m.proposal = Ballot::new(cnt, node);
        m.payloads.push(AppData::app(payload.to_vec()));
        m
    }

    // =========================================================================
    // Acceptor: prepare
    // =========================================================================

    #[test]
    fn test_prepare_fresh_machine_promises() {
        let mut st = PaxState::new(synode());
        let reply = st.handle_prepare(&prepare_at(1, 1), now()).expect("reply");
        assert_eq!(reply.op, Op::AckPrepareEmpty);
        assert_eq!(st.acceptor.promise, Ballot::new(1, 1));
    }

    #[test]
    fn test_prepare_stale_ballot_ignored() {
        let mut st = PaxState::new(synode());
        st.handle_prepare(&prepare_at(5, 1), now());
        assert!(st.handle_prepare(&prepare_at(3, 2), now()).is_none());
        // Promise is monotone.
        assert_eq!(st.acceptor.promise, Ballot::new(5, 1));
    }

    #[test]
    fn test_prepare_returns_accepted_value() {
        let mut st = PaxState::new(synode());
        st.handle_accept(&accept_at(1, 0, b"val"), now(), false);

        let reply = st.handle_prepare(&prepare_at(2, 1), now()).expect("reply");
        assert_eq!(reply.op, Op::AckPrepare);
        assert_eq!(reply.proposal, Ballot::new(1, 0));
        assert_eq!(reply.payloads.len(), 1);
    }

    #[test]
    fn test_prepare_noop_match_answers_despite_stale_ballot() {
        let mut st = PaxState::new(synode());
        st.handle_prepare(&prepare_at(9, 1), now());

        let mut noop_accept = PaxMsg::for_op(Op::Accept, synode());
        noop_accept.from = 1;
        noop_accept.proposal = Ballot::new(9, 1);
        noop_accept.value_kind = ValueKind::NoOp;
        st.handle_accept(&noop_accept, now(), false);

        let mut stale_noop_prepare = prepare_at(2, 2);
        stale_noop_prepare.value_kind = ValueKind::NoOp;
        let reply = st.handle_prepare(&stale_noop_prepare, now());
        assert!(reply.is_some(), "noop match should answer");
    }

    #[test]
    fn test_prepare_on_finished_machine_teaches() {
        let mut st = PaxState::new(synode());
        let mut learned = accept_at(1, 0, b"chosen");
        learned.op = Op::Learn;
        st.learn(Rc::new(learned), now());

        let reply = st.handle_prepare(&prepare_at(7, 2), now()).expect("reply");
        assert_eq!(reply.op, Op::Learn);
        assert_eq!(reply.payloads.len(), 1);
    }

    // =========================================================================
    // Acceptor: accept
    // =========================================================================

    #[test]
    fn test_accept_stores_value() {
        let mut st = PaxState::new(synode());
        let reply = st
            .handle_accept(&accept_at(1, 1, b"v"), now(), false)
            .expect("reply");
        assert_eq!(reply.op, Op::AckAccept);
        assert!(st.accepted());
    }

    #[test]
    fn test_accept_rejected_below_promise() {
        let mut st = PaxState::new(synode());
        st.handle_prepare(&prepare_at(5, 1), now());
        assert!(st.handle_accept(&accept_at(3, 2, b"v"), now(), false).is_none());
        assert!(!st.accepted());
    }

    #[test]
    fn test_accept_multi_ack_when_skip_requested() {
        let mut st = PaxState::new(synode());
        let reply = st
            .handle_accept(&accept_at(1, 1, b"v"), now(), true)
            .expect("reply");
        assert_eq!(reply.op, Op::MultiAckAccept);
    }

    // =========================================================================
    // Proposer: full round
    // =========================================================================

    fn ack_prepare_empty(from: u16, reply_to: Ballot) -> PaxMsg {
        let mut m = PaxMsg::for_op(Op::AckPrepareEmpty, synode());
        m.from = from;
        m.reply_to = reply_to;
        m
    }

    fn ack_accept(from: u16, reply_to: Ballot) -> PaxMsg {
        let mut m = PaxMsg::for_op(Op::AckAccept, synode());
        m.from = from;
        m.reply_to = reply_to;
        m.proposal = reply_to;
        m
    }

    #[test]
    fn test_three_phase_round_reaches_learn() {
        let site = test_site(3);
        let mut st = PaxState::new(synode());

        let mut value = PaxMsg::for_op(Op::ClientMsg, synode());
        value.payloads.push(AppData::app(b"cmd".to_vec()));
        st.proposer.msg = Some(Rc::new(value));

        let prepare = st.start_round_3p(0, ValueKind::Normal);
        assert_eq!(prepare.proposal, Ballot::new(1, 0));

        // Two acks (with self) form a majority of three.
        let bal = st.proposer.bal;
        assert!(st.handle_ack_prepare(&ack_prepare_empty(0, bal), &rule(&site)).is_none());
        let accept = st
            .handle_ack_prepare(&ack_prepare_empty(1, bal), &rule(&site))
            .expect("majority should trigger phase 2");
        assert_eq!(accept.op, Op::Accept);
        assert_eq!(accept.payloads.len(), 1);

        assert!(st.handle_ack_accept(&ack_accept(0, bal), &rule(&site), false).is_none());
        let learn = st
            .handle_ack_accept(&ack_accept(1, bal), &rule(&site), false)
            .expect("majority should trigger learn");
        assert_eq!(learn.op, Op::Learn);
        assert_eq!(learn.payloads.len(), 1);
    }

    #[test]
    fn test_tiny_learn_issued_when_no_duplicate_payload() {
        let site = test_site(3);
        let mut st = PaxState::new(synode());
        let mut value = PaxMsg::for_op(Op::ClientMsg, synode());
        value.payloads.push(AppData::app(b"cmd".to_vec()));
        st.proposer.msg = Some(Rc::new(value));

        st.start_round_3p(0, ValueKind::Normal);
        let bal = st.proposer.bal;
        st.handle_ack_prepare(&ack_prepare_empty(0, bal), &rule(&site));
        st.handle_ack_prepare(&ack_prepare_empty(1, bal), &rule(&site));
        st.handle_ack_accept(&ack_accept(0, bal), &rule(&site), true);
        let learn = st
            .handle_ack_accept(&ack_accept(1, bal), &rule(&site), true)
            .expect("learn");
        assert_eq!(learn.op, Op::TinyLearn);
        assert!(learn.payloads.is_empty());
    }

    #[test]
    fn test_ack_prepare_adopts_higher_accepted_value() {
        let site = test_site(3);
        let mut st = PaxState::new(synode());
        let mut value = PaxMsg::for_op(Op::ClientMsg, synode());
        value.payloads.push(AppData::app(b"mine".to_vec()));
        st.proposer.msg = Some(Rc::new(value));

        st.start_round_3p(0, ValueKind::Normal);
        let bal = st.proposer.bal;

        // Peer answers with a value it accepted at a higher ballot.
        let mut carrying = PaxMsg::for_op(Op::AckPrepare, synode());
        carrying.from = 1;
        carrying.reply_to = bal;
        carrying.proposal = Ballot::new(0, 1);
        carrying.payloads.push(AppData::app(b"theirs".to_vec()));
        st.handle_ack_prepare(&carrying, &rule(&site));

        let accept = st
            .handle_ack_prepare(&ack_prepare_empty(0, bal), &rule(&site))
            .expect("majority");
        assert_eq!(accept.payloads[0].cargo, crate::msg::Cargo::App(b"theirs".to_vec()));
    }

    #[test]
    fn test_stale_ack_ignored() {
        let site = test_site(3);
        let mut st = PaxState::new(synode());
        let mut value = PaxMsg::for_op(Op::ClientMsg, synode());
        value.payloads.push(AppData::app(b"x".to_vec()));
        st.proposer.msg = Some(Rc::new(value));
        st.start_round_3p(0, ValueKind::Normal);

        let stale = ack_prepare_empty(1, Ballot::new(0, 9));
        assert!(st.handle_ack_prepare(&stale, &rule(&site)).is_none());
        assert_eq!(st.proposer.prep_nodeset.count(), 0);
    }

    #[test]
    fn test_two_phase_uses_reserved_ballot() {
        let mut st = PaxState::new(synode());
        let mut value = PaxMsg::for_op(Op::ClientMsg, synode());
        value.payloads.push(AppData::app(b"x".to_vec()));
        st.proposer.msg = Some(Rc::new(value));

        let accept = st.start_round_2p(0).expect("accept");
        assert_eq!(accept.proposal, Ballot::new(0, 0));
        assert_eq!(accept.op, Op::Accept);
    }

    // =========================================================================
    // Learner
    // =========================================================================

    #[test]
    fn test_learn_is_idempotent() {
        let mut st = PaxState::new(synode());
        let mut first = accept_at(1, 0, b"first");
        first.op = Op::Learn;
        assert!(st.learn(Rc::new(first), now()));

        let mut second = accept_at(2, 1, b"second");
        second.op = Op::Learn;
        assert!(!st.learn(Rc::new(second), now()));

        let learned = st.learner.msg.as_ref().expect("learned");
        assert_eq!(learned.payloads[0].cargo, crate::msg::Cargo::App(b"first".to_vec()));
    }

    #[test]
    fn test_tiny_learn_with_matching_ballot() {
        let mut st = PaxState::new(synode());
        st.handle_accept(&accept_at(3, 1, b"v"), now(), false);

        let mut tiny = PaxMsg::for_op(Op::TinyLearn, synode());
        tiny.proposal = Ballot::new(3, 1);
        assert_eq!(st.tiny_learn(&tiny, now()), TinyLearnOutcome::Learned);
        assert!(st.finished());
    }

    #[test]
    fn test_tiny_learn_without_value_needs_read() {
        let mut st = PaxState::new(synode());
        let mut tiny = PaxMsg::for_op(Op::TinyLearn, synode());
        tiny.proposal = Ballot::new(3, 1);
        assert_eq!(st.tiny_learn(&tiny, now()), TinyLearnOutcome::NeedRead);
        assert!(!st.finished());
    }

    #[test]
    fn test_skip_collapses_to_noop() {
        let mut st = PaxState::new(synode());
        assert!(st.skip(now()));
        assert!(st.finished());
        assert!(st.learner.msg.as_ref().expect("learned").is_noop());
        // A later skip changes nothing.
        assert!(!st.skip(now()));
    }

    // =========================================================================
    // Quorum rules
    // =========================================================================

    #[test]
    fn test_majority_rule() {
        let site = test_site(5);
        let r = rule(&site);
        let mut set = NodeSet::empty();
        set.set(0);
        set.set(1);
        assert!(!r.reached(&set));
        set.set(2);
        assert!(r.reached(&set));
    }

    #[test]
    fn test_unanimity_rule() {
        let site = test_site(3);
        let r = QuorumRule {
            site: &site,
            consensus: Consensus::All,
            forced: None,
        };
        let mut set = NodeSet::empty();
        set.set(0);
        set.set(1);
        assert!(!r.reached(&set));
        set.set(2);
        assert!(r.reached(&set));
    }

    #[test]
    fn test_forced_rule_counts_only_forced_members() {
        let site = test_site(3);
        // Forced config keeps members 0 and 1 only.
        let forced_members = site.nodes[..2].to_vec();
        let self_addr = forced_members[0].address;
        let forced = Site::new(forced_members, 10, ProtoVersion::CURRENT, &self_addr);

        let r = QuorumRule {
            site: &site,
            consensus: Consensus::Majority,
            forced: Some(&forced),
        };

        let mut set = NodeSet::empty();
        set.set(0);
        set.set(2); // not in forced config: does not count
        assert!(!r.reached(&set));
        set.set(1);
        assert!(r.reached(&set));
    }

    // =========================================================================
    // Forcing
    // =========================================================================

    #[test]
    fn test_force_enforcer_bumps_ballot() {
        let mut st = PaxState::new(synode());
        let before = st.proposer.bal.cnt;
        st.force(true);
        assert!(st.force_delivery);
        assert!(st.enforcer);
        assert!(st.proposer.bal.cnt > before);

        // Re-forcing an enforcer does not bump again.
        let cnt = st.proposer.bal.cnt;
        st.force(true);
        assert_eq!(st.proposer.bal.cnt, cnt);
    }

    #[test]
    fn test_force_non_enforcer_keeps_ballot() {
        let mut st = PaxState::new(synode());
        st.force(false);
        assert!(st.force_delivery);
        assert!(!st.enforcer);
        assert_eq!(st.proposer.bal.cnt, -1);
    }

    // =========================================================================
    // Machine wrapper
    // =========================================================================

    #[test]
    fn test_pin_guard_balances() {
        let machine = Rc::new(Machine::new(synode()));
        {
            let _pin = Pin::new(machine.clone());
            assert!(machine.pinned());
            let _second = Pin::new(machine.clone());
            assert!(machine.pinned());
        }
        assert!(!machine.pinned());
    }

    #[test]
    fn test_idle_detection() {
        let machine = Machine::new(synode());
        assert!(machine.state().idle());

        machine.state_mut().handle_prepare(&prepare_at(1, 1), now());
        assert!(!machine.state().idle());
    }
}
