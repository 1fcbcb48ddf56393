//! The engine: all shared state, owned by the scheduler thread.
//!
//! Every task receives an `Rc<Engine>` and mutates through `Cell`/`RefCell`
//! fields. There is no cross-thread sharing: mutation is uncontested
//! because exactly one task runs at a time, and no borrow is ever held
//! across a suspension point.
//!
//! The cursors:
//!
//! ```text
//!   delivered ≤ executed ≤ max_synode
//!       │          │           └ largest synod observed anywhere
//!       │          └ next synod the executor will process
//!       └ next synod eligible for application delivery
//! ```
//!
//! Proposers allocate from `current_message` and are gated by the event
//! horizon: nobody may work on a synod at or past
//! `executed.msgno + event_horizon`, which bounds the in-flight pipeline
//! and doubles as the activation delay of configurations.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use conclave_core::{NetworkAddress, NodeUid, Providers};
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::app::{Application, DeliveryStatus};
use crate::cache::MachineCache;
use crate::config::EngineConfig;
use crate::fsm::FsmState;
use crate::machine::Consensus;
use crate::msg::{AppData, Cargo, Op, PaxMsg, UniqueId};
use crate::peer::Peer;
use crate::queue::MsgQueue;
use crate::site::{DeadSiteRing, EVENT_HORIZON_MIN, Site, SiteHistory};
use crate::synode::{NULL_SYNODE, Synode};

/// Conditions that terminate the engine rather than a single round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FatalError {
    /// A machine was needed, the cache is full, and nothing is evictable.
    #[error("machine cache exhausted")]
    CacheExhausted,
    /// A peer told us the group has moved past a synod we still need.
    #[error("group is too far ahead")]
    TooFarBehind,
}

/// Provider bundle handed to every task.
pub struct Env<P: Providers> {
    providers: P,
}

impl<P: Providers> Env<P> {
    /// Wrap a provider bundle.
    pub fn new(providers: P) -> Self {
        Self { providers }
    }

    /// The time provider.
    pub fn time(&self) -> &P::Time {
        self.providers.time()
    }

    /// The network provider.
    pub fn network(&self) -> &P::Network {
        self.providers.network()
    }

    /// The task provider.
    pub fn task(&self) -> &P::Task {
        self.providers.task()
    }

    /// The random provider.
    pub fn random(&self) -> &P::Random {
        self.providers.random()
    }
}

/// Snapshot bookkeeping during recovery.
#[derive(Debug, Default)]
pub struct RecoveryState {
    /// Which members have sent us a snapshot.
    pub snapshots_seen: Vec<bool>,
    /// log_start of the best snapshot installed so far.
    pub log_start_max: Synode,
    /// log_end of the best snapshot installed so far.
    pub log_end_max: Synode,
    /// Boot key of the config we entered run state with; suppresses
    /// duplicate snapshot installs.
    pub start_config: Synode,
}

impl RecoveryState {
    /// Note receipt of a snapshot from a member.
    pub fn note_snapshot(&mut self, node: u16) {
        let idx = node as usize;
        if idx >= self.snapshots_seen.len() {
            self.snapshots_seen.resize(idx + 1, false);
        }
        self.snapshots_seen[idx] = true;
    }

    /// Whether every member of the site has sent a snapshot.
    pub fn got_all_snapshots(&self, max_nodes: u16) -> bool {
        max_nodes > 0
            && (0..max_nodes as usize).all(|i| self.snapshots_seen.get(i).copied().unwrap_or(false))
    }

    /// Forget received snapshots.
    pub fn reset(&mut self) {
        self.snapshots_seen.clear();
        self.log_start_max = NULL_SYNODE;
        self.log_end_max = NULL_SYNODE;
    }
}

/// All engine state. One per member process.
pub struct Engine {
    /// Tunables.
    pub cfg: EngineConfig,
    /// The address this engine's listener answers on.
    pub self_addr: NetworkAddress,
    /// This incarnation's identity.
    pub self_uid: NodeUid,
    /// Process id used to brand proposals.
    pub proc_id: u32,

    /// Next synod the executor will process.
    pub executed: Cell<Synode>,
    /// Next synod eligible for application delivery.
    pub delivered: Cell<Synode>,
    /// Last synod actually handed to the application.
    pub last_delivered: Cell<Synode>,
    /// Largest synod observed anywhere.
    pub max_synode: Cell<Synode>,
    /// Next synod a local proposer will attempt.
    pub current_message: Cell<Synode>,
    /// Synod of the last configuration change we processed.
    pub last_config_modification: Cell<Synode>,

    lsn: Cell<u64>,

    /// Installed configurations.
    pub sites: RefCell<SiteHistory>,
    /// Machine cache.
    pub cache: RefCell<MachineCache>,
    /// Client input queue, drained by the proposer pool.
    pub input: MsgQueue<PaxMsg>,
    /// Notified when the executor advances; proposers gated by the
    /// horizon and tasks waiting for cache progress block here.
    pub exec_wait: Notify,
    /// Notified when a suspected-dead member shows signs of life.
    pub detector_wait: Notify,
    /// Wakes the sweeper when new work may exist (learn or max_synode
    /// advance).
    pub sweeper_wait: Notify,
    /// Last time we answered a ping with `need_boot`; rate limits boot
    /// begging to one per second.
    pub sent_alive: Cell<Option<std::time::Duration>>,

    /// Engine shutdown flag; every task loop checks it.
    pub shutdown: Cell<bool>,
    /// Run generation: bumped on lifecycle terminate so tasks spawned for
    /// an earlier run state notice they are stale and wind down.
    pub run_gen: Cell<u64>,
    /// Generation of the lifecycle timer; bumping cancels outstanding
    /// timers.
    pub timer_gen: Cell<u64>,
    /// Whether this node has been booted (bootstrap member or snapshot
    /// installed). Unbooted nodes do not act as acceptors.
    pub booted: Cell<bool>,
    /// Lifecycle state.
    pub fsm_state: Cell<FsmState>,

    /// The forced configuration during quorum-loss recovery, for
    /// majority accounting.
    pub forced: RefCell<Option<Rc<Site>>>,
    /// Set between forcing a config locally and seeing it learned.
    pub wait_forced: Cell<bool>,
    /// Consensus mode.
    pub consensus: Cell<Consensus>,

    /// Recently retired group ids.
    pub dead_sites: RefCell<DeadSiteRing>,
    /// Outbound peer handles by address, shared across sites.
    pub peers: RefCell<HashMap<NetworkAddress, Rc<Peer>>>,
    /// Recovery bookkeeping.
    pub recovery: RefCell<RecoveryState>,

    /// The application this engine delivers to.
    pub app: Rc<dyn Application>,
    /// Set when a fatal condition was hit; drives lifecycle terminate.
    pub fatal: Cell<Option<FatalError>>,
}

impl Engine {
    /// Create an engine. It starts in the lifecycle `Init` state with no
    /// configuration; boot or recovery installs the first site.
    pub fn new(
        cfg: EngineConfig,
        self_addr: NetworkAddress,
        self_uid: NodeUid,
        proc_id: u32,
        app: Rc<dyn Application>,
    ) -> Rc<Self> {
        let cache_limit = cfg.cache_limit;
        Rc::new(Self {
            cfg,
            self_addr,
            self_uid,
            proc_id,
            executed: Cell::new(NULL_SYNODE),
            delivered: Cell::new(NULL_SYNODE),
            last_delivered: Cell::new(NULL_SYNODE),
            max_synode: Cell::new(NULL_SYNODE),
            current_message: Cell::new(NULL_SYNODE),
            last_config_modification: Cell::new(NULL_SYNODE),
            lsn: Cell::new(0),
            sites: RefCell::new(SiteHistory::new()),
            cache: RefCell::new(MachineCache::new(cache_limit)),
            input: MsgQueue::new(),
            exec_wait: Notify::new(),
            detector_wait: Notify::new(),
            sweeper_wait: Notify::new(),
            sent_alive: Cell::new(None),
            shutdown: Cell::new(false),
            run_gen: Cell::new(0),
            timer_gen: Cell::new(0),
            booted: Cell::new(false),
            fsm_state: Cell::new(FsmState::Init),
            forced: RefCell::new(None),
            wait_forced: Cell::new(false),
            consensus: Cell::new(Consensus::Majority),
            dead_sites: RefCell::new(DeadSiteRing::default()),
            peers: RefCell::new(HashMap::new()),
            recovery: RefCell::new(RecoveryState::default()),
            app,
            fatal: Cell::new(None),
        })
    }

    // =========================================================================
    // Sites
    // =========================================================================

    /// The newest configuration.
    pub fn site(&self) -> Option<Rc<Site>> {
        self.sites.borrow().latest()
    }

    /// The configuration governing a synod.
    pub fn find_site(&self, synode: Synode) -> Option<Rc<Site>> {
        self.sites.borrow().find(synode)
    }

    /// The configuration governing the executor's cursor.
    pub fn executor_site(&self) -> Option<Rc<Site>> {
        self.find_site(self.executed.get())
    }

    /// Our node index in the newest configuration.
    pub fn nodeno(&self) -> Option<u16> {
        self.site().and_then(|s| s.nodeno)
    }

    /// Group id of the newest configuration, 0 when none.
    pub fn group_id(&self) -> u32 {
        self.site().map(|s| s.start.group_id).unwrap_or(0)
    }

    /// Install a site: wire up peer handles, bump `max_synode` so the
    /// sweeper and executor can reach its start, and note the change.
    pub fn install_site(&self, site: Rc<Site>) {
        {
            let mut servers = site.servers.borrow_mut();
            servers.clear();
            for member in &site.nodes {
                servers.push(self.peer(member.address));
            }
        }
        site.reset_runtime_state();
        info!(
            start = %site.start,
            boot_key = %site.boot_key,
            nodes = site.nodes.len(),
            event_horizon = site.event_horizon,
            "installing configuration"
        );
        if site.start.after(&self.max_synode.get()) {
            self.set_max_synode(site.start);
        }
        self.sites.borrow_mut().install(site);
    }

    // =========================================================================
    // Cursors
    // =========================================================================

    /// Advance the executor cursor, waking horizon-gated proposers.
    pub fn set_executed(&self, synode: Synode) {
        let current = self.current_message.get();
        if synode.group_mismatch(&current) || synode.after(&current) {
            self.set_current_message(self.first_free_synode(synode));
        }
        if synode.msgno > self.executed.get().msgno {
            self.exec_wait.notify_waiters();
        }
        self.executed.set(synode);
    }

    /// Set the proposer allocation cursor.
    pub fn set_current_message(&self, synode: Synode) {
        self.current_message.set(synode);
    }

    /// Raise the largest observed synod.
    pub fn set_max_synode(&self, synode: Synode) {
        self.max_synode.set(synode);
    }

    /// Fold a message's synode gossip into `max_synode`.
    pub fn update_max_synode(&self, msg: &PaxMsg) {
        if self.dead_sites.borrow().is_dead(msg.group_id) {
            return;
        }
        let max = self.max_synode.get();
        if self.group_id() == 0 || max.group_id == 0 {
            self.set_max_synode(msg.synode);
        } else if max.group_id == msg.synode.group_id {
            if msg.synode.after(&max) {
                self.set_max_synode(msg.synode);
            }
            if msg.max_synode.after(&self.max_synode.get()) {
                self.set_max_synode(msg.max_synode);
            }
        }
    }

    /// The first slot at or after `msgno` owned by this node.
    pub fn first_free_synode(&self, msgno: Synode) -> Synode {
        let site = match self.find_site(msgno).or_else(|| self.site()) {
            Some(site) => site,
            None => return msgno,
        };
        let Some(nodeno) = site.nodeno else {
            return site.start;
        };
        let mut retval = msgno;
        if retval.msgno == 0 {
            retval.msgno = 1;
        }
        retval.node = nodeno;
        if retval.before(&msgno) {
            retval.incr_msgno()
        } else {
            retval
        }
    }

    /// Next log sequence number. Seeded from `max_synode.msgno` on first
    /// use so a restarted node never reuses sequence numbers of its
    /// previous incarnation.
    pub fn assign_lsn(&self) -> u64 {
        let mut lsn = self.lsn.get();
        if lsn == 0 {
            lsn = self.max_synode.get().msgno;
        }
        lsn += 1;
        self.lsn.set(lsn);
        lsn
    }

    // =========================================================================
    // Event horizon
    // =========================================================================

    /// Whether a synod is beyond what anyone may work on.
    ///
    /// The threshold is `executed.msgno + H(active)`. While a horizon
    /// reconfiguration R is pending, the executor exit logic additionally
    /// requires staying within `start(R) - 1 + H(R)`, so the smaller of
    /// the two bounds wins.
    pub fn too_far(&self, synode: Synode) -> bool {
        let executed = self.executed.get();
        let threshold = match self.find_site(executed) {
            Some(active) => {
                let sites = self.sites.borrow();
                match sites.first_horizon_reconfig(&active) {
                    None => executed.msgno + active.event_horizon as u64,
                    Some(pending) => {
                        let normal = executed.msgno + active.event_horizon as u64;
                        let bounded =
                            pending.start.msgno - 1 + pending.event_horizon as u64;
                        normal.min(bounded)
                    }
                }
            }
            None => executed.msgno + EVENT_HORIZON_MIN as u64,
        };
        synode.msgno >= threshold
    }

    /// The activation point of a configuration decided at `boot_key`,
    /// honoring a pending horizon reconfiguration.
    pub fn add_event_horizon(&self, boot_key: Synode) -> Synode {
        let Some(active) = self.site() else {
            return Site::activation_point(boot_key, EVENT_HORIZON_MIN);
        };
        let sites = self.sites.borrow();
        match sites.latest_horizon_reconfig(&active) {
            None => Site::activation_point(boot_key, active.event_horizon),
            Some(pending) => {
                Site::activation_point(pending.start, pending.event_horizon)
            }
        }
    }

    // =========================================================================
    // Machines
    // =========================================================================

    /// Whether a round for this synod is underway or completed here.
    pub fn is_busy(&self, synode: Synode) -> bool {
        match self.cache.borrow().get_no_touch(synode) {
            None => false,
            Some(machine) => {
                let st = machine.state();
                st.locked
                    || st.stage != Op::Initial
                    || st.acceptor.promise.cnt > 0
                    || st.proposer.msg.is_some()
                    || st.accepted()
                    || st.finished()
            }
        }
    }

    // =========================================================================
    // Sending
    // =========================================================================

    /// The peer handle for an address, creating it on first use.
    pub fn peer(&self, address: NetworkAddress) -> Rc<Peer> {
        self.peers
            .borrow_mut()
            .entry(address)
            .or_insert_with(|| Rc::new(Peer::new(address)))
            .clone()
    }

    fn stamp_outbound(&self, site: &Site, to: u16, msg: &mut PaxMsg) {
        msg.from = site.nodeno.unwrap_or(crate::msg::VOID_NODE);
        msg.to = to;
        msg.group_id = site.start.group_id;
        msg.delivered = self.delivered.get();
        msg.max_synode = self.max_synode.get();
    }

    /// Queue a message to a single member of a site.
    pub fn send_to_node(&self, site: &Site, node: u16, mut msg: PaxMsg) {
        self.stamp_outbound(site, node, &mut msg);
        if let Some(peer) = site.server(node) {
            peer.send(msg);
        }
    }

    /// Queue a message to every member except this node.
    pub fn send_to_others(&self, site: &Site, msg: &PaxMsg) {
        for node in 0..site.max_nodes() {
            if Some(node) == site.nodeno {
                continue;
            }
            self.send_to_node(site, node, msg.clone());
        }
    }

    /// Queue a message to one pseudo-randomly chosen other member.
    /// `pick` is a random index from the caller's random provider.
    pub fn send_to_someone(&self, site: &Site, msg: PaxMsg, pick: u16) {
        let n = site.max_nodes();
        if n == 0 {
            return;
        }
        // Walk from the pick to the first member that is not us.
        for offset in 0..n {
            let node = (pick + offset) % n;
            if Some(node) != site.nodeno {
                self.send_to_node(site, node, msg);
                return;
            }
        }
    }

    // =========================================================================
    // Delivery
    // =========================================================================

    /// Hand a payload chain to the application.
    pub fn deliver_to_app(&self, site: Option<&Site>, payloads: &[AppData], status: DeliveryStatus) {
        for data in payloads {
            if matches!(data.cargo, Cargo::App(_)) {
                self.app.deliver(site, data, status);
            }
        }
    }

    // =========================================================================
    // Client intake
    // =========================================================================

    /// Submit a client payload or command to the proposer pool.
    pub fn submit(&self, data: AppData) {
        let mut msg = PaxMsg::for_op(Op::ClientMsg, NULL_SYNODE);
        msg.group_id = data.group_id;
        msg.payloads.push(data);
        self.input.put(msg);
    }

    /// Brand a client message with the identity of this proposal attempt.
    /// The app key doubles as the boot key of configuration commands, so
    /// it must follow every re-proposal to a different slot.
    pub fn brand_client_msg(&self, msg: &mut PaxMsg, synode: Synode) {
        msg.synode = synode;
        let unique = UniqueId {
            group_id: self.proc_id,
            synode,
        };
        for data in &mut msg.payloads {
            data.unique_id = unique;
            data.app_key = synode;
        }
    }

    // =========================================================================
    // Fatal conditions
    // =========================================================================

    /// Record a fatal condition; the noticing task drives termination.
    pub fn note_fatal(&self, error: FatalError) {
        debug!(error = %error, "fatal engine condition");
        if self.fatal.get().is_none() {
            self.fatal.set(Some(error));
        }
    }

    /// Retire the current group id into the dead-site ring.
    pub fn bury_group(&self) {
        let group_id = self.group_id();
        if group_id != 0 {
            self.dead_sites.borrow_mut().bury(group_id);
        }
    }

    /// Reset shared variables on lifecycle terminate.
    pub fn reset_shared_state(&self) {
        self.executed.set(NULL_SYNODE);
        self.delivered.set(NULL_SYNODE);
        self.last_delivered.set(NULL_SYNODE);
        self.max_synode.set(NULL_SYNODE);
        self.current_message.set(NULL_SYNODE);
        self.last_config_modification.set(NULL_SYNODE);
        self.lsn.set(0);
        self.sites.borrow_mut().clear();
        self.cache.borrow_mut().clear();
        self.input.clear();
        self.booted.set(false);
        *self.forced.borrow_mut() = None;
        self.wait_forced.set(false);
        self.fatal.set(None);
        self.recovery.borrow_mut().reset();
    }
}
