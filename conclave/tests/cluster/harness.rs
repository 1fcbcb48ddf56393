//! The in-memory cluster harness.
//!
//! Engines are wired through their peer queues: [`Cluster::pump`] drains
//! every queued outbound message, dispatches it into the addressee
//! engine, and routes replies back into the sender — the same round trip
//! a socket pair would provide, minus the sockets.

use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;
use std::time::Duration;

use conclave::acceptor;
use conclave::app::{Application, DeliveryStatus};
use conclave::engine::{Engine, Env};
use conclave::fsm::{self, FsmEvent};
use conclave::msg::{AppData, Cargo, Member, PaxMsg};
use conclave::site::Site;
use conclave::synode::{NULL_SYNODE, Synode};
use conclave::EngineConfig;
use conclave_core::{NetworkAddress, NodeUid, TokioProviders};

/// Records everything the engine delivers, in order.
#[derive(Default)]
pub struct RecordingApp {
    /// Delivered application payloads, in delivery order.
    pub delivered: RefCell<Vec<Vec<u8>>>,
    /// Synods at which views were delivered.
    pub views: RefCell<Vec<Synode>>,
}

impl Application for RecordingApp {
    fn deliver(&self, _site: Option<&Site>, data: &AppData, status: DeliveryStatus) {
        if status != DeliveryStatus::Ok {
            return;
        }
        if let Cargo::App(bytes) = &data.cargo {
            self.delivered.borrow_mut().push(bytes.clone());
        }
    }

    fn deliver_view(&self, _site: &Site, synode: Synode) {
        self.views.borrow_mut().push(synode);
    }

    fn app_snapshot(&self) -> (Vec<u8>, Synode) {
        (b"app-snapshot".to_vec(), NULL_SYNODE)
    }

    fn handle_app_snapshot(&self, _blob: &[u8], _log_start: Synode, _log_end: Synode) {}
}

/// A group id for the test clusters.
pub const GROUP: u32 = 0x00C0FFEE;

pub struct Cluster {
    pub engines: Vec<Rc<Engine>>,
    pub apps: Vec<Rc<RecordingApp>>,
    pub members: Vec<Member>,
    pub env: Rc<Env<TokioProviders>>,
    /// Engines cut off from the wire; their traffic is dropped.
    pub dead: RefCell<HashSet<usize>>,
}

pub fn member_at(index: u16) -> Member {
    // TEST-NET addresses: guaranteed unrouted, so stray real connection
    // attempts from peer tasks can never reach anything.
    Member::new(
        NetworkAddress::new("192.0.2.1".parse().expect("ip"), 13_000 + index),
        NodeUid::new(0xA0A0, index as u64 + 1),
    )
}

impl Cluster {
    /// Create `n` engines. `extra` more are created as future joiners:
    /// they get an engine and an address but are not part of the boot
    /// configuration.
    pub fn new(n: u16, extra: u16) -> Self {
        let members: Vec<Member> = (0..n + extra).map(member_at).collect();
        let mut engines = Vec::new();
        let mut apps = Vec::new();
        for member in &members {
            let app = Rc::new(RecordingApp::default());
            engines.push(Engine::new(
                EngineConfig::for_tests(),
                member.address,
                member.uid,
                member.address.port as u32,
                app.clone(),
            ));
            apps.push(app);
        }
        Self {
            engines,
            apps,
            members: members[..n as usize].to_vec(),
            env: Rc::new(Env::new(TokioProviders::new())),
            dead: RefCell::new(HashSet::new()),
        }
    }

    /// Boot every configured member with the same bootstrap command.
    pub fn boot(&self) {
        for engine in &self.engines[..self.members.len()] {
            fsm::dispatch(engine, &self.env, FsmEvent::Init);
            let mut boot = AppData::command(GROUP, Cargo::UnifiedBoot(self.members.clone()));
            boot.app_key = Synode::new(GROUP, 1, 0);
            fsm::dispatch(engine, &self.env, FsmEvent::NetBoot(boot));
        }
    }

    /// Boot every member without spawning the task graph: state only.
    /// Used by scenarios that drive protocol steps by hand.
    pub fn boot_without_tasks(&self) {
        for engine in &self.engines[..self.members.len()] {
            let mut boot = AppData::command(GROUP, Cargo::UnifiedBoot(self.members.clone()));
            boot.app_key = Synode::new(GROUP, 1, 0);
            conclave::reconfig::install_node_group(engine, &boot, &self.members);
            engine.set_executed(Synode::new(GROUP, 1, 0));
            engine.delivered.set(Synode::new(GROUP, 1, 0));
            engine.booted.set(true);
            engine.fsm_state.set(conclave::fsm::FsmState::Run);
        }
    }

    fn engine_index(&self, address: NetworkAddress) -> Option<usize> {
        self.engines
            .iter()
            .position(|e| e.self_addr == address)
    }

    /// Cut an engine off the wire.
    pub fn kill(&self, index: usize) {
        self.dead.borrow_mut().insert(index);
    }

    /// Route every queued message once. Returns how many were moved.
    pub fn pump(&self) -> usize {
        let mut routed = 0;
        for (sender, engine) in self.engines.iter().enumerate() {
            let peers: Vec<_> = engine
                .peers
                .borrow()
                .iter()
                .map(|(addr, peer)| (*addr, peer.clone()))
                .collect();
            for (addr, peer) in peers {
                for msg in peer.drain() {
                    routed += 1;
                    if self.dead.borrow().contains(&sender) {
                        continue;
                    }
                    let Some(receiver) = self.engine_index(addr) else {
                        continue;
                    };
                    if self.dead.borrow().contains(&receiver) {
                        continue;
                    }
                    self.deliver(receiver, sender, msg);
                }
            }
        }
        routed
    }

    /// Dispatch a message into `receiver`, bouncing replies between the
    /// two ends until both are quiet.
    pub fn deliver(&self, receiver: usize, sender: usize, msg: PaxMsg) {
        let mut worklist: std::collections::VecDeque<(usize, usize, PaxMsg)> =
            std::collections::VecDeque::from([(receiver, sender, msg)]);
        while let Some((to, from, msg)) = worklist.pop_front() {
            if self.dead.borrow().contains(&to) || self.engines[to].shutdown.get() {
                continue;
            }
            let mut replies = Vec::new();
            acceptor::dispatch(&self.engines[to], &self.env, &msg, &mut replies);
            for mut reply in replies {
                // Stamp the reply the way the connection task would.
                let target = &self.engines[to];
                if let Some(nodeno) = target.site().and_then(|s| s.nodeno) {
                    reply.from = nodeno;
                }
                reply.delivered = target.delivered.get();
                reply.max_synode = target.max_synode.get();
                worklist.push_back((from, to, reply));
            }
        }
    }

    /// Pump and sleep until `pred` holds or the timeout expires.
    pub async fn run_until<F: Fn() -> bool>(&self, timeout: Duration, pred: F) -> bool {
        let started = std::time::Instant::now();
        loop {
            for _ in 0..16 {
                if self.pump() == 0 {
                    break;
                }
            }
            if pred() {
                return true;
            }
            if started.elapsed() > timeout {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    /// Whether every live booted member has delivered exactly `expected`
    /// (as a set, in identical order).
    pub fn all_delivered(&self, expected: &[&[u8]]) -> bool {
        let dead = self.dead.borrow();
        self.members.iter().enumerate().all(|(i, _)| {
            if dead.contains(&i) {
                return true;
            }
            let delivered = self.apps[i].delivered.borrow();
            delivered.len() == expected.len()
                && delivered.iter().zip(expected).all(|(got, want)| got == want)
        })
    }
}

/// Run a future on a fresh single-threaded `LocalSet`, with tracing
/// wired to the test writer (`RUST_LOG=debug` to see the protocol talk).
pub async fn run_local<F: std::future::Future<Output = ()>>(f: F) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    tokio::task::LocalSet::new().run_until(f).await;
}
