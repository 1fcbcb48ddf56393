//! The lifecycle state machine.
//!
//! ```text
//!  init ─► start_enter ─► start ──net_boot──────────────► run_enter ─► run
//!                           │                                ▲          │
//!                           │ snapshot_wait                  │          │ terminate
//!                           ▼                                │          ▼
//!                  snapshot_wait_enter ─► snapshot_wait      │     start_enter
//!                           │ snapshot/local_snapshot        │
//!                           ▼                                │
//!                  recover_wait_enter ─► recover_wait ───────┘
//!                                          timeout/complete
//! ```
//!
//! Transitions are pure functions keyed by `(state, event)`. Transient
//! `*_enter` states perform entry actions and immediately hand the event
//! on; the dispatcher cranks the machine until a state declines to
//! continue, exactly like a trampoline.
//!
//! `run_enter` spawns the task graph (proposer pool, executor, sweeper,
//! detector, alive beacon, cache housekeeping); `terminate` retires it by
//! bumping the run generation, resets every shared variable, and falls
//! back to `start`. The machine is idempotent under repeated terminates.

use std::rc::Rc;
use std::time::Duration;

use conclave_core::{Providers, TaskProvider, TimeProvider};
use tracing::{debug, info};

use crate::engine::{Engine, Env};
use crate::msg::{AppData, Cargo, EngineSnapshot};
use crate::recovery;
use crate::synode::NULL_SYNODE;

/// Lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsmState {
    /// Freshly created, nothing initialized.
    Init,
    /// Entry actions for `Start`.
    StartEnter,
    /// Waiting to be booted or to begin recovery.
    Start,
    /// Entry actions for `SnapshotWait`.
    SnapshotWaitEnter,
    /// Waiting for the first snapshot.
    SnapshotWait,
    /// Entry actions for `RecoverWait`.
    RecoverWaitEnter,
    /// Have a snapshot; waiting for the remaining ones or the timer.
    RecoverWait,
    /// Entry actions for `Run`: spawns the task graph.
    RunEnter,
    /// Normal operation.
    Run,
}

/// Lifecycle events.
#[derive(Debug)]
pub enum FsmEvent {
    /// Initialize the engine.
    Init,
    /// Become a bootstrap member with this boot command.
    NetBoot(AppData),
    /// A snapshot arrived from a peer.
    Snapshot(Box<EngineSnapshot>),
    /// A snapshot arrived from the local recovery manager.
    LocalSnapshot(Box<EngineSnapshot>),
    /// Begin recovery: wait for snapshots.
    SnapshotWait,
    /// A lifecycle timer expired.
    Timeout,
    /// All expected snapshots have arrived.
    Complete,
    /// A forced configuration was submitted locally.
    ForceConfig(AppData),
    /// Stop the run state.
    Terminate,
    /// Shut the engine down for good.
    Exit,
}

/// Whether this node may serve snapshots to recovering peers.
pub fn can_send_snapshot(engine: &Engine) -> bool {
    engine.fsm_state.get() == FsmState::Run
}

/// Drive the lifecycle machine with an event. Cranks through transient
/// states until the machine settles, then returns the resulting state.
pub fn dispatch<P: Providers>(engine: &Rc<Engine>, env: &Rc<Env<P>>, event: FsmEvent) -> FsmState {
    debug!(state = ?engine.fsm_state.get(), event = ?event, "lifecycle event");
    while step(engine, env, &event) {}
    engine.fsm_state.get()
}

fn set_state(engine: &Engine, state: FsmState) {
    engine.fsm_state.set(state);
}

fn step<P: Providers>(engine: &Rc<Engine>, env: &Rc<Env<P>>, event: &FsmEvent) -> bool {
    match engine.fsm_state.get() {
        FsmState::Init => {
            set_state(engine, FsmState::StartEnter);
            true
        }

        FsmState::StartEnter => {
            engine.input.clear();
            engine.recovery.borrow_mut().reset();
            engine.last_config_modification.set(NULL_SYNODE);
            set_state(engine, FsmState::Start);
            true
        }

        FsmState::Start => match event {
            FsmEvent::Init => {
                engine.shutdown.set(false);
                engine.fatal.set(None);
                false
            }
            FsmEvent::NetBoot(a) => handle_net_boot(engine, a),
            FsmEvent::Snapshot(snapshot) => {
                engine.input.clear();
                let mut snapshot = (**snapshot).clone();
                recovery::set_log_end(engine, &mut snapshot);
                recovery::install_snapshot(engine, snapshot);
                set_state(engine, FsmState::RunEnter);
                true
            }
            FsmEvent::SnapshotWait => {
                engine.input.clear();
                start_timer(engine, env, engine.cfg.snapshot_wait);
                set_state(engine, FsmState::SnapshotWaitEnter);
                true
            }
            FsmEvent::Exit => {
                handle_exit(engine);
                false
            }
            _ => false,
        },

        FsmState::SnapshotWaitEnter => {
            engine.recovery.borrow_mut().reset();
            set_state(engine, FsmState::SnapshotWait);
            false
        }

        FsmState::SnapshotWait => match event {
            FsmEvent::LocalSnapshot(snapshot) => {
                recovery::update_best_snapshot(engine, (**snapshot).clone());
                after_first_snapshot(engine);
                set_state(engine, FsmState::RecoverWaitEnter);
                true
            }
            FsmEvent::Snapshot(snapshot) => {
                let mut snapshot = (**snapshot).clone();
                recovery::set_log_end(engine, &mut snapshot);
                recovery::update_best_snapshot(engine, snapshot);
                after_first_snapshot(engine);
                set_state(engine, FsmState::RecoverWaitEnter);
                true
            }
            FsmEvent::Timeout => {
                info!("no snapshot arrived in time, returning to start");
                set_state(engine, FsmState::StartEnter);
                true
            }
            _ => false,
        },

        FsmState::RecoverWaitEnter => {
            maybe_complete(engine, env);
            set_state(engine, FsmState::RecoverWait);
            false
        }

        FsmState::RecoverWait => match event {
            FsmEvent::Snapshot(snapshot) => {
                let mut snapshot = (**snapshot).clone();
                recovery::set_log_end(engine, &mut snapshot);
                recovery::update_best_snapshot(engine, snapshot);
                maybe_complete(engine, env);
                false
            }
            FsmEvent::Timeout | FsmEvent::Complete => {
                set_state(engine, FsmState::RunEnter);
                true
            }
            _ => false,
        },

        FsmState::RunEnter => {
            handle_run_enter(engine, env);
            true
        }

        FsmState::Run => match event {
            FsmEvent::Terminate => {
                handle_terminate(engine);
                set_state(engine, FsmState::StartEnter);
                true
            }
            FsmEvent::ForceConfig(a) => {
                handle_force_config(engine, a);
                false
            }
            _ => false,
        },
    }
}

// =============================================================================
// Transition actions
// =============================================================================

fn handle_net_boot(engine: &Rc<Engine>, a: &AppData) -> bool {
    let Cargo::UnifiedBoot(members) = &a.cargo else {
        return false;
    };
    crate::reconfig::install_node_group(engine, a, members);
    let Some(site) = engine.site() else {
        return false;
    };
    if !site.is_member() {
        return false;
    }
    engine.input.clear();
    let mut start = site.start;
    if start.msgno == 0 {
        start.msgno = 1;
    }
    engine.set_executed(start);
    engine.delivered.set(start);
    engine.booted.set(true);
    set_state(engine, FsmState::RunEnter);
    true
}

fn after_first_snapshot(engine: &Rc<Engine>) {
    // We have a site now; note our own snapshot as processed even if none
    // will ever arrive locally, which simplifies the all-snapshots test.
    if let Some(nodeno) = engine.nodeno() {
        engine.recovery.borrow_mut().note_snapshot(nodeno);
    }
    recovery::send_need_boot(engine);
}

fn maybe_complete<P: Providers>(engine: &Rc<Engine>, env: &Rc<Env<P>>) {
    let max_nodes = engine.site().map(|s| s.max_nodes()).unwrap_or(0);
    let done = engine.recovery.borrow().got_all_snapshots(max_nodes);
    if done {
        // Deliver the completion from a fresh task so the current
        // dispatch finishes first.
        let engine = engine.clone();
        let env_clone = env.clone();
        env.task().spawn_local("fsm_complete", async move {
            dispatch(&engine, &env_clone, FsmEvent::Complete);
        });
    }
}

fn handle_run_enter<P: Providers>(engine: &Rc<Engine>, env: &Rc<Env<P>>) {
    let Some(site) = engine.site() else {
        set_state(engine, FsmState::StartEnter);
        return;
    };
    engine.recovery.borrow_mut().start_config = site.boot_key;

    // Sanity: the executor cursor must resolve to a site.
    if engine.find_site(engine.executed.get()).is_none() {
        engine.set_executed(site.start);
        engine.delivered.set(site.start);
    }

    stop_timer(engine);
    engine.booted.set(true);
    set_proposer_startpoint(engine);

    let run_gen_val = engine.run_gen.get();
    info!(run_gen_val, nodeno = ?site.nodeno, "entering run state, spawning task graph");

    for self_id in 0..engine.cfg.proposers {
        let e = engine.clone();
        let v = env.clone();
        env.task().spawn_local("proposer", async move {
            crate::proposer::proposer_task(e, v, self_id, run_gen_val).await;
        });
    }
    {
        let e = engine.clone();
        let v = env.clone();
        env.task().spawn_local("executor", async move {
            crate::executor::executor_task(e, v, run_gen_val).await;
        });
    }
    {
        let e = engine.clone();
        let v = env.clone();
        env.task().spawn_local("sweeper", async move {
            crate::sweeper::sweeper_task(e, v, run_gen_val).await;
        });
    }
    {
        let e = engine.clone();
        let v = env.clone();
        env.task().spawn_local("detector", async move {
            crate::detector::detector_task(e, v, run_gen_val).await;
        });
    }
    {
        let e = engine.clone();
        let v = env.clone();
        env.task().spawn_local("alive", async move {
            crate::detector::alive_task(e, v, run_gen_val).await;
        });
    }
    {
        let e = engine.clone();
        let v = env.clone();
        env.task().spawn_local("cache_manager", async move {
            cache_manager_task(e, v, run_gen_val).await;
        });
    }

    set_state(engine, FsmState::Run);
}

fn handle_terminate(engine: &Rc<Engine>) {
    info!("leaving run state");
    engine.booted.set(false);
    // Stale the task graph and wake everything blocked.
    engine.run_gen.set(engine.run_gen.get() + 1);
    engine.exec_wait.notify_waiters();
    engine.detector_wait.notify_waiters();
    engine.reset_shared_state();
}

fn handle_exit(engine: &Rc<Engine>) {
    info!("engine exit");
    engine.bury_group();
    engine.run_gen.set(engine.run_gen.get() + 1);
    engine.shutdown.set(true);
    engine.exec_wait.notify_waiters();
    engine.reset_shared_state();
}

fn handle_force_config(engine: &Rc<Engine>, a: &AppData) {
    let Cargo::ForceConfig(members) = &a.cargo else {
        return;
    };
    let Some(old_site) = engine.site() else {
        return;
    };
    let mut site = crate::site::Site::new(
        members.clone(),
        old_site.event_horizon,
        old_site.x_proto,
        &engine.self_addr,
    );
    site.start = engine.executed.get();
    site.boot_key = engine.executed.get();
    {
        let mut servers = site.servers.borrow_mut();
        for member in &site.nodes {
            servers.push(engine.peer(member.address));
        }
    }

    // Members dropped by the forced config will never answer again.
    for (idx, member) in old_site.nodes.iter().enumerate() {
        if !site.has_address(member) {
            if let Some(peer) = old_site.server(idx as u16) {
                peer.invalid.set(true);
            }
        }
    }

    crate::reconfig::start_force_config(engine, Rc::new(site), true);
    // The forced config has not come back as a learned message yet.
    engine.wait_forced.set(true);
}

fn set_proposer_startpoint(engine: &Engine) {
    let max = engine.max_synode.get();
    if max.after(&engine.current_message.get()) {
        let free = engine.first_free_synode(max);
        if max.msgno <= 1 {
            engine.set_current_message(free);
        } else {
            engine.set_current_message(free.incr_msgno());
        }
    }
}

// =============================================================================
// Timers and housekeeping
// =============================================================================

fn start_timer<P: Providers>(engine: &Rc<Engine>, env: &Rc<Env<P>>, after: Duration) {
    let run_gen_val = engine.timer_gen.get() + 1;
    engine.timer_gen.set(run_gen_val);
    let e = engine.clone();
    let v = env.clone();
    env.task().spawn_local("fsm_timer", async move {
        v.time().sleep(after).await;
        if e.timer_gen.get() == run_gen_val && !e.shutdown.get() {
            dispatch(&e, &v, FsmEvent::Timeout);
        }
    });
}

fn stop_timer(engine: &Engine) {
    engine.timer_gen.set(engine.timer_gen.get() + 1);
}

/// Periodically shrink the machine cache towards its limit. A cache that
/// cannot shrink below the limit is a fatal condition.
async fn cache_manager_task<P: Providers>(engine: Rc<Engine>, env: Rc<Env<P>>, run_gen_val: u64) {
    while !engine.shutdown.get() && engine.run_gen.get() == run_gen_val {
        env.time().sleep(Duration::from_millis(500)).await;
        let ok = engine
            .cache
            .borrow_mut()
            .shrink(engine.executed.get());
        if !ok {
            engine.note_fatal(crate::engine::FatalError::CacheExhausted);
        }
    }
    debug!("cache manager stopped");
}

/// Ask the engine to stop and then exit: the common "we are done" path
/// used by removal, die_op, and fatal conditions.
pub fn terminate_and_exit<P: Providers>(engine: &Rc<Engine>, env: &Rc<Env<P>>) {
    dispatch(engine, env, FsmEvent::Terminate);
    dispatch(engine, env, FsmEvent::Exit);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::NullApplication;
    use crate::config::EngineConfig;
    use crate::msg::Member;
    use conclave_core::{NetworkAddress, NodeUid, TokioProviders};
    use std::net::{IpAddr, Ipv4Addr};

    fn member(port: u16) -> Member {
        Member::new(
            NetworkAddress::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), port),
            NodeUid::new(1, port as u64),
        )
    }

    fn engine() -> Rc<Engine> {
        let members = vec![member(1), member(2), member(3)];
        Engine::new(
            EngineConfig::for_tests(),
            members[0].address,
            members[0].uid,
            0xCAFE,
            Rc::new(NullApplication),
        )
    }

    fn boot_cmd() -> AppData {
        let mut a = AppData::command(7, Cargo::UnifiedBoot(vec![member(1), member(2), member(3)]));
        a.app_key = crate::synode::Synode::new(7, 1, 0);
        a
    }

    async fn run_local<F: std::future::Future<Output = ()>>(f: F) {
        tokio::task::LocalSet::new().run_until(f).await;
    }

    #[tokio::test]
    async fn test_init_settles_in_start() {
        run_local(async {
            let engine = engine();
            let env = Rc::new(Env::new(TokioProviders::new()));
            assert_eq!(dispatch(&engine, &env, FsmEvent::Init), FsmState::Start);
        })
        .await;
    }

    #[tokio::test]
    async fn test_net_boot_enters_run() {
        run_local(async {
            let engine = engine();
            let env = Rc::new(Env::new(TokioProviders::new()));
            dispatch(&engine, &env, FsmEvent::Init);
            let state = dispatch(&engine, &env, FsmEvent::NetBoot(boot_cmd()));
            assert_eq!(state, FsmState::Run);
            assert!(engine.booted.get());
            assert_eq!(engine.executed.get().msgno, 1);
        })
        .await;
    }

    #[tokio::test]
    async fn test_net_boot_for_non_member_stays_in_start() {
        run_local(async {
            let members = vec![member(8), member(9)];
            let engine = Engine::new(
                EngineConfig::for_tests(),
                member(1).address,
                member(1).uid,
                1,
                Rc::new(NullApplication),
            );
            let env = Rc::new(Env::new(TokioProviders::new()));
            dispatch(&engine, &env, FsmEvent::Init);
            let mut a = AppData::command(7, Cargo::UnifiedBoot(members));
            a.app_key = crate::synode::Synode::new(7, 1, 0);
            let state = dispatch(&engine, &env, FsmEvent::NetBoot(a));
            assert_eq!(state, FsmState::Start);
            assert!(!engine.booted.get());
        })
        .await;
    }

    #[tokio::test]
    async fn test_terminate_is_idempotent() {
        run_local(async {
            let engine = engine();
            let env = Rc::new(Env::new(TokioProviders::new()));
            dispatch(&engine, &env, FsmEvent::Init);
            dispatch(&engine, &env, FsmEvent::NetBoot(boot_cmd()));
            let gen_before = engine.run_gen.get();

            assert_eq!(dispatch(&engine, &env, FsmEvent::Terminate), FsmState::Start);
            assert_eq!(engine.run_gen.get(), gen_before + 1);
            assert!(engine.site().is_none());

            // A second terminate in start state is a no-op.
            assert_eq!(dispatch(&engine, &env, FsmEvent::Terminate), FsmState::Start);
            assert_eq!(engine.run_gen.get(), gen_before + 1);
        })
        .await;
    }

    #[tokio::test]
    async fn test_exit_buries_group_and_shuts_down() {
        run_local(async {
            let engine = engine();
            let env = Rc::new(Env::new(TokioProviders::new()));
            dispatch(&engine, &env, FsmEvent::Init);
            dispatch(&engine, &env, FsmEvent::NetBoot(boot_cmd()));

            // The exit command path buries the group while the site is
            // still known, then tears the engine down.
            engine.bury_group();
            terminate_and_exit(&engine, &env);
            assert!(engine.shutdown.get());
            // Group id 7 is now a zombie; its traffic gets ignored.
            assert!(engine.dead_sites.borrow().is_dead(7));
        })
        .await;
    }

    #[tokio::test]
    async fn test_snapshot_in_start_enters_run() {
        run_local(async {
            // Build a donor engine to create a valid snapshot.
            let donor = engine();
            let env = Rc::new(Env::new(TokioProviders::new()));
            dispatch(&donor, &env, FsmEvent::Init);
            dispatch(&donor, &env, FsmEvent::NetBoot(boot_cmd()));
            let snapshot = crate::recovery::create_snapshot(&donor).expect("snapshot");

            let joiner = Engine::new(
                EngineConfig::for_tests(),
                member(2).address,
                member(2).uid,
                2,
                Rc::new(NullApplication),
            );
            dispatch(&joiner, &env, FsmEvent::Init);
            let state = dispatch(&joiner, &env, FsmEvent::Snapshot(Box::new(snapshot)));
            assert_eq!(state, FsmState::Run);
            assert!(joiner.booted.get());
        })
        .await;
    }

    #[tokio::test]
    async fn test_snapshot_wait_times_out_to_start() {
        run_local(async {
            let engine = engine();
            let env = Rc::new(Env::new(TokioProviders::new()));
            dispatch(&engine, &env, FsmEvent::Init);
            assert_eq!(
                dispatch(&engine, &env, FsmEvent::SnapshotWait),
                FsmState::SnapshotWait
            );
            assert_eq!(dispatch(&engine, &env, FsmEvent::Timeout), FsmState::Start);
        })
        .await;
    }
}
