//! The executor: serializes delivery and owns the exit logic.
//!
//! A state machine over the `executed` cursor with three states:
//!
//! - **fetch**: obtain the decided value for `executed` (proposing no-ops
//!   or reading from peers when it is missing), apply configuration
//!   commands, advance;
//! - **execute**: hand decided values to the application in synod order
//!   via the `delivered` cursor;
//! - **terminate**: this node was removed and may now leave.
//!
//! ## Exit logic
//!
//! When a learned configuration C' removes this node, we may not vanish
//! immediately: members of C' might still need values only we hold. We
//! stay until `executed ≥ start(C') + H(C')` — by then a majority of C'
//! has executed everything of our configuration — and deliver nothing at
//! or past `start(C')`. An *empty* C' has nobody to wait for, so its
//! start is inflated by another horizon instead, giving the old majority
//! room to converge before everyone leaves.

use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

use conclave_core::{Providers, TimeProvider};
use tracing::{debug, info, warn};

use crate::acceptor::send_read;
use crate::app::DeliveryStatus;
use crate::config::FIND_MAX;
use crate::detector::i_am_the_greatest;
use crate::engine::{Engine, Env};
use crate::fsm;
use crate::machine::Machine;
use crate::msg::{Cargo, Op, PaxMsg};
use crate::proposer::propose_noop;
use crate::reconfig;
use crate::site::Site;
use crate::synode::{NULL_SYNODE, Synode};

/// Backoff for the executor's wait on a missing value: starts a few
/// milliseconds, multiplies by √2, capped at `max_wait`.
pub fn wakeup_delay_for_perf(old: f64, max_wait: f64) -> f64 {
    let mut retval = if old == 0.0 { 0.003 } else { old * 1.4142136 };
    while retval > max_wait {
        retval /= 1.314_159_26;
    }
    retval
}

fn next_synode(engine: &Engine, synode: Synode) -> Synode {
    let max_nodes = engine
        .find_site(synode)
        .map(|s| s.max_nodes())
        .unwrap_or(0);
    synode.incr(max_nodes)
}

/// Whether a synod's owner is outside the site's live view; such slots
/// are skipped without delivery.
fn loser(synode: Synode, site: &Site) -> bool {
    !site
        .global_node_set
        .borrow()
        .get(synode.node as usize)
        .copied()
        .unwrap_or(false)
}

/// A synod where it is safe for removed members to exit: `start + H`.
fn compute_delay(mut start: Synode, event_horizon: u32) -> Synode {
    start.msgno += event_horizon as u64;
    start
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExecState {
    Fetch,
    Execute,
    Terminate,
}

struct ExecuteContext {
    state: ExecState,
    exit_synode: Synode,
    delivery_limit: Synode,
    exit_flag: bool,
    inform_index: isize,
    delay_fifo: VecDeque<Synode>,
}

impl ExecuteContext {
    fn new() -> Self {
        Self {
            state: ExecState::Fetch,
            exit_synode: NULL_SYNODE,
            delivery_limit: NULL_SYNODE,
            exit_flag: false,
            inform_index: -1,
            delay_fifo: VecDeque::new(),
        }
    }

    fn check_exit(&self, engine: &Engine) -> bool {
        self.exit_flag
            && !engine.executed.get().before(&self.exit_synode)
            && !engine.delivered.get().before(&self.delivery_limit)
    }
}

// =============================================================================
// Informing removed nodes
// =============================================================================

/// Replay a decided value to a node no longer in the current site.
fn send_value(engine: &Engine, site: &Site, to: u16, synode: Synode) {
    let machine = engine.cache.borrow().get_no_touch(synode);
    let Some(machine) = machine else {
        return;
    };
    let st = machine.state();
    let Some(learned) = &st.learner.msg else {
        return;
    };
    let mut replay = PaxMsg::for_op(Op::Learn, synode);
    replay.proposal = learned.proposal;
    replay.value_kind = learned.value_kind;
    replay.payloads = learned.payloads.clone();
    engine.send_to_node(site, to, replay);
}

/// Push every relevant decided value to nodes that are in a previous site
/// but not in its successor, so they can satisfy their own exit logic.
fn inform_removed(engine: &Engine, index: isize, all: bool) {
    let sites: Vec<Rc<Site>> = engine.sites.borrow().all().to_vec();
    let mut index = index;
    while sites.len() > 1 && index >= 0 && ((index + 1) as usize) < sites.len() {
        let site = &sites[index as usize];
        let prev = &sites[(index + 1) as usize];

        for node in 0..prev.max_nodes() {
            if Some(node) == prev.nodeno {
                continue;
            }
            let member = &prev.nodes[node as usize];
            if site.has_address(member) {
                continue;
            }
            let mut synode = site.start;
            let end = engine.max_synode.get();
            while !synode.after(&end) {
                send_value(engine, prev, node, synode);
                synode = synode.incr(prev.max_nodes());
            }
        }
        if !all {
            break;
        }
        index -= 1;
    }
}

// =============================================================================
// Fetching values
// =============================================================================

/// Nudge undecided synods in `[executed, max_synode]` by asking peers for
/// their outcome.
fn read_missing_values<P: Providers>(engine: &Rc<Engine>, env: &Rc<Env<P>>, n: usize) {
    let mut find = engine.executed.get();
    let end = engine.max_synode.get();
    if find.after(&end) || find.is_null() {
        return;
    }
    let mut i = 0;
    while !find.after(&end) && i < n && !engine.too_far(find) {
        let machine = engine.cache.borrow_mut().force_get(find);
        {
            let st = machine.state();
            if !st.recently_active(env.time().now(), Duration::from_secs(1))
                && !st.finished()
                && !st.locked
            {
                drop(st);
                send_read(engine, env, find);
            }
        }
        find = next_synode(engine, find);
        i += 1;
    }
}

/// Nudge undecided synods by proposing no-ops for them. Only the
/// greatest live node does this, so concurrent fillers do not collide.
fn propose_missing_values<P: Providers>(engine: &Rc<Engine>, env: &Rc<Env<P>>, n: usize) {
    let mut find = engine.executed.get();
    let end = engine.max_synode.get();
    if find.after(&end) || find.is_null() {
        return;
    }
    let mut i = 0;
    while !find.after(&end) && i < n && !engine.too_far(find) {
        let machine = engine.cache.borrow_mut().force_get(find);
        if engine.wait_forced.get() {
            machine.state_mut().force(true);
        }
        let Some(site) = engine.find_site(find) else {
            break;
        };
        if site.nodeno.is_none() {
            break;
        }
        let ok = {
            let st = machine.state();
            (st.enforcer || !st.recently_active(env.time().now(), Duration::from_secs(1)))
                && !st.finished()
                && !st.locked
        };
        if ok {
            propose_noop(engine, env, find);
        }
        find = next_synode(engine, find);
        i += 1;
    }
}

fn find_value<P: Providers>(engine: &Rc<Engine>, env: &Rc<Env<P>>, wait: &mut u32) {
    let Some(site) = engine.find_site(engine.executed.get()) else {
        return;
    };
    if site.nodeno.is_none() {
        read_missing_values(engine, env, FIND_MAX);
        return;
    }
    let silence = engine.cfg.silence_window;
    match *wait {
        0 | 1 => {
            read_missing_values(engine, env, FIND_MAX);
            *wait += 1;
        }
        2 => {
            if i_am_the_greatest(&site, env.time().now(), silence) {
                propose_missing_values(engine, env, FIND_MAX);
            } else {
                read_missing_values(engine, env, FIND_MAX);
            }
            *wait += 1;
        }
        _ => propose_missing_values(engine, env, FIND_MAX),
    }
}

/// Obtain the decided value for a synod, driving reads and no-op
/// proposals until it settles. Returns `None` when the engine is winding
/// down.
async fn fetch_value<P: Providers>(
    engine: &Rc<Engine>,
    env: &Rc<Env<P>>,
    synode: Synode,
    run_gen_val: u64,
) -> Option<Rc<Machine>> {
    let mut wait = 0u32;
    let mut delay = 0.0;
    let machine = engine.cache.borrow_mut().force_get(synode);

    while !machine.state().finished() {
        if engine.shutdown.get() || engine.run_gen.get() != run_gen_val {
            return None;
        }
        let site = engine.find_site(synode);
        match site {
            None => {
                // The end of the world: no site governs this synod.
                // Synthesize a skip and move on.
                if machine.state_mut().skip(env.time().now()) {
                    machine.wakeup();
                }
                break;
            }
            Some(site) if site.max_nodes() == 0 => {
                if machine.state_mut().skip(env.time().now()) {
                    machine.wakeup();
                }
                break;
            }
            Some(site) => {
                // A peer known to be gone for good lets us skip the slow
                // ramp-up of the read/propose ladder.
                let owner_gone = site
                    .server(synode.node)
                    .map(|p| p.fast_skip_allowed.get())
                    .unwrap_or(false);
                if owner_gone {
                    if i_am_the_greatest(&site, env.time().now(), engine.cfg.silence_window) {
                        propose_missing_values(engine, env, 1);
                    } else {
                        read_missing_values(engine, env, 1);
                    }
                } else {
                    find_value(engine, env, &mut wait);
                }
            }
        }

        let max_wait = if machine.state().force_delivery {
            // Forcing triggers many rounds at once; wait longer between
            // nudges so they can finish.
            0.1
        } else {
            0.003
        };
        delay = wakeup_delay_for_perf(delay, max_wait);
        let _ = env
            .time()
            .timeout(Duration::from_secs_f64(delay), machine.rv.notified())
            .await;
    }
    Some(machine)
}

// =============================================================================
// Exit handling
// =============================================================================

fn setup_exit_handling(engine: &Engine, xc: &mut ExecuteContext, site: &Rc<Site>) {
    let delay_until;
    if site.is_member() {
        delay_until = compute_delay(site.start, site.event_horizon);
    } else {
        // We are not in the new site. Never deliver anything past its
        // start, and wait until a majority of the new site demonstrably
        // has everything of ours.
        xc.delivery_limit = site.start;
        xc.exit_synode = compute_delay(site.start, site.event_horizon);

        if site.is_empty() {
            // Nobody left to wait for: inflate the start so the majority
            // of the *current* group can agree on everything up to our
            // exit synod before the world ends.
            let mut inflated = site.clone_for_reconfig(&engine.self_addr);
            inflated.start = compute_delay(
                compute_delay(site.start, site.event_horizon),
                site.event_horizon,
            );
            engine.sites.borrow_mut().replace_latest(Rc::new(inflated));
        }
        if !xc.exit_synode.before(&engine.max_synode.get()) {
            let bump = next_synode(engine, xc.exit_synode);
            engine.set_max_synode(bump);
        }
        delay_until = xc.exit_synode;
        xc.exit_flag = true;
        info!(
            exit_synode = %xc.exit_synode,
            delivery_limit = %xc.delivery_limit,
            "this node was removed; exit trigger armed"
        );
    }

    if delay_until.after(&engine.max_synode.get()) {
        engine.set_max_synode(delay_until.incr_msgno());
    }
    xc.delay_fifo.push_back(delay_until);
    xc.inform_index += 1;
}

// =============================================================================
// State bodies
// =============================================================================

fn x_fetch<P: Providers>(
    engine: &Rc<Engine>,
    env: &Rc<Env<P>>,
    xc: &mut ExecuteContext,
    machine: &Rc<Machine>,
) {
    let learned = machine.state().learner.msg.clone();
    if let Some(learned) = learned {
        let is_config = learned
            .payloads
            .first()
            .map(|a| a.cargo.is_config())
            .unwrap_or(false);
        let past_boot_key = engine
            .site()
            .map(|s| engine.executed.get().after(&s.boot_key))
            .unwrap_or(false);

        if is_config && past_boot_key {
            if let Some(data) = learned.payloads.first() {
                let applied = reconfig::handle_config(engine, data, learned.force_delivery);
                if applied {
                    engine.last_config_modification.set(engine.executed.get());
                    engine
                        .sites
                        .borrow_mut()
                        .garbage_collect(engine.delivered.get());
                    match engine.site() {
                        None => {
                            xc.state = ExecState::Terminate;
                            return;
                        }
                        Some(site) => {
                            // New members need an outbound connection.
                            crate::net::start_peer_tasks(engine, env, &site);
                            if !xc.exit_flag {
                                setup_exit_handling(engine, xc, &site);
                            }
                        }
                    }
                    if engine.wait_forced.get()
                        && matches!(data.cargo, Cargo::ForceConfig(_))
                    {
                        // The forced config came back as a learned
                        // message; the wait is over.
                        engine.wait_forced.set(false);
                    }
                }
            }
        }
    }
    x_check_increment_fetch(engine, env, xc);
}

/// Push values to removed nodes whose trigger synod has been reached.
/// Returns whether the executor may switch to execute.
fn x_check_execute_inform(engine: &Engine, xc: &mut ExecuteContext) -> bool {
    if xc.delay_fifo.is_empty() {
        return true;
    }
    let front = *xc.delay_fifo.front().expect("non-empty fifo");
    if !engine.executed.get().before(&front) {
        while let Some(front) = xc.delay_fifo.front().copied() {
            if engine.executed.get().before(&front) {
                break;
            }
            inform_removed(engine, xc.inform_index, false);
            xc.delay_fifo.pop_front();
            xc.inform_index -= 1;
        }
        return true;
    }
    false
}

fn x_check_increment_fetch<P: Providers>(
    engine: &Rc<Engine>,
    _env: &Rc<Env<P>>,
    xc: &mut ExecuteContext,
) {
    if xc.check_exit(engine) {
        xc.state = ExecState::Terminate;
    } else {
        engine.set_executed(next_synode(engine, engine.executed.get()));
        if x_check_execute_inform(engine, xc) {
            xc.state = ExecState::Execute;
        }
    }
}

fn x_check_increment_execute(engine: &Engine, xc: &mut ExecuteContext) {
    if xc.check_exit(engine) {
        xc.state = ExecState::Terminate;
    } else {
        let delivered = next_synode(engine, engine.delivered.get());
        engine.delivered.set(delivered);
        if delivered == engine.executed.get() {
            xc.state = ExecState::Fetch;
        }
    }
}

fn x_execute(engine: &Rc<Engine>, xc: &mut ExecuteContext) {
    let delivered = engine.delivered.get();
    let site = engine.find_site(delivered);
    // Loser slots were never fetched, so the machine may be undecided;
    // those deliver nothing either way.
    let machine = engine.cache.borrow_mut().force_get(delivered);

    let learned = machine.state().learner.msg.clone();
    if let (Some(site), Some(learned)) = (&site, learned) {
        let skip = loser(delivered, site) || learned.is_noop();
        let withheld = xc.exit_flag && !delivered.before(&xc.delivery_limit);
        if !skip && !withheld {
            engine.last_delivered.set(delivered);
            execute_msg(engine, site, delivered, learned.as_ref());
        }
    }
    x_check_increment_execute(engine, xc);
}

/// Deliver a decided value to the application.
fn execute_msg(engine: &Engine, site: &Rc<Site>, synode: Synode, learned: &PaxMsg) {
    match learned.first_cargo() {
        Some(Cargo::App(_)) => {
            engine.deliver_to_app(Some(site), &learned.payloads, DeliveryStatus::Ok);
        }
        Some(Cargo::View(view)) => {
            if view.len() == site.global_node_set.borrow().len() {
                let ignore_forced = learned.force_delivery
                    && site.x_proto.ignores_intermediate_forced();
                if !ignore_forced {
                    *site.global_node_set.borrow_mut() = view.clone();
                    engine.app.deliver_view(site, synode);
                }
            }
        }
        _ => {}
    }
}

// =============================================================================
// The task
// =============================================================================

/// The executor task. Runs until removed, fatally wounded, or terminated.
pub async fn executor_task<P: Providers>(engine: Rc<Engine>, env: Rc<Env<P>>, run_gen_val: u64) {
    let mut xc = ExecuteContext::new();

    let mut executed = engine.executed.get();
    if executed.msgno == 0 {
        executed.msgno = 1;
        engine.set_executed(executed);
    }
    engine.delivered.set(engine.executed.get());
    debug!(executed = %engine.executed.get(), "executor started");

    while !engine.shutdown.get()
        && engine.run_gen.get() == run_gen_val
        && xc.state != ExecState::Terminate
    {
        if engine.fatal.get().is_some() {
            break;
        }
        match xc.state {
            ExecState::Fetch => {
                let executed = engine.executed.get();
                let site = engine.executor_site();
                let skip_loser = site
                    .as_ref()
                    .map(|s| s.is_member() && loser(executed, s))
                    .unwrap_or(false);
                if skip_loser {
                    // Just step past slots of expelled members.
                    x_check_increment_fetch(&engine, &env, &mut xc);
                } else {
                    match fetch_value(&engine, &env, executed, run_gen_val).await {
                        Some(machine) => x_fetch(&engine, &env, &mut xc, &machine),
                        None => break,
                    }
                }
            }
            ExecState::Execute => x_execute(&engine, &mut xc),
            ExecState::Terminate => {}
        }
    }

    if engine.run_gen.get() != run_gen_val {
        debug!("executor stopped by lifecycle terminate");
        return;
    }

    if let Some(error) = engine.fatal.get() {
        warn!(error = %error, "executor exiting on fatal condition");
        fsm::terminate_and_exit(&engine, &env);
        return;
    }

    // Inform every removed node before we go, wait for the messages to
    // propagate, then take the engine down.
    inform_removed(&engine, xc.inform_index, true);
    env.time().sleep(engine.cfg.terminate_delay).await;
    info!("executor terminating the engine");
    fsm::terminate_and_exit(&engine, &env);
}
