//! The proposer task pool.
//!
//! A fixed pool of identical tasks drains the client input queue. Each
//! task grabs a message (batching whatever else is queued behind it, up
//! to the batch limits), finds a free synod it owns, and drives Paxos
//! rounds until *its* value is the one learned — a round can settle with
//! someone else's value (typically a no-op proposed by a peer that got
//! tired of waiting), in which case the proposer simply moves on to the
//! next slot and tries again.
//!
//! Because several proposer tasks race for synods, two payloads submitted
//! back-to-back by one client may be delivered in either order; a client
//! that cares submits the second only after the first is delivered.

use std::rc::Rc;
use std::time::Duration;

use conclave_core::{Providers, TimeProvider};
use tracing::{debug, warn};

use crate::acceptor;
use crate::app::DeliveryStatus;
use crate::config::{MAX_BATCH_APP_DATA, MAX_BATCH_SIZE};
use crate::engine::{Engine, Env};
use crate::machine::{Machine, Pin};
use crate::msg::{Op, PaxMsg, ValueKind};
use crate::site::Site;
use crate::synode::Synode;

/// Exponential backoff for the proposer's wait on a round.
///
/// Starts near the observed round-trip, multiplies by 1.4, and is capped
/// at `min(0.5 s, 10 × rtt)` but never below 5 ms.
pub fn wakeup_delay(site: &Site, old: f64) -> f64 {
    let rtt = site.max_rtt.get();
    let mut retval = if old == 0.0 { 0.001 + rtt } else { old * 1.4 };

    let minimum_threshold = 0.005;
    let mut maximum_threshold = 0.500;
    let mut candidate_threshold = rtt * 10.0;
    if candidate_threshold < minimum_threshold {
        candidate_threshold = minimum_threshold;
    }
    if candidate_threshold < maximum_threshold {
        maximum_threshold = candidate_threshold;
    }
    while retval > maximum_threshold {
        retval /= 1.3;
    }
    retval
}

/// Obtain the machine for a synod, waiting for the executor to free
/// cache room when the cache is over its limit. Gives up after `timeout`,
/// which means the cache is exhausted.
pub async fn wait_for_cache<P: Providers>(
    engine: &Rc<Engine>,
    env: &Rc<Env<P>>,
    synode: Synode,
    timeout: Duration,
) -> Option<Rc<Machine>> {
    let started = env.time().now();
    loop {
        {
            let mut cache = engine.cache.borrow_mut();
            if cache.is_cached(synode) || !cache.over_limit() {
                return Some(cache.force_get(synode));
            }
            cache.shrink(engine.executed.get());
            if !cache.over_limit() {
                return Some(cache.force_get(synode));
            }
        }
        // Over the limit with nothing evictable: wait for the executor
        // to move past pinned machines.
        if env.time().now().saturating_sub(started) > timeout {
            return None;
        }
        let _ = env
            .time()
            .timeout(Duration::from_millis(500), engine.exec_wait.notified())
            .await;
    }
}

/// The next message number's slot owned by this node.
fn next_own_slot(engine: &Engine, synode: Synode) -> Synode {
    let mut next = Synode::new(synode.group_id, synode.msgno + 1, 0);
    if let Some(nodeno) = engine.find_site(next).and_then(|s| s.nodeno) {
        next.node = nodeno;
    }
    next
}

/// Pull the rest of the queue into one proposal, preserving arrival
/// order. Configuration and view messages are never batched — they need
/// a message number of their own.
fn batch_from_queue(engine: &Engine, msg: &mut PaxMsg) {
    let batchable = !msg
        .first_cargo()
        .map(|c| c.is_config() || c.is_view())
        .unwrap_or(true);
    if !batchable {
        return;
    }
    let mut size: usize = msg.payloads.iter().map(|a| a.size()).sum();
    let mut count = msg.payloads.len();

    while size <= MAX_BATCH_SIZE && count <= MAX_BATCH_APP_DATA && !engine.input.is_empty() {
        let Some(extra) = engine.input.try_get() else {
            break;
        };
        let extra_config = extra
            .first_cargo()
            .map(|c| c.is_config() || c.is_view())
            .unwrap_or(true);
        let extra_size: usize = extra.payloads.iter().map(|a| a.size()).sum();
        if extra_config
            || count + extra.payloads.len() > MAX_BATCH_APP_DATA
            || size + extra_size > MAX_BATCH_SIZE
        {
            engine.input.put_front(extra);
            break;
        }
        size += extra_size;
        count += extra.payloads.len();
        msg.payloads.extend(extra.payloads);
    }
}

enum RoundOutcome {
    /// Our value was learned.
    Mine,
    /// The slot settled with someone else's value; try the next slot.
    Lost,
    /// The engine is winding down.
    Stop,
}

/// One proposer task out of the pool.
pub async fn proposer_task<P: Providers>(
    engine: Rc<Engine>,
    env: Rc<Env<P>>,
    self_id: usize,
    run_gen_val: u64,
) {
    debug!(self_id, "proposer started");
    while !engine.shutdown.get() && engine.run_gen.get() == run_gen_val {
        // Wait for a client message, bounded so termination is noticed.
        let Ok(mut client_msg) = env
            .time()
            .timeout(Duration::from_secs(1), engine.input.get())
            .await
        else {
            continue;
        };

        batch_from_queue(&engine, &mut client_msg);

        // One log sequence number for the whole batch.
        let lsn = engine.assign_lsn();
        for payload in &mut client_msg.payloads {
            payload.lsn = lsn;
        }

        let placed = place_message(&engine, &env, &mut client_msg, run_gen_val).await;
        if !placed {
            engine.deliver_to_app(None, &client_msg.payloads, DeliveryStatus::Failure);
        }
    }
    debug!(self_id, "proposer stopped");
}

/// Drive rounds until the client message is learned somewhere. Returns
/// false when it could not be placed at all.
async fn place_message<P: Providers>(
    engine: &Rc<Engine>,
    env: &Rc<Env<P>>,
    client_msg: &mut PaxMsg,
    run_gen_val: u64,
) -> bool {
    loop {
        if engine.shutdown.get() || engine.run_gen.get() != run_gen_val {
            return false;
        }

        // Find a free slot we own, waiting out the horizon if the
        // executor is behind.
        let mut msgno = engine.current_message.get();
        if msgno.is_null() {
            return false;
        }
        while engine.is_busy(msgno) {
            while engine.too_far(next_own_slot(engine, msgno)) {
                let _ = env
                    .time()
                    .timeout(Duration::from_secs(1), engine.exec_wait.notified())
                    .await;
                if engine.shutdown.get() || engine.run_gen.get() != run_gen_val {
                    return false;
                }
            }
            msgno = next_own_slot(engine, msgno);
        }

        let Some(site) = engine.find_site(msgno) else {
            return false;
        };
        let Some(nodeno) = site.nodeno else {
            // We are not in the site this slot belongs to.
            return false;
        };
        engine.set_current_message(msgno);
        engine.brand_client_msg(client_msg, msgno);

        match run_round(engine, env, &site, nodeno, msgno, client_msg, run_gen_val).await {
            RoundOutcome::Mine => return true,
            RoundOutcome::Lost => continue,
            RoundOutcome::Stop => return false,
        }
    }
}

async fn run_round<P: Providers>(
    engine: &Rc<Engine>,
    env: &Rc<Env<P>>,
    site: &Rc<Site>,
    nodeno: u16,
    msgno: Synode,
    client_msg: &PaxMsg,
    run_gen_val: u64,
) -> RoundOutcome {
    let Some(machine) = wait_for_cache(engine, env, msgno, Duration::from_secs(60)).await else {
        warn!(synode = %msgno, "could not get a machine, retrying");
        return RoundOutcome::Lost;
    };
    let pin = Pin::new(machine);
    let machine = pin.machine();

    {
        let mut st = machine.state_mut();
        if st.locked {
            // Another proposer grabbed the slot while we waited.
            return RoundOutcome::Lost;
        }
        st.locked = true;
        if client_msg.force_delivery {
            st.force_delivery = true;
        }
        st.proposer.msg = Some(Rc::new(client_msg.clone()));
    }

    // Full three-phase Paxos when configured, when forcing, or when some
    // other node already got us to promise — which happens when a peer
    // timed out on us and proposed a no-op that we accepted.
    push_round(engine, env, machine, site, nodeno);
    let mut start_push = env.time().now();

    let mut delay = 0.0;
    loop {
        if engine.shutdown.get() || engine.run_gen.get() != run_gen_val {
            machine.state_mut().locked = false;
            return RoundOutcome::Stop;
        }
        if machine.state().finished() {
            break;
        }
        delay = wakeup_delay(site, delay);
        let _ = env
            .time()
            .timeout(Duration::from_secs_f64(delay), machine.rv.notified())
            .await;

        {
            let st = machine.state();
            if st.synode != msgno || st.proposer.msg.is_none() {
                drop(st);
                machine.state_mut().locked = false;
                return RoundOutcome::Lost;
            }
            if st.finished() {
                break;
            }
        }

        // Re-push if the round has stalled.
        let now = env.time().now();
        if now.saturating_sub(start_push) >= engine.cfg.push_retry {
            push_3p(engine, env, machine, site, nodeno);
            start_push = now;
        }
    }

    machine.state_mut().locked = false;
    let matched = {
        let st = machine.state();
        st.learner
            .msg
            .as_ref()
            .is_some_and(|learned| learned.matches_mine(client_msg))
    };
    if matched {
        RoundOutcome::Mine
    } else {
        RoundOutcome::Lost
    }
}

fn push_round<P: Providers>(
    engine: &Rc<Engine>,
    env: &Rc<Env<P>>,
    machine: &Rc<Machine>,
    site: &Rc<Site>,
    nodeno: u16,
) {
    let three_phase = {
        let st = machine.state();
        engine.cfg.three_phase || st.force_delivery || st.acceptor.promise.cnt > 0
    };
    if three_phase {
        push_3p(engine, env, machine, site, nodeno);
    } else {
        push_2p(engine, env, machine, site, nodeno);
    }
}

/// Issue phase 1: broadcast the prepare and handle our own copy locally.
pub fn push_3p<P: Providers>(
    engine: &Rc<Engine>,
    env: &Rc<Env<P>>,
    machine: &Rc<Machine>,
    site: &Rc<Site>,
    nodeno: u16,
) {
    let mut prepare = {
        let mut st = machine.state_mut();
        let kind = st
            .proposer
            .msg
            .as_ref()
            .map(|m| m.value_kind)
            .unwrap_or(ValueKind::Normal);
        st.start_round_3p(nodeno, kind)
    };
    prepare.from = nodeno;
    engine.send_to_others(site, &prepare);
    acceptor::dispatch_local(engine, env, prepare);
}

/// Skip phase 1: broadcast the accept at the reserved owner ballot.
pub fn push_2p<P: Providers>(
    engine: &Rc<Engine>,
    env: &Rc<Env<P>>,
    machine: &Rc<Machine>,
    site: &Rc<Site>,
    nodeno: u16,
) {
    let accept = {
        let mut st = machine.state_mut();
        st.start_round_2p(nodeno)
    };
    let Some(mut accept) = accept else {
        return;
    };
    accept.from = nodeno;
    engine.send_to_others(site, &accept);
    acceptor::dispatch_local(engine, env, accept);
}

/// Propose a no-op for a slot someone else owns but never used. Always a
/// full three-phase round: only the owner may use the fast path.
pub fn propose_noop<P: Providers>(
    engine: &Rc<Engine>,
    env: &Rc<Env<P>>,
    synode: Synode,
) {
    let Some(site) = engine.find_site(synode) else {
        return;
    };
    let Some(nodeno) = site.nodeno else {
        return;
    };
    let machine = engine.cache.borrow_mut().force_get(synode);
    {
        let mut st = machine.state_mut();
        let mut noop = PaxMsg::for_op(Op::ClientMsg, synode);
        noop.value_kind = ValueKind::NoOp;
        st.proposer.msg = Some(Rc::new(noop));
    }
    push_3p(engine, env, &machine, &site, nodeno);
}
