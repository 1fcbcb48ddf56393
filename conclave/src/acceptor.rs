//! Inbound message dispatch: the acceptor/learner side of the engine.
//!
//! One [`acceptor_learner_task`] runs per inbound connection. It reads
//! framed messages, applies the admission checks (horizon, cache, boot
//! state), hands each message to [`dispatch`], and writes the produced
//! replies back on the same connection in order.
//!
//! [`dispatch`] is a pure-ish router: one arm per operation, each arm
//! delegating to the machine's transition handler and translating the
//! outcome into sends, wakeups, or lifecycle events. Local messages take
//! the same path through [`dispatch_local`], which feeds self-addressed
//! replies straight back into the router — the local node is just another
//! acceptor.

use std::rc::Rc;
use std::time::Duration;

use conclave_core::{Providers, RandomProvider, TimeProvider};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use crate::config::SKIP_OVER_NUM;
use crate::detector;
use crate::engine::{Engine, Env, FatalError};
use crate::fsm::{self, FsmEvent};
use crate::machine::{Machine, QuorumRule, TinyLearnOutcome};
use crate::msg::{
    Cargo, ClientReply, Member, Op, PaxMsg, SynodeAppData, VOID_NODE, ValueKind,
};
use crate::recovery;
use crate::reconfig;
use crate::site::Site;
use crate::synode::Synode;
use crate::wire;

/// A message is harmless if it cannot change the outcome of a consensus
/// round. Learns do change the *local* value, but the sender derived it
/// from a majority of acceptors, so in that sense they are harmless too.
pub fn harmless(msg: &PaxMsg) -> bool {
    if msg.synode.msgno == 0 {
        return true;
    }
    matches!(
        msg.op,
        Op::IAmAlive
            | Op::AreYouAlive
            | Op::NeedBoot
            | Op::Snapshot
            | Op::Learn
            | Op::RecoverLearn
            | Op::TinyLearn
            | Op::Die
    )
}

/// Whether dispatching this op needs a machine at all.
pub fn should_poll_cache(op: Op) -> bool {
    !matches!(op, Op::Die | Op::Snapshot | Op::Initial | Op::ClientMsg)
}

fn quorum_rule<'a>(engine: &Engine, site: &'a Site, forced: Option<&'a Site>) -> QuorumRule<'a> {
    QuorumRule {
        site,
        consensus: engine.consensus.get(),
        forced,
    }
}

fn get_machine(engine: &Engine, synode: Synode) -> Rc<Machine> {
    engine.cache.borrow_mut().force_get(synode)
}

// =============================================================================
// Learn plumbing
// =============================================================================

/// Record a learned value and run everything that hangs off a decision:
/// sweeper activation, cache accounting, boot and forced-config side
/// effects, waiter wakeup.
pub fn handle_learn_msg<P: Providers>(
    engine: &Rc<Engine>,
    env: &Rc<Env<P>>,
    machine: &Rc<Machine>,
    msg: &PaxMsg,
) {
    let now = env.time().now();
    let newly = {
        let mut learned = msg.clone();
        learned.op = Op::Learn;
        machine.state_mut().learn(Rc::new(learned), now)
    };
    machine.wakeup();
    if !newly {
        return;
    }

    engine.sweeper_wait.notify_waiters();

    // Track the payload bytes now held by the machine, then make room.
    let bytes: u64 = msg.payloads.iter().map(|a| a.size() as u64).sum();
    {
        let mut cache = engine.cache.borrow_mut();
        cache.add_size(machine, bytes);
        if !cache.shrink(engine.executed.get()) {
            drop(cache);
            engine.note_fatal(FatalError::CacheExhausted);
        }
    }

    if let Some(Cargo::UnifiedBoot(_)) = msg.first_cargo() {
        if let Some(data) = msg.payloads.first() {
            fsm::dispatch(engine, env, FsmEvent::NetBoot(data.clone()));
        }
    }

    // Someone is forcing a new config: install it immediately and mark
    // everything in the pipeline forced so it eventually finishes.
    if msg.force_delivery {
        if let Some(data) = msg.payloads.first() {
            let ignores = engine
                .find_site(msg.synode)
                .map(|s| s.x_proto.ignores_intermediate_forced())
                .unwrap_or(false);
            match &data.cargo {
                Cargo::AddNode(members) if !ignores => {
                    if let Some(site) = reconfig::handle_add_node(engine, data, members) {
                        reconfig::start_force_config(engine, site, false);
                    }
                }
                Cargo::RemoveNode(members) if !ignores => {
                    if let Some(site) = reconfig::handle_remove_node(engine, data, members) {
                        reconfig::start_force_config(engine, site, false);
                    }
                }
                Cargo::ForceConfig(members) => {
                    let site = reconfig::install_node_group(engine, data, members);
                    reconfig::start_force_config(engine, site, false);
                }
                _ => {}
            }
        }
    }
}

/// Ask for the outcome of a synod: the owner gets the question when we
/// are the owner ourselves or have no index; otherwise one random peer.
pub fn send_read<P: Providers>(engine: &Rc<Engine>, env: &Rc<Env<P>>, synode: Synode) {
    let Some(site) = engine.find_site(synode) else {
        return;
    };
    let read = PaxMsg::for_op(Op::Read, synode);
    if site.nodeno.is_none() || site.nodeno == Some(synode.node) {
        // No index of our own, or we own the slot ourselves: ask everyone.
        engine.send_to_others(&site, &read);
    } else {
        let pick = env.random().random_range(0..site.max_nodes());
        engine.send_to_someone(&site, read, pick);
    }
}

/// Broadcast a learn (or tiny learn) produced by a majority of accepts.
fn broadcast_round_msg<P: Providers>(engine: &Rc<Engine>, env: &Rc<Env<P>>, site: &Rc<Site>, mut learn: PaxMsg) {
    let Some(nodeno) = site.nodeno else {
        return;
    };
    learn.from = nodeno;
    engine.send_to_others(site, &learn);
    dispatch_local(engine, env, learn);
}

// =============================================================================
// Ping handling
// =============================================================================

fn handle_alive<P: Providers>(
    engine: &Rc<Engine>,
    env: &Rc<Env<P>>,
    site: Option<&Rc<Site>>,
    msg: &PaxMsg,
    reply_queue: &mut Vec<PaxMsg>,
) {
    let now = env.time().now();

    // A member that keeps probing us although we are long booted cannot
    // be reaching us over its normal outbound connection; recycle ours so
    // the pair can re-establish cleanly.
    if engine.booted.get() && msg.op == Op::AreYouAlive {
        if let Some(site) = site {
            if Some(msg.from) != site.nodeno {
                if let Some(peer) = site.server(msg.from) {
                    if peer.record_ping(now) {
                        warn!(
                            peer = %peer.address,
                            "shutting down outgoing connection: the peer keeps \
                             probing although we are booted"
                        );
                        peer.mark_unreachable();
                        return;
                    }
                }
            }
        }
    }

    if engine.booted.get() {
        return;
    }
    // Beg for a boot at most once a second.
    if let Some(sent) = engine.sent_alive.get() {
        if now.saturating_sub(sent) < Duration::from_secs(1) {
            return;
        }
    }
    // Never answer our own ping.
    if let Some(site) = site {
        if Some(msg.from) == site.nodeno || msg.from == msg.to {
            return;
        }
        // A ping aimed at a different incarnation of this address is not
        // for us.
        if let Some(Cargo::BootIdentity(member)) = msg.first_cargo() {
            if !site.has_uid(member) {
                return;
            }
        }
    }
    if engine.dead_sites.borrow().is_dead(msg.group_id) {
        return;
    }

    engine.sent_alive.set(Some(now));
    let mut reply = msg.reply_template(Op::NeedBoot);
    reply.payloads.push(crate::msg::AppData::command(
        msg.group_id,
        Cargo::BootIdentity(Member::new(engine.self_addr, engine.self_uid)),
    ));
    reply_queue.push(reply);
}

// =============================================================================
// Auto-skip heuristic
// =============================================================================

/// On an inbound accept for a slot its owner is driving, consider
/// collapsing our *own* slot at the same message number: if we have no
/// client traffic and no round has touched our slot, we will never use
/// it, and skipping it now saves the peer a no-op round later.
///
/// Never skips a slot with a pending promise or accept: those may carry a
/// value, and only a full round may decide them.
fn auto_skip<P: Providers>(
    engine: &Rc<Engine>,
    env: &Rc<Env<P>>,
    site: &Rc<Site>,
    msg: &PaxMsg,
) -> bool {
    let Some(nodeno) = site.nodeno else {
        return false;
    };
    if msg.synode.node == nodeno || msg.synode.node != msg.from {
        return false;
    }
    if !engine.input.is_empty() {
        return false;
    }
    let own_slot = msg.synode.with_node(nodeno);
    if engine.executed.get().msgno > own_slot.msgno {
        return false;
    }
    if own_slot.msgno - engine.executed.get().msgno >= SKIP_OVER_NUM {
        return false;
    }
    let machine = get_machine(engine, own_slot);
    {
        let st = machine.state();
        if st.finished() || st.locked || st.accepted() || st.acceptor.promise.cnt > 0 {
            return false;
        }
    }

    let mut skip = PaxMsg::for_op(Op::Skip, own_slot);
    skip.value_kind = ValueKind::NoOp;
    skip.from = nodeno;
    engine.send_to_others(site, &skip);
    if machine.state_mut().skip(env.time().now()) {
        machine.wakeup();
    }
    true
}

// =============================================================================
// Client commands
// =============================================================================

fn client_reply(msg: &PaxMsg, code: ClientReply) -> PaxMsg {
    let mut reply = msg.reply_template(Op::ClientReply);
    reply.cli_err = Some(code);
    reply
}

fn dispatch_client_msg<P: Providers>(
    engine: &Rc<Engine>,
    env: &Rc<Env<P>>,
    msg: &PaxMsg,
    reply_queue: &mut Vec<PaxMsg>,
) {
    let Some(cargo) = msg.first_cargo() else {
        return;
    };
    match cargo {
        Cargo::Exit => {
            engine.bury_group();
            fsm::terminate_and_exit(engine, env);
        }
        Cargo::Reset => {
            engine.bury_group();
            fsm::dispatch(engine, env, FsmEvent::Terminate);
        }
        Cargo::RemoveReset => {
            fsm::dispatch(engine, env, FsmEvent::Terminate);
        }
        Cargo::EnableArbitrator | Cargo::DisableArbitrator | Cargo::ConvertIntoLocalServer => {
            reply_queue.push(client_reply(msg, ClientReply::Ok));
        }
        Cargo::SetCacheLimit(limit) => {
            engine.cache.borrow_mut().set_limit(*limit);
            reply_queue.push(client_reply(msg, ClientReply::Ok));
        }
        Cargo::SetNotifyTrulyRemove(address) => {
            // The detector contract: remember an address whose true
            // removal should be reported. Parsing failure is the only
            // error path.
            let ok = address.parse::<conclave_core::NetworkAddress>().is_ok();
            reply_queue.push(client_reply(
                msg,
                if ok { ClientReply::Ok } else { ClientReply::Fail },
            ));
        }
        Cargo::TerminateAndExit => {
            reply_queue.push(client_reply(msg, ClientReply::Ok));
            fsm::terminate_and_exit(engine, env);
        }
        Cargo::GetEventHorizon => {
            let mut reply = client_reply(
                msg,
                if engine.site().is_some() {
                    ClientReply::Ok
                } else {
                    ClientReply::Fail
                },
            );
            reply.event_horizon = engine.site().map(|s| s.event_horizon);
            reply_queue.push(reply);
        }
        Cargo::GetSynodeAppData(synodes) => {
            let mut reply = client_reply(msg, ClientReply::Ok);
            let cache = engine.cache.borrow();
            let mut all_decided = true;
            for synode in synodes {
                match cache.get_no_touch(*synode) {
                    Some(machine) if machine.state().finished() => {
                        let st = machine.state();
                        let payloads = st
                            .learner
                            .msg
                            .as_ref()
                            .map(|m| m.payloads.clone())
                            .unwrap_or_default();
                        reply.synode_app_data.push(SynodeAppData {
                            synode: *synode,
                            payloads,
                        });
                    }
                    _ => all_decided = false,
                }
            }
            if !all_decided {
                reply.cli_err = Some(ClientReply::Fail);
            }
            reply_queue.push(reply);
        }
        Cargo::AddNode(_) | Cargo::RemoveNode(_) | Cargo::ForceConfig(_)
        | Cargo::SetEventHorizon(_) => {
            let code = reconfig::can_execute_cfgchange(engine, msg, env.time().now());
            reply_queue.push(client_reply(msg, code));
            if code != ClientReply::Ok {
                return;
            }
            let mut queued = msg.clone();
            if let Cargo::ForceConfig(_) = cargo {
                // Forced configs must drain the pipeline without the old
                // majority; the proposal travels force-marked.
                queued.force_delivery = true;
                if let Some(data) = msg.payloads.first() {
                    fsm::dispatch(engine, env, FsmEvent::ForceConfig(data.clone()));
                }
            }
            engine.input.put(queued);
        }
        Cargo::UnifiedBoot(_) => {
            if let Some(data) = msg.payloads.first() {
                fsm::dispatch(engine, env, FsmEvent::NetBoot(data.clone()));
            }
            engine.input.put(msg.clone());
        }
        Cargo::App(_) | Cargo::View(_) => {
            reply_queue.push(client_reply(msg, ClientReply::Ok));
            engine.input.put(msg.clone());
        }
        Cargo::BootIdentity(_) => {}
    }
}

// =============================================================================
// The router
// =============================================================================

/// Route one message to its handler. Replies for the sender go into
/// `reply_queue`; broadcasts go straight to the peers.
pub fn dispatch<P: Providers>(
    engine: &Rc<Engine>,
    env: &Rc<Env<P>>,
    msg: &PaxMsg,
    reply_queue: &mut Vec<PaxMsg>,
) {
    let site = engine.find_site(msg.synode);
    let in_front = engine.too_far(msg.synode) && !msg.force_delivery;
    let now = env.time().now();

    // Any traffic from a member doubles as a liveness signal.
    if let Some(site) = &site {
        if msg.op != Op::ClientMsg && msg.from != VOID_NODE && msg.from < site.max_nodes() {
            if !detector::note_detected(site, msg.from, now) {
                engine.detector_wait.notify_waiters();
            }
            detector::update_delivered(site, msg.from, msg.delivered);
        }
    }

    // Round messages for synods beyond the horizon are dropped outright:
    // working on them would break the pipeline bound the exit logic
    // relies on. Learns stay admissible, they carry settled outcomes.
    if in_front && matches!(msg.op, Op::Prepare | Op::Accept | Op::Read | Op::Skip) {
        debug!(synode = %msg.synode, op = ?msg.op, "dropping message beyond the event horizon");
        return;
    }

    match msg.op {
        Op::ClientMsg => dispatch_client_msg(engine, env, msg, reply_queue),

        Op::Initial | Op::ClientReply => {}

        Op::Read => {
            let machine = get_machine(engine, msg.synode);
            let reply = machine.state().learn_for_ignorant(msg);
            if let Some(reply) = reply {
                reply_queue.push(reply);
            }
        }

        Op::Prepare => {
            let machine = get_machine(engine, msg.synode);
            if msg.force_delivery {
                machine.state_mut().force_delivery = true;
            }
            // An unbooted node may have been an acceptor in a previous
            // life and forgotten its promises; letting it vote again
            // could un-choose a value. It stays silent until booted.
            if engine.booted.get() {
                let reply = machine.state_mut().handle_prepare(msg, now);
                if let Some(reply) = reply {
                    reply_queue.push(reply);
                }
            }
        }

        Op::AckPrepare | Op::AckPrepareEmpty => {
            if in_front || !engine.cache.borrow().is_cached(msg.synode) {
                return;
            }
            let machine = get_machine(engine, msg.synode);
            if msg.force_delivery {
                machine.state_mut().force_delivery = true;
            }
            let accept = {
                let mut st = machine.state_mut();
                if st.proposer.msg.is_none() {
                    return;
                }
                let Some(site) = &site else {
                    return;
                };
                let forced = engine.forced.borrow().clone();
                st.handle_ack_prepare(msg, &quorum_rule(engine, site.as_ref(), forced.as_deref()))
            };
            if let (Some(accept), Some(site)) = (accept, &site) {
                broadcast_round_msg(engine, env, site, accept);
            }
        }

        Op::Accept => {
            let machine = get_machine(engine, msg.synode);
            if msg.force_delivery {
                machine.state_mut().force_delivery = true;
            }
            if !engine.booted.get() {
                return;
            }
            let skip_flag = site
                .as_ref()
                .is_some_and(|site| auto_skip(engine, env, site, msg));
            let reply = machine.state_mut().handle_accept(msg, now, skip_flag);
            if let Some(reply) = reply {
                reply_queue.push(reply);
            }
        }

        Op::AckAccept | Op::MultiAckAccept => {
            if in_front || !engine.cache.borrow().is_cached(msg.synode) {
                return;
            }
            let machine = get_machine(engine, msg.synode);
            if msg.force_delivery {
                machine.state_mut().force_delivery = true;
            }
            let learn = {
                let mut st = machine.state_mut();
                if st.proposer.msg.is_none() {
                    return;
                }
                let Some(site) = &site else {
                    return;
                };
                let forced = engine.forced.borrow().clone();
                st.handle_ack_accept(
                    msg,
                    &quorum_rule(engine, site.as_ref(), forced.as_deref()),
                    engine.cfg.no_duplicate_payload,
                )
            };
            if let (Some(learn), Some(site)) = (learn, &site) {
                broadcast_round_msg(engine, env, site, learn);
            }

            // The replier also collapsed its own slot at this message
            // number; mirror that locally.
            if msg.op == Op::MultiAckAccept {
                let skipped = msg.synode.with_node(msg.from);
                let machine = get_machine(engine, skipped);
                if msg.force_delivery {
                    machine.state_mut().force_delivery = true;
                }
                if machine.state_mut().skip(now) {
                    machine.wakeup();
                }
            }
        }

        Op::RecoverLearn | Op::Learn => {
            let machine = get_machine(engine, msg.synode);
            if msg.force_delivery {
                machine.state_mut().force_delivery = true;
            }
            engine.update_max_synode(msg);
            handle_learn_msg(engine, env, &machine, msg);
        }

        Op::TinyLearn => {
            if msg.is_noop() {
                // A no-op tiny learn carries everything there is to know.
                let machine = get_machine(engine, msg.synode);
                engine.update_max_synode(msg);
                handle_learn_msg(engine, env, &machine, msg);
                return;
            }
            let machine = get_machine(engine, msg.synode);
            if msg.force_delivery {
                machine.state_mut().force_delivery = true;
            }
            let outcome = machine.state_mut().tiny_learn(msg, now);
            match outcome {
                TinyLearnOutcome::Learned => {
                    engine.update_max_synode(msg);
                    machine.wakeup();
                    engine.sweeper_wait.notify_waiters();
                    let bytes = {
                        let st = machine.state();
                        st.learner
                            .msg
                            .as_ref()
                            .map(|m| m.payloads.iter().map(|a| a.size() as u64).sum())
                            .unwrap_or(0)
                    };
                    engine.cache.borrow_mut().add_size(&machine, bytes);
                }
                TinyLearnOutcome::NeedRead => send_read(engine, env, msg.synode),
                TinyLearnOutcome::AlreadyFinished => {}
            }
        }

        Op::Skip => {
            let machine = get_machine(engine, msg.synode);
            if msg.force_delivery {
                machine.state_mut().force_delivery = true;
            }
            if machine.state_mut().skip(now) {
                machine.wakeup();
            }
        }

        Op::IAmAlive => {
            // Only the max_synode gossip matters; the synode field is the
            // sender's cursor, not a slot.
            if !engine.dead_sites.borrow().is_dead(msg.group_id) {
                let max = engine.max_synode.get();
                if max.group_id == msg.synode.group_id && msg.max_synode.after(&max) {
                    engine.set_max_synode(msg.max_synode);
                    engine.sweeper_wait.notify_waiters();
                }
            }
            handle_alive(engine, env, site.as_ref(), msg, reply_queue);
        }

        Op::AreYouAlive => {
            handle_alive(engine, env, site.as_ref(), msg, reply_queue);
        }

        Op::NeedBoot => {
            let can_serve = fsm::can_send_snapshot(engine)
                && engine.site().is_some_and(|s| !s.boot_key.is_null());
            if can_serve {
                // A need_boot keyed to a synode before our history still
                // deserves an answer from the current site.
                let serve = site.clone().or_else(|| engine.site());
                if let Some(serve_site) = serve {
                    if recovery::should_handle_need_boot(&serve_site, msg) {
                        reply_queue.extend(recovery::snapshot_replies(engine, msg));
                    } else {
                        info!(from = msg.from, "refusing need_boot from unknown incarnation");
                    }
                }
            }
        }

        Op::Snapshot => {
            let Some(snapshot) = &msg.snapshot else {
                return;
            };
            let duplicate =
                engine.recovery.borrow().start_config == snapshot.highest_boot_key();
            if !duplicate && !engine.dead_sites.borrow().is_dead(msg.group_id) {
                engine.update_max_synode(msg);
                if msg.from != VOID_NODE {
                    engine.recovery.borrow_mut().note_snapshot(msg.from);
                }
                fsm::dispatch(engine, env, FsmEvent::Snapshot(snapshot.clone()));
            }
        }

        Op::Die => {
            // If the synod in the die message is already delivered, we
            // actually got consensus on it and the warning is moot. At or
            // past the cursor, the group has moved beyond reach: exit.
            if !msg.synode.before(&engine.executed.get()) {
                warn!(
                    synode = %msg.synode,
                    executed = %engine.executed.get(),
                    "unable to get this message, the group is too far ahead; exiting"
                );
                engine.note_fatal(FatalError::TooFarBehind);
                fsm::terminate_and_exit(engine, env);
            } else {
                debug!(synode = %msg.synode, "stale die_op for an already delivered synod");
            }
        }
    }
}

/// Dispatch a locally produced message, feeding replies addressed to this
/// node back through the router until nothing is left. This is how the
/// proposer acts as its own acceptor.
pub fn dispatch_local<P: Providers>(engine: &Rc<Engine>, env: &Rc<Env<P>>, msg: PaxMsg) {
    let mut pending = vec![msg];
    while let Some(next) = pending.pop() {
        let mut replies = Vec::new();
        dispatch(engine, env, &next, &mut replies);
        for mut reply in replies {
            if let Some(site) = engine.find_site(reply.synode) {
                if let Some(nodeno) = site.nodeno {
                    reply.from = nodeno;
                }
            }
            reply.delivered = engine.delivered.get();
            reply.max_synode = engine.max_synode.get();
            pending.push(reply);
        }
    }
}

// =============================================================================
// The per-connection task
// =============================================================================

/// Serve one inbound connection: read framed messages, apply admission
/// checks, dispatch, and write replies back in request order.
pub async fn acceptor_learner_task<P: Providers, S>(
    engine: Rc<Engine>,
    env: Rc<Env<P>>,
    mut stream: S,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Protocol negotiation comes first on every inbound connection.
    let proto = match wire::serve_handshake(&mut stream).await {
        Ok(proto) => proto,
        Err(e) => {
            debug!(error = %e, "handshake failed, dropping connection");
            return;
        }
    };
    debug!(proto = %proto, "inbound connection negotiated");

    let mut reply_queue: Vec<PaxMsg> = Vec::new();
    while !engine.shutdown.get() {
        let msg = match wire::read_msg(&mut stream).await {
            Ok(msg) => msg,
            Err(wire::WireError::UnknownOp) => continue,
            Err(_) => break,
        };

        let site = engine.find_site(msg.synode);
        let behind = site
            .as_ref()
            .map(|s| s.max_nodes() > 0 && msg.synode.msgno < engine.delivered.get().msgno)
            .unwrap_or(false);

        // A round op for a node index the site does not have can only be
        // stale routing; answer with a no-op learn so the sender stops.
        if matches!(msg.op, Op::Read | Op::Prepare | Op::Accept) {
            if let Some(site) = &site {
                if msg.synode.node >= site.max_nodes() {
                    let mut reply = msg.reply_template(Op::TinyLearn);
                    reply.value_kind = ValueKind::NoOp;
                    if write_reply(&engine, &mut stream, reply).await.is_err() {
                        break;
                    }
                    continue;
                }
            }
        }

        // Reject anything that could change the outcome of an instance
        // already evicted from the cache.
        let admissible =
            harmless(&msg) || engine.cache.borrow().is_cached(msg.synode) || !behind;
        if admissible {
            if should_poll_cache(msg.op) {
                let machine = crate::proposer::wait_for_cache(
                    &engine,
                    &env,
                    msg.synode,
                    Duration::from_secs(10),
                )
                .await;
                if machine.is_none() {
                    continue;
                }
            }
            dispatch(&engine, &env, &msg, &mut reply_queue);
            for reply in reply_queue.drain(..) {
                if write_reply(&engine, &mut stream, reply).await.is_err() {
                    return;
                }
            }
        } else if engine.cache.borrow().was_removed(msg.synode) {
            // The machine is long gone; tell the laggard so it can give
            // up or fast-skip.
            let reply = msg.reply_template(Op::Die);
            if write_reply(&engine, &mut stream, reply).await.is_err() {
                break;
            }
        }
    }
    debug!("inbound connection closed");
}

async fn write_reply<S>(
    engine: &Rc<Engine>,
    stream: &mut S,
    mut reply: PaxMsg,
) -> Result<(), wire::WireError>
where
    S: AsyncWrite + Unpin,
{
    if let Some(site) = engine.site() {
        if let Some(nodeno) = site.nodeno {
            reply.from = nodeno;
        }
    }
    reply.delivered = engine.delivered.get();
    reply.max_synode = engine.max_synode.get();
    wire::write_msg(stream, &reply).await
}
