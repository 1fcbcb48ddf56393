//! Liveness tracking and view generation.
//!
//! The detector is deliberately simple: every inbound message timestamps
//! its sender; a member unheard-of for longer than the silence window (or
//! whose connection is aborted) may be dead. The "greatest live" member —
//! the lowest-indexed one not suspected — takes responsibility for
//! proposing no-ops into holes.
//!
//! When the live set changes, the detector proposes a view message through
//! the ordinary Paxos stream, so every member delivers the same view at
//! the same synod.
//!
//! The alive task keeps quiet links warm: it beacons `i_am_alive` when we
//! have not sent anything for a while, and probes suspects with
//! `are_you_alive`.

use std::rc::Rc;
use std::time::Duration;

use conclave_core::{Providers, TimeProvider};
use tracing::{debug, info};

use crate::engine::{Engine, Env};
use crate::msg::{AppData, Cargo, Op, PaxMsg};
use crate::site::Site;
use crate::synode::Synode;

/// Note that a member was heard from.
pub fn note_detected(site: &Site, node: u16, now: Duration) -> bool {
    let mut detected = site.detected.borrow_mut();
    let Some(slot) = detected.get_mut(node as usize) else {
        return false;
    };
    let was_live = *slot + DEFAULT_SILENT > now;
    *slot = now;
    if let Some(peer) = site.server(node) {
        peer.note_active(now);
    }
    was_live
}

/// Record a member's delivered cursor gossip.
pub fn update_delivered(site: &Site, node: u16, delivered: Synode) {
    if let Some(slot) = site.delivered_by.borrow_mut().get_mut(node as usize) {
        if delivered.after(slot) {
            *slot = delivered;
        }
    }
}

/// Default silence window before suspecting a member.
pub const DEFAULT_SILENT: Duration = Duration::from_secs(4);

/// Whether a member may be dead: silent past the window, or its
/// connection is aborted. Never suspects ourselves.
pub fn may_be_dead(site: &Site, node: u16, now: Duration, silence: Duration) -> bool {
    if Some(node) == site.nodeno {
        return false;
    }
    let unreachable = site
        .server(node)
        .map(|p| p.unreachable.get())
        .unwrap_or(false);
    if unreachable {
        return true;
    }
    let detected = site.detected.borrow();
    match detected.get(node as usize) {
        Some(last) => *last + silence < now,
        None => true,
    }
}

/// The lowest-indexed member not suspected dead. Falls back to 0 when
/// everyone is suspect.
pub fn greatest_live_node(site: &Site, now: Duration, silence: Duration) -> u16 {
    for node in 0..site.max_nodes() {
        if !may_be_dead(site, node, now, silence) {
            return node;
        }
    }
    0
}

/// Whether this node is the one responsible for filling holes.
pub fn i_am_the_greatest(site: &Site, now: Duration, silence: Duration) -> bool {
    site.nodeno == Some(greatest_live_node(site, now, silence))
}

/// The current live set as seen from here.
pub fn live_set(site: &Site, now: Duration, silence: Duration) -> Vec<bool> {
    (0..site.max_nodes())
        .map(|node| !may_be_dead(site, node, now, silence))
        .collect()
}

/// Periodic detector sweep: watch for live-set changes and propose a view
/// message when one happens. Woken early when a suspect shows life.
pub async fn detector_task<P: Providers>(engine: Rc<Engine>, env: Rc<Env<P>>, run_gen_val: u64) {
    let interval = Duration::from_millis(500);
    // The last view we proposed. The installed view
    // (`site.global_node_set`) only ever changes when a view message is
    // *delivered*, so every member flips it at the same synod.
    let mut proposed: Vec<bool> = Vec::new();
    while !engine.shutdown.get() && engine.run_gen.get() == run_gen_val {
        let _ = env
            .time()
            .timeout(interval, engine.detector_wait.notified())
            .await;
        if engine.shutdown.get() {
            break;
        }

        let Some(site) = engine.executor_site() else {
            continue;
        };
        if !site.is_member() {
            continue;
        }

        let now = env.time().now();
        let live = live_set(&site, now, engine.cfg.silence_window);
        let installed = site.global_node_set.borrow().clone();
        if live != installed && live != proposed {
            info!(live = ?live, "membership view changed, proposing view message");
            proposed = live.clone();
            engine.submit(AppData::command(
                site.start.group_id,
                Cargo::View(live),
            ));
        }
    }
    debug!("detector task stopped");
}

/// Keep quiet links warm and probe suspects.
pub async fn alive_task<P: Providers>(engine: Rc<Engine>, env: Rc<Env<P>>, run_gen_val: u64) {
    let interval = Duration::from_millis(500);
    let mut last_beacon = Duration::ZERO;
    while !engine.shutdown.get() && engine.run_gen.get() == run_gen_val {
        env.time().sleep(interval).await;
        let Some(site) = engine.executor_site() else {
            continue;
        };
        if !site.is_member() {
            continue;
        }

        let now = env.time().now();
        if now.saturating_sub(last_beacon) >= Duration::from_secs(1) {
            last_beacon = now;
            let mut beacon = PaxMsg::for_op(Op::IAmAlive, engine.executed.get());
            beacon.max_synode = engine.max_synode.get();
            engine.send_to_others(&site, &beacon);
        }

        // Probe members we have not heard from lately.
        for node in 0..site.max_nodes() {
            if Some(node) == site.nodeno {
                continue;
            }
            if may_be_dead(&site, node, now, engine.cfg.silence_window) {
                let probe = PaxMsg::for_op(Op::AreYouAlive, engine.executed.get());
                engine.send_to_node(&site, node, probe);
            }
        }
    }
    debug!("alive task stopped");
}
