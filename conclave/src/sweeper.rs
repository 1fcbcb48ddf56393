//! The sweeper: no-ops for our own unused slots.
//!
//! Ordering means every member's slot at every message number must be
//! decided before delivery can pass it. Slots we own but never used would
//! force peers into full no-op rounds; the sweeper collapses them
//! preemptively with the fast skip path, which is safe because nobody
//! else may propose a non-noop value for our slots.
//!
//! The sweeper only touches completely idle machines: any promise,
//! accepted value, or lock means a round is underway and must be left
//! alone.

use std::rc::Rc;
use std::time::Duration;

use conclave_core::{Providers, TimeProvider};
use tracing::debug;

use crate::acceptor::dispatch_local;
use crate::engine::{Engine, Env};
use crate::msg::{Op, PaxMsg, ValueKind};
use crate::synode::Synode;

/// The first slot at or after the executor cursor that this node owns.
fn sweep_start(engine: &Engine) -> Option<Synode> {
    let executed = engine.executed.get();
    let nodeno = engine.find_site(executed).and_then(|s| s.nodeno)?;
    let mut find = executed;
    find.node = nodeno;
    if find.node < executed.node {
        find = find.incr_msgno();
        find.node = nodeno;
    }
    Some(find)
}

fn next_own_slot(engine: &Engine, synode: Synode) -> Synode {
    let mut next = synode.incr_msgno();
    if let Some(nodeno) = engine.find_site(next).and_then(|s| s.nodeno) {
        next.node = nodeno;
    }
    next
}

/// One sweep from the cursor to `max_synode`: skip every idle slot we
/// own. Returns where the sweep stopped.
fn sweep<P: Providers>(engine: &Rc<Engine>, env: &Rc<Env<P>>, from: Synode) -> Synode {
    let mut find = from;
    let max = engine.max_synode.get();
    while find.before(&max) && !engine.too_far(find) {
        let Some(site) = engine.find_site(find) else {
            break;
        };
        if site.nodeno.is_none() {
            break;
        }

        let machine = engine.cache.borrow_mut().force_get(find);
        let idle = {
            let st = machine.state();
            // Forced machines get full three-phase rounds, never a sweep.
            !st.force_delivery && st.idle()
        };
        if idle {
            machine.state_mut().stage = Op::Skip;
            let mut skip = PaxMsg::for_op(Op::Skip, find);
            skip.value_kind = ValueKind::NoOp;
            skip.from = site.nodeno.unwrap_or(crate::msg::VOID_NODE);
            engine.send_to_others(&site, &skip);
            dispatch_local(engine, env, skip);
        }
        find = next_own_slot(engine, find);
    }
    find
}

/// The sweeper task: sweep, deactivate, wake up on learns or
/// `max_synode` advancement.
pub async fn sweeper_task<P: Providers>(engine: Rc<Engine>, env: Rc<Env<P>>, run_gen_val: u64) {
    debug!("sweeper started");
    while !engine.shutdown.get() && engine.run_gen.get() == run_gen_val {
        let start = match sweep_start(&engine) {
            Some(start) => start,
            None => {
                let _ = env
                    .time()
                    .timeout(Duration::from_secs(1), engine.sweeper_wait.notified())
                    .await;
                continue;
            }
        };
        let mut find = start;
        loop {
            if engine.shutdown.get() || engine.run_gen.get() != run_gen_val {
                return;
            }
            // The group may have changed under us.
            find.group_id = engine.executed.get().group_id;
            if engine.executed.get().after(&find) {
                find = match sweep_start(&engine) {
                    Some(s) => s,
                    None => break,
                };
            }
            let stopped = sweep(&engine, &env, find);
            if stopped == find {
                break;
            }
            find = stopped;
        }

        // Deactivate until something creates new work.
        let _ = env
            .time()
            .timeout(Duration::from_secs(1), engine.sweeper_wait.notified())
            .await;
    }
    debug!("sweeper stopped");
}
