//! Snapshot export/import and join-time catch-up.
//!
//! A node that boots without being a bootstrap member knows nothing: it
//! broadcasts `need_boot` and waits. Every booted peer answers with a
//! snapshot — the exported configuration history, the application's own
//! snapshot blob and a log window — and then replays every decided value
//! it still holds in that window as `recover_learn` messages.
//!
//! The recovering node keeps the *best* snapshot seen (ordered by
//! `(boot_key, log_start, log_end)`) and leaves the wait state either when
//! all expected peers have answered or when the snapshot timer expires.

use std::rc::Rc;

use tracing::{info, warn};

use crate::engine::Engine;
use crate::msg::{
    Cargo, ConfigExport, EngineSnapshot, Member, Op, PaxMsg,
};
use crate::site::Site;
use crate::synode::{NULL_SYNODE, Synode};

// =============================================================================
// Export / import
// =============================================================================

/// Export the configuration history, newest first.
pub fn export_config(engine: &Engine) -> Vec<ConfigExport> {
    engine
        .sites
        .borrow()
        .all()
        .iter()
        .map(|site| ConfigExport {
            start: site.start,
            boot_key: site.boot_key,
            nodes: site.nodes.clone(),
            event_horizon: site.event_horizon,
            x_proto: site.x_proto,
        })
        .collect()
}

/// Install an imported configuration history, oldest first so the site
/// history ends up newest-first again.
pub fn import_config(engine: &Engine, configs: &[ConfigExport]) {
    for config in configs.iter().rev() {
        let mut site = Site::new(
            config.nodes.clone(),
            config.event_horizon,
            config.x_proto,
            &engine.self_addr,
        );
        site.start = config.start;
        site.boot_key = config.boot_key;
        engine.install_site(Rc::new(site));
    }
}

/// Produce a snapshot for a recovering peer. `None` when the application
/// refuses (no snapshot available yet).
pub fn create_snapshot(engine: &Engine) -> Option<EngineSnapshot> {
    let (app_snap, app_lsn) = engine.app.app_snapshot();

    let mut log_start = engine.last_config_modification.get();
    if !app_lsn.is_null() && (log_start.is_null() || !app_lsn.after(&log_start)) {
        log_start = app_lsn;
    }
    if log_start.is_null() {
        // Nothing delivered and no config history to anchor on; the log
        // window starts at the beginning.
        log_start = engine.executed.get();
    }

    Some(EngineSnapshot {
        configs: export_config(engine),
        app_snap,
        log_start,
        log_end: engine.max_synode.get(),
    })
}

/// Clamp a snapshot's log_end to cover everything we have seen.
pub fn set_log_end(engine: &Engine, snapshot: &mut EngineSnapshot) {
    if engine.max_synode.get().after(&snapshot.log_end) {
        snapshot.log_end = engine.max_synode.get();
    }
}

/// Whether a new snapshot beats the best one installed so far, by
/// `(boot_key, log_start, log_end)` lexicographic order.
pub fn better_snapshot(engine: &Engine, snapshot: &EngineSnapshot) -> bool {
    let boot_key = snapshot.highest_boot_key();
    let current_boot_key = engine.site().map(|s| s.boot_key).unwrap_or(NULL_SYNODE);
    let recovery = engine.recovery.borrow();

    boot_key.after(&current_boot_key)
        || (boot_key == current_boot_key
            && (snapshot.log_start.after(&recovery.log_start_max)
                || (snapshot.log_start == recovery.log_start_max
                    && snapshot.log_end.after(&recovery.log_end_max))))
}

/// Install a snapshot: import the history, hand the application its blob,
/// and position the cursors at the start of the replayed window.
pub fn install_snapshot(engine: &Engine, mut snapshot: EngineSnapshot) {
    info!(
        log_start = %snapshot.log_start,
        log_end = %snapshot.log_end,
        configs = snapshot.configs.len(),
        "installing snapshot, importing incoming configurations"
    );
    import_config(engine, &snapshot.configs);

    if engine.nodeno().is_none() {
        // Not a member of the imported site: nothing to execute.
        snapshot.log_end = snapshot.log_start;
    }

    engine
        .app
        .handle_app_snapshot(&snapshot.app_snap, snapshot.log_start, snapshot.log_end);
    engine.set_max_synode(snapshot.log_end);

    // Slot widths differ across configurations; step with the site that
    // governs the log start.
    let max_nodes = engine
        .find_site(snapshot.log_start)
        .map(|s| s.max_nodes())
        .unwrap_or(0);
    let resume = snapshot.log_start.incr(max_nodes);
    engine.set_executed(resume);
    engine.delivered.set(resume);

    {
        let mut recovery = engine.recovery.borrow_mut();
        recovery.log_start_max = snapshot.log_start;
        recovery.log_end_max = snapshot.log_end;
    }
    engine
        .last_config_modification
        .set(snapshot.highest_boot_key());

    info!(nodeno = ?engine.nodeno(), "snapshot installed");
}

/// Install a snapshot if it beats the current best. Returns whether it
/// was installed.
pub fn update_best_snapshot(engine: &Engine, snapshot: EngineSnapshot) -> bool {
    if engine.site().is_none() || better_snapshot(engine, &snapshot) {
        install_snapshot(engine, snapshot);
        true
    } else {
        false
    }
}

// =============================================================================
// need_boot
// =============================================================================

/// Broadcast `need_boot` to every member of the current site.
pub fn send_need_boot(engine: &Engine) {
    let Some(site) = engine.site() else {
        return;
    };
    let mut msg = PaxMsg::for_op(Op::NeedBoot, site.start);
    msg.payloads.push(crate::msg::AppData::command(
        site.start.group_id,
        Cargo::BootIdentity(Member::new(engine.self_addr, engine.self_uid)),
    ));
    info!("requesting boot snapshot from peers");
    engine.send_to_others(&site, &msg);
}

/// Whether an incoming `need_boot` should be served: the advertised
/// identity (if any) must match a current member exactly — a UID mismatch
/// means the sender is a different incarnation that must be re-added.
pub fn should_handle_need_boot(site: &Site, msg: &PaxMsg) -> bool {
    match msg.first_cargo() {
        Some(Cargo::BootIdentity(member)) => site.has_uid(member),
        Some(_) => false,
        None => true,
    }
}

/// Build the snapshot reply plus the `recover_learn` replay for a
/// recovering node. Returns the messages to send, in order.
pub fn snapshot_replies(engine: &Engine, request: &PaxMsg) -> Vec<PaxMsg> {
    let Some(mut snapshot) = create_snapshot(engine) else {
        warn!("cannot serve snapshot request: no snapshot available");
        return Vec::new();
    };
    set_log_end(engine, &mut snapshot);

    let mut replies = Vec::new();
    let log_start = snapshot.log_start;
    let mut reply = request.reply_template(Op::Snapshot);
    reply.synode = log_start;
    reply.snapshot = Some(Box::new(snapshot));
    replies.push(reply);
    replies.extend(push_log(engine, request, log_start));
    replies
}

/// Replay every decided value in `(log_start, max_synode]` still in cache
/// as `recover_learn`.
pub fn push_log(engine: &Engine, request: &PaxMsg, log_start: Synode) -> Vec<PaxMsg> {
    let mut replies = Vec::new();
    let max = engine.max_synode.get();
    let mut push = log_start;
    while !push.after(&max) {
        let machine = engine.cache.borrow().get_no_touch(push);
        if let Some(machine) = machine {
            let st = machine.state();
            if let Some(learned) = &st.learner.msg {
                let mut replay = request.reply_template(Op::RecoverLearn);
                replay.synode = push;
                replay.proposal = learned.proposal;
                replay.value_kind = learned.value_kind;
                replay.payloads = learned.payloads.clone();
                replies.push(replay);
            }
        }
        let max_nodes = engine
            .find_site(push)
            .map(|s| s.max_nodes())
            .unwrap_or(1)
            .max(1);
        push = push.incr(max_nodes);
    }
    replies
}
