//! Reconfiguration: add, remove, horizon changes, and forced configs.
//!
//! A reconfiguration travels like any other client payload: it is decided
//! at some synod (its *boot key*) and the new configuration becomes
//! authoritative only `event_horizon + 1` message numbers later. That
//! delay is exactly the in-flight pipeline bound, so by the time the new
//! site takes effect, every synod decided under the old one has drained.
//! This is Lamport's R-alpha reconfiguration with `alpha = event_horizon`.
//!
//! Validation happens twice, and both checks are needed:
//!
//! 1. when the client submits the command (`can_execute_cfgchange`) —
//!    rejections are cheap and come back as `REQUEST_FAIL`;
//! 2. when the command is *learned* (`handle_config`) — concurrent
//!    reconfigurations may have landed in between, so a command that
//!    validated at submit time can still be a no-op at apply time.

use std::rc::Rc;
use std::time::Duration;

use tracing::{info, warn};

use crate::detector::may_be_dead;
use crate::engine::Engine;
use crate::msg::{AppData, Cargo, ClientReply, Member, PaxMsg};
use crate::site::{EVENT_HORIZON_MAX, EVENT_HORIZON_MIN, Site};
use crate::synode::Synode;

// =============================================================================
// Derived positions
// =============================================================================

/// The start synod of a configuration decided with app key `a.app_key`.
///
/// Bootstrap configs (message number ≤ 1) take effect immediately; any
/// later config is delayed by the event horizon.
pub fn getstart(engine: &Engine, a: &AppData) -> Synode {
    let boot_key = a.app_key;
    if boot_key.msgno == 0 || boot_key.msgno == 1 {
        let mut start = boot_key;
        start.msgno = 1;
        start.node = 0;
        return start;
    }
    engine.add_event_horizon(boot_key)
}

// =============================================================================
// Submit-time validation
// =============================================================================

/// Whether a joiner is incompatible with the group's event horizon: the
/// joiner does not understand horizon reconfiguration while the group's
/// horizon is (or is scheduled to be) non-default.
fn unsafe_against_event_horizon(engine: &Engine, member: &Member) -> bool {
    let Some(latest) = engine.site() else {
        return false;
    };
    let compatible = member.max_proto.reconfigurable_horizon()
        || latest.event_horizon == EVENT_HORIZON_MIN;
    if !compatible {
        info!(
            address = %member.address,
            group_horizon = latest.event_horizon,
            "join rejected: member does not support the group's event horizon"
        );
    }
    !compatible
}

fn add_unsafe_against_event_horizon(engine: &Engine, members: &[Member]) -> bool {
    members
        .iter()
        .any(|m| unsafe_against_event_horizon(engine, m))
}

/// Whether a joiner cannot be reached by IPv4-only members of the group.
fn add_unsafe_against_v4_members(engine: &Engine, members: &[Member]) -> bool {
    let Some(latest) = engine.site() else {
        return false;
    };
    let group_is_v4_only = latest.nodes.iter().all(|m| m.address.is_v4());
    group_is_v4_only && members.iter().any(|m| !m.address.is_v4())
}

fn allow_add_node(engine: &Engine, members: &[Member]) -> bool {
    if add_unsafe_against_event_horizon(engine, members) {
        return false;
    }
    if add_unsafe_against_v4_members(engine, members) {
        warn!("join rejected: group members cannot reach an IPv6-only joiner");
        return false;
    }

    let latest = engine.site();
    let valid = engine.find_site(engine.executed.get());
    for member in members {
        for site in [&latest, &valid].into_iter().flatten() {
            if site.has_uid(member) || site.has_address(member) {
                // An old incarnation is still in the member list; adding a
                // new one at the same identity or address is unsafe until
                // the old one has been removed.
                warn!(
                    address = %member.address,
                    uid = %member.uid,
                    "old incarnation found while trying to add node"
                );
                return false;
            }
        }
    }
    true
}

fn allow_remove_node(engine: &Engine, members: &[Member]) -> bool {
    let Some(site) = engine.site() else {
        return false;
    };
    for member in members {
        if !site.has_uid(member) {
            if site.has_address(member) {
                warn!(
                    address = %member.address,
                    uid = %member.uid,
                    "new incarnation found while trying to remove node"
                );
            } else {
                warn!(
                    address = %member.address,
                    uid = %member.uid,
                    "node has already been removed"
                );
            }
            return false;
        }
    }
    true
}

/// Whether a horizon value is acceptable right now.
fn allow_event_horizon(engine: &Engine, event_horizon: u32) -> bool {
    if !(EVENT_HORIZON_MIN..=EVENT_HORIZON_MAX).contains(&event_horizon) {
        warn!(
            event_horizon,
            min = EVENT_HORIZON_MIN,
            max = EVENT_HORIZON_MAX,
            "event horizon not reconfigured: outside the allowed domain"
        );
        return false;
    }
    match engine.site() {
        Some(site) if !site.x_proto.reconfigurable_horizon() => {
            warn!(
                event_horizon,
                "event horizon not reconfigured: some members do not support it"
            );
            false
        }
        Some(_) => true,
        None => false,
    }
}

fn forced_config_has_dead_nodes(engine: &Engine, members: &[Member], now: Duration) -> bool {
    let Some(site) = engine.site() else {
        return true;
    };
    for member in members {
        let Some(node) = site.find_node(&member.address) else {
            warn!(
                address = %member.address,
                "not in the current configuration; only current members may \
                 appear in a forced configuration list"
            );
            return true;
        };
        if Some(node) == site.nodeno {
            continue;
        }
        if may_be_dead(&site, node, now, engine.cfg.silence_window) {
            warn!(
                address = %member.address,
                "suspected failed; only live members may appear in a forced \
                 configuration list"
            );
            return true;
        }
    }
    false
}

/// Validate a configuration command at submit time.
pub fn can_execute_cfgchange(engine: &Engine, msg: &PaxMsg, now: Duration) -> ClientReply {
    let Some(data) = msg.payloads.first() else {
        return ClientReply::Fail;
    };

    if engine.executed.get().msgno <= 2 {
        // Not booted far enough to change anything. An add_node naming
        // ourselves means a misrouted boot request: fail it outright.
        if let Cargo::AddNode(members) = &data.cargo {
            if members.iter().any(|m| m.address == engine.self_addr) {
                return ClientReply::Fail;
            }
        }
        return ClientReply::Retry;
    }

    if data.group_id != 0 && data.group_id != engine.executed.get().group_id {
        warn!(
            group = data.group_id,
            "configuration change rejected: aimed at another group"
        );
        return ClientReply::Fail;
    }

    let ok = match &data.cargo {
        Cargo::AddNode(members) => {
            !members.iter().any(|m| m.address == engine.self_addr)
                && allow_add_node(engine, members)
        }
        Cargo::RemoveNode(members) => allow_remove_node(engine, members),
        Cargo::SetEventHorizon(h) => allow_event_horizon(engine, *h),
        Cargo::ForceConfig(members) => !forced_config_has_dead_nodes(engine, members, now),
        _ => true,
    };
    if ok { ClientReply::Ok } else { ClientReply::Fail }
}

// =============================================================================
// Apply-time handlers
// =============================================================================

/// Install a brand-new member list (bootstrap or forced replacement).
pub fn install_node_group(engine: &Engine, a: &AppData, members: &[Member]) -> Rc<Site> {
    let proto = members
        .iter()
        .map(|m| m.max_proto)
        .min()
        .unwrap_or(crate::msg::ProtoVersion::CURRENT);
    let mut site = Site::new(
        members.to_vec(),
        engine
            .site()
            .map(|s| s.event_horizon)
            .unwrap_or(EVENT_HORIZON_MIN),
        proto,
        &engine.self_addr,
    );
    site.start = getstart(engine, a);
    site.boot_key = a.app_key;
    let site = Rc::new(site);
    engine.install_site(site.clone());
    site
}

/// Apply a learned `add_node`. Returns `None` when a concurrent
/// reconfiguration made the addition unsafe, in which case no new
/// configuration is installed.
pub fn handle_add_node(engine: &Engine, a: &AppData, members: &[Member]) -> Option<Rc<Site>> {
    if add_unsafe_against_event_horizon(engine, members) {
        return None;
    }
    let current = engine.site()?;
    for member in members {
        info!(address = %member.address, "adding node to the configuration");
    }
    let mut nodes = current.nodes.clone();
    nodes.extend(members.iter().cloned());
    // Member list changed: re-resolve our own index and the group protocol.
    let proto = nodes
        .iter()
        .map(|m| m.max_proto)
        .min()
        .unwrap_or(current.x_proto);
    let mut site = Site::new(nodes, current.event_horizon, proto, &engine.self_addr);
    site.start = getstart(engine, a);
    site.boot_key = a.app_key;
    let site = Rc::new(site);
    engine.install_site(site.clone());
    Some(site)
}

/// Apply a learned `remove_node`.
pub fn handle_remove_node(engine: &Engine, a: &AppData, members: &[Member]) -> Option<Rc<Site>> {
    let current = engine.site()?;
    let remaining: Vec<Member> = current
        .nodes
        .iter()
        .filter(|m| {
            !members
                .iter()
                .any(|r| r.uid == m.uid || r.address == m.address)
        })
        .cloned()
        .collect();
    info!(
        removed = current.nodes.len() - remaining.len(),
        remaining = remaining.len(),
        "removing nodes from the configuration"
    );
    let mut site = Site::new(
        remaining,
        current.event_horizon,
        current.x_proto,
        &engine.self_addr,
    );
    site.start = getstart(engine, a);
    site.boot_key = a.app_key;
    let site = Rc::new(site);
    engine.install_site(site.clone());
    Some(site)
}

/// Apply a learned `set_event_horizon`. May fail if an incompatible node
/// joined since the command was submitted.
pub fn handle_event_horizon(engine: &Engine, a: &AppData, event_horizon: u32) -> bool {
    if !allow_event_horizon(engine, event_horizon) {
        return false;
    }
    let Some(current) = engine.site() else {
        return false;
    };
    let mut site = current.clone_for_reconfig(&engine.self_addr);
    site.event_horizon = event_horizon;
    site.start = getstart(engine, a);
    site.boot_key = a.app_key;
    engine.install_site(Rc::new(site));
    info!(event_horizon, "event horizon reconfigured");
    true
}

/// Apply a learned configuration command. `forced` marks commands that
/// arrived with force-delivery; protocols past the cutover ignore forced
/// configs that are not the awaited one.
pub fn handle_config(engine: &Engine, a: &AppData, forced: bool) -> bool {
    if forced {
        let ignores = engine
            .executor_site()
            .map(|s| s.x_proto.ignores_intermediate_forced())
            .unwrap_or(false);
        if ignores && !engine.wait_forced.get() {
            info!("ignoring intermediate forced configuration");
            return false;
        }
    }
    match &a.cargo {
        Cargo::UnifiedBoot(members) | Cargo::ForceConfig(members) => {
            install_node_group(engine, a, members);
            true
        }
        Cargo::AddNode(members) => handle_add_node(engine, a, members).is_some(),
        Cargo::RemoveNode(members) => handle_remove_node(engine, a, members).is_some(),
        Cargo::SetEventHorizon(h) => handle_event_horizon(engine, a, *h),
        _ => false,
    }
}

// =============================================================================
// Forcing
// =============================================================================

/// Mark every machine in `[start, end]` as force-delivery so the pipeline
/// drains even without the old majority.
pub fn force_interval(engine: &Engine, start: Synode, end: Synode, enforcer: bool) {
    let mut find = start;
    let mut enforcer = enforcer;
    while !find.after(&end) {
        let Some(site) = engine.find_site(find) else {
            break;
        };
        if !site.is_member() {
            break;
        }
        let machine = engine.cache.borrow_mut().force_get(find);
        {
            let mut st = machine.state_mut();
            // The forcing node calls this twice: once when the forced
            // config is installed locally and again when it arrives as a
            // learned message. Instances already marked stay enforcers.
            if st.enforcer {
                enforcer = true;
            }
            st.force(enforcer);
            st.proposer.prep_nodeset.clear();
            st.proposer.prop_nodeset.clear();
        }
        machine.wakeup();
        find = find.incr(site.max_nodes());
    }
}

/// Install a forced configuration and force everything in the pipeline.
pub fn start_force_config(engine: &Engine, site: Rc<Site>, enforcer: bool) {
    let end = engine.add_event_horizon(site.boot_key);
    if end.after(&engine.max_synode.get()) {
        engine.set_max_synode(end);
    }
    engine.wait_forced.set(false);
    *engine.forced.borrow_mut() = Some(site);
    force_interval(engine, engine.executed.get(), engine.max_synode.get(), enforcer);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::NullApplication;
    use crate::config::EngineConfig;
    use crate::msg::{Op, ProtoVersion};
    use crate::synode::NULL_SYNODE;
    use conclave_core::{NetworkAddress, NodeUid};
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

    fn member(port: u16) -> Member {
        Member::new(
            NetworkAddress::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), port),
            NodeUid::new(1, port as u64),
        )
    }

    fn booted_engine() -> Rc<Engine> {
        let members = vec![member(1), member(2), member(3)];
        let engine = Engine::new(
            EngineConfig::for_tests(),
            members[0].address,
            members[0].uid,
            0xCAFE,
            Rc::new(NullApplication),
        );
        let mut boot = AppData::command(7, Cargo::UnifiedBoot(members.clone()));
        boot.app_key = Synode::new(7, 1, 0);
        install_node_group(&engine, &boot, &members);
        engine.set_executed(Synode::new(7, 5, 0));
        engine.delivered.set(Synode::new(7, 5, 0));
        engine
    }

    fn cfg_msg(cargo: Cargo) -> PaxMsg {
        let mut msg = PaxMsg::for_op(Op::ClientMsg, NULL_SYNODE);
        let mut data = AppData::command(7, cargo);
        data.app_key = Synode::new(7, 5, 0);
        msg.payloads.push(data);
        msg
    }

    fn now() -> Duration {
        Duration::from_secs(1)
    }

    #[test]
    fn test_getstart_delays_by_horizon() {
        let engine = booted_engine();
        let mut a = AppData::command(7, Cargo::SetEventHorizon(11));
        a.app_key = Synode::new(7, 9, 1);
        // start = 9 + 10 + 1 = 20
        assert_eq!(getstart(&engine, &a), Synode::new(7, 20, 0));
    }

    #[test]
    fn test_getstart_bootstrap_is_immediate() {
        let engine = booted_engine();
        let mut a = AppData::command(7, Cargo::UnifiedBoot(vec![member(1)]));
        a.app_key = Synode::new(7, 1, 0);
        assert_eq!(getstart(&engine, &a), Synode::new(7, 1, 0));
    }

    #[test]
    fn test_add_node_accepted() {
        let engine = booted_engine();
        let msg = cfg_msg(Cargo::AddNode(vec![member(4)]));
        assert_eq!(can_execute_cfgchange(&engine, &msg, now()), ClientReply::Ok);
    }

    #[test]
    fn test_add_node_rejects_self_add() {
        let engine = booted_engine();
        let msg = cfg_msg(Cargo::AddNode(vec![member(1)]));
        assert_eq!(can_execute_cfgchange(&engine, &msg, now()), ClientReply::Fail);
    }

    #[test]
    fn test_add_node_rejects_existing_address() {
        let engine = booted_engine();
        // Same address as member 2, different UID: an old incarnation.
        let mut incarnation = member(2);
        incarnation.uid = NodeUid::new(9, 9);
        let msg = cfg_msg(Cargo::AddNode(vec![incarnation]));
        assert_eq!(can_execute_cfgchange(&engine, &msg, now()), ClientReply::Fail);
    }

    #[test]
    fn test_add_node_rejects_horizon_incompatible_joiner() {
        let engine = booted_engine();
        // Raise the horizon above the default first.
        let mut a = AppData::command(7, Cargo::SetEventHorizon(20));
        a.app_key = Synode::new(7, 5, 0);
        assert!(handle_event_horizon(&engine, &a, 20));

        let mut old = member(4);
        old.max_proto = ProtoVersion::BASE;
        let msg = cfg_msg(Cargo::AddNode(vec![old]));
        assert_eq!(can_execute_cfgchange(&engine, &msg, now()), ClientReply::Fail);
    }

    #[test]
    fn test_add_node_rejects_v6_joiner_in_v4_group() {
        let engine = booted_engine();
        let v6 = Member::new(
            NetworkAddress::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 9),
            NodeUid::new(9, 9),
        );
        let msg = cfg_msg(Cargo::AddNode(vec![v6]));
        assert_eq!(can_execute_cfgchange(&engine, &msg, now()), ClientReply::Fail);
    }

    #[test]
    fn test_retry_before_boot() {
        let members = vec![member(1), member(2)];
        let engine = Engine::new(
            EngineConfig::for_tests(),
            members[0].address,
            members[0].uid,
            1,
            Rc::new(NullApplication),
        );
        let msg = cfg_msg(Cargo::AddNode(vec![member(4)]));
        assert_eq!(can_execute_cfgchange(&engine, &msg, now()), ClientReply::Retry);
    }

    #[test]
    fn test_remove_node_distinguishes_reasons() {
        let engine = booted_engine();

        // Unknown node entirely: already removed.
        let msg = cfg_msg(Cargo::RemoveNode(vec![member(9)]));
        assert_eq!(can_execute_cfgchange(&engine, &msg, now()), ClientReply::Fail);

        // Same address, different UID: a new incarnation.
        let mut incarnation = member(2);
        incarnation.uid = NodeUid::new(9, 9);
        let msg = cfg_msg(Cargo::RemoveNode(vec![incarnation]));
        assert_eq!(can_execute_cfgchange(&engine, &msg, now()), ClientReply::Fail);

        // The real member: allowed.
        let msg = cfg_msg(Cargo::RemoveNode(vec![member(2)]));
        assert_eq!(can_execute_cfgchange(&engine, &msg, now()), ClientReply::Ok);
    }

    #[test]
    fn test_event_horizon_domain() {
        let engine = booted_engine();
        let msg = cfg_msg(Cargo::SetEventHorizon(5));
        assert_eq!(can_execute_cfgchange(&engine, &msg, now()), ClientReply::Fail);

        let msg = cfg_msg(Cargo::SetEventHorizon(201));
        assert_eq!(can_execute_cfgchange(&engine, &msg, now()), ClientReply::Fail);

        let msg = cfg_msg(Cargo::SetEventHorizon(50));
        assert_eq!(can_execute_cfgchange(&engine, &msg, now()), ClientReply::Ok);
    }

    #[test]
    fn test_force_config_rejects_dead_and_foreign_nodes() {
        let engine = booted_engine();
        // Nobody has been heard from: node 2 and 3 are suspect.
        let msg = cfg_msg(Cargo::ForceConfig(vec![member(1), member(2)]));
        assert_eq!(can_execute_cfgchange(&engine, &msg, now()), ClientReply::Fail);

        // A node outside the config is always rejected.
        let msg = cfg_msg(Cargo::ForceConfig(vec![member(1), member(9)]));
        assert_eq!(can_execute_cfgchange(&engine, &msg, now()), ClientReply::Fail);

        // With node 2 freshly detected, {1, 2} is fine.
        let site = engine.site().expect("site");
        crate::detector::note_detected(&site, 1, now());
        let msg = cfg_msg(Cargo::ForceConfig(vec![member(1), member(2)]));
        assert_eq!(can_execute_cfgchange(&engine, &msg, now()), ClientReply::Ok);
    }

    #[test]
    fn test_handle_add_node_installs_delayed_site() {
        let engine = booted_engine();
        let mut a = AppData::command(7, Cargo::AddNode(vec![member(4)]));
        a.app_key = Synode::new(7, 5, 0);

        let site = handle_add_node(&engine, &a, &[member(4)]).expect("installed");
        assert_eq!(site.nodes.len(), 4);
        // Active at boot_key + H + 1 = 5 + 10 + 1 = 16.
        assert_eq!(site.start, Synode::new(7, 16, 0));
        assert_eq!(engine.site().expect("latest").start, site.start);
    }

    #[test]
    fn test_handle_remove_node_drops_member() {
        let engine = booted_engine();
        let mut a = AppData::command(7, Cargo::RemoveNode(vec![member(3)]));
        a.app_key = Synode::new(7, 5, 0);

        let site = handle_remove_node(&engine, &a, &[member(3)]).expect("installed");
        assert_eq!(site.nodes.len(), 2);
        assert!(!site.has_address(&member(3)));
    }

    #[test]
    fn test_force_interval_marks_machines() {
        let engine = booted_engine();
        engine.set_max_synode(Synode::new(7, 7, 0));
        force_interval(
            &engine,
            Synode::new(7, 5, 0),
            Synode::new(7, 6, 0),
            true,
        );

        let machine = engine
            .cache
            .borrow_mut()
            .get(Synode::new(7, 5, 0))
            .expect("machine");
        let st = machine.state();
        assert!(st.force_delivery);
        assert!(st.enforcer);
        assert!(st.proposer.bal.cnt > 0);
    }

    #[test]
    fn test_start_force_config_sets_waiting_state() {
        let engine = booted_engine();
        let members = vec![member(1), member(2)];
        let mut a = AppData::command(7, Cargo::ForceConfig(members.clone()));
        a.app_key = engine.executed.get();
        let mut forced = Site::new(
            members,
            EVENT_HORIZON_MIN,
            ProtoVersion::CURRENT,
            &engine.self_addr,
        );
        forced.boot_key = engine.executed.get();
        forced.start = getstart(&engine, &a);

        start_force_config(&engine, Rc::new(forced), true);
        assert!(engine.forced.borrow().is_some());
        // end = boot_key(5) + H(10) + 1 = 16
        assert_eq!(engine.max_synode.get(), Synode::new(7, 16, 0));
    }
}
