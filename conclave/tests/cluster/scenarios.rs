//! End-to-end cluster scenarios.

use std::rc::Rc;
use std::time::Duration;

use conclave::acceptor;
use conclave::fsm::{self, FsmEvent};
use conclave::msg::{AppData, Cargo, Member, Op, PaxMsg, UniqueId};
use conclave::proposer;
use conclave::synode::Synode;

use crate::harness::{Cluster, GROUP, member_at, run_local};
use crate::invariants;

const LONG: Duration = Duration::from_secs(20);

fn app_payload(bytes: &[u8]) -> AppData {
    AppData::app(bytes.to_vec())
}

fn client_msg(cargo: Cargo) -> PaxMsg {
    let mut msg = PaxMsg::for_op(Op::ClientMsg, Synode::new(GROUP, 0, 0));
    msg.group_id = GROUP;
    let mut data = AppData::command(GROUP, cargo);
    data.app_key = Synode::new(GROUP, 0, 0);
    msg.payloads.push(data);
    msg
}

/// Feed traffic until every member's executor is past the
/// configuration-change guard (message number 2). The cursor only moves
/// while values get decided, so the warm-up keeps proposing.
async fn warm_up(cluster: &Cluster) {
    for tick in 0..60u32 {
        for engine in &cluster.engines[..cluster.members.len()] {
            engine.submit(app_payload(format!("warm-{tick}").as_bytes()));
        }
        let done = cluster
            .run_until(Duration::from_millis(500), || {
                cluster
                    .engines
                    .iter()
                    .take(cluster.members.len())
                    .all(|e| e.executed.get().msgno > 2)
            })
            .await;
        if done {
            return;
        }
    }
    panic!("cluster failed to warm up");
}

/// Scenario: a single proposer on a three-node group, no failures. The
/// value is learned at the proposer's slot and delivered everywhere.
#[tokio::test]
async fn single_value_delivered_everywhere() {
    run_local(async {
        let cluster = Cluster::new(3, 0);
        cluster.boot();

        cluster.engines[0].submit(app_payload(b"A"));

        let done = cluster
            .run_until(LONG, || cluster.all_delivered(&[b"A".as_slice()]))
            .await;
        assert!(done, "all members should deliver A");

        invariants::assert_agreement(&cluster);
        invariants::assert_prefix_order(&cluster);
        invariants::assert_validity(&cluster, &[b"A".as_slice()]);
    })
    .await;
}

/// Scenario: two members propose concurrently. Both values arrive at
/// every member, in the same order everywhere.
#[tokio::test]
async fn concurrent_proposers_agree_on_order() {
    run_local(async {
        let cluster = Cluster::new(3, 0);
        cluster.boot();

        cluster.engines[0].submit(app_payload(b"X"));
        cluster.engines[1].submit(app_payload(b"Y"));

        let done = cluster
            .run_until(LONG, || {
                (0..3).all(|i| {
                    let delivered = cluster.apps[i].delivered.borrow();
                    delivered.iter().any(|v| v == b"X")
                        && delivered.iter().any(|v| v == b"Y")
                })
            })
            .await;
        assert!(done, "both values should reach every member");

        // With only two values in play, every member's sequence is the
        // same two-element order.
        let reference = cluster.apps[0].delivered.borrow().clone();
        for i in 1..3 {
            assert_eq!(
                *cluster.apps[i].delivered.borrow(),
                reference,
                "member {i} delivered a different order"
            );
        }

        invariants::assert_agreement(&cluster);
        invariants::assert_validity(&cluster, &[b"X".as_slice(), b"Y".as_slice()]);
    })
    .await;
}

/// Scenario: the proposer crashes after phase 1+2 reached only one peer.
/// The takeover no-op proposal discovers the accepted value and must
/// re-propose it, so the crashed proposer's value survives.
#[tokio::test]
async fn noop_takeover_preserves_accepted_value() {
    run_local(async {
        let cluster = Cluster::new(3, 0);
        cluster.boot_without_tasks();
        let env = cluster.env.clone();

        let synode = Synode::new(GROUP, 2, 0);

        // Node 0 stages "A" and runs phase 1 against everyone.
        let site0 = cluster.engines[0].site().expect("site");
        let machine0 = cluster.engines[0].cache.borrow_mut().force_get(synode);
        {
            let mut value = PaxMsg::for_op(Op::ClientMsg, synode);
            let mut data = app_payload(b"A");
            data.unique_id = UniqueId {
                group_id: 1,
                synode,
            };
            value.payloads.push(data);
            machine0.state_mut().proposer.msg = Some(Rc::new(value));
        }
        proposer::push_3p(&cluster.engines[0], &env, &machine0, &site0, 0);

        // Node 1 never sees phase 1; node 2 answers it. The ack bounces
        // back to node 0, whose majority (itself + node 2) starts phase 2.
        site0.server(1).expect("peer").drain();
        for prepare in site0.server(2).expect("peer").drain() {
            cluster.deliver(2, 0, prepare);
        }

        // Deliver phase 2 to node 2 only, then crash node 0: "A" is
        // accepted at exactly one surviving member.
        site0.server(1).expect("peer").drain();
        let accepts: Vec<PaxMsg> = site0.server(2).expect("peer").drain();
        assert!(
            accepts.iter().any(|m| m.op == Op::Accept),
            "phase 2 should have started"
        );
        for accept in accepts {
            cluster.deliver(2, 0, accept);
        }
        cluster.kill(0);

        let machine2 = cluster.engines[2]
            .cache
            .borrow_mut()
            .get(synode)
            .expect("machine");
        assert!(machine2.state().accepted(), "node 2 accepted A");

        // Node 1 times out on the slot and proposes a no-op takeover.
        proposer::propose_noop(&cluster.engines[1], &env, synode);
        let done = cluster
            .run_until(LONG, || {
                [1usize, 2].iter().all(|&i| {
                    cluster.engines[i]
                        .cache
                        .borrow_mut()
                        .get(synode)
                        .map(|m| m.state().finished())
                        .unwrap_or(false)
                })
            })
            .await;
        assert!(done, "survivors should decide the slot");

        // The decided value is "A", not the no-op: phase 1 of the
        // takeover adopted the accepted value.
        for i in [1usize, 2] {
            let machine = cluster.engines[i]
                .cache
                .borrow_mut()
                .get(synode)
                .expect("machine");
            let st = machine.state();
            let learned = st.learner.msg.as_ref().expect("learned");
            assert!(!learned.is_noop(), "member {i} must not learn the no-op");
            assert_eq!(
                learned.payloads[0].cargo,
                Cargo::App(b"A".to_vec()),
                "member {i} must learn the original value"
            );
        }
        invariants::assert_agreement(&cluster);
    })
    .await;
}

/// Scenario: reconfigure the event horizon. The new value is learned but
/// only becomes active `H + 1` message numbers after its boot key.
#[tokio::test]
async fn event_horizon_reconfiguration_activates_later() {
    run_local(async {
        let cluster = Cluster::new(3, 0);
        cluster.boot();

        warm_up(&cluster).await;

        let mut replies = Vec::new();
        acceptor::dispatch(
            &cluster.engines[0],
            &cluster.env,
            &client_msg(Cargo::SetEventHorizon(12)),
            &mut replies,
        );
        assert_eq!(
            replies[0].cli_err,
            Some(conclave::ClientReply::Ok),
            "the reconfiguration should be accepted"
        );

        let done = cluster
            .run_until(LONG, || {
                (0..3).all(|i| {
                    cluster.engines[i]
                        .site()
                        .map(|s| s.event_horizon == 12)
                        .unwrap_or(false)
                })
            })
            .await;
        assert!(done, "every member should install the new horizon");

        // Activation is delayed by the old horizon: start = boot_key + 10 + 1.
        let site = cluster.engines[0].site().expect("site");
        assert_eq!(site.start.msgno, site.boot_key.msgno + 11);

        // The query interface reports the newest horizon.
        replies.clear();
        acceptor::dispatch(
            &cluster.engines[0],
            &cluster.env,
            &client_msg(Cargo::GetEventHorizon),
            &mut replies,
        );
        assert_eq!(replies[0].event_horizon, Some(12));
    })
    .await;
}

/// Scenario: add a fourth member. The group learns the addition, the new
/// site activates after the horizon delay, and the joiner recovers from
/// a peer snapshot and then receives new traffic.
#[tokio::test]
async fn added_node_recovers_via_snapshot() {
    run_local(async {
        let cluster = Cluster::new(3, 1);
        cluster.boot();

        cluster.engines[0].submit(app_payload(b"before-join"));
        warm_up(&cluster).await;

        let joiner_member: Member = member_at(3);
        let mut replies = Vec::new();
        acceptor::dispatch(
            &cluster.engines[0],
            &cluster.env,
            &client_msg(Cargo::AddNode(vec![joiner_member.clone()])),
            &mut replies,
        );
        assert_eq!(replies[0].cli_err, Some(conclave::ClientReply::Ok));

        // Wait until the new 4-member site is installed everywhere.
        let installed = cluster
            .run_until(LONG, || {
                (0..3).all(|i| {
                    cluster.engines[i]
                        .site()
                        .map(|s| s.nodes.len() == 4)
                        .unwrap_or(false)
                })
            })
            .await;
        assert!(installed, "the add_node should install a 4-member site");

        // The joiner asks member 0 for a snapshot.
        let joiner = &cluster.engines[3];
        fsm::dispatch(joiner, &cluster.env, FsmEvent::Init);

        let new_start = cluster.engines[0].site().expect("site").start;
        let mut need_boot = PaxMsg::for_op(Op::NeedBoot, new_start);
        need_boot.group_id = GROUP;
        need_boot.from = 3;
        need_boot.payloads.push(AppData::command(
            GROUP,
            Cargo::BootIdentity(joiner_member.clone()),
        ));
        cluster.deliver(0, 3, need_boot);

        let recovered = cluster
            .run_until(LONG, || {
                joiner.fsm_state.get() == conclave::FsmState::Run
            })
            .await;
        assert!(recovered, "the joiner should reach run state");
        assert_eq!(joiner.nodeno(), Some(3));

        // New traffic reaches the joiner.
        cluster.engines[0].submit(app_payload(b"after-join"));
        let caught_up = cluster
            .run_until(LONG, || {
                cluster.apps[3]
                    .delivered
                    .borrow()
                    .iter()
                    .any(|v| v == b"after-join")
            })
            .await;
        assert!(caught_up, "the joiner should deliver post-join traffic");

        invariants::assert_agreement(&cluster);
    })
    .await;
}

/// Scenario: force a two-member configuration while the third member is
/// dead. The forced majority rule counts only the listed members, so the
/// group makes progress without node 2.
#[tokio::test]
async fn force_config_with_dead_member() {
    run_local(async {
        let cluster = Cluster::new(3, 0);
        cluster.boot();

        cluster.engines[0].submit(app_payload(b"pre-force"));
        warm_up(&cluster).await;

        cluster.kill(2);

        // The validation requires the listed members to look alive.
        let site = cluster.engines[0].site().expect("site");
        conclave::detector::note_detected(&site, 1, {
            use conclave_core::TimeProvider;
            cluster.env.time().now()
        });

        let mut replies = Vec::new();
        acceptor::dispatch(
            &cluster.engines[0],
            &cluster.env,
            &client_msg(Cargo::ForceConfig(vec![member_at(0), member_at(1)])),
            &mut replies,
        );
        assert_eq!(
            replies[0].cli_err,
            Some(conclave::ClientReply::Ok),
            "the forced config over live members should validate"
        );

        // The forced configuration is installed on both survivors even
        // though node 2 never answers.
        let done = cluster
            .run_until(LONG, || {
                [0usize, 1].iter().all(|&i| {
                    cluster.engines[i]
                        .site()
                        .map(|s| s.nodes.len() == 2)
                        .unwrap_or(false)
                })
            })
            .await;
        assert!(done, "survivors should install the forced 2-member site");

        // The forcing node saw its config come back as a learned value.
        assert!(!cluster.engines[0].wait_forced.get());

        invariants::assert_agreement(&cluster);
    })
    .await;
}
