//! Connection plumbing: the listener and the outbound peer tasks.
//!
//! One listener task accepts inbound connections and hands each to an
//! [`crate::acceptor::acceptor_learner_task`]. One peer task per remote
//! member keeps the outbound connection alive: connect with backoff,
//! negotiate the protocol, then pump the peer's queue onto the socket
//! while dispatching whatever the peer answers on the same connection.
//!
//! Transient transport errors reconnect forever; protocol mismatches drop
//! the connection and warn at most once per ten minutes per peer.

use std::rc::Rc;
use std::time::Duration;

use conclave_core::{NetworkProvider, Providers, TaskProvider, TcpListenerTrait, TimeProvider};
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tracing::{debug, info, warn};

use crate::acceptor;
use crate::engine::{Engine, Env};
use crate::msg::Op;
use crate::peer::Peer;
use crate::recovery;
use crate::wire;

/// Initial reconnect wait.
const INITIAL_CONNECT_WAIT: Duration = Duration::from_millis(100);
/// Added to the wait after each failed attempt.
const CONNECT_WAIT_INCREASE: Duration = Duration::from_millis(500);
/// Upper bound on the reconnect wait.
const MAX_CONNECT_WAIT: Duration = Duration::from_secs(10);
/// Protocol-mismatch warnings are limited to one per this interval.
const PROTOVERSION_WARNING_INTERVAL: Duration = Duration::from_secs(600);

/// Accept inbound connections for the life of the engine.
pub async fn listener_task<P: Providers>(
    engine: Rc<Engine>,
    env: Rc<Env<P>>,
    listener: <P::Network as NetworkProvider>::TcpListener,
) {
    info!(
        addr = %listener.local_addr().ok().unwrap_or_default(),
        "listening for peers"
    );
    while !engine.shutdown.get() {
        match listener.accept().await {
            Ok((stream, from)) => {
                debug!(from = %from, "inbound connection");
                let e = engine.clone();
                let v = env.clone();
                env.task().spawn_local("acceptor_learner", async move {
                    acceptor::acceptor_learner_task(e, v, stream).await;
                });
            }
            Err(error) => {
                if engine.shutdown.get() {
                    break;
                }
                warn!(error = %error, "accept failed");
                env.time().sleep(Duration::from_millis(100)).await;
            }
        }
    }
    debug!("listener stopped");
}

fn warn_proto_mismatch<P: Providers>(env: &Env<P>, peer: &Peer) {
    let now = env.time().now();
    let warn_due = peer
        .last_proto_warning
        .get()
        .map(|last| now.saturating_sub(last) >= PROTOVERSION_WARNING_INTERVAL)
        .unwrap_or(true);
    if warn_due {
        peer.last_proto_warning.set(Some(now));
        warn!(
            peer = %peer.address,
            "protocol version mismatch; dropping connection"
        );
    }
}

/// Keep the outbound connection to one member alive and pump traffic
/// both ways.
pub async fn peer_task<P: Providers>(engine: Rc<Engine>, env: Rc<Env<P>>, peer: Rc<Peer>) {
    let mut wait = INITIAL_CONNECT_WAIT;
    while !engine.shutdown.get() {
        let addr = peer.address.to_string();
        let mut stream = match env.network().connect(&addr).await {
            Ok(stream) => stream,
            Err(error) => {
                debug!(peer = %addr, error = %error, "connect failed, backing off");
                peer.mark_unreachable();
                env.time().sleep(wait).await;
                wait = (wait + CONNECT_WAIT_INCREASE).min(MAX_CONNECT_WAIT);
                continue;
            }
        };

        match wire::client_handshake(&mut stream).await {
            Ok(proto) => {
                peer.proto.set(proto);
            }
            Err(wire::WireError::UnknownProto) => {
                warn_proto_mismatch(env.as_ref(), &peer);
                peer.mark_unreachable();
                env.time().sleep(MAX_CONNECT_WAIT).await;
                continue;
            }
            Err(error) => {
                debug!(peer = %addr, error = %error, "handshake failed");
                peer.mark_unreachable();
                env.time().sleep(wait).await;
                wait = (wait + CONNECT_WAIT_INCREASE).min(MAX_CONNECT_WAIT);
                continue;
            }
        }

        info!(peer = %addr, proto = %peer.proto.get(), "peer connected");
        peer.connected.set(true);
        peer.unreachable.set(false);
        wait = INITIAL_CONNECT_WAIT;

        let (read_half, write_half) = tokio::io::split(stream);
        tokio::select! {
            _ = pump_outbound(&engine, &peer, write_half) => {}
            _ = pump_replies(&engine, &env, &peer, read_half) => {}
        }

        peer.mark_unreachable();
        debug!(peer = %addr, "peer connection lost");
    }
}

/// Drain the peer's queue onto the socket.
async fn pump_outbound<S>(engine: &Rc<Engine>, peer: &Rc<Peer>, mut write_half: WriteHalf<S>)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite,
{
    while !engine.shutdown.get() {
        let msg = peer.next_outbound().await;
        if wire::write_msg(&mut write_half, &msg).await.is_err() {
            // Put it back at the front so the retry after reconnect
            // keeps the order.
            peer.requeue(msg);
            let _ = write_half.shutdown().await;
            return;
        }
    }
}

/// Dispatch whatever the peer answers on our outbound connection. The
/// responses to our requests come back here, not on the peer's own
/// connection to us.
async fn pump_replies<P: Providers, S>(
    engine: &Rc<Engine>,
    env: &Rc<Env<P>>,
    peer: &Rc<Peer>,
    mut read_half: ReadHalf<S>,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite,
{
    loop {
        if engine.shutdown.get() {
            return;
        }
        let reply = match wire::read_msg(&mut read_half).await {
            Ok(reply) => reply,
            Err(wire::WireError::UnknownOp) => continue,
            Err(_) => {
                // A broken reply channel means the peer itself is likely
                // gone; let the executor skip its slots fast.
                peer.fast_skip_allowed.set(true);
                return;
            }
        };

        if peer.invalid.get() {
            continue;
        }

        // A peer answering "I need a boot" on its reply channel wants a
        // snapshot from us.
        if reply.op == Op::NeedBoot {
            let can_serve = crate::fsm::can_send_snapshot(engine)
                && engine.site().is_some_and(|s| !s.boot_key.is_null());
            if can_serve {
                let site = engine.find_site(reply.synode).or_else(|| engine.site());
                if let Some(site) = site {
                    if recovery::should_handle_need_boot(&site, &reply) {
                        info!(peer = %peer.address, "serving snapshot over reply channel");
                        for msg in recovery::snapshot_replies(engine, &reply) {
                            peer.send(msg);
                        }
                    }
                }
            }
            continue;
        }

        let mut replies = Vec::new();
        acceptor::dispatch(engine, env, &reply, &mut replies);
        for msg in replies {
            peer.send(msg);
        }
    }
}

/// Spawn the peer tasks for every member of the current site that does
/// not have one yet, plus the listener.
pub fn start_network<P: Providers>(
    engine: &Rc<Engine>,
    env: &Rc<Env<P>>,
    listener: <P::Network as NetworkProvider>::TcpListener,
) {
    {
        let e = engine.clone();
        let v = env.clone();
        env.task().spawn_local("listener", async move {
            listener_task(e, v, listener).await;
        });
    }
    if let Some(site) = engine.site() {
        start_peer_tasks(engine, env, &site);
    }
}

/// Spawn a peer task per remote member of a site.
pub fn start_peer_tasks<P: Providers>(
    engine: &Rc<Engine>,
    env: &Rc<Env<P>>,
    site: &crate::site::Site,
) {
    for (idx, _member) in site.nodes.iter().enumerate() {
        if Some(idx as u16) == site.nodeno {
            continue;
        }
        let Some(peer) = site.server(idx as u16) else {
            continue;
        };
        if peer.pump_started.replace(true) {
            continue;
        }
        let e = engine.clone();
        let v = env.clone();
        let p = peer.clone();
        env.task().spawn_local("peer", async move {
            peer_task(e, v, p).await;
        });
    }
}
