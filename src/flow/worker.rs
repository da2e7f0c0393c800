//! Per-flow worker task
//!
//! One worker per tracked flow. It dials the relay, binds a local UDP
//! endpoint for the datagram exchange, spawns a reader task that feeds a
//! channel, then loops over the flow's event sources with a fresh idle
//! timer each iteration:
//!
//! | event                         | action                                   |
//! |-------------------------------|------------------------------------------|
//! | relay reader channel closed   | tear down and exit                       |
//! | datagram from relay           | synthesize response → TUN; DNS flows also |
//! |                               | populate the cache, then exit (one-shot) |
//! | packet from TUN queue         | write payload to relay; exit on error    |
//! | termination signal fired      | tear down and exit (peer-quit skips the  |
//! |                               | tracker clear: the signaler owns it)     |
//! | idle timer elapsed            | tear down and exit                       |
//!
//! The global stop flag is checked at the top of every iteration and
//! exits without tearing anything down: that path intentionally leaks,
//! the process is going away.
//!
//! Setup failures tear down *before* the reader task exists, so an early
//! `SocksClosed` signal can never race a half-started flow.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::MAX_DATAGRAM;
use crate::error::FlowError;
use crate::flow::ingress::UdpGateway;
use crate::flow::tracker::Flow;
use crate::flow::FlowEnd;
use crate::packet::envelope::Envelope;

/// Queue depth between the relay reader task and the worker loop.
const RELAY_READER_QUEUE: usize = 64;

pub(crate) async fn run(
    gateway: Arc<UdpGateway>,
    flow: Arc<Flow>,
    mut from_tun: mpsc::Receiver<Envelope>,
) {
    let remote = SocketAddr::new(IpAddr::V4(flow.remote_ip()), flow.remote_port());

    // The relay is dialed directly; a connected socket pins down the
    // local interface the datagram endpoint must share.
    let relay_conn = match dial_relay(remote, gateway.config().relay_connect_timeout()).await {
        Ok(socket) => socket,
        Err(err) => {
            warn!(flow = %flow.fingerprint(), %err, "failed to reach relay");
            flow.shutdown().signal(FlowEnd::SocksClosed);
            gateway.tracker().clear(&flow);
            return;
        }
    };

    let relay_io = match timeout(
        gateway.config().relay_setup_deadline(),
        bind_relay_endpoint(&relay_conn),
    )
    .await
    .unwrap_or(Err(FlowError::SetupDeadline))
    {
        Ok(socket) => Arc::new(socket),
        Err(err) => {
            warn!(flow = %flow.fingerprint(), %err, "relay setup failed");
            flow.shutdown().signal(FlowEnd::SocksClosed);
            gateway.tracker().clear(&flow);
            return;
        }
    };

    let (relay_tx, mut relay_rx) = mpsc::channel::<Bytes>(RELAY_READER_QUEUE);
    spawn_relay_reader(
        Arc::clone(&relay_io),
        relay_tx,
        flow.reader_quit().clone(),
    );

    let is_dns = flow.remote_port() == gateway.config().dns_port;

    loop {
        if gateway.is_stopped() {
            return;
        }
        let idle = sleep(gateway.config().idle_timeout());

        tokio::select! {
            received = relay_rx.recv() => match received {
                Some(datagram) => {
                    trace!(flow = %flow.fingerprint(), len = datagram.len(), "relay datagram");
                    forward_to_tun(&gateway, &flow, &datagram).await;
                    if is_dns {
                        if let Some(cache) = gateway.dns_cache() {
                            cache.store(&datagram);
                        }
                        // DNS flows are a single request/response pair.
                        teardown(&gateway, &flow, FlowEnd::SelfQuit);
                        return;
                    }
                }
                None => {
                    teardown(&gateway, &flow, FlowEnd::SelfQuit);
                    return;
                }
            },

            queued = from_tun.recv() => match queued {
                Some(packet) => {
                    let result = relay_io.send_to(packet.udp_payload(), remote).await;
                    drop(packet);
                    if let Err(err) = result {
                        warn!(flow = %flow.fingerprint(), %err, "relay write failed");
                        teardown(&gateway, &flow, FlowEnd::SelfQuit);
                        return;
                    }
                }
                None => {
                    teardown(&gateway, &flow, FlowEnd::SelfQuit);
                    return;
                }
            },

            end = flow.shutdown().signaled() => {
                if end == FlowEnd::PeerQuit {
                    // The signaler owns the tracker entry.
                    flow.reader_quit().cancel();
                } else {
                    teardown(&gateway, &flow, end);
                }
                return;
            },

            () = idle => {
                teardown(&gateway, &flow, FlowEnd::SelfQuit);
                return;
            }
        }
    }
}

/// Tear the flow down: fire the termination signal, clear the tracker
/// entry, stop the reader. The relay sockets close when the worker and
/// reader tasks drop them.
fn teardown(gateway: &UdpGateway, flow: &Arc<Flow>, end: FlowEnd) {
    flow.shutdown().signal(end);
    gateway.tracker().clear(flow);
    flow.reader_quit().cancel();
}

/// Synthesize the response datagram(s) for `payload` and hand them to the
/// TUN writer as one batch, keeping primary and fragments back-to-back.
async fn forward_to_tun(gateway: &UdpGateway, flow: &Flow, payload: &[u8]) {
    match gateway.synthesizer().response(
        flow.local_ip(),
        flow.remote_ip(),
        flow.local_port(),
        flow.remote_port(),
        payload,
    ) {
        Ok((primary, fragments)) => {
            let mut batch = Vec::with_capacity(1 + fragments.len());
            batch.push(primary);
            batch.extend(fragments);
            if gateway.tun_tx().send(batch).await.is_err() {
                debug!(flow = %flow.fingerprint(), "tun writer gone; response dropped");
            }
        }
        Err(err) => {
            warn!(flow = %flow.fingerprint(), %err, "response synthesis failed");
        }
    }
}

async fn dial_relay(remote: SocketAddr, connect_timeout: Duration) -> Result<UdpSocket, FlowError> {
    let socket = UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))
        .await
        .map_err(FlowError::Dial)?;
    timeout(connect_timeout, socket.connect(remote))
        .await
        .map_err(|_| {
            FlowError::Dial(io::Error::new(
                io::ErrorKind::TimedOut,
                "relay connect timed out",
            ))
        })?
        .map_err(FlowError::Dial)?;
    Ok(socket)
}

/// Bind the datagram endpoint on the same interface the connected relay
/// socket routed through.
async fn bind_relay_endpoint(relay_conn: &UdpSocket) -> Result<UdpSocket, FlowError> {
    let local = relay_conn.local_addr().map_err(FlowError::Bind)?;
    UdpSocket::bind((local.ip(), 0)).await.map_err(FlowError::Bind)
}

/// Forward relay datagrams onto a channel until told to quit or the
/// socket dies. Dropping the sender is how the worker learns the relay
/// side is gone.
fn spawn_relay_reader(socket: Arc<UdpSocket>, tx: mpsc::Sender<Bytes>, quit: CancellationToken) {
    tokio::spawn(async move {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            tokio::select! {
                () = quit.cancelled() => return,
                received = socket.recv_from(&mut buf) => match received {
                    Ok((len, _peer)) => {
                        if tx.send(Bytes::copy_from_slice(&buf[..len])).await.is_err() {
                            return;
                        }
                    }
                    Err(_) => return,
                }
            }
        }
    });
}
