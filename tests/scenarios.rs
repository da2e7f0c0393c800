//! End-to-end scenarios for the UDP forwarding path.
//!
//! These tests run the gateway against real loopback UDP sockets standing
//! in for the relay side. The DNS port is remapped to an ephemeral port
//! so no privileged binds are needed; classification only compares
//! against the configured port.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use hickory_proto::op::{Message, MessageType, Query, ResponseCode};
use hickory_proto::rr::{DNSClass, Name, RData, Record, RecordType};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};

use tungate::config::GatewayConfig;
use tungate::packet::ipv4::{Ipv4Header, IPPROTO_UDP};
use tungate::packet::udp::UdpHeader;
use tungate::tun::tun_channel;
use tungate::UdpGateway;

const APP_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
const APP_PORT: u16 = 40123;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

// ============================================================================
// Helpers
// ============================================================================

/// Build a raw IPv4/UDP wire image the way an application's datagram
/// would appear coming off the TUN device.
fn craft_udp_wire(
    src: Ipv4Addr,
    sport: u16,
    dst: Ipv4Addr,
    dport: u16,
    payload: &[u8],
) -> Vec<u8> {
    let ip = Ipv4Header {
        id: 0x4242,
        src,
        dst,
        ..Ipv4Header::default()
    };
    let udp = UdpHeader {
        src_port: sport,
        dst_port: dport,
    };

    let mut wire = vec![0u8; 28 + payload.len()];
    let mut pseudo = [0u8; 12];
    ip.write_pseudo_header(&mut pseudo, IPPROTO_UDP, 8 + payload.len())
        .unwrap();
    wire[28..].copy_from_slice(payload);
    {
        let (udp_hdr, _) = wire[20..].split_at_mut(8);
        udp.serialize(udp_hdr, &pseudo, payload).unwrap();
    }
    ip.serialize(&mut wire[..20], 8 + payload.len()).unwrap();
    wire
}

fn parse_headers(wire: &[u8]) -> (Ipv4Header, UdpHeader, Vec<u8>) {
    let (ip, ip_payload) = Ipv4Header::parse(wire).unwrap();
    let (udp, body) = UdpHeader::parse(&wire[ip_payload.clone()]).unwrap();
    let payload = wire[ip_payload][body].to_vec();
    (ip, udp, payload)
}

fn build_dns_query(id: u16, domain: &str) -> Vec<u8> {
    let mut message = Message::new();
    message.set_id(id);
    message.add_query(Query::query(Name::from_ascii(domain).unwrap(), RecordType::A));
    message.to_vec().unwrap()
}

fn answer_query(request: &[u8], ttl: u32) -> Option<Vec<u8>> {
    let request = Message::from_vec(request).ok()?;
    let question = request.queries().first()?.clone();

    let mut response = Message::new();
    response.set_id(request.id());
    response.set_message_type(MessageType::Response);
    response.set_response_code(ResponseCode::NoError);
    response.add_query(question.clone());

    let mut record = Record::new();
    record.set_name(question.name().clone());
    record.set_record_type(RecordType::A);
    record.set_dns_class(DNSClass::IN);
    record.set_ttl(ttl);
    record.set_data(Some(RData::A(hickory_proto::rr::rdata::A(Ipv4Addr::new(
        93, 184, 216, 34,
    )))));
    response.add_answer(record);
    response.to_vec().ok()
}

/// A loopback resolver: answers every query with a single A record.
async fn spawn_dns_server(ttl: u32) -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 2048];
        loop {
            let Ok((len, peer)) = socket.recv_from(&mut buf).await else {
                return;
            };
            if let Some(response) = answer_query(&buf[..len], ttl) {
                let _ = socket.send_to(&response, peer).await;
            }
        }
    });
    addr
}

/// A loopback sink: records every datagram it receives, never responds.
async fn spawn_recording_server() -> (SocketAddr, mpsc::UnboundedReceiver<Vec<u8>>) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut buf = [0u8; 2048];
        loop {
            let Ok((len, _)) = socket.recv_from(&mut buf).await else {
                return;
            };
            if tx.send(buf[..len].to_vec()).is_err() {
                return;
            }
        }
    });
    (addr, rx)
}

async fn wait_until(mut condition: impl FnMut() -> bool, within: Duration) -> bool {
    let deadline = Instant::now() + within;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(20)).await;
    }
    condition()
}

fn config_with_dns_port(port: u16) -> GatewayConfig {
    GatewayConfig {
        dns_port: port,
        ..GatewayConfig::default()
    }
}

// ============================================================================
// Scenarios
// ============================================================================

/// A DNS query misses the cache and rides a relay flow; the response is
/// synthesized back and cached. A repeat query within TTL is answered
/// straight from the cache, with the new querier's transaction id and
/// without creating a flow.
#[tokio::test]
async fn dns_cache_miss_then_hit() {
    init_tracing();
    let server = spawn_dns_server(300).await;
    let (tun_tx, mut tun_rx) = tun_channel(32);
    let gateway = UdpGateway::new(config_with_dns_port(server.port()), tun_tx);

    // First query: miss, forwarded over a fresh flow.
    let wire = craft_udp_wire(
        APP_IP,
        APP_PORT,
        Ipv4Addr::new(127, 0, 0, 1),
        server.port(),
        &build_dns_query(0x1111, "example.com."),
    );
    let (ip, udp, payload) = parse_headers(&wire);
    gateway.handle_udp(&wire, &ip, &udp, &payload).await;

    let batch = timeout(Duration::from_secs(3), tun_rx.recv())
        .await
        .expect("response before timeout")
        .expect("tun channel open");
    assert_eq!(batch.len(), 1);
    let (rip, rudp, rpayload) = parse_headers(batch[0].wire());
    assert_eq!(rip.src, Ipv4Addr::new(127, 0, 0, 1));
    assert_eq!(rip.dst, APP_IP);
    assert_eq!(rudp.src_port, server.port());
    assert_eq!(rudp.dst_port, APP_PORT);
    let answer = Message::from_vec(&rpayload).unwrap();
    assert_eq!(answer.id(), 0x1111);
    assert_eq!(answer.answers().len(), 1);

    // DNS flows are one-shot: the flow is gone once the answer arrived.
    let tracker = gateway.tracker();
    assert!(wait_until(|| tracker.live_count() == 0, Duration::from_secs(2)).await);
    assert_eq!(gateway.tracker().stats().created(), 1);
    assert_eq!(gateway.dns_cache().unwrap().len(), 1);

    // Second query, new transaction id: served from the cache.
    let wire = craft_udp_wire(
        APP_IP,
        APP_PORT,
        Ipv4Addr::new(127, 0, 0, 1),
        server.port(),
        &build_dns_query(0x2222, "example.com."),
    );
    let (ip, udp, payload) = parse_headers(&wire);
    gateway.handle_udp(&wire, &ip, &udp, &payload).await;

    let batch = timeout(Duration::from_secs(2), tun_rx.recv())
        .await
        .expect("cached response before timeout")
        .expect("tun channel open");
    let (_, _, rpayload) = parse_headers(batch[0].wire());
    let answer = Message::from_vec(&rpayload).unwrap();
    assert_eq!(answer.id(), 0x2222, "hit carries the querier's id");

    // No new flow for the hit.
    assert_eq!(gateway.tracker().stats().created(), 1);
    assert_eq!(gateway.dns_cache().unwrap().stats().hits(), 1);
}

/// Non-DNS UDP is dropped at ingress: no flow, no TUN writes.
#[tokio::test]
async fn non_dns_udp_is_dropped() {
    init_tracing();
    let (tun_tx, mut tun_rx) = tun_channel(8);
    let gateway = UdpGateway::new(GatewayConfig::default(), tun_tx);

    let wire = craft_udp_wire(
        APP_IP,
        APP_PORT,
        Ipv4Addr::new(8, 8, 8, 8),
        1234,
        b"not dns",
    );
    let (ip, udp, payload) = parse_headers(&wire);
    gateway.handle_udp(&wire, &ip, &udp, &payload).await;

    sleep(Duration::from_millis(100)).await;
    assert_eq!(gateway.tracker().live_count(), 0);
    assert_eq!(gateway.tracker().stats().created(), 0);
    assert!(tun_rx.try_recv().is_err(), "nothing written to tun");
}

/// A query to an unresponsive relay is torn down by the idle timer and
/// its tracker entry cleared.
#[tokio::test]
async fn idle_timeout_tears_down_flow() {
    init_tracing();
    let (server, mut received) = spawn_recording_server().await;
    let (tun_tx, mut tun_rx) = tun_channel(8);
    let gateway = UdpGateway::new(config_with_dns_port(server.port()), tun_tx);

    let query = build_dns_query(7, "slow.example.");
    let wire = craft_udp_wire(
        APP_IP,
        APP_PORT,
        Ipv4Addr::new(127, 0, 0, 1),
        server.port(),
        &query,
    );
    let (ip, udp, payload) = parse_headers(&wire);
    gateway.handle_udp(&wire, &ip, &udp, &payload).await;

    // The payload reached the relay side...
    let forwarded = timeout(Duration::from_secs(2), received.recv())
        .await
        .expect("payload forwarded")
        .unwrap();
    assert_eq!(forwarded, query);

    // ...but with no response, the idle timer (1s) destroys the flow.
    let tracker = gateway.tracker();
    assert!(wait_until(|| tracker.live_count() == 0, Duration::from_secs(3)).await);
    assert!(tun_rx.try_recv().is_err());
}

/// After a flow dies, a new packet with the same fingerprint creates a
/// fresh flow record and worker.
#[tokio::test]
async fn flow_is_recreated_after_destruction() {
    init_tracing();
    let (server, mut received) = spawn_recording_server().await;
    let (tun_tx, _tun_rx) = tun_channel(8);
    let gateway = UdpGateway::new(config_with_dns_port(server.port()), tun_tx);

    let wire = craft_udp_wire(
        APP_IP,
        APP_PORT,
        Ipv4Addr::new(127, 0, 0, 1),
        server.port(),
        &build_dns_query(1, "first.example."),
    );
    let (ip, udp, payload) = parse_headers(&wire);
    gateway.handle_udp(&wire, &ip, &udp, &payload).await;
    let _ = timeout(Duration::from_secs(2), received.recv())
        .await
        .expect("first forwarded");

    let tracker = gateway.tracker();
    assert!(wait_until(|| tracker.live_count() == 0, Duration::from_secs(3)).await);
    assert_eq!(gateway.tracker().stats().created(), 1);

    // Same 4-tuple again: a brand-new flow.
    let wire = craft_udp_wire(
        APP_IP,
        APP_PORT,
        Ipv4Addr::new(127, 0, 0, 1),
        server.port(),
        &build_dns_query(2, "second.example."),
    );
    let (ip, udp, payload) = parse_headers(&wire);
    gateway.handle_udp(&wire, &ip, &udp, &payload).await;

    let _ = timeout(Duration::from_secs(2), received.recv())
        .await
        .expect("second forwarded");
    assert_eq!(gateway.tracker().stats().created(), 2);
}

/// Two datagrams with the same fingerprint arriving back-to-back share
/// one worker and are delivered to the relay in arrival order.
#[tokio::test]
async fn same_flow_packets_share_one_worker_in_order() {
    init_tracing();
    let (server, mut received) = spawn_recording_server().await;
    let (tun_tx, _tun_rx) = tun_channel(8);
    let gateway = UdpGateway::new(config_with_dns_port(server.port()), tun_tx);

    let first = build_dns_query(1, "one.example.");
    let second = build_dns_query(2, "two.example.");
    for query in [&first, &second] {
        let wire = craft_udp_wire(
            APP_IP,
            APP_PORT,
            Ipv4Addr::new(127, 0, 0, 1),
            server.port(),
            query,
        );
        let (ip, udp, payload) = parse_headers(&wire);
        gateway.handle_udp(&wire, &ip, &udp, &payload).await;
    }

    let got_first = timeout(Duration::from_secs(2), received.recv())
        .await
        .expect("first delivered")
        .unwrap();
    let got_second = timeout(Duration::from_secs(2), received.recv())
        .await
        .expect("second delivered")
        .unwrap();
    assert_eq!(got_first, first);
    assert_eq!(got_second, second);
    assert_eq!(gateway.tracker().stats().created(), 1, "exactly one worker");
}

/// Stopping the gateway signals every tracked flow and drains the table;
/// the signaled workers do not race the tracker for cleanup.
#[tokio::test]
async fn stop_drains_tracked_flows() {
    init_tracing();
    let (server, mut received) = spawn_recording_server().await;
    let (tun_tx, _tun_rx) = tun_channel(8);
    let gateway = UdpGateway::new(config_with_dns_port(server.port()), tun_tx);

    let wire = craft_udp_wire(
        APP_IP,
        APP_PORT,
        Ipv4Addr::new(127, 0, 0, 1),
        server.port(),
        &build_dns_query(1, "stop.example."),
    );
    let (ip, udp, payload) = parse_headers(&wire);
    gateway.handle_udp(&wire, &ip, &udp, &payload).await;
    let _ = timeout(Duration::from_secs(2), received.recv())
        .await
        .expect("forwarded before stop");
    assert_eq!(gateway.tracker().live_count(), 1);

    gateway.stop();
    assert!(gateway.is_stopped());
    assert_eq!(gateway.tracker().live_count(), 0);

    // New ingress against a stopped gateway still must not panic.
    let (ip, udp, payload) = parse_headers(&wire);
    gateway.handle_udp(&wire, &ip, &udp, &payload).await;
}

/// An oversized DNS answer comes back as a full-MTU primary plus
/// fragments, enqueued as one contiguous batch.
#[tokio::test]
async fn large_relay_response_is_fragmented() {
    init_tracing();
    // A "resolver" that answers any datagram with a 3000-byte blob.
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let server = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 2048];
        loop {
            let Ok((_, peer)) = socket.recv_from(&mut buf).await else {
                return;
            };
            let blob: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
            let _ = socket.send_to(&blob, peer).await;
        }
    });

    let mut config = config_with_dns_port(server.port());
    // The blob is not a DNS message; keep the cache out of the way.
    config.dns_cache_enabled = false;
    let (tun_tx, mut tun_rx) = tun_channel(8);
    let gateway = UdpGateway::new(config, tun_tx);

    let wire = craft_udp_wire(
        APP_IP,
        APP_PORT,
        Ipv4Addr::new(127, 0, 0, 1),
        server.port(),
        b"gimme",
    );
    let (ip, udp, payload) = parse_headers(&wire);
    gateway.handle_udp(&wire, &ip, &udp, &payload).await;

    let batch = timeout(Duration::from_secs(3), tun_rx.recv())
        .await
        .expect("fragmented response")
        .unwrap();
    assert!(batch.len() > 1, "primary plus fragments");

    // Primary is a full MTU with MF set; fragments reassemble the blob.
    // (Only the IP header parses here: the UDP length field counts the
    // full datagram, which exceeds what this first fragment carries.)
    let (primary_ip, _) = Ipv4Header::parse(batch[0].wire()).unwrap();
    assert_eq!(batch[0].wire().len(), 1500);
    assert!(primary_ip.more_fragments);

    let mut reassembled = batch[0].udp_payload().to_vec();
    for fragment in &batch[1..] {
        let (fip, body) = Ipv4Header::parse(fragment.wire()).unwrap();
        assert_eq!(fip.id, primary_ip.id);
        reassembled.extend_from_slice(&fragment.wire()[body]);
    }
    let expected: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
    assert_eq!(reassembled, expected);
}
