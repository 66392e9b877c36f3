//! End-to-end scenarios against a live router on loopback.
//!
//! Each test claims its own 127.0.N.0/24 slice: the fake student processes
//! bind the "real" addresses, the router impersonates each host on a
//! distinct alias address, and a static resolver stands in for the harness's
//! hosts-file aliasing. Tests therefore never collide on ports even when
//! they run concurrently.

#![allow(clippy::unwrap_used)]

use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use classnet::{
    DiagramWriter, HostDirectory, Manipulate, MessageRecord, Router, StaticResolver, hooks,
};
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::{TcpListener, TcpSocket, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::timeout;

const TCP_PORT: u16 = 7000;
const UDP_PORT: u16 = 8000;

struct Net {
    /// Where the real alpha process lives (clients bind here).
    alpha: IpAddr,
    /// Where the real bravo process lives (servers bind here).
    bravo: IpAddr,
    /// Router's impersonation address for alpha.
    alpha_alias: IpAddr,
    /// Router's impersonation address for bravo.
    bravo_alias: IpAddr,
}

fn net(n: u8) -> Net {
    Net {
        alpha: IpAddr::from([127, 0, n, 2]),
        bravo: IpAddr::from([127, 0, n, 3]),
        alpha_alias: IpAddr::from([127, 0, n, 12]),
        bravo_alias: IpAddr::from([127, 0, n, 13]),
    }
}

fn inventory(net: &Net) -> String {
    format!(
        r#"{{
            "hosts": {{
                "alpha": {{
                    "ip_address": "{alpha}",
                    "tcp_start_port": {tcp}, "tcp_end_port": {tcp},
                    "udp_start_port": {udp}, "udp_end_port": {udp},
                    "bind_address": "{alpha_alias}"
                }},
                "bravo": {{
                    "ip_address": "{bravo}",
                    "tcp_start_port": {tcp}, "tcp_end_port": {tcp},
                    "udp_start_port": {udp}, "udp_end_port": {udp},
                    "bind_address": "{bravo_alias}"
                }}
            }}
        }}"#,
        alpha = net.alpha,
        bravo = net.bravo,
        alpha_alias = net.alpha_alias,
        bravo_alias = net.bravo_alias,
        tcp = TCP_PORT,
        udp = UDP_PORT,
    )
}

fn build_router(n: u8, hook: impl Manipulate) -> (Router, Net, tempfile::TempPath) {
    let net = net(n);

    let directory = HostDirectory::from_json(&inventory(&net)).unwrap();
    let diagram_path = tempfile::NamedTempFile::new().unwrap().into_temp_path();
    let diagram = DiagramWriter::create(&diagram_path).unwrap();
    let resolver = StaticResolver::new()
        .with("alpha_Actual", net.alpha)
        .with("bravo_Actual", net.bravo);

    let router = Router::builder(directory, diagram)
        .hook(hook)
        .resolver(resolver)
        .build();

    (router, net, diagram_path)
}

async fn start_router(n: u8, hook: impl Manipulate) -> (Router, Net, tempfile::TempPath) {
    let (router, net, diagram_path) = build_router(n, hook);
    router.start().await.unwrap();

    (router, net, diagram_path)
}

async fn tcp_connect_from(source: IpAddr, dest: SocketAddr) -> TcpStream {
    let socket = TcpSocket::new_v4().unwrap();
    socket.bind(SocketAddr::new(source, 0)).unwrap();
    socket.connect(dest).await.unwrap()
}

/// Poll the diagram file until `pred` accepts its contents.
async fn wait_for_diagram(path: &Path, pred: impl Fn(&str) -> bool) -> String {
    let deadline = Instant::now() + Duration::from_secs(5);

    loop {
        let contents = std::fs::read_to_string(path).unwrap_or_default();
        if pred(&contents) {
            return contents;
        }
        assert!(
            Instant::now() < deadline,
            "timed out waiting for diagram; contents so far:\n{contents}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn tcp_splice_is_transparent_both_ways() {
    let (router, net, diagram) = start_router(21, classnet::Identity).await;

    // bravo_Actual: reads one request, echoes it uppercased.
    let listener = TcpListener::bind(SocketAddr::new(net.bravo, TCP_PORT))
        .await
        .unwrap();
    let (observed_tx, mut observed_rx) = mpsc::channel::<Vec<u8>>(1);
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 1024];
        let n = stream.read(&mut buf).await.unwrap();
        observed_tx.send(buf[..n].to_vec()).await.unwrap();
        let reply: Vec<u8> = buf[..n].iter().map(u8::to_ascii_uppercase).collect();
        stream.write_all(&reply).await.unwrap();
    });

    let mut client =
        tcp_connect_from(net.alpha, SocketAddr::new(net.bravo_alias, TCP_PORT)).await;
    client.write_all(b"hello").await.unwrap();

    let observed = timeout(Duration::from_secs(5), observed_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(observed, b"hello");

    let mut reply = [0u8; 5];
    timeout(Duration::from_secs(5), client.read_exact(&mut reply))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&reply, b"HELLO");

    let contents = wait_for_diagram(&diagram, |c| {
        c.contains("alpha->>bravo: hello") && c.contains("bravo->>alpha: HELLO")
    })
    .await;
    assert_eq!(contents.matches("->>").count(), 2);

    router.shutdown();
}

#[tokio::test]
async fn dropped_udp_message_never_arrives() {
    let (router, net, diagram) = start_router(22, hooks::DropMatching::new(*b"secret")).await;

    let server = UdpSocket::bind(SocketAddr::new(net.bravo, UDP_PORT))
        .await
        .unwrap();

    let client = UdpSocket::bind(SocketAddr::new(net.alpha, 0)).await.unwrap();
    client
        .send_to(b"secret", SocketAddr::new(net.bravo_alias, UDP_PORT))
        .await
        .unwrap();

    let contents = wait_for_diagram(&diagram, |c| c.contains("alpha-xbravo: secret")).await;
    assert_eq!(contents.matches("-x").count(), 1);

    // The drop already went through the forwarder; nothing may arrive now.
    let mut buf = [0u8; 64];
    assert!(
        timeout(Duration::from_millis(200), server.recv_from(&mut buf))
            .await
            .is_err()
    );
    assert_eq!(router.queued(), 0);

    router.shutdown();
}

#[tokio::test]
async fn delayed_udp_message_is_released_at_forward_time() {
    // Delay only the first record; the second is released immediately and is
    // allowed to overtake it (ordering is only promised for equal forward
    // times).
    let first = Arc::new(AtomicBool::new(true));
    let hook = {
        let first = first.clone();
        move |mut record: MessageRecord| {
            if first.swap(false, Ordering::SeqCst) {
                record.delay_by(Duration::from_millis(200));
            }
            record
        }
    };

    let (router, net, _diagram) = start_router(23, hook).await;

    let server = UdpSocket::bind(SocketAddr::new(net.bravo, UDP_PORT))
        .await
        .unwrap();

    let client = UdpSocket::bind(SocketAddr::new(net.alpha, 0)).await.unwrap();
    let sent_at = Instant::now();
    client
        .send_to(b"A", SocketAddr::new(net.bravo_alias, UDP_PORT))
        .await
        .unwrap();
    client
        .send_to(b"B", SocketAddr::new(net.bravo_alias, UDP_PORT))
        .await
        .unwrap();

    let mut arrivals = Vec::new();
    let mut buf = [0u8; 64];
    for _ in 0..2 {
        let (n, _) = timeout(Duration::from_secs(5), server.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        arrivals.push((buf[..n].to_vec(), Instant::now()));
    }

    let delayed = arrivals.iter().find(|(m, _)| m == b"A").unwrap();
    let prompt = arrivals.iter().find(|(m, _)| m == b"B").unwrap();

    assert!(
        delayed.1 - sent_at >= Duration::from_millis(190),
        "first message arrived after {:?}",
        delayed.1 - sent_at
    );
    assert!(
        prompt.1 - sent_at < Duration::from_millis(150),
        "undelayed message arrived after {:?}",
        prompt.1 - sent_at
    );

    router.shutdown();
}

#[tokio::test]
async fn large_tcp_payload_survives_chunking() {
    let (router, net, diagram) = start_router(24, classnet::Identity).await;

    let blob: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();

    let listener = TcpListener::bind(SocketAddr::new(net.bravo, TCP_PORT))
        .await
        .unwrap();
    let (received_tx, mut received_rx) = mpsc::channel::<Vec<u8>>(1);
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut all = Vec::new();
        stream.read_to_end(&mut all).await.unwrap();
        received_tx.send(all).await.unwrap();
    });

    let mut client =
        tcp_connect_from(net.alpha, SocketAddr::new(net.bravo_alias, TCP_PORT)).await;
    client.write_all(&blob).await.unwrap();
    client.shutdown().await.unwrap();

    let received = timeout(Duration::from_secs(5), received_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, blob);

    // Delivered in 1024-byte chunks, so the diagram shows several arrows.
    let contents = wait_for_diagram(&diagram, |c| c.matches("->>").count() >= 3).await;
    assert!(!contents.contains("-x"));

    router.shutdown();
}

#[tokio::test]
async fn unknown_peers_are_rejected_without_taking_the_router_down() {
    let (router, net, diagram) = start_router(25, classnet::Identity).await;

    let server = UdpSocket::bind(SocketAddr::new(net.bravo, UDP_PORT))
        .await
        .unwrap();

    // 127.0.25.99 is not in the inventory.
    let stranger = UdpSocket::bind(SocketAddr::new(IpAddr::from([127, 0, 25, 99]), 0))
        .await
        .unwrap();
    stranger
        .send_to(b"ghost", SocketAddr::new(net.bravo_alias, UDP_PORT))
        .await
        .unwrap();

    // The router must still serve known peers afterwards.
    let client = UdpSocket::bind(SocketAddr::new(net.alpha, 0)).await.unwrap();
    client
        .send_to(b"ping", SocketAddr::new(net.bravo_alias, UDP_PORT))
        .await
        .unwrap();

    let mut buf = [0u8; 64];
    let (n, _) = timeout(Duration::from_secs(5), server.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..n], b"ping");

    let contents = wait_for_diagram(&diagram, |c| c.contains("ping")).await;
    assert!(!contents.contains("ghost"));
    assert_eq!(router.queued(), 0);

    router.shutdown();
}

#[tokio::test]
async fn diagram_label_becomes_a_note_line() {
    let (router, net, diagram) =
        start_router(26, hooks::LabelMatching::new(*b"hello", "injected delay")).await;

    let server = UdpSocket::bind(SocketAddr::new(net.bravo, UDP_PORT))
        .await
        .unwrap();

    let client = UdpSocket::bind(SocketAddr::new(net.alpha, 0)).await.unwrap();
    client
        .send_to(b"hello", SocketAddr::new(net.bravo_alias, UDP_PORT))
        .await
        .unwrap();

    let mut buf = [0u8; 64];
    timeout(Duration::from_secs(5), server.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();

    let contents =
        wait_for_diagram(&diagram, |c| c.contains("Note over alpha,bravo: injected delay")).await;
    let arrow = contents.find("alpha->>bravo: hello").unwrap();
    let note = contents.find("Note over alpha,bravo: injected delay").unwrap();
    assert!(note > arrow);

    router.shutdown();
}

#[tokio::test]
async fn udp_source_port_is_stable_and_replies_flow_back() {
    let (router, net, _diagram) = start_router(27, classnet::Identity).await;

    let server = UdpSocket::bind(SocketAddr::new(net.bravo, UDP_PORT))
        .await
        .unwrap();

    // Fixed client source port; its conversation must keep it end to end.
    let client = UdpSocket::bind(SocketAddr::new(net.alpha, 9100)).await.unwrap();
    for payload in [&b"ping1"[..], &b"ping2"[..]] {
        client
            .send_to(payload, SocketAddr::new(net.bravo_alias, UDP_PORT))
            .await
            .unwrap();
    }

    let mut buf = [0u8; 64];
    let mut sources = Vec::new();
    for _ in 0..2 {
        let (_, from) = timeout(Duration::from_secs(5), server.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        sources.push(from);
    }

    // Same forwarding socket for both datagrams, presenting the original
    // source port on the router's alpha alias.
    assert_eq!(sources[0], sources[1]);
    assert_eq!(sources[0].port(), 9100);
    assert_eq!(sources[0].ip(), net.alpha_alias);

    // Reply to what we saw; it must come back to the client's own socket,
    // apparently from the alias it first talked to.
    server.send_to(b"pong", sources[0]).await.unwrap();

    let (n, from) = timeout(Duration::from_secs(5), client.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..n], b"pong");
    assert_eq!(from, SocketAddr::new(net.bravo_alias, UDP_PORT));

    router.shutdown();
}

#[tokio::test]
async fn shutdown_stops_the_forwarder() {
    let (router, _net, _diagram) = build_router(28, classnet::Identity);

    let run = {
        let router = router.clone();
        tokio::spawn(async move { router.run().await })
    };

    // Let run() get as far as starting everything.
    let deadline = Instant::now() + Duration::from_secs(5);
    while !router.is_running() {
        assert!(Instant::now() < deadline, "router never started");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    router.shutdown();

    timeout(Duration::from_secs(5), run)
        .await
        .expect("router did not stop after shutdown")
        .unwrap()
        .unwrap();
    assert!(!router.is_running());
}
