#![forbid(unsafe_code)]

use std::net::TcpListener as StdTcpListener;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use xcat_lib::config::{Config, Mode};
use xcat_lib::ctrl::{ControlLink, LinkKind};
use xcat_lib::ray::{handshake, Codec};
use xcat_lib::{client, server};

fn pick_free_port() -> u16 {
    let listener = StdTcpListener::bind("127.0.0.1:0").expect("probe bind");
    let port = listener.local_addr().expect("probe addr").port();
    drop(listener);
    port
}

async fn spawn_udp_echo() -> u16 {
    let socket = UdpSocket::bind("127.0.0.1:0").await.expect("echo bind");
    let port = socket.local_addr().expect("echo addr").port();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let Ok((n, from)) = socket.recv_from(&mut buf).await else {
                return;
            };
            let _ = socket.send_to(&buf[..n], from).await;
        }
    });
    port
}

fn tunnel_configs(
    ctrl_port: u16,
    ingress_port: u16,
    upstream_port: u16,
    udp_timeout_secs: u64,
) -> (Arc<Config>, Arc<Config>) {
    let server_cfg = Arc::new(Config {
        mode: Mode::Server,
        host: "127.0.0.1".into(),
        port: ctrl_port,
        user: "ferris".into(),
        password: "hunter2".into(),
        listen: ":1080".into(),
        upstream: Some(format!("127.0.0.1:{upstream_port}")),
        link_timeout_secs: 2,
        ctrl_timeout_secs: 2,
        udp_timeout_secs,
    });
    let client_cfg = Arc::new(Config {
        mode: Mode::Client,
        host: "127.0.0.1".into(),
        port: ctrl_port,
        user: "ferris".into(),
        password: "hunter2".into(),
        listen: format!("127.0.0.1:{ingress_port}"),
        upstream: None,
        link_timeout_secs: 2,
        ctrl_timeout_secs: 2,
        udp_timeout_secs,
    });
    (server_cfg, client_cfg)
}

#[tokio::test]
async fn udp_tunnel_round_trip() {
    let upstream_port = spawn_udp_echo().await;
    let ctrl_port = pick_free_port();
    let ingress_port = pick_free_port();
    let (server_cfg, client_cfg) =
        tunnel_configs(ctrl_port, ingress_port, upstream_port, 180);

    let (_stx, srx) = watch::channel(false);
    let srv = tokio::spawn(server::run(server_cfg, srx));
    sleep(Duration::from_millis(100)).await;
    let (_ctx, crx) = watch::channel(false);
    let cli = tokio::spawn(client::run(client_cfg, crx));
    sleep(Duration::from_millis(200)).await;

    let local = UdpSocket::bind("127.0.0.1:0").await.expect("local bind");
    local
        .connect(("127.0.0.1", ingress_port))
        .await
        .expect("connect ingress");

    let mut buf = [0u8; 2048];
    for round in 0..3u8 {
        let msg = format!("datagram {round}");
        local.send(msg.as_bytes()).await.expect("send");
        let n = timeout(Duration::from_secs(5), local.recv(&mut buf))
            .await
            .expect("echo deadline")
            .expect("recv");
        assert_eq!(&buf[..n], msg.as_bytes(), "round {round}");
    }

    cli.abort();
    srv.abort();
}

#[tokio::test]
async fn idle_flow_is_torn_down_and_replaced() {
    let upstream_port = spawn_udp_echo().await;
    let ctrl_port = pick_free_port();
    let ingress_port = pick_free_port();
    let (server_cfg, client_cfg) = tunnel_configs(ctrl_port, ingress_port, upstream_port, 1);

    let (_stx, srx) = watch::channel(false);
    let srv = tokio::spawn(server::run(server_cfg, srx));
    sleep(Duration::from_millis(100)).await;
    let (_ctx, crx) = watch::channel(false);
    let cli = tokio::spawn(client::run(client_cfg, crx));
    sleep(Duration::from_millis(200)).await;

    let local = UdpSocket::bind("127.0.0.1:0").await.expect("local bind");
    local
        .connect(("127.0.0.1", ingress_port))
        .await
        .expect("connect ingress");

    let mut buf = [0u8; 2048];
    local.send(b"before idle").await.expect("send");
    let n = timeout(Duration::from_secs(5), local.recv(&mut buf))
        .await
        .expect("echo deadline")
        .expect("recv");
    assert_eq!(&buf[..n], b"before idle");

    // Outlive the activity timeout; the flow ends cleanly and the next
    // datagram starts a fresh one.
    sleep(Duration::from_millis(1800)).await;
    local.send(b"after idle").await.expect("send again");
    let n = timeout(Duration::from_secs(5), local.recv(&mut buf))
        .await
        .expect("replacement deadline")
        .expect("recv again");
    assert_eq!(&buf[..n], b"after idle");

    cli.abort();
    srv.abort();
}

#[tokio::test]
async fn companion_close_tears_down_the_server_flow() {
    let upstream_port = spawn_udp_echo().await;
    let ctrl_port = pick_free_port();
    let (server_cfg, _) = tunnel_configs(ctrl_port, 0, upstream_port, 180);

    let (_stx, srx) = watch::channel(false);
    let srv = tokio::spawn(server::run(server_cfg, srx));
    sleep(Duration::from_millis(100)).await;

    let ctrl = ControlLink::establish(
        "127.0.0.1",
        ctrl_port,
        b"ferris",
        b"hunter2",
        Duration::from_secs(2),
    )
    .await
    .expect("establish");
    let port = ctrl.get_port(LinkKind::Udp).await.expect("get port");

    // Hand-rolled client end of the UDP data link.
    let mut companion = TcpStream::connect(("127.0.0.1", port))
        .await
        .expect("companion dial");
    let keys = handshake(&mut companion, b"ferris", b"hunter2")
        .await
        .expect("handshake");
    let codec = Codec::new(&keys);

    let socket = UdpSocket::bind("127.0.0.1:0").await.expect("udp bind");
    socket.connect(("127.0.0.1", port)).await.expect("udp dial");

    let wire = codec.encap(b"are you there").expect("encap");
    socket.send(&wire).await.expect("send");
    let mut buf = vec![0u8; 64 * 1024];
    let n = timeout(Duration::from_secs(5), socket.recv(&mut buf))
        .await
        .expect("echo deadline")
        .expect("recv");
    assert_eq!(codec.decap(&buf[..n]).expect("decap"), b"are you there");

    // Dropping the companion is the liveness signal: the server closes the
    // flow and further datagrams go unanswered.
    drop(companion);
    sleep(Duration::from_millis(300)).await;

    let wire = codec.encap(b"anyone home").expect("encap");
    let _ = socket.send(&wire).await;
    // Silence or an unreachable error both mean the flow is gone; only a
    // reply would be wrong.
    match timeout(Duration::from_millis(500), socket.recv(&mut buf)).await {
        Ok(Ok(_)) => panic!("flow must be dead after companion close"),
        Ok(Err(_)) | Err(_) => {}
    }

    srv.abort();
}
