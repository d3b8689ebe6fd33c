#![forbid(unsafe_code)]

use std::net::TcpListener as StdTcpListener;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use xcat_lib::config::{Config, Mode};
use xcat_lib::ctrl::{ControlLink, LinkKind};
use xcat_lib::{client, server};

fn pick_free_port() -> u16 {
    let listener = StdTcpListener::bind("127.0.0.1:0").expect("probe bind");
    let port = listener.local_addr().expect("probe addr").port();
    drop(listener);
    port
}

async fn spawn_echo_upstream() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("echo bind");
    let port = listener.local_addr().expect("echo addr").port();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 16 * 1024];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    port
}

fn tunnel_configs(ctrl_port: u16, ingress_port: u16, upstream_port: u16) -> (Arc<Config>, Arc<Config>) {
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
        udp_timeout_secs: 180,
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
        udp_timeout_secs: 180,
    });
    (server_cfg, client_cfg)
}

#[tokio::test]
async fn tcp_tunnel_carries_a_megabyte() {
    let upstream_port = spawn_echo_upstream().await;
    let ctrl_port = pick_free_port();
    let ingress_port = pick_free_port();
    let (server_cfg, client_cfg) = tunnel_configs(ctrl_port, ingress_port, upstream_port);

    let (_stx, srx) = watch::channel(false);
    let srv = tokio::spawn(server::run(server_cfg, srx));
    sleep(Duration::from_millis(100)).await;
    let (_ctx, crx) = watch::channel(false);
    let cli = tokio::spawn(client::run(client_cfg, crx));
    sleep(Duration::from_millis(200)).await;

    let mut inbound = TcpStream::connect(("127.0.0.1", ingress_port))
        .await
        .expect("dial ingress");

    const PAYLOAD: usize = 1024 * 1024;
    let (mut rd, mut wr) = inbound.split();
    let writer = async {
        let chunk = [0xAAu8; 32 * 1024];
        let mut sent = 0;
        while sent < PAYLOAD {
            let n = (PAYLOAD - sent).min(chunk.len());
            wr.write_all(&chunk[..n]).await.expect("write");
            sent += n;
        }
        wr.shutdown().await.expect("half close");
    };
    let reader = async {
        let mut buf = vec![0u8; 64 * 1024];
        let mut got = 0usize;
        while got < PAYLOAD {
            let n = rd.read(&mut buf).await.expect("read");
            assert!(n > 0, "EOF before the echo completed at {got}");
            assert!(buf[..n].iter().all(|&b| b == 0xAA), "payload corrupted");
            got += n;
        }
        got
    };
    let (_, got) = timeout(Duration::from_secs(30), async {
        tokio::join!(writer, reader)
    })
    .await
    .expect("transfer deadline");
    assert_eq!(got, PAYLOAD);

    // Upstream saw our half close; the echo ends with EOF.
    let mut buf = [0u8; 1];
    let n = timeout(Duration::from_secs(5), inbound.read(&mut buf))
        .await
        .expect("eof deadline")
        .expect("eof read");
    assert_eq!(n, 0);

    cli.abort();
    srv.abort();
}

#[tokio::test]
async fn unused_allocation_expires_and_frees_the_port() {
    let upstream_port = spawn_echo_upstream().await;
    let ctrl_port = pick_free_port();
    let (server_cfg, _) = tunnel_configs(ctrl_port, 0, upstream_port);

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
    let port = ctrl.get_port(LinkKind::Tcp).await.expect("get port");

    // Never dial it. After the listen deadline the listener must be gone.
    sleep(Duration::from_millis(2600)).await;
    assert!(
        TcpStream::connect(("127.0.0.1", port)).await.is_err(),
        "expired data link port must refuse connections"
    );

    srv.abort();
}

#[tokio::test]
async fn inbound_is_dropped_when_no_server_answers() {
    // A client whose control link dies right after startup: inbounds are
    // dropped rather than wedged.
    let upstream_port = spawn_echo_upstream().await;
    let ctrl_port = pick_free_port();
    let ingress_port = pick_free_port();
    let (server_cfg, client_cfg) = tunnel_configs(ctrl_port, ingress_port, upstream_port);

    let rt = tokio::runtime::Runtime::new().expect("runtime");
    let (_stx, srx) = watch::channel(false);
    rt.spawn(server::run(server_cfg, srx));
    sleep(Duration::from_millis(200)).await;

    let (_ctx, crx) = watch::channel(false);
    let cli = tokio::spawn(client::run(client_cfg, crx));
    sleep(Duration::from_millis(200)).await;

    // Kill the server wholesale.
    rt.shutdown_background();
    sleep(Duration::from_millis(100)).await;

    let mut inbound = TcpStream::connect(("127.0.0.1", ingress_port))
        .await
        .expect("ingress still accepts");
    // The handler fails port allocation after its retries and closes us.
    let mut buf = [0u8; 1];
    let n = timeout(Duration::from_secs(30), inbound.read(&mut buf))
        .await
        .expect("drop deadline")
        .unwrap_or(0);
    assert_eq!(n, 0, "inbound must be closed, not served");

    cli.abort();
}
