#![forbid(unsafe_code)]

use std::time::Duration;

use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use xcat_lib::net::{MultiListener, MultiUdpListener};

#[tokio::test]
async fn ephemeral_port_is_shared_across_sockets() {
    // "localhost" commonly resolves to both loopback families; skip when
    // the environment cannot bind one of them.
    let Ok(listener) = MultiListener::bind("localhost", 0).await else {
        return;
    };
    let port = listener.port();
    assert_ne!(port, 0);
    for addr in listener.local_addrs() {
        assert_eq!(addr.port(), port);
    }
}

#[tokio::test]
async fn accepts_dialed_connections() {
    let mut listener = MultiListener::bind("127.0.0.1", 0).await.expect("bind");
    let port = listener.port();

    let dialer = tokio::spawn(async move { TcpStream::connect(("127.0.0.1", port)).await });
    let (_stream, peer) = timeout(Duration::from_secs(2), listener.accept())
        .await
        .expect("accept deadline")
        .expect("accept");
    assert_eq!(peer.ip().to_string(), "127.0.0.1");
    dialer.await.unwrap().expect("dial");
}

#[tokio::test]
async fn close_releases_the_port() {
    let mut listener = MultiListener::bind("127.0.0.1", 0).await.expect("bind");
    let port = listener.port();
    listener.close();
    // Give the aborted acceptors a beat to drop their sockets.
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
    MultiListener::bind("127.0.0.1", port)
        .await
        .expect("port must be reusable after close");
}

#[tokio::test]
async fn udp_flows_demultiplex_by_source() {
    let listener = MultiUdpListener::bind("127.0.0.1", 0).await.expect("bind");
    let port = listener.port();

    let sender_a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let sender_b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    sender_a.send_to(b"from a", ("127.0.0.1", port)).await.unwrap();
    sender_b.send_to(b"from b", ("127.0.0.1", port)).await.unwrap();

    let first = timeout(Duration::from_secs(2), listener.accept())
        .await
        .expect("first flow");
    let second = timeout(Duration::from_secs(2), listener.accept())
        .await
        .expect("second flow");
    assert_ne!(first.peer(), second.peer());

    let mut by_peer = vec![first, second];
    by_peer.sort_by_key(|f| f.peer() != sender_a.local_addr().unwrap());
    let (flow_a, flow_b) = (&by_peer[0], &by_peer[1]);

    assert_eq!(flow_a.recv().await, b"from a");
    assert_eq!(flow_b.recv().await, b"from b");

    // Replies go back to the matching source.
    flow_a.send(b"to a").await.unwrap();
    let mut buf = [0u8; 16];
    let (n, _) = sender_a.recv_from(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"to a");
}

#[tokio::test]
async fn later_datagrams_join_the_existing_flow() {
    let listener = MultiUdpListener::bind("127.0.0.1", 0).await.expect("bind");
    let port = listener.port();

    let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    sender.send_to(b"one", ("127.0.0.1", port)).await.unwrap();
    sender.send_to(b"two", ("127.0.0.1", port)).await.unwrap();

    let flow = timeout(Duration::from_secs(2), listener.accept())
        .await
        .expect("flow");
    assert_eq!(flow.recv().await, b"one");
    assert_eq!(flow.recv().await, b"two");
}

#[tokio::test]
async fn dropped_flow_frees_its_table_entry() {
    let listener = MultiUdpListener::bind("127.0.0.1", 0).await.expect("bind");
    let port = listener.port();

    let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    sender.send_to(b"first life", ("127.0.0.1", port)).await.unwrap();
    let flow = timeout(Duration::from_secs(2), listener.accept())
        .await
        .expect("flow");
    drop(flow);

    // The same source now synthesizes a fresh virtual connection.
    sender.send_to(b"second life", ("127.0.0.1", port)).await.unwrap();
    let reborn = timeout(Duration::from_secs(2), listener.accept())
        .await
        .expect("reborn flow");
    assert_eq!(reborn.recv().await, b"second life");
}
