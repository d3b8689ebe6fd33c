//! Server mode: accept control links, and for each allocated port run a
//! data-link supervisor that bridges one authenticated flow to the
//! configured upstream.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use thiserror::Error;
use tokio::net::{lookup_host, TcpStream, UdpSocket};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::ctrl;
use crate::net::{relay, MultiListener, RelayAddrs};
use crate::ray::{self, handshake, RayDatagram, MAX_CONTENT_SIZE};
use crate::stat;

/// Consecutive datagram-level failures tolerated before a UDP flow is
/// declared fatal.
pub(crate) const UDP_IO_RETRIES: u32 = 5;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("bind failed: {0}")]
    Bind(std::io::Error),
    #[error("accept failed: {0}")]
    Accept(std::io::Error),
}

/// Accept control links until the shutdown signal flips or accepting fails.
pub async fn run(cfg: Arc<Config>, mut shutdown: watch::Receiver<bool>) -> Result<(), ServerError> {
    let mut listener = MultiListener::bind(&cfg.host, cfg.port)
        .await
        .map_err(ServerError::Bind)?;
    info!(
        port = listener.port(),
        addrs = ?listener.local_addrs(),
        "control link listener bound"
    );

    loop {
        tokio::select! {
            res = listener.accept() => match res {
                Ok((stream, peer)) => {
                    tokio::spawn(ctrl::server::serve_link(stream, peer, cfg.clone()));
                }
                Err(e) => return Err(ServerError::Accept(e)),
            },
            res = shutdown.changed() => {
                if res.is_ok() {
                    info!("shutdown signal received, stopping accept loop");
                    break;
                } else {
                    // sender dropped; treat as no shutdown signal
                    continue;
                }
            }
        }
    }
    Ok(())
}

fn addr_or_unspecified(res: std::io::Result<SocketAddr>) -> SocketAddr {
    res.unwrap_or_else(|_| SocketAddr::new(IpAddr::from([0, 0, 0, 0]), 0))
}

/// Supervise one TCP data link: dial the upstream in parallel, wait for the
/// client on the ephemeral listener until the listen deadline, authenticate,
/// then relay.
pub(crate) async fn serve_tcp_link(mut listener: MultiListener, cfg: Arc<Config>) {
    let id = stat::next_id();
    let port = listener.port();
    let Some(upstream) = cfg.upstream.clone() else {
        return;
    };

    let dial = {
        let upstream = upstream.clone();
        tokio::spawn(async move { TcpStream::connect(upstream.as_str()).await })
    };

    let accepted = tokio::time::timeout(cfg.link_timeout(), listener.accept()).await;
    listener.close();
    let (stream, peer) = match accepted {
        Err(_) => {
            debug!(port, "data link listen deadline expired");
            stat::event("t", id, "L");
            dial.abort();
            return;
        }
        Ok(Err(e)) => {
            warn!(port, error = %e, "data link accept failed");
            dial.abort();
            return;
        }
        Ok(Ok(pair)) => pair,
    };
    stat::event("t", id, "c");

    let conn = match ray::accept(
        stream,
        cfg.user.as_bytes(),
        cfg.password.as_bytes(),
        cfg.ctrl_timeout(),
    )
    .await
    {
        Ok(conn) => conn,
        Err(e) => {
            warn!(port, %peer, error = %e, "data link handshake failed");
            dial.abort();
            return;
        }
    };

    let host = match dial.await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            warn!(port, upstream = %upstream, error = %e, "upstream dial failed");
            return;
        }
        Err(e) => {
            warn!(port, upstream = %upstream, error = %e, "upstream dial task failed");
            return;
        }
    };

    let addrs = RelayAddrs {
        client_remote: conn.peer_addr,
        client_local: conn.local_addr,
        host_local: addr_or_unspecified(host.local_addr()),
        host_remote: addr_or_unspecified(host.peer_addr()),
    };
    info!(%addrs, "data link relay starting");
    stat::event("t", id, "r");
    match relay(conn.stream, host, addrs).await {
        Ok((up, down)) => info!(%addrs, up, down, "data link relay finished"),
        Err(e) => info!(error = %e, "data link relay finished"),
    }
    stat::event("t", id, "R");
}

/// Supervise one UDP data link. The accepted TCP connection is the
/// companion; the client-facing UDP socket binds the companion's local
/// address so both share the allocated port and interface, and the client's
/// UDP source is latched from its first datagram.
pub(crate) async fn serve_udp_link(mut listener: MultiListener, cfg: Arc<Config>) {
    let id = stat::next_id();
    let port = listener.port();
    let Some(upstream) = cfg.upstream.clone() else {
        return;
    };

    let accepted = tokio::time::timeout(cfg.link_timeout(), listener.accept()).await;
    listener.close();
    let (mut companion, peer) = match accepted {
        Err(_) => {
            debug!(port, "data link listen deadline expired");
            stat::event("u", id, "L");
            return;
        }
        Ok(Err(e)) => {
            warn!(port, error = %e, "data link accept failed");
            return;
        }
        Ok(Ok(pair)) => pair,
    };
    stat::event("u", id, "c");

    let local = match companion.local_addr() {
        Ok(addr) => addr,
        Err(e) => {
            warn!(port, %peer, error = %e, "companion local address unavailable");
            return;
        }
    };

    let upstream_addr = match lookup_host(upstream.as_str()).await.map(|mut a| a.next()) {
        Ok(Some(addr)) => addr,
        Ok(None) | Err(_) => {
            warn!(port, upstream = %upstream, "failed to resolve upstream");
            return;
        }
    };
    let facing = match UdpSocket::bind(local).await {
        Ok(s) => s,
        Err(e) => {
            warn!(port, error = %e, "failed to bind client-facing udp socket");
            return;
        }
    };
    let host = match udp_dial(upstream_addr).await {
        Ok(s) => Arc::new(s),
        Err(e) => {
            warn!(port, upstream = %upstream, error = %e, "failed to dial upstream udp");
            return;
        }
    };

    let keys = match tokio::time::timeout(
        cfg.ctrl_timeout(),
        handshake(&mut companion, cfg.user.as_bytes(), cfg.password.as_bytes()),
    )
    .await
    {
        Ok(Ok(keys)) => keys,
        Ok(Err(e)) => {
            warn!(port, %peer, error = %e, "data link handshake failed");
            return;
        }
        Err(_) => {
            warn!(port, %peer, "data link handshake timed out");
            return;
        }
    };

    let carrier = Arc::new(RayDatagram::new(facing, &keys, companion, false));
    info!(port, %peer, upstream = %upstream_addr, "udp data link established");
    stat::event("u", id, "r");

    // client -> upstream
    let uplink = {
        let carrier = carrier.clone();
        let host = host.clone();
        tokio::spawn(async move {
            let mut failures = 0u32;
            loop {
                let payload = match carrier.recv().await {
                    Ok(p) => p,
                    Err(_) if carrier.is_closed() => return,
                    Err(e) => {
                        failures += 1;
                        if failures > UDP_IO_RETRIES {
                            warn!(error = %e, "udp flow failed client-side");
                            carrier.close();
                            return;
                        }
                        debug!(error = %e, "dropping inbound datagram");
                        continue;
                    }
                };
                if payload.is_empty() {
                    continue;
                }
                match host.send(&payload).await {
                    Ok(_) => failures = 0,
                    Err(e) => {
                        failures += 1;
                        if failures > UDP_IO_RETRIES {
                            warn!(error = %e, "udp flow failed upstream-side");
                            carrier.close();
                            return;
                        }
                    }
                }
            }
        })
    };

    // upstream -> client
    let mut buf = vec![0u8; MAX_CONTENT_SIZE];
    let mut failures = 0u32;
    loop {
        let n = tokio::select! {
            _ = carrier.closed() => break,
            r = host.recv(&mut buf) => match r {
                Ok(n) => n,
                Err(e) => {
                    failures += 1;
                    if failures > UDP_IO_RETRIES {
                        warn!(error = %e, "udp flow failed upstream-side");
                        break;
                    }
                    continue;
                }
            },
        };
        match carrier.send(&buf[..n]).await {
            Ok(()) => failures = 0,
            Err(_) if carrier.is_closed() => break,
            Err(e) => {
                failures += 1;
                if failures > UDP_IO_RETRIES {
                    warn!(error = %e, "udp flow failed client-side");
                    break;
                }
                debug!(error = %e, "dropping outbound datagram");
            }
        }
    }
    carrier.close();
    let _ = uplink.await;
    debug!(port, %peer, "udp data link closed");
    stat::event("u", id, "R");
}

/// Dial a UDP socket of the right family for `target`.
pub(crate) async fn udp_dial(target: SocketAddr) -> std::io::Result<UdpSocket> {
    let bind: SocketAddr = if target.is_ipv4() {
        (IpAddr::from([0, 0, 0, 0]), 0).into()
    } else {
        (IpAddr::from([0u16, 0, 0, 0, 0, 0, 0, 0]), 0).into()
    };
    let socket = UdpSocket::bind(bind).await?;
    socket.connect(target).await?;
    Ok(socket)
}
