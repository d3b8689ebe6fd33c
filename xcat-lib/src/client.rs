//! Client mode: accept local TCP connections and UDP flows, allocate a
//! server port for each over the control link, and carry the traffic
//! through an authenticated data link.

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::{lookup_host, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::{self, Config};
use crate::ctrl::{ControlLink, LinkKind};
use crate::net::{relay, ActivityTimer, MultiListener, MultiUdpListener, RelayAddrs, UdpFlow};
use crate::ray::{self, handshake, RayDatagram, RayError};
use crate::server::{udp_dial, UDP_IO_RETRIES};
use crate::stat;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("control link: {0}")]
    ControlLink(RayError),
    #[error("invalid listen address: {0}")]
    Listen(crate::error::Error),
    #[error("bind failed: {0}")]
    Bind(std::io::Error),
    #[error("accept failed: {0}")]
    Accept(std::io::Error),
}

/// Establish the control link, then accept local TCP connections and UDP
/// flows on the ingress address until shutdown or an accept failure.
pub async fn run(cfg: Arc<Config>, mut shutdown: watch::Receiver<bool>) -> Result<(), ClientError> {
    let ctrl = Arc::new(
        ControlLink::establish(
            &cfg.host,
            cfg.port,
            cfg.user.as_bytes(),
            cfg.password.as_bytes(),
            cfg.ctrl_timeout(),
        )
        .await
        .map_err(ClientError::ControlLink)?,
    );

    let (listen_host, listen_port) =
        config::split_host_port(&cfg.listen).map_err(ClientError::Listen)?;
    let mut tcp = MultiListener::bind(&listen_host, listen_port)
        .await
        .map_err(ClientError::Bind)?;
    // The UDP ingress mirrors whatever port the TCP ingress settled on, so
    // one listen flag names both.
    let udp = MultiUdpListener::bind(&listen_host, tcp.port())
        .await
        .map_err(ClientError::Bind)?;
    info!(
        port = tcp.port(),
        addrs = ?tcp.local_addrs(),
        "client ingress listening"
    );

    let udp_loop = {
        let ctrl = ctrl.clone();
        let cfg = cfg.clone();
        tokio::spawn(async move {
            loop {
                let flow = udp.accept().await;
                tokio::spawn(serve_udp_inbound(flow, ctrl.clone(), cfg.clone()));
            }
        })
    };

    let result = loop {
        tokio::select! {
            res = tcp.accept() => match res {
                Ok((inbound, peer)) => {
                    tokio::spawn(serve_tcp_inbound(inbound, peer, ctrl.clone(), cfg.clone()));
                }
                Err(e) => break Err(ClientError::Accept(e)),
            },
            res = shutdown.changed() => {
                if res.is_ok() {
                    info!("shutdown signal received, stopping ingress");
                    break Ok(());
                } else {
                    // sender dropped; treat as no shutdown signal
                    continue;
                }
            }
        }
    };
    udp_loop.abort();
    result
}

async fn serve_tcp_inbound(
    inbound: TcpStream,
    peer: SocketAddr,
    ctrl: Arc<ControlLink>,
    cfg: Arc<Config>,
) {
    let id = stat::next_id();
    stat::event("t", id, "n");
    info!(%peer, "new tcp inbound");

    let port = match ctrl.get_port(LinkKind::Tcp).await {
        Ok(port) => port,
        Err(e) => {
            warn!(%peer, error = %e, "port allocation failed, dropping inbound");
            stat::event("t", id, "B");
            return;
        }
    };
    stat::event("t", id, "P");

    let conn = match ray::connect(
        &cfg.host,
        port,
        cfg.user.as_bytes(),
        cfg.password.as_bytes(),
        cfg.ctrl_timeout(),
    )
    .await
    {
        Ok(conn) => conn,
        Err(e) => {
            warn!(%peer, port, error = %e, "data link dial failed, dropping inbound");
            stat::event("t", id, "B");
            return;
        }
    };
    stat::event("t", id, "c");

    let client_local = inbound
        .local_addr()
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));
    let addrs = RelayAddrs {
        client_remote: peer,
        client_local,
        host_local: conn.local_addr,
        host_remote: conn.peer_addr,
    };
    info!(%addrs, "relay starting");
    stat::event("t", id, "r");
    match relay(inbound, conn.stream, addrs).await {
        Ok((up, down)) => info!(%addrs, up, down, "relay finished"),
        Err(e) => info!(error = %e, "relay finished"),
    }
    stat::event("t", id, "R");
}

async fn serve_udp_inbound(flow: UdpFlow, ctrl: Arc<ControlLink>, cfg: Arc<Config>) {
    let id = stat::next_id();
    stat::event("u", id, "n");
    let peer = flow.peer();
    info!(%peer, "new udp flow");

    let port = match ctrl.get_port(LinkKind::Udp).await {
        Ok(port) => port,
        Err(e) => {
            warn!(%peer, error = %e, "port allocation failed, dropping flow");
            stat::event("u", id, "B");
            return;
        }
    };
    stat::event("u", id, "P");

    let carrier = match dial_udp_link(&cfg, port).await {
        Ok(carrier) => Arc::new(carrier),
        Err(e) => {
            warn!(%peer, port, error = %e, "udp data link dial failed, dropping flow");
            stat::event("u", id, "B");
            return;
        }
    };
    info!(%peer, port, "udp data link established");
    stat::event("u", id, "r");

    let timer = Arc::new(ActivityTimer::new(cfg.udp_timeout()));
    let flow = Arc::new(flow);

    // local -> server
    let uplink = {
        let carrier = carrier.clone();
        let flow = flow.clone();
        let timer = timer.clone();
        tokio::spawn(async move {
            let mut failures = 0u32;
            loop {
                let payload = tokio::select! {
                    _ = carrier.closed() => return,
                    payload = flow.recv() => payload,
                };
                timer.touch();
                match carrier.send(&payload).await {
                    Ok(()) => failures = 0,
                    Err(_) if carrier.is_closed() => return,
                    Err(e) => {
                        failures += 1;
                        if failures > UDP_IO_RETRIES {
                            warn!(error = %e, "udp flow failed server-side");
                            carrier.close();
                            return;
                        }
                        debug!(error = %e, "dropping outbound datagram");
                    }
                }
            }
        })
    };

    // server -> local
    let mut failures = 0u32;
    loop {
        tokio::select! {
            _ = timer.expired() => {
                info!(%peer, "udp flow idle timeout");
                break;
            }
            res = carrier.recv() => match res {
                Ok(payload) => {
                    timer.touch();
                    if payload.is_empty() {
                        continue;
                    }
                    match flow.send(&payload).await {
                        Ok(_) => failures = 0,
                        Err(e) => {
                            failures += 1;
                            if failures > UDP_IO_RETRIES {
                                warn!(error = %e, "udp flow failed local-side");
                                break;
                            }
                        }
                    }
                }
                Err(_) if carrier.is_closed() => {
                    info!(%peer, "udp data link closed");
                    break;
                }
                Err(e) => {
                    failures += 1;
                    if failures > UDP_IO_RETRIES {
                        warn!(error = %e, "udp flow failed server-side");
                        break;
                    }
                    debug!(error = %e, "dropping inbound datagram");
                }
            }
        }
    }
    carrier.close();
    let _ = uplink.await;
    stat::event("u", id, "R");
}

/// Dial the companion TCP, authenticate on it, and pair it with a UDP
/// socket dialed to the same allocated port.
async fn dial_udp_link(cfg: &Config, port: u16) -> Result<RayDatagram, RayError> {
    let deadline = cfg.ctrl_timeout();
    let setup = async {
        let mut companion = TcpStream::connect((cfg.host.as_str(), port)).await?;
        let keys = handshake(&mut companion, cfg.user.as_bytes(), cfg.password.as_bytes()).await?;
        let server_addr = lookup_host((cfg.host.as_str(), port))
            .await?
            .next()
            .ok_or_else(|| {
                RayError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "server host resolved to no addresses",
                ))
            })?;
        let socket = udp_dial(server_addr).await?;
        Ok(RayDatagram::new(socket, &keys, companion, true))
    };
    if deadline.is_zero() {
        return setup.await;
    }
    match tokio::time::timeout(deadline, setup).await {
        Ok(res) => res,
        Err(_) => Err(RayError::Io(std::io::ErrorKind::TimedOut.into())),
    }
}
