//! Server side of the control link.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::net::MultiListener;
use crate::ray;
use crate::server::{serve_tcp_link, serve_udp_link};
use crate::stat;

use super::{LinkKind, MAX_PIPELINED};

/// Drive one accepted control-link connection: authenticate, then serve
/// port-allocation commands until the link dies. Commands may arrive
/// pipelined; replies keep command order. Data-link supervisors spawned
/// here outlive the link.
pub async fn serve_link(stream: TcpStream, peer: SocketAddr, cfg: Arc<Config>) {
    let id = stat::next_id();
    stat::event("c", id, "n");

    let conn = match ray::accept(stream, cfg.user.as_bytes(), cfg.password.as_bytes(), cfg.ctrl_timeout()).await
    {
        Ok(conn) => conn,
        Err(e) => {
            warn!(%peer, error = %e, "control link handshake failed");
            stat::event("c", id, "B");
            return;
        }
    };
    info!(%peer, conn = %conn.conn_str(), "control link established");
    let mut link = conn.stream;

    let mut commands = [0u8; MAX_PIPELINED];
    loop {
        let n = match link.read(&mut commands).await {
            Ok(0) => {
                info!(%peer, "control link closed by peer");
                stat::event("c", id, "R");
                return;
            }
            Ok(n) => n,
            Err(e) => {
                warn!(%peer, error = %e, "control link read failed");
                stat::event("c", id, "B");
                return;
            }
        };

        for &cmd in &commands[..n] {
            let Some(kind) = LinkKind::from_command(cmd) else {
                warn!(%peer, command = cmd, "unknown control command, closing link");
                stat::event("c", id, "B");
                return;
            };
            stat::event("c", id, "p");

            let listener = match MultiListener::bind(&cfg.host, 0).await {
                Ok(l) => l,
                Err(e) => {
                    warn!(%peer, error = %e, "failed to open data link listener, closing link");
                    stat::event("c", id, "B");
                    return;
                }
            };
            let port = listener.port();
            debug!(%peer, port, ?kind, "data link listener bound");
            stat::event("c", id, "l");

            if let Err(e) = link.write_all(&port.to_be_bytes()).await {
                warn!(%peer, error = %e, "failed to send port reply");
                stat::event("c", id, "B");
                return;
            }
            stat::event("c", id, "P");

            let cfg = cfg.clone();
            match kind {
                LinkKind::Tcp => {
                    tokio::spawn(serve_tcp_link(listener, cfg));
                }
                LinkKind::Udp => {
                    tokio::spawn(serve_udp_link(listener, cfg));
                }
            }
        }
    }
}
