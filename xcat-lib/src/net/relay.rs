//! Bidirectional relay between a client-side and a host-side transport.
//!
//! Each direction is its own copy task. When one direction finishes, its
//! write side is shut down so the peer sees the half-close while the other
//! direction drains. Both endpoints are closed when both tasks are done.

use std::fmt;
use std::io;
use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinError;

/// The four endpoint addresses of a relay, client side first.
#[derive(Debug, Clone, Copy)]
pub struct RelayAddrs {
    pub client_remote: SocketAddr,
    pub client_local: SocketAddr,
    pub host_local: SocketAddr,
    pub host_remote: SocketAddr,
}

impl fmt::Display for RelayAddrs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "relay [client {}]<->[{} server {}]<->[{} host]",
            self.client_remote, self.client_local, self.host_local, self.host_remote
        )
    }
}

/// Composite result of a relay that did not end with EOF in both
/// directions. `None` in a direction means that direction ended cleanly.
#[derive(Debug)]
pub struct RelayError {
    pub addrs: RelayAddrs,
    pub client_to_host: Option<io::Error>,
    pub host_to_client: Option<io::Error>,
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fmt_dir = |e: &Option<io::Error>| match e {
            Some(e) => e.to_string(),
            None => "EOF".to_string(),
        };
        write!(
            f,
            "{}, client to host: {}, host to client: {}",
            self.addrs,
            fmt_dir(&self.client_to_host),
            fmt_dir(&self.host_to_client)
        )
    }
}

impl std::error::Error for RelayError {}

fn join_failure(e: JoinError) -> io::Error {
    io::Error::other(format!("relay task failed: {e}"))
}

/// Copy both directions until each sees EOF or an error; returns the byte
/// counts on success. Both transports are consumed and closed.
pub async fn relay<C, H>(client: C, host: H, addrs: RelayAddrs) -> Result<(u64, u64), RelayError>
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    H: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut client_r, mut client_w) = tokio::io::split(client);
    let (mut host_r, mut host_w) = tokio::io::split(host);

    let c2h = tokio::spawn(async move {
        let res = tokio::io::copy(&mut client_r, &mut host_w).await;
        let _ = host_w.shutdown().await;
        res
    });
    let h2c = tokio::spawn(async move {
        let res = tokio::io::copy(&mut host_r, &mut client_w).await;
        let _ = client_w.shutdown().await;
        res
    });

    let c2h = c2h.await.unwrap_or_else(|e| Err(join_failure(e)));
    let h2c = h2c.await.unwrap_or_else(|e| Err(join_failure(e)));

    match (c2h, h2c) {
        (Ok(up), Ok(down)) => Ok((up, down)),
        (c2h, h2c) => Err(RelayError {
            addrs,
            client_to_host: c2h.err(),
            host_to_client: h2c.err(),
        }),
    }
}
