//! Framed datagram carrier: a UDP socket paired with a companion TCP
//! connection used purely as a liveness signal.
//!
//! The accepting side latches the source address of the first datagram it
//! sees and drops traffic from anyone else until teardown. This trusts the
//! first datagram's source; an off-path forger would have to beat the
//! legitimate peer to it. The companion watcher turns any TCP completion
//! (EOF or error) into a flow-wide fatal latch.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::io::AsyncReadExt;
use tokio::net::{TcpStream, UdpSocket};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::codec::{Codec, MAX_WIRE_SIZE};
use super::handshake::SessionKeys;
use super::RayError;

fn flow_closed() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "datagram flow closed")
}

pub struct RayDatagram {
    socket: Arc<UdpSocket>,
    codec: Codec,
    peer: Mutex<Option<SocketAddr>>,
    /// Whether `socket` was dialed; if not, the peer is latched from the
    /// first datagram.
    connected: bool,
    fatal: CancellationToken,
    watcher: JoinHandle<()>,
}

impl RayDatagram {
    /// Build the adapter. `companion` is consumed by the watcher task; its
    /// EOF or error cancels the flow.
    pub fn new(socket: UdpSocket, keys: &SessionKeys, companion: TcpStream, connected: bool) -> Self {
        let fatal = CancellationToken::new();
        let watcher = tokio::spawn(watch_companion(companion, fatal.clone()));
        Self {
            socket: Arc::new(socket),
            codec: Codec::new(keys),
            peer: Mutex::new(None),
            connected,
            fatal,
            watcher,
        }
    }

    /// Receive and decapsulate one datagram. Datagrams from sources other
    /// than the latched peer are dropped; an empty datagram yields an empty
    /// payload without decapsulation.
    pub async fn recv(&self) -> Result<Vec<u8>, RayError> {
        let mut wire = vec![0u8; MAX_WIRE_SIZE];
        loop {
            let (n, from) = tokio::select! {
                _ = self.fatal.cancelled() => return Err(RayError::Io(flow_closed())),
                r = self.socket.recv_from(&mut wire) => r?,
            };
            if !self.connected {
                let mut peer = self.peer.lock().unwrap_or_else(PoisonError::into_inner);
                match *peer {
                    None => *peer = Some(from),
                    Some(latched) if latched != from => continue,
                    Some(_) => {}
                }
            }
            if n == 0 {
                return Ok(Vec::new());
            }
            return self.codec.decap(&wire[..n]);
        }
    }

    /// Encapsulate and send one payload to the dialed or latched peer.
    pub async fn send(&self, payload: &[u8]) -> Result<(), RayError> {
        let wire = self.codec.encap(payload)?;
        if self.fatal.is_cancelled() {
            return Err(RayError::Io(flow_closed()));
        }
        if self.connected {
            self.socket.send(&wire).await?;
        } else {
            let peer = *self.peer.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(peer) = peer else {
                return Err(RayError::Io(io::Error::new(
                    io::ErrorKind::NotConnected,
                    "no peer latched yet",
                )));
            };
            self.socket.send_to(&wire, peer).await?;
        }
        Ok(())
    }

    /// Resolves once the flow has gone fatal (companion closed or
    /// [`close`](Self::close) called).
    pub async fn closed(&self) {
        self.fatal.cancelled().await;
    }

    pub fn is_closed(&self) -> bool {
        self.fatal.is_cancelled()
    }

    pub fn close(&self) {
        self.fatal.cancel();
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

impl Drop for RayDatagram {
    fn drop(&mut self) {
        self.fatal.cancel();
        self.watcher.abort();
    }
}

async fn watch_companion(mut companion: TcpStream, fatal: CancellationToken) {
    let mut byte = [0u8; 1];
    loop {
        tokio::select! {
            _ = fatal.cancelled() => return,
            r = companion.read(&mut byte) => match r {
                Ok(0) | Err(_) => {
                    fatal.cancel();
                    return;
                }
                Ok(_) => {}
            },
        }
    }
}
