//! Multi-interface UDP listener with accept-style virtual connections.
//!
//! Each distinct source address seen on any bound socket becomes a
//! [`UdpFlow`]: a handle carrying the peer address, the socket the peer
//! reached, and a bounded receive buffer. The accept queue is bounded too;
//! when it overflows, the oldest never-accepted flow is evicted and its
//! table entry removed.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use super::backlog::Backlog;
use super::listener::resolve_all;

/// Queued datagrams per flow before the oldest is dropped.
const FLOW_BUFFER: usize = 32;
/// Queued never-accepted flows before the oldest is evicted.
const ACCEPT_BACKLOG: usize = 32;

type FlowTable = Arc<Mutex<HashMap<SocketAddr, Arc<Backlog<Vec<u8>>>>>>;

pub struct MultiUdpListener {
    pending: Arc<Backlog<UdpFlow>>,
    table: FlowTable,
    readers: Vec<JoinHandle<()>>,
    local_addrs: Vec<SocketAddr>,
    port: u16,
}

impl MultiUdpListener {
    pub async fn bind(host: &str, port: u16) -> io::Result<Self> {
        let addrs = resolve_all(host, port).await?;

        let mut sockets: Vec<Arc<UdpSocket>> = Vec::with_capacity(addrs.len());
        let mut port = port;
        for addr in addrs {
            let socket = UdpSocket::bind(SocketAddr::new(addr.ip(), port)).await?;
            if port == 0 {
                port = socket.local_addr()?.port();
            }
            sockets.push(Arc::new(socket));
        }

        let mut local_addrs = Vec::with_capacity(sockets.len());
        for s in &sockets {
            local_addrs.push(s.local_addr()?);
        }

        let pending = Arc::new(Backlog::new(ACCEPT_BACKLOG));
        let table: FlowTable = Arc::new(Mutex::new(HashMap::new()));
        let readers = sockets
            .iter()
            .map(|socket| {
                tokio::spawn(read_socket(socket.clone(), table.clone(), pending.clone()))
            })
            .collect();

        Ok(Self {
            pending,
            table,
            readers,
            local_addrs,
            port,
        })
    }

    /// Next virtual connection: the first datagram from a new source
    /// address synthesizes one.
    pub async fn accept(&self) -> UdpFlow {
        self.pending.pop().await
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    pub fn close(&mut self) {
        for task in &self.readers {
            task.abort();
        }
        self.table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl Drop for MultiUdpListener {
    fn drop(&mut self) {
        for task in &self.readers {
            task.abort();
        }
    }
}

async fn read_socket(socket: Arc<UdpSocket>, table: FlowTable, pending: Arc<Backlog<UdpFlow>>) {
    let mut buf = vec![0u8; crate::ray::MAX_WIRE_SIZE];
    loop {
        let Ok((n, from)) = socket.recv_from(&mut buf).await else {
            return;
        };
        let payload = buf[..n].to_vec();

        let existing = table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&from)
            .cloned();
        match existing {
            Some(queue) => {
                // Oldest datagram gives way when the flow buffer is full.
                let _ = queue.push(payload);
            }
            None => {
                let queue = Arc::new(Backlog::new(FLOW_BUFFER));
                let _ = queue.push(payload);
                table
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(from, queue.clone());
                let flow = UdpFlow {
                    socket: socket.clone(),
                    peer: from,
                    queue,
                    table: table.clone(),
                };
                // Dropping an evicted flow removes its table entry.
                drop(pending.push(flow));
            }
        }
    }
}

/// One virtual UDP connection: datagrams from a single peer on a single
/// bound socket.
pub struct UdpFlow {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    queue: Arc<Backlog<Vec<u8>>>,
    table: FlowTable,
}

impl UdpFlow {
    /// Next buffered datagram from this flow's peer.
    pub async fn recv(&self) -> Vec<u8> {
        self.queue.pop().await
    }

    pub async fn send(&self, payload: &[u8]) -> io::Result<usize> {
        self.socket.send_to(payload, self.peer).await
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

impl Drop for UdpFlow {
    fn drop(&mut self) {
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        // A newer flow may have replaced this entry; only remove our own.
        if table
            .get(&self.peer)
            .is_some_and(|q| Arc::ptr_eq(q, &self.queue))
        {
            table.remove(&self.peer);
        }
    }
}
