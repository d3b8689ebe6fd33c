//! Multi-interface TCP listener.
//!
//! One logical `(host, port)` is bound on every IP the host resolves to.
//! When the port is ephemeral, the port picked by the first bind is reused
//! for the rest, so the logical listener has a single well-defined port.
//! Accepts fan in from one acceptor task per socket; closing aborts them
//! all, releasing every descriptor.

use std::io;
use std::net::{IpAddr, SocketAddr};

use tokio::net::{lookup_host, TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Resolve `(host, port)` to one address per distinct IP. An empty host
/// means the IPv4 wildcard.
pub(crate) async fn resolve_all(host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
    if host.is_empty() {
        return Ok(vec![SocketAddr::new(IpAddr::from([0, 0, 0, 0]), port)]);
    }
    let mut out: Vec<SocketAddr> = Vec::new();
    for addr in lookup_host((host, port)).await? {
        if !out.iter().any(|a| a.ip() == addr.ip()) {
            out.push(addr);
        }
    }
    if out.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("host {host:?} resolved to no addresses"),
        ));
    }
    Ok(out)
}

pub struct MultiListener {
    conns: mpsc::Receiver<io::Result<(TcpStream, SocketAddr)>>,
    acceptors: Vec<JoinHandle<()>>,
    local_addrs: Vec<SocketAddr>,
    port: u16,
}

impl MultiListener {
    /// Bind every resolved IP of `host` on `port`. If any bind fails, the
    /// sockets bound so far are released and the error is returned.
    pub async fn bind(host: &str, port: u16) -> io::Result<Self> {
        let addrs = resolve_all(host, port).await?;

        let mut listeners: Vec<TcpListener> = Vec::with_capacity(addrs.len());
        let mut port = port;
        for addr in addrs {
            let listener = TcpListener::bind(SocketAddr::new(addr.ip(), port)).await?;
            if port == 0 {
                port = listener.local_addr()?.port();
            }
            listeners.push(listener);
        }

        let mut local_addrs = Vec::with_capacity(listeners.len());
        for l in &listeners {
            local_addrs.push(l.local_addr()?);
        }

        let (tx, rx) = mpsc::channel(1);
        let acceptors = listeners
            .into_iter()
            .map(|listener| {
                let tx = tx.clone();
                tokio::spawn(async move {
                    loop {
                        let res = listener.accept().await;
                        let failed = res.is_err();
                        if tx.send(res).await.is_err() || failed {
                            return;
                        }
                    }
                })
            })
            .collect();

        Ok(Self {
            conns: rx,
            acceptors,
            local_addrs,
            port,
        })
    }

    /// Next connection accepted on any interface.
    pub async fn accept(&mut self) -> io::Result<(TcpStream, SocketAddr)> {
        match self.conns.recv().await {
            Some(res) => res,
            None => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "listener closed",
            )),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    /// Stop accepting and release every bound socket.
    pub fn close(&mut self) {
        for task in &self.acceptors {
            task.abort();
        }
        debug!(port = self.port, "listener closed");
    }
}

impl Drop for MultiListener {
    fn drop(&mut self) {
        for task in &self.acceptors {
            task.abort();
        }
    }
}
