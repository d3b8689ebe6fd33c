//! The Ray encapsulation protocol: session negotiation plus a block-cipher
//! packet format usable as a byte stream or as discrete datagrams.

pub mod codec;
pub mod datagram;
pub mod handshake;
pub mod stream;

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpStream;

pub use codec::{Codec, MAX_CONTENT_SIZE, MAX_WIRE_SIZE};
pub use datagram::RayDatagram;
pub use handshake::{handshake, SessionKeys};
pub use stream::{RayReadHalf, RayStream, RayWriteHalf};

#[derive(Error, Debug)]
pub enum RayError {
    #[error("packet too large ({0} bytes)")]
    PacketTooLarge(usize),

    #[error("incorrect packet size ({0} bytes)")]
    IncorrectSize(usize),

    #[error("data integrity compromised")]
    IntegrityCompromised,

    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// A negotiated TCP connection plus the addresses captured before the
/// transport was wrapped.
pub struct RayConn {
    pub stream: RayStream<TcpStream>,
    pub local_addr: SocketAddr,
    pub peer_addr: SocketAddr,
}

impl RayConn {
    /// `"local<L-R>remote"`, the form connection log lines use.
    pub fn conn_str(&self) -> String {
        format!("{}<L-R>{}", self.local_addr, self.peer_addr)
    }
}

/// Dial `host:port` and negotiate within `deadline`. A zero deadline
/// disables the limit.
pub async fn connect(
    host: &str,
    port: u16,
    user: &[u8],
    password: &[u8],
    deadline: Duration,
) -> Result<RayConn, RayError> {
    let fut = async {
        let mut stream = TcpStream::connect((host, port)).await?;
        let local_addr = stream.local_addr()?;
        let peer_addr = stream.peer_addr()?;
        let keys = handshake(&mut stream, user, password).await?;
        Ok(RayConn {
            stream: RayStream::new(stream, &keys),
            local_addr,
            peer_addr,
        })
    };
    with_deadline(deadline, fut).await
}

/// Negotiate on an accepted connection within `deadline`.
pub async fn accept(
    mut stream: TcpStream,
    user: &[u8],
    password: &[u8],
    deadline: Duration,
) -> Result<RayConn, RayError> {
    let local_addr = stream.local_addr()?;
    let peer_addr = stream.peer_addr()?;
    let keys = with_deadline(deadline, handshake(&mut stream, user, password)).await?;
    Ok(RayConn {
        stream: RayStream::new(stream, &keys),
        local_addr,
        peer_addr,
    })
}

async fn with_deadline<T>(
    deadline: Duration,
    fut: impl std::future::Future<Output = Result<T, RayError>>,
) -> Result<T, RayError> {
    if deadline.is_zero() {
        return fut.await;
    }
    match tokio::time::timeout(deadline, fut).await {
        Ok(res) => res,
        Err(_) => Err(RayError::Io(io::ErrorKind::TimedOut.into())),
    }
}
