//! Byte-stream view over a sequence of Ray packets.
//!
//! [`RayStream`] wraps any `AsyncRead + AsyncWrite` transport and presents
//! plaintext I/O. Reads decapsulate one packet at a time, re-buffering
//! plaintext the caller's buffer could not hold; writes split input into
//! packets of at most [`MAX_CONTENT_SIZE`] bytes. Both halves keep partial
//! wire state across calls, so a short read or write on the transport
//! resumes where it left off.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use aes::cipher::KeyInit;
use aes::Aes256;
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::codec::{
    block_count, checksum, decrypt_blocks, encap_with, BLOCK_SIZE, CHECKSUM_SIZE, MAX_CONTENT_SIZE,
};
use super::handshake::SessionKeys;
use super::RayError;

fn integrity_error() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, RayError::IntegrityCompromised)
}

/// Decapsulating reader half. Holds the wire bytes of the packet currently
/// being assembled plus any plaintext left over from the previous packet.
pub struct RayReadHalf<R> {
    inner: R,
    cipher: Aes256,
    /// Wire buffer for the in-flight packet. Once the first block is
    /// complete it is deciphered in place, so bytes `0..16` hold plaintext
    /// while the remainder is still ciphertext.
    wire: Vec<u8>,
    filled: usize,
    /// Target length of `wire`: one block until `SZ` is known, then the
    /// whole packet.
    need: usize,
    sized: bool,
    leftover: BytesMut,
    fatal: bool,
}

impl<R> RayReadHalf<R> {
    fn new(inner: R, key: &[u8; 32]) -> Self {
        Self {
            inner,
            cipher: Aes256::new(key.into()),
            wire: vec![0u8; BLOCK_SIZE],
            filled: 0,
            need: BLOCK_SIZE,
            sized: false,
            leftover: BytesMut::new(),
            fatal: false,
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for RayReadHalf<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.fatal {
            return Poll::Ready(Err(integrity_error()));
        }
        if out.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        if !this.leftover.is_empty() {
            let n = out.remaining().min(this.leftover.len());
            out.put_slice(&this.leftover.split_to(n));
            return Poll::Ready(Ok(()));
        }

        loop {
            while this.filled < this.need {
                let mut rb = ReadBuf::new(&mut this.wire[this.filled..this.need]);
                match Pin::new(&mut this.inner).poll_read(cx, &mut rb) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Ready(Ok(())) => {
                        let n = rb.filled().len();
                        if n == 0 {
                            // EOF at a packet boundary is a clean end of
                            // stream; inside a packet it is truncation.
                            return if this.filled == 0 && !this.sized {
                                Poll::Ready(Ok(()))
                            } else {
                                Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()))
                            };
                        }
                        this.filled += n;
                    }
                }
            }

            if !this.sized {
                decrypt_blocks(&this.cipher, &mut this.wire[..BLOCK_SIZE]);
                let sz = u16::from_be_bytes([this.wire[0], this.wire[1]]) as usize;
                this.need = block_count(sz) * BLOCK_SIZE + CHECKSUM_SIZE;
                this.wire.resize(this.need, 0);
                this.sized = true;
                continue;
            }

            let blocks = this.need - CHECKSUM_SIZE;
            decrypt_blocks(&this.cipher, &mut this.wire[BLOCK_SIZE..blocks]);
            if checksum(&this.wire[..blocks])[..] != this.wire[blocks..] {
                this.fatal = true;
                return Poll::Ready(Err(integrity_error()));
            }

            let sz = u16::from_be_bytes([this.wire[0], this.wire[1]]) as usize;
            let content = &this.wire[2..2 + sz];
            let n = out.remaining().min(content.len());
            out.put_slice(&content[..n]);
            if n < content.len() {
                this.leftover.extend_from_slice(&content[n..]);
            }

            this.wire.clear();
            this.wire.resize(BLOCK_SIZE, 0);
            this.filled = 0;
            this.need = BLOCK_SIZE;
            this.sized = false;

            // An empty packet carries nothing to hand out; keep reading
            // rather than reporting EOF.
            if n > 0 {
                return Poll::Ready(Ok(()));
            }
        }
    }
}

/// Encapsulating writer half. `pending` is the wire image currently being
/// pushed into the transport; `claim` is the plaintext length it stands for,
/// reported to the caller only once the image is fully accepted.
pub struct RayWriteHalf<W> {
    inner: W,
    cipher: Aes256,
    pending: Vec<u8>,
    written: usize,
    claim: usize,
}

impl<W> RayWriteHalf<W> {
    fn new(inner: W, key: &[u8; 32]) -> Self {
        Self {
            inner,
            cipher: Aes256::new(key.into()),
            pending: Vec::new(),
            written: 0,
            claim: 0,
        }
    }
}

impl<W: AsyncWrite + Unpin> RayWriteHalf<W> {
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.written < self.pending.len() {
            match Pin::new(&mut self.inner).poll_write(cx, &self.pending[self.written..]) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Ready(Ok(0)) => {
                    return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
                }
                Poll::Ready(Ok(n)) => self.written += n,
            }
        }
        self.pending.clear();
        self.written = 0;
        Poll::Ready(Ok(()))
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for RayWriteHalf<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        loop {
            match this.poll_drain(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Ready(Ok(())) => {}
            }
            if this.claim > 0 {
                let n = this.claim;
                this.claim = 0;
                return Poll::Ready(Ok(n));
            }
            if buf.is_empty() {
                return Poll::Ready(Ok(0));
            }

            let chunk = buf.len().min(MAX_CONTENT_SIZE);
            let wire = match encap_with(&this.cipher, &buf[..chunk]) {
                Ok(w) => w,
                Err(e) => {
                    return Poll::Ready(Err(io::Error::new(io::ErrorKind::InvalidInput, e)))
                }
            };

            this.pending = wire;
            this.claim = chunk;
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.poll_drain(cx) {
            Poll::Ready(Ok(())) => Pin::new(&mut this.inner).poll_flush(cx),
            other => other,
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.poll_drain(cx) {
            Poll::Ready(Ok(())) => Pin::new(&mut this.inner).poll_shutdown(cx),
            other => other,
        }
    }
}

/// Plaintext stream over a framed transport. Splittable into independently
/// owned halves so each relay direction can run as its own task.
pub struct RayStream<T> {
    read: RayReadHalf<tokio::io::ReadHalf<T>>,
    write: RayWriteHalf<tokio::io::WriteHalf<T>>,
}

impl<T: AsyncRead + AsyncWrite> RayStream<T> {
    pub fn new(io: T, keys: &SessionKeys) -> Self {
        let (r, w) = tokio::io::split(io);
        Self {
            read: RayReadHalf::new(r, &keys.read_key),
            write: RayWriteHalf::new(w, &keys.write_key),
        }
    }

    pub fn into_split(
        self,
    ) -> (
        RayReadHalf<tokio::io::ReadHalf<T>>,
        RayWriteHalf<tokio::io::WriteHalf<T>>,
    ) {
        (self.read, self.write)
    }
}

impl<T: AsyncRead + AsyncWrite> AsyncRead for RayStream<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().read).poll_read(cx, out)
    }
}

impl<T: AsyncRead + AsyncWrite> AsyncWrite for RayStream<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().write).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().write).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().write).poll_shutdown(cx)
    }
}
