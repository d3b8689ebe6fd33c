//! Client side of the control link.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::ray::{self, RayConn, RayError};

use super::{LinkKind, CONNECT_RETRIES, GET_PORT_RETRIES};

/// The client's handle on the control link. The whole get-port operation is
/// serialized under one lock, so replies pair with commands FIFO even with
/// concurrent callers. The link is rebuilt on demand after a failure.
pub struct ControlLink {
    addr: String,
    port: u16,
    user: Vec<u8>,
    password: Vec<u8>,
    timeout: Duration,
    conn: Mutex<Option<RayConn>>,
    /// Consecutive failed connect rounds; gates log severity only.
    connect_failures: AtomicU32,
}

impl std::fmt::Debug for ControlLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlLink")
            .field("addr", &self.addr)
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}

impl ControlLink {
    /// Connect the control link eagerly. Startup fails if the server is
    /// unreachable or the credentials are rejected.
    pub async fn establish(
        addr: &str,
        port: u16,
        user: &[u8],
        password: &[u8],
        timeout: Duration,
    ) -> Result<Self, RayError> {
        let link = Self {
            addr: addr.to_string(),
            port,
            user: user.to_vec(),
            password: password.to_vec(),
            timeout,
            conn: Mutex::new(None),
            connect_failures: AtomicU32::new(0),
        };
        {
            let mut slot = link.conn.lock().await;
            link.connect_locked(&mut slot).await?;
        }
        Ok(link)
    }

    /// Ask the server to open one ephemeral data-link port of `kind`.
    pub async fn get_port(&self, kind: LinkKind) -> Result<u16, RayError> {
        let mut slot = self.conn.lock().await;
        debug!(addr = %self.addr, ?kind, "querying data link port");

        let mut last_err = None;
        for attempt in 0..=GET_PORT_RETRIES {
            if attempt != 0 {
                warn!(
                    addr = %self.addr,
                    attempt,
                    retries = GET_PORT_RETRIES,
                    "port query failed, retrying"
                );
            }

            if let Err(e) = self.connect_locked(&mut slot).await {
                error!(addr = %self.addr, "aborting port query, control link is down");
                return Err(e);
            }
            let Some(conn) = slot.as_mut() else {
                continue;
            };

            let op = async {
                conn.stream.write_all(&[kind as u8]).await?;
                let mut reply = [0u8; 2];
                conn.stream.read_exact(&mut reply).await?;
                Ok::<u16, std::io::Error>(u16::from_be_bytes(reply))
            };
            let outcome = tokio::time::timeout(self.timeout, op).await;
            match outcome {
                Ok(Ok(port)) => {
                    debug!(addr = %self.addr, port, "got data link port");
                    return Ok(port);
                }
                Ok(Err(e)) => {
                    warn!(addr = %self.addr, error = %e, "control link broken");
                    *slot = None;
                    last_err = Some(RayError::Io(e));
                }
                Err(_) => {
                    warn!(addr = %self.addr, "port query timed out");
                    *slot = None;
                    last_err = Some(RayError::Io(std::io::ErrorKind::TimedOut.into()));
                }
            }
        }

        error!(
            addr = %self.addr,
            retries = GET_PORT_RETRIES,
            "port query failed after all retries"
        );
        Err(last_err.unwrap_or_else(|| RayError::Io(std::io::ErrorKind::BrokenPipe.into())))
    }

    async fn connect_locked(&self, slot: &mut Option<RayConn>) -> Result<(), RayError> {
        if slot.is_some() {
            return Ok(());
        }

        let mut last_err = None;
        for attempt in 0..=CONNECT_RETRIES {
            if attempt != 0 {
                warn!(
                    addr = %self.addr,
                    attempt,
                    retries = CONNECT_RETRIES,
                    "control link connect failed, retrying"
                );
            }
            match ray::connect(&self.addr, self.port, &self.user, &self.password, self.timeout)
                .await
            {
                Ok(conn) => {
                    self.connect_failures.store(0, Ordering::Relaxed);
                    info!(addr = %self.addr, conn = %conn.conn_str(), "control link connected");
                    *slot = Some(conn);
                    return Ok(());
                }
                Err(e) => last_err = Some(e),
            }
        }

        let err =
            last_err.unwrap_or_else(|| RayError::Io(std::io::ErrorKind::ConnectionRefused.into()));
        // Only the first failing round after a success logs loudly.
        if self.connect_failures.fetch_add(1, Ordering::Relaxed) == 0 {
            error!(addr = %self.addr, error = %err, "failed to connect control link");
        } else {
            debug!(addr = %self.addr, error = %err, "control link still unreachable");
        }
        Err(err)
    }
}
