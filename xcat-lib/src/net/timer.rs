//! Activity timeout for datagram flows.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

/// Tracks the last activity on a flow. [`expired`](Self::expired) resolves
/// once `timeout` has elapsed since the last [`touch`](Self::touch); a zero
/// timeout never expires.
pub struct ActivityTimer {
    last: Mutex<Instant>,
    timeout: Duration,
}

impl ActivityTimer {
    pub fn new(timeout: Duration) -> Self {
        Self {
            last: Mutex::new(Instant::now()),
            timeout,
        }
    }

    /// Reset the countdown; called on every read or write.
    pub fn touch(&self) {
        *self.last.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    pub async fn expired(&self) {
        if self.timeout.is_zero() {
            std::future::pending::<()>().await;
        }
        loop {
            let deadline =
                *self.last.lock().unwrap_or_else(PoisonError::into_inner) + self.timeout;
            if Instant::now() >= deadline {
                return;
            }
            tokio::time::sleep_until(deadline).await;
        }
    }
}
