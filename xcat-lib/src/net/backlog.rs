//! Bounded drop-oldest queue.
//!
//! Both the UDP accept queue and each virtual flow's receive buffer need a
//! bound where the *oldest* entry gives way to the newest; tokio's mpsc can
//! only refuse the newest, so this is a mutex-guarded deque with a
//! [`Notify`] wakeup.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use tokio::sync::Notify;

pub(crate) struct Backlog<T> {
    queue: Mutex<VecDeque<T>>,
    notify: Notify,
    capacity: usize,
}

impl<T> Backlog<T> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity,
        }
    }

    /// Append `item`, returning the evicted oldest entry when full.
    pub(crate) fn push(&self, item: T) -> Option<T> {
        let evicted = {
            let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
            let evicted = if queue.len() == self.capacity {
                queue.pop_front()
            } else {
                None
            };
            queue.push_back(item);
            evicted
        };
        self.notify.notify_one();
        evicted
    }

    /// Wait for the next entry.
    pub(crate) async fn pop(&self) -> T {
        loop {
            let notified = self.notify.notified();
            if let Some(item) = self
                .queue
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop_front()
            {
                return item;
            }
            notified.await;
        }
    }
}
