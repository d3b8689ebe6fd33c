//! Optional statistics sink for post-hoc flow analysis.
//!
//! When enabled, milestone events are appended to a named temp file as
//! `"{kind} {id} {ms_since_start} {event}"` lines. Kinds: `c` control link,
//! `t` TCP flow, `u` UDP flow. Events are single letters: `n` new, `p` port
//! query, `P` port granted, `l` listener opened, `L` listener expired, `c`
//! connected, `r` relay started, `R` relay/flow ended, `B` broken.
//!
//! Disabled (the default) every call is a no-op.

use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock, PoisonError};
use std::time::Instant;

use tracing::error;

static SINK: OnceLock<Sink> = OnceLock::new();
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

struct Sink {
    file: Mutex<File>,
    birth: Instant,
}

/// Create the statistics temp file and start recording. Returns its path.
pub fn init() -> io::Result<PathBuf> {
    let tmp = tempfile::Builder::new().prefix("xcat-").tempfile()?;
    let (file, path) = tmp.keep().map_err(|e| e.error)?;
    let sink = Sink {
        file: Mutex::new(file),
        birth: Instant::now(),
    };
    if SINK.set(sink).is_err() {
        return Err(io::Error::other("statistics sink already initialized"));
    }
    Ok(path)
}

/// Monotonic id for a new flow or link.
pub fn next_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Record one event. No-op unless [`init`] ran.
pub fn event(kind: &str, id: u64, event: &str) {
    let Some(sink) = SINK.get() else {
        return;
    };
    let ms = sink.birth.elapsed().as_millis();
    let mut file = sink.file.lock().unwrap_or_else(PoisonError::into_inner);
    if let Err(e) = writeln!(file, "{kind} {id} {ms} {event}") {
        error!(error = %e, "failed to write statistics event");
    }
}
