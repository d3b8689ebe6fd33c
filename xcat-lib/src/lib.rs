#![forbid(unsafe_code)]

//! xcat: a two-party encrypted tunnel. The client end accepts local TCP
//! connections and UDP flows; the server end re-emits them to a configured
//! upstream. Everything between the two ends travels in Ray frames over
//! per-flow authenticated data links, allocated through a long-lived
//! control link.

pub mod client;
pub mod config;
pub mod ctrl;
pub mod error;
pub mod net;
pub mod ray;
pub mod server;
pub mod stat;
pub mod telemetry;

pub use config::{load_from_path, Config, FileConfig, Mode};
pub use error::{Error, Result};
