use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

pub const DEFAULT_LISTEN: &str = ":1080";
pub const DEFAULT_LINK_TIMEOUT_SECS: u64 = 15;
pub const DEFAULT_CTRL_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_UDP_TIMEOUT_SECS: u64 = 180;

/// Run mode, picking which half of the tunnel this process is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Server,
    Client,
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "server" => Ok(Mode::Server),
            "client" => Ok(Mode::Client),
            other => Err(Error::Config(format!("unknown mode {other:?}"))),
        }
    }
}

/// Resolved runtime configuration, assembled from the CLI and an optional
/// TOML file.
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    /// Server host: the address clients dial, and the address the server
    /// binds its control and data links on.
    pub host: String,
    /// Control-link port on `host`.
    pub port: u16,
    pub user: String,
    pub password: String,
    /// Client-mode ingress address, `"host:port"`.
    pub listen: String,
    /// Server-mode upstream target, `"host:port"`.
    pub upstream: Option<String>,
    /// Deadline for a data-link listener to see its one connection.
    pub link_timeout_secs: u64,
    /// Per-operation deadline on the control link; also bounds dials and
    /// handshakes.
    pub ctrl_timeout_secs: u64,
    /// UDP flow activity timeout. 0 disables the timer.
    pub udp_timeout_secs: u64,
}

impl Config {
    pub fn link_timeout(&self) -> Duration {
        Duration::from_secs(self.link_timeout_secs)
    }

    pub fn ctrl_timeout(&self) -> Duration {
        Duration::from_secs(self.ctrl_timeout_secs)
    }

    pub fn udp_timeout(&self) -> Duration {
        Duration::from_secs(self.udp_timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(Error::Config("port must be non-zero".into()));
        }
        match self.mode {
            Mode::Client => {
                if self.host.is_empty() {
                    return Err(Error::Config("client mode requires a server host".into()));
                }
                split_host_port(&self.listen)?;
            }
            Mode::Server => {
                let upstream = self
                    .upstream
                    .as_deref()
                    .ok_or_else(|| Error::Config("server mode requires an upstream".into()))?;
                let (host, port) = split_host_port(upstream)?;
                if host.is_empty() || port == 0 {
                    return Err(Error::Config(format!("invalid upstream {upstream:?}")));
                }
            }
        }
        Ok(())
    }
}

/// Optional values read from a TOML config file. CLI flags override these.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub mode: Option<Mode>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub listen: Option<String>,
    pub upstream: Option<String>,
    pub link_timeout_secs: Option<u64>,
    pub ctrl_timeout_secs: Option<u64>,
    pub udp_timeout_secs: Option<u64>,
}

pub fn load_from_path<P: AsRef<Path>>(p: P) -> Result<FileConfig> {
    let txt = fs::read_to_string(p)
        .map_err(|e| Error::Config(format!("failed to read config file: {e}")))?;
    toml::from_str(&txt).map_err(|e| Error::Config(format!("failed to parse config: {e}")))
}

/// Split `"host:port"` into its parts. The host may be empty (`":1080"`,
/// meaning every interface) or bracketed IPv6 (`"[::1]:1080"`). A `tcp://`
/// scheme prefix is accepted; any other scheme is rejected.
pub fn split_host_port(addr: &str) -> Result<(String, u16)> {
    let addr = match addr.split_once("://") {
        Some(("tcp", rest)) => rest,
        Some((scheme, _)) => return Err(Error::UnknownNetwork(scheme.to_string())),
        None => addr,
    };
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| Error::Config(format!("missing port in address {addr:?}")))?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    let port = port
        .parse::<u16>()
        .map_err(|_| Error::Config(format!("invalid port in address {addr:?}")))?;
    Ok((host.to_string(), port))
}
