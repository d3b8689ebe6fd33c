#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};
use xcat_lib::config::{
    self, Config, FileConfig, Mode, DEFAULT_CTRL_TIMEOUT_SECS, DEFAULT_LINK_TIMEOUT_SECS,
    DEFAULT_LISTEN, DEFAULT_UDP_TIMEOUT_SECS,
};
use xcat_lib::{client, server, stat, telemetry};

#[derive(Parser, Debug)]
#[command(version, about = "Encrypted TCP/UDP tunnel")]
struct Cli {
    /// Path to a TOML configuration file; flags override its values
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Run mode: server or client
    #[arg(short, long)]
    mode: Option<Mode>,

    /// Server host (the address clients dial; the bind address in server mode)
    #[arg(short = 'H', long)]
    host: Option<String>,

    /// Control link port on the server host
    #[arg(short, long)]
    port: Option<u16>,

    /// Username for authentication
    #[arg(short = 'U', long, env = "XCAT_USER")]
    user: Option<String>,

    /// Password for authentication
    #[arg(short = 'P', long, env = "XCAT_PASSWORD")]
    password: Option<String>,

    /// Listening address in client mode, host:port
    #[arg(short, long)]
    listen: Option<String>,

    /// Upstream address in server mode, host:port
    #[arg(short = 'u', long)]
    upstream: Option<String>,

    /// Data link listen timeout in seconds
    #[arg(long, value_name = "SECS")]
    link_timeout: Option<u64>,

    /// Control link operation timeout in seconds
    #[arg(long, value_name = "SECS")]
    ctrl_timeout: Option<u64>,

    /// UDP flow activity timeout in seconds, 0 disables
    #[arg(long, value_name = "SECS")]
    udp_timeout: Option<u64>,

    /// Log level: 0 error, 1 warn, 2 info, 3 debug
    #[arg(long, default_value_t = 2)]
    log_level: u8,

    /// Record flow statistics to a temp file
    #[arg(long)]
    stat: bool,
}

fn assemble(cli: Cli, file: FileConfig) -> Result<Config, xcat_lib::Error> {
    let mode = cli
        .mode
        .or(file.mode)
        .ok_or_else(|| xcat_lib::Error::Config("mode is required".into()))?;
    let cfg = Config {
        mode,
        host: cli.host.or(file.host).unwrap_or_default(),
        port: cli.port.or(file.port).unwrap_or(0),
        user: cli.user.or(file.user).unwrap_or_default(),
        password: cli.password.or(file.password).unwrap_or_default(),
        listen: cli
            .listen
            .or(file.listen)
            .unwrap_or_else(|| DEFAULT_LISTEN.to_string()),
        upstream: cli.upstream.or(file.upstream),
        link_timeout_secs: cli
            .link_timeout
            .or(file.link_timeout_secs)
            .unwrap_or(DEFAULT_LINK_TIMEOUT_SECS),
        ctrl_timeout_secs: cli
            .ctrl_timeout
            .or(file.ctrl_timeout_secs)
            .unwrap_or(DEFAULT_CTRL_TIMEOUT_SECS),
        udp_timeout_secs: cli
            .udp_timeout
            .or(file.udp_timeout_secs)
            .unwrap_or(DEFAULT_UDP_TIMEOUT_SECS),
    };
    cfg.validate()?;
    Ok(cfg)
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    telemetry::init_tracing(cli.log_level);

    let file = match &cli.config {
        Some(path) => match config::load_from_path(path) {
            Ok(file) => file,
            Err(err) => {
                error!(%err, "failed to load configuration");
                std::process::exit(1);
            }
        },
        None => FileConfig::default(),
    };
    let with_stat = cli.stat;
    let cfg = match assemble(cli, file) {
        Ok(cfg) => Arc::new(cfg),
        Err(err) => {
            error!(%err, "invalid configuration");
            std::process::exit(1);
        }
    };

    if with_stat {
        match stat::init() {
            Ok(path) => info!(path = %path.display(), "recording statistics"),
            Err(err) => {
                error!(%err, "failed to create statistics file");
                std::process::exit(1);
            }
        }
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown_tx.send(true);
        }
    });

    let result = match cfg.mode {
        Mode::Server => {
            info!("server starting");
            server::run(cfg, shutdown_rx)
                .await
                .map_err(|e| e.to_string())
        }
        Mode::Client => {
            info!("client starting");
            client::run(cfg, shutdown_rx)
                .await
                .map_err(|e| e.to_string())
        }
    };

    if let Err(err) = result {
        error!(%err, "exited with error");
        std::process::exit(1);
    }
}
