//! Tracing setup.

use tracing_subscriber::EnvFilter;

/// Map the numeric CLI log level onto a default filter directive.
pub fn level_directive(level: u8) -> &'static str {
    match level {
        0 => "error",
        1 => "warn",
        2 => "info",
        _ => "debug",
    }
}

/// Install the global subscriber. `RUST_LOG` overrides the CLI level.
pub fn init_tracing(level: u8) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_directive(level)));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}
