//! Log output setup
//!
//! Hosts embedding the bridge usually install their own subscriber; [`init`]
//! is for the `slink` binary and for hosts that want the default format.

use once_cell::sync::OnceCell;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LoggingConfig;

static INSTALLED: OnceCell<bool> = OnceCell::new();

/// Build the filter: `RUST_LOG` first, then the configured directive
pub fn env_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.filter))
        .unwrap_or_else(|_| EnvFilter::new("warn"))
}

/// Install a stderr `fmt` subscriber
///
/// Only the first call has an effect. Returns whether this process now logs
/// through the subscriber installed here (false if another one was already
/// set globally).
pub fn init(config: &LoggingConfig) -> bool {
    *INSTALLED.get_or_init(|| {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_ansi(config.ansi)
                    .with_writer(std::io::stderr),
            )
            .with(env_filter(config))
            .try_init()
            .is_ok()
    })
}
