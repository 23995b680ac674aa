// SPDX-License-Identifier: GPL-3.0-only

use anyhow::{Context, Result};
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn default_filter() -> EnvFilter {
    EnvFilter::new(if cfg!(debug_assertions) {
        "cosmic_xrandr=debug,cosmic_xrandr_config=debug,warn"
    } else {
        "cosmic_xrandr=info,cosmic_xrandr_config=info,error"
    })
}

/// Logs to stderr and, if available, to the journal. `RUST_LOG` overrides
/// the default filter.
pub fn init_logger() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter());
    let journald = match tracing_journald::layer() {
        Ok(layer) => Some(layer),
        Err(err) => {
            // not running under systemd
            eprintln!("Journald unavailable, logging to stderr only: {}", err);
            None
        }
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_writer(std::io::stderr),
        )
        .with(journald)
        .try_init()
        .context("Failed to install the logger")?;
    log_panics::init();

    info!("Version: {}", std::env!("CARGO_PKG_VERSION"));
    if cfg!(debug_assertions) {
        debug!(
            "Debug build ({})",
            std::option_env!("GIT_HASH").unwrap_or("Unknown")
        );
    }
    if std::env::var_os("DISPLAY").is_none() {
        warn!("DISPLAY is not set, connecting to the X server will likely fail");
    }

    Ok(())
}
