// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Log sink configuration.
//!
//! Everything goes to the structured log file in the output directory;
//! errors are additionally mirrored to stderr so a failing run is visible
//! without opening the log.

use anyhow::Context as _;
use std::fs::File;
use std::io;
use std::sync::Arc;
use tracing::metadata::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;

/// Maps the CLI verbosity to a level filter.
pub fn level_for(verbosity: u8) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::ERROR,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

/// Enables tracing into the given log file. The CLI verbosity sets the
/// level, overridable per-target via `XCDA_LOG`. Module targets are
/// included only at the highest verbosity (debug plus references).
pub fn enable_tracing(log_file: File, verbosity: u8) -> anyhow::Result<()> {
    let filter = if let Ok(directives) = std::env::var("XCDA_LOG") {
        EnvFilter::try_new(directives).context("invalid XCDA_LOG")?
    } else {
        EnvFilter::default().add_directive(level_for(verbosity).into())
    };

    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_target(verbosity >= 3)
        .with_writer(Arc::new(log_file))
        .with_filter(filter);

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stderr)
        .with_filter(LevelFilter::ERROR);

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .try_init()
        .map_err(|err| anyhow::anyhow!(err).context("failed to enable tracing"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_levels() {
        assert_eq!(level_for(0), LevelFilter::ERROR);
        assert_eq!(level_for(1), LevelFilter::INFO);
        assert_eq!(level_for(2), LevelFilter::DEBUG);
        assert_eq!(level_for(3), LevelFilter::TRACE);
    }
}
