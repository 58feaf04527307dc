//! Logging configuration with journald support on Linux.
//!
//! Job state changes are logged through `tracing` with structured fields.
//! On Linux the subscriber tries systemd-journald first and falls back to a
//! daily rolling file; `LogTarget::Stderr` forces plain stderr output.

use anyhow::Result;
use std::path::PathBuf;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone)]
pub enum LogTarget {
    /// journald when available, otherwise a rolling file in the given
    /// directory (or the platform data dir).
    System(Option<PathBuf>),
    Stderr,
}

/// Initialize the logging system.
///
/// Log level comes from `VIDSIGHT_LOG` (e.g. `VIDSIGHT_LOG=debug`),
/// defaulting to `info`.
pub fn init(target: LogTarget) -> Result<()> {
    let env_filter = EnvFilter::try_from_env("VIDSIGHT_LOG")
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let log_dir = match target {
        LogTarget::Stderr => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .try_init()?;
            return Ok(());
        }
        LogTarget::System(log_dir) => log_dir,
    };

    #[cfg(target_os = "linux")]
    {
        if let Ok(journald_layer) = tracing_journald::layer() {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(journald_layer)
                .try_init()?;

            tracing::info!("Logging initialized with journald backend");
            return Ok(());
        }
    }

    let log_dir = log_dir.unwrap_or_else(|| {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("vidsight")
            .join("logs")
    });

    std::fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::daily(&log_dir, "vidsight.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    // Dropping the guard would stop the background writer.
    static GUARD: std::sync::OnceLock<tracing_appender::non_blocking::WorkerGuard> =
        std::sync::OnceLock::new();
    let _ = GUARD.set(guard);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
        .try_init()?;

    tracing::info!("Logging initialized with file backend at {:?}", log_dir);
    Ok(())
}
