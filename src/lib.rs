//! Media-plane library: a selective-forwarding server and a client media
//! engine sharing one wire protocol.

pub mod config;
pub mod error;
pub mod proto;

pub mod client;
pub mod server;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Daily-rolling file logging plus a panic hook routed through `tracing`,
/// Both binaries call this once at
/// startup; the returned guard must be held for the process lifetime or the
/// non-blocking writer stops flushing.
pub fn init_logging(log_dir: &str, log_level: &str, file_prefix: &str) -> anyhow::Result<tracing_appender::non_blocking::WorkerGuard> {
    let file_appender = tracing_appender::rolling::daily(log_dir, format!("{file_prefix}.log"));
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_timer(fmt::time::OffsetTime::local_rfc_3339().unwrap())
                .with_ansi(false),
        )
        .with(EnvFilter::from_default_env().add_directive(log_level.parse()?))
        .init();

    std::panic::set_hook(Box::new(|panic_info| {
        tracing::error!("panic occurred: {}", panic_info);
    }));

    Ok(guard)
}
