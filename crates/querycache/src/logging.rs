use std::env;

use sentry::integrations::tracing::EventFilter;
use tracing::Level;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::fmt::{MakeWriter, fmt};
use tracing_subscriber::prelude::*;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::{Config, LogFormat};

/// The `RUST_LOG` equivalent of a configured level.
///
/// Dependencies stay at `INFO` when this crate is asked to be more verbose.
fn default_filter(level: LevelFilter) -> &'static str {
    match level {
        LevelFilter::TRACE => "INFO,querycache=TRACE",
        LevelFilter::DEBUG => "INFO,querycache=DEBUG",
        LevelFilter::INFO => "INFO",
        LevelFilter::WARN => "WARN",
        LevelFilter::ERROR => "ERROR",
        LevelFilter::OFF => "",
    }
}

/// Installs the global tracing subscriber described by `config.logging`.
///
/// `RUST_LOG` takes precedence over the configured level. Errors additionally become Sentry
/// events, warnings and infos Sentry logs.
///
/// # Safety
/// May set `RUST_BACKTRACE` through [`std::env::set_var`], so it must run before any other thread
/// is spawned.
pub unsafe fn init_logging(config: &Config) {
    if config.logging.enable_backtraces {
        // SAFETY: the caller guarantees no other thread exists yet.
        unsafe { env::set_var("RUST_BACKTRACE", "1") };
    }

    let filter = env::var("RUST_LOG")
        .unwrap_or_else(|_| default_filter(config.logging.level).to_owned());

    let fmt_layer = {
        let layer = tracing_subscriber::fmt::layer()
            .with_timer(UtcTime::rfc_3339())
            .with_target(true);

        match (config.logging.format, console::user_attended()) {
            (LogFormat::Auto, true) | (LogFormat::Pretty, _) => layer.pretty().boxed(),
            (LogFormat::Auto, false) | (LogFormat::Simplified, _) => {
                layer.compact().with_ansi(false).boxed()
            }
            (LogFormat::Json, _) => {
                init_json_logging(&filter, std::io::stdout);
                return;
            }
        }
    }
    .with_filter(EnvFilter::new(&filter));

    let sentry_layer =
        sentry::integrations::tracing::layer().event_filter(|md| sentry_filter(md.level()));

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(sentry_layer)
        .init();
}

/// What the Sentry layer makes of a tracing event.
///
/// Failed fetches are logged at `WARN` and escalated through an
/// [`ErrorReporter`](crate::ErrorReporter), so only `ERROR` becomes an event of its own.
fn sentry_filter(level: &Level) -> EventFilter {
    match *level {
        Level::ERROR => EventFilter::Event | EventFilter::Log,
        Level::WARN | Level::INFO => EventFilter::Log,
        Level::DEBUG | Level::TRACE => EventFilter::Ignore,
    }
}

/// Installs a JSON lines subscriber writing to `make_writer`.
pub fn init_json_logging<W>(env_filter: &str, make_writer: W)
where
    W: for<'writer> MakeWriter<'writer> + Send + Sync + 'static,
{
    fmt()
        .with_timer(UtcTime::rfc_3339())
        .with_target(true)
        .with_env_filter(env_filter)
        .json()
        .flatten_event(true)
        .with_current_span(true)
        .with_span_list(true)
        .with_file(true)
        .with_line_number(true)
        .with_writer(make_writer)
        .finish()
        .with(sentry::integrations::tracing::layer())
        .init();
}

/// Reports the error a binary is about to exit with.
///
/// Goes through tracing, so it reaches Sentry too. Falls back to stderr if no subscriber would
/// record it.
pub fn ensure_log_error(error: &anyhow::Error) {
    if Level::ERROR <= tracing::level_filters::STATIC_MAX_LEVEL
        && Level::ERROR <= LevelFilter::current()
    {
        tracing::error!(error = ?error, "exiting with error");
    } else {
        eprintln!("{error:?}");
    }
}
