use std::env;

use mediacdn_service::config::{Config, LogFormat, LogLevel};
use sentry::integrations::tracing::EventFilter;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::prelude::*;

/// Crates whose logs follow the configured level. Everything else is capped at `INFO`.
const OWN_CRATES: &[&str] = &["mediacdn", "mediacdn_service"];

/// The `RUST_LOG` directives for a configured level.
///
/// The HTTP stack is noisy, so hyper and reqwest are held one level below ours.
fn default_directives(level: LogLevel) -> String {
    match level {
        LogLevel::Off => "off".to_owned(),
        LogLevel::Error => "error".to_owned(),
        LogLevel::Warn => "warn,hyper=error".to_owned(),
        LogLevel::Info => "info,hyper=warn,reqwest=warn".to_owned(),
        LogLevel::Debug | LogLevel::Trace => {
            let level = if level == LogLevel::Debug { "debug" } else { "trace" };
            let mut directives = "info".to_owned();
            for krate in OWN_CRATES {
                directives.push_str(&format!(",{krate}={level}"));
            }
            directives
        }
    }
}

/// Maps log levels to Sentry: errors are captured as events, warnings and infos are kept as
/// breadcrumbs for the next event.
fn sentry_event_filter(md: &tracing::Metadata<'_>) -> EventFilter {
    match *md.level() {
        tracing::Level::ERROR => EventFilter::Event,
        tracing::Level::WARN | tracing::Level::INFO => EventFilter::Breadcrumb,
        _ => EventFilter::Ignore,
    }
}

/// Installs the global subscriber as configured in `logging`.
///
/// An explicitly set `RUST_LOG` wins over `logging.level`.
///
/// # Safety
/// Sets `RUST_BACKTRACE` via [`std::env::set_var`], so this must run before any other thread is
/// spawned.
pub unsafe fn init_logging(config: &Config) {
    if config.logging.enable_backtraces {
        // SAFETY: forwarded to the caller.
        unsafe { env::set_var("RUST_BACKTRACE", "1") };
    }

    let directives =
        env::var("RUST_LOG").unwrap_or_else(|_| default_directives(config.logging.level));

    let base = tracing_subscriber::fmt::layer()
        .with_timer(UtcTime::rfc_3339())
        .with_target(true);
    let fmt_layer = match (config.logging.format, console::user_attended()) {
        (LogFormat::Pretty, _) | (LogFormat::Auto, true) => base.pretty().boxed(),
        (LogFormat::Simplified, _) | (LogFormat::Auto, false) => {
            base.compact().with_ansi(false).boxed()
        }
        (LogFormat::Json, _) => base
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(true)
            .with_file(true)
            .with_line_number(true)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(fmt_layer.with_filter(EnvFilter::new(directives)))
        .with(sentry::integrations::tracing::layer().event_filter(sentry_event_filter))
        .init();
}

/// Logs a fatal error, falling back to `stderr` when logging is not set up or muted.
pub fn ensure_log_error(error: &anyhow::Error) {
    let error_enabled = tracing::Level::ERROR <= tracing::level_filters::STATIC_MAX_LEVEL
        && tracing::Level::ERROR <= LevelFilter::current();
    if error_enabled {
        tracing::error!("{error:?}");
    } else {
        eprintln!("{error:?}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directives() {
        assert_eq!(default_directives(LogLevel::Off), "off");
        assert_eq!(
            EnvFilter::new(default_directives(LogLevel::Off)).max_level_hint(),
            Some(LevelFilter::OFF)
        );
        assert_eq!(
            default_directives(LogLevel::Info),
            "info,hyper=warn,reqwest=warn"
        );
        assert_eq!(
            default_directives(LogLevel::Debug),
            "info,mediacdn=debug,mediacdn_service=debug"
        );

        for level in [LogLevel::Off, LogLevel::Error, LogLevel::Warn, LogLevel::Trace] {
            assert!(EnvFilter::try_new(default_directives(level)).is_ok());
        }
    }
}
