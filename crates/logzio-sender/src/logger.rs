// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Tracing output for applications that have no subscriber of their own.
//!
//! Lines are prefixed with `LOGZIO_SENDER` so that the sender's diagnostics can
//! be told apart from the application's own logs:
//!
//! ```text
//! LOGZIO_SENDER | WARN | Logs queue reached its capacity (bytes: 1048576, records: unlimited), dropping logs until there is room
//! LOGZIO_SENDER | DEBUG | final_drain{log_type="rust"}: Final drain finished: Completed { delivered: 120, discarded: 0 }
//! ```
//!
//! Applications that already install a subscriber should skip [`init_tracing`];
//! everything the sender emits goes through the `tracing` macros either way.

use std::fmt;

use tracing::debug;
use tracing_core::{Event, Subscriber};
use tracing_subscriber::fmt::{
    format::{self, FormatEvent, FormatFields},
    FmtContext, FormattedFields,
};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

use crate::config::SenderConfig;
use crate::error::{Result, SenderError};

/// Event formatter producing `LOGZIO_SENDER | LEVEL | spans: message fields`.
#[derive(Debug, Clone, Copy)]
pub struct Formatter;

impl<S, N> FormatEvent<S, N> for Formatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        write!(&mut writer, "LOGZIO_SENDER | {} | ", event.metadata().level())?;

        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                write!(writer, "{}", span.name())?;

                let ext = span.extensions();
                if let Some(fields) = ext.get::<FormattedFields<N>>() {
                    if !fields.is_empty() {
                        write!(writer, "{{{fields}}}")?;
                    }
                }
                write!(writer, ": ")?;
            }
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Builds the filter directive used by [`init_tracing`].
///
/// HTTP stack internals are silenced; everything else logs at `level`.
pub fn env_filter(level: &str) -> Result<EnvFilter> {
    EnvFilter::try_new(format!("h2=off,hyper=off,rustls=off,{level}"))
        .map_err(|e| SenderError::parameter("log_level", e.to_string()))
}

/// Installs a global subscriber writing [`Formatter`] lines to stdout.
///
/// Does nothing (besides a debug line) when a global subscriber is already set.
pub fn init_tracing(level: &str) -> Result<()> {
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(env_filter(level)?)
        .event_format(Formatter)
        .finish();

    match tracing::subscriber::set_global_default(subscriber) {
        Ok(()) => debug!("Logging subsystem enabled"),
        Err(_) => debug!("A global tracing subscriber is already installed, keeping it"),
    }
    Ok(())
}

/// Installs the global subscriber at `config.log_level` and logs the sender
/// version.
pub fn init_from_config(config: &SenderConfig) -> Result<()> {
    init_tracing(&config.log_level)?;
    crate::log_build_info();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::{Arc, Mutex};
    use tracing::{info, info_span, warn};

    #[derive(Clone, Default)]
    struct Buffer(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Buffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Buffer {
        fn contents(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    fn capture(f: impl FnOnce()) -> String {
        let buffer = Buffer::default();
        let writer = buffer.clone();
        let subscriber = tracing_subscriber::fmt::Subscriber::builder()
            .with_env_filter(env_filter("debug").unwrap())
            .event_format(Formatter)
            .with_writer(move || writer.clone())
            .finish();
        tracing::subscriber::with_default(subscriber, f);
        buffer.contents()
    }

    #[test]
    fn test_format_prefix_and_level() {
        let output = capture(|| warn!("queue full"));
        assert_eq!(output, "LOGZIO_SENDER | WARN | queue full\n");
    }

    #[test]
    fn test_format_includes_spans_and_fields() {
        let output = capture(|| {
            let span = info_span!("drain", log_type = "rust");
            let _guard = span.enter();
            info!(records = 3, "Delivered batch");
        });
        assert!(output.starts_with("LOGZIO_SENDER | INFO | drain{log_type="));
        assert!(output.contains("}: Delivered batch"));
        assert!(output.contains("records=3"));
    }

    #[test]
    fn test_env_filter_rejects_garbage() {
        assert!(env_filter("info").is_ok());
        assert!(env_filter("logzio_sender=verbose").is_err());
    }

    #[test]
    fn test_init_from_config_uses_configured_level() {
        let bad = SenderConfig {
            log_level: "logzio_sender=verbose".to_string(),
            ..SenderConfig::new("token")
        };
        assert!(init_from_config(&bad).is_err());

        let config = SenderConfig {
            log_level: "debug".to_string(),
            ..SenderConfig::new("token")
        };
        assert!(init_from_config(&config).is_ok());
        // A second call keeps the installed subscriber
        assert!(init_from_config(&config).is_ok());
    }
}
