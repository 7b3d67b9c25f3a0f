//! Log line formatting for portforward.
//!
//! Events render as `[MM-DD|HH:MM:SS] [LEVEL] <message>` on stdout. Each
//! level is gated at its own threshold through the `EnvFilter` installed by
//! [`init`].

use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

/// Timestamp layout of every log line.
const TIMESTAMP_FORMAT: &str = "%m-%d|%H:%M:%S";

/// Event formatter producing the bracketed timestamp/level prefix.
pub struct ForwardFormat;

impl<S, N> FormatEvent<S, N> for ForwardFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        write!(
            writer,
            "[{}] [{}] ",
            chrono::Local::now().format(TIMESTAMP_FORMAT),
            level_label(event.metadata().level()),
        )?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Maps a tracing level onto the printed label. TRACE has no counterpart in
/// the forwarder's level set and prints as DEBUG.
fn level_label(level: &Level) -> &'static str {
    if *level == Level::ERROR {
        "ERROR"
    } else if *level == Level::WARN {
        "WARN"
    } else if *level == Level::INFO {
        "INFO"
    } else {
        "DEBUG"
    }
}

/// Installs the global subscriber writing to stdout.
///
/// `log_level` comes from the CLI; an unparsable directive falls back to the
/// default `debug` threshold.
pub fn init(log_level: &str) {
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("debug"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stdout)
        .event_format(ForwardFormat)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_timestamp_format() {
        let t = chrono::Local.with_ymd_and_hms(2020, 9, 23, 14, 3, 5).unwrap();
        assert_eq!(t.format(TIMESTAMP_FORMAT).to_string(), "09-23|14:03:05");
    }

    #[test]
    fn test_level_labels() {
        assert_eq!(level_label(&Level::ERROR), "ERROR");
        assert_eq!(level_label(&Level::WARN), "WARN");
        assert_eq!(level_label(&Level::INFO), "INFO");
        assert_eq!(level_label(&Level::DEBUG), "DEBUG");
        assert_eq!(level_label(&Level::TRACE), "DEBUG");
    }
}
