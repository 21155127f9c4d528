use colored::*;
use std::fmt;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

/// A tracing event formatter producing `timestamp: message` lines, colored
/// by level.
///
/// Worker processes use the same formatter with a `[worker <pid>]` tag so
/// their stderr, which the controller inherits, stays distinguishable.
pub struct ColorizedFormatter {
    tag: Option<String>,
}

impl ColorizedFormatter {
    pub fn new() -> Self {
        Self { tag: None }
    }

    pub fn tagged(tag: impl Into<String>) -> Self {
        Self {
            tag: Some(tag.into()),
        }
    }
}

impl Default for ColorizedFormatter {
    fn default() -> Self {
        Self::new()
    }
}

impl<S, N> FormatEvent<S, N> for ColorizedFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        // Buffer the formatted fields to apply color to the entire line.
        let mut buffer = String::new();
        if let Some(tag) = &self.tag {
            buffer.push_str(tag);
            buffer.push(' ');
        }
        let mut buf_writer = Writer::new(&mut buffer);
        ctx.format_fields(buf_writer.by_ref(), event)?;

        let colored_output = match *event.metadata().level() {
            Level::INFO => buffer.white(),
            Level::WARN => buffer.yellow(),
            Level::ERROR => buffer.red(),
            Level::DEBUG => buffer.blue(),
            Level::TRACE => buffer.purple(),
        };

        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        writeln!(writer, "{}: {}", timestamp, colored_output)
    }
}

/// Install the global subscriber.
///
/// `RUST_LOG` wins when set; otherwise `verbose` selects debug over info.
/// Workers write to stderr because their stdout carries the handshake.
pub fn init(verbose: bool, worker: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let formatter = if worker {
        ColorizedFormatter::tagged(format!("[worker {}]", std::process::id()))
    } else {
        ColorizedFormatter::new()
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .event_format(formatter)
        .init();
}
