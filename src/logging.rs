//! Console logging.
//!
//! Log lines look like `[🥑Abacate CLI - 19/10/2026, 14:03:12] message`. The
//! brand and the time can each be turned off; with both off the bracket is
//! dropped entirely.

use chrono::Local;
use std::fmt;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const BRAND: &str = "🥑Abacate CLI";

#[derive(Debug, Clone, Copy)]
pub struct LogConfig {
    /// Emit log lines at all
    pub enabled: bool,
    /// Include the brand in the prefix
    pub prefix: bool,
    /// Include the local time in the prefix
    pub time: bool,
    pub verbose: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            prefix: true,
            time: true,
            verbose: false,
        }
    }
}

/// Build the line prefix, including the trailing space when non-empty
pub fn line_prefix(brand: bool, time: Option<&str>) -> String {
    match (brand, time) {
        (true, Some(time)) => format!("[{} - {}] ", BRAND, time),
        (true, None) => format!("[{}] ", BRAND),
        (false, Some(time)) => format!("[{}] ", time),
        (false, None) => String::new(),
    }
}

/// Event formatter printing the branded prefix followed by the message
pub struct AbacateFormat {
    brand: bool,
    time: bool,
}

impl AbacateFormat {
    pub fn new(config: &LogConfig) -> Self {
        Self {
            brand: config.prefix,
            time: config.time,
        }
    }
}

impl<S, N> FormatEvent<S, N> for AbacateFormat
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
        let time = self
            .time
            .then(|| Local::now().format("%d/%m/%Y, %H:%M:%S").to_string());
        write!(writer, "{}", line_prefix(self.brand, time.as_deref()))?;

        let level = *event.metadata().level();
        if level != Level::INFO {
            write!(writer, "{} ", level)?;
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Install the global subscriber. With logging disabled nothing is installed.
pub fn init(config: &LogConfig) {
    if !config.enabled {
        return;
    }

    let level = if config.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("warn,{}={}", env!("CARGO_CRATE_NAME"), level))
    });

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().event_format(AbacateFormat::new(config)))
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_prefix_variants() {
        assert_eq!(
            line_prefix(true, Some("19/10/2026, 14:03:12")),
            "[🥑Abacate CLI - 19/10/2026, 14:03:12] "
        );
        assert_eq!(line_prefix(true, None), "[🥑Abacate CLI] ");
        assert_eq!(line_prefix(false, Some("14:03")), "[14:03] ");
        assert_eq!(line_prefix(false, None), "");
    }
}
