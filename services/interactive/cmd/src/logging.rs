use std::fmt;
use std::io::IsTerminal;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::{format::Writer, FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

const RESET: &str = "\x1b[0m";
const CYAN: &str = "\x1b[36m";
const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[93m";
const RED: &str = "\x1b[91m";
const GRAY: &str = "\x1b[90m";

const COMPONENT_WIDTH: usize = 20;
const LEVEL_WIDTH: usize = 9;

/// Log with a `component` field, shown as `interactive-<component>`
#[macro_export]
macro_rules! component_info {
    ($component:expr, $($arg:tt)*) => {
        tracing::info!(component = $component, $($arg)*)
    };
}

#[macro_export]
macro_rules! component_warn {
    ($component:expr, $($arg:tt)*) => {
        tracing::warn!(component = $component, $($arg)*)
    };
}

#[macro_export]
macro_rules! component_debug {
    ($component:expr, $($arg:tt)*) => {
        tracing::debug!(component = $component, $($arg)*)
    };
}

/// Line format: `[timestamp] [component] [level] message key=value...`
///
/// Events from the library crates carry no `component` field; their column
/// is derived from the module that logged them, so
/// `interactive_session::socket` shows up as `interactive-socket`.
pub struct InteractiveLogFormatter {
    service_name: String,
    color: bool,
}

impl InteractiveLogFormatter {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            color: color_supported(),
        }
    }

    fn component_column(&self, component: Option<&str>, target: &str) -> String {
        let component = component.or_else(|| {
            target
                .rsplit("::")
                .next()
                .filter(|module| !module.is_empty() && *module != target)
        });

        let name = match component {
            Some(component) => format!("{}-{}", self.service_name, component),
            None => self.service_name.clone(),
        };
        fit(&name, COMPONENT_WIDTH)
    }

    fn paint(&self, code: &'static str) -> &'static str {
        if self.color {
            code
        } else {
            ""
        }
    }
}

fn level_style(level: &Level) -> (&'static str, &'static str) {
    match *level {
        Level::ERROR => ("✗ ERROR", RED),
        Level::WARN => ("⚠ WARN", YELLOW),
        Level::INFO => ("ℹ INFO", GREEN),
        Level::DEBUG => ("◦ DEBUG", GRAY),
        Level::TRACE => ("◦ TRACE", GRAY),
    }
}

/// Pad or truncate to exactly `width` characters
fn fit(text: &str, width: usize) -> String {
    if text.chars().count() > width {
        let mut truncated: String = text.chars().take(width - 1).collect();
        truncated.push('…');
        truncated
    } else {
        format!("{:<width$}", text, width = width)
    }
}

impl<S, N> FormatEvent<S, N> for InteractiveLogFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();
        let mut fields = EventFields::default();
        event.record(&mut fields);

        let (label, level_color) = level_style(metadata.level());
        let reset = self.paint(RESET);

        write!(
            writer,
            "{}[{}] [{}] [{}{}{}] {}",
            self.paint(CYAN),
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            self.component_column(fields.component.as_deref(), metadata.target()),
            self.paint(level_color),
            fit(label, LEVEL_WIDTH),
            reset,
            fields.message,
        )?;
        for (name, value) in &fields.extra {
            write!(writer, " {}={}", name, value)?;
        }
        writeln!(writer, "{}", reset)
    }
}

#[derive(Default)]
struct EventFields {
    message: String,
    component: Option<String>,
    extra: Vec<(&'static str, String)>,
}

impl EventFields {
    fn store(&mut self, name: &'static str, value: String) {
        match name {
            "message" => self.message = value,
            "component" => self.component = Some(value),
            _ => self.extra.push((name, value)),
        }
    }
}

impl tracing::field::Visit for EventFields {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
        self.store(field.name(), format!("{:?}", value));
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.store(field.name(), value.to_string());
    }
}

fn color_supported() -> bool {
    std::env::var_os("NO_COLOR").is_none()
        && std::env::var("TERM").map_or(true, |term| term != "dumb")
        && std::io::stdout().is_terminal()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain() -> InteractiveLogFormatter {
        InteractiveLogFormatter {
            service_name: "interactive".to_string(),
            color: false,
        }
    }

    #[test]
    fn test_component_column() {
        let formatter = plain();
        assert_eq!(formatter.component_column(None, "interactive"), fit("interactive", 20));
        assert_eq!(
            formatter.component_column(Some("cli"), "interactive"),
            fit("interactive-cli", 20)
        );
        assert_eq!(
            formatter.component_column(None, "interactive_session::socket"),
            fit("interactive-socket", 20)
        );

        let long = formatter.component_column(Some("reconnection"), "interactive");
        assert_eq!(long.chars().count(), COMPONENT_WIDTH);
        assert!(long.ends_with('…'));
    }

    #[test]
    fn test_color_only_when_enabled() {
        assert_eq!(plain().paint(RED), "");
        let colored = InteractiveLogFormatter {
            service_name: "interactive".to_string(),
            color: true,
        };
        assert_eq!(colored.paint(RED), RED);
        assert_eq!(level_style(&Level::WARN), ("⚠ WARN", YELLOW));
    }

    #[test]
    fn test_fit() {
        assert_eq!(fit("ℹ INFO", LEVEL_WIDTH).chars().count(), LEVEL_WIDTH);
        assert_eq!(fit("abcdef", 4), "abc…");
    }
}
