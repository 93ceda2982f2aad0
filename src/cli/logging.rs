use anyhow::Result;
use colored::*;
use std::io::{self, IsTerminal};
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Filter directive for the crate at a verbosity level
///
/// `default_level` applies at verbosity zero, usually from the config file.
pub fn filter_directive(verbosity: u8, quiet: bool, default_level: &str) -> String {
    if quiet {
        return "error".to_string();
    }
    match verbosity {
        0 => format!("lora_merge={},warn", default_level),
        1 => "lora_merge=debug,info".to_string(),
        2 => "lora_merge=trace,debug".to_string(),
        _ => "trace".to_string(),
    }
}

pub fn init_logging(verbosity: u8, quiet: bool, json_output: bool, default_level: &str) -> Result<()> {
    // RUST_LOG wins unless the user asked for quiet output
    let env_filter = match std::env::var("RUST_LOG") {
        Ok(directive) if !quiet => EnvFilter::try_new(directive)?,
        _ => EnvFilter::try_new(filter_directive(verbosity, quiet, default_level))?,
    };

    let is_terminal = io::stderr().is_terminal();

    if json_output {
        // JSON output for machine parsing
        let json_layer = fmt::layer()
            .json()
            .with_writer(io::stderr)
            .with_current_span(true)
            .with_span_list(true)
            .with_filter(env_filter);

        tracing_subscriber::registry().with(json_layer).try_init()?;
    } else if is_terminal && !quiet {
        let fmt_layer = fmt::layer()
            .with_writer(io::stderr)
            .with_target(false)
            .with_ansi(true)
            .with_span_events(FmtSpan::CLOSE)
            .event_format(ColoredFormatter)
            .with_filter(env_filter);

        tracing_subscriber::registry().with(fmt_layer).try_init()?;
    } else {
        // Plain output for pipes and quiet mode
        let fmt_layer = fmt::layer()
            .with_writer(io::stderr)
            .with_target(false)
            .with_ansi(false)
            .without_time()
            .with_filter(env_filter);

        tracing_subscriber::registry().with(fmt_layer).try_init()?;
    }

    Ok(())
}

/// Custom formatter for colored terminal output
struct ColoredFormatter;

impl<S, N> fmt::FormatEvent<S, N> for ColoredFormatter
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    N: for<'a> fmt::FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &fmt::FmtContext<'_, S, N>,
        mut writer: fmt::format::Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let now = chrono::Local::now();
        write!(writer, "{} ", now.format("%H:%M:%S").to_string().dimmed())?;

        let level = match *event.metadata().level() {
            Level::ERROR => "ERROR".red().bold(),
            Level::WARN => "WARN".yellow().bold(),
            Level::INFO => "INFO".green().bold(),
            Level::DEBUG => "DEBUG".blue().bold(),
            Level::TRACE => "TRACE".purple().bold(),
        };
        write!(writer, "{} ", level)?;

        ctx.field_format().format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

/// Log a success message with green checkmark
pub fn success(message: &str) {
    if io::stdout().is_terminal() {
        println!("{} {}", "✓".green().bold(), message);
    } else {
        println!("SUCCESS: {}", message);
    }
}

/// Log an info message with blue info icon
pub fn info(message: &str) {
    if io::stdout().is_terminal() {
        println!("{} {}", "ℹ".blue().bold(), message);
    } else {
        println!("INFO: {}", message);
    }
}

/// Log a warning message with yellow warning icon
pub fn warning(message: &str) {
    if io::stderr().is_terminal() {
        eprintln!("{} {}", "⚠".yellow().bold(), message);
    } else {
        eprintln!("WARNING: {}", message);
    }
}
