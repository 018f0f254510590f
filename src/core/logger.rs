// Structured Logging for Book Feed
// tracing + tracing-subscriber, installed once per process

use tracing::Level;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::EnvFilter;
use std::sync::Once;

static INIT: Once = Once::new();

fn parse_level(log_level: &str) -> Level {
    match log_level.to_uppercase().as_str() {
        "TRACE" => Level::TRACE,
        "DEBUG" => Level::DEBUG,
        "INFO" => Level::INFO,
        "WARN" | "WARNING" => Level::WARN,
        "ERROR" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Setup structured logging for the entire application
pub fn setup_logging(
    log_level: Option<&str>,
    json_format: Option<bool>,
    console_output: Option<bool>,
) {
    let log_level_str = log_level.unwrap_or("INFO");
    let json_format = json_format.unwrap_or(false);
    let console_output = console_output.unwrap_or(true);
    let level = parse_level(log_level_str);

    INIT.call_once(|| {
        let mut filter = EnvFilter::from_default_env().add_directive(level.into());
        // Suppress noisy libraries
        for directive in ["tokio_tungstenite=warn", "tungstenite=warn", "rustls=warn"] {
            if let Ok(d) = directive.parse::<Directive>() {
                filter = filter.add_directive(d);
            }
        }

        let result = if !console_output {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::sink)
                .try_init()
        } else if json_format {
            tracing_subscriber::fmt()
                .json()
                .with_target(true)
                .with_thread_ids(true)
                .with_env_filter(filter)
                .try_init()
        } else {
            tracing_subscriber::fmt()
                .with_target(true)
                .with_env_filter(filter)
                .try_init()
        };

        // Another subscriber (e.g. a test harness) may already be installed
        if result.is_ok() {
            tracing::info!(log_level = %log_level_str, json = json_format, "Logging initialized");
        }
    });
}
