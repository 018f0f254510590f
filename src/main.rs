// Book Feed CLI
// Connects to the book channel and logs a compact metrics line until Ctrl-C

use anyhow::Result;
use clap::Parser;
use std::time::{Duration, Instant};
use tokio::time::interval;
use tracing::{info, warn};

use book_feed::core::setup_logging;
use book_feed::{ConfigManager, FeedPipeline};

#[derive(Parser)]
#[clap(name = "book_feed")]
#[clap(about = "Mirror a Bitfinex order book over the public websocket")]
struct Cli {
    /// JSON config file (missing file keeps defaults)
    #[clap(long)]
    config: Option<String>,

    /// Precision (0-4) for the first subscription, overrides config
    #[clap(long)]
    precision: Option<i64>,

    /// Override the configured log level
    #[clap(long)]
    log_level: Option<String>,

    /// Emit JSON logs
    #[clap(long)]
    json: bool,

    /// Rows printed for the final book dump, overrides config
    #[clap(long)]
    rows: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = ConfigManager::new(cli.config.as_deref())?;
    let monitoring = config.monitoring().clone();
    let log_level = cli.log_level.as_deref().unwrap_or(&monitoring.log_level);
    setup_logging(Some(log_level), Some(cli.json || monitoring.json_logs), Some(true));

    config.validate()?;
    let summary = config.get_summary();
    info!(
        url = %summary.ws_url,
        symbol = %summary.symbol,
        precision = %summary.precision,
        settle_ms = summary.settle_delay_ms,
        "Starting book feed"
    );

    let handle = FeedPipeline::spawn(&config);
    if let Some(level) = cli.precision {
        // Stored while disconnected, so the first subscribe already uses it
        handle.change_precision(level)?;
    }
    handle.connect()?;

    let started = Instant::now();
    let mut ticker = interval(Duration::from_secs(monitoring.metrics_interval_secs.max(1)));
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                handle.metrics().print_compact(started.elapsed().as_secs());
            }
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    warn!(error = %e, "Ctrl-C handler failed");
                }
                break;
            }
        }
    }

    info!("Shutting down");
    handle.disconnect()?;
    handle.shutdown().await?;

    let rows = cli.rows.unwrap_or(config.display().display_rows);
    let view = handle.view();
    info!(view = %view, rows = rows, max_total = view.max_total(rows), "Final view");
    for (bid, ask) in view.bids.iter().zip(view.asks.iter()).take(rows) {
        info!(
            "{:>12.4} {:>14.2} | {:<14.2} {:<12.4}",
            bid.cumulative_total, bid.price, ask.price, ask.cumulative_total
        );
    }
    handle.metrics().print_report();

    Ok(())
}
