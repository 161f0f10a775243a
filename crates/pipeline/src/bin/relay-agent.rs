//! relay-agent: forwards SMS and mailbox events to the remote collector.
//!
//! Platform events are read from stdin as JSON lines (one `RawEvent` per
//! line) and fed through the local SMS broadcast and mailbox, so the
//! sources, normalizer, dedup window and dispatcher run exactly as they
//! would on a device. On EOF or Ctrl-C the agent flushes pending deliveries,
//! stops the sources and shuts the dispatcher down.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::io::BufReader;
use tracing::{info, warn};

use relay_core::config::load_dotenv;
use relay_core::RelayConfig;
use relay_pipeline::source::{
    LocalMailbox, LocalSmsPlatform, Mailbox, ScheduledScanSource, SmsEventSource,
};
use relay_pipeline::{Bridge, Dispatcher, EventSource, HttpCollector, Ingestor, LifecycleManager};

// ── CLI ─────────────────────────────────────────────────────────────

/// Relay agent: SMS and mail events in on stdin, collector deliveries out.
#[derive(Parser, Debug)]
#[command(name = "relay-agent", version, about)]
struct Cli {
    /// Override the collector base URL.
    #[arg(long, env = "RELAY_COLLECTOR_URL")]
    collector_url: Option<String>,

    /// Disable the SMS source.
    #[arg(long)]
    no_sms: bool,

    /// Disable the mailbox scan source.
    #[arg(long)]
    no_mail: bool,

    /// Start without the SMS receive permission (exercises the denial path).
    #[arg(long)]
    deny_sms: bool,

    /// Start without a linked mailbox.
    #[arg(long)]
    mailbox_unlinked: bool,

    /// Seconds to wait for pending deliveries before shutting down.
    #[arg(long, env = "RELAY_DRAIN_TIMEOUT", default_value_t = 30)]
    drain_timeout: u64,
}

// ── main ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    load_dotenv();
    let cli = Cli::parse();

    let mut config = RelayConfig::from_env();
    if let Some(url) = cli.collector_url {
        config.collector.url = url;
    }
    config.validate().context("invalid configuration")?;
    config.log_summary();

    let collector = Arc::new(HttpCollector::new(&config.collector).context("building HTTP client")?);
    info!(endpoint = collector.endpoint(), "collector configured");

    let dispatcher = Arc::new(
        Dispatcher::builder(collector)
            .config(config.dispatch.clone())
            .on_delivery_failed(|failure| {
                warn!(
                    source = %failure.record.source(),
                    key = %failure.idempotency_key,
                    attempts = failure.attempts,
                    error = %failure.last_error,
                    "record dropped after exhausting retries"
                );
            })
            .build(),
    );
    let ingestor = Arc::new(Ingestor::new(dispatcher.clone(), config.lifecycle.dedup_capacity));

    let mut sources: Vec<Arc<dyn EventSource>> = Vec::new();
    let sms_platform = (!cli.no_sms).then(|| Arc::new(LocalSmsPlatform::new(!cli.deny_sms)));
    let mailbox = (!cli.no_mail).then(|| Arc::new(LocalMailbox::new(!cli.mailbox_unlinked)));
    if let Some(platform) = &sms_platform {
        sources.push(Arc::new(SmsEventSource::new(platform.clone())));
    }
    let scan = mailbox
        .as_ref()
        .map(|mailbox| Arc::new(ScheduledScanSource::new(mailbox.clone(), &config.scan)));
    if let Some(scan) = &scan {
        sources.push(scan.clone());
    }

    let lifecycle = LifecycleManager::new(sources, ingestor.clone(), &config.lifecycle);
    lifecycle.start().await.context("starting sources")?;

    let bridge = Bridge::new(sms_platform, mailbox.clone());
    let stdin = BufReader::new(tokio::io::stdin());

    tokio::select! {
        result = bridge.run(stdin) => {
            let stats = result.context("reading stdin")?;
            info!(?stats, "input exhausted");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received Ctrl-C, shutting down");
        }
    }

    let drain = Duration::from_secs(cli.drain_timeout);
    let drained = tokio::time::timeout(drain, async {
        if let (Some(scan), Some(mailbox)) = (&scan, &mailbox) {
            wait_for_scan(scan, mailbox).await;
        }
        dispatcher.flush().await;
    });
    if drained.await.is_err() {
        warn!(timeout = ?drain, "pending deliveries did not drain in time");
    }

    lifecycle.stop().await;
    let cancelled = dispatcher.shutdown().await;

    info!(
        ingest = ?ingestor.stats(),
        dispatch = ?dispatcher.stats(),
        cancelled,
        "relay-agent exited cleanly"
    );
    Ok(())
}

/// Wait until the scan source has caught up with everything pushed to the mailbox.
async fn wait_for_scan(scan: &ScheduledScanSource<LocalMailbox>, mailbox: &LocalMailbox) {
    let Ok(head) = mailbox.head().await else {
        return;
    };
    while scan.cursor() < head {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
