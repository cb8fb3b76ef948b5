use anyhow::Context;
use latency_bench::bench::{build_observers, Benchmark, RunPlan};
use latency_bench::chain::{RpcClient, TransactionSubmitter, WalletSubmitter};
use latency_bench::config::Config;
use latency_bench::report::{Report, RunInfo};
use latency_bench::ws::{ChannelOptions, NotificationChannel, NotificationSource};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const DEFAULT_CONFIG_PATH: &str = "latency-bench.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // TLS for wss:// endpoints.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let _ = dotenvy::dotenv();

    let config_path = std::env::var("LATENCY_BENCH_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
    let config = if config_path.exists() {
        Config::load(&config_path)
            .with_context(|| format!("loading {}", config_path.display()))?
    } else {
        Config::from_env()
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    if config.logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .init();
    }

    info!("latency-bench v{} starting", env!("CARGO_PKG_VERSION"));
    if !config_path.exists() {
        info!(path = %config_path.display(), "no config file found, using env-only config");
    }
    config.validate()?;

    // --- Chain ---
    let rpc = Arc::new(RpcClient::connect(&config.rpc.http_url)?);
    let submitter = Arc::new(WalletSubmitter::new(&config.rpc.http_url, &config.wallet.private_key)?);
    let chain_id = match rpc.chain_id().await {
        Ok(id) => Some(id),
        Err(e) => {
            warn!(error = %e, "could not read chain id");
            None
        }
    };
    match submitter.balance().await {
        Ok(balance) => info!(sender = %submitter.sender(), balance = %balance, "wallet ready"),
        Err(e) => warn!(error = %e, "could not read sender balance"),
    }

    // --- Notification channel ---
    let channel = if config.subscription.enabled {
        let options = ChannelOptions {
            ack_timeout: Duration::from_millis(config.subscription.ack_timeout_ms),
            ping_interval: Duration::from_secs(config.subscription.ping_interval_secs),
        };
        match NotificationChannel::connect(&config.rpc.ws_url, options).await {
            Ok(channel) => Some(Arc::new(channel)),
            Err(e) => {
                warn!(url = %config.rpc.ws_url, error = %e, "notification channel unavailable, running without the push strategy");
                None
            }
        }
    } else {
        None
    };

    let source = channel
        .clone()
        .map(|c| c as Arc<dyn NotificationSource>);
    let observers = build_observers(&config, rpc.clone(), rpc.clone(), source);

    let info = RunInfo {
        started_at: chrono::Utc::now(),
        http_url: config.rpc.http_url.clone(),
        ws_url: channel.as_ref().map(|c| c.url().to_string()),
        chain_id,
        sender: submitter.sender(),
    };

    let benchmark = Benchmark::new(RunPlan::from_config(&config), submitter, rpc, observers);
    let run = benchmark.run().await;
    let summary = run.summarize(config.compare_pair());

    let report = Report::new(&info, &run, &summary);
    println!("{}", report.render());

    if let Some(path) = &config.report.json_path {
        report.write_json(Path::new(path))?;
        info!(path = %path, "json report written");
    }

    if let Some(channel) = channel {
        if channel.dropped() > 0 {
            warn!(dropped = channel.dropped(), "notifications arrived for unknown subscriptions");
        }
        channel.close().await;
    }

    info!("latency-bench finished");
    Ok(())
}
