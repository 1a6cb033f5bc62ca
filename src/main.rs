use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use clap::Parser;
use serde::Deserialize;
use tokio::time::{interval, Duration};

use memeradar::api::{MarketDataClient, ProviderFilters};
use memeradar::engine::TradeEngine;
use memeradar::models::fmt_age;
use memeradar::risk::RiskConfig;
use memeradar::strategy::StrategyConfig;
use memeradar::Result;

/// Paper-trading radar for Solana meme pairs: polls DexScreener, ranks
/// entry candidates and simulates disciplined execution against them.
#[derive(Debug, Parser)]
#[command(name = "memeradar", version)]
struct Args {
    /// JSON settings file with `risk` and `strategy` sections; defaults
    /// apply for anything omitted.
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Snapshot refresh interval in seconds.
    #[arg(long, default_value_t = 60)]
    refresh_secs: u64,

    /// DexScreener search query; repeat for several.
    #[arg(long = "query", default_values_t = vec!["solana".to_string(), "pump".to_string()])]
    queries: Vec<String>,

    /// Provider-level minimum liquidity in USD.
    #[arg(long, default_value_t = 0.0)]
    min_liquidity: f64,

    /// Quote symbols dropped at the provider (repeatable).
    #[arg(long = "exclude-quote", default_values_t = vec!["USDC".to_string(), "USDT".to_string()])]
    exclude_quotes: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Settings {
    risk: RiskConfig,
    strategy: StrategyConfig,
}

fn setup_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "memeradar=info".into()),
        )
        .init();
}

fn load_settings(path: Option<&PathBuf>) -> Result<Settings> {
    match path {
        Some(p) => {
            let raw = std::fs::read_to_string(p)?;
            Ok(serde_json::from_str(&raw)?)
        }
        None => Ok(Settings::default()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    let args = Args::parse();
    let settings = load_settings(args.settings.as_ref())?;

    tracing::info!("memeradar starting (paper trading only)");
    tracing::info!(
        position_usd = settings.risk.position_usd,
        max_positions = settings.risk.max_positions,
        stop_loss_pct = settings.risk.stop_loss_pct,
        daily_loss_limit_usd = settings.risk.daily_loss_limit_usd,
        direction = ?settings.risk.direction,
        "risk configuration"
    );
    tracing::info!(
        min_score = settings.strategy.min_score,
        min_txns_1h = settings.strategy.min_txns_1h,
        heat_top_n = settings.strategy.heat_top_n,
        queries = ?args.queries,
        "strategy configuration"
    );

    let provider = MarketDataClient::new(
        args.queries.clone(),
        ProviderFilters {
            min_liquidity_usd: args.min_liquidity,
            exclude_quotes: args.exclude_quotes.clone(),
        },
    );
    // One lock around the whole engine: a tick's mutations are never
    // partially visible to another caller.
    let engine = Arc::new(Mutex::new(TradeEngine::new(settings.risk, settings.strategy)));

    let mut ticker = interval(Duration::from_secs(args.refresh_secs.max(5)));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutting down");
                break;
            }
            _ = ticker.tick() => {
                run_tick(&provider, &engine).await;
            }
        }
    }

    let engine = engine.lock().expect("engine lock poisoned");
    let total: f64 = engine.closed_trades().iter().map(|t| t.pnl_usd).sum();
    tracing::info!(
        closed_trades = engine.closed_trades().len(),
        total_pnl_usd = total,
        "session summary"
    );
    Ok(())
}

async fn run_tick(provider: &MarketDataClient, engine: &Arc<Mutex<TradeEngine>>) {
    let snapshot = match provider.fetch_snapshot().await {
        Ok(rows) => rows,
        Err(e) => {
            tracing::warn!(error = %e, "snapshot fetch failed, skipping tick");
            return;
        }
    };

    let output = {
        let mut engine = engine.lock().expect("engine lock poisoned");
        engine.step(&snapshot)
    };

    tracing::info!(
        pairs = snapshot.len(),
        heat_ok = output.heat_ok,
        circuit_breaker = output.circuit_breaker,
        candidates = output.candidates.len(),
        opened = output.opened.len(),
        rejected = output.rejections.len(),
        open_positions = output.open_positions.len(),
        "tick"
    );

    for view in &output.open_positions {
        tracing::info!(
            symbol = %view.symbol,
            side = view.side.label(),
            entry = view.entry_price,
            last = view.last_price,
            pnl_usd = format!("{:+.2}", view.pnl_usd),
            pnl_pct = format!("{:+.1}%", view.pnl_pct * 100.0),
            age = fmt_age(view.age_min * 60),
            "open"
        );
    }
    for trade in &output.closed_this_tick {
        tracing::info!(
            symbol = %trade.symbol,
            side = trade.side.label(),
            reason = trade.reason.as_str(),
            pnl_usd = format!("{:+.2}", trade.pnl_usd),
            pnl_pct = format!("{:+.1}%", trade.pnl_pct * 100.0),
            held = fmt_age(trade.duration_min() * 60),
            "closed"
        );
    }
}
