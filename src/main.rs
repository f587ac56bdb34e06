use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use polymarket_maker::config::Config;
use polymarket_maker::engine::session::SessionRunner;
use polymarket_maker::error::MakerError;
use polymarket_maker::feeds::polymarket::MarketFeed;
use polymarket_maker::gateway::wallet::{LiveWallet, SimWallet, WalletBroker};
use polymarket_maker::market::discovery::resolve_market;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = run().await {
        error!(error = %e, "fatal");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), MakerError> {
    let config = Config::from_env()?;
    info!(
        market = %config.market_slug,
        real_mode = config.real_mode,
        size_usdc = config.size_usdc,
        warmup_ticks = config.warmup_ticks,
        horizon_secs = config.total_secs,
        "polymarket maker starting"
    );

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.request_timeout_secs))
        .build()
        .map_err(|e| MakerError::Transport(format!("http client: {e}")))?;

    // ── Market resolution ──
    let catalog = resolve_market(&http, &config.gamma_api_url, &config.market_slug).await?;
    info!(title = %catalog.title, question = %catalog.question, "event found");
    let token = catalog.select_outcome(0)?;
    info!(outcome = %token.outcome, token_id = %token.token_id, "tracking outcome");

    // ── Broker ──
    let broker: Box<dyn WalletBroker> = if config.real_mode {
        let private_key = std::env::var("PK_POLYMARKET")
            .map_err(|_| MakerError::ConfigInvalid("PK_POLYMARKET is not set".into()))?;
        let wallet = LiveWallet::connect(&config.clob_host, &private_key).await?;

        let balance = wallet.balance_usdc().await?;
        info!(balance, "wallet balance");
        if balance < config.size_usdc {
            return Err(MakerError::InsufficientFunds {
                have: balance,
                need: config.size_usdc,
            });
        }
        // Start from a clean book: no stale orders from earlier sessions.
        if let Err(e) = wallet.cancel_all().await {
            warn!(error = %e, "startup cancel_all failed");
        }
        Box::new(wallet)
    } else {
        Box::new(SimWallet::with_balance(config.size_usdc))
    };

    // ── Feed task ──
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let feed = MarketFeed::new(config.clob_ws_url.clone(), catalog.token_ids.clone());
    let feed_task = tokio::spawn({
        let feed = feed.clone();
        let rx = shutdown_rx.clone();
        async move {
            if let Err(e) = feed.run(rx).await {
                warn!(error = %e, "market feed terminated");
            }
        }
    });

    // ── Interrupt handling ──
    tokio::spawn({
        let tx = shutdown_tx.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, shutting down");
                let _ = tx.send(true);
            }
        }
    });

    // ── Session ──
    let mut runner = SessionRunner::new(config, feed, broker, token, shutdown_rx);
    let session_outcome = runner.run().await;

    // Stop the feed after the session loop has exited.
    let _ = shutdown_tx.send(true);
    let _ = feed_task.await;

    let result = session_outcome?;
    info!(
        pnl = result.pnl_final,
        inventory = result.inventory_final,
        kappa = result.kappa_calibrated,
        "session result persisted"
    );
    Ok(())
}
