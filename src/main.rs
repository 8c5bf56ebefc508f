// ─────────────────────────────────────────────────────────────────────────────
// dca-engine-rs: short-side DCA grid bot for OKX perpetual swaps
//
// Per (user, instrument) the engine holds a short position, keeps a fixed
// ladder of post-only limit shorts above the anchor price, covers each filled
// leg with a reduce-only take-profit, and reconverges local intent against
// exchange state every tick.
// ─────────────────────────────────────────────────────────────────────────────
mod engine;
mod events;
mod exchange;
mod signing;
mod stream;
mod supervisor;

use std::sync::Arc;

use engine::GridSettings;
use exchange::Credentials;
use supervisor::{BotParams, Supervisor};

fn env_flag(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) => v != "false" && v != "0",
        Err(_) => default,
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() {
    // Load .env file if present (silently ignored if missing)
    dotenvy::dotenv().ok();
    env_logger::init();
    log::info!("🏦 dca-engine-rs starting…");

    let paper = env_flag("DCA_PAPER", true);
    let demo = env_flag("DCA_DEMO", true);
    let user_id: u64 = env_parse("DCA_USER_ID", 1);
    let symbol = std::env::var("DCA_SYMBOL").unwrap_or_else(|_| "BTC/USDT:USDT".to_string());
    let leverage: u32 = env_parse("DCA_LEVERAGE", 5);
    let leg_notional: f64 = env_parse("DCA_LEG_NOTIONAL", 100.0);

    let mode = if paper {
        "PAPER (no real orders)"
    } else if demo {
        "DEMO TRADING"
    } else {
        "⚠️  LIVE!"
    };
    log::info!("  Mode:      {}", mode);
    log::info!("  Symbol:    {}", symbol);
    log::info!("  Leverage:  {}x", leverage);
    log::info!("  Leg size:  {} USDT", leg_notional);

    let credentials = Credentials {
        api_key: std::env::var("OKX_API_KEY").unwrap_or_default(),
        api_secret: std::env::var("OKX_API_SECRET").unwrap_or_default(),
        passphrase: std::env::var("OKX_API_PASSPHRASE").unwrap_or_default(),
    };
    if !paper && credentials.api_key.is_empty() {
        log::error!(
            "OKX_API_KEY / OKX_API_SECRET / OKX_API_PASSPHRASE must be set outside paper mode"
        );
        std::process::exit(1);
    }

    let supervisor = Arc::new(Supervisor::new(demo, paper, GridSettings::default()));
    let params = BotParams {
        symbol: symbol.clone(),
        leverage,
        leg_notional,
    };
    if let Err(e) = supervisor.start(user_id, params, &credentials).await {
        log::error!("Failed to start bot for {}: {}", symbol, e);
        std::process::exit(1);
    }

    // Periodic status line: PnL + margin per running symbol.
    {
        let supervisor = supervisor.clone();
        let credentials = credentials.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(std::time::Duration::from_secs(60)).await;
                for status in supervisor.status(user_id, &credentials).await {
                    log::info!(
                        "[STATUS {}] total_pnl={:.4} initial_margin={:.4}",
                        status.symbol,
                        status.total_pnl,
                        status.initial_margin
                    );
                }
            }
        });
    }

    log::info!("✅ Bot running. Press Ctrl-C to stop.");
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Signal handler failed: {}", e);
    }
    log::info!("Shutting down…");
    supervisor.stop_all().await;
}
