// ─────────────────────────────────────────────────────────────────────────────
// supervisor.rs — Bot Registry
//
// One engine per (user, instrument), keyed exactly that way. Starting a key
// that is already running stops the old bot first; start and stop are
// serialized on the registry lock. Paper mode wires the engine to the
// in-memory exchange and skips the private stream entirely.
// ─────────────────────────────────────────────────────────────────────────────
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

use crate::engine::{Engine, GridSettings};
use crate::exchange::{
    Credentials, ExchangeClient, MarketSpec, OkxExchange, OrderError, PaperExchange,
};
use crate::stream::OkxEventStream;

#[derive(Debug, Clone)]
pub struct BotParams {
    pub symbol: String,
    pub leverage: u32,
    pub leg_notional: f64,
}

#[derive(Debug, Clone)]
pub struct BotStatus {
    pub symbol: String,
    /// Unrealized plus realized PnL for the symbol's position.
    pub total_pnl: f64,
    pub initial_margin: f64,
}

struct BotHandle {
    engine: Arc<Engine>,
    /// Listener task; absent in paper mode.
    listener: Option<JoinHandle<()>>,
    session_id: String,
}

pub struct Supervisor {
    demo: bool,
    paper: bool,
    settings: GridSettings,
    bots: AsyncMutex<HashMap<(u64, String), BotHandle>>,
}

fn paper_market() -> MarketSpec {
    MarketSpec {
        contract_size: 0.01,
        tick_size: 0.1,
        min_amount: 1.0,
        lot_size: 1.0,
    }
}

const PAPER_SEED_PRICE: f64 = 1000.0;

impl Supervisor {
    pub fn new(demo: bool, paper: bool, settings: GridSettings) -> Self {
        Self {
            demo,
            paper,
            settings,
            bots: AsyncMutex::new(HashMap::new()),
        }
    }

    /// Builds the exchange adapter, sets isolated short leverage, wires the
    /// engine and the event stream, and registers the bot. Adapter
    /// construction failures (unknown market, bad credentials) abort the
    /// start; everything downstream is log-and-continue.
    pub async fn start(
        &self,
        user_id: u64,
        params: BotParams,
        credentials: &Credentials,
    ) -> Result<(), OrderError> {
        let key = (user_id, params.symbol.clone());
        let mut bots = self.bots.lock().await;
        if let Some(existing) = bots.remove(&key) {
            log::info!(
                "[SUPERVISOR] bot {}#{} already running, stopping it first",
                user_id,
                params.symbol
            );
            Self::shutdown(existing).await;
        }

        let session_id = uuid::Uuid::new_v4().to_string();
        let running = Arc::new(AtomicBool::new(true));

        let handle = if self.paper {
            let mut paper = PaperExchange::new(&params.symbol, paper_market());
            paper.price = Some(PAPER_SEED_PRICE);
            let mut client: Box<dyn ExchangeClient> = Box::new(paper);
            if let Err(e) = client.set_leverage(params.leverage).await {
                log::warn!("[SUPERVISOR] set_leverage failed for {}: {}", params.symbol, e);
            }
            let engine = Engine::new(
                &params.symbol,
                params.leverage,
                params.leg_notional,
                self.settings.clone(),
                client,
                running,
            );
            // no stream to wait for in paper mode
            engine.on_open().await;
            BotHandle {
                engine,
                listener: None,
                session_id: session_id.clone(),
            }
        } else {
            let mut client =
                OkxExchange::connect(credentials.clone(), &params.symbol, self.demo).await?;
            if let Err(e) = client.set_leverage(params.leverage).await {
                log::warn!("[SUPERVISOR] set_leverage failed for {}: {}", params.symbol, e);
            }
            let engine = Engine::new(
                &params.symbol,
                params.leverage,
                params.leg_notional,
                self.settings.clone(),
                Box::new(client),
                running.clone(),
            );
            let stream =
                OkxEventStream::new(credentials, &params.symbol, self.demo, running)?;
            let listener = tokio::spawn(stream.run(engine.clone()));
            BotHandle {
                engine,
                listener: Some(listener),
                session_id: session_id.clone(),
            }
        };

        log::info!(
            "[SUPERVISOR] started bot {}#{} (paper={}, session={})",
            user_id,
            params.symbol,
            self.paper,
            session_id
        );
        bots.insert(key, handle);
        Ok(())
    }

    pub async fn stop(&self, user_id: u64, symbol: &str) -> Result<(), OrderError> {
        let handle = self
            .bots
            .lock()
            .await
            .remove(&(user_id, symbol.to_string()));
        match handle {
            Some(h) => {
                log::info!(
                    "[SUPERVISOR] stopping bot {}#{} (session={})",
                    user_id,
                    symbol,
                    h.session_id
                );
                Self::shutdown(h).await;
                Ok(())
            }
            None => Err(OrderError::InvalidOrder(format!(
                "no running bot for user {} on {}",
                user_id, symbol
            ))),
        }
    }

    pub async fn stop_all(&self) {
        let handles: Vec<((u64, String), BotHandle)> =
            self.bots.lock().await.drain().collect();
        for ((user_id, symbol), handle) in handles {
            log::info!("[SUPERVISOR] stopping bot {}#{}", user_id, symbol);
            Self::shutdown(handle).await;
        }
    }

    async fn shutdown(handle: BotHandle) {
        handle.engine.stop().await;
        if let Some(listener) = handle.listener {
            let _ = listener.await;
        }
    }

    /// Running (user, symbol) pairs, sorted for stable output.
    pub async fn running(&self) -> Vec<(u64, String)> {
        let mut keys: Vec<(u64, String)> = self.bots.lock().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Per-symbol PnL and margin for one user, read through a temporary
    /// adapter so the engines' own clients stay untouched.
    pub async fn status(&self, user_id: u64, credentials: &Credentials) -> Vec<BotStatus> {
        let symbols: Vec<String> = self
            .bots
            .lock()
            .await
            .keys()
            .filter(|(uid, _)| *uid == user_id)
            .map(|(_, symbol)| symbol.clone())
            .collect();

        let mut statuses = Vec::new();
        for symbol in symbols {
            if self.paper {
                statuses.push(BotStatus {
                    symbol,
                    total_pnl: 0.0,
                    initial_margin: 0.0,
                });
                continue;
            }
            match OkxExchange::connect(credentials.clone(), &symbol, self.demo).await {
                Ok(mut client) => {
                    match client.position().await {
                        Ok(Some(pos)) => statuses.push(BotStatus {
                            symbol,
                            total_pnl: pos.unrealized_pnl + pos.realized_pnl,
                            initial_margin: pos.initial_margin,
                        }),
                        Ok(None) => statuses.push(BotStatus {
                            symbol,
                            total_pnl: 0.0,
                            initial_margin: 0.0,
                        }),
                        Err(e) => {
                            log::warn!("[SUPERVISOR] status fetch failed for {}: {}", symbol, e)
                        }
                    }
                    client.close().await;
                }
                Err(e) => log::warn!(
                    "[SUPERVISOR] status adapter for {} failed: {}",
                    symbol,
                    e
                ),
            }
        }
        statuses
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn credentials() -> Credentials {
        Credentials {
            api_key: String::new(),
            api_secret: String::new(),
            passphrase: String::new(),
        }
    }

    fn quiet_settings() -> GridSettings {
        GridSettings {
            batch_pause: Duration::ZERO,
            position_settle: Duration::ZERO,
            tick_interval: Duration::from_secs(3600),
            ..GridSettings::default()
        }
    }

    fn params(symbol: &str) -> BotParams {
        BotParams {
            symbol: symbol.to_string(),
            leverage: 5,
            leg_notional: 100.0,
        }
    }

    #[tokio::test]
    async fn paper_bot_lifecycle() {
        let supervisor = Supervisor::new(true, true, quiet_settings());
        supervisor
            .start(1, params("BTC/USDT:USDT"), &credentials())
            .await
            .unwrap();
        assert_eq!(
            supervisor.running().await,
            vec![(1, "BTC/USDT:USDT".to_string())]
        );

        let statuses = supervisor.status(1, &credentials()).await;
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].symbol, "BTC/USDT:USDT");

        supervisor.stop(1, "BTC/USDT:USDT").await.unwrap();
        assert!(supervisor.running().await.is_empty());
    }

    #[tokio::test]
    async fn restarting_a_key_replaces_the_running_bot() {
        let supervisor = Supervisor::new(true, true, quiet_settings());
        supervisor
            .start(1, params("ETH/USDT:USDT"), &credentials())
            .await
            .unwrap();
        supervisor
            .start(1, params("ETH/USDT:USDT"), &credentials())
            .await
            .unwrap();
        assert_eq!(supervisor.running().await.len(), 1);
        supervisor.stop_all().await;
        assert!(supervisor.running().await.is_empty());
    }

    #[tokio::test]
    async fn bots_are_keyed_per_user_and_symbol() {
        let supervisor = Supervisor::new(true, true, quiet_settings());
        supervisor
            .start(1, params("BTC/USDT:USDT"), &credentials())
            .await
            .unwrap();
        supervisor
            .start(2, params("BTC/USDT:USDT"), &credentials())
            .await
            .unwrap();
        supervisor
            .start(1, params("ETH/USDT:USDT"), &credentials())
            .await
            .unwrap();
        assert_eq!(supervisor.running().await.len(), 3);
        assert_eq!(supervisor.status(1, &credentials()).await.len(), 2);
        supervisor.stop_all().await;
    }

    #[tokio::test]
    async fn stopping_an_unknown_bot_is_an_error() {
        let supervisor = Supervisor::new(true, true, quiet_settings());
        assert!(supervisor.stop(9, "BTC/USDT:USDT").await.is_err());
    }
}
