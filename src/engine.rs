// ─────────────────────────────────────────────────────────────────────────────
// engine.rs — Per-Instrument DCA Trading Engine
//
// One Engine per (user, instrument). It keeps a fixed grid of limit short
// "add" orders above the anchor price, one reduce-only take-profit per filled
// leg, and reconverges local intent with exchange state every tick:
//   1. catch-up market order when price jumped past several grid slots
//   2. grid reconciliation against the anchor-derived target set
//   3. take-profit total vs. live position (rebuild on overshoot)
//   4. local map vs. exchange open-order drift
//
// All callbacks and the tick body serialize on one async mutex held for the
// duration of each step; the listener task and the tick task never touch
// engine state concurrently.
// ─────────────────────────────────────────────────────────────────────────────
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;

use crate::events::{self, FillRecord, OrderRecord, OrderState, PositionRecord};
use crate::exchange::{ExchangeClient, LimitStyle, OpenOrderInfo, Side};

// ─── Tuning ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct GridSettings {
    /// Grid spacing as a fraction of the anchor price.
    pub trade_step: f64,
    /// Take-profit offset below the leg's fill price.
    pub tp_step: f64,
    /// Number of DCA slots above the anchor.
    pub max_dca: usize,
    /// Pause between consecutive mutating exchange calls.
    pub batch_pause: Duration,
    pub tick_interval: Duration,
    /// Minimum spacing between catch-up orders.
    pub catchup_throttle: Duration,
    /// Cap on how many missed legs a single catch-up order may aggregate.
    pub max_catchup_legs: u32,
    /// Minimum spacing between re-entries after the position goes flat.
    pub reenter_cooldown: Duration,
    pub metrics_every: Duration,
    /// Wait after a take-profit fill before reading the position back.
    pub position_settle: Duration,
    /// Close the whole position once total PnL / initial margin reaches this.
    pub profit_target_ratio: f64,
    /// Place an opening market short on start when flat.
    pub enter_on_start: bool,
    /// Re-enter automatically when the position is reported flat.
    pub reenter_on_flat: bool,
    /// Catch-up as IOC limit at the current price instead of a market order.
    pub catchup_ioc: bool,
}

impl Default for GridSettings {
    fn default() -> Self {
        Self {
            trade_step: 0.0015,
            tp_step: 0.0015,
            max_dca: 12,
            batch_pause: Duration::from_millis(150),
            tick_interval: Duration::from_millis(1500),
            catchup_throttle: Duration::from_secs(3),
            max_catchup_legs: 6,
            reenter_cooldown: Duration::from_secs(5),
            metrics_every: Duration::from_secs(60),
            position_settle: Duration::from_millis(100),
            profit_target_ratio: 0.10,
            enter_on_start: true,
            reenter_on_flat: true,
            catchup_ioc: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EngineMetrics {
    pub catchup_count: u64,
    pub tp_trim_count: u64,
    pub reconcile_drift: u64,
    pub oos_count: u64,
}

/// A tracked working order: exchange order id → price and contracts.
#[derive(Debug, Clone, PartialEq)]
pub struct OpenOrder {
    pub price: f64,
    pub amount: f64,
}

// ─── Client Order Ids ────────────────────────────────────────────────────────
// Deterministic ids make retries collapse into duplicate-id rejections on the
// exchange instead of doubling exposure. All ids are alphanumeric, ≤ 32 chars.

const CLIENT_ID_MAX: usize = 32;

/// First 12 alphanumeric characters of the canonical symbol.
pub fn symbol_key(symbol: &str) -> String {
    symbol
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(12)
        .collect()
}

pub fn leg_client_id(symbol: &str, price: f64) -> String {
    truncate_cid(format!(
        "LEG{}{}",
        symbol_key(symbol),
        (price * 10_000.0).floor() as i64
    ))
}

/// The TP for a leg carries the leg's id with the prefix swapped.
pub fn tp_client_id(leg_cid: &str) -> String {
    let stem = leg_cid.strip_prefix("LEG").unwrap_or(leg_cid);
    truncate_cid(format!("TP{}", stem))
}

pub fn catchup_client_id(symbol: &str, price: f64) -> String {
    truncate_cid(format!(
        "CATCHUP{}{}",
        symbol_key(symbol),
        (price * 100.0).floor() as i64
    ))
}

pub fn rebuild_client_id(symbol: &str) -> String {
    truncate_cid(format!("TP{}REBUILD", symbol_key(symbol)))
}

fn truncate_cid(mut s: String) -> String {
    s.truncate(CLIENT_ID_MAX);
    s
}

/// Grid-slot identity: price quantized to the instrument's tick size.
pub fn price_bucket(price: f64, tick_size: f64) -> i64 {
    if tick_size <= 0.0 {
        return 0;
    }
    (price / tick_size).round() as i64
}

// ─── Engine Core ─────────────────────────────────────────────────────────────

/// Mutable engine state plus the exchange adapter. Only ever touched while
/// the owning `Engine`'s mutex is held.
struct EngineCore {
    symbol: String,
    leverage: u32,
    leg_notional: f64,
    settings: GridSettings,
    client: Box<dyn ExchangeClient>,
    /// Price of the most recent sell fill. Advances only on fills.
    last_filled_leg_price: Option<f64>,
    /// Anchor the target grid is generated from. Moves only with
    /// `last_filled_leg_price`; catch-up and reconciliation never touch it.
    grid_anchor_price: Option<f64>,
    open_dca: HashMap<String, OpenOrder>,
    open_tp: HashMap<String, OpenOrder>,
    /// Leg client ids a TP has already been created for (duplicate-fill guard).
    tp_created_for_leg: HashSet<String>,
    last_catchup: Option<Instant>,
    last_reenter: Option<Instant>,
    last_metrics: Instant,
    metrics: EngineMetrics,
}

impl EngineCore {
    fn new(
        symbol: String,
        leverage: u32,
        leg_notional: f64,
        settings: GridSettings,
        client: Box<dyn ExchangeClient>,
    ) -> Self {
        log::info!(
            "[ENGINE {}] initialized: leverage={}x leg_notional={}",
            symbol,
            leverage,
            leg_notional
        );
        Self {
            symbol,
            leverage,
            leg_notional,
            settings,
            client,
            last_filled_leg_price: None,
            grid_anchor_price: None,
            open_dca: HashMap::new(),
            open_tp: HashMap::new(),
            tp_created_for_leg: HashSet::new(),
            last_catchup: None,
            last_reenter: None,
            last_metrics: Instant::now(),
            metrics: EngineMetrics::default(),
        }
    }

    /// Contracts for one leg of `leg_notional` quote units at `ref_price`,
    /// rounded down to the instrument's lot size.
    fn contracts_for(&self, ref_price: f64) -> f64 {
        let raw = (self.leg_notional / ref_price) / self.client.market().contract_size;
        self.client.round_amount(raw)
    }

    // ─── One Tick ────────────────────────────────────────────────────────────

    async fn run_tick(&mut self) {
        let price = match self.client.current_price().await {
            Ok(Some(p)) if p > 0.0 => p,
            Ok(_) => {
                log::debug!("[ENGINE {}] no price this tick, skipping", self.symbol);
                return;
            }
            Err(e) => {
                log::warn!("[ENGINE {}] price fetch failed: {}", self.symbol, e);
                return;
            }
        };

        self.run_catchup(price).await;
        self.reconcile_grid(price).await;
        self.reconcile_tp(price).await;
        self.reconcile_open_orders().await;

        if self.last_metrics.elapsed() >= self.settings.metrics_every {
            self.last_metrics = Instant::now();
            log::info!(
                "[METRICS {}] lev={}x catchup={} tp_trim={} drift={} oos={} open_dca={} open_tp={} anchor={:?}",
                self.symbol,
                self.leverage,
                self.metrics.catchup_count,
                self.metrics.tp_trim_count,
                self.metrics.reconcile_drift,
                self.metrics.oos_count,
                self.open_dca.len(),
                self.open_tp.len(),
                self.grid_anchor_price,
            );
        }
    }

    // ─── Catch-Up ────────────────────────────────────────────────────────────

    /// When price jumped past several grid slots between ticks, substitute the
    /// missed limit fills with one aggregated short. The anchor stays put:
    /// only fill events move it.
    async fn run_catchup(&mut self, price: f64) {
        let Some(last) = self.last_filled_leg_price else {
            return;
        };
        if price <= last {
            return;
        }
        let missing = (((price / last) - 1.0) / self.settings.trade_step).floor() as i64;
        if missing < 1 {
            return;
        }
        let missing = missing.min(self.settings.max_catchup_legs as i64);

        if let Some(t) = self.last_catchup {
            if t.elapsed() < self.settings.catchup_throttle {
                log::debug!("[ENGINE {}] catch-up throttled", self.symbol);
                return;
            }
        }

        let per_leg = self.contracts_for(price);
        if per_leg < self.client.market().min_amount || per_leg <= 0.0 {
            log::warn!(
                "[ENGINE {}] catch-up leg below minimum size, skipping",
                self.symbol
            );
            return;
        }
        let contracts = self.client.round_amount(per_leg * missing as f64);
        let cid = catchup_client_id(&self.symbol, price);

        let result = if self.settings.catchup_ioc {
            self.client
                .place_limit_short(contracts, price, LimitStyle::Ioc, Some(&cid))
                .await
        } else {
            self.client.place_market_short(contracts, Some(&cid)).await
        };
        match result {
            Ok(_) => {
                self.metrics.catchup_count += 1;
                self.last_catchup = Some(Instant::now());
                log::info!(
                    "[ENGINE {}] catch-up: {} missed legs, {} contracts @ ~{} (cid={})",
                    self.symbol,
                    missing,
                    contracts,
                    price,
                    cid
                );
            }
            Err(e) => log::warn!("[ENGINE {}] catch-up order failed: {}", self.symbol, e),
        }
    }

    // ─── Grid Reconciliation ─────────────────────────────────────────────────

    /// Converges the set of live LEG orders to the target grid derived from
    /// the anchor, with minimal churn. Slot identity is the tick bucket, so
    /// re-running without external change is a no-op.
    async fn reconcile_grid(&mut self, price: f64) {
        let tick = self.client.market().tick_size;
        let min_amount = self.client.market().min_amount;
        let anchor = self.grid_anchor_price.unwrap_or(price);

        let targets: Vec<f64> = (1..=self.settings.max_dca)
            .map(|i| anchor * (1.0 + self.settings.trade_step).powi(i as i32))
            .collect();
        let target_buckets: HashSet<i64> =
            targets.iter().map(|p| price_bucket(*p, tick)).collect();

        let existing = match self.client.open_orders().await {
            Ok(orders) => orders,
            Err(e) => {
                log::warn!("[ENGINE {}] open-order fetch failed: {}", self.symbol, e);
                return;
            }
        };
        let legs: Vec<&OpenOrderInfo> = existing
            .iter()
            .filter(|o| o.client_id.starts_with("LEG"))
            .collect();
        let existing_buckets: HashSet<i64> =
            legs.iter().map(|o| price_bucket(o.price, tick)).collect();

        let best_ask = match self.client.best_ask().await {
            Ok(a) => a,
            Err(e) => {
                log::debug!("[ENGINE {}] best-ask fetch failed: {}", self.symbol, e);
                None
            }
        };

        // Place targets that have no resting order in their bucket.
        for target in &targets {
            if existing_buckets.contains(&price_bucket(*target, tick)) {
                continue;
            }
            let contracts = self.contracts_for(*target);
            if contracts < min_amount || contracts <= 0.0 {
                log::warn!(
                    "[ENGINE {}] grid slot @ {} below minimum size, skipping",
                    self.symbol,
                    target
                );
                continue;
            }
            // Lift the sell to at least one tick above the best ask so the
            // post-only order cannot be rejected for crossing.
            let safe_price = match best_ask {
                Some(ask) => target.max(ask + tick),
                None => *target,
            };
            let cid = leg_client_id(&self.symbol, *target);
            match self
                .client
                .place_limit_short(contracts, safe_price, LimitStyle::PostOnly, Some(&cid))
                .await
            {
                Ok(ack) => {
                    self.open_dca.insert(
                        ack.order_id,
                        OpenOrder {
                            price: safe_price,
                            amount: contracts,
                        },
                    );
                }
                Err(e) => log::warn!(
                    "[ENGINE {}] grid placement @ {} failed: {}",
                    self.symbol,
                    target,
                    e
                ),
            }
            tokio::time::sleep(self.settings.batch_pause).await;
        }

        // Cancel legs whose bucket fell out of the target set.
        let evicted: Vec<(String, f64)> = legs
            .iter()
            .filter(|o| !target_buckets.contains(&price_bucket(o.price, tick)))
            .map(|o| (o.order_id.clone(), o.price))
            .collect();
        for (order_id, order_price) in evicted {
            match self.client.cancel_order(&order_id).await {
                Ok(()) => {
                    self.open_dca.remove(&order_id);
                    log::info!(
                        "[ENGINE {}] cancelled out-of-grid leg @ {}",
                        self.symbol,
                        order_price
                    );
                }
                Err(e) => log::warn!(
                    "[ENGINE {}] cancel of out-of-grid leg failed: {}",
                    self.symbol,
                    e
                ),
            }
            tokio::time::sleep(self.settings.batch_pause).await;
        }
    }

    // ─── TP vs. Position ─────────────────────────────────────────────────────

    /// Enforces Σ tracked TP ≤ live position. On overshoot (a partial fill
    /// paired with a missed cancel) every TP is torn down and one reduce-only
    /// buy is rebuilt for the whole position.
    async fn reconcile_tp(&mut self, price: f64) {
        let contracts = match self.client.position().await {
            Ok(pos) => pos.map(|p| p.contracts).unwrap_or(0.0),
            Err(e) => {
                log::warn!("[ENGINE {}] position fetch failed: {}", self.symbol, e);
                return;
            }
        };

        if contracts <= 0.0 {
            if !self.open_tp.is_empty() {
                log::info!(
                    "[ENGINE {}] flat with {} tracked TP orders, cancelling",
                    self.symbol,
                    self.open_tp.len()
                );
                self.cancel_tracked_tps().await;
            }
            return;
        }

        let tp_total: f64 = self.open_tp.values().map(|o| o.amount).sum();
        if tp_total <= contracts + 1e-9 {
            return;
        }

        log::warn!(
            "[ENGINE {}] TP total {} exceeds position {}, rebuilding",
            self.symbol,
            tp_total,
            contracts
        );
        self.cancel_tracked_tps().await;

        let base = self.last_filled_leg_price.unwrap_or(price);
        let tp_price = base * (1.0 - self.settings.tp_step);
        let cid = rebuild_client_id(&self.symbol);
        match self
            .client
            .place_reduce_only_tp(contracts, tp_price, &cid)
            .await
        {
            Ok(ack) => {
                self.open_tp.insert(
                    ack.order_id,
                    OpenOrder {
                        price: tp_price,
                        amount: contracts,
                    },
                );
                log::info!(
                    "[ENGINE {}] rebuilt TP: {} contracts @ {}",
                    self.symbol,
                    contracts,
                    tp_price
                );
            }
            Err(e) => log::warn!("[ENGINE {}] TP rebuild failed: {}", self.symbol, e),
        }
        self.metrics.tp_trim_count += 1;
    }

    async fn cancel_tracked_tps(&mut self) {
        let ids: Vec<String> = self.open_tp.keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.client.cancel_order(&id).await {
                log::warn!("[ENGINE {}] TP cancel failed: {}", self.symbol, e);
            }
            tokio::time::sleep(self.settings.batch_pause).await;
        }
        self.open_tp.clear();
    }

    // ─── Local/Exchange Drift ────────────────────────────────────────────────

    /// Drops tracked ids the exchange no longer reports and absorbs exchange
    /// orders the maps never saw (reconnects, missed events). Classification
    /// is by client-id prefix, falling back to order side.
    async fn reconcile_open_orders(&mut self) {
        let existing = match self.client.open_orders().await {
            Ok(orders) => orders,
            Err(e) => {
                log::warn!("[ENGINE {}] open-order fetch failed: {}", self.symbol, e);
                return;
            }
        };
        let live_ids: HashSet<&str> = existing.iter().map(|o| o.order_id.as_str()).collect();

        let before_dca = self.open_dca.len();
        let before_tp = self.open_tp.len();
        self.open_dca.retain(|id, _| live_ids.contains(id.as_str()));
        self.open_tp.retain(|id, _| live_ids.contains(id.as_str()));
        let mut changed =
            self.open_dca.len() != before_dca || self.open_tp.len() != before_tp;

        for order in &existing {
            if self.open_dca.contains_key(&order.order_id)
                || self.open_tp.contains_key(&order.order_id)
            {
                continue;
            }
            let entry = OpenOrder {
                price: order.price,
                amount: order.amount,
            };
            let is_tp = order.client_id.starts_with("TP")
                || (!order.client_id.starts_with("LEG") && order.side == Side::Buy);
            if is_tp {
                self.open_tp.insert(order.order_id.clone(), entry);
            } else {
                self.open_dca.insert(order.order_id.clone(), entry);
            }
            changed = true;
        }

        if changed {
            self.metrics.reconcile_drift += 1;
            log::debug!(
                "[ENGINE {}] drift reconciled: open_dca={} open_tp={}",
                self.symbol,
                self.open_dca.len(),
                self.open_tp.len()
            );
        }
    }

    // ─── Fill Handling ───────────────────────────────────────────────────────

    async fn apply_order_record(&mut self, record: OrderRecord) {
        match record.state {
            OrderState::Canceled => {
                self.open_dca.remove(&record.exchange_id);
                self.open_tp.remove(&record.exchange_id);
            }
            OrderState::Filled | OrderState::PartiallyFilled => {
                let fully_filled = record.state == OrderState::Filled;
                match record.normalize_fill() {
                    Some(fill) => {
                        if fully_filled {
                            self.open_dca.remove(&fill.exchange_id);
                            self.open_tp.remove(&fill.exchange_id);
                        }
                        match fill.side {
                            Side::Sell => self.handle_leg_fill(&fill).await,
                            Side::Buy => self.handle_tp_fill(&fill).await,
                        }
                    }
                    None => {
                        self.metrics.oos_count += 1;
                        log::warn!(
                            "[ENGINE {}] fill record missing fields, skipping (ordId={})",
                            self.symbol,
                            record.exchange_id
                        );
                    }
                }
            }
            OrderState::Live | OrderState::Other => {}
        }
    }

    /// A sell filled: a new leg is on. This is the only path that moves the
    /// anchor. Places the leg's reduce-only TP one step below the fill.
    async fn handle_leg_fill(&mut self, fill: &FillRecord) {
        let leg_cid = fill
            .client_id
            .clone()
            .unwrap_or_else(|| leg_client_id(&self.symbol, fill.avg_px));
        if self.tp_created_for_leg.contains(&leg_cid) {
            log::debug!(
                "[ENGINE {}] duplicate fill delivery for {}, ignoring",
                self.symbol,
                leg_cid
            );
            return;
        }

        log::info!(
            "[ENGINE {}] leg filled: {} contracts @ {} (cid={})",
            self.symbol,
            fill.filled_contracts,
            fill.avg_px,
            leg_cid
        );
        self.last_filled_leg_price = Some(fill.avg_px);
        self.grid_anchor_price = Some(fill.avg_px);

        let tp_price = fill.avg_px * (1.0 - self.settings.tp_step);
        let tp_cid = tp_client_id(&leg_cid);
        match self
            .client
            .place_reduce_only_tp(fill.filled_contracts, tp_price, &tp_cid)
            .await
        {
            Ok(ack) => {
                self.open_tp.insert(
                    ack.order_id,
                    OpenOrder {
                        price: tp_price,
                        amount: fill.filled_contracts,
                    },
                );
                self.tp_created_for_leg.insert(leg_cid);
            }
            Err(e) => {
                // next tick's TP reconciliation rebuilds the cover
                log::warn!("[ENGINE {}] TP placement failed: {}", self.symbol, e);
            }
        }
    }

    /// A take-profit filled. If it flattened the position, restart the cycle.
    /// Otherwise check the full-position profit target and close everything
    /// once total PnL relative to the initial margin reaches it.
    async fn handle_tp_fill(&mut self, fill: &FillRecord) {
        log::info!(
            "[ENGINE {}] take-profit filled: {} contracts @ {}",
            self.symbol,
            fill.filled_contracts,
            fill.avg_px
        );
        // give the venue a moment to settle the position record
        tokio::time::sleep(self.settings.position_settle).await;

        let pos = match self.client.position().await {
            Ok(pos) => pos,
            Err(e) => {
                log::warn!(
                    "[ENGINE {}] position check after TP fill failed: {}",
                    self.symbol,
                    e
                );
                return;
            }
        };

        let Some(pos) = pos.filter(|p| p.contracts > 0.0) else {
            log::info!("[ENGINE {}] position fully closed, restarting cycle", self.symbol);
            self.flatten_and_reenter("cycle restart after full take-profit")
                .await;
            return;
        };

        if pos.initial_margin <= 0.0 {
            return;
        }
        let total_pnl = pos.unrealized_pnl + pos.realized_pnl;
        let ratio = total_pnl / pos.initial_margin;
        log::debug!(
            "[ENGINE {}] profit check: upl={} realized={} margin={} ratio={:.2}%",
            self.symbol,
            pos.unrealized_pnl,
            pos.realized_pnl,
            pos.initial_margin,
            ratio * 100.0
        );
        if ratio >= self.settings.profit_target_ratio {
            log::info!(
                "[ENGINE {}] profit target reached ({:.2}%), closing position",
                self.symbol,
                ratio * 100.0
            );
            match self.client.close_position().await {
                Ok(()) => {
                    self.flatten_and_reenter("cycle restart after profit target")
                        .await
                }
                Err(e) => log::error!("[ENGINE {}] position close failed: {}", self.symbol, e),
            }
        }
    }

    // ─── Flat / Re-Entry ─────────────────────────────────────────────────────

    /// Cancels every tracked order, clears the maps, and (when enabled and
    /// outside the cooldown) re-enters through the normal entry path.
    async fn flatten_and_reenter(&mut self, reason: &str) {
        self.cancel_all_tracked().await;
        if !self.settings.reenter_on_flat {
            return;
        }
        let cooled_down = self
            .last_reenter
            .map_or(true, |t| t.elapsed() >= self.settings.reenter_cooldown);
        if !cooled_down {
            log::debug!("[ENGINE {}] re-entry inside cooldown, skipping", self.symbol);
            return;
        }
        self.enter_leg(reason).await;
    }

    async fn cancel_all_tracked(&mut self) {
        let ids: Vec<String> = self
            .open_dca
            .keys()
            .chain(self.open_tp.keys())
            .cloned()
            .collect();
        if !ids.is_empty() {
            log::info!(
                "[ENGINE {}] cancelling {} tracked orders",
                self.symbol,
                ids.len()
            );
        }
        for id in ids {
            if let Err(e) = self.client.cancel_order(&id).await {
                log::warn!("[ENGINE {}] cancel failed: {}", self.symbol, e);
            }
            tokio::time::sleep(self.settings.batch_pause).await;
        }
        self.open_dca.clear();
        self.open_tp.clear();
    }

    /// Opens one leg at market for `leg_notional` at the current price and
    /// anchors the grid on the entry reference.
    async fn enter_leg(&mut self, reason: &str) {
        self.last_reenter = Some(Instant::now());
        let price = match self.client.current_price().await {
            Ok(Some(p)) if p > 0.0 => p,
            Ok(_) => {
                log::warn!("[ENGINE {}] no price for entry, skipping", self.symbol);
                return;
            }
            Err(e) => {
                log::error!("[ENGINE {}] price fetch for entry failed: {}", self.symbol, e);
                return;
            }
        };
        let contracts = self.contracts_for(price);
        if contracts < self.client.market().min_amount || contracts <= 0.0 {
            log::warn!(
                "[ENGINE {}] entry size {} below minimum, skipping ({})",
                self.symbol,
                contracts,
                reason
            );
            return;
        }
        match self.client.place_market_short(contracts, None).await {
            Ok(_) => {
                self.last_filled_leg_price = Some(price);
                self.grid_anchor_price = Some(price);
                log::info!(
                    "[ENGINE {}] market short placed: {} contracts @ ~{} ({})",
                    self.symbol,
                    contracts,
                    price,
                    reason
                );
            }
            Err(e) => log::error!(
                "[ENGINE {}] entry order failed ({}): {}",
                self.symbol,
                reason,
                e
            ),
        }
    }
}

// ─── Engine — Public Contract ────────────────────────────────────────────────

/// State shared between the engine handle and its tick task.
struct Shared {
    symbol: String,
    tick_interval: Duration,
    core: AsyncMutex<EngineCore>,
    tick_stop: AtomicBool,
    tick_notify: Notify,
}

pub struct Engine {
    shared: Arc<Shared>,
    tick_task: StdMutex<Option<JoinHandle<()>>>,
    stream_running: Arc<AtomicBool>,
}

impl Engine {
    pub fn new(
        symbol: &str,
        leverage: u32,
        leg_notional: f64,
        settings: GridSettings,
        client: Box<dyn ExchangeClient>,
        stream_running: Arc<AtomicBool>,
    ) -> Arc<Self> {
        let tick_interval = settings.tick_interval;
        Arc::new(Self {
            shared: Arc::new(Shared {
                symbol: symbol.to_string(),
                tick_interval,
                core: AsyncMutex::new(EngineCore::new(
                    symbol.to_string(),
                    leverage,
                    leg_notional,
                    settings,
                    client,
                )),
                tick_stop: AtomicBool::new(false),
                tick_notify: Notify::new(),
            }),
            tick_task: StdMutex::new(None),
            stream_running,
        })
    }

    fn symbol(&self) -> &str {
        &self.shared.symbol
    }

    /// Called once when the event stream is authenticated and subscribed.
    /// Syncs dangling orders, optionally opens the first leg, then starts the
    /// tick loop. Entry failures are logged and do not prevent the loop.
    pub async fn on_open(&self) {
        {
            let mut core = self.shared.core.lock().await;
            core.reconcile_open_orders().await;
            match core.client.position().await {
                Ok(pos) => {
                    let contracts = pos.map(|p| p.contracts).unwrap_or(0.0);
                    if contracts > 0.0 {
                        log::info!(
                            "[ENGINE {}] position already open ({} contracts), monitoring",
                            self.symbol(),
                            contracts
                        );
                    } else {
                        if !core.open_dca.is_empty() || !core.open_tp.is_empty() {
                            log::info!(
                                "[ENGINE {}] flat with dangling orders, cancelling all",
                                self.symbol()
                            );
                            core.cancel_all_tracked().await;
                        }
                        if core.settings.enter_on_start {
                            core.enter_leg("initial entry").await;
                        }
                    }
                }
                Err(e) => log::error!(
                    "[ENGINE {}] startup position check failed: {}",
                    self.symbol(),
                    e
                ),
            }
        }
        self.start_tick_task();
    }

    /// Order-update callback: batch envelope or single record.
    /// Malformed records are counted and skipped, never fatal.
    pub async fn on_order_update(&self, payload: &Value) {
        let mut core = self.shared.core.lock().await;
        let records = events::raw_records(payload);
        if records.is_empty() {
            core.metrics.oos_count += 1;
            log::warn!("[ENGINE {}] unrecognized order payload, skipping", self.symbol());
            return;
        }
        for raw in records {
            match OrderRecord::parse(raw) {
                Some(record) => core.apply_order_record(record).await,
                None => {
                    core.metrics.oos_count += 1;
                    log::warn!("[ENGINE {}] malformed order record, skipping", self.symbol());
                }
            }
        }
    }

    /// Position-update callback. A zero-size report clears all working
    /// orders; re-entry follows the same path as the initial entry.
    pub async fn on_position_update(&self, payload: &Value) {
        let mut core = self.shared.core.lock().await;
        for raw in events::raw_records(payload) {
            match PositionRecord::parse(raw) {
                Some(pos) if pos.contracts == 0.0 => {
                    log::warn!(
                        "[ENGINE {}] position reported flat, clearing working orders",
                        self.symbol()
                    );
                    core.flatten_and_reenter("re-entry after flat").await;
                }
                Some(_) => {}
                None => log::debug!(
                    "[ENGINE {}] position record without size, ignoring",
                    self.symbol()
                ),
            }
        }
    }

    pub async fn on_error(&self, error: &str) {
        log::error!("[ENGINE {}] stream error: {}", self.symbol(), error);
    }

    /// Stream closed: stop the tick loop. Exchange state is left untouched;
    /// a restarted engine reconverges from it.
    pub async fn on_close(&self, code: Option<i64>, reason: &str) {
        log::info!(
            "[ENGINE {}] stream closed (code={:?}, reason={})",
            self.symbol(),
            code,
            reason
        );
        self.halt_tick_task().await;
    }

    /// Signals the event stream to stop, then drains the tick task.
    pub async fn stop(&self) {
        log::info!("[ENGINE {}] stop requested", self.symbol());
        self.stream_running.store(false, Ordering::SeqCst);
        self.halt_tick_task().await;
        self.shared.core.lock().await.client.close().await;
    }

    pub async fn metrics(&self) -> EngineMetrics {
        self.shared.core.lock().await.metrics.clone()
    }

    fn start_tick_task(&self) {
        let mut slot = self.tick_task.lock().unwrap();
        if slot.is_some() {
            return;
        }
        self.shared.tick_stop.store(false, Ordering::SeqCst);
        let shared = Arc::clone(&self.shared);
        *slot = Some(tokio::spawn(async move {
            log::info!("[ENGINE {}] tick loop started", shared.symbol);
            loop {
                tokio::select! {
                    _ = shared.tick_notify.notified() => break,
                    _ = tokio::time::sleep(shared.tick_interval) => {}
                }
                if shared.tick_stop.load(Ordering::SeqCst) {
                    break;
                }
                let mut core = shared.core.lock().await;
                core.run_tick().await;
            }
            log::info!("[ENGINE {}] tick loop stopped", shared.symbol);
        }));
    }

    /// Cooperative cancellation at the inter-tick sleep point.
    async fn halt_tick_task(&self) {
        self.shared.tick_stop.store(true, Ordering::SeqCst);
        self.shared.tick_notify.notify_one();
        let task = self.tick_task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
