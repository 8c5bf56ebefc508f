// ─────────────────────────────────────────────────────────────────────────────
// exchange.rs — Exchange Access Layer
//
// One `ExchangeClient` trait with two implementations:
//   - OkxExchange:   signed OKX v5 REST adapter (one instance per instrument)
//   - PaperExchange: in-memory adapter for paper mode and tests
//
// Precision handling (tick size, lot size, minimum amount) lives here so the
// engine can reason in raw contract counts.
// ─────────────────────────────────────────────────────────────────────────────
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

use crate::signing;

// ─── Shared Models ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }

    pub fn parse(s: &str) -> Option<Side> {
        match s {
            "buy" => Some(Side::Buy),
            "sell" => Some(Side::Sell),
            _ => None,
        }
    }
}

/// Execution style for limit orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitStyle {
    /// Maker-only; the exchange rejects the order if it would cross.
    PostOnly,
    /// Immediate-or-cancel; any unfilled remainder is dropped.
    Ioc,
}

/// Live position snapshot for the adapter's instrument.
#[derive(Debug, Clone)]
pub struct PositionInfo {
    /// Position size in contracts (always positive; the bot is short-only).
    pub contracts: f64,
    pub entry_price: f64,
    pub unrealized_pnl: f64,
    pub realized_pnl: f64,
    pub initial_margin: f64,
}

/// One resting order as reported by the exchange.
#[derive(Debug, Clone)]
pub struct OpenOrderInfo {
    pub order_id: String,
    pub client_id: String,
    pub side: Side,
    pub price: f64,
    pub amount: f64,
    pub reduce_only: bool,
}

/// Acknowledgement for a successful placement.
#[derive(Debug, Clone)]
pub struct OrderAck {
    pub order_id: String,
    pub client_id: String,
}

/// Static instrument metadata, resolved once at adapter construction.
#[derive(Debug, Clone)]
pub struct MarketSpec {
    /// Coins per contract (OKX `ctVal`).
    pub contract_size: f64,
    /// Minimum price increment (OKX `tickSz`).
    pub tick_size: f64,
    /// Minimum order size in contracts (OKX `minSz`).
    pub min_amount: f64,
    /// Order size granularity in contracts (OKX `lotSz`).
    pub lot_size: f64,
}

/// API credentials for one account. Deliberately not `Debug`.
#[derive(Clone)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
    pub passphrase: String,
}

#[derive(Debug, Clone)]
pub enum OrderError {
    NetworkError(String),
    RateLimited,
    /// The exchange accepted the request but rejected the operation
    /// (below minimum size, post-only would cross, duplicate client id, …).
    ExchangeRejected(String),
    InvalidOrder(String),
    AuthFailed(String),
    MarketNotFound(String),
}

impl std::fmt::Display for OrderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderError::NetworkError(s) => write!(f, "Network Error: {}", s),
            OrderError::RateLimited => write!(f, "Rate Limited"),
            OrderError::ExchangeRejected(s) => write!(f, "Exchange Rejected: {}", s),
            OrderError::InvalidOrder(s) => write!(f, "Invalid Order: {}", s),
            OrderError::AuthFailed(s) => write!(f, "Auth Failed: {}", s),
            OrderError::MarketNotFound(s) => write!(f, "Market Not Found: {}", s),
        }
    }
}

impl std::error::Error for OrderError {}

// ─── Symbol Translation ──────────────────────────────────────────────────────

/// `BASE/QUOTE:QUOTE` → `BASE-QUOTE-SWAP` (linear swaps only).
pub fn symbol_to_inst_id(symbol: &str) -> Option<String> {
    let (pair, settle) = symbol.split_once(':')?;
    let (base, quote) = pair.split_once('/')?;
    if base.is_empty() || quote.is_empty() || quote != settle {
        return None;
    }
    Some(format!("{}-{}-SWAP", base, quote))
}

/// `BASE-QUOTE-SWAP` → `BASE/QUOTE:QUOTE`.
pub fn inst_id_to_symbol(inst_id: &str) -> Option<String> {
    let pair = inst_id.strip_suffix("-SWAP")?;
    let (base, quote) = pair.split_once('-')?;
    if base.is_empty() || quote.is_empty() || quote.contains('-') {
        return None;
    }
    Some(format!("{}/{}:{}", base, quote, quote))
}

// ─── Exchange Trait ──────────────────────────────────────────────────────────

#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Canonical symbol this adapter is bound to.
    fn symbol(&self) -> &str;

    /// Instrument metadata resolved at construction.
    fn market(&self) -> &MarketSpec;

    /// Last traded price, or None if the exchange has no ticker yet.
    async fn current_price(&mut self) -> Result<Option<f64>, OrderError>;

    /// Best ask from the order book, or None if the book is empty.
    async fn best_ask(&mut self) -> Result<Option<f64>, OrderError>;

    /// Current position, or None when flat.
    async fn position(&mut self) -> Result<Option<PositionInfo>, OrderError>;

    /// Every resting order for this instrument.
    async fn open_orders(&mut self) -> Result<Vec<OpenOrderInfo>, OrderError>;

    async fn place_market_short(
        &mut self,
        contracts: f64,
        client_id: Option<&str>,
    ) -> Result<OrderAck, OrderError>;

    async fn place_limit_short(
        &mut self,
        contracts: f64,
        price: f64,
        style: LimitStyle,
        client_id: Option<&str>,
    ) -> Result<OrderAck, OrderError>;

    /// Reduce-only limit buy; can only shrink the short position.
    async fn place_reduce_only_tp(
        &mut self,
        contracts: f64,
        price: f64,
        client_id: &str,
    ) -> Result<OrderAck, OrderError>;

    async fn cancel_order(&mut self, order_id: &str) -> Result<(), OrderError>;

    async fn set_leverage(&mut self, leverage: u32) -> Result<(), OrderError>;

    /// Close the entire position with a reduce-only market buy.
    async fn close_position(&mut self) -> Result<(), OrderError>;

    async fn close(&mut self);

    /// Round an amount down to the instrument's lot size.
    fn round_amount(&self, amount: f64) -> f64 {
        floor_to_lot(amount, self.market().lot_size)
    }

    // For paper mode and tests only.
    fn as_paper_mut(&mut self) -> Option<&mut PaperExchange> {
        None
    }
}

// ─── Paper Exchange (In-Memory) ──────────────────────────────────────────────

/// In-memory exchange: market orders execute immediately against the posted
/// price, limit orders rest until a test fills them. Duplicate client ids on
/// resting orders are rejected, mirroring the live venue.
pub struct PaperExchange {
    symbol: String,
    market: MarketSpec,
    pub price: Option<f64>,
    pub ask: Option<f64>,
    /// Short position in contracts.
    pub position_contracts: f64,
    pub entry_price: f64,
    pub unrealized_pnl: f64,
    pub realized_pnl: f64,
    pub initial_margin: f64,
    pub resting: Vec<OpenOrderInfo>,
    /// Audit trail of executed market shorts: (contracts, client id).
    pub market_shorts: Vec<(f64, String)>,
    pub leverage: Option<u32>,
    pub placements: u64,
    pub cancels: u64,
    pub position_closes: u64,
    /// When set, the next placement fails with this error (consumed).
    pub fail_next_place: Option<OrderError>,
    last_market_cid: Option<String>,
    next_id: u64,
}

impl PaperExchange {
    pub fn new(symbol: &str, market: MarketSpec) -> Self {
        Self {
            symbol: symbol.to_string(),
            market,
            price: None,
            ask: None,
            position_contracts: 0.0,
            entry_price: 0.0,
            unrealized_pnl: 0.0,
            realized_pnl: 0.0,
            initial_margin: 0.0,
            resting: Vec::new(),
            market_shorts: Vec::new(),
            leverage: None,
            placements: 0,
            cancels: 0,
            position_closes: 0,
            fail_next_place: None,
            last_market_cid: None,
            next_id: 1,
        }
    }

    fn take_injected_failure(&mut self) -> Result<(), OrderError> {
        match self.fail_next_place.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn next_order_id(&mut self) -> String {
        let id = format!("paper-{}", self.next_id);
        self.next_id += 1;
        id
    }

    fn rest_order(
        &mut self,
        side: Side,
        price: f64,
        amount: f64,
        reduce_only: bool,
        client_id: Option<&str>,
    ) -> Result<OrderAck, OrderError> {
        let cid = client_id.unwrap_or("").to_string();
        if !cid.is_empty() && self.resting.iter().any(|o| o.client_id == cid) {
            return Err(OrderError::ExchangeRejected(format!(
                "duplicate client order id {}",
                cid
            )));
        }
        let order_id = self.next_order_id();
        self.resting.push(OpenOrderInfo {
            order_id: order_id.clone(),
            client_id: cid.clone(),
            side,
            price,
            amount,
            reduce_only,
        });
        self.placements += 1;
        Ok(OrderAck {
            order_id,
            client_id: cid,
        })
    }

    /// Executes a resting order as fully filled, applying its position effect.
    /// Returns the removed order so tests can build the matching WS event.
    pub fn fill_order(&mut self, order_id: &str) -> Option<OpenOrderInfo> {
        let idx = self.resting.iter().position(|o| o.order_id == order_id)?;
        let order = self.resting.remove(idx);
        match order.side {
            Side::Sell => self.position_contracts += order.amount,
            Side::Buy => {
                self.position_contracts = (self.position_contracts - order.amount).max(0.0)
            }
        }
        Some(order)
    }

    pub fn open_order_by_cid(&self, client_id: &str) -> Option<&OpenOrderInfo> {
        self.resting.iter().find(|o| o.client_id == client_id)
    }
}

#[async_trait]
impl ExchangeClient for PaperExchange {
    fn symbol(&self) -> &str {
        &self.symbol
    }

    fn market(&self) -> &MarketSpec {
        &self.market
    }

    async fn current_price(&mut self) -> Result<Option<f64>, OrderError> {
        Ok(self.price)
    }

    async fn best_ask(&mut self) -> Result<Option<f64>, OrderError> {
        Ok(self.ask.or(self.price))
    }

    async fn position(&mut self) -> Result<Option<PositionInfo>, OrderError> {
        if self.position_contracts <= 0.0 {
            return Ok(None);
        }
        Ok(Some(PositionInfo {
            contracts: self.position_contracts,
            entry_price: self.entry_price,
            unrealized_pnl: self.unrealized_pnl,
            realized_pnl: self.realized_pnl,
            initial_margin: self.initial_margin,
        }))
    }

    async fn open_orders(&mut self) -> Result<Vec<OpenOrderInfo>, OrderError> {
        Ok(self.resting.clone())
    }

    async fn place_market_short(
        &mut self,
        contracts: f64,
        client_id: Option<&str>,
    ) -> Result<OrderAck, OrderError> {
        self.take_injected_failure()?;
        let cid = client_id.unwrap_or("").to_string();
        if !cid.is_empty() && self.last_market_cid.as_deref() == Some(cid.as_str()) {
            return Err(OrderError::ExchangeRejected(format!(
                "duplicate client order id {}",
                cid
            )));
        }
        self.position_contracts += contracts;
        self.market_shorts.push((contracts, cid.clone()));
        if !cid.is_empty() {
            self.last_market_cid = Some(cid.clone());
        }
        self.placements += 1;
        Ok(OrderAck {
            order_id: self.next_order_id(),
            client_id: cid,
        })
    }

    async fn place_limit_short(
        &mut self,
        contracts: f64,
        price: f64,
        _style: LimitStyle,
        client_id: Option<&str>,
    ) -> Result<OrderAck, OrderError> {
        self.take_injected_failure()?;
        self.rest_order(Side::Sell, price, contracts, false, client_id)
    }

    async fn place_reduce_only_tp(
        &mut self,
        contracts: f64,
        price: f64,
        client_id: &str,
    ) -> Result<OrderAck, OrderError> {
        self.take_injected_failure()?;
        self.rest_order(Side::Buy, price, contracts, true, Some(client_id))
    }

    async fn cancel_order(&mut self, order_id: &str) -> Result<(), OrderError> {
        let before = self.resting.len();
        self.resting.retain(|o| o.order_id != order_id);
        if self.resting.len() == before {
            return Err(OrderError::ExchangeRejected(format!(
                "order {} not found",
                order_id
            )));
        }
        self.cancels += 1;
        Ok(())
    }

    async fn set_leverage(&mut self, leverage: u32) -> Result<(), OrderError> {
        self.leverage = Some(leverage);
        Ok(())
    }

    async fn close_position(&mut self) -> Result<(), OrderError> {
        self.position_contracts = 0.0;
        self.position_closes += 1;
        Ok(())
    }

    async fn close(&mut self) {}

    fn as_paper_mut(&mut self) -> Option<&mut PaperExchange> {
        Some(self)
    }
}

// ─── Live Exchange (OKX v5 REST) ─────────────────────────────────────────────

const OKX_REST_URL: &str = "https://www.okx.com";
const REST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct OkxExchange {
    symbol: String,
    inst_id: String,
    credentials: Credentials,
    demo: bool,
    client: reqwest::Client,
    market: MarketSpec,
}

impl OkxExchange {
    /// Builds the adapter and resolves instrument metadata. A symbol the
    /// exchange does not list is a configuration error and fails the start.
    pub async fn connect(
        credentials: Credentials,
        symbol: &str,
        demo: bool,
    ) -> Result<Self, OrderError> {
        let inst_id = symbol_to_inst_id(symbol)
            .ok_or_else(|| OrderError::MarketNotFound(format!("unparsable symbol {}", symbol)))?;

        let client = reqwest::Client::builder()
            .timeout(REST_TIMEOUT)
            .build()
            .map_err(|e| OrderError::NetworkError(e.to_string()))?;

        let mut this = Self {
            symbol: symbol.to_string(),
            inst_id,
            credentials,
            demo,
            client,
            market: MarketSpec {
                contract_size: 0.0,
                tick_size: 0.0,
                min_amount: 0.0,
                lot_size: 0.0,
            },
        };

        let path = format!(
            "/api/v5/public/instruments?instType=SWAP&instId={}",
            this.inst_id
        );
        let data = this.get_public(&path).await?;
        let inst = data
            .get(0)
            .ok_or_else(|| OrderError::MarketNotFound(this.symbol.clone()))?;

        let market = MarketSpec {
            contract_size: str_field(inst, "ctVal").unwrap_or(0.0),
            tick_size: str_field(inst, "tickSz").unwrap_or(0.0),
            min_amount: str_field(inst, "minSz").unwrap_or(0.0),
            lot_size: str_field(inst, "lotSz").unwrap_or(0.0),
        };
        if market.contract_size <= 0.0 || market.tick_size <= 0.0 || market.lot_size <= 0.0 {
            return Err(OrderError::MarketNotFound(format!(
                "incomplete instrument metadata for {}",
                this.symbol
            )));
        }
        log::info!(
            "[OKX {}] instrument loaded: ctVal={} tickSz={} minSz={} lotSz={}",
            this.symbol,
            market.contract_size,
            market.tick_size,
            market.min_amount,
            market.lot_size
        );
        this.market = market;
        Ok(this)
    }

    fn auth_headers(
        &self,
        builder: reqwest::RequestBuilder,
        method: &str,
        path: &str,
        body: &str,
    ) -> reqwest::RequestBuilder {
        let ts = signing::rest_timestamp();
        let sig = signing::sign(
            &self.credentials.api_secret,
            &signing::rest_prehash(&ts, method, path, body),
        );
        let mut b = builder
            .header("OK-ACCESS-KEY", &self.credentials.api_key)
            .header("OK-ACCESS-SIGN", sig)
            .header("OK-ACCESS-TIMESTAMP", ts)
            .header("OK-ACCESS-PASSPHRASE", &self.credentials.passphrase);
        if self.demo {
            b = b.header("x-simulated-trading", "1");
        }
        b
    }

    /// Unwraps the `{code, msg, data}` envelope every OKX endpoint returns.
    fn unwrap_envelope(payload: Value) -> Result<Value, OrderError> {
        let code = payload["code"].as_str().unwrap_or("");
        if code != "0" {
            let msg = payload["msg"].as_str().unwrap_or("").to_string();
            return Err(match code {
                "50011" => OrderError::RateLimited,
                "50111" | "50113" | "50114" => OrderError::AuthFailed(msg),
                _ => OrderError::ExchangeRejected(format!("code {}: {}", code, msg)),
            });
        }
        Ok(payload["data"].clone())
    }

    async fn get_public(&self, path: &str) -> Result<Value, OrderError> {
        let resp = self
            .client
            .get(format!("{}{}", OKX_REST_URL, path))
            .send()
            .await
            .map_err(|e| OrderError::NetworkError(e.to_string()))?;
        if resp.status().as_u16() == 429 {
            return Err(OrderError::RateLimited);
        }
        let payload: Value = resp
            .json()
            .await
            .map_err(|e| OrderError::NetworkError(e.to_string()))?;
        Self::unwrap_envelope(payload)
    }

    async fn get_private(&self, path: &str) -> Result<Value, OrderError> {
        let builder = self.client.get(format!("{}{}", OKX_REST_URL, path));
        let resp = self
            .auth_headers(builder, "GET", path, "")
            .send()
            .await
            .map_err(|e| OrderError::NetworkError(e.to_string()))?;
        if resp.status().as_u16() == 429 {
            return Err(OrderError::RateLimited);
        }
        let payload: Value = resp
            .json()
            .await
            .map_err(|e| OrderError::NetworkError(e.to_string()))?;
        Self::unwrap_envelope(payload)
    }

    async fn post_private(&self, path: &str, body: Value) -> Result<Value, OrderError> {
        let body_str = body.to_string();
        let builder = self
            .client
            .post(format!("{}{}", OKX_REST_URL, path))
            .header("Content-Type", "application/json")
            .body(body_str.clone());
        let resp = self
            .auth_headers(builder, "POST", path, &body_str)
            .send()
            .await
            .map_err(|e| OrderError::NetworkError(e.to_string()))?;
        if resp.status().as_u16() == 429 {
            return Err(OrderError::RateLimited);
        }
        let payload: Value = resp
            .json()
            .await
            .map_err(|e| OrderError::NetworkError(e.to_string()))?;
        Self::unwrap_envelope(payload)
    }

    /// Places one order and checks the per-order `sCode` the trade endpoints
    /// return even under a top-level success code.
    async fn place_order(&self, mut body: Value, client_id: Option<&str>) -> Result<OrderAck, OrderError> {
        body["instId"] = json!(self.inst_id);
        body["tdMode"] = json!("isolated");
        body["posSide"] = json!("short");
        if let Some(cid) = client_id {
            if !cid.is_empty() {
                body["clOrdId"] = json!(cid);
            }
        }
        let data = self.post_private("/api/v5/trade/order", body).await?;
        let entry = data
            .get(0)
            .ok_or_else(|| OrderError::ExchangeRejected("empty order response".to_string()))?;
        let s_code = entry["sCode"].as_str().unwrap_or("0");
        if s_code != "0" {
            let s_msg = entry["sMsg"].as_str().unwrap_or("").to_string();
            return Err(OrderError::ExchangeRejected(format!(
                "sCode {}: {}",
                s_code, s_msg
            )));
        }
        Ok(OrderAck {
            order_id: entry["ordId"].as_str().unwrap_or("").to_string(),
            client_id: entry["clOrdId"].as_str().unwrap_or("").to_string(),
        })
    }
}

#[async_trait]
impl ExchangeClient for OkxExchange {
    fn symbol(&self) -> &str {
        &self.symbol
    }

    fn market(&self) -> &MarketSpec {
        &self.market
    }

    async fn current_price(&mut self) -> Result<Option<f64>, OrderError> {
        let path = format!("/api/v5/market/ticker?instId={}", self.inst_id);
        let data = self.get_public(&path).await?;
        Ok(data.get(0).and_then(|t| str_field(t, "last")))
    }

    async fn best_ask(&mut self) -> Result<Option<f64>, OrderError> {
        let path = format!("/api/v5/market/books?instId={}&sz=1", self.inst_id);
        let data = self.get_public(&path).await?;
        let ask = data
            .get(0)
            .and_then(|book| book["asks"].get(0))
            .and_then(|level| level.get(0))
            .and_then(value_as_f64);
        Ok(ask)
    }

    async fn position(&mut self) -> Result<Option<PositionInfo>, OrderError> {
        let path = format!(
            "/api/v5/account/positions?instType=SWAP&instId={}",
            self.inst_id
        );
        let data = self.get_private(&path).await?;
        let Some(pos) = data.get(0) else {
            return Ok(None);
        };
        let contracts = str_field(pos, "pos").unwrap_or(0.0).abs();
        if contracts <= 0.0 {
            return Ok(None);
        }
        Ok(Some(PositionInfo {
            contracts,
            entry_price: str_field(pos, "avgPx").unwrap_or(0.0),
            unrealized_pnl: str_field(pos, "upl").unwrap_or(0.0),
            realized_pnl: str_field(pos, "realizedPnl").unwrap_or(0.0),
            initial_margin: str_field(pos, "imr").unwrap_or(0.0),
        }))
    }

    async fn open_orders(&mut self) -> Result<Vec<OpenOrderInfo>, OrderError> {
        let path = format!(
            "/api/v5/trade/orders-pending?instType=SWAP&instId={}",
            self.inst_id
        );
        let data = self.get_private(&path).await?;
        let mut orders = Vec::new();
        if let Some(arr) = data.as_array() {
            for o in arr {
                let Some(side) = o["side"].as_str().and_then(Side::parse) else {
                    continue;
                };
                orders.push(OpenOrderInfo {
                    order_id: o["ordId"].as_str().unwrap_or("").to_string(),
                    client_id: o["clOrdId"].as_str().unwrap_or("").to_string(),
                    side,
                    price: str_field(o, "px").unwrap_or(0.0),
                    amount: str_field(o, "sz").unwrap_or(0.0),
                    reduce_only: o["reduceOnly"].as_str() == Some("true")
                        || o["reduceOnly"].as_bool() == Some(true),
                });
            }
        }
        Ok(orders)
    }

    async fn place_market_short(
        &mut self,
        contracts: f64,
        client_id: Option<&str>,
    ) -> Result<OrderAck, OrderError> {
        let body = json!({
            "side": "sell",
            "ordType": "market",
            "sz": format_amount(contracts),
        });
        self.place_order(body, client_id).await
    }

    async fn place_limit_short(
        &mut self,
        contracts: f64,
        price: f64,
        style: LimitStyle,
        client_id: Option<&str>,
    ) -> Result<OrderAck, OrderError> {
        let ord_type = match style {
            LimitStyle::PostOnly => "post_only",
            LimitStyle::Ioc => "ioc",
        };
        let body = json!({
            "side": "sell",
            "ordType": ord_type,
            "sz": format_amount(contracts),
            "px": format_amount(snap_to_tick(price, self.market.tick_size)),
        });
        self.place_order(body, client_id).await
    }

    async fn place_reduce_only_tp(
        &mut self,
        contracts: f64,
        price: f64,
        client_id: &str,
    ) -> Result<OrderAck, OrderError> {
        let body = json!({
            "side": "buy",
            "ordType": "limit",
            "reduceOnly": true,
            "sz": format_amount(contracts),
            "px": format_amount(snap_to_tick(price, self.market.tick_size)),
        });
        self.place_order(body, Some(client_id)).await
    }

    async fn cancel_order(&mut self, order_id: &str) -> Result<(), OrderError> {
        let body = json!({ "instId": self.inst_id, "ordId": order_id });
        let data = self.post_private("/api/v5/trade/cancel-order", body).await?;
        if let Some(entry) = data.get(0) {
            let s_code = entry["sCode"].as_str().unwrap_or("0");
            if s_code != "0" {
                return Err(OrderError::ExchangeRejected(format!(
                    "cancel sCode {}: {}",
                    s_code,
                    entry["sMsg"].as_str().unwrap_or("")
                )));
            }
        }
        Ok(())
    }

    async fn set_leverage(&mut self, leverage: u32) -> Result<(), OrderError> {
        let body = json!({
            "instId": self.inst_id,
            "lever": leverage.to_string(),
            "mgnMode": "isolated",
            "posSide": "short",
        });
        self.post_private("/api/v5/account/set-leverage", body)
            .await?;
        log::info!("[OKX {}] leverage set to {}x", self.symbol, leverage);
        Ok(())
    }

    async fn close_position(&mut self) -> Result<(), OrderError> {
        let Some(pos) = self.position().await? else {
            return Ok(());
        };
        let body = json!({
            "side": "buy",
            "ordType": "market",
            "reduceOnly": true,
            "sz": format_amount(pos.contracts),
        });
        self.place_order(body, None).await?;
        log::info!(
            "[OKX {}] market close placed for {} contracts",
            self.symbol,
            pos.contracts
        );
        Ok(())
    }

    async fn close(&mut self) {
        log::debug!("[OKX {}] adapter closed", self.symbol);
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

/// Reads a numeric field that OKX may send as either a string or a number.
pub fn str_field(v: &Value, key: &str) -> Option<f64> {
    value_as_f64(&v[key])
}

pub fn value_as_f64(v: &Value) -> Option<f64> {
    v.as_f64().or_else(|| v.as_str().and_then(|s| s.parse().ok()))
}

/// Snaps a price to the nearest valid tick.
pub fn snap_to_tick(price: f64, tick_size: f64) -> f64 {
    if tick_size <= 0.0 {
        return price;
    }
    (price / tick_size).round() * tick_size
}

/// Rounds an amount down to the lot grid. A small epsilon absorbs binary
/// float error so exact multiples are not knocked down a lot.
pub fn floor_to_lot(amount: f64, lot_size: f64) -> f64 {
    if lot_size <= 0.0 {
        return amount;
    }
    ((amount / lot_size) + 1e-9).floor() * lot_size
}

/// Formats a size or price as the wire expects: fixed precision with trailing
/// zeros stripped, so `10.0` goes out as `"10"`.
pub fn format_amount(x: f64) -> String {
    let fixed = format!("{:.8}", x);
    if fixed.contains('.') {
        fixed.trim_end_matches('0').trim_end_matches('.').to_string()
    } else {
        fixed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> MarketSpec {
        MarketSpec {
            contract_size: 0.01,
            tick_size: 0.1,
            min_amount: 1.0,
            lot_size: 1.0,
        }
    }

    #[test]
    fn symbol_conversion_round_trips() {
        for s in ["BTC/USDT:USDT", "ETH/USDT:USDT", "XRP/USDC:USDC"] {
            let inst = symbol_to_inst_id(s).unwrap();
            assert_eq!(inst_id_to_symbol(&inst).unwrap(), s);
        }
        assert_eq!(
            symbol_to_inst_id("BTC/USDT:USDT").unwrap(),
            "BTC-USDT-SWAP"
        );
    }

    #[test]
    fn symbol_conversion_rejects_garbage() {
        assert!(symbol_to_inst_id("BTCUSDT").is_none());
        assert!(symbol_to_inst_id("BTC/USD:USDT").is_none()); // inverse contract
        assert!(inst_id_to_symbol("BTC-USDT").is_none());
        assert!(inst_id_to_symbol("-SWAP").is_none());
    }

    #[test]
    fn format_amount_strips_trailing_zeros() {
        assert_eq!(format_amount(10.0), "10");
        assert_eq!(format_amount(0.5), "0.5");
        assert_eq!(format_amount(1001.5), "1001.5");
        assert_eq!(format_amount(0.00010000), "0.0001");
    }

    #[test]
    fn floor_to_lot_rounds_down() {
        assert_eq!(floor_to_lot(10.9, 1.0), 10.0);
        assert_eq!(floor_to_lot(10.0, 1.0), 10.0);
        assert_eq!(floor_to_lot(0.0456, 0.01), 0.04);
        // 0.3/0.1 is 2.999…96 in binary; the epsilon keeps it at 3 lots
        assert!((floor_to_lot(0.3, 0.1) - 0.3).abs() < 1e-12);
    }

    #[test]
    fn snap_to_tick_rounds_to_grid() {
        assert_eq!(snap_to_tick(1001.54, 0.1), 1001.5);
        assert_eq!(snap_to_tick(1001.56, 0.1), 1001.6);
        assert_eq!(snap_to_tick(5.0, 0.0), 5.0);
    }

    #[tokio::test]
    async fn paper_market_short_opens_position() {
        let mut ex = PaperExchange::new("BTC/USDT:USDT", spec());
        ex.price = Some(1000.0);
        ex.set_leverage(5).await.unwrap();
        assert_eq!(ex.leverage, Some(5));
        ex.place_market_short(10.0, None).await.unwrap();
        assert_eq!(ex.position_contracts, 10.0);
        let pos = ex.position().await.unwrap().unwrap();
        assert_eq!(pos.contracts, 10.0);
    }

    #[tokio::test]
    async fn paper_rejects_duplicate_resting_cid() {
        let mut ex = PaperExchange::new("BTC/USDT:USDT", spec());
        ex.place_limit_short(1.0, 1010.0, LimitStyle::PostOnly, Some("LEGX1"))
            .await
            .unwrap();
        let err = ex
            .place_limit_short(1.0, 1010.0, LimitStyle::PostOnly, Some("LEGX1"))
            .await
            .unwrap_err();
        assert!(matches!(err, OrderError::ExchangeRejected(_)));
        assert_eq!(ex.resting.len(), 1);
    }

    #[tokio::test]
    async fn paper_fill_applies_position_effect() {
        let mut ex = PaperExchange::new("BTC/USDT:USDT", spec());
        let ack = ex
            .place_limit_short(5.0, 1010.0, LimitStyle::PostOnly, Some("LEGX2"))
            .await
            .unwrap();
        ex.fill_order(&ack.order_id).unwrap();
        assert_eq!(ex.position_contracts, 5.0);

        let tp = ex
            .place_reduce_only_tp(5.0, 990.0, "TPX2")
            .await
            .unwrap();
        ex.fill_order(&tp.order_id).unwrap();
        assert_eq!(ex.position_contracts, 0.0);
    }

    #[tokio::test]
    async fn paper_cancel_unknown_order_is_rejected() {
        let mut ex = PaperExchange::new("BTC/USDT:USDT", spec());
        assert!(ex.cancel_order("nope").await.is_err());
    }
}
