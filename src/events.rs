// ─────────────────────────────────────────────────────────────────────────────
// events.rs — Private Feed Payload Normalization
//
// The orders/positions channels deliver either a batch envelope
// `{"arg": {...}, "data": [record, ...]}` or a bare record, and the same
// field travels under different names depending on the message flavor
// (`avgPx` / `fillPx` / `px`, `accFillSz` / `fillSz` / `sz`). Everything is
// flattened here into typed records; unknown fields are ignored and
// malformed records surface as `None` so the engine can count and skip them.
// ─────────────────────────────────────────────────────────────────────────────
use serde_json::Value;

use crate::exchange::{value_as_f64, Side};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderState {
    Live,
    PartiallyFilled,
    Filled,
    Canceled,
    Other,
}

impl OrderState {
    pub fn from_wire(s: &str) -> OrderState {
        match s {
            "live" => OrderState::Live,
            "partially_filled" => OrderState::PartiallyFilled,
            "filled" => OrderState::Filled,
            "canceled" | "cancelled" | "partially_filled_canceled" | "mmp_canceled" => {
                OrderState::Canceled
            }
            _ => OrderState::Other,
        }
    }
}

/// One order record, normalized from whichever shape the feed used.
#[derive(Debug, Clone)]
pub struct OrderRecord {
    pub exchange_id: String,
    pub client_id: Option<String>,
    pub side: Option<Side>,
    pub state: OrderState,
    pub avg_px: Option<f64>,
    pub filled_contracts: Option<f64>,
}

/// A fill distilled from an `OrderRecord`: all fields present and positive.
#[derive(Debug, Clone)]
pub struct FillRecord {
    pub side: Side,
    pub avg_px: f64,
    pub filled_contracts: f64,
    pub exchange_id: String,
    pub client_id: Option<String>,
}

impl OrderRecord {
    pub fn parse(v: &Value) -> Option<OrderRecord> {
        let exchange_id = v["ordId"].as_str()?.to_string();
        if exchange_id.is_empty() {
            return None;
        }
        let client_id = v["clOrdId"]
            .as_str()
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        let side = v["side"].as_str().and_then(Side::parse);
        let state = OrderState::from_wire(v["state"].as_str().unwrap_or(""));
        Some(OrderRecord {
            exchange_id,
            client_id,
            side,
            state,
            avg_px: first_positive(v, &["avgPx", "fillPx", "px"]),
            filled_contracts: first_positive(v, &["accFillSz", "fillSz", "sz"]),
        })
    }

    /// Distills a fill. Returns `None` when the record lacks a side or has
    /// non-positive price/size; the caller decides whether that is noise.
    pub fn normalize_fill(&self) -> Option<FillRecord> {
        let side = self.side?;
        let avg_px = self.avg_px.filter(|p| *p > 0.0)?;
        let filled_contracts = self.filled_contracts.filter(|c| *c > 0.0)?;
        Some(FillRecord {
            side,
            avg_px,
            filled_contracts,
            exchange_id: self.exchange_id.clone(),
            client_id: self.client_id.clone(),
        })
    }
}

/// One positions-channel record.
#[derive(Debug, Clone)]
pub struct PositionRecord {
    pub contracts: f64,
}

impl PositionRecord {
    pub fn parse(v: &Value) -> Option<PositionRecord> {
        let contracts = value_as_f64(&v["pos"])?.abs();
        Some(PositionRecord { contracts })
    }
}

/// Splits a payload into raw records: the envelope's `data` array when
/// present, the payload itself when it already looks like a record.
pub fn raw_records(payload: &Value) -> Vec<&Value> {
    if let Some(arr) = payload["data"].as_array() {
        return arr.iter().collect();
    }
    if payload.is_object() {
        return vec![payload];
    }
    Vec::new()
}

fn first_positive(v: &Value, keys: &[&str]) -> Option<f64> {
    keys.iter()
        .filter_map(|k| value_as_f64(&v[k]))
        .find(|x| *x > 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_batch_envelope() {
        let payload = json!({
            "arg": {"channel": "orders", "instId": "BTC-USDT-SWAP"},
            "data": [
                {"ordId": "1", "state": "filled", "side": "sell",
                 "avgPx": "1001.5", "accFillSz": "10"},
                {"ordId": "2", "state": "canceled", "side": "sell"}
            ]
        });
        let raw = raw_records(&payload);
        assert_eq!(raw.len(), 2);
        let first = OrderRecord::parse(raw[0]).unwrap();
        assert_eq!(first.state, OrderState::Filled);
        assert_eq!(first.avg_px, Some(1001.5));
        assert_eq!(first.filled_contracts, Some(10.0));
    }

    #[test]
    fn parses_single_record() {
        let payload = json!({"ordId": "7", "state": "live", "side": "buy"});
        let raw = raw_records(&payload);
        assert_eq!(raw.len(), 1);
        let rec = OrderRecord::parse(raw[0]).unwrap();
        assert_eq!(rec.exchange_id, "7");
        assert_eq!(rec.state, OrderState::Live);
        assert_eq!(rec.side, Some(Side::Buy));
    }

    #[test]
    fn fill_price_falls_back_through_aliases() {
        let rec = OrderRecord::parse(&json!({
            "ordId": "3", "state": "filled", "side": "sell",
            "fillPx": "999.5", "fillSz": "4"
        }))
        .unwrap();
        assert_eq!(rec.avg_px, Some(999.5));
        assert_eq!(rec.filled_contracts, Some(4.0));

        // avgPx of "0" is skipped in favor of the next alias
        let rec = OrderRecord::parse(&json!({
            "ordId": "4", "state": "filled", "side": "sell",
            "avgPx": "0", "px": "1000", "sz": "2"
        }))
        .unwrap();
        assert_eq!(rec.avg_px, Some(1000.0));
    }

    #[test]
    fn malformed_record_is_rejected() {
        assert!(OrderRecord::parse(&json!({"state": "filled"})).is_none());
        assert!(OrderRecord::parse(&json!({"ordId": ""})).is_none());
        assert!(OrderRecord::parse(&json!("not an object")).is_none());
    }

    #[test]
    fn normalize_fill_enforces_guards() {
        let no_side = OrderRecord::parse(&json!({
            "ordId": "5", "state": "filled", "avgPx": "10", "sz": "1"
        }))
        .unwrap();
        assert!(no_side.normalize_fill().is_none());

        let zero_size = OrderRecord::parse(&json!({
            "ordId": "6", "state": "filled", "side": "sell", "avgPx": "10"
        }))
        .unwrap();
        assert!(zero_size.normalize_fill().is_none());

        let ok = OrderRecord::parse(&json!({
            "ordId": "8", "state": "partially_filled", "side": "sell",
            "avgPx": "10", "accFillSz": "1", "clOrdId": "LEGBTCUSDTUSDT100000"
        }))
        .unwrap()
        .normalize_fill()
        .unwrap();
        assert_eq!(ok.side, Side::Sell);
        assert_eq!(ok.client_id.as_deref(), Some("LEGBTCUSDTUSDT100000"));
    }

    #[test]
    fn position_record_takes_abs_size() {
        let rec = PositionRecord::parse(&json!({"pos": "-20"})).unwrap();
        assert_eq!(rec.contracts, 20.0);
        assert!(PositionRecord::parse(&json!({"upl": "1"})).is_none());
    }

    #[test]
    fn cancel_state_aliases() {
        for s in ["canceled", "cancelled", "partially_filled_canceled"] {
            assert_eq!(OrderState::from_wire(s), OrderState::Canceled);
        }
        assert_eq!(OrderState::from_wire("who_knows"), OrderState::Other);
    }
}
