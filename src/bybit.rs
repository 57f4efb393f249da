// ===============================
// src/bybit.rs
// ===============================
//
// Helper (signer/types) for Bybit v5. The adapter itself lives in
// exchange_bybit.rs; this module is the wire layer only.

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::domain::Kline;

pub const RECV_WINDOW: &str = "5000";

pub fn timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn hmac_hex(secret: &str, payload: &str) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("HMAC key");
    mac.update(payload.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// v5 REST signature: HMAC_SHA256(timestamp + apiKey + recvWindow + payload)
/// where payload is the query string for GET and the JSON body for POST.
pub fn sign_request(secret: &str, api_key: &str, timestamp: u64, payload: &str) -> String {
    hmac_hex(
        secret,
        &format!("{}{}{}{}", timestamp, api_key, RECV_WINDOW, payload),
    )
}

/// v5 private WS auth signature: HMAC_SHA256("GET/realtime" + expires).
pub fn sign_ws_auth(secret: &str, expires_ms: u64) -> String {
    hmac_hex(secret, &format!("GET/realtime{}", expires_ms))
}

// ---- Minimal REST response models ----

#[derive(Debug, Deserialize)]
pub struct RestEnvelope<T> {
    #[serde(rename = "retCode")]
    pub ret_code: i64,
    #[serde(rename = "retMsg", default)]
    pub ret_msg: String,
    pub result: Option<T>,
}

impl<T> RestEnvelope<T> {
    pub fn ok(&self) -> bool {
        self.ret_code == 0
    }
}

#[derive(Debug, Deserialize)]
pub struct ListResult<T> {
    #[serde(default = "Vec::new")]
    pub list: Vec<T>,
}

#[derive(Debug, Deserialize)]
pub struct TickerRow {
    pub symbol: String,
    #[serde(rename = "lastPrice", default)]
    pub last_price: String,
}

#[derive(Debug, Deserialize)]
pub struct PositionRow {
    pub symbol: String,
    #[serde(default)]
    pub side: String, // "Buy" | "Sell" | ""
    #[serde(default)]
    pub size: String,
    #[serde(rename = "avgPrice", default)]
    pub avg_price: String,
    #[serde(rename = "positionValue", default)]
    pub position_value: String,
    #[serde(rename = "unrealisedPnl", default)]
    pub unrealised_pnl: String,
    #[serde(rename = "positionIM", default)]
    pub position_im: String,
    #[serde(default)]
    pub leverage: String,
    #[serde(rename = "stopLoss", default)]
    pub stop_loss: String,
    #[serde(rename = "takeProfit", default)]
    pub take_profit: String,
}

#[derive(Debug, Deserialize)]
pub struct OrderRow {
    #[serde(rename = "orderId")]
    pub order_id: String,
    pub symbol: String,
    #[serde(rename = "orderStatus", default)]
    pub order_status: String,
    #[serde(rename = "cumExecQty", default)]
    pub cum_exec_qty: String,
    #[serde(default)]
    pub qty: String,
}

#[derive(Debug, Deserialize)]
pub struct OrderAck {
    #[serde(rename = "orderId")]
    pub order_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ClosedPnlRow {
    pub symbol: String,
    #[serde(rename = "closedPnl", default)]
    pub closed_pnl: String,
}

/// Kline rows come as positional string arrays:
/// [startTime, open, high, low, close, volume, turnover]
pub fn parse_kline_row(row: &[String]) -> Option<Kline> {
    if row.len() < 6 {
        return None;
    }
    Some(Kline {
        open_time_ms: row[0].parse().ok()?,
        open: row[1].parse().ok()?,
        high: row[2].parse().ok()?,
        low: row[3].parse().ok()?,
        close: row[4].parse().ok()?,
        volume: row[5].parse().ok()?,
    })
}

// ---- Minimal WS stream models ----

#[derive(Debug, Deserialize)]
pub struct WsEnvelope {
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub op: Option<String>,
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

/// One execution (fill) from the private stream.
#[derive(Debug, Clone, Deserialize)]
pub struct WsExecution {
    pub symbol: String,
    #[serde(rename = "execPrice", default)]
    pub exec_price: String,
    #[serde(rename = "execQty", default)]
    pub exec_qty: String,
    #[serde(rename = "orderId", default)]
    pub order_id: String,
    #[serde(rename = "closedSize", default)]
    pub closed_size: String,
}

impl WsExecution {
    pub fn price(&self) -> f64 {
        self.exec_price.parse().unwrap_or(0.0)
    }
    pub fn qty(&self) -> f64 {
        self.exec_qty.parse().unwrap_or(0.0)
    }
}

/// Ticker snapshot/delta from the public stream.
#[derive(Debug, Clone, Deserialize)]
pub struct WsTicker {
    pub symbol: String,
    #[serde(rename = "lastPrice", default)]
    pub last_price: Option<String>,
}
