// ===============================
// src/exchange.rs
// ===============================
//
// Exchange collaborator contract. Strategies and the signal manager only see
// this trait; the concrete adapter owns admission state, timeouts and the
// push streams.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::domain::{ExchangeEvent, Kline, KlineInterval, PositionSnapshot};

#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("exchange rejected request: {0}")]
    Rejected(String),
    #[error("unexpected response shape: {0}")]
    BadResponse(String),
    #[error("adapter lock held past bound")]
    LockTimeout,
}

impl From<reqwest::Error> for ExchangeError {
    fn from(e: reqwest::Error) -> Self {
        ExchangeError::Transport(e.to_string())
    }
}

/// Everything needed to open one position attempt.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub symbol: String,
    pub price: f64,
    pub is_short: bool,
    pub is_limit: bool,
    pub amount: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub leverage: f64,
}

#[async_trait]
pub trait Exchange: Send + Sync {
    fn name(&self) -> &str;

    /// Place one entry order. Returns false (no side effects remain) when the
    /// symbol already has an attempt in flight, the ticker subscription fails
    /// or the exchange rejects the order.
    async fn place_order(&self, request: &OrderRequest) -> bool;

    async fn symbol_exists(&self, symbol: &str) -> Result<bool, ExchangeError>;

    /// Tick precision of the symbol; all notification prices are re-rounded
    /// to this.
    async fn symbol_digits(&self, symbol: &str) -> Result<u32, ExchangeError>;

    /// Best effort. A failed remote update is logged, not fatal; the caller's
    /// in-memory stop remains authoritative and the next favorable tick
    /// retries naturally.
    async fn set_stop_loss(&self, symbol: &str, is_short: bool, stop_loss: f64) -> bool;

    async fn get_position_info(&self, symbol: &str) -> Result<PositionSnapshot, ExchangeError>;

    async fn get_klines(
        &self,
        symbol: &str,
        interval: KlineInterval,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Kline>, ExchangeError>;

    /// New receiver on the adapter's event fan-out. Subscribers get snapshot
    /// copies; slow consumers lag, they never block the adapter.
    fn subscribe_events(&self) -> broadcast::Receiver<ExchangeEvent>;
}
