// ===============================
// src/domain.rs
// ===============================
use serde::{Deserialize, Serialize};

use crate::calc::round_dp;

/// Why a position left the books.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionClosedReason {
    /// Closed by the exchange (take profit, stop loss or manual sell).
    Sold,
    /// The entry order timed out and was cancelled before any position existed.
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SignalDirection {
    Long,
    Short,
    #[default]
    Any,
}

impl SignalDirection {
    /// Does this rule accept a notification with the given signed signal value?
    pub fn matches(&self, signal: i32) -> bool {
        match self {
            SignalDirection::Long => signal > 0,
            SignalDirection::Short => signal < 0,
            SignalDirection::Any => true,
        }
    }
}

/// Raw webhook payload. Everything optional; unknown shapes are dropped by the
/// ingress after logging.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RawNotification {
    pub r#type: Option<i32>,
    pub signal_type_id: Option<i32>,
    pub market_name: Option<String>,
    pub signal: Option<i32>,
    pub signal_price: Option<f64>,
    pub stop_loss: Option<f64>,
    pub target1: Option<f64>,
    pub target2: Option<f64>,
    pub target3: Option<f64>,
    pub target4: Option<f64>,
    pub target5: Option<f64>,
    pub closed: Option<bool>,
}

/// One inbound trading alert. Immutable after creation except for `round`,
/// which fixes the tick precision once and re-rounds every price in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub r#type: i32,
    pub signal_type_id: i32,
    pub symbol_name: String,
    /// Sign encodes direction: > 0 long, < 0 short.
    pub signal: i32,
    pub signal_price: f64,
    pub stop_loss: f64,
    /// Ascending take-profit ladder, Target1..Target5.
    pub targets: [f64; 5],
    pub closed: bool,
    /// Tick precision, assigned by `round` once the symbol is known.
    pub decimals: u32,
}

impl Notification {
    pub fn from_raw(raw: RawNotification) -> Self {
        Self {
            r#type: raw.r#type.unwrap_or(0),
            signal_type_id: raw.signal_type_id.unwrap_or(0),
            symbol_name: raw.market_name.unwrap_or_default(),
            signal: raw.signal.unwrap_or(0),
            signal_price: raw.signal_price.unwrap_or(0.0),
            stop_loss: raw.stop_loss.unwrap_or(0.0),
            targets: [
                raw.target1.unwrap_or(0.0),
                raw.target2.unwrap_or(0.0),
                raw.target3.unwrap_or(0.0),
                raw.target4.unwrap_or(0.0),
                raw.target5.unwrap_or(0.0),
            ],
            closed: raw.closed.unwrap_or(false),
            decimals: 0,
        }
    }

    pub fn is_short(&self) -> bool {
        self.signal < 0
    }

    /// Take-profit level by 1-based ladder index.
    pub fn target(&self, index: usize) -> Option<f64> {
        if (1..=5).contains(&index) {
            Some(self.targets[index - 1])
        } else {
            None
        }
    }

    /// One-way: fixes `decimals` and re-rounds all prices in place. Called once
    /// per notification after the symbol's tick precision is known.
    pub fn round(&mut self, decimals: u32) {
        self.decimals = decimals;
        self.signal_price = round_dp(self.signal_price, decimals);
        self.stop_loss = round_dp(self.stop_loss, decimals);
        for t in self.targets.iter_mut() {
            *t = round_dp(*t, decimals);
        }
    }
}

/// Runtime state of one open exchange position, owned by its strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol_name: String,
    pub is_short: bool,
    /// Volume-weighted average of fills.
    pub entry_price: f64,
    /// Cumulative filled size, only grows via partial fills.
    pub quantity: f64,
    pub last_price: f64,
    /// Last stop-loss value sent to the exchange. Authoritative for trailing
    /// comparisons even if a remote update transiently failed.
    pub last_loss: f64,
    pub exit_price: f64,
}

impl Position {
    pub fn open(symbol: &str, is_short: bool, fill_price: f64, fill_qty: f64, stop: f64) -> Self {
        Self {
            symbol_name: symbol.to_string(),
            is_short,
            entry_price: fill_price,
            quantity: fill_qty,
            last_price: fill_price,
            last_loss: stop,
            exit_price: 0.0,
        }
    }

    /// Accumulate a partial fill: quantity sums, entry becomes the
    /// quantity-weighted average of all fill prices.
    pub fn add_fill(&mut self, fill_price: f64, fill_qty: f64) {
        let total = self.quantity + fill_qty;
        if total > 0.0 {
            self.entry_price = (self.entry_price * self.quantity + fill_price * fill_qty) / total;
        }
        self.quantity = total;
    }
}

/// Lifecycle events pushed by an exchange adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ExchangeEvent {
    OrderFilled {
        symbol: String,
        fill_price: f64,
        fill_qty: f64,
    },
    PositionClosed {
        symbol: String,
        exit_price: f64,
        /// Realized PnL as reported by the exchange, 0.0 when unknown.
        exchange_pnl: f64,
        reason: PositionClosedReason,
    },
    TickerChanged {
        symbol: String,
        last_price: f64,
    },
}

impl ExchangeEvent {
    pub fn symbol(&self) -> &str {
        match self {
            ExchangeEvent::OrderFilled { symbol, .. } => symbol,
            ExchangeEvent::PositionClosed { symbol, .. } => symbol,
            ExchangeEvent::TickerChanged { symbol, .. } => symbol,
        }
    }
}

/// Point-in-time view of a live position, as the exchange reports it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub valid: bool,
    pub symbol_name: String,
    pub quantity: f64,
    pub unrealized_pnl: f64,
    pub margin: f64,
    pub leverage: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    /// Position value in quote currency.
    pub size: f64,
    pub is_short: bool,
}

impl PositionSnapshot {
    pub fn as_string(&self) -> String {
        format!(
            "{}: qty {}, pnl {:.4}, margin {:.4}, lev {}, sl {}, tp {}, {}",
            self.symbol_name,
            self.quantity,
            self.unrealized_pnl,
            self.margin,
            self.leverage,
            self.stop_loss,
            self.take_profit,
            if self.is_short { "short" } else { "long" }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteCommandType {
    ChangeStrategyState,
    ChangeStrategyRisk,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteCommandTarget {
    All,
    Long,
    Short,
}

/// Runtime control command, delivered over the webhook ingress.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct RemoteCommand {
    pub r#type: RemoteCommandType,
    pub target: RemoteCommandTarget,
    #[serde(default)]
    pub risk_factor: Option<f64>,
    #[serde(default)]
    pub is_signal_active: Option<bool>,
}

/// One historical candle, used by signal filters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Kline {
    pub open_time_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KlineInterval {
    Day,
}

impl KlineInterval {
    pub fn as_millis(&self) -> i64 {
        match self {
            KlineInterval::Day => 86_400_000,
        }
    }
}

/// Journal events for the JSONL recorder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    Notification(Notification),
    Command(RemoteCommand),
    Exchange(ExchangeEvent),
    Note(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notification() -> Notification {
        Notification::from_raw(RawNotification {
            r#type: Some(1),
            signal_type_id: Some(2),
            market_name: Some("BTCUSDT".to_string()),
            signal: Some(1),
            signal_price: Some(50000.123456),
            stop_loss: Some(49000.987654),
            target1: Some(50500.0),
            target2: Some(51000.0),
            target3: Some(51500.0),
            target4: Some(52000.0),
            target5: Some(52500.0),
            closed: None,
        })
    }

    #[test]
    fn round_fixes_decimals_and_prices() {
        let mut n = notification();
        n.round(2);
        assert_eq!(n.decimals, 2);
        assert_eq!(n.signal_price, 50000.12);
        assert_eq!(n.stop_loss, 49000.99);
        assert_eq!(n.targets[4], 52500.0);
    }

    #[test]
    fn target_index_is_one_based() {
        let n = notification();
        assert_eq!(n.target(1), Some(50500.0));
        assert_eq!(n.target(5), Some(52500.0));
        assert_eq!(n.target(0), None);
        assert_eq!(n.target(6), None);
    }

    #[test]
    fn direction_from_signal_sign() {
        let mut n = notification();
        assert!(!n.is_short());
        n.signal = -3;
        assert!(n.is_short());
        assert!(SignalDirection::Short.matches(n.signal));
        assert!(!SignalDirection::Long.matches(n.signal));
        assert!(SignalDirection::Any.matches(n.signal));
    }

    #[test]
    fn fills_accumulate_with_weighted_entry() {
        let mut p = Position::open("BTCUSDT", false, 100.0, 2.0, 95.0);
        p.add_fill(110.0, 1.0);
        assert_eq!(p.quantity, 3.0);
        assert!((p.entry_price - 103.333333).abs() < 1e-4);
        p.add_fill(103.333333, 3.0);
        assert_eq!(p.quantity, 6.0);
        assert!((p.entry_price - 103.333333).abs() < 1e-4);
    }

    #[test]
    fn raw_notification_parses_pascal_case() {
        let raw: RawNotification = serde_json::from_str(
            r#"{"Type":1,"SignalTypeId":2,"MarketName":"BTCUSDT","Signal":-1,
                "SignalPrice":50000,"StopLoss":51000,
                "Target1":49500,"Target2":49000,"Target3":48500,"Target4":48000,"Target5":47500}"#,
        )
        .unwrap();
        let n = Notification::from_raw(raw);
        assert_eq!(n.symbol_name, "BTCUSDT");
        assert!(n.is_short());
        assert_eq!(n.targets[0], 49500.0);
        assert!(!n.closed);
    }
}
