// ===============================
// src/strategy.rs
// ===============================
//
// One strategy instance per accepted notification. The instance is created by
// the signal manager, drives a symbol through
// Initializing -> OrderPending -> PositionOpen -> Closed and applies its
// stop-management policy on every ticker update. Exchange callbacks arrive on
// a different task than the call that created the instance, so all handlers
// share one mutex with execute().

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, error, info, warn};

use crate::calc::{calculate_amount, digits_of, pnl, pnl_percent, round_dp};
use crate::config::SignalConfig;
use crate::domain::{
    ExchangeEvent, Notification, Position, PositionClosedReason,
};
use crate::exchange::{Exchange, OrderRequest};
use crate::metrics::{POSITIONS_OPEN, STOP_UPDATES};
use crate::telegram::Notifier;

const LOCK_TIMEOUT: Duration = Duration::from_secs(60);

/// Stop-management policy, selected by the Signal rule's strategy name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    /// Take-profit from the notification's ladder at a configured index,
    /// stop from the notification. No adjustments afterwards.
    FixedTakeProfit,
    /// Take-profit at Target5; the stop ratchets through the ladder as price
    /// passes Target4/Target3/Target2.
    MoveTakeProfit,
    /// Take-profit/stop computed from the signal price and configured
    /// offsets. No adjustments afterwards.
    FixedTargets,
    /// Signal-relative entry targets plus a trailing stop that arms after a
    /// configured favorable move.
    TrailingStopLoss,
}

impl StrategyKind {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "FixedTakeProfit" => Some(StrategyKind::FixedTakeProfit),
            "MoveTakeProfit" => Some(StrategyKind::MoveTakeProfit),
            "FixedTargets" => Some(StrategyKind::FixedTargets),
            "TrailingStopLoss" => Some(StrategyKind::TrailingStopLoss),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyState {
    Initializing,
    OrderPending,
    PositionOpen,
    Closed,
}

struct Inner {
    state: StrategyState,
    notification: Option<Notification>,
    params: Option<SignalConfig>,
    position: Option<Position>,
    /// Stop sent with the entry order; becomes the position's first
    /// `last_loss`.
    initial_stop: f64,
    trailing_armed: bool,
    /// Event stream opened before the order was placed; the manager takes it
    /// to run the event pump once the instance is registered.
    events: Option<broadcast::Receiver<ExchangeEvent>>,
}

pub struct SignalStrategy {
    id: String,
    kind: StrategyKind,
    notifier: Arc<dyn Notifier>,
    completion: mpsc::UnboundedSender<String>,
    symbol: OnceLock<String>,
    exchange: OnceLock<Arc<dyn Exchange>>,
    inner: Mutex<Inner>,
}

impl SignalStrategy {
    pub fn new(
        kind: StrategyKind,
        notifier: Arc<dyn Notifier>,
        completion: mpsc::UnboundedSender<String>,
    ) -> Arc<Self> {
        let id = format!(
            "ST-{}-{}",
            Utc::now().timestamp_nanos_opt().unwrap_or(0),
            rand::thread_rng().gen::<u32>()
        );
        Arc::new(Self {
            id,
            kind,
            notifier,
            completion,
            symbol: OnceLock::new(),
            exchange: OnceLock::new(),
            inner: Mutex::new(Inner {
                state: StrategyState::Initializing,
                notification: None,
                params: None,
                position: None,
                initial_stop: 0.0,
                trailing_armed: false,
                events: None,
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Set once execute() ran; None before that.
    pub fn symbol_name(&self) -> Option<&str> {
        self.symbol.get().map(|s| s.as_str())
    }

    pub fn exchange(&self) -> Option<Arc<dyn Exchange>> {
        self.exchange.get().cloned()
    }

    pub async fn state(&self) -> StrategyState {
        self.inner.lock().await.state
    }

    pub async fn position(&self) -> Option<Position> {
        self.inner.lock().await.position.clone()
    }

    /// Hand the pre-order event stream to the caller, once.
    pub async fn take_event_stream(&self) -> Option<broadcast::Receiver<ExchangeEvent>> {
        self.inner.lock().await.events.take()
    }

    /// Validate, size and place the entry order. On success the instance is
    /// event-driven from here on; on failure it leaves no side effects and is
    /// discarded by the caller.
    pub async fn execute(
        &self,
        exchange: Arc<dyn Exchange>,
        mut notification: Notification,
        params: SignalConfig,
    ) -> bool {
        let mut inner = match tokio::time::timeout(LOCK_TIMEOUT, self.inner.lock()).await {
            Ok(inner) => inner,
            Err(_) => {
                error!(id = %self.id, "strategy lock held past bound");
                return false;
            }
        };

        let symbol = notification.symbol_name.clone();
        match exchange.symbol_exists(&symbol).await {
            Ok(true) => {}
            Ok(false) => {
                info!(%symbol, exchange = %params.exchange, "symbol not found on exchange");
                self.notifier
                    .send(&format!(
                        "Symbol {} not found on exchange {}",
                        symbol, params.exchange
                    ))
                    .await;
                return false;
            }
            Err(e) => {
                error!(%symbol, ?e, "symbol lookup failed");
                return false;
            }
        }

        let digits = match exchange.symbol_digits(&symbol).await {
            Ok(digits) => digits,
            Err(e) => {
                error!(%symbol, ?e, "could not read tick precision");
                return false;
            }
        };
        // fixes rounding for the whole instance lifetime
        notification.round(digits);

        let is_short = notification.is_short();
        let (stop_loss, take_profit, is_limit) = match self.kind {
            StrategyKind::FixedTakeProfit => {
                let take_profit = match notification.target(params.take_profit_index) {
                    Some(tp) => tp,
                    None => {
                        info!(%symbol, index = params.take_profit_index, "bad take profit index");
                        self.notifier
                            .send(&format!(
                                "Could not read take profit for {} index {}",
                                symbol, params.take_profit_index
                            ))
                            .await;
                        return false;
                    }
                };
                (notification.stop_loss, take_profit, true)
            }
            StrategyKind::MoveTakeProfit => {
                (notification.stop_loss, notification.targets[4], false)
            }
            StrategyKind::FixedTargets | StrategyKind::TrailingStopLoss => {
                let price = notification.signal_price;
                let (mut stop, take) = if is_short {
                    (
                        round_dp(price + price * params.stop_loss, digits),
                        round_dp(price - price * params.take_profit, digits),
                    )
                } else {
                    (
                        round_dp(price - price * params.stop_loss, digits),
                        round_dp(price + price * params.take_profit, digits),
                    )
                };
                if params.use_stop_loss_from_signal {
                    stop = notification.stop_loss;
                }
                let is_limit = self.kind == StrategyKind::TrailingStopLoss;
                (stop, take, is_limit)
            }
        };

        let amount = calculate_amount(
            params.risk_per_trade * params.risk_factor,
            stop_loss,
            notification.signal_price,
        );

        // subscribe before placing: fills must never arrive unobserved
        let events = exchange.subscribe_events();

        let request = OrderRequest {
            symbol: symbol.clone(),
            price: notification.signal_price,
            is_short,
            is_limit,
            amount,
            stop_loss,
            take_profit,
            leverage: params.leverage,
        };
        if !exchange.place_order(&request).await {
            debug!(%symbol, "order not accepted, discarding strategy instance");
            return false;
        }

        let _ = self.symbol.set(symbol.clone());
        let _ = self.exchange.set(exchange);
        inner.state = StrategyState::OrderPending;
        inner.initial_stop = stop_loss;
        inner.notification = Some(notification);
        inner.params = Some(params);
        inner.events = Some(events);
        true
    }

    async fn on_order_filled(&self, fill_price: f64, fill_qty: f64) {
        let mut inner = self.inner.lock().await;
        if inner.state == StrategyState::Closed {
            return;
        }
        match inner.position.as_mut() {
            Some(position) => position.add_fill(fill_price, fill_qty),
            None => {
                let notification = match inner.notification.as_ref() {
                    Some(notification) => notification,
                    None => return,
                };
                let symbol = notification.symbol_name.clone();
                let decimals = notification.decimals;
                let is_short = notification.is_short();
                let stop = inner.initial_stop;
                inner.position =
                    Some(Position::open(&symbol, is_short, fill_price, fill_qty, stop));
                inner.state = StrategyState::PositionOpen;
                POSITIONS_OPEN.inc();
                let message = format!(
                    "Position created for {}, entry {}",
                    symbol,
                    round_dp(fill_price, decimals)
                );
                info!("{message}");
                self.notifier.send(&message).await;
            }
        }
    }

    async fn on_ticker(&self, last_price: f64) {
        let mut inner = self.inner.lock().await;
        if inner.state != StrategyState::PositionOpen || inner.position.is_none() {
            return;
        }

        if let Some(position) = inner.position.as_mut() {
            position.last_price = last_price;
        }

        let update = match self.kind {
            StrategyKind::MoveTakeProfit => ladder_stop(&inner, last_price),
            StrategyKind::TrailingStopLoss => self.trailing_stop(&mut inner, last_price).await,
            _ => None,
        };

        let Some(stop_loss) = update else { return };

        // in-memory stop first: it stays authoritative even when the remote
        // update fails, so the next favorable tick retries a tighter value
        let (symbol, is_short) = {
            let position = inner.position.as_mut().expect("position checked above");
            position.last_loss = stop_loss;
            (position.symbol_name.clone(), position.is_short)
        };
        STOP_UPDATES.with_label_values(&[&symbol]).inc();

        let Some(exchange) = self.exchange.get().cloned() else {
            return;
        };
        drop(inner);

        if !exchange.set_stop_loss(&symbol, is_short, stop_loss).await {
            warn!(%symbol, stop_loss, "remote stop update failed, will retry on next tick");
            return;
        }
        let message = format!("Stop loss updated for {} to {}", symbol, stop_loss);
        info!("{message}");
        if self.kind == StrategyKind::MoveTakeProfit {
            self.notifier.send(&message).await;
        }
    }

    /// Offset trailing: inactive until price moved `trailing_start_offset`
    /// favorably from entry, then trails `trailing_offset` behind the last
    /// price, tightening only.
    async fn trailing_stop(&self, inner: &mut Inner, last_price: f64) -> Option<f64> {
        let params = inner.params.as_ref()?;
        let notification = inner.notification.as_ref()?;
        let position = inner.position.as_ref()?;
        let digits = digits_of(notification.signal_price);
        let entry = position.entry_price;
        let is_short = position.is_short;
        let last_loss = position.last_loss;
        let symbol = position.symbol_name.clone();

        let start_offset = params.trailing_start_offset;
        let trail = params.trailing_offset;

        if !inner.trailing_armed {
            let offset = if is_short {
                1.0 - last_price / entry
            } else {
                last_price / entry - 1.0
            };
            if offset > start_offset {
                inner.trailing_armed = true;
                let message = format!("Enabled trailing for {} at {}", symbol, last_price);
                info!("{message}");
                self.notifier.send(&message).await;
            }
        }
        if !inner.trailing_armed {
            return None;
        }

        if is_short {
            let stop = round_dp(last_price + last_price * trail, digits);
            (stop < last_loss).then_some(stop)
        } else {
            let stop = round_dp(last_price - last_price * trail, digits);
            (stop > last_loss).then_some(stop)
        }
    }

    /// Returns true when the instance reached its terminal state.
    async fn on_position_closed(
        &self,
        exit_price: f64,
        exchange_pnl: f64,
        reason: PositionClosedReason,
    ) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.state == StrategyState::Closed {
            return true;
        }

        let decimals = inner
            .notification
            .as_ref()
            .map(|n| n.decimals)
            .unwrap_or(2);
        let leverage = inner.params.as_ref().map(|p| p.leverage).unwrap_or(1.0);
        match inner.position.as_mut() {
            Some(position) => {
                position.exit_price = exit_price;
                let realized = if exchange_pnl != 0.0 {
                    exchange_pnl
                } else {
                    pnl(
                        position.quantity,
                        position.entry_price,
                        position.exit_price,
                        position.is_short,
                    )
                };
                let percent = pnl_percent(
                    position.entry_price,
                    position.exit_price,
                    position.is_short,
                    leverage,
                );
                let message = format!(
                    "Position closed for {}. Entry {}, exit {}, pnl {} ({}%)",
                    position.symbol_name,
                    round_dp(position.entry_price, decimals),
                    round_dp(position.exit_price, decimals),
                    round_dp(realized, 4),
                    round_dp(percent, 2)
                );
                info!("{message}");
                self.notifier.send(&message).await;
                POSITIONS_OPEN.dec();
            }
            None if reason == PositionClosedReason::Cancelled => {
                let symbol = self.symbol_name().unwrap_or_default();
                let message = format!(
                    "Position cancelled for {} because of order timeout - was never opened!",
                    symbol
                );
                info!("{message}");
                self.notifier.send(&message).await;
            }
            None => {
                debug!(id = %self.id, "close event without position, reason {:?}", reason);
            }
        }

        inner.state = StrategyState::Closed;
        true
    }
}

/// Event pump: consumes the adapter's fan-out, routes this symbol's events
/// into the handlers and reports completion upward once closed. Spawned by
/// the manager when the instance is registered. Push-event handlers never
/// propagate errors.
pub(crate) async fn drive(
    strategy: Arc<SignalStrategy>,
    mut events: broadcast::Receiver<ExchangeEvent>,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(id = %strategy.id, missed, "event stream lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => {
                error!(id = %strategy.id, "exchange event stream closed, operator intervention required");
                return;
            }
        };

        let symbol = strategy.symbol_name().unwrap_or_default();
        if event.symbol() != symbol {
            continue;
        }

        match event {
            ExchangeEvent::OrderFilled {
                fill_price,
                fill_qty,
                ..
            } => strategy.on_order_filled(fill_price, fill_qty).await,
            ExchangeEvent::TickerChanged { last_price, .. } => {
                strategy.on_ticker(last_price).await
            }
            ExchangeEvent::PositionClosed {
                exit_price,
                exchange_pnl,
                reason,
                ..
            } => {
                if strategy
                    .on_position_closed(exit_price, exchange_pnl, reason)
                    .await
                {
                    // completion frees admission capacity at the manager
                    let _ = strategy.completion.send(strategy.id.clone());
                    return;
                }
            }
        }
    }
}

/// Staged ladder for the move-take-profit policy: past Target4 the stop goes
/// to Target3, past Target3 to Target1, past Target2 to the signal price.
/// The stop only ever tightens; violations are dropped silently.
fn ladder_stop(inner: &Inner, last_price: f64) -> Option<f64> {
    let notification = inner.notification.as_ref()?;
    let position = inner.position.as_ref()?;
    let targets = &notification.targets;

    let candidate = if position.is_short {
        if last_price < targets[3] {
            Some(targets[2])
        } else if last_price < targets[2] {
            Some(targets[0])
        } else if last_price < targets[1] {
            Some(notification.signal_price)
        } else {
            None
        }
    } else if last_price > targets[3] {
        Some(targets[2])
    } else if last_price > targets[2] {
        Some(targets[0])
    } else if last_price > targets[1] {
        Some(notification.signal_price)
    } else {
        None
    };

    let candidate = candidate?;
    let tightens = if position.is_short {
        candidate < position.last_loss
    } else {
        candidate > position.last_loss
    };
    tightens.then_some(candidate)
}
