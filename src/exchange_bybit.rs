// ===============================
// src/exchange_bybit.rs
// ===============================
//
// Bybit USDT-perpetual adapter (REST + private execution stream + public
// ticker stream).
//
// Concurrency: one mutex guards the whole admission state. place_order, the
// trade-update handler and the reconciliation loop are mutually exclusive
// through it; none of them may observe in-flight/timeout state concurrently.
// Events are collected under the lock and broadcast only after release, so
// strategy handlers never run while the adapter lock is held.

use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::{AHashMap, AHashSet};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde::de::DeserializeOwned;
use serde_json::json;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex, MutexGuard};
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::bybit::{
    parse_kline_row, sign_request, sign_ws_auth, timestamp_ms, ClosedPnlRow, ListResult,
    OrderAck, OrderRow, PositionRow, RestEnvelope, TickerRow, WsEnvelope, WsExecution, WsTicker,
    RECV_WINDOW,
};
use crate::calc::digits_of;
use crate::config::ExchangeSettings;
use crate::domain::{
    ExchangeEvent, Kline, KlineInterval, PositionClosedReason, PositionSnapshot,
};
use crate::exchange::{Exchange, ExchangeError, OrderRequest};
use crate::metrics::{ORDERS_PLACED, ORDERS_REJECTED, RECONCILE_ACTIONS, WS_RECONNECTS};

pub const NAME: &str = "BybitFutures";

/// A held adapter lock past this bound is a fatal adapter fault, not a
/// retry case.
const LOCK_TIMEOUT: Duration = Duration::from_secs(120);
const RECONCILE_INTERVAL: Duration = Duration::from_secs(60);

// ---- Admission / timeout bookkeeping ----

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FlightStage {
    /// Order submitted, no fill confirmed yet.
    Ordered,
    /// Authoritative position quantity seen > 0.
    Open,
}

#[derive(Debug, Clone)]
pub(crate) struct OrderTimeout {
    pub order_id: String,
    pub symbol: String,
    pub deadline: Instant,
}

/// All four collections move together under the adapter mutex. A symbol in
/// `in_flight` is backed by its timeout records until released.
#[derive(Default)]
pub(crate) struct AdapterState {
    in_flight: AHashMap<String, FlightStage>,
    ticker_subs: AHashSet<String>,
    order_timeouts: Vec<OrderTimeout>,
    position_deadlines: AHashMap<String, Instant>,
}

impl AdapterState {
    /// Admission gate: one attempt per symbol. Duplicates are rejected, not
    /// queued.
    pub(crate) fn try_admit(&mut self, symbol: &str) -> bool {
        if self.in_flight.contains_key(symbol) {
            return false;
        }
        self.in_flight.insert(symbol.to_string(), FlightStage::Ordered);
        true
    }

    pub(crate) fn confirm_open(&mut self, symbol: &str) {
        if let Some(stage) = self.in_flight.get_mut(symbol) {
            *stage = FlightStage::Open;
        }
    }

    #[cfg(test)]
    pub(crate) fn stage(&self, symbol: &str) -> Option<FlightStage> {
        self.in_flight.get(symbol).copied()
    }

    pub(crate) fn record_order(
        &mut self,
        order_id: &str,
        symbol: &str,
        order_deadline: Option<Instant>,
        position_deadline: Option<Instant>,
    ) {
        if let Some(deadline) = order_deadline {
            self.order_timeouts.push(OrderTimeout {
                order_id: order_id.to_string(),
                symbol: symbol.to_string(),
                deadline,
            });
        }
        if let Some(deadline) = position_deadline {
            self.position_deadlines.insert(symbol.to_string(), deadline);
        }
    }

    /// Remove and return all order timeouts past `now`.
    pub(crate) fn due_orders(&mut self, now: Instant) -> Vec<OrderTimeout> {
        let (due, keep) = self
            .order_timeouts
            .drain(..)
            .partition(|t| t.deadline <= now);
        self.order_timeouts = keep;
        due
    }

    pub(crate) fn due_positions(&self, now: Instant) -> Vec<String> {
        self.position_deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(symbol, _)| symbol.clone())
            .collect()
    }

    pub(crate) fn requeue_order(&mut self, timeout: OrderTimeout) {
        self.order_timeouts.push(timeout);
    }

    pub(crate) fn drop_position_deadline(&mut self, symbol: &str) {
        self.position_deadlines.remove(symbol);
    }

    /// Clear every trace of a symbol: in-flight entry, ticker subscription
    /// marker and all timeout bookkeeping.
    pub(crate) fn release(&mut self, symbol: &str) {
        self.in_flight.remove(symbol);
        self.ticker_subs.remove(symbol);
        self.order_timeouts.retain(|t| t.symbol != symbol);
        self.position_deadlines.remove(symbol);
    }

    pub(crate) fn is_in_flight(&self, symbol: &str) -> bool {
        self.in_flight.contains_key(symbol)
    }
}

enum TickerCmd {
    Subscribe(String, oneshot::Sender<bool>),
    Unsubscribe(String),
}

pub struct BybitFuturesExchange {
    settings: ExchangeSettings,
    http: reqwest::Client,
    state: Mutex<AdapterState>,
    events: broadcast::Sender<ExchangeEvent>,
    ticker_cmds: mpsc::UnboundedSender<TickerCmd>,
}

impl BybitFuturesExchange {
    /// Builds the adapter and spawns its three background contexts: private
    /// execution stream, public ticker stream and the reconciliation timer.
    pub fn connect(settings: ExchangeSettings) -> Arc<Self> {
        let (events, _) = broadcast::channel(4096);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let adapter = Arc::new(Self {
            settings,
            http: reqwest::Client::new(),
            state: Mutex::new(AdapterState::default()),
            events,
            ticker_cmds: cmd_tx,
        });

        tokio::spawn(private_ws_loop(adapter.clone()));
        tokio::spawn(public_ws_loop(adapter.clone(), cmd_rx));
        tokio::spawn(reconcile_loop(adapter.clone()));
        adapter
    }

    async fn lock(&self) -> Result<MutexGuard<'_, AdapterState>, ExchangeError> {
        match tokio::time::timeout(LOCK_TIMEOUT, self.state.lock()).await {
            Ok(guard) => Ok(guard),
            Err(_) => {
                error!(exchange = NAME, "adapter lock held past bound");
                Err(ExchangeError::LockTimeout)
            }
        }
    }

    fn emit(&self, events: Vec<ExchangeEvent>) {
        for event in events {
            let _ = self.events.send(event);
        }
    }

    // ---- Signed REST helpers ----

    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &str,
    ) -> Result<RestEnvelope<T>, ExchangeError> {
        let ts = timestamp_ms();
        let sig = sign_request(&self.settings.secret_key, &self.settings.api_key, ts, query);
        let url = format!("{}{}?{}", self.settings.rest_base_url, path, query);
        let response = self
            .http
            .get(url)
            .header("X-BAPI-API-KEY", &self.settings.api_key)
            .header("X-BAPI-TIMESTAMP", ts.to_string())
            .header("X-BAPI-RECV-WINDOW", RECV_WINDOW)
            .header("X-BAPI-SIGN", sig)
            .send()
            .await?;
        Ok(response.json::<RestEnvelope<T>>().await?)
    }

    async fn post<T: DeserializeOwned>(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<RestEnvelope<T>, ExchangeError> {
        let payload = body.to_string();
        let ts = timestamp_ms();
        let sig = sign_request(
            &self.settings.secret_key,
            &self.settings.api_key,
            ts,
            &payload,
        );
        let url = format!("{}{}", self.settings.rest_base_url, path);
        let response = self
            .http
            .post(url)
            .header("X-BAPI-API-KEY", &self.settings.api_key)
            .header("X-BAPI-TIMESTAMP", ts.to_string())
            .header("X-BAPI-RECV-WINDOW", RECV_WINDOW)
            .header("X-BAPI-SIGN", sig)
            .header("Content-Type", "application/json")
            .body(payload)
            .send()
            .await?;
        Ok(response.json::<RestEnvelope<T>>().await?)
    }

    async fn ticker_row(&self, symbol: &str) -> Result<Option<TickerRow>, ExchangeError> {
        let query = format!("category=linear&symbol={}", urlencoding::encode(symbol));
        let envelope: RestEnvelope<ListResult<TickerRow>> =
            self.get("/v5/market/tickers", &query).await?;
        if !envelope.ok() {
            return Err(ExchangeError::Rejected(envelope.ret_msg));
        }
        Ok(envelope.result.map(|r| r.list).unwrap_or_default().pop())
    }

    async fn position_row(&self, symbol: &str) -> Result<Option<PositionRow>, ExchangeError> {
        let query = format!("category=linear&symbol={}", urlencoding::encode(symbol));
        let envelope: RestEnvelope<ListResult<PositionRow>> =
            self.get("/v5/position/list", &query).await?;
        if !envelope.ok() {
            return Err(ExchangeError::Rejected(envelope.ret_msg));
        }
        Ok(envelope.result.map(|r| r.list).unwrap_or_default().pop())
    }

    /// Authoritative live quantity; 0.0 means no position.
    async fn position_qty(&self, symbol: &str) -> Result<f64, ExchangeError> {
        Ok(self
            .position_row(symbol)
            .await?
            .and_then(|row| row.size.parse::<f64>().ok())
            .unwrap_or(0.0))
    }

    /// Most recent realized PnL record for the symbol, 0.0 when unavailable.
    async fn closed_pnl(&self, symbol: &str) -> f64 {
        let query = format!(
            "category=linear&symbol={}&limit=1",
            urlencoding::encode(symbol)
        );
        match self
            .get::<ListResult<ClosedPnlRow>>("/v5/position/closed-pnl", &query)
            .await
        {
            Ok(envelope) if envelope.ok() => envelope
                .result
                .map(|r| r.list)
                .unwrap_or_default()
                .first()
                .and_then(|row| row.closed_pnl.parse().ok())
                .unwrap_or(0.0),
            Ok(envelope) => {
                debug!(%symbol, msg = %envelope.ret_msg, "closed-pnl query rejected");
                0.0
            }
            Err(e) => {
                debug!(%symbol, ?e, "closed-pnl query failed");
                0.0
            }
        }
    }

    async fn set_leverage(&self, symbol: &str, leverage: f64) {
        let leverage = format!("{}", leverage);
        let trade_mode = if self.settings.margin_mode.eq_ignore_ascii_case("cross") {
            0
        } else {
            1
        };
        let body = json!({
            "category": "linear",
            "symbol": symbol,
            "tradeMode": trade_mode,
            "buyLeverage": leverage,
            "sellLeverage": leverage,
        });
        match self
            .post::<serde_json::Value>("/v5/position/switch-isolated", body)
            .await
        {
            Ok(envelope) if !envelope.ok() => {
                info!(%symbol, msg = %envelope.ret_msg, "could not update leverage");
            }
            Err(e) => info!(%symbol, ?e, "could not update leverage"),
            _ => {}
        }
    }

    async fn subscribe_ticker(&self, symbol: &str) -> bool {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self
            .ticker_cmds
            .send(TickerCmd::Subscribe(symbol.to_string(), ack_tx))
            .is_err()
        {
            return false;
        }
        ack_rx.await.unwrap_or(false)
    }

    fn unsubscribe_ticker(&self, symbol: &str) {
        let _ = self
            .ticker_cmds
            .send(TickerCmd::Unsubscribe(symbol.to_string()));
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> bool {
        let body = json!({
            "category": "linear",
            "symbol": symbol,
            "orderId": order_id,
        });
        match self.post::<serde_json::Value>("/v5/order/cancel", body).await {
            Ok(envelope) if envelope.ok() => true,
            Ok(envelope) => {
                warn!(%symbol, %order_id, msg = %envelope.ret_msg, "order cancel rejected");
                false
            }
            Err(e) => {
                warn!(%symbol, %order_id, ?e, "order cancel failed");
                false
            }
        }
    }

    async fn order_status(&self, order_id: &str) -> Result<Option<OrderRow>, ExchangeError> {
        let query = format!("category=linear&orderId={}", urlencoding::encode(order_id));
        let envelope: RestEnvelope<ListResult<OrderRow>> =
            self.get("/v5/order/realtime", &query).await?;
        if !envelope.ok() {
            return Err(ExchangeError::Rejected(envelope.ret_msg));
        }
        Ok(envelope.result.map(|r| r.list).unwrap_or_default().pop())
    }

    /// Opposing reduce-only market order to flatten a live position.
    async fn close_position_market(&self, symbol: &str, qty: f64, is_short: bool) -> bool {
        let body = json!({
            "category": "linear",
            "symbol": symbol,
            "side": if is_short { "Buy" } else { "Sell" },
            "orderType": "Market",
            "qty": format!("{}", qty),
            "reduceOnly": true,
        });
        match self.post::<OrderAck>("/v5/order/create", body).await {
            Ok(envelope) if envelope.ok() => true,
            Ok(envelope) => {
                warn!(%symbol, msg = %envelope.ret_msg, "forced close rejected");
                false
            }
            Err(e) => {
                warn!(%symbol, ?e, "forced close failed");
                false
            }
        }
    }

    // ---- Push-stream handling ----

    /// Private execution stream callback. Groups fills per symbol, asks the
    /// exchange for the authoritative position quantity and emits
    /// OrderFilled / PositionClosed accordingly.
    async fn on_trade_updates(&self, executions: Vec<WsExecution>) {
        let mut guard = match self.lock().await {
            Ok(guard) => guard,
            Err(_) => return,
        };

        let mut by_symbol: AHashMap<String, Vec<WsExecution>> = AHashMap::new();
        for execution in executions {
            by_symbol
                .entry(execution.symbol.clone())
                .or_default()
                .push(execution);
        }

        let mut events = Vec::new();
        for (symbol, fills) in by_symbol {
            if !guard.is_in_flight(&symbol) {
                debug!(%symbol, "execution for unmanaged symbol, ignored");
                continue;
            }

            let qty: f64 = fills.iter().map(|f| f.qty()).sum();
            let vwap = if qty > 0.0 {
                fills.iter().map(|f| f.price() * f.qty()).sum::<f64>() / qty
            } else {
                fills.first().map(|f| f.price()).unwrap_or(0.0)
            };

            let live_qty = match self.position_qty(&symbol).await {
                Ok(live_qty) => live_qty,
                Err(e) => {
                    warn!(%symbol, ?e, "position query failed during trade update");
                    continue;
                }
            };

            if live_qty > 0.0 {
                guard.confirm_open(&symbol);
                debug!(%symbol, fill_qty = qty, %vwap, "fill batch confirmed");
                events.push(ExchangeEvent::OrderFilled {
                    symbol,
                    fill_price: vwap,
                    fill_qty: qty,
                });
            } else {
                let exchange_pnl = self.closed_pnl(&symbol).await;
                debug!(%symbol, exit = vwap, "position flat, closing");
                self.unsubscribe_ticker(&symbol);
                guard.release(&symbol);
                events.push(ExchangeEvent::PositionClosed {
                    symbol,
                    exit_price: vwap,
                    exchange_pnl,
                    reason: PositionClosedReason::Sold,
                });
            }
        }

        drop(guard);
        self.emit(events);
    }

    /// Timer callback: revalidate overdue orders and positions against
    /// exchange truth. Failures are logged and retried on the next tick.
    async fn reconcile(&self) {
        let mut guard = match self.lock().await {
            Ok(guard) => guard,
            Err(_) => return,
        };
        let now = Instant::now();
        let mut events = Vec::new();

        for timeout in guard.due_orders(now) {
            let status = match self.order_status(&timeout.order_id).await {
                Ok(status) => status,
                Err(e) => {
                    warn!(symbol = %timeout.symbol, ?e, "order status query failed, retrying");
                    guard.requeue_order(timeout);
                    continue;
                }
            };

            match status {
                Some(row) if row.order_status == "Filled" => {
                    // position exists; the entry order bookkeeping is done
                    continue;
                }
                Some(_) => {
                    if !self.cancel_order(&timeout.symbol, &timeout.order_id).await {
                        guard.requeue_order(timeout);
                        continue;
                    }
                    RECONCILE_ACTIONS
                        .with_label_values(&["order_cancelled"])
                        .inc();
                    info!(symbol = %timeout.symbol, order_id = %timeout.order_id, "stale order cancelled");
                }
                None => {
                    // already gone on the exchange side; fall through to the
                    // position check so the symbol is not stuck in flight
                    warn!(symbol = %timeout.symbol, order_id = %timeout.order_id, "timed out order not found");
                }
            }

            let live_qty = self.position_qty(&timeout.symbol).await.unwrap_or(0.0);
            if live_qty == 0.0 {
                // nothing ever opened: release the symbol and tell the strategy
                self.unsubscribe_ticker(&timeout.symbol);
                guard.release(&timeout.symbol);
                events.push(ExchangeEvent::PositionClosed {
                    symbol: timeout.symbol,
                    exit_price: 0.0,
                    exchange_pnl: 0.0,
                    reason: PositionClosedReason::Cancelled,
                });
            }
        }

        for symbol in guard.due_positions(now) {
            match self.position_row(&symbol).await {
                Ok(Some(row)) => {
                    let qty: f64 = row.size.parse().unwrap_or(0.0);
                    if qty > 0.0 {
                        let is_short = row.side == "Sell";
                        if self.close_position_market(&symbol, qty, is_short).await {
                            RECONCILE_ACTIONS
                                .with_label_values(&["position_flattened"])
                                .inc();
                            info!(%symbol, qty, "stale position flattened");
                            guard.drop_position_deadline(&symbol);
                        }
                        // close confirmation arrives via the execution stream
                    } else {
                        guard.drop_position_deadline(&symbol);
                    }
                }
                Ok(None) => guard.drop_position_deadline(&symbol),
                Err(e) => warn!(%symbol, ?e, "position query failed, retrying"),
            }
        }

        drop(guard);
        self.emit(events);
    }
}

#[async_trait]
impl Exchange for BybitFuturesExchange {
    fn name(&self) -> &str {
        NAME
    }

    async fn place_order(&self, request: &OrderRequest) -> bool {
        let mut guard = match self.lock().await {
            Ok(guard) => guard,
            Err(_) => return false,
        };

        if !guard.try_admit(&request.symbol) {
            info!(symbol = %request.symbol, "order rejected, symbol already in flight");
            ORDERS_REJECTED.with_label_values(&["duplicate"]).inc();
            return false;
        }

        self.set_leverage(&request.symbol, request.leverage).await;

        // ticker stream first: a position must never exist unobserved
        if !self.subscribe_ticker(&request.symbol).await {
            error!(symbol = %request.symbol, "ticker subscription failed, aborting order");
            ORDERS_REJECTED.with_label_values(&["subscription"]).inc();
            guard.release(&request.symbol);
            return false;
        }
        guard.ticker_subs.insert(request.symbol.clone());

        let body = json!({
            "category": "linear",
            "symbol": request.symbol,
            "side": if request.is_short { "Sell" } else { "Buy" },
            "orderType": if request.is_limit { "Limit" } else { "Market" },
            "qty": format!("{}", request.amount),
            "price": if request.is_limit { Some(format!("{}", request.price)) } else { None },
            "timeInForce": if request.is_limit { "IOC" } else { "GTC" },
            "takeProfit": format!("{}", request.take_profit),
            "stopLoss": format!("{}", request.stop_loss),
        });

        let order_id = match self.post::<OrderAck>("/v5/order/create", body).await {
            Ok(envelope) if envelope.ok() => match envelope.result {
                Some(ack) => ack.order_id,
                None => String::new(),
            },
            Ok(envelope) => {
                error!(symbol = %request.symbol, msg = %envelope.ret_msg, "order rejected");
                ORDERS_REJECTED.with_label_values(&["exchange"]).inc();
                self.unsubscribe_ticker(&request.symbol);
                guard.release(&request.symbol);
                return false;
            }
            Err(e) => {
                error!(symbol = %request.symbol, ?e, "order send failed");
                ORDERS_REJECTED.with_label_values(&["transport"]).inc();
                self.unsubscribe_ticker(&request.symbol);
                guard.release(&request.symbol);
                return false;
            }
        };

        let now = Instant::now();
        let order_deadline = (self.settings.order_timeout > 0)
            .then(|| now + Duration::from_secs(self.settings.order_timeout));
        let position_deadline = (self.settings.position_timeout > 0)
            .then(|| now + Duration::from_secs(self.settings.position_timeout));
        guard.record_order(&order_id, &request.symbol, order_deadline, position_deadline);

        ORDERS_PLACED.with_label_values(&[NAME]).inc();
        debug!(symbol = %request.symbol, %order_id, amount = request.amount, "order placed");
        true
    }

    async fn symbol_exists(&self, symbol: &str) -> Result<bool, ExchangeError> {
        Ok(self.ticker_row(symbol).await?.is_some())
    }

    async fn symbol_digits(&self, symbol: &str) -> Result<u32, ExchangeError> {
        let row = self
            .ticker_row(symbol)
            .await?
            .ok_or_else(|| ExchangeError::BadResponse(format!("no ticker for {symbol}")))?;
        let last: f64 = row
            .last_price
            .parse()
            .map_err(|_| ExchangeError::BadResponse(format!("bad price {}", row.last_price)))?;
        Ok(digits_of(last))
    }

    async fn set_stop_loss(&self, symbol: &str, is_short: bool, stop_loss: f64) -> bool {
        let body = json!({
            "category": "linear",
            "symbol": symbol,
            "positionIdx": 0,
            "stopLoss": format!("{}", stop_loss),
        });
        match self
            .post::<serde_json::Value>("/v5/position/trading-stop", body)
            .await
        {
            Ok(envelope) if envelope.ok() => true,
            Ok(envelope) => {
                error!(%symbol, is_short, msg = %envelope.ret_msg, "stop loss update rejected");
                false
            }
            Err(e) => {
                error!(%symbol, is_short, ?e, "stop loss update failed");
                false
            }
        }
    }

    async fn get_position_info(&self, symbol: &str) -> Result<PositionSnapshot, ExchangeError> {
        let row = match self.position_row(symbol).await? {
            Some(row) => row,
            None => return Ok(PositionSnapshot::default()),
        };
        let qty: f64 = row.size.parse().unwrap_or(0.0);
        Ok(PositionSnapshot {
            valid: qty > 0.0,
            symbol_name: row.symbol,
            quantity: qty,
            unrealized_pnl: row.unrealised_pnl.parse().unwrap_or(0.0),
            margin: row.position_im.parse().unwrap_or(0.0),
            leverage: row.leverage.parse().unwrap_or(0.0),
            stop_loss: row.stop_loss.parse().unwrap_or(0.0),
            take_profit: row.take_profit.parse().unwrap_or(0.0),
            size: row.position_value.parse().unwrap_or(0.0),
            is_short: row.side == "Sell",
        })
    }

    async fn get_klines(
        &self,
        symbol: &str,
        interval: KlineInterval,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Kline>, ExchangeError> {
        let interval_code = match interval {
            KlineInterval::Day => "D",
        };
        let query = format!(
            "category=linear&symbol={}&interval={}&start={}&end={}&limit=1000",
            urlencoding::encode(symbol),
            interval_code,
            start.timestamp_millis(),
            end.timestamp_millis()
        );
        let envelope: RestEnvelope<ListResult<Vec<String>>> =
            self.get("/v5/market/kline", &query).await?;
        if !envelope.ok() {
            return Err(ExchangeError::Rejected(envelope.ret_msg));
        }
        let mut klines: Vec<Kline> = envelope
            .result
            .map(|r| r.list)
            .unwrap_or_default()
            .iter()
            .filter_map(|row| parse_kline_row(row))
            .collect();
        // bybit returns newest first
        klines.sort_by_key(|k| k.open_time_ms);
        Ok(klines)
    }

    fn subscribe_events(&self) -> broadcast::Receiver<ExchangeEvent> {
        self.events.subscribe()
    }
}

// ---- Background loops ----

fn backoff_delay(attempt: u32) -> Duration {
    let shift = attempt.min(6);
    let base_ms = 500u64.saturating_mul(1u64 << shift);
    let jitter = rand::thread_rng().gen_range(0..=250);
    Duration::from_millis(base_ms + jitter)
}

async fn reconcile_loop(adapter: Arc<BybitFuturesExchange>) {
    let mut tick = tokio::time::interval(RECONCILE_INTERVAL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tick.tick().await;
        adapter.reconcile().await;
    }
}

/// Private execution stream: auth, subscribe "execution", feed fills into the
/// trade-update handler. Reconnects with jittered exponential backoff.
async fn private_ws_loop(adapter: Arc<BybitFuturesExchange>) {
    let mut attempt: u32 = 0;
    loop {
        let url = match Url::parse(&adapter.settings.private_ws_url) {
            Ok(url) => url,
            Err(e) => {
                error!(?e, url = %adapter.settings.private_ws_url, "bad private ws url");
                return;
            }
        };

        info!(url = %url, "connecting private execution stream");
        match connect_async(url.as_str()).await {
            Ok((mut ws, _)) => {
                attempt = 0;
                let expires = timestamp_ms() + 10_000;
                let auth = json!({
                    "op": "auth",
                    "args": [
                        adapter.settings.api_key,
                        expires,
                        sign_ws_auth(&adapter.settings.secret_key, expires),
                    ],
                });
                let sub = json!({ "op": "subscribe", "args": ["execution"] });
                if ws.send(Message::Text(auth.to_string())).await.is_err()
                    || ws.send(Message::Text(sub.to_string())).await.is_err()
                {
                    error!("private stream handshake failed");
                } else {
                    let mut ping = tokio::time::interval(Duration::from_secs(20));
                    loop {
                        tokio::select! {
                            _ = ping.tick() => {
                                let frame = json!({"op": "ping"}).to_string();
                                if ws.send(Message::Text(frame)).await.is_err() {
                                    break;
                                }
                            }
                            frame = ws.next() => {
                                match frame {
                                    Some(Ok(message)) if message.is_text() => {
                                        let text = message.into_text().unwrap_or_default();
                                        handle_private_frame(&adapter, &text).await;
                                    }
                                    Some(Ok(_)) => {}
                                    Some(Err(e)) => {
                                        error!(?e, "private stream read error");
                                        break;
                                    }
                                    None => break,
                                }
                            }
                        }
                    }
                    warn!("private execution stream disconnected, reconnecting");
                }
            }
            Err(e) => error!(?e, "connect private stream failed"),
        }

        attempt = attempt.saturating_add(1);
        WS_RECONNECTS.with_label_values(&["private"]).inc();
        sleep(backoff_delay(attempt)).await;
    }
}

async fn handle_private_frame(adapter: &Arc<BybitFuturesExchange>, text: &str) {
    let envelope: WsEnvelope = match serde_json::from_str(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            debug!(?e, "unparseable private frame, ignored");
            return;
        }
    };
    if envelope.topic.as_deref() != Some("execution") {
        return;
    }
    let Some(data) = envelope.data else { return };
    match serde_json::from_value::<Vec<WsExecution>>(data) {
        Ok(executions) if !executions.is_empty() => {
            adapter.on_trade_updates(executions).await;
        }
        Ok(_) => {}
        Err(e) => debug!(?e, "unparseable execution payload, ignored"),
    }
}

/// Public ticker stream. Subscription set changes at runtime via the command
/// channel; on reconnect every active subscription is replayed.
async fn public_ws_loop(
    adapter: Arc<BybitFuturesExchange>,
    mut commands: mpsc::UnboundedReceiver<TickerCmd>,
) {
    let mut subscribed: AHashSet<String> = AHashSet::new();
    let mut attempt: u32 = 0;
    loop {
        let url = match Url::parse(&adapter.settings.public_ws_url) {
            Ok(url) => url,
            Err(e) => {
                error!(?e, url = %adapter.settings.public_ws_url, "bad public ws url");
                return;
            }
        };

        info!(url = %url, "connecting public ticker stream");
        match connect_async(url.as_str()).await {
            Ok((mut ws, _)) => {
                attempt = 0;
                let mut healthy = true;

                // replay active subscriptions after a reconnect
                for symbol in subscribed.iter() {
                    let frame =
                        json!({"op": "subscribe", "args": [format!("tickers.{symbol}")]});
                    if ws.send(Message::Text(frame.to_string())).await.is_err() {
                        healthy = false;
                        break;
                    }
                }

                let mut ping = tokio::time::interval(Duration::from_secs(20));
                while healthy {
                    tokio::select! {
                        _ = ping.tick() => {
                            let frame = json!({"op": "ping"}).to_string();
                            if ws.send(Message::Text(frame)).await.is_err() {
                                break;
                            }
                        }
                        command = commands.recv() => {
                            match command {
                                Some(TickerCmd::Subscribe(symbol, ack)) => {
                                    let frame = json!({
                                        "op": "subscribe",
                                        "args": [format!("tickers.{symbol}")],
                                    });
                                    let sent = ws.send(Message::Text(frame.to_string())).await.is_ok();
                                    if sent {
                                        subscribed.insert(symbol);
                                    }
                                    let _ = ack.send(sent);
                                    if !sent {
                                        break;
                                    }
                                }
                                Some(TickerCmd::Unsubscribe(symbol)) => {
                                    subscribed.remove(&symbol);
                                    let frame = json!({
                                        "op": "unsubscribe",
                                        "args": [format!("tickers.{symbol}")],
                                    });
                                    let _ = ws.send(Message::Text(frame.to_string())).await;
                                }
                                None => return,
                            }
                        }
                        frame = ws.next() => {
                            match frame {
                                Some(Ok(message)) if message.is_text() => {
                                    let text = message.into_text().unwrap_or_default();
                                    handle_public_frame(&adapter, &text);
                                }
                                Some(Ok(_)) => {}
                                Some(Err(e)) => {
                                    error!(?e, "public stream read error");
                                    break;
                                }
                                None => break,
                            }
                        }
                    }
                }
                warn!("public ticker stream disconnected, reconnecting");
            }
            Err(e) => error!(?e, "connect public stream failed"),
        }

        attempt = attempt.saturating_add(1);
        WS_RECONNECTS.with_label_values(&["public"]).inc();
        sleep(backoff_delay(attempt)).await;

        // drain pending subscribe requests while disconnected so callers
        // fail fast instead of hanging on the ack
        while let Ok(command) = commands.try_recv() {
            if let TickerCmd::Subscribe(_, ack) = command {
                let _ = ack.send(false);
            }
        }
    }
}

fn handle_public_frame(adapter: &Arc<BybitFuturesExchange>, text: &str) {
    let envelope: WsEnvelope = match serde_json::from_str(text) {
        Ok(envelope) => envelope,
        Err(_) => return,
    };
    let Some(topic) = envelope.topic.as_deref() else {
        return;
    };
    if !topic.starts_with("tickers.") {
        return;
    }
    let Some(data) = envelope.data else { return };
    if let Ok(ticker) = serde_json::from_value::<WsTicker>(data) {
        if let Some(last) = ticker.last_price.and_then(|p| p.parse::<f64>().ok()) {
            let _ = adapter.events.send(ExchangeEvent::TickerChanged {
                symbol: ticker.symbol,
                last_price: last,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_symbols_are_rejected() {
        let mut state = AdapterState::default();
        assert!(state.try_admit("BTCUSDT"));
        assert!(!state.try_admit("BTCUSDT"));
        assert!(state.try_admit("ETHUSDT"));
    }

    #[test]
    fn release_clears_all_bookkeeping() {
        let mut state = AdapterState::default();
        let now = Instant::now();
        assert!(state.try_admit("BTCUSDT"));
        state.ticker_subs.insert("BTCUSDT".to_string());
        state.record_order(
            "oid-1",
            "BTCUSDT",
            Some(now + Duration::from_secs(300)),
            Some(now + Duration::from_secs(3600)),
        );

        state.release("BTCUSDT");
        assert!(!state.is_in_flight("BTCUSDT"));
        assert!(state.order_timeouts.is_empty());
        assert!(state.position_deadlines.is_empty());
        assert!(state.ticker_subs.is_empty());
        // symbol can be admitted again
        assert!(state.try_admit("BTCUSDT"));
    }

    #[test]
    fn order_timeouts_expire_past_deadline() {
        let mut state = AdapterState::default();
        let now = Instant::now();
        state.try_admit("BTCUSDT");
        state.record_order("oid-1", "BTCUSDT", Some(now + Duration::from_secs(300)), None);

        // T+299: nothing due
        assert!(state
            .due_orders(now + Duration::from_secs(299))
            .is_empty());
        assert_eq!(state.order_timeouts.len(), 1);

        // T+301: due and drained
        let due = state.due_orders(now + Duration::from_secs(301));
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].order_id, "oid-1");
        assert!(state.order_timeouts.is_empty());
    }

    #[test]
    fn requeued_orders_come_due_again() {
        let mut state = AdapterState::default();
        let now = Instant::now();
        state.try_admit("BTCUSDT");
        state.record_order("oid-1", "BTCUSDT", Some(now), None);

        let due = state.due_orders(now + Duration::from_secs(1));
        assert_eq!(due.len(), 1);
        state.requeue_order(due.into_iter().next().unwrap());
        assert_eq!(state.due_orders(now + Duration::from_secs(2)).len(), 1);
    }

    #[test]
    fn position_deadlines_are_independent_of_orders() {
        let mut state = AdapterState::default();
        let now = Instant::now();
        state.try_admit("BTCUSDT");
        state.record_order("oid-1", "BTCUSDT", None, Some(now + Duration::from_secs(60)));

        assert!(state.due_positions(now).is_empty());
        let due = state.due_positions(now + Duration::from_secs(61));
        assert_eq!(due, vec!["BTCUSDT".to_string()]);

        state.drop_position_deadline("BTCUSDT");
        assert!(state
            .due_positions(now + Duration::from_secs(120))
            .is_empty());
        // still in flight: a position deadline alone does not release admission
        assert!(state.is_in_flight("BTCUSDT"));
    }

    #[test]
    fn confirm_open_promotes_stage() {
        let mut state = AdapterState::default();
        state.try_admit("BTCUSDT");
        assert_eq!(state.stage("BTCUSDT"), Some(FlightStage::Ordered));
        state.confirm_open("BTCUSDT");
        assert_eq!(state.stage("BTCUSDT"), Some(FlightStage::Open));
    }
}
