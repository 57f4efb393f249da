// ===============================
// src/testutil.rs
// ===============================
//
// Shared fakes for unit tests: an in-memory Exchange and a notifier that
// records what the operator would have seen.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::domain::{ExchangeEvent, Kline, KlineInterval, PositionSnapshot};
use crate::exchange::{Exchange, ExchangeError, OrderRequest};
use crate::telegram::Notifier;

pub struct MockExchange {
    digits: u32,
    symbol_exists: AtomicBool,
    accept_orders: AtomicBool,
    accept_stops: AtomicBool,
    orders: Mutex<Vec<OrderRequest>>,
    stops: Mutex<Vec<(String, bool, f64)>>,
    klines: Mutex<Vec<Kline>>,
    events: broadcast::Sender<ExchangeEvent>,
}

impl MockExchange {
    pub fn new(digits: u32) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            digits,
            symbol_exists: AtomicBool::new(true),
            accept_orders: AtomicBool::new(true),
            accept_stops: AtomicBool::new(true),
            orders: Mutex::new(Vec::new()),
            stops: Mutex::new(Vec::new()),
            klines: Mutex::new(Vec::new()),
            events,
        })
    }

    pub fn set_symbol_exists(&self, exists: bool) {
        self.symbol_exists.store(exists, Ordering::SeqCst);
    }

    pub fn set_accept_orders(&self, accept: bool) {
        self.accept_orders.store(accept, Ordering::SeqCst);
    }

    #[allow(dead_code)]
    pub fn set_accept_stops(&self, accept: bool) {
        self.accept_stops.store(accept, Ordering::SeqCst);
    }

    #[allow(dead_code)]
    pub fn set_klines(&self, klines: Vec<Kline>) {
        *self.klines.lock().unwrap() = klines;
    }

    pub fn orders(&self) -> Vec<OrderRequest> {
        self.orders.lock().unwrap().clone()
    }

    pub fn stop_updates(&self) -> Vec<(String, bool, f64)> {
        self.stops.lock().unwrap().clone()
    }

    /// Push an event into every subscriber, as the push streams would.
    pub fn push(&self, event: ExchangeEvent) {
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl Exchange for MockExchange {
    fn name(&self) -> &str {
        "MockExchange"
    }

    async fn place_order(&self, request: &OrderRequest) -> bool {
        if !self.accept_orders.load(Ordering::SeqCst) {
            return false;
        }
        self.orders.lock().unwrap().push(request.clone());
        true
    }

    async fn symbol_exists(&self, _symbol: &str) -> Result<bool, ExchangeError> {
        Ok(self.symbol_exists.load(Ordering::SeqCst))
    }

    async fn symbol_digits(&self, _symbol: &str) -> Result<u32, ExchangeError> {
        Ok(self.digits)
    }

    async fn set_stop_loss(&self, symbol: &str, is_short: bool, stop_loss: f64) -> bool {
        if !self.accept_stops.load(Ordering::SeqCst) {
            return false;
        }
        self.stops
            .lock()
            .unwrap()
            .push((symbol.to_string(), is_short, stop_loss));
        true
    }

    async fn get_position_info(&self, symbol: &str) -> Result<PositionSnapshot, ExchangeError> {
        Ok(PositionSnapshot {
            symbol_name: symbol.to_string(),
            ..PositionSnapshot::default()
        })
    }

    async fn get_klines(
        &self,
        _symbol: &str,
        _interval: KlineInterval,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
    ) -> Result<Vec<Kline>, ExchangeError> {
        Ok(self.klines.lock().unwrap().clone())
    }

    fn subscribe_events(&self) -> broadcast::Receiver<ExchangeEvent> {
        self.events.subscribe()
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    messages: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, message: &str) {
        self.messages.lock().unwrap().push(message.to_string());
    }
}

/// Poll an async condition until it holds; panics after ~2s.
pub async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
