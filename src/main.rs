// ===============================
// src/main.rs
// ===============================
/*
=============================================================================
Project : signal_bot_rust — webhook signal trader in Rust
Version : 0.1.0
License : MIT (see LICENSE)

Summary : Receives trading alerts over a webhook, matches them against
          configured signal rules, gates them through optional indicator
          filters, sizes and places futures orders, manages the resulting
          positions with trailing/staged stops, reconciles stuck orders on a
          timer, reports to the operator over Telegram and exposes
          Prometheus metrics.
=============================================================================
*/
mod bybit; // helper (signer/types) for Bybit v5
mod calc;
mod config;
mod domain;
mod exchange;
mod exchange_bybit; // real Bybit USDT-perpetual adapter (REST + WS)
mod filter;
mod metrics;
mod recorder;
mod server;
mod signal_manager;
mod strategy;
mod telegram;
#[cfg(test)]
mod testutil;

use std::sync::Arc;

use ahash::AHashMap as HashMap;
use tokio::sync::mpsc;
use tokio::time::Duration;
use tracing::{info, warn};

use crate::domain::Event;
use crate::exchange::Exchange;
use crate::exchange_bybit::BybitFuturesExchange;
use crate::signal_manager::SignalManager;
use crate::telegram::TelegramBot;

#[tokio::main]
async fn main() {
    // ---- Logging ----
    tracing_subscriber::fmt().with_env_filter("info").init();

    // ---- Load config ----
    let (args, config) = match config::load() {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("config error: {e}");
            std::process::exit(1);
        }
    };

    // ---- Metrics ----
    metrics::init();
    tokio::spawn(metrics::serve_metrics(args.metrics_port));

    info!(
        max_positions = config.max_positions,
        exchanges = config.exchanges.len(),
        signals = config.signals.len(),
        listen_port = args.listen_port,
        "startup config"
    );

    // ---- Recorder (optional) ----
    let rec_tx: Option<mpsc::Sender<Event>> = config.record_file.clone().map(|path| {
        let (tx, rx) = mpsc::channel::<Event>(8192);
        tokio::spawn(recorder::run(rx, path));
        tx
    });
    if let Some(tx) = &rec_tx {
        let _ = tx.try_send(Event::Note("startup".to_string()));
    }

    // ---- Operator channel ----
    let (notifier, bot) = TelegramBot::notifier_from(config.telegram.as_ref());

    // ---- Exchanges ----
    let mut exchanges: HashMap<String, Arc<dyn Exchange>> = HashMap::new();
    for settings in &config.exchanges {
        match settings.name.as_str() {
            exchange_bybit::NAME => {
                info!(name = %settings.name, "adding exchange");
                let adapter = BybitFuturesExchange::connect(settings.clone());

                // journal every lifecycle event the adapter emits
                if let Some(tx) = rec_tx.clone() {
                    let mut events = adapter.subscribe_events();
                    tokio::spawn(async move {
                        loop {
                            match events.recv().await {
                                Ok(event) => {
                                    let _ = tx.try_send(Event::Exchange(event));
                                }
                                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                            }
                        }
                    });
                }

                let as_dyn: Arc<dyn Exchange> = adapter;
                exchanges.insert(settings.name.clone(), as_dyn);
            }
            other => warn!(name = %other, "unknown exchange in config, skipped"),
        }
    }

    // ---- Signal manager ----
    let manager = SignalManager::new(&config, exchanges, notifier.clone());

    // ---- Telegram command loop ----
    if let Some(bot) = bot {
        tokio::spawn(telegram::run_command_loop(bot, manager.clone()));
    }

    // ---- Webhook ingress ----
    tokio::spawn(server::serve(manager.clone(), rec_tx.clone(), args.listen_port));

    notifier.send("signal_bot_rust started").await;

    // ---- Heartbeat ----
    loop {
        tokio::time::sleep(Duration::from_secs(60)).await;
        let open = manager.active_count().await;
        info!(open_positions = open, "heartbeat");
    }
}
