// ===============================
// src/signal_manager.rs
// ===============================
//
// The orchestrator: matches inbound notifications against configured Signal
// rules, enforces global admission control and owns the active strategy set.
// One manager-wide mutex with a bounded wait covers admission and the rule
// list; placing the order happens inside the critical section on purpose,
// since it backs the duplicate-symbol check at the adapter.

use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use tokio::sync::{mpsc, Mutex, MutexGuard};
use tracing::{debug, error, info};

use crate::config::AppConfig;
use crate::domain::{Notification, RemoteCommand, RemoteCommandTarget, RemoteCommandType, SignalDirection};
use crate::exchange::Exchange;
use crate::filter::{self, FilterVerdict, SignalFilter};
use crate::metrics::REJECTIONS;
use crate::strategy::{SignalStrategy, StrategyKind};
use crate::telegram::Notifier;

const LOCK_TIMEOUT: Duration = Duration::from_secs(120);

struct SignalRule {
    config: crate::config::SignalConfig,
    filter: Option<Box<dyn SignalFilter>>,
}

struct ManagerInner {
    exchanges: AHashMap<String, Arc<dyn Exchange>>,
    signals: Vec<SignalRule>,
    active: AHashMap<String, Arc<SignalStrategy>>,
}

pub struct SignalManager {
    notifier: Arc<dyn Notifier>,
    max_positions: usize,
    completion_tx: mpsc::UnboundedSender<String>,
    inner: Mutex<ManagerInner>,
}

impl SignalManager {
    pub fn new(
        config: &AppConfig,
        exchanges: AHashMap<String, Arc<dyn Exchange>>,
        notifier: Arc<dyn Notifier>,
    ) -> Arc<Self> {
        let signals = config
            .signals
            .iter()
            .map(|signal| SignalRule {
                config: signal.clone(),
                filter: signal.filter.as_ref().and_then(filter::from_settings),
            })
            .collect();

        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let manager = Arc::new(Self {
            notifier,
            max_positions: config.max_positions,
            completion_tx,
            inner: Mutex::new(ManagerInner {
                exchanges,
                signals,
                active: AHashMap::new(),
            }),
        });

        tokio::spawn(completion_loop(manager.clone(), completion_rx));
        manager
    }

    async fn lock(&self) -> Option<MutexGuard<'_, ManagerInner>> {
        match tokio::time::timeout(LOCK_TIMEOUT, self.inner.lock()).await {
            Ok(guard) => Some(guard),
            Err(_) => {
                error!("signal manager lock held past bound");
                self.notifier
                    .send("Signal manager lock held past bound, command dropped!")
                    .await;
                None
            }
        }
    }

    /// Handle one inbound notification: admission checks, then first-match
    /// dispatch. At most one strategy instance is created per notification.
    pub async fn execute(&self, notification: Notification) {
        let Some(mut inner) = self.lock().await else {
            return;
        };

        if notification.closed {
            debug!(symbol = %notification.symbol_name, "alert already resolved, dropped");
            REJECTIONS.with_label_values(&["closed"]).inc();
            return;
        }
        if inner.signals.is_empty() {
            info!("no signals configured");
            REJECTIONS.with_label_values(&["no_signals"]).inc();
            self.notifier.send("No signals configured!").await;
            return;
        }
        if inner.exchanges.is_empty() {
            info!("no exchanges configured");
            REJECTIONS.with_label_values(&["no_exchanges"]).inc();
            self.notifier.send("No exchanges configured!").await;
            return;
        }
        if inner.active.len() >= self.max_positions {
            info!(max = self.max_positions, "max positions reached");
            REJECTIONS.with_label_values(&["capacity"]).inc();
            self.notifier
                .send(&format!("Max positions reached {}!", self.max_positions))
                .await;
            return;
        }

        for i in 0..inner.signals.len() {
            let config = inner.signals[i].config.clone();
            if config.r#type != notification.r#type
                || config.signal_type_id != notification.signal_type_id
            {
                continue;
            }
            if !config.is_active {
                debug!(strategy = %config.strategy, "signal inactive, skipped");
                continue;
            }
            if !config.direction.matches(notification.signal) {
                continue;
            }
            let Some(exchange) = inner.exchanges.get(&config.exchange).cloned() else {
                continue;
            };

            info!(exchange = %config.exchange, symbol = %notification.symbol_name, "found exchange");
            self.notifier
                .send(&format!(
                    "Found exchange {} - {}",
                    config.exchange, notification.symbol_name
                ))
                .await;

            let Some(kind) = StrategyKind::parse(&config.strategy) else {
                info!(strategy = %config.strategy, "no strategy found");
                self.notifier
                    .send(&format!("No strategy found for {}", config.strategy))
                    .await;
                continue;
            };

            if let Some(rule_filter) = inner.signals[i].filter.as_ref() {
                match rule_filter
                    .pass(&config, &notification, exchange.as_ref())
                    .await
                {
                    FilterVerdict::Pass => {}
                    FilterVerdict::Veto(message) => {
                        REJECTIONS.with_label_values(&["filter"]).inc();
                        self.notifier.send(&message).await;
                        continue;
                    }
                }
            }

            let strategy =
                SignalStrategy::new(kind, self.notifier.clone(), self.completion_tx.clone());
            if strategy
                .execute(exchange, notification.clone(), config.clone())
                .await
            {
                debug!(
                    strategy = %config.strategy,
                    exchange = %config.exchange,
                    symbol = %notification.symbol_name,
                    "strategy executed"
                );
                if let Some(events) = strategy.take_event_stream().await {
                    tokio::spawn(crate::strategy::drive(strategy.clone(), events));
                }
                inner.active.insert(strategy.id().to_string(), strategy);
                break;
            }
        }
    }

    /// Apply a runtime control command to the Signal rules selected by its
    /// target direction.
    pub async fn execute_remote_command(&self, command: RemoteCommand) {
        let Some(mut inner) = self.lock().await else {
            return;
        };

        for rule in inner.signals.iter_mut() {
            let selected = match command.target {
                RemoteCommandTarget::All => true,
                RemoteCommandTarget::Long => rule.config.direction == SignalDirection::Long,
                RemoteCommandTarget::Short => rule.config.direction == SignalDirection::Short,
            };
            if !selected {
                continue;
            }
            match command.r#type {
                RemoteCommandType::ChangeStrategyState => {
                    if let Some(active) = command.is_signal_active {
                        debug!(strategy = %rule.config.strategy, active, "set signal state");
                        rule.config.is_active = active;
                    }
                }
                RemoteCommandType::ChangeStrategyRisk => {
                    if let Some(factor) = command.risk_factor {
                        let factor = factor.clamp(0.0, 1.0);
                        debug!(strategy = %rule.config.strategy, factor, "set risk factor");
                        rule.config.risk_factor = factor;
                    }
                }
            }
        }
    }

    // ---- Status queries (operator channel) ----

    pub async fn open_positions(&self) -> Vec<String> {
        let inner = self.inner.lock().await;
        inner
            .active
            .values()
            .filter_map(|s| s.symbol_name().map(str::to_string))
            .collect()
    }

    pub async fn position_details(&self) -> Vec<String> {
        let strategies: Vec<Arc<SignalStrategy>> = {
            let inner = self.inner.lock().await;
            inner.active.values().cloned().collect()
        };

        let mut out = Vec::with_capacity(strategies.len());
        for strategy in strategies {
            let symbol = strategy.symbol_name().unwrap_or_default().to_string();
            let Some(exchange) = strategy.exchange() else {
                continue;
            };
            match exchange.get_position_info(&symbol).await {
                Ok(snapshot) if snapshot.valid => out.push(snapshot.as_string()),
                _ => out.push(format!("{} -> Unknown", symbol)),
            }
        }
        out
    }

    pub async fn active_count(&self) -> usize {
        self.inner.lock().await.active.len()
    }

    #[cfg(test)]
    async fn risk_factors(&self) -> Vec<f64> {
        let inner = self.inner.lock().await;
        inner.signals.iter().map(|r| r.config.risk_factor).collect()
    }

    #[cfg(test)]
    async fn active_flags(&self) -> Vec<bool> {
        let inner = self.inner.lock().await;
        inner.signals.iter().map(|r| r.config.is_active).collect()
    }
}

/// Removes a strategy from the active set once it reports completion; this
/// is what frees admission capacity.
async fn completion_loop(
    manager: Arc<SignalManager>,
    mut completions: mpsc::UnboundedReceiver<String>,
) {
    while let Some(id) = completions.recv().await {
        let mut inner = manager.inner.lock().await;
        if inner.active.remove(&id).is_some() {
            debug!(%id, "removing strategy from manager");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SignalConfig;
    use crate::domain::{ExchangeEvent, PositionClosedReason, RawNotification};
    use crate::testutil::{wait_until, MockExchange, RecordingNotifier};

    fn notification(symbol: &str, signal: i32) -> Notification {
        Notification::from_raw(RawNotification {
            r#type: Some(1),
            signal_type_id: Some(2),
            market_name: Some(symbol.to_string()),
            signal: Some(signal),
            signal_price: Some(50000.0),
            stop_loss: Some(49000.0),
            target1: Some(50500.0),
            target2: Some(51000.0),
            target3: Some(51500.0),
            target4: Some(52000.0),
            target5: Some(52500.0),
            closed: None,
        })
    }

    fn rule(direction: SignalDirection) -> SignalConfig {
        SignalConfig {
            r#type: 1,
            signal_type_id: 2,
            exchange: "BybitFutures".to_string(),
            strategy: "FixedTakeProfit".to_string(),
            direction,
            leverage: 5.0,
            risk_per_trade: 10.0,
            take_profit_index: 5,
            ..SignalConfig::default()
        }
    }

    fn manager_with(
        signals: Vec<SignalConfig>,
        max_positions: usize,
        exchange: &Arc<MockExchange>,
    ) -> (Arc<SignalManager>, Arc<RecordingNotifier>) {
        let notifier = Arc::new(RecordingNotifier::default());
        let config = AppConfig {
            max_positions,
            signals,
            ..AppConfig::default()
        };
        let mut exchanges: AHashMap<String, Arc<dyn Exchange>> = AHashMap::new();
        let as_dyn: Arc<dyn Exchange> = exchange.clone();
        exchanges.insert("BybitFutures".to_string(), as_dyn);
        let manager = SignalManager::new(&config, exchanges, notifier.clone());
        (manager, notifier)
    }

    #[tokio::test]
    async fn no_signals_configured_rejects() {
        let exchange = MockExchange::new(2);
        let (manager, notifier) = manager_with(vec![], 3, &exchange);
        manager.execute(notification("BTCUSDT", 1)).await;
        assert!(exchange.orders().is_empty());
        assert!(notifier
            .messages()
            .iter()
            .any(|m| m.contains("No signals configured")));
    }

    #[tokio::test]
    async fn duplicated_rules_create_one_instance() {
        let exchange = MockExchange::new(2);
        let (manager, _) = manager_with(
            vec![rule(SignalDirection::Any), rule(SignalDirection::Any)],
            3,
            &exchange,
        );
        manager.execute(notification("BTCUSDT", 1)).await;
        // first match wins, loop breaks
        assert_eq!(exchange.orders().len(), 1);
        assert_eq!(manager.active_count().await, 1);
    }

    #[tokio::test]
    async fn direction_and_active_flags_gate_matching() {
        let exchange = MockExchange::new(2);
        let mut inactive = rule(SignalDirection::Any);
        inactive.is_active = false;
        let (manager, _) = manager_with(
            vec![inactive, rule(SignalDirection::Short)],
            3,
            &exchange,
        );

        // long notification: first rule inactive, second is short-only
        manager.execute(notification("BTCUSDT", 1)).await;
        assert!(exchange.orders().is_empty());

        // short notification matches the second rule
        manager.execute(notification("BTCUSDT", -1)).await;
        assert_eq!(exchange.orders().len(), 1);
        assert!(exchange.orders()[0].is_short);
    }

    #[tokio::test]
    async fn capacity_blocks_until_completion() {
        let exchange = MockExchange::new(2);
        let (manager, notifier) = manager_with(vec![rule(SignalDirection::Any)], 1, &exchange);

        manager.execute(notification("BTCUSDT", 1)).await;
        assert_eq!(manager.active_count().await, 1);

        manager.execute(notification("ETHUSDT", 1)).await;
        assert_eq!(exchange.orders().len(), 1);
        assert!(notifier
            .messages()
            .iter()
            .any(|m| m.contains("Max positions reached 1")));

        // close the position: the strategy's event pump reports completion
        // and the manager frees the slot
        exchange.push(ExchangeEvent::PositionClosed {
            symbol: "BTCUSDT".to_string(),
            exit_price: 51000.0,
            exchange_pnl: 0.0,
            reason: PositionClosedReason::Sold,
        });
        wait_until(|| {
            let manager = manager.clone();
            async move { manager.active_count().await == 0 }
        })
        .await;

        manager.execute(notification("ETHUSDT", 1)).await;
        assert_eq!(exchange.orders().len(), 2);
    }

    #[tokio::test]
    async fn completion_frees_capacity_on_cancelled() {
        let exchange = MockExchange::new(2);
        let (manager, _) = manager_with(vec![rule(SignalDirection::Any)], 1, &exchange);

        manager.execute(notification("BTCUSDT", 1)).await;
        assert_eq!(manager.active_count().await, 1);

        // order timeout before any fill: reason Cancelled, no position ever
        // existed, capacity must still be released
        exchange.push(ExchangeEvent::PositionClosed {
            symbol: "BTCUSDT".to_string(),
            exit_price: 0.0,
            exchange_pnl: 0.0,
            reason: PositionClosedReason::Cancelled,
        });
        wait_until(|| {
            let manager = manager.clone();
            async move { manager.active_count().await == 0 }
        })
        .await;
    }

    #[tokio::test]
    async fn pre_resolved_alerts_are_dropped() {
        let exchange = MockExchange::new(2);
        let (manager, _) = manager_with(vec![rule(SignalDirection::Any)], 3, &exchange);
        let mut alert = notification("BTCUSDT", 1);
        alert.closed = true;
        manager.execute(alert).await;
        assert!(exchange.orders().is_empty());
        assert_eq!(manager.active_count().await, 0);
    }

    #[tokio::test]
    async fn risk_command_clamps_to_one_for_target_direction() {
        let exchange = MockExchange::new(2);
        let (manager, _) = manager_with(
            vec![rule(SignalDirection::Long), rule(SignalDirection::Short)],
            3,
            &exchange,
        );

        manager
            .execute_remote_command(RemoteCommand {
                r#type: RemoteCommandType::ChangeStrategyRisk,
                target: RemoteCommandTarget::Short,
                risk_factor: Some(1.5),
                is_signal_active: None,
            })
            .await;

        // short rule clamped to 1.0, long rule untouched
        assert_eq!(manager.risk_factors().await, vec![1.0, 1.0]);

        manager
            .execute_remote_command(RemoteCommand {
                r#type: RemoteCommandType::ChangeStrategyRisk,
                target: RemoteCommandTarget::Short,
                risk_factor: Some(0.25),
                is_signal_active: None,
            })
            .await;
        assert_eq!(manager.risk_factors().await, vec![1.0, 0.25]);
    }

    #[tokio::test]
    async fn state_command_targets_all() {
        let exchange = MockExchange::new(2);
        let (manager, _) = manager_with(
            vec![rule(SignalDirection::Long), rule(SignalDirection::Short)],
            3,
            &exchange,
        );

        manager
            .execute_remote_command(RemoteCommand {
                r#type: RemoteCommandType::ChangeStrategyState,
                target: RemoteCommandTarget::All,
                risk_factor: None,
                is_signal_active: Some(false),
            })
            .await;
        assert_eq!(manager.active_flags().await, vec![false, false]);

        // deactivated rules no longer match
        manager.execute(notification("BTCUSDT", 1)).await;
        assert!(exchange.orders().is_empty());
    }

    #[tokio::test]
    async fn status_queries_list_open_symbols() {
        let exchange = MockExchange::new(2);
        let (manager, _) = manager_with(vec![rule(SignalDirection::Any)], 3, &exchange);
        assert!(manager.open_positions().await.is_empty());

        manager.execute(notification("BTCUSDT", 1)).await;
        assert_eq!(manager.open_positions().await, vec!["BTCUSDT".to_string()]);

        let details = manager.position_details().await;
        assert_eq!(details.len(), 1);
        assert!(details[0].contains("BTCUSDT"));
    }
}
