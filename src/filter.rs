// ===============================
// src/filter.rs
// ===============================
//
// Pre-trade signal filters. Advisory gates: a Signal rule without a filter
// executes unconditionally; a configured filter may veto with a
// human-readable message.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, NaiveDate, TimeZone, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::{FilterSettings, SignalConfig};
use crate::domain::{Kline, KlineInterval, Notification};
use crate::exchange::Exchange;

#[derive(Debug, Clone, PartialEq)]
pub enum FilterVerdict {
    Pass,
    Veto(String),
}

#[async_trait]
pub trait SignalFilter: Send + Sync {
    fn name(&self) -> &str;

    async fn pass(
        &self,
        signal: &SignalConfig,
        notification: &Notification,
        exchange: &dyn Exchange,
    ) -> FilterVerdict;
}

/// Build a filter instance from its config section. Unknown names are
/// reported and treated as absent.
pub fn from_settings(settings: &FilterSettings) -> Option<Box<dyn SignalFilter>> {
    match settings.name.as_str() {
        "CciFilter" => Some(Box::new(CciFilter::new(
            settings.symbol.clone(),
            settings.period,
            settings.offset,
        ))),
        other => {
            warn!(filter = %other, "unknown filter name, ignoring");
            None
        }
    }
}

// ---- CCI ----

/// Commodity channel index over closed candles:
/// tp = (high + low + close) / 3, cci = (tp - sma(tp)) / (0.015 * meandev).
/// Returns (open_time_ms, cci) for every index with a full window.
pub(crate) fn cci_series(klines: &[Kline], period: usize) -> Vec<(i64, f64)> {
    if period == 0 || klines.len() < period {
        return Vec::new();
    }
    let typical: Vec<f64> = klines
        .iter()
        .map(|k| (k.high + k.low + k.close) / 3.0)
        .collect();

    let mut out = Vec::with_capacity(klines.len() - period + 1);
    for end in period..=typical.len() {
        let window = &typical[end - period..end];
        let sma = window.iter().sum::<f64>() / period as f64;
        let mean_dev = window.iter().map(|tp| (tp - sma).abs()).sum::<f64>() / period as f64;
        let cci = if mean_dev == 0.0 {
            0.0
        } else {
            (window[period - 1] - sma) / (0.015 * mean_dev)
        };
        out.push((klines[end - 1].open_time_ms, cci));
    }
    out
}

struct CciCache {
    /// (candle date, cci), ascending.
    values: Vec<(NaiveDate, f64)>,
    loaded_on: Option<NaiveDate>,
}

/// Trend-confirmation gate on the daily CCI: long passes when CCI > 0, short
/// when CCI < 0. The series is cached per filter instance and re-fetched once
/// the UTC date rolls over.
pub struct CciFilter {
    symbol: String,
    period: usize,
    /// Days to step back from today when reading the series.
    offset: i64,
    cache: Mutex<CciCache>,
}

impl CciFilter {
    pub fn new(symbol: String, period: usize, offset: i64) -> Self {
        Self {
            symbol,
            period,
            offset,
            cache: Mutex::new(CciCache {
                values: Vec::new(),
                loaded_on: None,
            }),
        }
    }

    async fn refresh(&self, exchange: &dyn Exchange) -> bool {
        let today = Utc::now().date_naive();
        let mut cache = self.cache.lock().await;
        if cache.loaded_on == Some(today) && !cache.values.is_empty() {
            return true;
        }

        let span_days = (self.period as i64) * 2 + self.offset;
        let start = Utc::now() - ChronoDuration::days(span_days);
        let klines = match exchange
            .get_klines(&self.symbol, KlineInterval::Day, start, Utc::now())
            .await
        {
            Ok(klines) => klines,
            Err(e) => {
                warn!(symbol = %self.symbol, ?e, "filter kline fetch failed");
                return false;
            }
        };

        debug!(symbol = %self.symbol, candles = klines.len(), "refreshing cci data");
        cache.values = cci_series(&klines, self.period)
            .into_iter()
            .map(|(ts, cci)| {
                let date = Utc
                    .timestamp_millis_opt(ts)
                    .single()
                    .map(|dt| dt.date_naive())
                    .unwrap_or(today);
                (date, cci)
            })
            .collect();
        cache.loaded_on = Some(today);
        !cache.values.is_empty()
    }

    async fn current_value(&self) -> Option<f64> {
        let cutoff = Utc::now().date_naive() - ChronoDuration::days(self.offset);
        let cache = self.cache.lock().await;
        cache
            .values
            .iter()
            .rev()
            .find(|(date, _)| *date < cutoff)
            .map(|(_, cci)| *cci)
    }
}

#[async_trait]
impl SignalFilter for CciFilter {
    fn name(&self) -> &str {
        "CciFilter"
    }

    async fn pass(
        &self,
        _signal: &SignalConfig,
        notification: &Notification,
        exchange: &dyn Exchange,
    ) -> FilterVerdict {
        if !self.refresh(exchange).await {
            return FilterVerdict::Veto(format!(
                "Filter {} has no data for {}",
                self.name(),
                notification.symbol_name
            ));
        }
        let Some(cci) = self.current_value().await else {
            return FilterVerdict::Veto(format!(
                "Filter {} has no data for {}",
                self.name(),
                notification.symbol_name
            ));
        };

        if notification.signal > 0 && cci > 0.0 {
            return FilterVerdict::Pass;
        }
        if notification.signal < 0 && cci < 0.0 {
            return FilterVerdict::Pass;
        }

        let message = format!(
            "Could not pass filter {} for {}. CCI is {:.2}",
            self.name(),
            notification.symbol_name,
            cci
        );
        info!("{message}");
        FilterVerdict::Veto(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kline(ts: i64, value: f64) -> Kline {
        Kline {
            open_time_ms: ts,
            open: value,
            high: value + 1.0,
            low: value - 1.0,
            close: value,
            volume: 1.0,
        }
    }

    #[test]
    fn cci_needs_a_full_window() {
        let klines: Vec<Kline> = (0..5).map(|i| kline(i, 100.0)).collect();
        assert!(cci_series(&klines, 6).is_empty());
        assert_eq!(cci_series(&klines, 5).len(), 1);
        assert_eq!(cci_series(&klines, 3).len(), 3);
    }

    #[test]
    fn cci_is_zero_on_flat_prices() {
        let klines: Vec<Kline> = (0..10).map(|i| kline(i, 100.0)).collect();
        for (_, cci) in cci_series(&klines, 5) {
            assert_eq!(cci, 0.0);
        }
    }

    #[test]
    fn cci_sign_follows_trend() {
        // steadily rising closes: the newest typical price sits above the
        // window mean, so CCI must be positive
        let rising: Vec<Kline> = (0..20).map(|i| kline(i, 100.0 + i as f64)).collect();
        let series = cci_series(&rising, 10);
        assert!(series.last().unwrap().1 > 0.0);

        let falling: Vec<Kline> = (0..20).map(|i| kline(i, 200.0 - i as f64)).collect();
        let series = cci_series(&falling, 10);
        assert!(series.last().unwrap().1 < 0.0);
    }

    #[test]
    fn cci_matches_reference_window() {
        // one full window, hand-checked: tps = 10,20,30,40,50; sma = 30,
        // meandev = 12, cci = (50 - 30) / (0.015 * 12)
        let klines: Vec<Kline> = [10.0, 20.0, 30.0, 40.0, 50.0]
            .iter()
            .enumerate()
            .map(|(i, v)| Kline {
                open_time_ms: i as i64,
                open: *v,
                high: *v,
                low: *v,
                close: *v,
                volume: 1.0,
            })
            .collect();
        let series = cci_series(&klines, 5);
        assert_eq!(series.len(), 1);
        let expected = 20.0 / (0.015 * 12.0);
        assert!((series[0].1 - expected).abs() < 1e-9);
    }

    #[test]
    fn unknown_filter_names_are_ignored() {
        let settings = FilterSettings {
            name: "NoSuchFilter".to_string(),
            ..FilterSettings::default()
        };
        assert!(from_settings(&settings).is_none());

        let settings = FilterSettings {
            name: "CciFilter".to_string(),
            symbol: "BTCUSDT".to_string(),
            period: 14,
            offset: 1,
        };
        assert!(from_settings(&settings).is_some());
    }
}
