// ===============================
// src/config.rs
// ===============================
//
// Startup configuration:
// - JSON config file (exchanges, signal rules, telegram, MaxPositions),
//   loaded once; the signal list structure is never hot-reloaded, only
//   IsActive/RiskFactor change at runtime via remote command.
// - .env / environment overrides for secrets and ports.
// - CLI flags for the config path.

use std::env;
use std::fs;
use std::path::PathBuf;

use clap::Parser;
use dotenvy::dotenv;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::SignalDirection;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),
    #[error("could not parse config file {0}: {1}")]
    Parse(PathBuf, #[source] serde_json::Error),
}

#[derive(Parser, Debug, Clone)]
#[command(name = "signal_bot_rust", about = "Webhook signal trader")]
pub struct Args {
    /// Path to the JSON configuration file
    #[arg(long, default_value = "config.json")]
    pub config: PathBuf,

    /// Port for the webhook ingress
    #[arg(long, default_value_t = 8080)]
    pub listen_port: u16,

    /// Port for the Prometheus metrics endpoint
    #[arg(long, default_value_t = 9898)]
    pub metrics_port: u16,
}

/// One configured trading rule. Created at config load; only `is_active` and
/// `risk_factor` are mutated at runtime (by remote command, under the
/// manager's lock).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SignalConfig {
    pub r#type: i32,
    pub signal_type_id: i32,
    pub exchange: String,
    pub strategy: String,
    pub direction: SignalDirection,
    pub leverage: f64,
    /// Fraction of capital risked per trade, in quote currency terms.
    pub risk_per_trade: f64,
    /// Runtime multiplier on risk, clamped to [0, 1] by remote command.
    pub risk_factor: f64,
    pub is_active: bool,
    /// Take-profit/stop-loss offsets as fractions of entry price
    /// (signal-relative strategies).
    pub take_profit: f64,
    pub stop_loss: f64,
    /// Which Target field of the notification to use (fixed-index strategy).
    pub take_profit_index: usize,
    /// Favorable move required before trailing arms, as a fraction of entry.
    pub trailing_start_offset: f64,
    /// Distance the stop trails behind the last price, as a fraction.
    pub trailing_offset: f64,
    pub use_stop_loss_from_signal: bool,
    pub filter: Option<FilterSettings>,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            r#type: 0,
            signal_type_id: 0,
            exchange: String::new(),
            strategy: String::new(),
            direction: SignalDirection::Any,
            leverage: 1.0,
            risk_per_trade: 0.0,
            risk_factor: 1.0,
            is_active: true,
            take_profit: 0.0,
            stop_loss: 0.0,
            take_profit_index: 0,
            trailing_start_offset: 0.0,
            trailing_offset: 0.0,
            use_stop_loss_from_signal: false,
            filter: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct FilterSettings {
    pub name: String,
    pub symbol: String,
    pub period: usize,
    /// Days to step back from today when reading the cached series.
    pub offset: i64,
}

impl Default for FilterSettings {
    fn default() -> Self {
        Self {
            name: String::new(),
            symbol: String::new(),
            period: 20,
            offset: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ExchangeSettings {
    pub name: String,
    pub api_key: String,
    pub secret_key: String,
    pub rest_base_url: String,
    pub public_ws_url: String,
    pub private_ws_url: String,
    /// "Isolated" or "Cross".
    pub margin_mode: String,
    /// Seconds an unfilled order may live before reconciliation cancels it.
    /// 0 disables the order timeout.
    pub order_timeout: u64,
    /// Seconds a position may live before reconciliation flattens it.
    /// 0 disables the position timeout.
    pub position_timeout: u64,
}

impl Default for ExchangeSettings {
    fn default() -> Self {
        Self {
            name: "BybitFutures".to_string(),
            api_key: String::new(),
            secret_key: String::new(),
            rest_base_url: "https://api.bybit.com".to_string(),
            public_ws_url: "wss://stream.bybit.com/v5/public/linear".to_string(),
            private_ws_url: "wss://stream.bybit.com/v5/private".to_string(),
            margin_mode: "Isolated".to_string(),
            order_timeout: 0,
            position_timeout: 0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct TelegramSettings {
    pub bot_token: String,
    pub chat_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct AppConfig {
    pub max_positions: usize,
    pub exchanges: Vec<ExchangeSettings>,
    pub signals: Vec<SignalConfig>,
    pub telegram: Option<TelegramSettings>,
    /// JSONL journal path; None disables the recorder.
    pub record_file: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            max_positions: 1,
            exchanges: Vec::new(),
            signals: Vec::new(),
            telegram: None,
            record_file: None,
        }
    }
}

/// Load CLI flags, read the config file, then apply environment overrides
/// (secrets should come from the environment, not the file).
pub fn load() -> Result<(Args, AppConfig), ConfigError> {
    let _ = dotenv();
    let mut args = Args::parse();
    let config = load_file(&mut args)?;
    Ok((args, config))
}

fn load_file(args: &mut Args) -> Result<AppConfig, ConfigError> {
    let text = fs::read_to_string(&args.config)
        .map_err(|e| ConfigError::Io(args.config.clone(), e))?;
    let mut config: AppConfig =
        serde_json::from_str(&text).map_err(|e| ConfigError::Parse(args.config.clone(), e))?;
    apply_env(args, &mut config);
    Ok(config)
}

fn apply_env(args: &mut Args, config: &mut AppConfig) {
    if let Ok(port) = env::var("LISTEN_PORT") {
        if let Ok(port) = port.parse() {
            args.listen_port = port;
        }
    }
    if let Ok(port) = env::var("METRICS_PORT") {
        if let Ok(port) = port.parse() {
            args.metrics_port = port;
        }
    }
    if let Ok(path) = env::var("RECORD_FILE") {
        config.record_file = Some(path);
    }

    for exchange in config.exchanges.iter_mut() {
        if let Ok(key) = env::var("BYBIT_API_KEY") {
            exchange.api_key = key;
        }
        if let Ok(secret) = env::var("BYBIT_API_SECRET") {
            exchange.secret_key = secret;
        }
    }

    let token = env::var("TELEGRAM_BOT_TOKEN").ok();
    let chat = env::var("TELEGRAM_CHAT_ID").ok();
    if let (Some(token), Some(chat)) = (token, chat) {
        config.telegram = Some(TelegramSettings {
            bot_token: token,
            chat_id: chat,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_config() {
        let text = r#"{
            "MaxPositions": 3,
            "Exchanges": [{
                "Name": "BybitFutures",
                "ApiKey": "k",
                "SecretKey": "s",
                "OrderTimeout": 300,
                "PositionTimeout": 86400
            }],
            "Signals": [{
                "Type": 1,
                "SignalTypeId": 2,
                "Exchange": "BybitFutures",
                "Strategy": "FixedTakeProfit",
                "Direction": "Long",
                "Leverage": 5,
                "RiskPerTrade": 25.0,
                "TakeProfitIndex": 5
            }],
            "Telegram": { "BotToken": "t", "ChatId": "c" }
        }"#;
        let config: AppConfig = serde_json::from_str(text).unwrap();
        assert_eq!(config.max_positions, 3);
        assert_eq!(config.exchanges.len(), 1);
        assert_eq!(config.exchanges[0].order_timeout, 300);
        assert_eq!(
            config.exchanges[0].rest_base_url,
            "https://api.bybit.com"
        );
        let signal = &config.signals[0];
        assert_eq!(signal.take_profit_index, 5);
        assert_eq!(signal.direction, SignalDirection::Long);
        // runtime defaults
        assert!(signal.is_active);
        assert_eq!(signal.risk_factor, 1.0);
        assert!(signal.filter.is_none());
    }

    #[test]
    fn signal_defaults_are_safe() {
        let signal: SignalConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(signal.leverage, 1.0);
        assert_eq!(signal.direction, SignalDirection::Any);
        assert!(!signal.use_stop_loss_from_signal);
    }

    #[test]
    fn filter_settings_parse() {
        let signal: SignalConfig = serde_json::from_str(
            r#"{"Filter": {"Name": "CciFilter", "Symbol": "BTCUSDT", "Period": 14, "Offset": 1}}"#,
        )
        .unwrap();
        let filter = signal.filter.unwrap();
        assert_eq!(filter.name, "CciFilter");
        assert_eq!(filter.period, 14);
    }
}
