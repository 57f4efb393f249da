// ===============================
// src/telegram.rs
// ===============================
//
// Outbound operator channel (Telegram Bot API over plain HTTPS) plus the
// small inbound command vocabulary. The notifier is an injected dependency,
// constructed once at startup; components that report to the operator hold
// it as a trait object.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio::time::sleep;
use tracing::{debug, error, info};

use crate::config::TelegramSettings;
use crate::signal_manager::SignalManager;

pub const CMD_PING: &str = "ping";
pub const CMD_OPEN_POSITIONS: &str = "openpositions";
pub const CMD_POSITION_DETAILS: &str = "positiondetails";

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Push one status/alert message to the operator. Failures are logged,
    /// never propagated.
    async fn send(&self, message: &str);
}

/// Used when no telegram section is configured.
pub struct NullNotifier;

#[async_trait]
impl Notifier for NullNotifier {
    async fn send(&self, _message: &str) {}
}

pub struct TelegramBot {
    client: reqwest::Client,
    token: String,
    chat_id: String,
}

impl TelegramBot {
    pub fn new(settings: &TelegramSettings) -> Arc<Self> {
        Arc::new(Self {
            client: reqwest::Client::new(),
            token: settings.bot_token.clone(),
            chat_id: settings.chat_id.clone(),
        })
    }

    /// Notifier from optional settings: Null when absent or incomplete.
    pub fn notifier_from(settings: Option<&TelegramSettings>) -> (Arc<dyn Notifier>, Option<Arc<TelegramBot>>) {
        match settings {
            Some(settings) if !settings.bot_token.is_empty() && !settings.chat_id.is_empty() => {
                let bot = TelegramBot::new(settings);
                let notifier: Arc<dyn Notifier> = bot.clone();
                (notifier, Some(bot))
            }
            _ => {
                info!("telegram not configured, operator channel disabled");
                let notifier: Arc<dyn Notifier> = Arc::new(NullNotifier);
                (notifier, None)
            }
        }
    }

    fn api(&self, method: &str) -> String {
        format!("https://api.telegram.org/bot{}/{}", self.token, method)
    }

    async fn get_updates(&self, offset: i64) -> Option<Vec<Update>> {
        let offset = offset.to_string();
        let response = self
            .client
            .get(self.api("getUpdates"))
            .query(&[("timeout", "50"), ("offset", offset.as_str())])
            .timeout(Duration::from_secs(60))
            .send()
            .await;
        match response {
            Ok(response) => match response.json::<UpdatesResponse>().await {
                Ok(updates) if updates.ok => Some(updates.result),
                Ok(_) => None,
                Err(e) => {
                    error!(?e, "telegram getUpdates parse failed");
                    None
                }
            },
            Err(e) => {
                error!(?e, "telegram getUpdates failed");
                None
            }
        }
    }
}

#[async_trait]
impl Notifier for TelegramBot {
    async fn send(&self, message: &str) {
        let body = json!({ "chat_id": self.chat_id, "text": message });
        match self
            .client
            .post(self.api("sendMessage"))
            .json(&body)
            .send()
            .await
        {
            Ok(response) if !response.status().is_success() => {
                error!(status = %response.status(), "telegram sendMessage rejected");
            }
            Err(e) => error!(?e, "telegram sendMessage failed"),
            _ => {}
        }
    }
}

#[derive(Debug, Deserialize)]
struct UpdatesResponse {
    ok: bool,
    #[serde(default)]
    result: Vec<Update>,
}

#[derive(Debug, Deserialize)]
struct Update {
    update_id: i64,
    #[serde(default)]
    message: Option<UpdateMessage>,
}

#[derive(Debug, Deserialize)]
struct UpdateMessage {
    #[serde(default)]
    text: Option<String>,
}

/// "/ping" -> Some("ping"); plain text -> None.
fn command_of(text: &str) -> Option<&str> {
    text.strip_prefix('/')
}

/// Long-poll command loop: maps the command vocabulary 1:1 onto signal
/// manager status queries.
pub async fn run_command_loop(bot: Arc<TelegramBot>, manager: Arc<SignalManager>) {
    let mut offset: i64 = 0;
    info!("telegram command loop started");
    loop {
        let Some(updates) = bot.get_updates(offset).await else {
            sleep(Duration::from_secs(5)).await;
            continue;
        };

        for update in updates {
            offset = offset.max(update.update_id + 1);
            let Some(text) = update.message.and_then(|m| m.text) else {
                continue;
            };
            debug!(%text, "telegram command received");

            match command_of(&text) {
                Some(CMD_PING) => bot.send("pong").await,
                Some(CMD_OPEN_POSITIONS) => {
                    let positions = manager.open_positions().await;
                    if positions.is_empty() {
                        bot.send("No open positions!").await;
                    } else {
                        bot.send(&positions.join("\n")).await;
                    }
                }
                Some(CMD_POSITION_DETAILS) => {
                    let details = manager.position_details().await;
                    if details.is_empty() {
                        bot.send("No open positions!").await;
                    } else {
                        bot.send(&details.join("\n")).await;
                    }
                }
                _ => bot.send(&format!("Unknown command {}", text)).await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_require_slash_prefix() {
        assert_eq!(command_of("/ping"), Some("ping"));
        assert_eq!(command_of("/openpositions"), Some(CMD_OPEN_POSITIONS));
        assert_eq!(command_of("ping"), None);
        assert_eq!(command_of(""), None);
    }

    #[test]
    fn updates_response_parses() {
        let text = r#"{
            "ok": true,
            "result": [
                {"update_id": 10, "message": {"text": "/ping"}},
                {"update_id": 11, "message": {}},
                {"update_id": 12}
            ]
        }"#;
        let updates: UpdatesResponse = serde_json::from_str(text).unwrap();
        assert!(updates.ok);
        assert_eq!(updates.result.len(), 3);
        assert_eq!(
            updates.result[0].message.as_ref().unwrap().text.as_deref(),
            Some("/ping")
        );
        assert!(updates.result[2].message.is_none());
    }

    #[test]
    fn notifier_falls_back_to_null() {
        let (_, bot) = TelegramBot::notifier_from(None);
        assert!(bot.is_none());

        let empty = TelegramSettings::default();
        let (_, bot) = TelegramBot::notifier_from(Some(&empty));
        assert!(bot.is_none());

        let full = TelegramSettings {
            bot_token: "t".to_string(),
            chat_id: "c".to_string(),
        };
        let (_, bot) = TelegramBot::notifier_from(Some(&full));
        assert!(bot.is_some());
    }
}
