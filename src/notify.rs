use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;

use crate::config::Config;
use crate::logging::{json_log, log, obj, v_str, Level};

/// Routine messages are heartbeats ("alive, nothing changed"); alerts are
/// pool changes, trades, risk breaches, and degraded-mode transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Urgency {
    Routine,
    Alert,
}

impl Urgency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Urgency::Routine => "routine",
            Urgency::Alert => "alert",
        }
    }
}

/// Fire-and-forget notification sink. Failures are logged and swallowed,
/// never propagated to the caller.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, urgency: Urgency, text: &str);
}

/// Default sink: the structured log stream.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, urgency: Urgency, text: &str) {
        let level = match urgency {
            Urgency::Routine => Level::Debug,
            Urgency::Alert => Level::Info,
        };
        log(
            level,
            "notify",
            obj(&[("urgency", v_str(urgency.as_str())), ("text", v_str(text))]),
        );
    }
}

/// Telegram bot-API sink. Routine heartbeats stay in the log; only alerts
/// leave the process.
pub struct TelegramNotifier {
    client: Client,
    token: String,
    chat_id: String,
}

impl TelegramNotifier {
    pub fn new(token: String, chat_id: String) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { client, token, chat_id }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify(&self, urgency: Urgency, text: &str) {
        LogNotifier.notify(urgency, text).await;
        if urgency == Urgency::Routine {
            return;
        }
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.token);
        let body = json!({ "chat_id": self.chat_id, "text": text });
        match self.client.post(&url).json(&body).send().await {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => {
                json_log(
                    "notify",
                    obj(&[
                        ("channel", v_str("telegram")),
                        ("status", v_str(&resp.status().as_u16().to_string())),
                        ("result", v_str("send_failed")),
                    ]),
                );
            }
            Err(err) => {
                json_log(
                    "notify",
                    obj(&[
                        ("channel", v_str("telegram")),
                        ("result", v_str("send_failed")),
                        ("error", v_str(&err.to_string())),
                    ]),
                );
            }
        }
    }
}

pub fn build(cfg: &Config) -> Arc<dyn Notifier> {
    match (&cfg.telegram_token, &cfg.telegram_chat) {
        (Some(token), Some(chat)) => {
            json_log("notify", obj(&[("channel", v_str("telegram")), ("status", v_str("enabled"))]));
            Arc::new(TelegramNotifier::new(token.clone(), chat.clone()))
        }
        _ => {
            json_log("notify", obj(&[("channel", v_str("log")), ("status", v_str("enabled"))]));
            Arc::new(LogNotifier)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_log_notifier_never_fails() {
        LogNotifier.notify(Urgency::Alert, "pool update: +BTCUSDT").await;
        LogNotifier.notify(Urgency::Routine, "heartbeat").await;
    }

    #[test]
    fn test_urgency_labels() {
        assert_eq!(Urgency::Routine.as_str(), "routine");
        assert_eq!(Urgency::Alert.as_str(), "alert");
    }
}
