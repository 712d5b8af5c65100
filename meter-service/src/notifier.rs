use std::time::Duration;

use meter_client::{domain::NotifySettings, engine::Notifier, SendError};
use serde::Serialize;

/// Delivers alerts through the Telegram Bot API (`sendMessage`, HTML markup).
pub struct TelegramNotifier {
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
    parse_mode: &'a str,
}

impl TelegramNotifier {
    pub fn new(timeout: Duration) -> Result<Self, SendError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SendError::Transport(format!("failed to build http client: {e}")))?;
        Ok(Self { client })
    }
}

fn send_message_url(channel: &NotifySettings) -> String {
    format!(
        "{}/bot{}/sendMessage",
        channel.api_endpoint.trim_end_matches('/'),
        channel.bot_token
    )
}

#[async_trait::async_trait]
impl Notifier for TelegramNotifier {
    async fn send(&self, channel: &NotifySettings, message: &str) -> Result<(), SendError> {
        if !channel.is_configured() {
            return Err(SendError::NotConfigured(
                "bot token and chat id are required".to_string(),
            ));
        }

        let body = SendMessage {
            chat_id: &channel.chat_id,
            text: message,
            parse_mode: "HTML",
        };

        let resp = self
            .client
            .post(send_message_url(channel))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                metrics::counter!("notify_send_failures_total").increment(1);
                // reqwest errors carry the URL, which embeds the bot token.
                SendError::Transport(e.without_url().to_string())
            })?;

        let status = resp.status();
        if status.is_success() {
            metrics::counter!("notify_sent_total").increment(1);
            Ok(())
        } else {
            let detail = resp.text().await.unwrap_or_default();
            tracing::warn!(status = status.as_u16(), detail = %detail, "notification rejected");
            metrics::counter!("notify_send_failures_total").increment(1);
            Err(SendError::Status(status.as_u16()))
        }
    }
}
