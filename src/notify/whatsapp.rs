use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use tracing::info;

use super::ChatSender;
use crate::config::GreenApiConfig;
use crate::error::{AppError, AppResult};

const GREEN_API_BASE: &str = "https://api.green-api.com";
const TIMEOUT: Duration = Duration::from_secs(15);

/// WhatsApp messages through the Green API HTTP gateway.
pub struct GreenApiSender {
    client: Client,
    base_url: String,
    config: GreenApiConfig,
}

impl GreenApiSender {
    pub fn new(config: GreenApiConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(TIMEOUT)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build HTTP client: {e}"))?;
        Ok(Self {
            client,
            base_url: GREEN_API_BASE.to_string(),
            config,
        })
    }

    fn send_url(&self) -> String {
        format!(
            "{}/waInstance{}/sendMessage/{}",
            self.base_url, self.config.instance_id, self.config.token
        )
    }
}

/// Green API chat id for a phone number: digits followed by `@c.us`.
pub(crate) fn chat_id(phone: &str) -> String {
    let digits: String = phone.chars().filter(char::is_ascii_digit).collect();
    format!("{digits}@c.us")
}

#[async_trait]
impl ChatSender for GreenApiSender {
    async fn send_message(&self, phone: &str, text: &str) -> AppResult<()> {
        let resp = self
            .client
            .post(self.send_url())
            .json(&json!({ "chatId": chat_id(phone), "message": text }))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AppError::Upstream("WhatsApp gateway timed out".into())
                } else {
                    AppError::Upstream(format!("WhatsApp gateway unreachable: {e}"))
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(AppError::Upstream(format!(
                "WhatsApp gateway error (HTTP {})",
                status.as_u16()
            )));
        }
        info!(chat = %chat_id(phone), "WhatsApp message sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_id_strips_formatting() {
        assert_eq!(chat_id("+44 7700 900000"), "447700900000@c.us");
    }

    #[test]
    fn send_url_embeds_instance_and_token() {
        let sender = GreenApiSender::new(GreenApiConfig {
            instance_id: "1101".into(),
            token: "tok".into(),
        })
        .unwrap();
        assert_eq!(
            sender.send_url(),
            "https://api.green-api.com/waInstance1101/sendMessage/tok"
        );
    }
}
