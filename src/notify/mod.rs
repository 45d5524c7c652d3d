//! Outbound customer email and admin WhatsApp messages.
//!
//! Both channels are best-effort: [`Notifier`] logs failures and never
//! returns them, so a mail outage can't fail an order.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::AppResult;

mod smtp;
pub mod templates;
mod whatsapp;

pub use smtp::SmtpMailer;
pub use whatsapp::GreenApiSender;

#[derive(Debug, Clone, PartialEq)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub body_html: String,
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, message: EmailMessage) -> AppResult<()>;
}

#[async_trait]
pub trait ChatSender: Send + Sync {
    /// Send a text message to a phone number (international format, digits
    /// only).
    async fn send_message(&self, phone: &str, text: &str) -> AppResult<()>;
}

pub type DynMailer = Arc<dyn Mailer>;
pub type DynChatSender = Arc<dyn ChatSender>;

/// Stand-in when a channel is not configured. Drops messages with a debug
/// log.
pub struct Disabled;

#[async_trait]
impl Mailer for Disabled {
    async fn send(&self, message: EmailMessage) -> AppResult<()> {
        debug!(to = %message.to, subject = %message.subject, "mail disabled, dropping message");
        Ok(())
    }
}

#[async_trait]
impl ChatSender for Disabled {
    async fn send_message(&self, phone: &str, _text: &str) -> AppResult<()> {
        debug!(phone, "chat disabled, dropping message");
        Ok(())
    }
}

#[derive(Clone)]
pub struct Notifier {
    mailer: DynMailer,
    chat: DynChatSender,
    admin_phone: Option<String>,
}

impl Notifier {
    pub fn new(mailer: DynMailer, chat: DynChatSender, admin_phone: Option<String>) -> Self {
        Self {
            mailer,
            chat,
            admin_phone,
        }
    }

    pub async fn email(&self, message: EmailMessage) {
        let to = message.to.clone();
        let subject = message.subject.clone();
        if let Err(e) = self.mailer.send(message).await {
            warn!(to = %to, subject = %subject, error = %e, "failed to send email");
        }
    }

    pub async fn admin_alert(&self, text: &str) {
        let Some(phone) = self.admin_phone.as_deref() else {
            debug!("ADMIN_PHONE_NUMBER not set, skipping admin alert");
            return;
        };
        if let Err(e) = self.chat.send_message(phone, text).await {
            warn!(error = %e, "failed to send admin WhatsApp alert");
        }
    }
}
