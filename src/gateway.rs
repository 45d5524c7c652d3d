//! Payment provider seam.
//!
//! [`PaymentGateway`] is the only place the service touches Stripe. The
//! production adapter uses `async-stripe`; tests substitute an in-memory
//! recorder.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info};

use crate::error::{AppError, AppResult};

/// Stripe caps each metadata value at 500 characters.
pub const METADATA_VALUE_LIMIT: usize = 500;

#[derive(Debug, Clone, PartialEq)]
pub struct LineItem {
    pub name: String,
    pub unit_amount: i64,
    pub quantity: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CheckoutRequest {
    pub line_items: Vec<LineItem>,
    pub customer_email: String,
    pub success_url: String,
    pub cancel_url: String,
    pub metadata: HashMap<String, String>,
}

impl CheckoutRequest {
    /// Amount requested from the customer, in pence.
    pub fn amount_total(&self) -> i64 {
        self.line_items
            .iter()
            .map(|l| l.unit_amount * l.quantity as i64)
            .sum()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HostedSession {
    pub id: String,
    pub url: String,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_checkout(&self, request: CheckoutRequest) -> AppResult<HostedSession>;

    /// Refund the full payment behind a checkout session. Returns the
    /// provider's refund id.
    async fn refund(&self, session_id: &str, payment_intent_id: Option<&str>)
        -> AppResult<String>;
}

pub type DynPaymentGateway = Arc<dyn PaymentGateway>;

// ---------------------------------------------------------------------------
// Metadata chunking
// ---------------------------------------------------------------------------

/// Store `value` under `key`, or split it across `key_0`, `key_1`, … when it
/// exceeds the provider limit.
pub fn put_chunked(metadata: &mut HashMap<String, String>, key: &str, value: &str) {
    if value.chars().count() <= METADATA_VALUE_LIMIT {
        metadata.insert(key.to_string(), value.to_string());
        return;
    }
    let chars: Vec<char> = value.chars().collect();
    for (i, chunk) in chars.chunks(METADATA_VALUE_LIMIT).enumerate() {
        metadata.insert(format!("{key}_{i}"), chunk.iter().collect());
    }
}

/// Reassemble a value written by [`put_chunked`].
pub fn take_chunked(metadata: &HashMap<String, String>, key: &str) -> Option<String> {
    if let Some(value) = metadata.get(key) {
        return Some(value.clone());
    }
    let mut out = String::new();
    let mut i = 0;
    while let Some(part) = metadata.get(&format!("{key}_{i}")) {
        out.push_str(part);
        i += 1;
    }
    (i > 0).then_some(out)
}

// ---------------------------------------------------------------------------
// Stripe
// ---------------------------------------------------------------------------

pub struct StripeGateway {
    client: stripe::Client,
}

impl StripeGateway {
    pub fn new(secret_key: &str) -> Self {
        Self {
            client: stripe::Client::new(secret_key),
        }
    }

    async fn payment_intent_for(&self, session_id: &str) -> AppResult<String> {
        let id = stripe::CheckoutSessionId::from_str(session_id)
            .map_err(|e| AppError::Payment(format!("Invalid session id {session_id}: {e}")))?;
        let session = stripe::CheckoutSession::retrieve(&self.client, &id, &[]).await?;
        match session.payment_intent {
            Some(stripe::Expandable::Id(id)) => Ok(id.to_string()),
            Some(stripe::Expandable::Object(pi)) => Ok(pi.id.to_string()),
            None => Err(AppError::Payment(format!(
                "Session {session_id} has no payment to refund"
            ))),
        }
    }
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    async fn create_checkout(&self, request: CheckoutRequest) -> AppResult<HostedSession> {
        let mut params = stripe::CreateCheckoutSession::new();
        params.success_url = Some(&request.success_url);
        params.cancel_url = Some(&request.cancel_url);
        params.mode = Some(stripe::CheckoutSessionMode::Payment);
        params.customer_email = Some(&request.customer_email);
        params.line_items = Some(
            request
                .line_items
                .iter()
                .map(|item| stripe::CreateCheckoutSessionLineItems {
                    price_data: Some(stripe::CreateCheckoutSessionLineItemsPriceData {
                        currency: stripe::Currency::GBP,
                        product_data: Some(
                            stripe::CreateCheckoutSessionLineItemsPriceDataProductData {
                                name: item.name.clone(),
                                ..Default::default()
                            },
                        ),
                        unit_amount: Some(item.unit_amount),
                        ..Default::default()
                    }),
                    quantity: Some(item.quantity),
                    ..Default::default()
                })
                .collect(),
        );
        params.metadata = Some(request.metadata.clone());

        let session = stripe::CheckoutSession::create(&self.client, params)
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to create Stripe checkout session");
                AppError::from(e)
            })?;

        let url = session
            .url
            .ok_or_else(|| AppError::Payment("Checkout session has no redirect URL".into()))?;

        info!(
            session_id = %session.id,
            amount_pence = request.amount_total(),
            "created checkout session"
        );
        Ok(HostedSession {
            id: session.id.to_string(),
            url,
        })
    }

    async fn refund(
        &self,
        session_id: &str,
        payment_intent_id: Option<&str>,
    ) -> AppResult<String> {
        let intent = match payment_intent_id {
            Some(id) => id.to_string(),
            None => self.payment_intent_for(session_id).await?,
        };
        let intent_id = stripe::PaymentIntentId::from_str(&intent)
            .map_err(|e| AppError::Payment(format!("Invalid payment intent {intent}: {e}")))?;

        let mut params = stripe::CreateRefund::new();
        params.payment_intent = Some(intent_id);
        let refund = stripe::Refund::create(&self.client, params)
            .await
            .map_err(|e| {
                error!(error = %e, session_id, "Stripe refund failed");
                AppError::from(e)
            })?;

        info!(session_id, refund_id = %refund.id, "payment refunded");
        Ok(refund.id.to_string())
    }
}

/// Used when no Stripe key is configured.
pub struct DisabledGateway;

#[async_trait]
impl PaymentGateway for DisabledGateway {
    async fn create_checkout(&self, _request: CheckoutRequest) -> AppResult<HostedSession> {
        Err(AppError::Payment(
            "Online payments are not configured".to_string(),
        ))
    }

    async fn refund(&self, session_id: &str, _: Option<&str>) -> AppResult<String> {
        Err(AppError::Payment(format!(
            "Online payments are not configured; cannot refund {session_id}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_values_are_stored_whole() {
        let mut md = HashMap::new();
        put_chunked(&mut md, "cart", "[]");
        assert_eq!(md.get("cart").map(String::as_str), Some("[]"));
        assert_eq!(take_chunked(&md, "cart").as_deref(), Some("[]"));
    }

    #[test]
    fn long_values_split_and_rejoin() {
        let value: String = "ab£".repeat(400);
        let mut md = HashMap::new();
        put_chunked(&mut md, "cart", &value);
        assert!(!md.contains_key("cart"));
        assert_eq!(md.len(), 3);
        assert!(md.values().all(|v| v.chars().count() <= METADATA_VALUE_LIMIT));
        assert_eq!(take_chunked(&md, "cart").unwrap(), value);
    }

    #[test]
    fn missing_key_is_none() {
        assert_eq!(take_chunked(&HashMap::new(), "cart"), None);
    }

    #[test]
    fn amount_total_sums_lines() {
        let req = CheckoutRequest {
            line_items: vec![
                LineItem {
                    name: "Pie".into(),
                    unit_amount: 1000,
                    quantity: 2,
                },
                LineItem {
                    name: "Tea".into(),
                    unit_amount: 150,
                    quantity: 1,
                },
            ],
            customer_email: "a@b.c".into(),
            success_url: "s".into(),
            cancel_url: "c".into(),
            metadata: HashMap::new(),
        };
        assert_eq!(req.amount_total(), 2150);
    }
}
