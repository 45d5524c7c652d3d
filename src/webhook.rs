//! Payment provider webhook: signature check, event dedupe and fulfilment.
//!
//! A completed checkout session either creates the storefront order carried
//! in its metadata or confirms an event booking. The dedupe row, the order
//! (or booking) and every stock movement commit in one transaction, so a
//! redelivered event is acknowledged without touching anything.

use std::collections::HashMap;

use hmac::{Hmac, Mac};
use rusqlite::{params, Connection};
use serde::Deserialize;
use sha2::Sha256;
use tracing::{debug, error, info, warn};

use crate::checkout::ORDER_METADATA_TYPE;
use crate::db;
use crate::discounts::Quote;
use crate::error::{AppError, AppResult};
use crate::events::{self, BookingOutcome, BOOKING_METADATA_TYPE};
use crate::gateway;
use crate::models::{round_money, CartLine, CustomerInfo, PaymentMethod, PaymentStatus};
use crate::orders::placement::{self, OrderDraft, Placement, PlacedOrder};
use crate::state::AppState;

/// Maximum age of a signed payload.
pub const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Signature accepted without verification outside production.
const TEST_SIGNATURE: &str = "test";

const CHECKOUT_COMPLETED: &str = "checkout.session.completed";

type HmacSha256 = Hmac<Sha256>;

// ---------------------------------------------------------------------------
// Signature
// ---------------------------------------------------------------------------

/// Check a `Stripe-Signature` header (`t=<unix>,v1=<hex>[,v1=…]`) against
/// `payload`.
pub fn verify_signature(payload: &[u8], header: &str, secret: &str, now: i64) -> Result<(), String> {
    let mut timestamp: Option<i64> = None;
    let mut signatures: Vec<&str> = Vec::new();

    for part in header.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else {
            continue;
        };
        match key {
            "t" => timestamp = value.parse().ok(),
            "v1" => signatures.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or("No timestamp in signature header")?;
    if signatures.is_empty() {
        return Err("No v1 signature in signature header".to_string());
    }
    if (now - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        return Err("Timestamp outside the tolerance zone".to_string());
    }

    let mut signed = Vec::with_capacity(payload.len() + 12);
    signed.extend_from_slice(timestamp.to_string().as_bytes());
    signed.push(b'.');
    signed.extend_from_slice(payload);

    let matched = signatures.iter().any(|candidate| {
        let Ok(expected) = hex::decode(candidate) else {
            return false;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
            return false;
        };
        mac.update(&signed);
        mac.verify_slice(&expected).is_ok()
    });

    if matched {
        Ok(())
    } else {
        Err("No signatures found matching the expected signature for payload".to_string())
    }
}

// ---------------------------------------------------------------------------
// Event payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ProviderEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    data: EventData,
}

#[derive(Debug, Deserialize)]
struct EventData {
    object: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct CompletedSession {
    id: String,
    #[serde(default)]
    payment_intent: Option<String>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

#[derive(Debug)]
pub enum WebhookOutcome {
    OrderPlaced(i64),
    BookingConfirmed(i64),
    Duplicate,
    Ignored,
}

// ---------------------------------------------------------------------------
// Processing
// ---------------------------------------------------------------------------

fn to_webhook_error(e: AppError) -> String {
    if e.status().is_server_error() {
        error!(error = %e, "webhook fulfilment failed");
    }
    e.public_message()
}

/// Verify and apply one webhook delivery.
pub async fn process(
    state: &AppState,
    payload: &[u8],
    signature: Option<&str>,
) -> Result<WebhookOutcome, String> {
    let signature = signature.ok_or("Missing Stripe-Signature header")?;

    if !state.config.app_env.is_production() && signature == TEST_SIGNATURE {
        debug!("test signature accepted outside production");
    } else {
        let secret = state
            .config
            .stripe_webhook_secret
            .as_deref()
            .ok_or("Webhook secret is not configured")?;
        verify_signature(payload, signature, secret, chrono::Utc::now().timestamp())?;
    }

    let event: ProviderEvent =
        serde_json::from_slice(payload).map_err(|e| format!("Invalid event payload: {e}"))?;

    if event.event_type != CHECKOUT_COMPLETED {
        debug!(event_id = %event.id, event_type = %event.event_type, "ignoring webhook event");
        return Ok(WebhookOutcome::Ignored);
    }

    let session: CompletedSession = serde_json::from_value(event.data.object)
        .map_err(|e| format!("Invalid checkout session: {e}"))?;

    let kind = session
        .metadata
        .get("type")
        .map(String::as_str)
        .unwrap_or(ORDER_METADATA_TYPE);

    if kind == BOOKING_METADATA_TYPE {
        fulfil_booking(state, &event.id, &session).await
    } else {
        fulfil_order(state, &event.id, &session).await
    }
}

/// Record the event id. Returns false when it was already processed.
fn claim_event(conn: &Connection, event_id: &str) -> AppResult<bool> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO processed_webhook_events (id, event_type) VALUES (?1, ?2)",
        params![event_id, CHECKOUT_COMPLETED],
    )?;
    Ok(inserted == 1)
}

fn metadata_amount(metadata: &HashMap<String, String>, key: &str) -> Result<f64, String> {
    metadata
        .get(key)
        .ok_or_else(|| format!("Missing {key} in session metadata"))?
        .parse::<f64>()
        .map(round_money)
        .map_err(|e| format!("Invalid {key} in session metadata: {e}"))
}

/// Rebuild the order draft carried in the session metadata.
fn draft_from_session(session: &CompletedSession) -> Result<OrderDraft, String> {
    let md = &session.metadata;
    let cart_json = gateway::take_chunked(md, "cart").ok_or("Missing cart in session metadata")?;
    let customer_json =
        gateway::take_chunked(md, "customer").ok_or("Missing customer in session metadata")?;

    let lines: Vec<CartLine> =
        serde_json::from_str(&cart_json).map_err(|e| format!("Invalid cart metadata: {e}"))?;
    let customer: CustomerInfo = serde_json::from_str(&customer_json)
        .map_err(|e| format!("Invalid customer metadata: {e}"))?;
    if lines.is_empty() {
        return Err("Session metadata carries an empty cart".to_string());
    }

    let quote = Quote {
        subtotal: metadata_amount(md, "subtotal")?,
        discount_amount: metadata_amount(md, "discount_amount")?,
        final_total: metadata_amount(md, "total")?,
    };

    Ok(OrderDraft {
        customer,
        lines,
        payment_method: PaymentMethod::Online,
        payment_status: PaymentStatus::Paid,
        quote,
        discount_code: md.get("coupon_code").filter(|c| !c.is_empty()).cloned(),
        stripe_session_id: Some(session.id.clone()),
        payment_intent_id: session.payment_intent.clone(),
    })
}

async fn fulfil_order(
    state: &AppState,
    event_id: &str,
    session: &CompletedSession,
) -> Result<WebhookOutcome, String> {
    let draft = draft_from_session(session)?;
    let threshold = state.config.low_stock_threshold;

    let placed: Option<PlacedOrder> = {
        let conn = state.db.lock().map_err(to_webhook_error)?;
        db::immediate(&conn, |conn| {
            if !claim_event(conn, event_id)? {
                return Ok(None);
            }
            let existing: i64 = conn.query_row(
                "SELECT COUNT(*) FROM orders WHERE stripe_session_id = ?1",
                params![session.id],
                |row| row.get(0),
            )?;
            if existing > 0 {
                return Ok(None);
            }
            placement::place_order(conn, &draft, Placement::Confirmed, threshold).map(Some)
        })
        .map_err(to_webhook_error)?
    };

    let Some(placed) = placed else {
        info!(event_id, session_id = %session.id, "webhook already processed");
        return Ok(WebhookOutcome::Duplicate);
    };

    for item in &placed.low_stock {
        warn!(
            product_id = item.product_id,
            location = %item.location,
            inventory = item.inventory,
            "low stock after order"
        );
    }
    info!(
        event_id,
        order_id = placed.order.id,
        session_id = %session.id,
        "order created from checkout session"
    );
    placement::announce(&state.notifier, &placed).await;
    Ok(WebhookOutcome::OrderPlaced(placed.order.id))
}

async fn fulfil_booking(
    state: &AppState,
    event_id: &str,
    session: &CompletedSession,
) -> Result<WebhookOutcome, String> {
    let booking_id: i64 = session
        .metadata
        .get("booking_id")
        .ok_or("Missing booking_id in session metadata")?
        .parse()
        .map_err(|e| format!("Invalid booking_id in session metadata: {e}"))?;

    let outcome = {
        let conn = state.db.lock().map_err(to_webhook_error)?;
        db::immediate(&conn, |conn| {
            if !claim_event(conn, event_id)? {
                return Ok(BookingOutcome::AlreadyProcessed);
            }
            events::confirm_booking(conn, booking_id, Some(&session.id))
        })
        .map_err(to_webhook_error)?
    };

    if matches!(outcome, BookingOutcome::AlreadyProcessed) {
        info!(event_id, booking_id, "booking webhook already processed");
        return Ok(WebhookOutcome::Duplicate);
    }
    events::announce(&state.notifier, &outcome).await;
    Ok(WebhookOutcome::BookingConfirmed(booking_id))
}
