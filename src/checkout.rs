//! Storefront checkout.
//!
//! The cart is re-priced from the catalogue, a discount code is resolved,
//! and a hosted payment session is created. Nothing is written to `orders`
//! here: the cart and customer travel in the session metadata and the
//! order is created when the provider confirms payment. Carts that cost
//! nothing skip the provider and are placed immediately.

use std::collections::HashMap;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::db;
use crate::discounts::{self, Quote};
use crate::error::{AppError, AppResult};
use crate::gateway::{self, CheckoutRequest, LineItem};
use crate::models::{to_pence, CartLine, CustomerInfo, Location, PaymentMethod, PaymentStatus};
use crate::orders::placement::{self, OrderDraft, Placement};
use crate::state::AppState;

/// Metadata `type` for storefront orders.
pub const ORDER_METADATA_TYPE: &str = "order";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutPayload {
    pub cart: Vec<CartLine>,
    #[serde(alias = "customer")]
    pub customer_info: CustomerInfo,
    #[serde(default, alias = "coupon_code")]
    pub coupon_code: Option<String>,
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutResponse {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<i64>,
    #[serde(flatten)]
    pub quote: Quote,
}

// ---------------------------------------------------------------------------
// Validation & pricing
// ---------------------------------------------------------------------------

pub fn validate_customer(customer: &CustomerInfo) -> AppResult<()> {
    if customer.name.trim().is_empty() {
        return Err(AppError::bad_request("Customer name is required"));
    }
    let email = customer.email.trim();
    if email.is_empty() || !email.contains('@') {
        return Err(AppError::bad_request("A valid customer email is required"));
    }
    Ok(())
}

/// Re-price `cart` from the catalogue. Returns lines carrying catalogue
/// prices (zero for free promotional lines) and the subtotal.
pub fn price_cart(
    conn: &Connection,
    cart: &[CartLine],
    location: Location,
) -> AppResult<(Vec<CartLine>, f64)> {
    if cart.is_empty() {
        return Err(AppError::bad_request("Cart is empty"));
    }

    let col = location.inventory_column();
    let mut stmt = conn.prepare(&format!(
        "SELECT name, price, is_active, max_per_order, {col} FROM products WHERE id = ?1"
    ))?;

    let free: Vec<&CartLine> = cart.iter().filter(|l| l.is_free).collect();
    if free.len() > 1 {
        return Err(AppError::bad_request("Only one free item per order"));
    }
    if free.iter().any(|l| l.quantity != 1) {
        return Err(AppError::bad_request("A free item must have quantity 1"));
    }
    if !free.is_empty() && free.len() == cart.len() {
        return Err(AppError::bad_request("A free item needs at least one paid item"));
    }

    let mut wanted: HashMap<i64, i64> = HashMap::new();
    let mut lines = Vec::with_capacity(cart.len());
    let mut subtotal = 0.0;

    for line in cart {
        if line.quantity <= 0 {
            return Err(AppError::bad_request(format!(
                "Quantity for product {} must be at least 1",
                line.id
            )));
        }
        let product: Option<(String, f64, bool, Option<i64>, i64)> = stmt
            .query_row(params![line.id], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get::<_, i64>(2)? != 0,
                    row.get(3)?,
                    row.get(4)?,
                ))
            })
            .optional()?;
        let Some((name, price, active, max_per_order, stock)) = product else {
            return Err(AppError::bad_request(format!(
                "Product {} does not exist",
                line.id
            )));
        };
        if !active {
            return Err(AppError::bad_request(format!("{name} is no longer available")));
        }

        let total_qty = wanted.entry(line.id).or_insert(0);
        *total_qty += line.quantity;
        if let Some(max) = max_per_order {
            if *total_qty > max {
                return Err(AppError::bad_request(format!(
                    "You can order at most {max} of {name}"
                )));
            }
        }
        if *total_qty > stock {
            return Err(AppError::bad_request(format!(
                "Only {stock} of {name} left at our {location} shop"
            )));
        }

        let unit = if line.is_free { 0.0 } else { price };
        subtotal += unit * line.quantity as f64;
        lines.push(CartLine {
            id: line.id,
            name: Some(name),
            price: unit,
            quantity: line.quantity,
            is_free: line.is_free,
        });
    }

    if subtotal <= 0.0 {
        return Err(AppError::bad_request("Order total must be greater than zero"));
    }
    Ok((lines, subtotal))
}

// ---------------------------------------------------------------------------
// Metadata
// ---------------------------------------------------------------------------

/// Session metadata for a storefront order.
pub fn order_metadata(
    customer: &CustomerInfo,
    lines: &[CartLine],
    quote: &Quote,
    coupon_code: Option<&str>,
) -> AppResult<HashMap<String, String>> {
    let compact: Vec<CartLine> = lines
        .iter()
        .map(|l| CartLine {
            name: None,
            ..l.clone()
        })
        .collect();
    let cart_json = serde_json::to_string(&compact)
        .map_err(|e| AppError::internal(format!("serialize cart: {e}")))?;
    let customer_json = serde_json::to_string(customer)
        .map_err(|e| AppError::internal(format!("serialize customer: {e}")))?;

    let mut md = HashMap::new();
    md.insert("type".to_string(), ORDER_METADATA_TYPE.to_string());
    gateway::put_chunked(&mut md, "cart", &cart_json);
    gateway::put_chunked(&mut md, "customer", &customer_json);
    md.insert("subtotal".to_string(), format!("{:.2}", quote.subtotal));
    md.insert(
        "discount_amount".to_string(),
        format!("{:.2}", quote.discount_amount),
    );
    md.insert("total".to_string(), format!("{:.2}", quote.final_total));
    if let Some(code) = coupon_code {
        md.insert("coupon_code".to_string(), code.to_string());
    }
    Ok(md)
}

/// Provider line items. With a discount the order is charged as a single
/// line for the discounted total.
fn line_items(lines: &[CartLine], quote: &Quote, coupon_code: Option<&str>) -> Vec<LineItem> {
    if quote.discount_amount > 0.0 {
        return vec![LineItem {
            name: format!("Food order (code {})", coupon_code.unwrap_or("applied")),
            unit_amount: to_pence(quote.final_total),
            quantity: 1,
        }];
    }
    lines
        .iter()
        .filter(|l| !l.is_free)
        .map(|l| LineItem {
            name: l.name.clone().unwrap_or_else(|| format!("Product {}", l.id)),
            unit_amount: to_pence(l.price),
            quantity: l.quantity as u64,
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Session creation
// ---------------------------------------------------------------------------

pub async fn create_checkout_session(
    state: &AppState,
    payload: CheckoutPayload,
) -> AppResult<CheckoutResponse> {
    validate_customer(&payload.customer_info)?;
    let coupon_code = payload
        .coupon_code
        .as_deref()
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string);

    let (lines, quote) = {
        let conn = state.db.lock()?;
        let (lines, subtotal) = price_cart(&conn, &payload.cart, payload.customer_info.location)?;
        let discount = coupon_code
            .as_deref()
            .map(|code| discounts::resolve(&conn, code, Utc::now()))
            .transpose()?;
        (lines, discounts::quote(subtotal, discount.as_ref()))
    };

    let frontend = &state.config.frontend_url;

    // Only a discount may bring a priced cart down to nothing.
    if quote.final_total <= 0.0 && quote.discount_amount > 0.0 {
        let draft = OrderDraft {
            customer: payload.customer_info,
            lines,
            payment_method: PaymentMethod::Online,
            payment_status: PaymentStatus::Paid,
            quote,
            discount_code: coupon_code,
            stripe_session_id: None,
            payment_intent_id: None,
        };
        let placed = {
            let conn = state.db.lock()?;
            db::immediate(&conn, |conn| {
                placement::place_order(
                    conn,
                    &draft,
                    Placement::Immediate,
                    state.config.low_stock_threshold,
                )
            })?
        };
        info!(order_id = placed.order.id, "zero-total order placed without payment");
        let order_id = placed.order.id;
        placement::announce(&state.notifier, &placed).await;
        return Ok(CheckoutResponse {
            url: format!("{frontend}/order-success?order_id={order_id}"),
            session_id: None,
            order_id: Some(order_id),
            quote,
        });
    }

    let request = CheckoutRequest {
        line_items: line_items(&lines, &quote, coupon_code.as_deref()),
        customer_email: payload.customer_info.email.trim().to_string(),
        success_url: format!("{frontend}/order-success?session_id={{CHECKOUT_SESSION_ID}}"),
        cancel_url: format!("{frontend}/checkout"),
        metadata: order_metadata(
            &payload.customer_info,
            &lines,
            &quote,
            coupon_code.as_deref(),
        )?,
    };

    let session = state.payments.create_checkout(request).await?;
    info!(
        session_id = %session.id,
        total = quote.final_total,
        location = %payload.customer_info.location,
        "checkout session created"
    );

    Ok(CheckoutResponse {
        url: session.url,
        session_id: Some(session.id),
        order_id: None,
        quote,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{customer, seed_products, TestApp};

    fn line(id: i64, price: f64, quantity: i64) -> CartLine {
        CartLine {
            id,
            name: None,
            price,
            quantity,
            is_free: false,
        }
    }

    #[tokio::test]
    async fn two_ten_pound_items_request_2000_pence() {
        let app = TestApp::new();
        seed_products(&app.state.db);

        let resp = create_checkout_session(
            &app.state,
            CheckoutPayload {
                cart: vec![line(1, 10.0, 2)],
                customer_info: customer("ann@example.com"),
                coupon_code: None,
            },
        )
        .await
        .unwrap();

        assert!(resp.url.starts_with("https://checkout.test/"));
        let sessions = app.gateway.sessions();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].amount_total(), 2000);
        assert_eq!(sessions[0].metadata.get("type").unwrap(), "order");

        let orders: i64 = app
            .state
            .db
            .conn
            .lock()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM orders", [], |r| r.get(0))
            .unwrap();
        assert_eq!(orders, 0, "order is only created by the webhook");
    }

    #[tokio::test]
    async fn client_prices_are_ignored() {
        let app = TestApp::new();
        seed_products(&app.state.db);
        create_checkout_session(
            &app.state,
            CheckoutPayload {
                cart: vec![line(1, 0.01, 1)],
                customer_info: customer("ann@example.com"),
                coupon_code: None,
            },
        )
        .await
        .unwrap();
        assert_eq!(app.gateway.sessions()[0].amount_total(), 1000);
    }

    #[tokio::test]
    async fn free_lines_are_excluded_from_subtotal() {
        let app = TestApp::new();
        seed_products(&app.state.db);
        let mut free = line(2, 4.0, 1);
        free.is_free = true;
        let resp = create_checkout_session(
            &app.state,
            CheckoutPayload {
                cart: vec![line(1, 10.0, 1), free],
                customer_info: customer("ann@example.com"),
                coupon_code: None,
            },
        )
        .await
        .unwrap();
        assert_eq!(resp.quote.subtotal, 10.0);
        assert_eq!(app.gateway.sessions()[0].amount_total(), 1000);
    }

    #[tokio::test]
    async fn percentage_coupon_charges_single_discounted_line() {
        let app = TestApp::new();
        seed_products(&app.state.db);
        app.state
            .db
            .conn
            .lock()
            .unwrap()
            .execute(
                "INSERT INTO coupons (code, discount_type, discount_value) VALUES ('TENOFF', 'percentage', 10)",
                [],
            )
            .unwrap();

        let resp = create_checkout_session(
            &app.state,
            CheckoutPayload {
                cart: vec![line(1, 10.0, 2)],
                customer_info: customer("ann@example.com"),
                coupon_code: Some(" TENOFF ".into()),
            },
        )
        .await
        .unwrap();
        assert_eq!(resp.quote.discount_amount, 2.0);
        let session = &app.gateway.sessions()[0];
        assert_eq!(session.line_items.len(), 1);
        assert_eq!(session.amount_total(), 1800);
        assert_eq!(session.metadata.get("coupon_code").unwrap(), "TENOFF");
    }

    #[tokio::test]
    async fn test_coupon_places_order_without_provider() {
        let app = TestApp::new();
        seed_products(&app.state.db);
        app.state
            .db
            .conn
            .lock()
            .unwrap()
            .execute("INSERT INTO test_coupons (code) VALUES ('FREEBIE')", [])
            .unwrap();

        let resp = create_checkout_session(
            &app.state,
            CheckoutPayload {
                cart: vec![line(1, 10.0, 2)],
                customer_info: customer("ann@example.com"),
                coupon_code: Some("FREEBIE".into()),
            },
        )
        .await
        .unwrap();

        assert_eq!(resp.quote.final_total, 0.0);
        let order_id = resp.order_id.expect("order placed");
        assert!(resp.url.ends_with(&format!("order_id={order_id}")));
        assert!(app.gateway.sessions().is_empty());

        let conn = app.state.db.conn.lock().unwrap();
        let (used, stock): (i64, i64) = conn
            .query_row(
                "SELECT (SELECT used FROM test_coupons WHERE code = 'FREEBIE'),
                        (SELECT inventory_leeds FROM products WHERE id = 1)",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert_eq!(used, 1);
        assert_eq!(stock, 18);
        drop(conn);

        let again = create_checkout_session(
            &app.state,
            CheckoutPayload {
                cart: vec![line(1, 10.0, 1)],
                customer_info: customer("ann@example.com"),
                coupon_code: Some("FREEBIE".into()),
            },
        )
        .await
        .unwrap_err();
        assert_eq!(again.to_string(), "Coupon has already been used");
    }

    #[tokio::test]
    async fn invalid_carts_are_rejected() {
        let app = TestApp::new();
        seed_products(&app.state.db);

        for (cart, expected) in [
            (vec![], "Cart is empty"),
            (vec![line(99, 1.0, 1)], "Product 99 does not exist"),
            (vec![line(1, 10.0, 0)], "Quantity for product 1 must be at least 1"),
            (vec![line(3, 1.0, 1)], "Retired pie is no longer available"),
            (vec![line(2, 4.0, 3), line(2, 4.0, 3)], "You can order at most 5 of Brownie"),
            (vec![line(1, 10.0, 21)], "Only 20 of Steak pie left at our leeds shop"),
        ] {
            let err = create_checkout_session(
                &app.state,
                CheckoutPayload {
                    cart,
                    customer_info: customer("ann@example.com"),
                    coupon_code: None,
                },
            )
            .await
            .unwrap_err();
            assert_eq!(err.to_string(), expected);
        }
    }

    #[tokio::test]
    async fn all_free_carts_are_rejected() {
        let app = TestApp::new();
        seed_products(&app.state.db);
        let free = |quantity| CartLine {
            is_free: true,
            ..line(1, 0.0, quantity)
        };

        for (cart, expected) in [
            (vec![free(5)], "A free item must have quantity 1"),
            (vec![free(1)], "A free item needs at least one paid item"),
            (vec![line(2, 4.0, 1), free(1), free(1)], "Only one free item per order"),
        ] {
            let err = create_checkout_session(
                &app.state,
                CheckoutPayload {
                    cart,
                    customer_info: customer("ann@example.com"),
                    coupon_code: None,
                },
            )
            .await
            .unwrap_err();
            assert_eq!(err.status(), axum::http::StatusCode::BAD_REQUEST);
            assert_eq!(err.to_string(), expected);
        }

        assert!(app.gateway.sessions().is_empty());
        let orders: i64 = app
            .state
            .db
            .conn
            .lock()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM orders", [], |r| r.get(0))
            .unwrap();
        assert_eq!(orders, 0);
    }

    #[tokio::test]
    async fn provider_errors_surface_as_500() {
        let app = TestApp::new();
        seed_products(&app.state.db);
        app.gateway.fail_next_checkout("Your card was declined");
        let err = create_checkout_session(
            &app.state,
            CheckoutPayload {
                cart: vec![line(1, 10.0, 1)],
                customer_info: customer("ann@example.com"),
                coupon_code: None,
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), axum::http::StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.public_message(), "Your card was declined");
    }

    #[test]
    fn metadata_chunks_large_carts() {
        let lines: Vec<CartLine> = (1..=40).map(|i| line(i, 1.5, 2)).collect();
        let md = order_metadata(
            &customer("ann@example.com"),
            &lines,
            &discounts::quote(120.0, None),
            None,
        )
        .unwrap();
        assert!(md.contains_key("cart_0"));
        assert!(md.contains_key("cart_1"));
        let rejoined = gateway::take_chunked(&md, "cart").unwrap();
        let parsed: Vec<CartLine> = serde_json::from_str(&rejoined).unwrap();
        assert_eq!(parsed, lines);
    }
}
