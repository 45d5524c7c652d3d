//! Turning a priced cart into an order row.
//!
//! [`place_order`] runs inside the caller's transaction: insert the order
//! and its lines, redeem the discount, take stock and collect low-stock
//! products. Notifications go out afterwards through [`announce`].

use chrono::Utc;
use rusqlite::{params, Connection};
use serde::Deserialize;
use tracing::{info, warn};

use super::{get_order, order_items};
use crate::auth::Claims;
use crate::checkout::{price_cart, validate_customer};
use crate::db::{self, DbState};
use crate::discounts::{self, Quote};
use crate::error::{AppError, AppResult};
use crate::inventory::{self, LowStockItem};
use crate::models::{
    CartLine, CustomerInfo, Order, OrderItem, OrderStatus, PaymentMethod, PaymentStatus,
};
use crate::notify::{templates, Notifier};

/// How strictly to treat stock and discount conflicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Payment was already taken: record the order whatever happens,
    /// draining stock and keeping the paid discount.
    Confirmed,
    /// No money has moved: any shortage or spent code aborts the order.
    Immediate,
}

#[derive(Debug, Clone)]
pub struct OrderDraft {
    pub customer: CustomerInfo,
    pub lines: Vec<CartLine>,
    pub payment_method: PaymentMethod,
    pub payment_status: PaymentStatus,
    pub quote: Quote,
    pub discount_code: Option<String>,
    pub stripe_session_id: Option<String>,
    pub payment_intent_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PlacedOrder {
    pub order: Order,
    pub items: Vec<OrderItem>,
    pub low_stock: Vec<LowStockItem>,
}

fn redeem_discount(conn: &Connection, code: &str, mode: Placement) -> AppResult<()> {
    match discounts::resolve(conn, code, Utc::now()) {
        Ok(discount) => {
            if !discount.redeem(conn)? {
                if mode == Placement::Immediate {
                    return Err(AppError::conflict("Coupon has already been used"));
                }
                warn!(code, "discount was claimed by another order after payment");
            }
            Ok(())
        }
        Err(e) if mode == Placement::Immediate => Err(e),
        Err(e) => {
            warn!(code, error = %e, "paid order carries a discount that is no longer redeemable");
            Ok(())
        }
    }
}

/// Lines whose product still exists. A paid order keeps going without
/// products deleted since checkout; an unpaid one fails on them.
fn present_lines<'a>(
    conn: &Connection,
    order_id: i64,
    lines: &'a [CartLine],
    mode: Placement,
) -> AppResult<Vec<&'a CartLine>> {
    if mode == Placement::Immediate {
        return Ok(lines.iter().collect());
    }
    let mut exists = conn.prepare("SELECT 1 FROM products WHERE id = ?1")?;
    let mut kept = Vec::with_capacity(lines.len());
    for line in lines {
        if exists.exists(params![line.id])? {
            kept.push(line);
        } else {
            warn!(
                order_id,
                product_id = line.id,
                quantity = line.quantity,
                "paid line references a deleted product"
            );
        }
    }
    Ok(kept)
}

/// Insert the order described by `draft`. Call inside a transaction.
pub fn place_order(
    conn: &Connection,
    draft: &OrderDraft,
    mode: Placement,
    low_stock_threshold: i64,
) -> AppResult<PlacedOrder> {
    let customer = &draft.customer;
    let location = customer.location;

    conn.execute(
        "INSERT INTO orders (
            customer_name, customer_email, customer_phone, address, postcode, location,
            payment_method, payment_status, subtotal, discount_amount, discount_code,
            total_amount, status, stripe_session_id, payment_intent_id, notes
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
        params![
            customer.name.trim(),
            customer.email.trim(),
            customer.phone,
            customer.delivery_address(),
            customer.postcode,
            location,
            draft.payment_method,
            draft.payment_status,
            draft.quote.subtotal,
            draft.quote.discount_amount,
            draft.discount_code,
            draft.quote.final_total,
            OrderStatus::Pending,
            draft.stripe_session_id,
            draft.payment_intent_id,
            customer.notes,
        ],
    )?;
    let order_id = conn.last_insert_rowid();

    let lines = present_lines(conn, order_id, &draft.lines, mode)?;
    {
        let mut insert = conn.prepare(
            "INSERT INTO order_items (order_id, product_id, quantity, price) VALUES (?1, ?2, ?3, ?4)",
        )?;
        for line in &lines {
            insert.execute(params![order_id, line.id, line.quantity, line.price])?;
        }
    }

    if let Some(code) = draft.discount_code.as_deref() {
        redeem_discount(conn, code, mode)?;
    }

    for line in &lines {
        match mode {
            Placement::Immediate => {
                if !inventory::decrement(conn, line.id, location, line.quantity)? {
                    let name = line.name.clone().unwrap_or_else(|| format!("product {}", line.id));
                    return Err(AppError::conflict(format!(
                        "Not enough {name} in stock at {location}"
                    )));
                }
            }
            Placement::Confirmed => {
                inventory::decrement_or_drain(conn, line.id, location, line.quantity)?;
            }
        }
    }

    let product_ids: Vec<i64> = lines.iter().map(|l| l.id).collect();
    let low_stock =
        inventory::low_stock_among(conn, &product_ids, location, low_stock_threshold)?;

    let order = get_order(conn, order_id)?;
    let items = order_items(conn, order_id)?;

    info!(
        order_id,
        location = %location,
        total = order.total_amount,
        payment = %order.payment_method,
        low_stock = low_stock.len(),
        "order placed"
    );

    Ok(PlacedOrder {
        order,
        items,
        low_stock,
    })
}

/// Best-effort notifications for a new order.
pub async fn announce(notifier: &Notifier, placed: &PlacedOrder) {
    notifier
        .admin_alert(&templates::new_order_alert(&placed.order, &placed.items))
        .await;
    if !placed.low_stock.is_empty() {
        notifier
            .admin_alert(&templates::low_stock_alert(&placed.low_stock))
            .await;
    }
    notifier
        .email(templates::order_confirmation(&placed.order, &placed.items))
        .await;
}

// ---------------------------------------------------------------------------
// Staff orders
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManualOrderPayload {
    pub cart: Vec<CartLine>,
    #[serde(alias = "customer")]
    pub customer_info: CustomerInfo,
    #[serde(default, alias = "coupon_code")]
    pub coupon_code: Option<String>,
    /// Cash taken at the counter.
    #[serde(default)]
    pub paid: bool,
}

/// Order taken by staff (phone or counter), paid in cash.
pub fn create_manual_order(
    db: &DbState,
    mut payload: ManualOrderPayload,
    actor: &Claims,
    low_stock_threshold: i64,
) -> AppResult<PlacedOrder> {
    validate_customer(&payload.customer_info)?;
    if let Some(bound) = actor.location {
        payload.customer_info.location = bound;
    }
    let coupon_code = payload
        .coupon_code
        .as_deref()
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string);

    let conn = db.lock()?;
    db::immediate(&conn, |conn| {
        let (lines, subtotal) = price_cart(conn, &payload.cart, payload.customer_info.location)?;
        let discount = coupon_code
            .as_deref()
            .map(|code| discounts::resolve(conn, code, Utc::now()))
            .transpose()?;
        let draft = OrderDraft {
            customer: payload.customer_info.clone(),
            lines,
            payment_method: PaymentMethod::Cash,
            payment_status: if payload.paid {
                PaymentStatus::Paid
            } else {
                PaymentStatus::Pending
            },
            quote: discounts::quote(subtotal, discount.as_ref()),
            discount_code: coupon_code.clone(),
            stripe_session_id: None,
            payment_intent_id: None,
        };
        place_order(conn, &draft, Placement::Immediate, low_stock_threshold)
    })
    .inspect(|placed| info!(order_id = placed.order.id, staff_id = actor.sub, "manual order created"))
}
