//! Post-delivery feedback and the thank-you coupon it earns.

use chrono::{DateTime, Months, SecondsFormat, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::db::{self, DbState};
use crate::discounts::{self, CouponType};
use crate::error::{AppError, AppResult};
use crate::models::OrderStatus;
use crate::notify::templates;
use crate::orders::{get_order, order_items};
use crate::state::AppState;

pub const THANKS_PREFIX: &str = "THANKS";
pub const THANKS_PERCENT: f64 = 10.0;
pub const THANKS_VALID_MONTHS: u32 = 6;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductRatingInput {
    #[serde(alias = "product_id")]
    pub product_id: i64,
    pub rating: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackRequest {
    #[serde(alias = "order_id")]
    pub order_id: i64,
    pub email: String,
    pub rating: i64,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default, alias = "product_ratings")]
    pub product_ratings: Vec<ProductRatingInput>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackReceipt {
    pub coupon_code: String,
    pub discount_percent: f64,
    pub expires_at: String,
}

fn check_rating(rating: i64) -> AppResult<()> {
    if !(1..=5).contains(&rating) {
        return Err(AppError::bad_request("Ratings must be between 1 and 5"));
    }
    Ok(())
}

fn coupon_expiry(now: DateTime<Utc>) -> String {
    now.checked_add_months(Months::new(THANKS_VALID_MONTHS))
        .unwrap_or(now)
        .to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Record feedback and issue the coupon. Call inside a transaction.
fn record(conn: &Connection, req: &FeedbackRequest, now: DateTime<Utc>) -> AppResult<FeedbackReceipt> {
    let order = get_order(conn, req.order_id)?;
    if order.status != OrderStatus::Delivered {
        return Err(AppError::bad_request(
            "Feedback can only be left once the order has been delivered",
        ));
    }
    if !order.customer_email.trim().eq_ignore_ascii_case(req.email.trim()) {
        return Err(AppError::forbidden("Email does not match this order"));
    }

    let claimed = conn.execute(
        "UPDATE orders SET feedback_submitted = 1, updated_at = datetime('now')
         WHERE id = ?1 AND feedback_submitted = 0",
        params![order.id],
    )?;
    if claimed == 0 {
        return Err(AppError::bad_request("Feedback already submitted for this order"));
    }

    conn.execute(
        "INSERT INTO feedback (order_id, customer_email, rating, comment) VALUES (?1, ?2, ?3, ?4)",
        params![
            order.id,
            order.customer_email,
            req.rating,
            req.comment.as_deref().map(str::trim).filter(|c| !c.is_empty())
        ],
    )?;

    let ordered: Vec<i64> = order_items(conn, order.id)?
        .into_iter()
        .map(|i| i.product_id)
        .collect();
    for review in &req.product_ratings {
        if !ordered.contains(&review.product_id) {
            return Err(AppError::bad_request(format!(
                "Product {} was not part of this order",
                review.product_id
            )));
        }
        conn.execute(
            "INSERT OR REPLACE INTO product_reviews (order_id, product_id, rating) VALUES (?1, ?2, ?3)",
            params![order.id, review.product_id, review.rating],
        )?;
    }

    let code = discounts::generate_code(THANKS_PREFIX);
    let expires_at = coupon_expiry(now);
    discounts::insert_coupon(
        conn,
        &code,
        CouponType::Percentage,
        THANKS_PERCENT,
        Some(&expires_at),
        Some(&order.customer_email),
        Some(order.id),
    )?;

    Ok(FeedbackReceipt {
        coupon_code: code,
        discount_percent: THANKS_PERCENT,
        expires_at,
    })
}

pub async fn submit_feedback(state: &AppState, req: FeedbackRequest) -> AppResult<FeedbackReceipt> {
    check_rating(req.rating)?;
    for review in &req.product_ratings {
        check_rating(review.rating)?;
    }

    let receipt = {
        let conn = state.db.lock()?;
        db::immediate(&conn, |conn| record(conn, &req, Utc::now()))?
    };
    info!(order_id = req.order_id, rating = req.rating, "feedback received, coupon issued");

    state
        .notifier
        .email(templates::feedback_coupon(
            req.email.trim(),
            &receipt.coupon_code,
            &receipt.expires_at,
        ))
        .await;
    Ok(receipt)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackStatus {
    pub order_id: i64,
    pub submitted: bool,
    pub eligible: bool,
}

pub fn check_feedback(db: &DbState, order_id: i64) -> AppResult<FeedbackStatus> {
    let conn = db.lock()?;
    let order = get_order(&conn, order_id)?;
    Ok(FeedbackStatus {
        order_id,
        submitted: order.feedback_submitted,
        eligible: order.status == OrderStatus::Delivered && !order.feedback_submitted,
    })
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackEntry {
    pub id: i64,
    pub order_id: i64,
    pub customer_name: Option<String>,
    pub customer_email: String,
    pub rating: i64,
    pub comment: Option<String>,
    pub created_at: String,
}

pub fn list_feedback(db: &DbState) -> AppResult<Vec<FeedbackEntry>> {
    let conn = db.lock()?;
    let mut stmt = conn.prepare(
        "SELECT f.id, f.order_id, o.customer_name, f.customer_email, f.rating, f.comment, f.created_at
         FROM feedback f
         LEFT JOIN orders o ON o.id = f.order_id
         ORDER BY f.created_at DESC, f.id DESC",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok(FeedbackEntry {
                id: row.get(0)?,
                order_id: row.get(1)?,
                customer_name: row.get(2)?,
                customer_email: row.get(3)?,
                rating: row.get(4)?,
                comment: row.get(5)?,
                created_at: row.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}
