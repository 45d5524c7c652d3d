//! Discount codes.
//!
//! Three tables hold codes a customer can type at checkout: regular
//! `coupons`, monthly `event_discount_codes` and `test_coupons`. They are
//! probed in that order and surfaced as one [`Discount`] value so pricing
//! and redemption never branch on table names elsewhere.

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::db::DbState;
use crate::error::{AppError, AppResult};
use crate::models::round_money;

/// Event discount: 10% of the subtotal ...
pub const EVENT_DISCOUNT_RATE: f64 = 0.10;
/// ... capped at this many pounds.
pub const EVENT_DISCOUNT_CAP: f64 = 40.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CouponType {
    Percentage,
    Fixed,
}

impl CouponType {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "percentage" => Some(CouponType::Percentage),
            "fixed" => Some(CouponType::Fixed),
            _ => None,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            CouponType::Percentage => "percentage",
            CouponType::Fixed => "fixed",
        }
    }
}

/// A resolved, currently redeemable discount code.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Discount {
    Coupon {
        id: i64,
        code: String,
        coupon_type: CouponType,
        value: f64,
    },
    EventDiscount {
        id: i64,
        code: String,
    },
    TestDiscount {
        id: i64,
        code: String,
    },
}

impl Discount {
    pub fn code(&self) -> &str {
        match self {
            Discount::Coupon { code, .. }
            | Discount::EventDiscount { code, .. }
            | Discount::TestDiscount { code, .. } => code,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Discount::Coupon { .. } => "coupon",
            Discount::EventDiscount { .. } => "event",
            Discount::TestDiscount { .. } => "test",
        }
    }

    /// Discount in pounds for `subtotal`. Never exceeds the subtotal.
    pub fn amount_for(&self, subtotal: f64) -> f64 {
        let subtotal = subtotal.max(0.0);
        let raw = match self {
            Discount::Coupon {
                coupon_type: CouponType::Percentage,
                value,
                ..
            } => subtotal * value / 100.0,
            Discount::Coupon {
                coupon_type: CouponType::Fixed,
                value,
                ..
            } => *value,
            Discount::EventDiscount { .. } => {
                (subtotal * EVENT_DISCOUNT_RATE).min(EVENT_DISCOUNT_CAP)
            }
            Discount::TestDiscount { .. } => subtotal,
        };
        round_money(raw.clamp(0.0, subtotal))
    }

    /// Mark the code used. Returns `false` when another order claimed it
    /// first.
    pub fn redeem(&self, conn: &Connection) -> AppResult<bool> {
        let (table, id) = match self {
            Discount::Coupon { id, .. } => ("coupons", *id),
            Discount::EventDiscount { id, .. } => ("event_discount_codes", *id),
            Discount::TestDiscount { id, .. } => ("test_coupons", *id),
        };
        let changed = conn.execute(
            &format!("UPDATE {table} SET used = 1 WHERE id = ?1 AND used = 0"),
            params![id],
        )?;
        if changed == 1 {
            info!(code = %self.code(), kind = self.kind(), "discount redeemed");
        }
        Ok(changed == 1)
    }
}

/// Subtotal, discount and amount due.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Quote {
    pub subtotal: f64,
    pub discount_amount: f64,
    pub final_total: f64,
}

pub fn quote(subtotal: f64, discount: Option<&Discount>) -> Quote {
    let subtotal = round_money(subtotal.max(0.0));
    let discount_amount = discount.map(|d| d.amount_for(subtotal)).unwrap_or(0.0);
    Quote {
        subtotal,
        discount_amount,
        final_total: round_money((subtotal - discount_amount).max(0.0)),
    }
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

enum Rejection {
    Used,
    Expired,
}

/// Parse a stored expiry. Accepts RFC 3339 or a bare date (valid through
/// the end of that day).
fn parse_expiry(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(23, 59, 59))
        .map(|dt| dt.and_utc())
}

fn check(used: bool, expires_at: Option<&str>, now: DateTime<Utc>) -> Result<(), Rejection> {
    if used {
        return Err(Rejection::Used);
    }
    if let Some(expiry) = expires_at.and_then(parse_expiry) {
        if expiry < now {
            return Err(Rejection::Expired);
        }
    }
    Ok(())
}

/// Resolve `code` against the three discount tables in priority order,
/// returning the first that is unused and unexpired.
pub fn resolve(conn: &Connection, code: &str, now: DateTime<Utc>) -> AppResult<Discount> {
    let code = code.trim();
    if code.is_empty() {
        return Err(AppError::bad_request("Coupon code is required"));
    }

    let mut rejection: Option<Rejection> = None;

    let coupon: Option<(i64, String, String, f64, bool, Option<String>)> = conn
        .query_row(
            "SELECT id, code, discount_type, discount_value, used, expires_at
             FROM coupons WHERE code = ?1",
            params![code],
            |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get::<_, i64>(4)? != 0,
                    row.get(5)?,
                ))
            },
        )
        .optional()?;
    if let Some((id, code, kind, value, used, expires_at)) = coupon {
        match check(used, expires_at.as_deref(), now) {
            Ok(()) => {
                let coupon_type = CouponType::parse(&kind)
                    .ok_or_else(|| AppError::internal(format!("bad coupon type {kind}")))?;
                return Ok(Discount::Coupon {
                    id,
                    code,
                    coupon_type,
                    value,
                });
            }
            Err(r) => rejection = Some(r),
        }
    }

    let event_code: Option<(i64, String, bool, String)> = conn
        .query_row(
            "SELECT id, code, used, expires_at FROM event_discount_codes WHERE code = ?1",
            params![code],
            |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get::<_, i64>(2)? != 0,
                    row.get(3)?,
                ))
            },
        )
        .optional()?;
    if let Some((id, code, used, expires_at)) = event_code {
        match check(used, Some(&expires_at), now) {
            Ok(()) => return Ok(Discount::EventDiscount { id, code }),
            Err(r) => rejection = rejection.or(Some(r)),
        }
    }

    let test_code: Option<(i64, String, bool)> = conn
        .query_row(
            "SELECT id, code, used FROM test_coupons WHERE code = ?1",
            params![code],
            |row| Ok((row.get(0)?, row.get(1)?, row.get::<_, i64>(2)? != 0)),
        )
        .optional()?;
    if let Some((id, code, used)) = test_code {
        match check(used, None, now) {
            Ok(()) => return Ok(Discount::TestDiscount { id, code }),
            Err(r) => rejection = rejection.or(Some(r)),
        }
    }

    Err(match rejection {
        Some(Rejection::Used) => AppError::bad_request("Coupon has already been used"),
        Some(Rejection::Expired) => AppError::bad_request("Coupon has expired"),
        None => AppError::bad_request("Invalid coupon code"),
    })
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Verification {
    pub valid: bool,
    pub code: String,
    pub kind: &'static str,
    #[serde(flatten)]
    pub quote: Quote,
}

/// Check a code against a subtotal without redeeming it.
pub fn verify(db: &DbState, code: &str, subtotal: f64) -> AppResult<Verification> {
    if !subtotal.is_finite() || subtotal < 0.0 {
        return Err(AppError::bad_request("Subtotal must be a non-negative number"));
    }
    let conn = db.lock()?;
    let discount = resolve(&conn, code, Utc::now())?;
    Ok(Verification {
        valid: true,
        code: discount.code().to_string(),
        kind: discount.kind(),
        quote: quote(subtotal, Some(&discount)),
    })
}

// ---------------------------------------------------------------------------
// Code generation
// ---------------------------------------------------------------------------

/// `PREFIX-XXXXXXXX` with eight random upper-case hex characters.
pub fn generate_code(prefix: &str) -> String {
    let random = Uuid::new_v4().simple().to_string();
    format!("{prefix}-{}", random[..8].to_ascii_uppercase())
}

// ---------------------------------------------------------------------------
// Coupon administration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Coupon {
    pub id: i64,
    pub code: String,
    pub discount_type: CouponType,
    pub discount_value: f64,
    pub used: bool,
    pub expires_at: Option<String>,
    pub customer_email: Option<String>,
    pub source_order_id: Option<i64>,
    pub created_at: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewCoupon {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(alias = "discount_type")]
    pub discount_type: CouponType,
    #[serde(alias = "discount_value")]
    pub discount_value: f64,
    #[serde(default, alias = "expires_at")]
    pub expires_at: Option<String>,
    #[serde(default, alias = "customer_email")]
    pub customer_email: Option<String>,
}

pub fn list_coupons(db: &DbState) -> AppResult<Vec<Coupon>> {
    let conn = db.lock()?;
    let mut stmt = conn.prepare(
        "SELECT id, code, discount_type, discount_value, used, expires_at, customer_email,
                source_order_id, created_at
         FROM coupons ORDER BY created_at DESC, id DESC",
    )?;
    let rows = stmt.query_map([], |row| {
        let kind: String = row.get(2)?;
        Ok(Coupon {
            id: row.get(0)?,
            code: row.get(1)?,
            discount_type: CouponType::parse(&kind).unwrap_or(CouponType::Percentage),
            discount_value: row.get(3)?,
            used: row.get::<_, i64>(4)? != 0,
            expires_at: row.get(5)?,
            customer_email: row.get(6)?,
            source_order_id: row.get(7)?,
            created_at: row.get(8)?,
        })
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// Insert a coupon row inside an existing transaction. Returns the id.
pub(crate) fn insert_coupon(
    conn: &Connection,
    code: &str,
    coupon_type: CouponType,
    value: f64,
    expires_at: Option<&str>,
    customer_email: Option<&str>,
    source_order_id: Option<i64>,
) -> AppResult<i64> {
    conn.execute(
        "INSERT INTO coupons (code, discount_type, discount_value, expires_at,
                              customer_email, source_order_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            code,
            coupon_type.as_str(),
            value,
            expires_at,
            customer_email,
            source_order_id
        ],
    )
    .map_err(|e| match e {
        rusqlite::Error::SqliteFailure(ref f, _)
            if f.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            AppError::conflict(format!("Coupon code {code} already exists"))
        }
        other => AppError::from(other),
    })?;
    Ok(conn.last_insert_rowid())
}

pub fn create_coupon(db: &DbState, input: NewCoupon) -> AppResult<Coupon> {
    if !input.discount_value.is_finite() || input.discount_value <= 0.0 {
        return Err(AppError::bad_request("Discount value must be positive"));
    }
    if input.discount_type == CouponType::Percentage && input.discount_value > 100.0 {
        return Err(AppError::bad_request("Percentage discount cannot exceed 100"));
    }
    let expires_at = match input.expires_at.as_deref().map(str::trim) {
        Some("") | None => None,
        Some(raw) => {
            parse_expiry(raw)
                .ok_or_else(|| AppError::bad_request(format!("Invalid expiry date: {raw}")))?;
            Some(raw.to_string())
        }
    };
    let code = match input.code.as_deref().map(str::trim) {
        Some("") | None => generate_code("PROMO"),
        Some(code) => code.to_ascii_uppercase(),
    };

    let id = {
        let conn = db.lock()?;
        insert_coupon(
            &conn,
            &code,
            input.discount_type,
            input.discount_value,
            expires_at.as_deref(),
            input.customer_email.as_deref(),
            None,
        )?
    };
    info!(coupon_id = id, code = %code, "coupon created");

    list_coupons(db)?
        .into_iter()
        .find(|c| c.id == id)
        .ok_or_else(|| AppError::internal("created coupon vanished"))
}

pub fn delete_coupon(db: &DbState, id: i64) -> AppResult<()> {
    let conn = db.lock()?;
    let changed = conn.execute("DELETE FROM coupons WHERE id = ?1", params![id])?;
    if changed == 0 {
        return Err(AppError::not_found(format!("Coupon {id} not found")));
    }
    info!(coupon_id = id, "coupon deleted");
    Ok(())
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCoupon {
    pub id: i64,
    pub code: String,
}

/// Create a single-use code that zeroes the order total.
pub fn create_test_coupon(db: &DbState, code: Option<&str>) -> AppResult<TestCoupon> {
    let code = match code.map(str::trim) {
        Some("") | None => generate_code("TEST"),
        Some(code) => code.to_ascii_uppercase(),
    };
    let conn = db.lock()?;
    conn.execute(
        "INSERT INTO test_coupons (code) VALUES (?1)",
        params![code],
    )
    .map_err(|e| match e {
        rusqlite::Error::SqliteFailure(ref f, _)
            if f.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            AppError::conflict(format!("Test coupon {code} already exists"))
        }
        other => AppError::from(other),
    })?;
    let id = conn.last_insert_rowid();
    info!(test_coupon_id = id, code = %code, "test coupon created");
    Ok(TestCoupon { id, code })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn test_db() -> DbState {
        DbState::in_memory().expect("in-memory db")
    }

    fn seed_event_code(conn: &Connection, code: &str, expires_at: &str) {
        conn.execute_batch(
            "INSERT OR IGNORE INTO events (id, title, starts_at, total_capacity)
                 VALUES (1, 'Gala', '2026-06-01T18:00:00Z', 100);
             INSERT OR IGNORE INTO event_bookings (id, event_id, customer_name, customer_email, total_amount, status)
                 VALUES (1, 1, 'Bo', 'bo@example.com', 20.0, 'paid');",
        )
        .unwrap();
        conn.execute(
            "INSERT INTO event_discount_codes (code, booking_id, event_id, customer_email, valid_month, expires_at)
             VALUES (?1, 1, 1, 'bo@example.com', '2026-06', ?2)",
            params![code, expires_at],
        )
        .unwrap();
    }

    #[test]
    fn final_total_never_negative() {
        let fixed = Discount::Coupon {
            id: 1,
            code: "BIG".into(),
            coupon_type: CouponType::Fixed,
            value: 50.0,
        };
        let q = quote(20.0, Some(&fixed));
        assert_eq!(q.discount_amount, 20.0);
        assert_eq!(q.final_total, 0.0);

        let pct = Discount::Coupon {
            id: 2,
            code: "TEN".into(),
            coupon_type: CouponType::Percentage,
            value: 10.0,
        };
        let q = quote(25.0, Some(&pct));
        assert_eq!(q.discount_amount, 2.5);
        assert_eq!(q.final_total, 22.5);

        assert_eq!(quote(12.0, None).final_total, 12.0);
    }

    #[test]
    fn event_discount_caps_at_forty_pounds() {
        let event = Discount::EventDiscount {
            id: 1,
            code: "EVT".into(),
        };
        assert_eq!(event.amount_for(1000.0), 40.0);
        assert_eq!(event.amount_for(100.0), 10.0);
        assert_eq!(quote(1000.0, Some(&event)).final_total, 960.0);
    }

    #[test]
    fn test_discount_zeroes_total() {
        let test = Discount::TestDiscount {
            id: 1,
            code: "TEST-1".into(),
        };
        let q = quote(37.5, Some(&test));
        assert_eq!(q.discount_amount, 37.5);
        assert_eq!(q.final_total, 0.0);
    }

    #[test]
    fn resolve_probes_tables_in_order() {
        let db = test_db();
        let conn = db.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO test_coupons (code) VALUES ('SHARED')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO coupons (code, discount_type, discount_value) VALUES ('SHARED', 'fixed', 5)",
            [],
        )
        .unwrap();

        let d = resolve(&conn, "shared", Utc::now()).unwrap();
        assert_eq!(d.kind(), "coupon");

        conn.execute("UPDATE coupons SET used = 1", []).unwrap();
        let d = resolve(&conn, "SHARED", Utc::now()).unwrap();
        assert_eq!(d.kind(), "test");
    }

    #[test]
    fn resolve_reports_reason() {
        let db = test_db();
        let conn = db.conn.lock().unwrap();
        let yesterday = (Utc::now() - Duration::days(1)).to_rfc3339();
        seed_event_code(&conn, "OLD", &yesterday);
        conn.execute(
            "INSERT INTO coupons (code, discount_type, discount_value, used) VALUES ('SPENT', 'percentage', 10, 1)",
            [],
        )
        .unwrap();

        let err = resolve(&conn, "OLD", Utc::now()).unwrap_err();
        assert_eq!(err.to_string(), "Coupon has expired");
        let err = resolve(&conn, "SPENT", Utc::now()).unwrap_err();
        assert_eq!(err.to_string(), "Coupon has already been used");
        let err = resolve(&conn, "NOPE", Utc::now()).unwrap_err();
        assert_eq!(err.to_string(), "Invalid coupon code");
    }

    #[test]
    fn bare_date_expiry_lasts_through_the_day() {
        let expiry = parse_expiry("2026-03-01").unwrap();
        assert_eq!(expiry.to_rfc3339(), "2026-03-01T23:59:59+00:00");
    }

    #[test]
    fn used_coupon_rejected_on_second_verify() {
        let db = test_db();
        {
            let conn = db.conn.lock().unwrap();
            let next_month = (Utc::now() + Duration::days(30)).to_rfc3339();
            seed_event_code(&conn, "EVENT-ABC", &next_month);
        }

        let first = verify(&db, "EVENT-ABC", 1000.0).unwrap();
        assert_eq!(first.kind, "event");
        assert_eq!(first.quote.discount_amount, 40.0);

        {
            let conn = db.conn.lock().unwrap();
            let d = resolve(&conn, "EVENT-ABC", Utc::now()).unwrap();
            assert!(d.redeem(&conn).unwrap());
            assert!(!d.redeem(&conn).unwrap(), "second claim must fail");
        }

        let err = verify(&db, "EVENT-ABC", 1000.0).unwrap_err();
        assert_eq!(err.to_string(), "Coupon has already been used");
    }

    #[test]
    fn coupon_admin_crud() {
        let db = test_db();
        let created = create_coupon(
            &db,
            NewCoupon {
                code: Some("summer".into()),
                discount_type: CouponType::Percentage,
                discount_value: 15.0,
                expires_at: Some("2099-01-01".into()),
                customer_email: None,
            },
        )
        .unwrap();
        assert_eq!(created.code, "SUMMER");

        let dup = create_coupon(
            &db,
            NewCoupon {
                code: Some("SUMMER".into()),
                discount_type: CouponType::Fixed,
                discount_value: 1.0,
                expires_at: None,
                customer_email: None,
            },
        );
        assert!(matches!(dup, Err(AppError::Conflict(_))));

        let too_much = create_coupon(
            &db,
            NewCoupon {
                code: None,
                discount_type: CouponType::Percentage,
                discount_value: 120.0,
                expires_at: None,
                customer_email: None,
            },
        );
        assert!(matches!(too_much, Err(AppError::BadRequest(_))));

        assert_eq!(list_coupons(&db).unwrap().len(), 1);
        delete_coupon(&db, created.id).unwrap();
        assert!(matches!(
            delete_coupon(&db, created.id),
            Err(AppError::NotFound(_))
        ));
    }

    #[test]
    fn generated_test_coupon_is_redeemable() {
        let db = test_db();
        let coupon = create_test_coupon(&db, None).unwrap();
        assert!(coupon.code.starts_with("TEST-"));
        assert_eq!(coupon.code.len(), "TEST-".len() + 8);
        let v = verify(&db, &coupon.code, 18.0).unwrap();
        assert_eq!(v.quote.final_total, 0.0);
    }
}
