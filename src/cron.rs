//! Daily job issuing monthly event discount codes to ticket holders.

use std::time::Duration;

use chrono::{DateTime, Datelike, Days, NaiveDate, SecondsFormat, TimeZone, Utc};
use rusqlite::params;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::db;
use crate::discounts;
use crate::error::AppResult;
use crate::notify::templates;
use crate::state::AppState;

pub const EVENT_CODE_PREFIX: &str = "EVENT";

/// Next `hour:00` UTC strictly after `now`.
pub fn next_run(now: DateTime<Utc>, hour: u32) -> DateTime<Utc> {
    let today = now
        .date_naive()
        .and_hms_opt(hour.min(23), 0, 0)
        .map(|t| Utc.from_utc_datetime(&t))
        .unwrap_or(now);
    if today > now {
        today
    } else {
        today.checked_add_days(Days::new(1)).unwrap_or(today)
    }
}

/// Last second of the month containing `now`, RFC 3339.
fn month_end(now: DateTime<Utc>) -> String {
    let (year, month) = if now.month() == 12 {
        (now.year() + 1, 1)
    } else {
        (now.year(), now.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|t| Utc.from_utc_datetime(&t) - chrono::Duration::seconds(1))
        .unwrap_or(now)
        .to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[derive(Debug, Clone)]
pub struct IssuedCode {
    pub booking_id: i64,
    pub email: String,
    pub code: String,
}

/// Give every paid booking on an active event its code for the month of
/// `now`. Bookings that already hold one are skipped.
pub async fn issue_monthly_codes(state: &AppState, now: DateTime<Utc>) -> AppResult<Vec<IssuedCode>> {
    let valid_month = now.format("%Y-%m").to_string();
    let expires_at = month_end(now);

    let issued = {
        let conn = state.db.lock()?;
        db::immediate(&conn, |conn| {
            let mut pending = conn.prepare(
                "SELECT b.id, b.event_id, b.customer_email
                 FROM event_bookings b
                 JOIN events e ON e.id = b.event_id
                 WHERE b.status = 'paid' AND e.is_active = 1
                   AND NOT EXISTS (
                       SELECT 1 FROM event_discount_codes c
                       WHERE c.booking_id = b.id AND c.valid_month = ?1)
                 ORDER BY b.id",
            )?;
            let bookings = pending
                .query_map(params![valid_month], |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?, row.get::<_, String>(2)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            let mut insert = conn.prepare(
                "INSERT OR IGNORE INTO event_discount_codes
                     (code, booking_id, event_id, customer_email, valid_month, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            let mut issued = Vec::with_capacity(bookings.len());
            for (booking_id, event_id, email) in bookings {
                let code = discounts::generate_code(EVENT_CODE_PREFIX);
                let inserted = insert.execute(params![
                    code,
                    booking_id,
                    event_id,
                    email,
                    valid_month,
                    expires_at
                ])?;
                if inserted == 1 {
                    issued.push(IssuedCode {
                        booking_id,
                        email,
                        code,
                    });
                }
            }
            Ok(issued)
        })?
    };

    info!(month = %valid_month, issued = issued.len(), "monthly event discount codes issued");
    for code in &issued {
        state
            .notifier
            .email(templates::event_discount(
                &code.email,
                &code.code,
                &valid_month,
                &expires_at,
            ))
            .await;
    }
    Ok(issued)
}

/// Run [`issue_monthly_codes`] once a day at the configured hour until
/// `shutdown` fires.
pub fn start_discount_job(state: AppState, shutdown: CancellationToken) -> JoinHandle<()> {
    let hour = state.config.discount_cron_hour;
    tokio::spawn(async move {
        info!(hour, "event discount job started");
        loop {
            let now = Utc::now();
            let wait = (next_run(now, hour) - now)
                .to_std()
                .unwrap_or(Duration::from_secs(60));
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("event discount job stopped");
                    break;
                }
                _ = tokio::time::sleep(wait) => {}
            }
            if let Err(e) = issue_monthly_codes(&state, Utc::now()).await {
                error!(error = %e, "event discount job failed");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestApp;

    fn at(raw: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(raw).unwrap().with_timezone(&Utc)
    }

    fn seed_bookings(app: &TestApp) {
        app.state
            .db
            .conn
            .lock()
            .unwrap()
            .execute_batch(
                "INSERT INTO events (id, title, starts_at, total_capacity) VALUES
                     (1, 'Gala', '2026-12-01T18:00:00Z', 100),
                     (2, 'Old fair', '2025-01-01T10:00:00Z', 100);
                 UPDATE events SET is_active = 0 WHERE id = 2;
                 INSERT INTO event_bookings (event_id, customer_name, customer_email, adult_qty, total_amount, status) VALUES
                     (1, 'Bo', 'bo@example.com', 2, 30, 'paid'),
                     (1, 'Cy', 'cy@example.com', 1, 15, 'pending'),
                     (2, 'Di', 'di@example.com', 1, 15, 'paid');",
            )
            .unwrap();
    }

    #[test]
    fn next_run_rolls_over_to_tomorrow() {
        assert_eq!(next_run(at("2026-10-19T08:30:00Z"), 9), at("2026-10-19T09:00:00Z"));
        assert_eq!(next_run(at("2026-10-19T09:00:00Z"), 9), at("2026-10-20T09:00:00Z"));
        assert_eq!(next_run(at("2026-12-31T23:00:00Z"), 9), at("2027-01-01T09:00:00Z"));
    }

    #[test]
    fn codes_expire_at_month_end() {
        assert_eq!(month_end(at("2026-02-10T09:00:00Z")), "2026-02-28T23:59:59Z");
        assert_eq!(month_end(at("2026-12-05T09:00:00Z")), "2026-12-31T23:59:59Z");
    }

    #[tokio::test]
    async fn one_code_per_paid_booking_per_month() {
        let app = TestApp::new();
        seed_bookings(&app);
        let october = at("2026-10-19T09:00:00Z");

        let issued = issue_monthly_codes(&app.state, october).await.unwrap();
        assert_eq!(issued.len(), 1);
        assert_eq!(issued[0].email, "bo@example.com");
        assert!(issued[0].code.starts_with("EVENT-"));
        assert_eq!(app.mailer.sent().len(), 1);

        let again = issue_monthly_codes(&app.state, at("2026-10-20T09:00:00Z")).await.unwrap();
        assert!(again.is_empty());

        let november = issue_monthly_codes(&app.state, at("2026-11-01T09:00:00Z")).await.unwrap();
        assert_eq!(november.len(), 1);
        assert_ne!(november[0].code, issued[0].code);
    }

    #[tokio::test]
    async fn issued_code_is_redeemable_until_month_end() {
        let app = TestApp::new();
        seed_bookings(&app);
        let issued = issue_monthly_codes(&app.state, Utc::now()).await.unwrap();
        let verification = discounts::verify(&app.state.db, &issued[0].code, 500.0).unwrap();
        assert_eq!(verification.kind, "event");
        assert_eq!(verification.quote.discount_amount, discounts::EVENT_DISCOUNT_CAP);
    }

    #[tokio::test]
    async fn job_stops_on_shutdown() {
        let app = TestApp::new();
        let token = CancellationToken::new();
        let handle = start_discount_job(app.state.clone(), token.clone());
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("job exits promptly")
            .unwrap();
    }
}
