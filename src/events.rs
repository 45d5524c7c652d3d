//! Sponsored events and ticket bookings.
//!
//! A booking starts `pending` with a checkout session. When payment is
//! confirmed the sold counters are bumped with one conditional update that
//! re-checks capacity; a booking that loses the race for the last seats is
//! marked `overbooked` and the admin is alerted instead.

use std::collections::HashMap;

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::auth::Claims;
use crate::db::{self, DbState};
use crate::error::{AppError, AppResult};
use crate::gateway::{CheckoutRequest, LineItem};
use crate::models::{round_money, to_pence, BookingStatus, Role};
use crate::notify::{templates, Notifier};
use crate::state::AppState;

/// Metadata `type` marking a ticket purchase.
pub const BOOKING_METADATA_TYPE: &str = "event_booking";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: i64,
    pub title: String,
    pub description: Option<String>,
    pub venue: Option<String>,
    pub starts_at: String,
    pub adult_price: f64,
    pub child_price: f64,
    pub adult_capacity: Option<i64>,
    pub child_capacity: Option<i64>,
    pub adult_sold: i64,
    pub child_sold: i64,
    pub total_capacity: i64,
    pub total_sold: i64,
    pub is_active: bool,
    pub organiser_id: Option<i64>,
    pub created_at: String,
    pub updated_at: String,
}

impl Event {
    const COLUMNS: &'static str = "id, title, description, venue, starts_at, adult_price,
        child_price, adult_capacity, child_capacity, adult_sold, child_sold, total_capacity,
        total_sold, is_active, organiser_id, created_at, updated_at";

    fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            title: row.get(1)?,
            description: row.get(2)?,
            venue: row.get(3)?,
            starts_at: row.get(4)?,
            adult_price: row.get(5)?,
            child_price: row.get(6)?,
            adult_capacity: row.get(7)?,
            child_capacity: row.get(8)?,
            adult_sold: row.get(9)?,
            child_sold: row.get(10)?,
            total_capacity: row.get(11)?,
            total_sold: row.get(12)?,
            is_active: row.get::<_, i64>(13)? != 0,
            organiser_id: row.get(14)?,
            created_at: row.get(15)?,
            updated_at: row.get(16)?,
        })
    }

    /// Reject a request for more seats than remain.
    fn check_capacity(&self, adults: i64, children: i64) -> AppResult<()> {
        let requested = adults.saturating_add(children);
        if requested > self.total_capacity - self.total_sold {
            return Err(AppError::bad_request(format!(
                "Only {} tickets left for {}",
                (self.total_capacity - self.total_sold).max(0),
                self.title
            )));
        }
        if let Some(cap) = self.adult_capacity {
            if adults > cap - self.adult_sold {
                return Err(AppError::bad_request(format!(
                    "Only {} adult tickets left",
                    (cap - self.adult_sold).max(0)
                )));
            }
        }
        if let Some(cap) = self.child_capacity {
            if children > cap - self.child_sold {
                return Err(AppError::bad_request(format!(
                    "Only {} child tickets left",
                    (cap - self.child_sold).max(0)
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Booking {
    pub id: i64,
    pub event_id: i64,
    pub customer_name: String,
    pub customer_email: String,
    pub customer_phone: Option<String>,
    pub adult_qty: i64,
    pub child_qty: i64,
    pub total_amount: f64,
    pub status: BookingStatus,
    pub stripe_session_id: Option<String>,
    pub created_at: String,
}

impl Booking {
    const COLUMNS: &'static str = "id, event_id, customer_name, customer_email, customer_phone,
        adult_qty, child_qty, total_amount, status, stripe_session_id, created_at";

    fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            event_id: row.get(1)?,
            customer_name: row.get(2)?,
            customer_email: row.get(3)?,
            customer_phone: row.get(4)?,
            adult_qty: row.get(5)?,
            child_qty: row.get(6)?,
            total_amount: row.get(7)?,
            status: row.get(8)?,
            stripe_session_id: row.get(9)?,
            created_at: row.get(10)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

fn find_event(conn: &Connection, id: i64) -> AppResult<Event> {
    conn.query_row(
        &format!("SELECT {} FROM events WHERE id = ?1", Event::COLUMNS),
        params![id],
        Event::from_row,
    )
    .optional()?
    .ok_or_else(|| AppError::not_found(format!("Event {id} not found")))
}

fn find_booking(conn: &Connection, id: i64) -> AppResult<Booking> {
    conn.query_row(
        &format!("SELECT {} FROM event_bookings WHERE id = ?1", Booking::COLUMNS),
        params![id],
        Booking::from_row,
    )
    .optional()?
    .ok_or_else(|| AppError::not_found(format!("Booking {id} not found")))
}

pub fn list_events(db: &DbState, include_inactive: bool) -> AppResult<Vec<Event>> {
    let conn = db.lock()?;
    let filter = if include_inactive {
        ""
    } else {
        "WHERE is_active = 1"
    };
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM events {filter} ORDER BY starts_at ASC",
        Event::COLUMNS
    ))?;
    let events = stmt
        .query_map([], Event::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(events)
}

pub fn get_event(db: &DbState, id: i64) -> AppResult<Event> {
    let conn = db.lock()?;
    find_event(&conn, id)
}

fn ensure_can_manage(event: &Event, actor: &Claims) -> AppResult<()> {
    match actor.role {
        Role::SuperAdmin | Role::Admin => Ok(()),
        Role::Organiser if event.organiser_id == Some(actor.sub) => Ok(()),
        _ => Err(AppError::forbidden("You can only manage your own events")),
    }
}

pub fn list_bookings(db: &DbState, event_id: i64, actor: &Claims) -> AppResult<Vec<Booking>> {
    let conn = db.lock()?;
    let event = find_event(&conn, event_id)?;
    ensure_can_manage(&event, actor)?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM event_bookings WHERE event_id = ?1 ORDER BY created_at DESC, id DESC",
        Booking::COLUMNS
    ))?;
    let bookings = stmt
        .query_map(params![event_id], Booking::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(bookings)
}

// ---------------------------------------------------------------------------
// Event management
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewEvent {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub venue: Option<String>,
    pub starts_at: String,
    #[serde(default)]
    pub adult_price: f64,
    #[serde(default)]
    pub child_price: f64,
    #[serde(default)]
    pub adult_capacity: Option<i64>,
    #[serde(default)]
    pub child_capacity: Option<i64>,
    pub total_capacity: i64,
}

fn validate_event(
    title: &str,
    starts_at: &str,
    prices: (f64, f64),
    capacities: (Option<i64>, Option<i64>, i64),
) -> AppResult<()> {
    if title.trim().is_empty() {
        return Err(AppError::bad_request("Title is required"));
    }
    if chrono::DateTime::parse_from_rfc3339(starts_at).is_err() {
        return Err(AppError::bad_request("startsAt must be an RFC 3339 timestamp"));
    }
    let (adult, child) = prices;
    if !(adult.is_finite() && child.is_finite()) || adult < 0.0 || child < 0.0 {
        return Err(AppError::bad_request("Prices cannot be negative"));
    }
    let (adult_cap, child_cap, total) = capacities;
    if total <= 0 {
        return Err(AppError::bad_request("Total capacity must be positive"));
    }
    if adult_cap.is_some_and(|c| c < 0) || child_cap.is_some_and(|c| c < 0) {
        return Err(AppError::bad_request("Capacities cannot be negative"));
    }
    Ok(())
}

pub fn create_event(db: &DbState, input: NewEvent, actor: &Claims) -> AppResult<Event> {
    validate_event(
        &input.title,
        &input.starts_at,
        (input.adult_price, input.child_price),
        (input.adult_capacity, input.child_capacity, input.total_capacity),
    )?;
    let conn = db.lock()?;
    conn.execute(
        "INSERT INTO events (title, description, venue, starts_at, adult_price, child_price,
                             adult_capacity, child_capacity, total_capacity, organiser_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            input.title.trim(),
            input.description,
            input.venue,
            input.starts_at,
            input.adult_price,
            input.child_price,
            input.adult_capacity,
            input.child_capacity,
            input.total_capacity,
            actor.sub,
        ],
    )?;
    let id = conn.last_insert_rowid();
    info!(event_id = id, organiser = actor.sub, "event created");
    find_event(&conn, id)
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventUpdate {
    pub title: Option<String>,
    pub description: Option<String>,
    pub venue: Option<String>,
    pub starts_at: Option<String>,
    pub adult_price: Option<f64>,
    pub child_price: Option<f64>,
    pub adult_capacity: Option<i64>,
    pub child_capacity: Option<i64>,
    pub total_capacity: Option<i64>,
    pub is_active: Option<bool>,
}

pub fn update_event(
    db: &DbState,
    id: i64,
    update: EventUpdate,
    actor: &Claims,
) -> AppResult<Event> {
    let conn = db.lock()?;
    db::immediate(&conn, |conn| {
        let current = find_event(conn, id)?;
        ensure_can_manage(&current, actor)?;

        let title = update.title.unwrap_or(current.title);
        let starts_at = update.starts_at.unwrap_or(current.starts_at);
        let adult_price = update.adult_price.unwrap_or(current.adult_price);
        let child_price = update.child_price.unwrap_or(current.child_price);
        let adult_capacity = update.adult_capacity.or(current.adult_capacity);
        let child_capacity = update.child_capacity.or(current.child_capacity);
        let total_capacity = update.total_capacity.unwrap_or(current.total_capacity);
        validate_event(
            &title,
            &starts_at,
            (adult_price, child_price),
            (adult_capacity, child_capacity, total_capacity),
        )?;
        if total_capacity < current.total_sold {
            return Err(AppError::bad_request(format!(
                "{} tickets are already sold",
                current.total_sold
            )));
        }

        conn.execute(
            "UPDATE events SET title = ?1, description = ?2, venue = ?3, starts_at = ?4,
                    adult_price = ?5, child_price = ?6, adult_capacity = ?7, child_capacity = ?8,
                    total_capacity = ?9, is_active = ?10, updated_at = datetime('now')
             WHERE id = ?11",
            params![
                title.trim(),
                update.description.or(current.description),
                update.venue.or(current.venue),
                starts_at,
                adult_price,
                child_price,
                adult_capacity,
                child_capacity,
                total_capacity,
                update.is_active.unwrap_or(current.is_active),
                id,
            ],
        )?;
        find_event(conn, id)
    })
    .inspect(|event| info!(event_id = event.id, "event updated"))
}

/// Delete an event, or deactivate it when bookings reference it.
pub fn delete_event(db: &DbState, id: i64, actor: &Claims) -> AppResult<bool> {
    let conn = db.lock()?;
    let event = find_event(&conn, id)?;
    ensure_can_manage(&event, actor)?;
    let bookings: i64 = conn.query_row(
        "SELECT COUNT(*) FROM event_bookings WHERE event_id = ?1",
        params![id],
        |row| row.get(0),
    )?;
    if bookings > 0 {
        conn.execute(
            "UPDATE events SET is_active = 0, updated_at = datetime('now') WHERE id = ?1",
            params![id],
        )?;
        info!(event_id = id, bookings, "event deactivated");
        return Ok(false);
    }
    conn.execute("DELETE FROM events WHERE id = ?1", params![id])?;
    info!(event_id = id, "event deleted");
    Ok(true)
}

// ---------------------------------------------------------------------------
// Booking
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingRequest {
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default, alias = "adult_qty")]
    pub adults: i64,
    #[serde(default, alias = "child_qty")]
    pub children: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingResponse {
    pub booking_id: i64,
    pub url: String,
    pub total_amount: f64,
}

/// Create a pending booking and a checkout session for it.
pub async fn book(
    state: &AppState,
    event_id: i64,
    req: BookingRequest,
) -> AppResult<BookingResponse> {
    if req.name.trim().is_empty() || !req.email.contains('@') {
        return Err(AppError::bad_request("Name and a valid email are required"));
    }
    if req.adults < 0 || req.children < 0 || (req.adults == 0 && req.children == 0) {
        return Err(AppError::bad_request("Book at least one ticket"));
    }

    let (event, booking_id, total) = {
        let conn = state.db.lock()?;
        let event = find_event(&conn, event_id)?;
        if !event.is_active {
            return Err(AppError::bad_request("This event is no longer taking bookings"));
        }
        event.check_capacity(req.adults, req.children)?;
        let total = round_money(
            event.adult_price * req.adults as f64 + event.child_price * req.children as f64,
        );
        conn.execute(
            "INSERT INTO event_bookings (event_id, customer_name, customer_email, customer_phone,
                                         adult_qty, child_qty, total_amount)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                event_id,
                req.name.trim(),
                req.email.trim(),
                req.phone,
                req.adults,
                req.children,
                total
            ],
        )?;
        (event, conn.last_insert_rowid(), total)
    };

    let frontend = &state.config.frontend_url;

    if total <= 0.0 {
        let outcome = {
            let conn = state.db.lock()?;
            db::immediate(&conn, |conn| confirm_booking(conn, booking_id, None))?
        };
        announce(&state.notifier, &outcome).await;
        return Ok(BookingResponse {
            booking_id,
            url: format!("{frontend}/events/{event_id}/booked?booking_id={booking_id}"),
            total_amount: total,
        });
    }

    let mut line_items = Vec::new();
    if req.adults > 0 {
        line_items.push(LineItem {
            name: format!("{} - adult ticket", event.title),
            unit_amount: to_pence(event.adult_price),
            quantity: req.adults as u64,
        });
    }
    if req.children > 0 && event.child_price > 0.0 {
        line_items.push(LineItem {
            name: format!("{} - child ticket", event.title),
            unit_amount: to_pence(event.child_price),
            quantity: req.children as u64,
        });
    }

    let metadata = HashMap::from([
        ("type".to_string(), BOOKING_METADATA_TYPE.to_string()),
        ("booking_id".to_string(), booking_id.to_string()),
        ("event_id".to_string(), event_id.to_string()),
    ]);

    let session = state
        .payments
        .create_checkout(CheckoutRequest {
            line_items,
            customer_email: req.email.trim().to_string(),
            success_url: format!(
                "{frontend}/events/{event_id}/booked?session_id={{CHECKOUT_SESSION_ID}}"
            ),
            cancel_url: format!("{frontend}/events/{event_id}"),
            metadata,
        })
        .await?;

    {
        let conn = state.db.lock()?;
        conn.execute(
            "UPDATE event_bookings SET stripe_session_id = ?1, updated_at = datetime('now') WHERE id = ?2",
            params![session.id, booking_id],
        )?;
    }

    info!(booking_id, event_id, total, session_id = %session.id, "event booking started");
    Ok(BookingResponse {
        booking_id,
        url: session.url,
        total_amount: total,
    })
}

#[derive(Debug, Clone)]
pub enum BookingOutcome {
    Paid { booking: Booking, event: Event },
    Overbooked { booking: Booking, event: Event },
    AlreadyProcessed,
}

/// Mark a pending booking paid and claim its seats. Call inside a
/// transaction.
pub fn confirm_booking(
    conn: &Connection,
    booking_id: i64,
    session_id: Option<&str>,
) -> AppResult<BookingOutcome> {
    let booking = find_booking(conn, booking_id)?;
    if booking.status != BookingStatus::Pending {
        return Ok(BookingOutcome::AlreadyProcessed);
    }

    let (a, c) = (booking.adult_qty, booking.child_qty);
    let claimed = conn.execute(
        "UPDATE events SET adult_sold = adult_sold + ?1, child_sold = child_sold + ?2,
                total_sold = total_sold + ?1 + ?2, updated_at = datetime('now')
         WHERE id = ?3
           AND total_sold + ?1 + ?2 <= total_capacity
           AND (adult_capacity IS NULL OR adult_sold + ?1 <= adult_capacity)
           AND (child_capacity IS NULL OR child_sold + ?2 <= child_capacity)",
        params![a, c, booking.event_id],
    )? == 1;

    let status = if claimed {
        BookingStatus::Paid
    } else {
        BookingStatus::Overbooked
    };
    conn.execute(
        "UPDATE event_bookings SET status = ?1,
                stripe_session_id = COALESCE(?2, stripe_session_id),
                updated_at = datetime('now')
         WHERE id = ?3",
        params![status, session_id, booking_id],
    )?;

    let booking = find_booking(conn, booking_id)?;
    let event = find_event(conn, booking.event_id)?;
    if claimed {
        info!(booking_id, event_id = event.id, "event booking paid");
        Ok(BookingOutcome::Paid { booking, event })
    } else {
        warn!(booking_id, event_id = event.id, "event booking paid after capacity ran out");
        Ok(BookingOutcome::Overbooked { booking, event })
    }
}

/// Best-effort notifications for a confirmed booking.
pub async fn announce(notifier: &Notifier, outcome: &BookingOutcome) {
    match outcome {
        BookingOutcome::Paid { booking, event } => {
            notifier
                .email(templates::booking_confirmation(
                    &booking.customer_email,
                    &booking.customer_name,
                    &event.title,
                    booking.adult_qty,
                    booking.child_qty,
                    booking.id,
                ))
                .await;
        }
        BookingOutcome::Overbooked { booking, event } => {
            notifier
                .admin_alert(&templates::overbooked_alert(
                    booking.id,
                    &event.title,
                    &booking.customer_email,
                ))
                .await;
        }
        BookingOutcome::AlreadyProcessed => {}
    }
}
