//! Order queries.
//!
//! Orders are created by [`placement`] (webhook, zero-total checkout, staff
//! cash orders) and moved through their lifecycle by [`workflow`]. Rows are
//! never deleted.

use rusqlite::{params, Connection, OptionalExtension, ToSql};
use serde::{Deserialize, Serialize};

use crate::db::DbState;
use crate::error::{AppError, AppResult};
use crate::models::{Location, Order, OrderItem, OrderStatus};

pub mod placement;
pub mod workflow;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderWithItems {
    #[serde(flatten)]
    pub order: Order,
    pub items: Vec<OrderItem>,
}

pub fn get_order(conn: &Connection, id: i64) -> AppResult<Order> {
    conn.query_row(
        &format!("SELECT {} FROM orders WHERE id = ?1", Order::COLUMNS),
        params![id],
        Order::from_row,
    )
    .optional()?
    .ok_or_else(|| AppError::not_found(format!("Order {id} not found")))
}

pub fn order_items(conn: &Connection, order_id: i64) -> AppResult<Vec<OrderItem>> {
    let mut stmt = conn.prepare(
        "SELECT oi.product_id, p.name, oi.quantity, oi.price
         FROM order_items oi
         LEFT JOIN products p ON p.id = oi.product_id
         WHERE oi.order_id = ?1
         ORDER BY oi.id",
    )?;
    let items = stmt
        .query_map(params![order_id], |row| {
            Ok(OrderItem {
                product_id: row.get(0)?,
                product_name: row.get(1)?,
                quantity: row.get(2)?,
                price: row.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(items)
}

pub fn with_items(conn: &Connection, order: Order) -> AppResult<OrderWithItems> {
    let items = order_items(conn, order.id)?;
    Ok(OrderWithItems { order, items })
}

pub fn find(db: &DbState, id: i64) -> AppResult<OrderWithItems> {
    let conn = db.lock()?;
    let order = get_order(&conn, id)?;
    with_items(&conn, order)
}

/// Order created for a checkout session, for the customer's success page.
pub fn by_session(db: &DbState, session_id: &str) -> AppResult<OrderWithItems> {
    let conn = db.lock()?;
    let order = conn
        .query_row(
            &format!(
                "SELECT {} FROM orders WHERE stripe_session_id = ?1",
                Order::COLUMNS
            ),
            params![session_id],
            Order::from_row,
        )
        .optional()?
        .ok_or_else(|| AppError::not_found("Order not found for this session"))?;
    with_items(&conn, order)
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderFilter {
    #[serde(default)]
    pub status: Option<OrderStatus>,
    #[serde(default)]
    pub location: Option<Location>,
    /// `YYYY-MM-DD`; orders created on that day.
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default, alias = "driver_id")]
    pub driver_id: Option<i64>,
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: Option<i64>,
}

pub fn list(db: &DbState, filter: &OrderFilter) -> AppResult<Vec<OrderWithItems>> {
    let mut clauses: Vec<&str> = Vec::new();
    let mut args: Vec<Box<dyn ToSql>> = Vec::new();

    if let Some(status) = filter.status {
        clauses.push("status = ?");
        args.push(Box::new(status));
    }
    if let Some(location) = filter.location {
        clauses.push("location = ?");
        args.push(Box::new(location));
    }
    if let Some(date) = filter.date.as_deref() {
        if chrono::NaiveDate::parse_from_str(date, "%Y-%m-%d").is_err() {
            return Err(AppError::bad_request("date must be YYYY-MM-DD"));
        }
        clauses.push("date(created_at) = ?");
        args.push(Box::new(date.to_string()));
    }
    if let Some(driver_id) = filter.driver_id {
        clauses.push("driver_id = ?");
        args.push(Box::new(driver_id));
    }

    let where_sql = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };
    let limit = filter.limit.unwrap_or(200).clamp(1, 1000);
    let offset = filter.offset.unwrap_or(0).max(0);

    let conn = db.lock()?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM orders {where_sql} ORDER BY created_at DESC, id DESC LIMIT {limit} OFFSET {offset}",
        Order::COLUMNS
    ))?;
    let params: Vec<&dyn ToSql> = args.iter().map(|a| a.as_ref()).collect();
    let orders = stmt
        .query_map(params.as_slice(), Order::from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    orders
        .into_iter()
        .map(|order| with_items(&conn, order))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::seed_order;

    #[test]
    fn list_filters_by_status_and_location() {
        let db = DbState::in_memory().unwrap();
        crate::test_support::seed_products(&db);
        let a = seed_order(&db, Location::Leeds, OrderStatus::Ready);
        seed_order(&db, Location::Derby, OrderStatus::Ready);
        seed_order(&db, Location::Leeds, OrderStatus::Pending);

        let ready_leeds = list(
            &db,
            &OrderFilter {
                status: Some(OrderStatus::Ready),
                location: Some(Location::Leeds),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(ready_leeds.len(), 1);
        assert_eq!(ready_leeds[0].order.id, a);
        assert_eq!(ready_leeds[0].items.len(), 1);
        assert_eq!(ready_leeds[0].items[0].product_name.as_deref(), Some("Steak pie"));

        assert_eq!(list(&db, &OrderFilter::default()).unwrap().len(), 3);
    }

    #[test]
    fn bad_date_filter_is_rejected() {
        let db = DbState::in_memory().unwrap();
        let err = list(
            &db,
            &OrderFilter {
                date: Some("19/10/2026".into()),
                ..Default::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[test]
    fn missing_session_is_not_found() {
        let db = DbState::in_memory().unwrap();
        assert!(matches!(
            by_session(&db, "cs_missing"),
            Err(AppError::NotFound(_))
        ));
    }
}
