//! Per-location stock.
//!
//! Every stock change goes through [`decrement`] or [`increment`], which are
//! single conditional `UPDATE`s, so concurrent fulfilment and cancellation
//! never lose or invent units.

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::db::{self, DbState};
use crate::error::{AppError, AppResult};
use crate::models::Location;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LowStockItem {
    pub product_id: i64,
    pub name: String,
    pub location: Location,
    pub inventory: i64,
}

/// Take `qty` units at `location`. Returns `false` (and changes nothing)
/// when fewer than `qty` are in stock.
pub fn decrement(
    conn: &Connection,
    product_id: i64,
    location: Location,
    qty: i64,
) -> AppResult<bool> {
    let col = location.inventory_column();
    let changed = conn.execute(
        &format!("UPDATE products SET {col} = {col} - ?1, updated_at = datetime('now') WHERE id = ?2 AND {col} >= ?1"),
        params![qty, product_id],
    )?;
    Ok(changed == 1)
}

/// Take up to `qty` units. When stock is short the counter is drained to
/// zero and the shortfall returned.
pub fn decrement_or_drain(
    conn: &Connection,
    product_id: i64,
    location: Location,
    qty: i64,
) -> AppResult<i64> {
    if decrement(conn, product_id, location, qty)? {
        return Ok(0);
    }
    let available = stock_at(conn, product_id, location)?;
    let col = location.inventory_column();
    conn.execute(
        &format!("UPDATE products SET {col} = 0, updated_at = datetime('now') WHERE id = ?1"),
        params![product_id],
    )?;
    let shortfall = qty - available;
    warn!(product_id, %location, qty, available, shortfall, "stock oversold");
    Ok(shortfall)
}

/// Return `qty` units to `location`.
pub fn increment(
    conn: &Connection,
    product_id: i64,
    location: Location,
    qty: i64,
) -> AppResult<()> {
    let col = location.inventory_column();
    let changed = conn.execute(
        &format!("UPDATE products SET {col} = {col} + ?1, updated_at = datetime('now') WHERE id = ?2"),
        params![qty, product_id],
    )?;
    if changed == 0 {
        return Err(AppError::not_found(format!("Product {product_id} not found")));
    }
    Ok(())
}

pub fn stock_at(conn: &Connection, product_id: i64, location: Location) -> AppResult<i64> {
    let col = location.inventory_column();
    conn.query_row(
        &format!("SELECT {col} FROM products WHERE id = ?1"),
        params![product_id],
        |row| row.get(0),
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => {
            AppError::not_found(format!("Product {product_id} not found"))
        }
        other => other.into(),
    })
}

/// Products among `product_ids` at or below `threshold` at `location`.
pub fn low_stock_among(
    conn: &Connection,
    product_ids: &[i64],
    location: Location,
    threshold: i64,
) -> AppResult<Vec<LowStockItem>> {
    let col = location.inventory_column();
    let mut stmt = conn.prepare(&format!(
        "SELECT id, name, {col} FROM products WHERE id = ?1 AND {col} <= ?2"
    ))?;
    let mut out = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for &id in product_ids {
        if !seen.insert(id) {
            continue;
        }
        let mut rows = stmt.query(params![id, threshold])?;
        if let Some(row) = rows.next()? {
            out.push(LowStockItem {
                product_id: row.get(0)?,
                name: row.get(1)?,
                location,
                inventory: row.get(2)?,
            });
        }
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Admin operations
// ---------------------------------------------------------------------------

/// Partial per-location inventory edit.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryUpdate {
    #[serde(default, alias = "inventory_leeds")]
    pub leeds: Option<i64>,
    #[serde(default, alias = "inventory_derby")]
    pub derby: Option<i64>,
    #[serde(default, alias = "inventory_sheffield")]
    pub sheffield: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StockLevels {
    pub product_id: i64,
    pub leeds: i64,
    pub derby: i64,
    pub sheffield: i64,
}

fn read_levels(conn: &Connection, product_id: i64) -> AppResult<StockLevels> {
    conn.query_row(
        "SELECT inventory_leeds, inventory_derby, inventory_sheffield FROM products WHERE id = ?1",
        params![product_id],
        |row| {
            Ok(StockLevels {
                product_id,
                leeds: row.get(0)?,
                derby: row.get(1)?,
                sheffield: row.get(2)?,
            })
        },
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => {
            AppError::not_found(format!("Product {product_id} not found"))
        }
        other => other.into(),
    })
}

pub fn set_inventory(
    db: &DbState,
    product_id: i64,
    update: &InventoryUpdate,
) -> AppResult<StockLevels> {
    let changes = [
        (Location::Leeds, update.leeds),
        (Location::Derby, update.derby),
        (Location::Sheffield, update.sheffield),
    ];
    if changes.iter().all(|(_, v)| v.is_none()) {
        return Err(AppError::bad_request("No inventory values supplied"));
    }
    if changes.iter().any(|(_, v)| v.is_some_and(|n| n < 0)) {
        return Err(AppError::bad_request("Inventory cannot be negative"));
    }

    let conn = db.lock()?;
    db::immediate(&conn, |conn| {
        read_levels(conn, product_id)?;
        for (location, value) in changes {
            if let Some(value) = value {
                let col = location.inventory_column();
                conn.execute(
                    &format!("UPDATE products SET {col} = ?1, updated_at = datetime('now') WHERE id = ?2"),
                    params![value, product_id],
                )?;
            }
        }
        read_levels(conn, product_id)
    })
    .inspect(|levels| info!(product_id, ?levels, "inventory set"))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRequest {
    #[serde(alias = "product_id")]
    pub product_id: i64,
    #[serde(alias = "from_location")]
    pub from: Location,
    #[serde(alias = "to_location")]
    pub to: Location,
    pub quantity: i64,
}

/// Move stock between locations in one transaction.
pub fn transfer(
    db: &DbState,
    req: &TransferRequest,
    admin_id: Option<i64>,
) -> AppResult<StockLevels> {
    if req.quantity <= 0 {
        return Err(AppError::bad_request("Quantity must be positive"));
    }
    if req.from == req.to {
        return Err(AppError::bad_request(
            "Source and destination locations must differ",
        ));
    }

    let conn = db.lock()?;
    let levels = db::immediate(&conn, |conn| {
        read_levels(conn, req.product_id)?;
        if !decrement(conn, req.product_id, req.from, req.quantity)? {
            return Err(AppError::conflict(format!(
                "Insufficient stock at {} to transfer {}",
                req.from, req.quantity
            )));
        }
        increment(conn, req.product_id, req.to, req.quantity)?;
        conn.execute(
            "INSERT INTO stock_transfers (product_id, from_location, to_location, quantity, created_by)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![req.product_id, req.from, req.to, req.quantity, admin_id],
        )?;
        read_levels(conn, req.product_id)
    })?;

    info!(
        product_id = req.product_id,
        from = %req.from,
        to = %req.to,
        quantity = req.quantity,
        "stock transferred"
    );
    Ok(levels)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryRequest {
    #[serde(alias = "product_id")]
    pub product_id: i64,
    pub location: Location,
    pub quantity: i64,
    #[serde(default)]
    pub note: Option<String>,
}

/// Record incoming stock at a location.
pub fn record_delivery(
    db: &DbState,
    req: &DeliveryRequest,
    admin_id: Option<i64>,
) -> AppResult<StockLevels> {
    if req.quantity <= 0 {
        return Err(AppError::bad_request("Quantity must be positive"));
    }

    let conn = db.lock()?;
    let levels = db::immediate(&conn, |conn| {
        increment(conn, req.product_id, req.location, req.quantity)?;
        conn.execute(
            "INSERT INTO stock_deliveries (product_id, location, quantity, note, recorded_by)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![req.product_id, req.location, req.quantity, req.note, admin_id],
        )?;
        read_levels(conn, req.product_id)
    })?;

    info!(
        product_id = req.product_id,
        location = %req.location,
        quantity = req.quantity,
        "stock delivery recorded"
    );
    Ok(levels)
}

/// Active products at or below `threshold`, for one location or all.
pub fn low_stock(
    db: &DbState,
    location: Option<Location>,
    threshold: i64,
) -> AppResult<Vec<LowStockItem>> {
    let locations: Vec<Location> = match location {
        Some(l) => vec![l],
        None => Location::ALL.to_vec(),
    };
    let conn = db.lock()?;
    let mut out = Vec::new();
    for location in locations {
        let col = location.inventory_column();
        let mut stmt = conn.prepare(&format!(
            "SELECT id, name, {col} FROM products
             WHERE is_active = 1 AND {col} <= ?1
             ORDER BY {col} ASC, name ASC"
        ))?;
        let rows = stmt.query_map(params![threshold], |row| {
            Ok(LowStockItem {
                product_id: row.get(0)?,
                name: row.get(1)?,
                location,
                inventory: row.get(2)?,
            })
        })?;
        for row in rows {
            out.push(row?);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> DbState {
        let db = DbState::in_memory().expect("in-memory db");
        db.conn
            .lock()
            .unwrap()
            .execute_batch(
                "INSERT INTO products (id, name, price, inventory_leeds, inventory_derby, inventory_sheffield)
                 VALUES (1, 'Sausage roll', 2.5, 12, 3, 0),
                        (2, 'Pasty', 4.0, 50, 50, 50);",
            )
            .unwrap();
        db
    }

    #[test]
    fn decrement_refuses_to_go_below_zero() {
        let db = test_db();
        let conn = db.conn.lock().unwrap();
        assert!(decrement(&conn, 1, Location::Derby, 3).unwrap());
        assert!(!decrement(&conn, 1, Location::Derby, 1).unwrap());
        assert_eq!(stock_at(&conn, 1, Location::Derby).unwrap(), 0);
    }

    #[test]
    fn drain_reports_shortfall() {
        let db = test_db();
        let conn = db.conn.lock().unwrap();
        assert_eq!(decrement_or_drain(&conn, 1, Location::Derby, 5).unwrap(), 2);
        assert_eq!(stock_at(&conn, 1, Location::Derby).unwrap(), 0);
        assert_eq!(decrement_or_drain(&conn, 2, Location::Derby, 5).unwrap(), 0);
        assert_eq!(stock_at(&conn, 2, Location::Derby).unwrap(), 45);
    }

    #[test]
    fn low_stock_among_dedupes_and_filters() {
        let db = test_db();
        let conn = db.conn.lock().unwrap();
        let low = low_stock_among(&conn, &[1, 1, 2], Location::Leeds, 12).unwrap();
        assert_eq!(low.len(), 1);
        assert_eq!(low[0].product_id, 1);
        assert_eq!(low[0].inventory, 12);
    }

    #[test]
    fn transfer_moves_stock_and_audits() {
        let db = test_db();
        let levels = transfer(
            &db,
            &TransferRequest {
                product_id: 1,
                from: Location::Leeds,
                to: Location::Sheffield,
                quantity: 5,
            },
            Some(9),
        )
        .unwrap();
        assert_eq!(levels.leeds, 7);
        assert_eq!(levels.sheffield, 5);

        let audits: i64 = db
            .conn
            .lock()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM stock_transfers", [], |r| r.get(0))
            .unwrap();
        assert_eq!(audits, 1);
    }

    #[test]
    fn transfer_rejects_insufficient_stock_without_side_effects() {
        let db = test_db();
        let err = transfer(
            &db,
            &TransferRequest {
                product_id: 1,
                from: Location::Sheffield,
                to: Location::Leeds,
                quantity: 1,
            },
            None,
        )
        .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));

        let conn = db.conn.lock().unwrap();
        assert_eq!(stock_at(&conn, 1, Location::Leeds).unwrap(), 12);
    }

    #[test]
    fn delivery_increments_location() {
        let db = test_db();
        let levels = record_delivery(
            &db,
            &DeliveryRequest {
                product_id: 1,
                location: Location::Sheffield,
                quantity: 24,
                note: Some("Monday bake".into()),
            },
            None,
        )
        .unwrap();
        assert_eq!(levels.sheffield, 24);
    }

    #[test]
    fn set_inventory_is_partial() {
        let db = test_db();
        let levels = set_inventory(
            &db,
            1,
            &InventoryUpdate {
                derby: Some(40),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(levels, StockLevels { product_id: 1, leeds: 12, derby: 40, sheffield: 0 });

        assert!(set_inventory(&db, 1, &InventoryUpdate::default()).is_err());
        assert!(matches!(
            set_inventory(&db, 99, &InventoryUpdate { leeds: Some(1), ..Default::default() }),
            Err(AppError::NotFound(_))
        ));
    }

    #[test]
    fn low_stock_lists_each_location() {
        let db = test_db();
        let all = low_stock(&db, None, 10).unwrap();
        // Sausage roll is low at Derby (3) and Sheffield (0); nothing at Leeds.
        assert_eq!(all.len(), 2);
        assert!(all.iter().all(|i| i.product_id == 1));
        let leeds = low_stock(&db, Some(Location::Leeds), 10).unwrap();
        assert!(leeds.is_empty());
    }
}
