//! Delivery route generation, assignment and the driver's view.
//!
//! Generation is a preview: orders are geocoded concurrently, split into
//! one contiguous chunk per driver, and each chunk is optimised and traced
//! by the [`RoutePlanner`]. Nothing is stored until an admin assigns a
//! generated route to a driver.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::auth::{self, Claims};
use crate::db::{self, DbState};
use crate::error::{AppError, AppResult};
use crate::models::{Order, OrderStatus, Role, RouteStatus, COLLECTION_ADDRESS};
use crate::orders::get_order;
use crate::state::AppState;

mod ors;

pub use ors::OrsPlanner;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub lon: f64,
    pub lat: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Directions {
    pub geometry: Value,
    pub distance_m: f64,
    pub duration_s: f64,
}

/// Geocoding and routing backend.
#[async_trait]
pub trait RoutePlanner: Send + Sync {
    /// `None` when the address cannot be located.
    async fn geocode(&self, address: &str) -> AppResult<Option<Coordinate>>;

    /// Visiting order of `stops` as indices into the slice.
    async fn optimize(&self, stops: &[Coordinate], depot: Option<Coordinate>)
        -> AppResult<Vec<usize>>;

    async fn directions(&self, coordinates: &[Coordinate]) -> AppResult<Directions>;
}

pub type DynRoutePlanner = Arc<dyn RoutePlanner>;

/// Used when no routing API key is configured.
pub struct UnconfiguredPlanner;

impl UnconfiguredPlanner {
    fn error() -> AppError {
        AppError::Upstream("Route planning is not configured".into())
    }
}

#[async_trait]
impl RoutePlanner for UnconfiguredPlanner {
    async fn geocode(&self, _address: &str) -> AppResult<Option<Coordinate>> {
        Err(Self::error())
    }

    async fn optimize(&self, _: &[Coordinate], _: Option<Coordinate>) -> AppResult<Vec<usize>> {
        Err(Self::error())
    }

    async fn directions(&self, _: &[Coordinate]) -> AppResult<Directions> {
        Err(Self::error())
    }
}

// ---------------------------------------------------------------------------
// Generation
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequest {
    #[serde(alias = "num_drivers")]
    pub num_drivers: usize,
    #[serde(default, alias = "order_ids")]
    pub order_ids: Option<Vec<i64>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteStop {
    pub order_id: i64,
    pub customer_name: String,
    pub address: String,
    pub postcode: Option<String>,
    pub coordinate: Coordinate,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedRoute {
    pub stops: Vec<RouteStop>,
    pub geometry: Option<Value>,
    pub distance_m: Option<f64>,
    pub duration_s: Option<f64>,
    pub optimized: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedOrder {
    pub order_id: i64,
    pub reason: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedRoutes {
    pub routes: Vec<GeneratedRoute>,
    pub skipped: Vec<SkippedOrder>,
}

fn routable_orders(
    conn: &Connection,
    req: &GenerateRequest,
    actor: &Claims,
) -> AppResult<(Vec<Order>, Vec<SkippedOrder>)> {
    let mut skipped = Vec::new();

    let candidates = match &req.order_ids {
        Some(ids) => ids
            .iter()
            .map(|&id| get_order(conn, id))
            .collect::<AppResult<Vec<_>>>()?,
        None => {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM orders
                 WHERE status = ?1 AND driver_id IS NULL
                   AND address != ?3 COLLATE NOCASE
                   AND (?2 IS NULL OR location = ?2)
                 ORDER BY created_at, id",
                Order::COLUMNS
            ))?;
            let rows = stmt
                .query_map(
                    params![OrderStatus::Ready, actor.location, COLLECTION_ADDRESS],
                    Order::from_row,
                )?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        }
    };

    let mut orders = Vec::with_capacity(candidates.len());
    for order in candidates {
        let reason = if order.is_collection() {
            Some("Collection order")
        } else if order.status.is_terminal() {
            Some("Order is already completed")
        } else if actor.location.is_some_and(|loc| loc != order.location) {
            Some("Order belongs to another shop")
        } else {
            None
        };
        match reason {
            Some(reason) => skipped.push(SkippedOrder {
                order_id: order.id,
                reason: reason.to_string(),
            }),
            None => orders.push(order),
        }
    }
    Ok((orders, skipped))
}

fn geocode_query(order: &Order) -> String {
    match order.postcode.as_deref().filter(|p| !p.trim().is_empty()) {
        Some(postcode) => format!("{}, {}, UK", order.address.trim(), postcode.trim()),
        None => format!("{}, UK", order.address.trim()),
    }
}

/// Optimise and trace one chunk, falling back to the input order.
async fn plan_chunk(
    planner: &dyn RoutePlanner,
    stops: Vec<RouteStop>,
    depot: Option<Coordinate>,
) -> GeneratedRoute {
    let coords: Vec<Coordinate> = stops.iter().map(|s| s.coordinate).collect();

    let planned = async {
        let order = planner.optimize(&coords, depot).await?;
        let mut seen = vec![false; coords.len()];
        let is_permutation = order.len() == coords.len()
            && order
                .iter()
                .all(|&i| i < seen.len() && !std::mem::replace(&mut seen[i], true));
        if !is_permutation {
            return Err(AppError::Upstream(
                "Optimiser returned an invalid visiting order".into(),
            ));
        }

        let mut path: Vec<Coordinate> = Vec::with_capacity(coords.len() + 2);
        path.extend(depot);
        path.extend(order.iter().map(|&i| coords[i]));
        path.extend(depot);
        let directions = if path.len() >= 2 {
            Some(planner.directions(&path).await?)
        } else {
            None
        };
        Ok::<_, AppError>((order, directions))
    }
    .await;

    match planned {
        Ok((order, directions)) => {
            let mut slots: Vec<Option<RouteStop>> = stops.into_iter().map(Some).collect();
            let stops = order.iter().filter_map(|&i| slots[i].take()).collect();
            GeneratedRoute {
                stops,
                geometry: directions.as_ref().map(|d| d.geometry.clone()),
                distance_m: directions.as_ref().map(|d| d.distance_m),
                duration_s: directions.as_ref().map(|d| d.duration_s),
                optimized: true,
            }
        }
        Err(e) => {
            warn!(stops = stops.len(), error = %e, "route optimisation failed, keeping input order");
            GeneratedRoute {
                stops,
                geometry: None,
                distance_m: None,
                duration_s: None,
                optimized: false,
            }
        }
    }
}

pub async fn generate_routes(
    state: &AppState,
    req: GenerateRequest,
    actor: &Claims,
) -> AppResult<GeneratedRoutes> {
    if req.num_drivers == 0 {
        return Err(AppError::bad_request("numDrivers must be at least 1"));
    }

    let (orders, mut skipped) = {
        let conn = state.db.lock()?;
        routable_orders(&conn, &req, actor)?
    };
    if orders.is_empty() {
        return Err(AppError::bad_request("No orders are ready for delivery"));
    }

    let planner = state.planner.as_ref();
    let lookups = join_all(orders.iter().map(|o| {
        let query = geocode_query(o);
        async move { planner.geocode(&query).await }
    }))
    .await;

    let mut stops = Vec::with_capacity(orders.len());
    for (order, found) in orders.into_iter().zip(lookups) {
        match found {
            Ok(Some(coordinate)) => stops.push(RouteStop {
                order_id: order.id,
                customer_name: order.customer_name,
                address: order.address,
                postcode: order.postcode,
                coordinate,
            }),
            Ok(None) => skipped.push(SkippedOrder {
                order_id: order.id,
                reason: "Address could not be located".to_string(),
            }),
            Err(e) => skipped.push(SkippedOrder {
                order_id: order.id,
                reason: e.public_message(),
            }),
        }
    }
    if stops.is_empty() {
        return Err(AppError::bad_request(
            "None of the selected orders could be geocoded",
        ));
    }

    let chunk_size = stops.len().div_ceil(req.num_drivers);
    let depot = state
        .config
        .delivery_depot
        .map(|(lon, lat)| Coordinate { lon, lat });
    let chunks: Vec<Vec<RouteStop>> = stops.chunks(chunk_size).map(<[_]>::to_vec).collect();
    let routes = join_all(
        chunks
            .into_iter()
            .map(|chunk| plan_chunk(planner, chunk, depot)),
    )
    .await;

    info!(
        routes = routes.len(),
        optimized = routes.iter().filter(|r| r.optimized).count(),
        skipped = skipped.len(),
        "delivery routes generated"
    );
    Ok(GeneratedRoutes { routes, skipped })
}

// ---------------------------------------------------------------------------
// Assignment & driver view
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignRequest {
    #[serde(alias = "driver_id")]
    pub driver_id: i64,
    #[serde(alias = "order_ids")]
    pub order_ids: Vec<i64>,
    /// Generated route (geometry, distance) kept for the driver's map.
    #[serde(default, alias = "route_data")]
    pub route_data: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryRoute {
    pub id: i64,
    pub driver_id: i64,
    pub driver_name: Option<String>,
    pub status: RouteStatus,
    pub route_data: Value,
    pub created_at: String,
    pub updated_at: String,
    pub orders: Vec<Order>,
}

fn load_route(conn: &Connection, id: i64) -> AppResult<DeliveryRoute> {
    let route = conn
        .query_row(
            "SELECT r.id, r.driver_id, u.name, r.status, r.route_data, r.created_at, r.updated_at
             FROM delivery_routes r
             LEFT JOIN admin_users u ON u.id = r.driver_id
             WHERE r.id = ?1",
            params![id],
            |row| {
                let raw: String = row.get(4)?;
                Ok(DeliveryRoute {
                    id: row.get(0)?,
                    driver_id: row.get(1)?,
                    driver_name: row.get(2)?,
                    status: row.get(3)?,
                    route_data: serde_json::from_str(&raw).unwrap_or(Value::Null),
                    created_at: row.get(5)?,
                    updated_at: row.get(6)?,
                    orders: Vec::new(),
                })
            },
        )
        .optional()?
        .ok_or_else(|| AppError::not_found(format!("Route {id} not found")))?;

    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM orders WHERE route_id = ?1 ORDER BY route_position, id",
        Order::COLUMNS
    ))?;
    let orders = stmt
        .query_map(params![id], Order::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(DeliveryRoute { orders, ..route })
}

pub fn assign_route(db: &DbState, req: AssignRequest, actor: &Claims) -> AppResult<DeliveryRoute> {
    if req.order_ids.is_empty() {
        return Err(AppError::bad_request("A route needs at least one order"));
    }
    let driver = auth::get_user(db, req.driver_id)?;
    if driver.role != Role::Driver {
        return Err(AppError::bad_request(format!(
            "{} is not a driver",
            driver.name
        )));
    }

    let route_data = req.route_data.unwrap_or(Value::Null).to_string();
    let conn = db.lock()?;
    let route = db::immediate(&conn, |conn| {
        conn.execute(
            "INSERT INTO delivery_routes (driver_id, route_data) VALUES (?1, ?2)",
            params![driver.id, route_data],
        )?;
        let route_id = conn.last_insert_rowid();

        let mut stamp = conn.prepare(
            "UPDATE orders SET driver_id = ?1, route_id = ?2, route_position = ?3,
                    updated_at = datetime('now')
             WHERE id = ?4 AND status NOT IN ('delivered', 'cancelled')
               AND (?5 IS NULL OR location = ?5)",
        )?;
        for (position, order_id) in req.order_ids.iter().enumerate() {
            let changed = stamp.execute(params![
                driver.id,
                route_id,
                position as i64 + 1,
                order_id,
                actor.location
            ])?;
            if changed == 0 {
                return Err(AppError::bad_request(format!(
                    "Order #{order_id} cannot be added to a route"
                )));
            }
        }
        drop(stamp);
        load_route(conn, route_id)
    })?;

    info!(
        route_id = route.id,
        driver_id = driver.id,
        orders = route.orders.len(),
        by = actor.sub,
        "delivery route assigned"
    );
    Ok(route)
}

pub fn list_routes(db: &DbState, status: Option<RouteStatus>) -> AppResult<Vec<DeliveryRoute>> {
    let conn = db.lock()?;
    let ids: Vec<i64> = {
        let mut stmt = conn.prepare(
            "SELECT id FROM delivery_routes WHERE (?1 IS NULL OR status = ?1)
             ORDER BY created_at DESC, id DESC",
        )?;
        let rows = stmt.query_map(params![status], |row| row.get(0))?;
        rows.collect::<Result<Vec<_>, _>>()?
    };
    ids.into_iter().map(|id| load_route(&conn, id)).collect()
}

/// The driver's most recent route that is not completed.
pub fn my_route(db: &DbState, driver_id: i64) -> AppResult<Option<DeliveryRoute>> {
    let conn = db.lock()?;
    let id: Option<i64> = conn
        .query_row(
            "SELECT id FROM delivery_routes
             WHERE driver_id = ?1 AND status != 'completed'
             ORDER BY created_at DESC, id DESC LIMIT 1",
            params![driver_id],
            |row| row.get(0),
        )
        .optional()?;
    id.map(|id| load_route(&conn, id)).transpose()
}

pub fn update_route_status(
    db: &DbState,
    route_id: i64,
    next: RouteStatus,
    actor: &Claims,
) -> AppResult<DeliveryRoute> {
    let conn = db.lock()?;
    let route = load_route(&conn, route_id)?;
    match actor.role {
        Role::Driver if route.driver_id != actor.sub => {
            return Err(AppError::forbidden("This route is assigned to another driver"));
        }
        Role::Organiser => return Err(AppError::forbidden("Insufficient permissions")),
        _ => {}
    }
    if !route.status.can_become(next) {
        return Err(AppError::bad_request(format!(
            "Route cannot move from {} to {next}",
            route.status
        )));
    }
    let changed = conn.execute(
        "UPDATE delivery_routes SET status = ?1, updated_at = datetime('now')
         WHERE id = ?2 AND status = ?3",
        params![next, route_id, route.status],
    )?;
    if changed == 0 {
        return Err(AppError::conflict("Route was updated concurrently"));
    }
    info!(route_id, from = %route.status, to = %next, by = actor.sub, "route status updated");
    load_route(&conn, route_id)
}
