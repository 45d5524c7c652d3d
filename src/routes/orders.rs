use axum::{
    extract::{Path, Query, State},
    routing::{get, put},
    Json, Router,
};
use serde::Deserialize;

use super::{ApiJson, AuthUser};
use crate::auth::Claims;
use crate::error::{AppError, AppResult};
use crate::models::{Order, OrderStatus};
use crate::orders::placement::{self, ManualOrderPayload};
use crate::orders::{self, workflow, OrderFilter, OrderWithItems};
use crate::state::AppState;

/// A location-bound admin only sees their own shop.
fn check_location(order: &Order, actor: &Claims) -> AppResult<()> {
    match actor.location {
        Some(bound) if bound != order.location => Err(AppError::forbidden(format!(
            "Order #{} belongs to the {} shop",
            order.id, order.location
        ))),
        _ => Ok(()),
    }
}

async fn list_orders(
    State(state): State<AppState>,
    user: AuthUser,
    Query(mut filter): Query<OrderFilter>,
) -> AppResult<Json<Vec<OrderWithItems>>> {
    let actor = user.staff()?;
    if actor.location.is_some() {
        filter.location = actor.location;
    }
    orders::list(&state.db, &filter).map(Json)
}

async fn get_order(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<i64>,
) -> AppResult<Json<OrderWithItems>> {
    let actor = user.staff()?;
    let order = orders::find(&state.db, id)?;
    check_location(&order.order, &actor)?;
    Ok(Json(order))
}

/// Success page lookup. The session id is the capability.
async fn order_by_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> AppResult<Json<OrderWithItems>> {
    orders::by_session(&state.db, &session_id).map(Json)
}

#[tracing::instrument(name = "POST /api/orders", skip_all)]
async fn create_order(
    State(state): State<AppState>,
    user: AuthUser,
    ApiJson(payload): ApiJson<ManualOrderPayload>,
) -> AppResult<Json<OrderWithItems>> {
    let actor = user.staff()?;
    let placed = placement::create_manual_order(
        &state.db,
        payload,
        &actor,
        state.config.low_stock_threshold,
    )?;
    placement::announce(&state.notifier, &placed).await;
    Ok(Json(OrderWithItems {
        order: placed.order,
        items: placed.items,
    }))
}

#[derive(Debug, Deserialize)]
pub struct StatusChange {
    pub status: OrderStatus,
}

#[tracing::instrument(name = "PUT /api/orders/{id}/status", skip(state, user))]
async fn update_status(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<i64>,
    ApiJson(change): ApiJson<StatusChange>,
) -> AppResult<Json<Order>> {
    let actor = user.staff_or_driver()?;
    workflow::update_status(&state, id, change.status, &actor)
        .await
        .map(Json)
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_orders).post(create_order))
        .route("/{id}", get(get_order))
        .route("/session/{session_id}", get(order_by_session))
        .route("/{id}/status", put(update_status))
}
