//! `/api/admin`: login, staff accounts, stock movements, coupons and the
//! feedback inbox.

use axum::{
    extract::{Path, Query, State},
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

use super::{ApiJson, AuthUser};
use crate::auth::{self, AdminUser, LoginResponse, NewUser, UserUpdate};
use crate::discounts::{self, Coupon, NewCoupon, TestCoupon};
use crate::error::AppResult;
use crate::feedback::{self, FeedbackEntry};
use crate::inventory::{self, DeliveryRequest, LowStockItem, StockLevels, TransferRequest};
use crate::models::Location;
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[tracing::instrument(name = "POST /api/admin/login", skip_all)]
async fn login(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<LoginRequest>,
) -> AppResult<Json<LoginResponse>> {
    auth::login(&state.db, &state.config.jwt_secret, &req.email, &req.password).map(Json)
}

async fn me(State(state): State<AppState>, user: AuthUser) -> AppResult<Json<AdminUser>> {
    auth::get_user(&state.db, user.0.sub).map(Json)
}

// ---------------------------------------------------------------------------
// Users
// ---------------------------------------------------------------------------

async fn list_users(
    State(state): State<AppState>,
    user: AuthUser,
) -> AppResult<Json<Vec<AdminUser>>> {
    user.super_admin()?;
    auth::list_users(&state.db).map(Json)
}

#[tracing::instrument(name = "POST /api/admin/users", skip_all)]
async fn create_user(
    State(state): State<AppState>,
    user: AuthUser,
    ApiJson(input): ApiJson<NewUser>,
) -> AppResult<Json<AdminUser>> {
    user.super_admin()?;
    auth::create_user(&state.db, input).map(Json)
}

#[tracing::instrument(name = "PUT /api/admin/users/{id}", skip(state, user, update))]
async fn update_user(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<i64>,
    ApiJson(update): ApiJson<UserUpdate>,
) -> AppResult<Json<AdminUser>> {
    user.super_admin()?;
    auth::update_user(&state.db, id, update).map(Json)
}

#[tracing::instrument(name = "DELETE /api/admin/users/{id}", skip(state, user))]
async fn delete_user(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<i64>,
) -> AppResult<Json<Value>> {
    let actor = user.super_admin()?;
    auth::delete_user(&state.db, id, actor.sub)?;
    Ok(Json(json!({ "deleted": true })))
}

#[derive(Debug, Default, Deserialize)]
pub struct LocationQuery {
    #[serde(default)]
    pub location: Option<Location>,
}

async fn list_drivers(
    State(state): State<AppState>,
    user: AuthUser,
    Query(query): Query<LocationQuery>,
) -> AppResult<Json<Vec<AdminUser>>> {
    let actor = user.staff()?;
    auth::list_drivers(&state.db, actor.location.or(query.location)).map(Json)
}

// ---------------------------------------------------------------------------
// Inventory
// ---------------------------------------------------------------------------

#[tracing::instrument(name = "POST /api/admin/inventory/transfer", skip(state, user))]
async fn transfer_stock(
    State(state): State<AppState>,
    user: AuthUser,
    ApiJson(req): ApiJson<TransferRequest>,
) -> AppResult<Json<StockLevels>> {
    let actor = user.staff()?;
    inventory::transfer(&state.db, &req, Some(actor.sub)).map(Json)
}

#[tracing::instrument(name = "POST /api/admin/inventory/deliveries", skip(state, user))]
async fn record_delivery(
    State(state): State<AppState>,
    user: AuthUser,
    ApiJson(req): ApiJson<DeliveryRequest>,
) -> AppResult<Json<StockLevels>> {
    let actor = user.staff()?;
    inventory::record_delivery(&state.db, &req, Some(actor.sub)).map(Json)
}

async fn low_stock(
    State(state): State<AppState>,
    user: AuthUser,
    Query(query): Query<LocationQuery>,
) -> AppResult<Json<Vec<LowStockItem>>> {
    let actor = user.staff()?;
    inventory::low_stock(
        &state.db,
        actor.location.or(query.location),
        state.config.low_stock_threshold,
    )
    .map(Json)
}

// ---------------------------------------------------------------------------
// Coupons
// ---------------------------------------------------------------------------

async fn list_coupons(
    State(state): State<AppState>,
    user: AuthUser,
) -> AppResult<Json<Vec<Coupon>>> {
    user.staff()?;
    discounts::list_coupons(&state.db).map(Json)
}

#[tracing::instrument(name = "POST /api/admin/coupons", skip(state, user))]
async fn create_coupon(
    State(state): State<AppState>,
    user: AuthUser,
    ApiJson(input): ApiJson<NewCoupon>,
) -> AppResult<Json<Coupon>> {
    user.staff()?;
    discounts::create_coupon(&state.db, input).map(Json)
}

async fn delete_coupon(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<i64>,
) -> AppResult<Json<Value>> {
    user.staff()?;
    discounts::delete_coupon(&state.db, id)?;
    Ok(Json(json!({ "deleted": true })))
}

#[derive(Debug, Default, Deserialize)]
pub struct TestCouponRequest {
    #[serde(default)]
    pub code: Option<String>,
}

#[tracing::instrument(name = "POST /api/admin/test-coupons", skip(state, user))]
async fn create_test_coupon(
    State(state): State<AppState>,
    user: AuthUser,
    ApiJson(req): ApiJson<TestCouponRequest>,
) -> AppResult<Json<TestCoupon>> {
    user.staff()?;
    discounts::create_test_coupon(&state.db, req.code.as_deref()).map(Json)
}

async fn list_feedback(
    State(state): State<AppState>,
    user: AuthUser,
) -> AppResult<Json<Vec<FeedbackEntry>>> {
    user.staff()?;
    feedback::list_feedback(&state.db).map(Json)
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/login", post(login))
        .route("/me", get(me))
        .route("/users", get(list_users).post(create_user))
        .route("/users/{id}", put(update_user).delete(delete_user))
        .route("/drivers", get(list_drivers))
        .route("/inventory/transfer", post(transfer_stock))
        .route("/inventory/deliveries", post(record_delivery))
        .route("/inventory/low-stock", get(low_stock))
        .route("/coupons", get(list_coupons).post(create_coupon))
        .route("/coupons/{id}", delete(delete_coupon))
        .route("/test-coupons", post(create_test_coupon))
        .route("/feedback", get(list_feedback))
}
