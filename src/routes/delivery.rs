use axum::{
    extract::{Path, Query, State},
    routing::{get, post, put},
    Json, Router,
};
use serde::Deserialize;

use super::{ApiJson, AuthUser};
use crate::delivery::{self, AssignRequest, DeliveryRoute, GenerateRequest, GeneratedRoutes};
use crate::error::AppResult;
use crate::models::RouteStatus;
use crate::state::AppState;

#[tracing::instrument(name = "POST /api/delivery/routes/generate", skip(state, user))]
async fn generate(
    State(state): State<AppState>,
    user: AuthUser,
    ApiJson(req): ApiJson<GenerateRequest>,
) -> AppResult<Json<GeneratedRoutes>> {
    let actor = user.staff()?;
    delivery::generate_routes(&state, req, &actor).await.map(Json)
}

#[tracing::instrument(name = "POST /api/delivery/routes/assign", skip(state, user))]
async fn assign(
    State(state): State<AppState>,
    user: AuthUser,
    ApiJson(req): ApiJson<AssignRequest>,
) -> AppResult<Json<DeliveryRoute>> {
    let actor = user.staff()?;
    delivery::assign_route(&state.db, req, &actor).map(Json)
}

#[derive(Debug, Default, Deserialize)]
pub struct RouteQuery {
    #[serde(default)]
    pub status: Option<RouteStatus>,
}

async fn list(
    State(state): State<AppState>,
    user: AuthUser,
    Query(query): Query<RouteQuery>,
) -> AppResult<Json<Vec<DeliveryRoute>>> {
    user.staff()?;
    delivery::list_routes(&state.db, query.status).map(Json)
}

/// `null` when the driver has nothing open.
async fn my_route(
    State(state): State<AppState>,
    user: AuthUser,
) -> AppResult<Json<Option<DeliveryRoute>>> {
    let driver = user.driver()?;
    delivery::my_route(&state.db, driver.sub).map(Json)
}

#[derive(Debug, Deserialize)]
pub struct RouteStatusChange {
    pub status: RouteStatus,
}

#[tracing::instrument(name = "PUT /api/delivery/routes/{id}/status", skip(state, user))]
async fn update_status(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<i64>,
    ApiJson(change): ApiJson<RouteStatusChange>,
) -> AppResult<Json<DeliveryRoute>> {
    let actor = user.staff_or_driver()?;
    delivery::update_route_status(&state.db, id, change.status, &actor).map(Json)
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/routes", get(list))
        .route("/routes/generate", post(generate))
        .route("/routes/assign", post(assign))
        .route("/routes/{id}/status", put(update_status))
        .route("/my-route", get(my_route))
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use serde_json::{json, Value};

    use crate::models::{Location, OrderStatus, Role};
    use crate::routes::router;
    use crate::routes::test_client::send;
    use crate::test_support::{seed_order, seed_products, TestApp};

    #[tokio::test]
    async fn assigned_route_reaches_the_driver() {
        let app = TestApp::new();
        seed_products(&app.state.db);
        let first = seed_order(&app.state.db, Location::Leeds, OrderStatus::Ready);
        let second = seed_order(&app.state.db, Location::Leeds, OrderStatus::Ready);
        let router = router(app.state.clone());
        let (_, admin) = app.login_as(Role::Admin, None);
        let (driver_id, driver) = app.login_as(Role::Driver, Some(Location::Leeds));

        let (status, body) = send(&router, "GET", "/api/delivery/my-route", Some(&driver), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, Value::Null);

        let (status, route) = send(
            &router,
            "POST",
            "/api/delivery/routes/assign",
            Some(&admin),
            Some(json!({ "driverId": driver_id, "orderIds": [second, first] })),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{route}");
        let route_id = route["id"].as_i64().unwrap();

        let (_, mine) = send(&router, "GET", "/api/delivery/my-route", Some(&driver), None).await;
        assert_eq!(mine["id"], route_id);
        assert_eq!(mine["orders"][0]["id"], second);

        let (status, updated) = send(
            &router,
            "PUT",
            &format!("/api/delivery/routes/{route_id}/status"),
            Some(&driver),
            Some(json!({ "status": "in_progress" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(updated["status"], "in_progress");

        let (status, _) = send(&router, "GET", "/api/delivery/routes", Some(&driver), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn my_route_is_for_drivers() {
        let app = TestApp::new();
        let router = router(app.state.clone());
        let (_, admin) = app.login_as(Role::Admin, None);
        let (status, _) = send(&router, "GET", "/api/delivery/my-route", Some(&admin), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }
}
