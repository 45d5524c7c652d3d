use axum::{
    extract::{Path, Query, State},
    routing::{get, put},
    Json, Router,
};
use serde_json::{json, Value};

use super::{ApiJson, AuthUser};
use crate::error::AppResult;
use crate::inventory::{self, InventoryUpdate, StockLevels};
use crate::products::{
    self, Category, CategoryInput, NewProduct, Product, ProductFilter, ProductRating,
    ProductUpdate,
};
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Products
// ---------------------------------------------------------------------------

async fn list_products(
    State(state): State<AppState>,
    Query(filter): Query<ProductFilter>,
) -> AppResult<Json<Vec<Product>>> {
    products::list_products(&state.db, &filter).map(Json)
}

async fn get_product(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> AppResult<Json<Product>> {
    products::get_product(&state.db, id).map(Json)
}

async fn product_rating(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> AppResult<Json<ProductRating>> {
    products::product_rating(&state.db, id).map(Json)
}

#[tracing::instrument(name = "POST /api/products", skip_all)]
async fn create_product(
    State(state): State<AppState>,
    user: AuthUser,
    ApiJson(input): ApiJson<NewProduct>,
) -> AppResult<Json<Product>> {
    user.staff()?;
    products::create_product(&state.db, input).map(Json)
}

#[tracing::instrument(name = "PUT /api/products/{id}", skip(state, user, update))]
async fn update_product(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<i64>,
    ApiJson(update): ApiJson<ProductUpdate>,
) -> AppResult<Json<Product>> {
    user.staff()?;
    products::update_product(&state.db, id, update).map(Json)
}

#[tracing::instrument(name = "DELETE /api/products/{id}", skip(state, user))]
async fn delete_product(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<i64>,
) -> AppResult<Json<Value>> {
    user.staff()?;
    let deleted = products::delete_product(&state.db, id)?;
    Ok(Json(json!({ "deleted": deleted, "deactivated": !deleted })))
}

#[tracing::instrument(name = "PUT /api/products/{id}/inventory", skip(state, user))]
async fn set_inventory(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<i64>,
    ApiJson(update): ApiJson<InventoryUpdate>,
) -> AppResult<Json<StockLevels>> {
    user.staff()?;
    inventory::set_inventory(&state.db, id, &update).map(Json)
}

pub fn product_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_products).post(create_product))
        .route(
            "/{id}",
            get(get_product).put(update_product).delete(delete_product),
        )
        .route("/{id}/rating", get(product_rating))
        .route("/{id}/inventory", put(set_inventory))
}

// ---------------------------------------------------------------------------
// Categories
// ---------------------------------------------------------------------------

async fn list_categories(State(state): State<AppState>) -> AppResult<Json<Vec<Category>>> {
    products::list_categories(&state.db).map(Json)
}

async fn create_category(
    State(state): State<AppState>,
    user: AuthUser,
    ApiJson(input): ApiJson<CategoryInput>,
) -> AppResult<Json<Category>> {
    user.staff()?;
    products::create_category(&state.db, input).map(Json)
}

async fn update_category(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<i64>,
    ApiJson(input): ApiJson<CategoryInput>,
) -> AppResult<Json<Category>> {
    user.staff()?;
    products::update_category(&state.db, id, input).map(Json)
}

async fn delete_category(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<i64>,
) -> AppResult<Json<Value>> {
    user.staff()?;
    products::delete_category(&state.db, id)?;
    Ok(Json(json!({ "deleted": true })))
}

pub fn category_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_categories).post(create_category))
        .route("/{id}", put(update_category).delete(delete_category))
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use serde_json::json;

    use crate::models::Role;
    use crate::routes::router;
    use crate::routes::test_client::send;
    use crate::test_support::{seed_products, TestApp};

    #[tokio::test]
    async fn public_listing_hides_inactive_products() {
        let app = TestApp::new();
        seed_products(&app.state.db);
        let router = router(app.state.clone());
        let (status, body) = send(&router, "GET", "/api/products", None, None).await;
        assert_eq!(status, StatusCode::OK);
        let names: Vec<&str> = body
            .as_array()
            .unwrap()
            .iter()
            .map(|p| p["name"].as_str().unwrap())
            .collect();
        assert!(names.contains(&"Steak pie"));
        assert!(!names.contains(&"Retired pie"));
    }

    #[tokio::test]
    async fn staff_edit_inventory() {
        let app = TestApp::new();
        seed_products(&app.state.db);
        let router = router(app.state.clone());
        let body = json!({ "leeds": 3 });

        let (status, _) =
            send(&router, "PUT", "/api/products/1/inventory", None, Some(body.clone())).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (_, token) = app.login_as(Role::Admin, None);
        let (status, levels) =
            send(&router, "PUT", "/api/products/1/inventory", Some(&token), Some(body)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(levels["leeds"], 3);
        assert_eq!(levels["derby"], 20);
    }

    #[tokio::test]
    async fn categories_are_public_to_read() {
        let app = TestApp::new();
        seed_products(&app.state.db);
        let router = router(app.state.clone());
        let (status, body) = send(&router, "GET", "/api/categories", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 2);
    }
}
