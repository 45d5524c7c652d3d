use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};

use super::ApiJson;
use crate::error::AppResult;
use crate::feedback::{self, FeedbackReceipt, FeedbackRequest, FeedbackStatus};
use crate::state::AppState;

#[tracing::instrument(name = "POST /api/feedback", skip_all)]
async fn submit(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<FeedbackRequest>,
) -> AppResult<Json<FeedbackReceipt>> {
    feedback::submit_feedback(&state, req).await.map(Json)
}

async fn check(
    State(state): State<AppState>,
    Path(order_id): Path<i64>,
) -> AppResult<Json<FeedbackStatus>> {
    feedback::check_feedback(&state.db, order_id).map(Json)
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", post(submit))
        .route("/check/{order_id}", get(check))
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use serde_json::json;

    use crate::models::{Location, OrderStatus};
    use crate::routes::router;
    use crate::routes::test_client::send;
    use crate::test_support::{seed_order, seed_products, TestApp};

    #[tokio::test]
    async fn second_submission_is_rejected() {
        let app = TestApp::new();
        seed_products(&app.state.db);
        let id = seed_order(&app.state.db, Location::Leeds, OrderStatus::Delivered);
        let router = router(app.state.clone());
        let body = json!({ "orderId": id, "email": "ann@example.com", "rating": 4 });

        let (status, _) = send(&router, "GET", &format!("/api/feedback/check/{id}"), None, None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, receipt) = send(&router, "POST", "/api/feedback", None, Some(body.clone())).await;
        assert_eq!(status, StatusCode::OK, "{receipt}");
        assert!(receipt["couponCode"].as_str().unwrap().starts_with("THANKS-"));

        let (status, err) = send(&router, "POST", "/api/feedback", None, Some(body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(err["error"], "Feedback already submitted for this order");

        let (_, check) = send(&router, "GET", &format!("/api/feedback/check/{id}"), None, None).await;
        assert_eq!(check["submitted"], true);
        assert_eq!(check["eligible"], false);
    }
}
