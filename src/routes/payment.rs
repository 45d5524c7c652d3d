use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use super::ApiJson;
use crate::checkout::{self, CheckoutPayload, CheckoutResponse};
use crate::discounts::{self, Verification};
use crate::error::AppResult;
use crate::state::AppState;
use crate::webhook;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyCouponRequest {
    pub code: String,
    #[serde(default)]
    pub subtotal: f64,
}

#[tracing::instrument(name = "POST /api/payment/create-checkout-session", skip_all)]
async fn create_checkout_session(
    State(state): State<AppState>,
    ApiJson(payload): ApiJson<CheckoutPayload>,
) -> AppResult<Json<CheckoutResponse>> {
    checkout::create_checkout_session(&state, payload)
        .await
        .map(Json)
}

#[tracing::instrument(name = "POST /api/payment/verify-coupon", skip(state))]
async fn verify_coupon(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<VerifyCouponRequest>,
) -> AppResult<Json<Verification>> {
    discounts::verify(&state.db, &req.code, req.subtotal).map(Json)
}

/// Provider callback. Needs the raw body for the signature check.
#[tracing::instrument(name = "POST /api/payment/webhook", skip_all)]
async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Bytes,
) -> Response {
    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok());

    match webhook::process(&state, &payload, signature).await {
        Ok(outcome) => {
            tracing::debug!(?outcome, "webhook handled");
            Json(json!({ "received": true })).into_response()
        }
        Err(msg) => {
            warn!(error = %msg, "webhook rejected");
            (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": format!("Webhook Error: {msg}") })),
            )
                .into_response()
        }
    }
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/create-checkout-session", post(create_checkout_session))
        .route("/verify-coupon", post(verify_coupon))
        .route("/webhook", post(stripe_webhook))
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use serde_json::json;

    use crate::routes::router;
    use crate::routes::test_client::send;
    use crate::test_support::{seed_products, TestApp};

    #[tokio::test]
    async fn checkout_returns_provider_url() {
        let app = TestApp::new();
        seed_products(&app.state.db);
        let router = router(app.state.clone());
        let (status, body) = send(
            &router,
            "POST",
            "/api/payment/create-checkout-session",
            None,
            Some(json!({
                "cart": [{ "id": 1, "price": 10, "quantity": 2 }],
                "customerInfo": {
                    "name": "Ann Customer",
                    "email": "ann@example.com",
                    "address": "1 Market St",
                    "postcode": "LS1 1AA",
                    "location": "leeds"
                }
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert!(body["url"].as_str().is_some());
        assert_eq!(body["finalTotal"], 20.0);
        assert_eq!(app.gateway.sessions()[0].amount_total(), 2000);
    }

    #[tokio::test]
    async fn unknown_coupon_is_rejected() {
        let app = TestApp::new();
        let router = router(app.state.clone());
        let (status, body) = send(
            &router,
            "POST",
            "/api/payment/verify-coupon",
            None,
            Some(json!({ "code": "NOPE", "subtotal": 20 })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().is_some());
    }

    #[tokio::test]
    async fn webhook_without_signature_is_a_400() {
        let app = TestApp::new();
        let router = router(app.state.clone());
        let (status, body) = send(
            &router,
            "POST",
            "/api/payment/webhook",
            None,
            Some(json!({ "id": "evt_1", "type": "checkout.session.completed" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Webhook Error: Missing Stripe-Signature header");
    }
}
