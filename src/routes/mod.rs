//! HTTP surface.
//!
//! Each submodule owns one area of `/api` and exposes `routes()`; [`router`]
//! nests them and attaches the CORS and tracing layers. Handlers are thin:
//! they extract, check the caller's role, and delegate to the domain module.

use axum::{
    extract::{FromRequest, FromRequestParts, State},
    http::{header::AUTHORIZATION, request::Parts, HeaderValue, Method},
    routing::get,
    Json, Router,
};
use serde_json::Value;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::auth::{self, Claims};
use crate::diagnostics;
use crate::error::{AppError, AppResult};
use crate::models::Role;
use crate::state::AppState;

pub mod admin;
pub mod catalogue;
pub mod delivery;
pub mod events;
pub mod feedback;
pub mod orders;
pub mod payment;

// ---------------------------------------------------------------------------
// Extractors
// ---------------------------------------------------------------------------

/// JSON body whose rejection is answered as a 400 `{"error": ...}`.
#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(AppError))]
pub struct ApiJson<T>(pub T);

/// Caller authenticated by a bearer token.
#[derive(Debug, Clone)]
pub struct AuthUser(pub Claims);

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| AppError::unauthorized("Missing bearer token"))?;
        let claims = auth::verify_token(&state.config.jwt_secret, token)?;
        auth::current_claims(&state.db, claims).map(AuthUser)
    }
}

impl AuthUser {
    /// Shop staff (admin or super admin).
    pub fn staff(self) -> AppResult<Claims> {
        if self.0.role.is_staff() {
            Ok(self.0)
        } else {
            Err(AppError::forbidden("Staff access required"))
        }
    }

    pub fn super_admin(self) -> AppResult<Claims> {
        if self.0.role == Role::SuperAdmin {
            Ok(self.0)
        } else {
            Err(AppError::forbidden("Super admin access required"))
        }
    }

    pub fn driver(self) -> AppResult<Claims> {
        if self.0.role == Role::Driver {
            Ok(self.0)
        } else {
            Err(AppError::forbidden("Driver access required"))
        }
    }

    pub fn staff_or_driver(self) -> AppResult<Claims> {
        if self.0.role.is_staff() || self.0.role == Role::Driver {
            Ok(self.0)
        } else {
            Err(AppError::forbidden("Insufficient permissions"))
        }
    }

    pub fn organiser_or_staff(self) -> AppResult<Claims> {
        if self.0.role.is_staff() || self.0.role == Role::Organiser {
            Ok(self.0)
        } else {
            Err(AppError::forbidden("Organiser or staff access required"))
        }
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

#[tracing::instrument(name = "GET /api/health", skip(state))]
async fn health(State(state): State<AppState>) -> AppResult<Json<Value>> {
    diagnostics::get_health(&state.db).map(Json)
}

fn cors(origin: &str) -> CorsLayer {
    let allow_origin = match origin {
        "*" => AllowOrigin::any(),
        origin => match HeaderValue::from_str(origin) {
            Ok(origin) => AllowOrigin::exact(origin),
            Err(_) => {
                warn!(origin, "invalid CORS_ORIGIN, allowing any origin");
                AllowOrigin::any()
            }
        },
    };
    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any)
}

pub fn router(state: AppState) -> Router {
    let cors = cors(&state.config.cors_origin);
    Router::new()
        .route("/api/health", get(health))
        .nest("/api/payment", payment::routes())
        .nest("/api/products", catalogue::product_routes())
        .nest("/api/categories", catalogue::category_routes())
        .nest("/api/orders", orders::routes())
        .nest("/api/admin", admin::routes())
        .nest("/api/delivery", delivery::routes())
        .nest("/api/feedback", feedback::routes())
        .nest("/api/events", events::routes())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
pub(crate) mod test_client {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use axum::Router;
    use serde_json::Value;
    use tower::ServiceExt;

    /// Send one request through `app` and decode the JSON answer.
    pub async fn send(
        app: &Router,
        method: &str,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }
}

#[cfg(test)]
mod tests {
    use super::test_client::send;
    use super::*;
    use crate::models::Location;
    use crate::test_support::TestApp;
    use axum::http::StatusCode;

    #[tokio::test]
    async fn health_reports_schema() {
        let app = TestApp::new();
        let router = router(app.state.clone());
        let (status, body) = send(&router, "GET", "/api/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert!(body["schemaVersion"].as_i64().unwrap() > 0);
    }

    #[tokio::test]
    async fn protected_routes_need_a_token() {
        let app = TestApp::new();
        let router = router(app.state.clone());
        let (status, body) = send(&router, "GET", "/api/orders", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "Missing bearer token");

        let (status, _) = send(&router, "GET", "/api/orders", Some("not-a-jwt"), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn roles_are_enforced() {
        let app = TestApp::new();
        let router = router(app.state.clone());
        let (_, driver) = app.login_as(Role::Driver, Some(Location::Leeds));
        let (status, _) = send(&router, "GET", "/api/orders", Some(&driver), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (_, admin) = app.login_as(Role::Admin, None);
        let (status, _) = send(&router, "GET", "/api/admin/users", Some(&admin), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (status, _) = send(&router, "GET", "/api/orders", Some(&admin), None).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn demoted_accounts_lose_access_immediately() {
        let app = TestApp::new();
        let router = router(app.state.clone());
        let (id, token) = app.login_as(Role::Admin, None);
        let (status, _) = send(&router, "GET", "/api/orders", Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);

        app.state
            .db
            .conn
            .lock()
            .unwrap()
            .execute("UPDATE admin_users SET role = 'driver' WHERE id = ?1", [id])
            .unwrap();
        let (status, _) = send(&router, "GET", "/api/orders", Some(&token), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        app.state
            .db
            .conn
            .lock()
            .unwrap()
            .execute("DELETE FROM admin_users WHERE id = ?1", [id])
            .unwrap();
        let (status, body) = send(&router, "GET", "/api/orders", Some(&token), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "Account no longer exists");
    }

    #[tokio::test]
    async fn malformed_json_is_a_bad_request() {
        let app = TestApp::new();
        let router = router(app.state.clone());
        let (status, body) = send(
            &router,
            "POST",
            "/api/payment/verify-coupon",
            None,
            Some(serde_json::json!({ "subtotal": 10 })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("code"));
    }
}
