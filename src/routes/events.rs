use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};

use super::{ApiJson, AuthUser};
use crate::error::AppResult;
use crate::events::{
    self, Booking, BookingRequest, BookingResponse, Event, EventUpdate, NewEvent,
};
use crate::state::AppState;

async fn list_events(State(state): State<AppState>) -> AppResult<Json<Vec<Event>>> {
    events::list_events(&state.db, false).map(Json)
}

async fn get_event(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> AppResult<Json<Event>> {
    events::get_event(&state.db, id).map(Json)
}

#[tracing::instrument(name = "POST /api/events", skip_all)]
async fn create_event(
    State(state): State<AppState>,
    user: AuthUser,
    ApiJson(input): ApiJson<NewEvent>,
) -> AppResult<Json<Event>> {
    let actor = user.organiser_or_staff()?;
    events::create_event(&state.db, input, &actor).map(Json)
}

#[tracing::instrument(name = "PUT /api/events/{id}", skip(state, user, update))]
async fn update_event(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<i64>,
    ApiJson(update): ApiJson<EventUpdate>,
) -> AppResult<Json<Event>> {
    let actor = user.organiser_or_staff()?;
    events::update_event(&state.db, id, update, &actor).map(Json)
}

#[tracing::instrument(name = "DELETE /api/events/{id}", skip(state, user))]
async fn delete_event(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<i64>,
) -> AppResult<Json<Value>> {
    let actor = user.organiser_or_staff()?;
    let deleted = events::delete_event(&state.db, id, &actor)?;
    Ok(Json(json!({ "deleted": deleted, "deactivated": !deleted })))
}

#[tracing::instrument(name = "POST /api/events/{id}/book", skip(state, req))]
async fn book(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    ApiJson(req): ApiJson<BookingRequest>,
) -> AppResult<Json<BookingResponse>> {
    events::book(&state, id, req).await.map(Json)
}

async fn bookings(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<i64>,
) -> AppResult<Json<Vec<Booking>>> {
    let actor = user.organiser_or_staff()?;
    events::list_bookings(&state.db, id, &actor).map(Json)
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_events).post(create_event))
        .route(
            "/{id}",
            get(get_event).put(update_event).delete(delete_event),
        )
        .route("/{id}/book", post(book))
        .route("/{id}/bookings", get(bookings))
}
