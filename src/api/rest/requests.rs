use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::driver::DriverSession;
use crate::models::round::{CancelOutcome, Decision, ResponseOutcome};
use crate::models::trip::{SubmitTrip, TripRequest};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/requests", post(submit_request))
        .route("/requests/:id", get(get_request))
        .route("/requests/:id/cancel", post(cancel_request))
        .route("/requests/:id/responses", post(respond_to_offer))
        .route("/requests/:id/pickup", post(confirm_pickup))
        .route("/requests/:id/delivered", post(confirm_delivery))
}

#[derive(Deserialize)]
pub struct CancelRequestBody {
    pub requester_id: Uuid,
}

#[derive(Deserialize)]
pub struct RespondBody {
    pub round: u32,
    pub decision: Decision,
}

#[derive(Serialize)]
pub struct OutcomeResponse<T> {
    pub outcome: T,
}

async fn submit_request(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<SubmitTrip>,
) -> Result<Json<TripRequest>, AppError> {
    let trip = state.coordinator.submit(payload).await?;
    Ok(Json(trip))
}

async fn get_request(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<TripRequest>, AppError> {
    let trip = state.coordinator.ledger().get(id).await?;
    Ok(Json(trip))
}

async fn cancel_request(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<CancelRequestBody>,
) -> Result<Json<OutcomeResponse<CancelOutcome>>, AppError> {
    let outcome = state.coordinator.cancel(id, payload.requester_id).await?;
    Ok(Json(OutcomeResponse { outcome }))
}

async fn respond_to_offer(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    session: DriverSession,
    Json(payload): Json<RespondBody>,
) -> Result<Json<OutcomeResponse<ResponseOutcome>>, AppError> {
    let outcome = state
        .coordinator
        .respond(session, id, payload.round, payload.decision)
        .await?;
    Ok(Json(OutcomeResponse { outcome }))
}

async fn confirm_pickup(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    session: DriverSession,
) -> Result<Json<TripRequest>, AppError> {
    let trip = state.coordinator.start_trip(session, id).await?;
    Ok(Json(trip))
}

async fn confirm_delivery(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    session: DriverSession,
) -> Result<Json<TripRequest>, AppError> {
    let trip = state.coordinator.deliver(session, id).await?;
    Ok(Json(trip))
}
