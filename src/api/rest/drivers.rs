use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, put};
use axum::Json;
use axum::Router;
use chrono::Utc;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::driver::{DriverLocationRecord, DriverSession, LocationUpdate};
use crate::models::round::DriverOffer;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/drivers", get(list_drivers))
        .route("/drivers/:id/location", put(update_location))
        .route("/drivers/:id/offer", get(get_offer))
}

async fn update_location(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<LocationUpdate>,
) -> Result<Json<DriverLocationRecord>, AppError> {
    if !payload.location.is_valid() {
        return Err(AppError::BadRequest("location is out of range".to_string()));
    }

    let record = state.geo.upsert(id, payload, Utc::now());
    Ok(Json(record))
}

async fn list_drivers(State(state): State<Arc<AppState>>) -> Json<Vec<DriverLocationRecord>> {
    Json(state.geo.all())
}

async fn get_offer(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Option<DriverOffer>>, AppError> {
    let offer = state
        .coordinator
        .current_offer(DriverSession::new(id))
        .await?;
    Ok(Json(offer))
}
