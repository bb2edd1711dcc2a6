use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && self.lat.abs() <= 90.0
            && self.lng.abs() <= 180.0
    }
}

/// Last known position of one driver, as reported by the driver's own client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverLocationRecord {
    pub driver_id: Uuid,
    pub location: GeoPoint,
    pub capability_tags: Vec<String>,
    pub available: bool,
    pub active_trip_id: Option<Uuid>,
    pub updated_at: DateTime<Utc>,
}

impl DriverLocationRecord {
    pub fn is_fresh(&self, now: DateTime<Utc>, staleness: chrono::Duration) -> bool {
        self.updated_at >= now - staleness
    }

    pub fn has_capability(&self, tag: &str) -> bool {
        self.capability_tags.iter().any(|t| t.eq_ignore_ascii_case(tag))
    }
}

/// One entry of the driver location feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationUpdate {
    pub location: GeoPoint,
    #[serde(default)]
    pub capability_tags: Vec<String>,
    pub available: bool,
    #[serde(default)]
    pub active_trip_id: Option<Uuid>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Explicit driver context passed into every driver-facing engine call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverSession {
    pub driver_id: Uuid,
}

impl DriverSession {
    pub fn new(driver_id: Uuid) -> Self {
        Self { driver_id }
    }
}
