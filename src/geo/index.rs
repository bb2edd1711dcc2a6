use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use crate::geo::haversine_km;
use crate::models::driver::{DriverLocationRecord, GeoPoint, LocationUpdate};

/// Last-known driver positions, fed by the drivers' own clients.
///
/// Reads may observe slightly stale positions; freshness is enforced by timestamp
/// filtering at query time rather than by locking.
#[derive(Default)]
pub struct GeoIndex {
    records: DashMap<Uuid, DriverLocationRecord>,
}

impl GeoIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one feed entry. Updates older than the stored record are ignored so a
    /// delayed retry cannot roll a driver back to a previous position.
    ///
    /// The client's stamp is capped at `received_at`: a record never claims to be newer
    /// than the moment the server saw it.
    pub fn upsert(
        &self,
        driver_id: Uuid,
        update: LocationUpdate,
        received_at: DateTime<Utc>,
    ) -> DriverLocationRecord {
        let updated_at = update
            .updated_at
            .map_or(received_at, |at| at.min(received_at));
        let incoming = DriverLocationRecord {
            driver_id,
            location: update.location,
            capability_tags: update.capability_tags,
            available: update.available,
            active_trip_id: update.active_trip_id,
            updated_at,
        };

        let mut entry = self.records.entry(driver_id).or_insert_with(|| incoming.clone());
        if entry.updated_at <= updated_at {
            *entry = incoming;
        }
        entry.clone()
    }

    pub fn get(&self, driver_id: &Uuid) -> Option<DriverLocationRecord> {
        self.records.get(driver_id).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn all(&self) -> Vec<DriverLocationRecord> {
        self.records.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Records within `radius_km` of `center` that satisfy `keep`, paired with their distance.
    pub fn within_radius<F>(
        &self,
        center: &GeoPoint,
        radius_km: f64,
        keep: F,
    ) -> Vec<(DriverLocationRecord, f64)>
    where
        F: Fn(&DriverLocationRecord) -> bool,
    {
        self.records
            .iter()
            .filter(|entry| keep(entry.value()))
            .filter_map(|entry| {
                let distance_km = haversine_km(center, &entry.location);
                (distance_km <= radius_km).then(|| (entry.value().clone(), distance_km))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    use super::GeoIndex;
    use crate::geo::offset_north_km;
    use crate::models::driver::{GeoPoint, LocationUpdate};

    fn update(location: GeoPoint, at: chrono::DateTime<Utc>) -> LocationUpdate {
        LocationUpdate {
            location,
            capability_tags: vec!["crane".to_string()],
            available: true,
            active_trip_id: None,
            updated_at: Some(at),
        }
    }

    #[test]
    fn older_update_does_not_overwrite_newer_position() {
        let index = GeoIndex::new();
        let driver = Uuid::from_u128(1);
        let now = Utc::now();
        let here = GeoPoint { lat: 32.0, lng: 34.0 };
        let there = GeoPoint { lat: 32.5, lng: 34.5 };

        index.upsert(driver, update(here, now), now);
        let kept = index.upsert(driver, update(there, now - Duration::seconds(30)), now);

        assert_eq!(kept.location, here);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn future_stamp_does_not_outlive_going_offline() {
        let index = GeoIndex::new();
        let driver = Uuid::from_u128(7);
        let now = Utc::now();
        let here = GeoPoint { lat: 32.0, lng: 34.0 };

        let first = index.upsert(driver, update(here, now + Duration::days(1)), now);
        assert_eq!(first.updated_at, now);

        let later = now + Duration::seconds(5);
        let offline = LocationUpdate {
            available: false,
            updated_at: None,
            ..update(here, later)
        };
        let stored = index.upsert(driver, offline, later);

        assert!(!stored.available);
        assert_eq!(stored.updated_at, later);
        assert!(!stored.is_fresh(now + Duration::hours(6), Duration::minutes(5)));
    }

    #[test]
    fn radius_query_reports_distance() {
        let index = GeoIndex::new();
        let now = Utc::now();
        let center = GeoPoint {
            lat: 32.0853,
            lng: 34.7818,
        };
        index.upsert(Uuid::from_u128(1), update(offset_north_km(&center, 3.0), now), now);
        index.upsert(Uuid::from_u128(2), update(offset_north_km(&center, 12.0), now), now);

        let hits = index.within_radius(&center, 10.0, |_| true);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0.driver_id, Uuid::from_u128(1));
        assert!((hits[0].1 - 3.0).abs() < 1e-6);
    }
}
