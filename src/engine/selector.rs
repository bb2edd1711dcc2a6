use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::geo::index::GeoIndex;
use crate::models::driver::DriverLocationRecord;
use crate::models::trip::TripRequest;

/// Decides whether a driver can carry a request's required capability (crane, lift, vehicle class).
pub trait CapabilityLookup: Send + Sync {
    fn is_compatible(&self, required: &str, driver: &DriverLocationRecord) -> bool;
}

/// Compatibility by exact tag match against the driver's advertised capability tags.
#[derive(Debug, Default)]
pub struct TagCapabilities;

impl CapabilityLookup for TagCapabilities {
    fn is_compatible(&self, required: &str, driver: &DriverLocationRecord) -> bool {
        driver.has_capability(required)
    }
}

#[derive(Debug, Clone)]
pub struct Candidate {
    pub record: DriverLocationRecord,
    pub distance_km: f64,
    pub last_assigned_at: Option<DateTime<Utc>>,
}

impl Candidate {
    pub fn driver_id(&self) -> Uuid {
        self.record.driver_id
    }
}

/// Ledger-derived inputs to one selection.
#[derive(Debug, Default)]
pub struct SelectionContext<'a> {
    pub busy: Option<&'a HashSet<Uuid>>,
    pub last_assigned_at: Option<&'a HashMap<Uuid, DateTime<Utc>>>,
    pub exclude: &'a [Uuid],
}

pub struct CandidateSelector {
    geo: Arc<GeoIndex>,
    capabilities: Arc<dyn CapabilityLookup>,
    staleness: chrono::Duration,
}

impl CandidateSelector {
    pub fn new(
        geo: Arc<GeoIndex>,
        capabilities: Arc<dyn CapabilityLookup>,
        staleness: chrono::Duration,
    ) -> Self {
        Self {
            geo,
            capabilities,
            staleness,
        }
    }

    /// Eligible drivers around the request's pickup, nearest first.
    ///
    /// Ties on distance go to the driver who has waited longest since their last
    /// assignment (never-assigned first), then to the lower driver id.
    pub fn find_candidates(
        &self,
        request: &TripRequest,
        max_radius_km: f64,
        max_count: usize,
        now: DateTime<Utc>,
        ctx: &SelectionContext<'_>,
    ) -> Vec<Candidate> {
        let eligible = |record: &DriverLocationRecord| {
            record.available
                && record.active_trip_id.is_none()
                && record.is_fresh(now, self.staleness)
                && !ctx.exclude.contains(&record.driver_id)
                && !ctx.busy.is_some_and(|busy| busy.contains(&record.driver_id))
                && request
                    .required_capability
                    .as_deref()
                    .is_none_or(|tag| self.capabilities.is_compatible(tag, record))
        };

        let mut candidates: Vec<Candidate> = self
            .geo
            .within_radius(&request.pickup.location, max_radius_km, eligible)
            .into_iter()
            .map(|(record, distance_km)| Candidate {
                last_assigned_at: ctx
                    .last_assigned_at
                    .and_then(|map| map.get(&record.driver_id).copied()),
                record,
                distance_km,
            })
            .collect();

        candidates.sort_by(rank);
        candidates.truncate(max_count);
        candidates
    }
}

fn rank(a: &Candidate, b: &Candidate) -> Ordering {
    a.distance_km
        .total_cmp(&b.distance_km)
        .then_with(|| a.last_assigned_at.cmp(&b.last_assigned_at))
        .then_with(|| a.record.driver_id.cmp(&b.record.driver_id))
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};
    use std::sync::Arc;

    use chrono::{Duration, Utc};
    use uuid::Uuid;

    use super::{CandidateSelector, SelectionContext, TagCapabilities};
    use crate::geo::index::GeoIndex;
    use crate::geo::offset_north_km;
    use crate::models::driver::{GeoPoint, LocationUpdate};
    use crate::models::trip::{Material, Stop, SubmitTrip, TimingMode, TripRequest};

    const PICKUP: GeoPoint = GeoPoint {
        lat: 32.0853,
        lng: 34.7818,
    };

    fn request(capability: Option<&str>) -> TripRequest {
        TripRequest::new(
            SubmitTrip {
                requester_id: Uuid::new_v4(),
                pickup: Stop {
                    location: PICKUP,
                    address: "Yard 4".to_string(),
                },
                delivery: Stop {
                    location: offset_north_km(&PICKUP, 6.0),
                    address: "Site B".to_string(),
                },
                material: Material {
                    description: "steel beams".to_string(),
                    quantity: Some(12.0),
                    unit: Some("pcs".to_string()),
                },
                required_capability: capability.map(str::to_string),
                timing: TimingMode::Asap,
                scheduled_for: None,
                quoted_price: Some(450.0),
            },
            Utc::now(),
        )
    }

    fn driver(index: &GeoIndex, seed: u128, km: f64, tags: &[&str]) -> Uuid {
        let id = Uuid::from_u128(seed);
        index.upsert(
            id,
            LocationUpdate {
                location: offset_north_km(&PICKUP, km),
                capability_tags: tags.iter().map(|t| t.to_string()).collect(),
                available: true,
                active_trip_id: None,
                updated_at: None,
            },
            Utc::now(),
        );
        id
    }

    fn selector(index: Arc<GeoIndex>) -> CandidateSelector {
        CandidateSelector::new(index, Arc::new(TagCapabilities), Duration::minutes(5))
    }

    #[test]
    fn radius_filter_keeps_nearest_first() {
        let index = Arc::new(GeoIndex::new());
        let near = driver(&index, 1, 2.0, &[]);
        let mid = driver(&index, 2, 4.0, &[]);
        driver(&index, 3, 11.0, &[]);

        let found = selector(index).find_candidates(
            &request(None),
            10.0,
            10,
            Utc::now(),
            &SelectionContext::default(),
        );

        let ids: Vec<Uuid> = found.iter().map(|c| c.driver_id()).collect();
        assert_eq!(ids, vec![near, mid]);
    }

    #[test]
    fn excludes_unavailable_busy_and_stale_drivers() {
        let index = Arc::new(GeoIndex::new());
        let now = Utc::now();
        let eligible = driver(&index, 1, 1.0, &[]);

        let on_trip = Uuid::from_u128(2);
        index.upsert(
            on_trip,
            LocationUpdate {
                location: offset_north_km(&PICKUP, 1.0),
                capability_tags: vec![],
                available: true,
                active_trip_id: Some(Uuid::new_v4()),
                updated_at: None,
            },
            now,
        );
        let stale = Uuid::from_u128(3);
        index.upsert(
            stale,
            LocationUpdate {
                location: offset_north_km(&PICKUP, 1.0),
                capability_tags: vec![],
                available: true,
                active_trip_id: None,
                updated_at: Some(now - Duration::minutes(6)),
            },
            now,
        );
        let offline = Uuid::from_u128(4);
        index.upsert(
            offline,
            LocationUpdate {
                location: offset_north_km(&PICKUP, 1.0),
                capability_tags: vec![],
                available: false,
                active_trip_id: None,
                updated_at: None,
            },
            now,
        );
        let committed = driver(&index, 5, 1.0, &[]);
        let busy: HashSet<Uuid> = [committed].into_iter().collect();

        let found = selector(index).find_candidates(
            &request(None),
            10.0,
            10,
            now,
            &SelectionContext {
                busy: Some(&busy),
                ..SelectionContext::default()
            },
        );

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].driver_id(), eligible);
    }

    #[test]
    fn required_capability_must_be_carried() {
        let index = Arc::new(GeoIndex::new());
        driver(&index, 1, 1.0, &["flatbed"]);
        let crane = driver(&index, 2, 3.0, &["flatbed", "Crane"]);

        let found = selector(index).find_candidates(
            &request(Some("crane")),
            10.0,
            10,
            Utc::now(),
            &SelectionContext::default(),
        );

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].driver_id(), crane);
    }

    #[test]
    fn equal_distance_prefers_longest_idle_then_lowest_id() {
        let index = Arc::new(GeoIndex::new());
        let recent = driver(&index, 1, 3.0, &[]);
        let earlier = driver(&index, 2, 3.0, &[]);
        let never_a = driver(&index, 4, 3.0, &[]);
        let never_b = driver(&index, 3, 3.0, &[]);
        let now = Utc::now();
        let last: HashMap<Uuid, _> = [
            (recent, now - Duration::minutes(5)),
            (earlier, now - Duration::hours(2)),
        ]
        .into_iter()
        .collect();

        let found = selector(index).find_candidates(
            &request(None),
            10.0,
            10,
            now,
            &SelectionContext {
                last_assigned_at: Some(&last),
                ..SelectionContext::default()
            },
        );

        let ids: Vec<Uuid> = found.iter().map(|c| c.driver_id()).collect();
        assert_eq!(ids, vec![never_b, never_a, earlier, recent]);
    }

    #[test]
    fn max_count_truncates_after_ranking() {
        let index = Arc::new(GeoIndex::new());
        let nearest = driver(&index, 9, 0.5, &[]);
        driver(&index, 1, 5.0, &[]);
        driver(&index, 2, 6.0, &[]);

        let found = selector(index).find_candidates(
            &request(None),
            10.0,
            1,
            Utc::now(),
            &SelectionContext::default(),
        );

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].driver_id(), nearest);
    }
}
