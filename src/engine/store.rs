use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::trip::{Guard, Transition, TripRequest, TripStatus};

/// Result of a conditional write. `Stale` carries the record as it was when the guard refused it.
#[derive(Debug, Clone)]
pub enum WriteResult {
    Applied(TripRequest),
    Stale(TripRequest),
}

impl WriteResult {
    pub fn is_applied(&self) -> bool {
        matches!(self, WriteResult::Applied(_))
    }
}

/// Request store backing the ledger.
///
/// `update_if` is the only mutation of an existing record and must be atomic: the guard is
/// evaluated and the transition applied without any other writer interleaving. Among N
/// concurrent calls whose guards admit the same prior state, exactly one observes `Applied`.
#[async_trait]
pub trait TripStore: Send + Sync {
    async fn insert(&self, trip: TripRequest) -> Result<(), StoreError>;

    async fn get(&self, id: Uuid) -> Result<TripRequest, StoreError>;

    async fn list(&self, statuses: &[TripStatus]) -> Result<Vec<TripRequest>, StoreError>;

    async fn update_if(
        &self,
        id: Uuid,
        guard: &Guard,
        transition: &Transition,
        now: DateTime<Utc>,
    ) -> Result<WriteResult, StoreError>;

    async fn count(&self) -> Result<usize, StoreError>;
}

#[derive(Default)]
pub struct InMemoryTripStore {
    trips: DashMap<Uuid, TripRequest>,
}

impl InMemoryTripStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TripStore for InMemoryTripStore {
    async fn insert(&self, trip: TripRequest) -> Result<(), StoreError> {
        self.trips.insert(trip.id, trip);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<TripRequest, StoreError> {
        self.trips
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or(StoreError::NotFound(id))
    }

    async fn list(&self, statuses: &[TripStatus]) -> Result<Vec<TripRequest>, StoreError> {
        Ok(self
            .trips
            .iter()
            .filter(|entry| statuses.contains(&entry.status))
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn update_if(
        &self,
        id: Uuid,
        guard: &Guard,
        transition: &Transition,
        now: DateTime<Utc>,
    ) -> Result<WriteResult, StoreError> {
        // The shard write lock held by `get_mut` makes check-and-apply a single step.
        let mut trip = self.trips.get_mut(&id).ok_or(StoreError::NotFound(id))?;

        if trip.status.is_terminal() || !guard.admits(&trip) {
            return Ok(WriteResult::Stale(trip.clone()));
        }

        transition.apply(&mut trip, now);
        Ok(WriteResult::Applied(trip.clone()))
    }

    async fn count(&self) -> Result<usize, StoreError> {
        Ok(self.trips.len())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{Duration, Utc};
    use uuid::Uuid;

    use super::{InMemoryTripStore, TripStore, WriteResult};
    use crate::models::driver::GeoPoint;
    use crate::models::trip::{
        Guard, Material, Stop, SubmitTrip, TimingMode, Transition, TripRequest, TripStatus,
    };

    fn trip() -> TripRequest {
        let stop = Stop {
            location: GeoPoint {
                lat: 32.0853,
                lng: 34.7818,
            },
            address: String::new(),
        };
        TripRequest::new(
            SubmitTrip {
                requester_id: Uuid::new_v4(),
                pickup: stop.clone(),
                delivery: stop,
                material: Material {
                    description: "rebar".to_string(),
                    quantity: None,
                    unit: None,
                },
                required_capability: None,
                timing: TimingMode::Asap,
                scheduled_for: None,
                quoted_price: None,
            },
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn unknown_id_is_not_found() {
        let store = InMemoryTripStore::new();
        assert!(store.get(Uuid::new_v4()).await.is_err());
    }

    #[tokio::test]
    async fn failed_guard_reports_stale_and_leaves_record_untouched() {
        let store = InMemoryTripStore::new();
        let trip = trip();
        let id = trip.id;
        store.insert(trip).await.unwrap();

        let result = store
            .update_if(
                id,
                &Guard::status_in(&[TripStatus::Matched]),
                &Transition::Expire,
                Utc::now(),
            )
            .await
            .unwrap();

        assert!(matches!(result, WriteResult::Stale(ref t) if t.status == TripStatus::Pending));
        assert_eq!(store.get(id).await.unwrap().status, TripStatus::Pending);
    }

    #[tokio::test]
    async fn terminal_records_are_never_mutated() {
        let store = InMemoryTripStore::new();
        let trip = trip();
        let id = trip.id;
        store.insert(trip).await.unwrap();
        store
            .update_if(
                id,
                &Guard::status_in(TripStatus::CANCELLABLE),
                &Transition::Cancel,
                Utc::now(),
            )
            .await
            .unwrap();

        let everything = Guard::status_in(&[
            TripStatus::Pending,
            TripStatus::Cancelled,
            TripStatus::Matching,
        ]);
        let result = store
            .update_if(id, &everything, &Transition::BeginMatching, Utc::now())
            .await
            .unwrap();

        assert!(!result.is_applied());
        assert_eq!(store.get(id).await.unwrap().status, TripStatus::Cancelled);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_accepts_apply_exactly_once() {
        let store = Arc::new(InMemoryTripStore::new());
        let mut trip = trip();
        let now = Utc::now();
        let drivers: Vec<Uuid> = (0..16).map(|_| Uuid::new_v4()).collect();
        Transition::BeginMatching.apply(&mut trip, now);
        Transition::OpenOffer {
            deadline: now + Duration::seconds(15),
            candidates: drivers.clone(),
        }
        .apply(&mut trip, now);
        let id = trip.id;
        store.insert(trip).await.unwrap();

        let handles: Vec<_> = drivers
            .iter()
            .map(|driver| {
                let store = store.clone();
                let driver = *driver;
                tokio::spawn(async move {
                    let guard = Guard::status_in(&[TripStatus::Matched])
                        .round(1)
                        .unassigned()
                        .candidate(driver);
                    store
                        .update_if(id, &guard, &Transition::Accept { driver_id: driver }, Utc::now())
                        .await
                        .unwrap()
                        .is_applied()
                })
            })
            .collect();

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }

        assert_eq!(winners, 1);
        let stored = store.get(id).await.unwrap();
        assert_eq!(stored.status, TripStatus::Accepted);
        assert!(stored.invariants_hold());
    }
}
