use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::sleep;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::engine::store::{TripStore, WriteResult};
use crate::error::StoreError;
use crate::models::trip::{Guard, Transition, TripRequest, TripStatus};

/// Bounded exponential backoff for transient store failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, base_backoff: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            base_backoff,
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.base_backoff.saturating_mul(1u32 << attempt.min(16))
    }

    pub async fn run<T, F, Fut>(&self, op_name: &str, mut op: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt + 1 < self.attempts => {
                    let backoff = self.backoff(attempt);
                    warn!(op = op_name, attempt = attempt + 1, backoff_ms = backoff.as_millis() as u64, error = %err, "ledger write failed; retrying");
                    sleep(backoff).await;
                    attempt += 1;
                }
                Err(err) => {
                    if err.is_transient() {
                        error!(op = op_name, attempts = self.attempts, error = %err, "ledger write retries exhausted");
                    }
                    return Err(err);
                }
            }
        }
    }
}

/// Which drivers currently hold a committed assignment, and when each driver last won one.
#[derive(Debug, Default, Clone)]
pub struct DriverAssignments {
    pub busy: HashSet<Uuid>,
    pub last_assigned_at: HashMap<Uuid, DateTime<Utc>>,
}

/// Authoritative request records. Every state change is a conditional write; a failed
/// precondition comes back as `WriteResult::Stale`, never as an error.
pub struct RequestLedger {
    store: Arc<dyn TripStore>,
    retry: RetryPolicy,
}

impl RequestLedger {
    pub fn new(store: Arc<dyn TripStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    pub async fn submit(&self, trip: TripRequest) -> Result<TripRequest, StoreError> {
        self.retry
            .run("submit", || self.store.insert(trip.clone()))
            .await?;
        Ok(trip)
    }

    pub async fn get(&self, id: Uuid) -> Result<TripRequest, StoreError> {
        self.retry.run("get", || self.store.get(id)).await
    }

    pub async fn list(&self, statuses: &[TripStatus]) -> Result<Vec<TripRequest>, StoreError> {
        self.retry.run("list", || self.store.list(statuses)).await
    }

    pub async fn count(&self) -> Result<usize, StoreError> {
        self.store.count().await
    }

    async fn write(
        &self,
        id: Uuid,
        guard: Guard,
        transition: Transition,
        now: DateTime<Utc>,
    ) -> Result<WriteResult, StoreError> {
        let result = self
            .retry
            .run(transition.name(), || {
                self.store.update_if(id, &guard, &transition, now)
            })
            .await?;

        if let WriteResult::Stale(current) = &result {
            debug!(
                request_id = %id,
                transition = transition.name(),
                status = current.status.as_str(),
                round = current.matching_round,
                "conditional write precondition failed"
            );
        }
        Ok(result)
    }

    /// `pending | expired_no_response -> matching`, opening the next round.
    pub async fn begin_matching(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<WriteResult, StoreError> {
        let guard = Guard::status_in(&[TripStatus::Pending, TripStatus::ExpiredNoResponse]);
        self.write(id, guard, Transition::BeginMatching, now).await
    }

    /// `matching -> matched` with the deadline and candidate snapshot of `round`.
    pub async fn open_offer(
        &self,
        id: Uuid,
        round: u32,
        deadline: DateTime<Utc>,
        candidates: Vec<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<WriteResult, StoreError> {
        let guard = Guard::status_in(&[TripStatus::Matching]).round(round);
        let transition = Transition::OpenOffer {
            deadline,
            candidates,
        };
        self.write(id, guard, transition, now).await
    }

    /// The race-safe acceptance: `matched -> accepted` only while unassigned, in `round`,
    /// offered to `driver_id` and before the deadline.
    pub async fn accept(
        &self,
        id: Uuid,
        driver_id: Uuid,
        round: u32,
        now: DateTime<Utc>,
    ) -> Result<WriteResult, StoreError> {
        let guard = Guard::status_in(&[TripStatus::Matched])
            .round(round)
            .unassigned()
            .candidate(driver_id)
            .deadline_after(now);
        self.write(id, guard, Transition::Accept { driver_id }, now)
            .await
    }

    /// `matched -> expired_no_response` once the deadline of `round` has passed.
    pub async fn expire(
        &self,
        id: Uuid,
        round: u32,
        now: DateTime<Utc>,
    ) -> Result<WriteResult, StoreError> {
        let guard = Guard::status_in(&[TripStatus::Matched])
            .round(round)
            .unassigned()
            .deadline_before(now);
        self.write(id, guard, Transition::Expire, now).await
    }

    /// Recovers a `matching` record whose round died before opening an offer.
    pub async fn abandon(
        &self,
        id: Uuid,
        round: u32,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<WriteResult, StoreError> {
        let guard = Guard::status_in(&[TripStatus::Matching])
            .round(round)
            .updated_before(stale_before);
        self.write(id, guard, Transition::Expire, now).await
    }

    /// `matching | expired_no_response -> no_drivers_available`.
    pub async fn exhaust(
        &self,
        id: Uuid,
        round: u32,
        now: DateTime<Utc>,
    ) -> Result<WriteResult, StoreError> {
        let guard = Guard::status_in(&[TripStatus::Matching, TripStatus::ExpiredNoResponse])
            .round(round);
        self.write(id, guard, Transition::Exhaust, now).await
    }

    pub async fn cancel(&self, id: Uuid, now: DateTime<Utc>) -> Result<WriteResult, StoreError> {
        let guard = Guard::status_in(TripStatus::CANCELLABLE);
        self.write(id, guard, Transition::Cancel, now).await
    }

    pub async fn start_trip(
        &self,
        id: Uuid,
        driver_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<WriteResult, StoreError> {
        let guard = Guard::status_in(&[TripStatus::Accepted]).assigned_to(driver_id);
        self.write(id, guard, Transition::StartTrip, now).await
    }

    pub async fn deliver(
        &self,
        id: Uuid,
        driver_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<WriteResult, StoreError> {
        let guard = Guard::status_in(&[TripStatus::InProgress]).assigned_to(driver_id);
        self.write(id, guard, Transition::Deliver, now).await
    }

    pub async fn driver_assignments(&self) -> Result<DriverAssignments, StoreError> {
        let trips = self
            .list(&[
                TripStatus::Accepted,
                TripStatus::InProgress,
                TripStatus::Delivered,
            ])
            .await?;

        let mut assignments = DriverAssignments::default();
        for trip in trips {
            let Some(driver_id) = trip.assigned_driver_id else {
                continue;
            };
            if trip.status.is_committed() {
                assignments.busy.insert(driver_id);
            }
            if let Some(at) = trip.accepted_at {
                let last = assignments.last_assigned_at.entry(driver_id).or_insert(at);
                if *last < at {
                    *last = at;
                }
            }
        }
        Ok(assignments)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use uuid::Uuid;

    use super::{RequestLedger, RetryPolicy};
    use crate::engine::store::{InMemoryTripStore, TripStore, WriteResult};
    use crate::error::StoreError;
    use crate::models::driver::GeoPoint;
    use crate::models::trip::{
        Guard, Material, Stop, SubmitTrip, TimingMode, Transition, TripRequest, TripStatus,
    };

    /// Fails the first `failures` conditional writes with a transient error.
    struct FlakyStore {
        inner: InMemoryTripStore,
        failures: AtomicU32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl TripStore for FlakyStore {
        async fn insert(&self, trip: TripRequest) -> Result<(), StoreError> {
            self.inner.insert(trip).await
        }

        async fn get(&self, id: Uuid) -> Result<TripRequest, StoreError> {
            self.inner.get(id).await
        }

        async fn list(&self, statuses: &[TripStatus]) -> Result<Vec<TripRequest>, StoreError> {
            self.inner.list(statuses).await
        }

        async fn update_if(
            &self,
            id: Uuid,
            guard: &Guard,
            transition: &Transition,
            now: DateTime<Utc>,
        ) -> Result<WriteResult, StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(StoreError::Transient("connection reset".to_string()));
            }
            self.inner.update_if(id, guard, transition, now).await
        }

        async fn count(&self) -> Result<usize, StoreError> {
            self.inner.count().await
        }
    }

    fn flaky(failures: u32) -> Arc<FlakyStore> {
        Arc::new(FlakyStore {
            inner: InMemoryTripStore::new(),
            failures: AtomicU32::new(failures),
            calls: AtomicU32::new(0),
        })
    }

    fn trip() -> TripRequest {
        let stop = Stop {
            location: GeoPoint { lat: 32.0, lng: 34.8 },
            address: String::new(),
        };
        TripRequest::new(
            SubmitTrip {
                requester_id: Uuid::new_v4(),
                pickup: stop.clone(),
                delivery: stop,
                material: Material {
                    description: "tiles".to_string(),
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

    fn policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn transient_failures_within_budget_are_retried() {
        let store = flaky(2);
        let ledger = RequestLedger::new(store.clone(), policy());
        let trip = ledger.submit(trip()).await.unwrap();

        let result = ledger.begin_matching(trip.id, Utc::now()).await.unwrap();

        assert!(result.is_applied());
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_transient_error() {
        let store = flaky(5);
        let ledger = RequestLedger::new(store.clone(), policy());
        let trip = ledger.submit(trip()).await.unwrap();

        let err = ledger.begin_matching(trip.id, Utc::now()).await.unwrap_err();

        assert!(err.is_transient());
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
        assert_eq!(ledger.get(trip.id).await.unwrap().status, TripStatus::Pending);
    }

    #[tokio::test]
    async fn begin_matching_claims_once() {
        let ledger = RequestLedger::new(Arc::new(InMemoryTripStore::new()), policy());
        let trip = ledger.submit(trip()).await.unwrap();

        assert!(ledger.begin_matching(trip.id, Utc::now()).await.unwrap().is_applied());
        assert!(!ledger.begin_matching(trip.id, Utc::now()).await.unwrap().is_applied());
    }

    #[tokio::test]
    async fn expiry_waits_for_the_deadline() {
        let ledger = RequestLedger::new(Arc::new(InMemoryTripStore::new()), policy());
        let trip = ledger.submit(trip()).await.unwrap();
        let now = Utc::now();
        let deadline = now + chrono::Duration::seconds(15);
        ledger.begin_matching(trip.id, now).await.unwrap();
        ledger
            .open_offer(trip.id, 1, deadline, vec![Uuid::new_v4()], now)
            .await
            .unwrap();

        assert!(!ledger.expire(trip.id, 1, now).await.unwrap().is_applied());
        let expired = ledger
            .expire(trip.id, 1, deadline + chrono::Duration::milliseconds(1))
            .await
            .unwrap();
        let WriteResult::Applied(expired) = expired else {
            panic!("expiry after the deadline must apply");
        };
        assert!(expired.invariants_hold());
    }

    #[tokio::test]
    async fn assignments_track_busy_and_latest_acceptance() {
        let ledger = RequestLedger::new(Arc::new(InMemoryTripStore::new()), policy());
        let driver = Uuid::new_v4();
        let now = Utc::now();

        let mut accepted_at = Vec::new();
        for offset in [0, 60] {
            let trip = ledger.submit(trip()).await.unwrap();
            let at = now + chrono::Duration::seconds(offset);
            ledger.begin_matching(trip.id, at).await.unwrap();
            ledger
                .open_offer(trip.id, 1, at + chrono::Duration::seconds(15), vec![driver], at)
                .await
                .unwrap();
            assert!(ledger.accept(trip.id, driver, 1, at).await.unwrap().is_applied());
            accepted_at.push((trip.id, at));
        }
        let (first, _) = accepted_at[0];
        ledger.start_trip(first, driver, now).await.unwrap();
        ledger.deliver(first, driver, now).await.unwrap();

        let assignments = ledger.driver_assignments().await.unwrap();
        assert!(assignments.busy.contains(&driver));
        assert_eq!(assignments.last_assigned_at[&driver], accepted_at[1].1);
    }
}
