use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::driver::GeoPoint;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TripStatus {
    Pending,
    Matching,
    Matched,
    ExpiredNoResponse,
    Accepted,
    InProgress,
    Delivered,
    Cancelled,
    NoDriversAvailable,
}

impl TripStatus {
    pub const CANCELLABLE: &'static [TripStatus] = &[
        TripStatus::Pending,
        TripStatus::Matching,
        TripStatus::Matched,
        TripStatus::ExpiredNoResponse,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TripStatus::Delivered | TripStatus::Cancelled | TripStatus::NoDriversAvailable
        )
    }

    /// Statuses in which the driver is committed to the trip.
    pub fn is_committed(self) -> bool {
        matches!(self, TripStatus::Accepted | TripStatus::InProgress)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TripStatus::Pending => "pending",
            TripStatus::Matching => "matching",
            TripStatus::Matched => "matched",
            TripStatus::ExpiredNoResponse => "expired_no_response",
            TripStatus::Accepted => "accepted",
            TripStatus::InProgress => "in_progress",
            TripStatus::Delivered => "delivered",
            TripStatus::Cancelled => "cancelled",
            TripStatus::NoDriversAvailable => "no_drivers_available",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TimingMode {
    #[default]
    Asap,
    Scheduled,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Stop {
    pub location: GeoPoint,
    #[serde(default)]
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Material {
    pub description: String,
    #[serde(default)]
    pub quantity: Option<f64>,
    #[serde(default)]
    pub unit: Option<String>,
}

/// Fields supplied by the requesting client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitTrip {
    pub requester_id: Uuid,
    pub pickup: Stop,
    pub delivery: Stop,
    pub material: Material,
    #[serde(default)]
    pub required_capability: Option<String>,
    #[serde(default)]
    pub timing: TimingMode,
    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,
    #[serde(default)]
    pub quoted_price: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TripRequest {
    pub id: Uuid,
    pub requester_id: Uuid,
    pub pickup: Stop,
    pub delivery: Stop,
    pub material: Material,
    pub required_capability: Option<String>,
    pub timing: TimingMode,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub quoted_price: Option<f64>,
    pub created_at: DateTime<Utc>,

    pub status: TripStatus,
    pub assigned_driver_id: Option<Uuid>,
    pub acceptance_deadline: Option<DateTime<Utc>>,
    pub matching_round: u32,
    pub candidate_set_snapshot: Vec<Uuid>,
    /// Every driver offered this request in any round.
    pub offered_drivers: Vec<Uuid>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl TripRequest {
    pub fn new(fields: SubmitTrip, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            requester_id: fields.requester_id,
            pickup: fields.pickup,
            delivery: fields.delivery,
            material: fields.material,
            required_capability: fields
                .required_capability
                .filter(|tag| !tag.trim().is_empty()),
            timing: fields.timing,
            scheduled_for: fields.scheduled_for,
            quoted_price: fields.quoted_price,
            created_at: now,
            status: TripStatus::Pending,
            assigned_driver_id: None,
            acceptance_deadline: None,
            matching_round: 0,
            candidate_set_snapshot: Vec::new(),
            offered_drivers: Vec::new(),
            accepted_at: None,
            updated_at: now,
        }
    }

    /// When matching may start. ASAP requests are due immediately.
    pub fn due_at(&self, lead: chrono::Duration) -> DateTime<Utc> {
        match (self.timing, self.scheduled_for) {
            (TimingMode::Scheduled, Some(at)) => at - lead,
            _ => self.created_at,
        }
    }

    /// `assigned_driver_id` set iff committed or delivered; deadline set iff matched.
    pub fn invariants_hold(&self) -> bool {
        let assigned = matches!(
            self.status,
            TripStatus::Accepted | TripStatus::InProgress | TripStatus::Delivered
        );
        self.assigned_driver_id.is_some() == assigned
            && self.acceptance_deadline.is_some() == (self.status == TripStatus::Matched)
    }
}

/// Precondition of a conditional ledger write.
#[derive(Debug, Clone, Default)]
pub struct Guard {
    pub statuses: &'static [TripStatus],
    pub round: Option<u32>,
    pub unassigned: bool,
    pub assigned_to: Option<Uuid>,
    pub candidate: Option<Uuid>,
    pub deadline_after: Option<DateTime<Utc>>,
    pub deadline_before: Option<DateTime<Utc>>,
    pub updated_before: Option<DateTime<Utc>>,
}

impl Guard {
    pub fn status_in(statuses: &'static [TripStatus]) -> Self {
        Self {
            statuses,
            ..Self::default()
        }
    }

    pub fn round(mut self, round: u32) -> Self {
        self.round = Some(round);
        self
    }

    pub fn unassigned(mut self) -> Self {
        self.unassigned = true;
        self
    }

    pub fn assigned_to(mut self, driver_id: Uuid) -> Self {
        self.assigned_to = Some(driver_id);
        self
    }

    pub fn candidate(mut self, driver_id: Uuid) -> Self {
        self.candidate = Some(driver_id);
        self
    }

    pub fn deadline_after(mut self, at: DateTime<Utc>) -> Self {
        self.deadline_after = Some(at);
        self
    }

    pub fn deadline_before(mut self, at: DateTime<Utc>) -> Self {
        self.deadline_before = Some(at);
        self
    }

    pub fn updated_before(mut self, at: DateTime<Utc>) -> Self {
        self.updated_before = Some(at);
        self
    }

    pub fn admits(&self, trip: &TripRequest) -> bool {
        if !self.statuses.contains(&trip.status) {
            return false;
        }
        if self.round.is_some_and(|round| round != trip.matching_round) {
            return false;
        }
        if self.unassigned && trip.assigned_driver_id.is_some() {
            return false;
        }
        if self
            .assigned_to
            .is_some_and(|driver| trip.assigned_driver_id != Some(driver))
        {
            return false;
        }
        if self
            .candidate
            .is_some_and(|driver| !trip.candidate_set_snapshot.contains(&driver))
        {
            return false;
        }
        if let Some(at) = self.deadline_after {
            if !trip.acceptance_deadline.is_some_and(|deadline| deadline > at) {
                return false;
            }
        }
        if let Some(at) = self.deadline_before {
            if !trip.acceptance_deadline.is_some_and(|deadline| deadline <= at) {
                return false;
            }
        }
        if self.updated_before.is_some_and(|at| trip.updated_at > at) {
            return false;
        }
        true
    }
}

/// Mutation applied by a conditional write once its guard admits the record.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    BeginMatching,
    OpenOffer {
        deadline: DateTime<Utc>,
        candidates: Vec<Uuid>,
    },
    Accept {
        driver_id: Uuid,
    },
    Expire,
    Exhaust,
    Cancel,
    StartTrip,
    Deliver,
}

impl Transition {
    pub fn name(&self) -> &'static str {
        match self {
            Transition::BeginMatching => "begin_matching",
            Transition::OpenOffer { .. } => "open_offer",
            Transition::Accept { .. } => "accept",
            Transition::Expire => "expire",
            Transition::Exhaust => "exhaust",
            Transition::Cancel => "cancel",
            Transition::StartTrip => "start_trip",
            Transition::Deliver => "deliver",
        }
    }

    pub fn apply(&self, trip: &mut TripRequest, now: DateTime<Utc>) {
        match self {
            Transition::BeginMatching => {
                trip.status = TripStatus::Matching;
                trip.matching_round += 1;
                trip.candidate_set_snapshot.clear();
                trip.acceptance_deadline = None;
            }
            Transition::OpenOffer {
                deadline,
                candidates,
            } => {
                trip.status = TripStatus::Matched;
                trip.acceptance_deadline = Some(*deadline);
                trip.candidate_set_snapshot = candidates.clone();
                for driver in candidates {
                    if !trip.offered_drivers.contains(driver) {
                        trip.offered_drivers.push(*driver);
                    }
                }
            }
            Transition::Accept { driver_id } => {
                trip.status = TripStatus::Accepted;
                trip.assigned_driver_id = Some(*driver_id);
                trip.acceptance_deadline = None;
                trip.accepted_at = Some(now);
            }
            Transition::Expire => {
                trip.status = TripStatus::ExpiredNoResponse;
                trip.acceptance_deadline = None;
            }
            Transition::Exhaust => {
                trip.status = TripStatus::NoDriversAvailable;
                trip.acceptance_deadline = None;
            }
            Transition::Cancel => {
                trip.status = TripStatus::Cancelled;
                trip.acceptance_deadline = None;
            }
            Transition::StartTrip => trip.status = TripStatus::InProgress,
            Transition::Deliver => trip.status = TripStatus::Delivered,
        }
        trip.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    use super::*;

    fn trip() -> TripRequest {
        TripRequest::new(
            SubmitTrip {
                requester_id: Uuid::from_u128(1),
                pickup: Stop {
                    location: GeoPoint {
                        lat: 32.0853,
                        lng: 34.7818,
                    },
                    address: "pickup".to_string(),
                },
                delivery: Stop {
                    location: GeoPoint {
                        lat: 32.1,
                        lng: 34.8,
                    },
                    address: "site".to_string(),
                },
                material: Material {
                    description: "cement".to_string(),
                    quantity: Some(40.0),
                    unit: Some("bags".to_string()),
                },
                required_capability: Some("  ".to_string()),
                timing: TimingMode::Asap,
                scheduled_for: None,
                quoted_price: None,
            },
            Utc::now(),
        )
    }

    #[test]
    fn blank_capability_is_dropped() {
        assert!(trip().required_capability.is_none());
    }

    #[test]
    fn transitions_keep_dispatch_invariants() {
        let now = Utc::now();
        let driver = Uuid::from_u128(7);
        let mut trip = trip();
        assert!(trip.invariants_hold());

        Transition::BeginMatching.apply(&mut trip, now);
        assert_eq!(trip.matching_round, 1);
        assert!(trip.invariants_hold());

        Transition::OpenOffer {
            deadline: now + Duration::seconds(15),
            candidates: vec![driver],
        }
        .apply(&mut trip, now);
        assert!(trip.invariants_hold());

        Transition::Accept { driver_id: driver }.apply(&mut trip, now);
        assert!(trip.invariants_hold());
        assert_eq!(trip.assigned_driver_id, Some(driver));
        assert_eq!(trip.accepted_at, Some(now));
    }

    #[test]
    fn accept_guard_rejects_wrong_round_and_outsiders() {
        let now = Utc::now();
        let driver = Uuid::from_u128(7);
        let mut trip = trip();
        Transition::BeginMatching.apply(&mut trip, now);
        Transition::OpenOffer {
            deadline: now + Duration::seconds(15),
            candidates: vec![driver],
        }
        .apply(&mut trip, now);

        let guard = |round, who| {
            Guard::status_in(&[TripStatus::Matched])
                .round(round)
                .unassigned()
                .candidate(who)
                .deadline_after(now)
        };

        assert!(guard(1, driver).admits(&trip));
        assert!(!guard(0, driver).admits(&trip));
        assert!(!guard(1, Uuid::from_u128(8)).admits(&trip));
        assert!(
            !Guard::status_in(&[TripStatus::Matched])
                .deadline_after(now + Duration::seconds(20))
                .admits(&trip)
        );
    }

    #[test]
    fn scheduled_requests_are_due_ahead_of_pickup() {
        let mut trip = trip();
        let at = Utc::now() + Duration::hours(2);
        trip.timing = TimingMode::Scheduled;
        trip.scheduled_for = Some(at);

        assert_eq!(trip.due_at(Duration::minutes(15)), at - Duration::minutes(15));
    }
}
