use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::trip::{Material, Stop};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Accept,
    Decline,
}

/// A single driver's response to an offer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssignmentAttempt {
    pub request_id: Uuid,
    pub driver_id: Uuid,
    pub round: u32,
    pub decision: Decision,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "outcome", content = "driver_id")]
pub enum RoundResolution {
    Pending,
    WonBy(Uuid),
    AllDeclined,
    Expired,
    Cancelled,
}

/// Ephemeral record of one offer cycle.
#[derive(Debug, Clone, Serialize)]
pub struct MatchingRound {
    pub request_id: Uuid,
    pub round: u32,
    pub candidates: Vec<Uuid>,
    pub deadline: DateTime<Utc>,
    pub outcome: RoundResolution,
    pub attempts: Vec<AssignmentAttempt>,
}

impl MatchingRound {
    pub fn new(request_id: Uuid, round: u32, candidates: Vec<Uuid>, deadline: DateTime<Utc>) -> Self {
        Self {
            request_id,
            round,
            candidates,
            deadline,
            outcome: RoundResolution::Pending,
            attempts: Vec::new(),
        }
    }

    pub fn has_declined(&self, driver_id: Uuid) -> bool {
        self.attempts
            .iter()
            .any(|a| a.driver_id == driver_id && a.decision == Decision::Decline)
    }

    pub fn all_declined(&self) -> bool {
        !self.candidates.is_empty() && self.candidates.iter().all(|id| self.has_declined(*id))
    }
}

/// Result of one `run_matching_round` call.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RoundOutcome {
    /// Another coordinator already claimed the request, or it left the matchable states.
    Skipped,
    WonBy(Uuid),
    /// Deadline passed with no accept; a further round may follow.
    Expired,
    NoDriversAvailable,
    Cancelled,
    /// Ledger writes kept failing; the reaper recovers the request.
    Abandoned,
}

impl RoundOutcome {
    pub fn label(self) -> &'static str {
        match self {
            RoundOutcome::Skipped => "skipped",
            RoundOutcome::WonBy(_) => "won",
            RoundOutcome::Expired => "expired",
            RoundOutcome::NoDriversAvailable => "no_drivers_available",
            RoundOutcome::Cancelled => "cancelled",
            RoundOutcome::Abandoned => "abandoned",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResponseOutcome {
    Accepted,
    Declined,
    TooLate,
    InvalidRound,
}

impl ResponseOutcome {
    pub fn label(self) -> &'static str {
        match self {
            ResponseOutcome::Accepted => "accepted",
            ResponseOutcome::Declined => "declined",
            ResponseOutcome::TooLate => "too_late",
            ResponseOutcome::InvalidRound => "invalid_round",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    Cancelled,
    AlreadyTerminal,
}

/// Payload pushed to a candidate driver, exactly what the countdown UI renders.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OfferPayload {
    pub request_id: Uuid,
    pub round: u32,
    pub deadline: DateTime<Utc>,
    pub pickup: Stop,
    pub delivery: Stop,
    pub material: Material,
    pub quoted_price: Option<f64>,
    pub distance_km: f64,
}

/// Live offer as seen by one driver's client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DriverOffer {
    #[serde(flatten)]
    pub offer: OfferPayload,
    pub remaining_seconds: i64,
}

impl DriverOffer {
    pub fn new(offer: OfferPayload, now: DateTime<Utc>) -> Self {
        let remaining_seconds = (offer.deadline - now).num_seconds().max(0);
        Self {
            offer,
            remaining_seconds,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    use super::*;
    use crate::models::driver::GeoPoint;

    fn offer(deadline: DateTime<Utc>) -> OfferPayload {
        OfferPayload {
            request_id: Uuid::from_u128(1),
            round: 1,
            deadline,
            pickup: Stop {
                location: GeoPoint { lat: 0.0, lng: 0.0 },
                address: String::new(),
            },
            delivery: Stop {
                location: GeoPoint { lat: 0.1, lng: 0.1 },
                address: String::new(),
            },
            material: Material {
                description: "gravel".to_string(),
                quantity: None,
                unit: None,
            },
            quoted_price: Some(120.0),
            distance_km: 2.0,
        }
    }

    #[test]
    fn remaining_seconds_never_negative() {
        let now = Utc::now();
        assert_eq!(DriverOffer::new(offer(now - Duration::seconds(4)), now).remaining_seconds, 0);
        assert_eq!(DriverOffer::new(offer(now + Duration::seconds(15)), now).remaining_seconds, 15);
    }

    #[test]
    fn all_declined_needs_every_candidate() {
        let now = Utc::now();
        let (a, b) = (Uuid::from_u128(1), Uuid::from_u128(2));
        let mut round = MatchingRound::new(Uuid::from_u128(9), 1, vec![a, b], now);
        round.attempts.push(AssignmentAttempt {
            request_id: round.request_id,
            driver_id: a,
            round: 1,
            decision: Decision::Decline,
            at: now,
        });
        assert!(!round.all_declined());

        round.attempts.push(AssignmentAttempt {
            request_id: round.request_id,
            driver_id: b,
            round: 1,
            decision: Decision::Decline,
            at: now,
        });
        assert!(round.all_declined());
    }
}
