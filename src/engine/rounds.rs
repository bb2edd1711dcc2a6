use dashmap::DashMap;
use tokio::sync::watch;
use uuid::Uuid;

use crate::models::round::{AssignmentAttempt, MatchingRound, RoundResolution};

/// Wake-up signal delivered to the task waiting on a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundSignal {
    Open,
    Won(Uuid),
    Cancelled,
}

struct LiveRound {
    round: MatchingRound,
    signal: watch::Sender<RoundSignal>,
}

/// Rounds currently waiting on this instance, keyed by request id.
///
/// Entries live only as long as their round is unresolved.
#[derive(Default)]
pub struct RoundBook {
    live: DashMap<Uuid, LiveRound>,
}

impl RoundBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `round`, replacing any older round of the same request.
    pub fn open(&self, round: MatchingRound) -> watch::Receiver<RoundSignal> {
        let (signal, rx) = watch::channel(RoundSignal::Open);
        self.live
            .insert(round.request_id, LiveRound { round, signal });
        rx
    }

    /// Records a driver response. Returns false for duplicates and for rounds not live here.
    pub fn record_attempt(&self, attempt: &AssignmentAttempt) -> bool {
        let Some(mut live) = self.live.get_mut(&attempt.request_id) else {
            return false;
        };
        if live.round.round != attempt.round {
            return false;
        }
        let duplicate = live
            .round
            .attempts
            .iter()
            .any(|a| a.driver_id == attempt.driver_id && a.decision == attempt.decision);
        if duplicate {
            return false;
        }
        live.round.attempts.push(attempt.clone());
        if live.round.all_declined() {
            live.round.outcome = RoundResolution::AllDeclined;
        }
        true
    }

    /// Wakes the task waiting on `round`. Returns false when no such round is live here.
    pub fn signal(&self, request_id: Uuid, round: u32, signal: RoundSignal) -> bool {
        match self.live.get(&request_id) {
            Some(live) if live.round.round == round => live.signal.send(signal).is_ok(),
            _ => false,
        }
    }

    /// Removes `round` once resolved. A newer round of the same request is left in place.
    pub fn close(
        &self,
        request_id: Uuid,
        round: u32,
        resolution: RoundResolution,
    ) -> Option<MatchingRound> {
        self.live
            .remove_if(&request_id, |_, live| live.round.round == round)
            .map(|(_, mut live)| {
                live.round.outcome = resolution;
                live.round
            })
    }

    pub fn has_declined(&self, request_id: Uuid, round: u32, driver_id: Uuid) -> bool {
        self.live.get(&request_id).is_some_and(|live| {
            live.round.round == round && live.round.has_declined(driver_id)
        })
    }

    pub fn get(&self, request_id: Uuid) -> Option<MatchingRound> {
        self.live.get(&request_id).map(|live| live.round.clone())
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}
