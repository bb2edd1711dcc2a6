use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::DispatchSettings;
use crate::engine::ledger::RequestLedger;
use crate::engine::notify::{DispatchEvent, NotificationGateway, RevokeReason};
use crate::engine::rounds::{RoundBook, RoundSignal};
use crate::engine::selector::{Candidate, CandidateSelector, SelectionContext};
use crate::engine::store::WriteResult;
use crate::error::{AppError, NotifyError, StoreError};
use crate::geo::haversine_km;
use crate::geo::index::GeoIndex;
use crate::models::driver::DriverSession;
use crate::models::round::{
    AssignmentAttempt, CancelOutcome, Decision, DriverOffer, MatchingRound, OfferPayload,
    ResponseOutcome, RoundOutcome, RoundResolution,
};
use crate::models::trip::{SubmitTrip, TimingMode, TripRequest, TripStatus};
use crate::observability::metrics::Metrics;

/// What ended the wait of a round.
enum Wake {
    Won(Uuid),
    Cancelled,
    Deadline,
}

pub struct AssignmentCoordinator {
    ledger: Arc<RequestLedger>,
    selector: CandidateSelector,
    rounds: Arc<RoundBook>,
    gateway: Arc<dyn NotificationGateway>,
    geo: Arc<GeoIndex>,
    settings: DispatchSettings,
    metrics: Metrics,
}

impl AssignmentCoordinator {
    pub fn new(
        ledger: Arc<RequestLedger>,
        selector: CandidateSelector,
        rounds: Arc<RoundBook>,
        gateway: Arc<dyn NotificationGateway>,
        geo: Arc<GeoIndex>,
        settings: DispatchSettings,
        metrics: Metrics,
    ) -> Self {
        Self {
            ledger,
            selector,
            rounds,
            gateway,
            geo,
            settings,
            metrics,
        }
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    pub fn ledger(&self) -> &RequestLedger {
        &self.ledger
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn rounds(&self) -> &RoundBook {
        &self.rounds
    }

    /// Creates a `pending` request and, when it is due, starts matching in the background.
    pub async fn submit(self: &Arc<Self>, fields: SubmitTrip) -> Result<TripRequest, AppError> {
        validate_submission(&fields)?;

        let now = Utc::now();
        let trip = self.ledger.submit(TripRequest::new(fields, now)).await?;
        info!(
            request_id = %trip.id,
            requester_id = %trip.requester_id,
            timing = ?trip.timing,
            "trip request submitted"
        );

        if trip.due_at(self.settings.scheduled_lead_chrono()) <= now {
            self.spawn_matching(trip.id);
        }
        Ok(trip)
    }

    pub fn spawn_matching(self: &Arc<Self>, request_id: Uuid) {
        let this = self.clone();
        tokio::spawn(async move {
            let outcome = this.drive(request_id).await;
            debug!(request_id = %request_id, outcome = outcome.label(), "matching finished");
        });
    }

    /// Runs rounds until the request leaves the matching cycle.
    pub async fn drive(self: &Arc<Self>, request_id: Uuid) -> RoundOutcome {
        loop {
            let outcome = self.run_matching_round(request_id).await;
            if outcome != RoundOutcome::Expired {
                return outcome;
            }
        }
    }

    /// One offer cycle: claim, select, offer, wait, resolve.
    pub async fn run_matching_round(self: &Arc<Self>, request_id: Uuid) -> RoundOutcome {
        let started = Instant::now();
        let outcome = match self.matching_round(request_id).await {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(request_id = %request_id, error = %err, "matching round abandoned; reaper will recover it");
                RoundOutcome::Abandoned
            }
        };

        self.metrics
            .rounds_total
            .with_label_values(&[outcome.label()])
            .inc();
        self.metrics
            .round_duration_seconds
            .with_label_values(&[outcome.label()])
            .observe(started.elapsed().as_secs_f64());
        outcome
    }

    async fn matching_round(self: &Arc<Self>, request_id: Uuid) -> Result<RoundOutcome, StoreError> {
        let trip = match self.ledger.begin_matching(request_id, Utc::now()).await? {
            WriteResult::Applied(trip) => trip,
            WriteResult::Stale(current) => {
                debug!(
                    request_id = %request_id,
                    status = current.status.as_str(),
                    "request already claimed or not matchable"
                );
                return Ok(RoundOutcome::Skipped);
            }
        };
        let round = trip.matching_round;
        info!(request_id = %request_id, round, "matching round started");

        let candidates = self.select_candidates(&trip).await?;
        if candidates.is_empty() {
            return self.conclude_no_drivers(&trip).await;
        }

        let opened_at = Utc::now();
        let deadline = opened_at + self.settings.acceptance_window_chrono();
        let candidate_ids: Vec<Uuid> = candidates.iter().map(Candidate::driver_id).collect();

        // Registered before the offer opens so an immediate accept finds a waiter.
        let mut signal = self.rounds.open(MatchingRound::new(
            request_id,
            round,
            candidate_ids.clone(),
            deadline,
        ));

        let trip = match self
            .ledger
            .open_offer(request_id, round, deadline, candidate_ids, opened_at)
            .await
        {
            Ok(WriteResult::Applied(trip)) => trip,
            Ok(WriteResult::Stale(current)) => {
                self.rounds
                    .close(request_id, round, RoundResolution::Cancelled);
                return Ok(if current.status == TripStatus::Cancelled {
                    RoundOutcome::Cancelled
                } else {
                    RoundOutcome::Skipped
                });
            }
            Err(err) => {
                self.rounds
                    .close(request_id, round, RoundResolution::Expired);
                return Err(err);
            }
        };

        info!(
            request_id = %request_id,
            round,
            candidates = candidates.len(),
            deadline = %deadline,
            "offer opened"
        );

        self.metrics.active_rounds.inc();
        self.dispatch_offers(&trip, &candidates, deadline).await;
        let wake = wait_for_resolution(&mut signal, deadline).await;
        let outcome = match wake {
            Wake::Won(driver_id) => {
                self.settle_won(&trip, driver_id).await;
                Ok(RoundOutcome::WonBy(driver_id))
            }
            Wake::Cancelled => {
                self.settle_cancelled(&trip).await;
                Ok(RoundOutcome::Cancelled)
            }
            Wake::Deadline => self.expire_round(&trip).await,
        };
        self.metrics.active_rounds.dec();
        outcome
    }

    /// Candidates for the request's current round, widening the radius a bounded number of times.
    async fn select_candidates(&self, trip: &TripRequest) -> Result<Vec<Candidate>, StoreError> {
        let assignments = self.ledger.driver_assignments().await?;
        // Sequential offers never go back to a driver who already had this request.
        let (exclude, max_count): (&[Uuid], usize) = match trip.timing {
            TimingMode::Asap => (&[], self.settings.max_candidates),
            TimingMode::Scheduled => (trip.offered_drivers.as_slice(), 1),
        };
        let ctx = SelectionContext {
            busy: Some(&assignments.busy),
            last_assigned_at: Some(&assignments.last_assigned_at),
            exclude,
        };

        for widening in 0..=self.settings.max_radius_widenings {
            let radius_km = self.settings.radius_km(trip.matching_round, widening);
            let found =
                self.selector
                    .find_candidates(trip, radius_km, max_count, Utc::now(), &ctx);
            if !found.is_empty() {
                return Ok(found);
            }
            debug!(request_id = %trip.id, round = trip.matching_round, radius_km, "no candidates in radius");
        }
        Ok(Vec::new())
    }

    async fn conclude_no_drivers(&self, trip: &TripRequest) -> Result<RoundOutcome, StoreError> {
        match self
            .ledger
            .exhaust(trip.id, trip.matching_round, Utc::now())
            .await?
        {
            WriteResult::Applied(exhausted) => {
                info!(request_id = %trip.id, round = trip.matching_round, "no drivers available");
                self.notify_requester(DispatchEvent::NoDriversAvailable {
                    requester_id: exhausted.requester_id,
                    request_id: exhausted.id,
                })
                .await;
                Ok(RoundOutcome::NoDriversAvailable)
            }
            WriteResult::Stale(current) if current.status == TripStatus::Cancelled => {
                Ok(RoundOutcome::Cancelled)
            }
            WriteResult::Stale(_) => Ok(RoundOutcome::Skipped),
        }
    }

    async fn dispatch_offers(
        &self,
        trip: &TripRequest,
        candidates: &[Candidate],
        deadline: DateTime<Utc>,
    ) {
        let deliveries = candidates.iter().map(|candidate| {
            let payload = offer_payload(trip, deadline, candidate.distance_km);
            let driver_id = candidate.driver_id();
            async move {
                let result = self.gateway.deliver_offer(driver_id, &payload).await;
                (driver_id, result)
            }
        });

        let mut delivered = 0usize;
        for (driver_id, result) in join_all(deliveries).await {
            match result {
                Ok(()) => delivered += 1,
                Err(err) => self.record_notify_failure("offer", driver_id, &err),
            }
        }

        if delivered == 0 {
            warn!(
                request_id = %trip.id,
                round = trip.matching_round,
                "no offer delivered; round runs to its deadline"
            );
        }
    }

    async fn revoke_offers(&self, trip: &TripRequest, except: Option<Uuid>, reason: RevokeReason) {
        let revocations = trip
            .candidate_set_snapshot
            .iter()
            .copied()
            .filter(|driver_id| Some(*driver_id) != except)
            .map(|driver_id| async move {
                let result = self
                    .gateway
                    .revoke_offer(driver_id, trip.id, trip.matching_round, reason)
                    .await;
                (driver_id, result)
            });

        for (driver_id, result) in join_all(revocations).await {
            if let Err(err) = result {
                self.record_notify_failure(reason.as_str(), driver_id, &err);
            }
        }
    }

    async fn notify_requester(&self, event: DispatchEvent) {
        let requester_id = event.requester_id().unwrap_or_default();
        if let Err(err) = self.gateway.notify_requester(event).await {
            self.record_notify_failure("requester", requester_id, &err);
        }
    }

    fn record_notify_failure(&self, kind: &str, recipient: Uuid, err: &NotifyError) {
        self.metrics
            .notification_failures_total
            .with_label_values(&[kind])
            .inc();
        match err {
            NotifyError::NoRecipient(_) => {
                debug!(kind, recipient = %recipient, "no live channel for recipient")
            }
            NotifyError::Delivery { .. } => {
                warn!(kind, recipient = %recipient, error = %err, "notification delivery failed")
            }
        }
    }

    /// Tells the losers, the requester, and closes the round.
    async fn settle_won(&self, trip: &TripRequest, winner: Uuid) {
        self.rounds
            .close(trip.id, trip.matching_round, RoundResolution::WonBy(winner));
        self.revoke_offers(trip, Some(winner), RevokeReason::Taken)
            .await;
        self.notify_requester(DispatchEvent::RequestAccepted {
            requester_id: trip.requester_id,
            request_id: trip.id,
            driver_id: winner,
        })
        .await;
    }

    async fn settle_cancelled(&self, trip: &TripRequest) {
        self.rounds
            .close(trip.id, trip.matching_round, RoundResolution::Cancelled);
        self.revoke_offers(trip, None, RevokeReason::Cancelled)
            .await;
    }

    async fn expire_round(&self, trip: &TripRequest) -> Result<RoundOutcome, StoreError> {
        let round = trip.matching_round;
        match self.ledger.expire(trip.id, round, Utc::now()).await? {
            WriteResult::Applied(expired) => {
                info!(request_id = %trip.id, round, "offer expired without acceptance");
                self.rounds.close(trip.id, round, RoundResolution::Expired);
                self.revoke_offers(trip, None, RevokeReason::Expired).await;
                self.after_expiry(&expired).await
            }
            WriteResult::Stale(current) => Ok(self.reconcile(trip, current).await),
        }
    }

    /// Settles a round whose expiry write lost to another writer.
    async fn reconcile(&self, offered: &TripRequest, current: TripRequest) -> RoundOutcome {
        let round = offered.matching_round;
        if current.matching_round != round {
            self.rounds.close(offered.id, round, RoundResolution::Expired);
            return RoundOutcome::Skipped;
        }

        match (current.status, current.assigned_driver_id) {
            (status, Some(winner)) if status.is_committed() || status == TripStatus::Delivered => {
                self.settle_won(offered, winner).await;
                RoundOutcome::WonBy(winner)
            }
            (TripStatus::Cancelled, _) => {
                self.settle_cancelled(offered).await;
                RoundOutcome::Cancelled
            }
            _ => {
                self.rounds.close(offered.id, round, RoundResolution::Expired);
                RoundOutcome::Skipped
            }
        }
    }

    /// Decides between another round and `no_drivers_available` for an expired request.
    pub async fn after_expiry(&self, expired: &TripRequest) -> Result<RoundOutcome, StoreError> {
        if expired.matching_round < self.settings.max_matching_rounds {
            return Ok(RoundOutcome::Expired);
        }
        self.conclude_no_drivers(expired).await
    }

    /// Sweeps one expired round found by the reaper. Only the writer whose expiry succeeds proceeds.
    pub async fn expire_overdue(&self, trip: &TripRequest) -> Result<Option<RoundOutcome>, StoreError> {
        let round = trip.matching_round;
        match self.ledger.expire(trip.id, round, Utc::now()).await? {
            WriteResult::Applied(expired) => {
                info!(request_id = %trip.id, round, "reaper expired overdue offer");
                // Dropping the live round wakes any local waiter, whose own expiry then no-ops.
                self.rounds.close(trip.id, round, RoundResolution::Expired);
                self.revoke_offers(trip, None, RevokeReason::Expired).await;
                self.after_expiry(&expired).await.map(Some)
            }
            WriteResult::Stale(_) => Ok(None),
        }
    }

    /// Moves a `matching` record abandoned before its offer opened back into the retry path.
    pub async fn recover_abandoned(
        &self,
        trip: &TripRequest,
        stale_before: DateTime<Utc>,
    ) -> Result<Option<RoundOutcome>, StoreError> {
        match self
            .ledger
            .abandon(trip.id, trip.matching_round, stale_before, Utc::now())
            .await?
        {
            WriteResult::Applied(expired) => {
                warn!(request_id = %trip.id, round = trip.matching_round, "recovered abandoned matching round");
                self.after_expiry(&expired).await.map(Some)
            }
            WriteResult::Stale(_) => Ok(None),
        }
    }

    /// `RespondToOffer`. Losing a race, a stale round or a closed offer are outcomes, not errors.
    pub async fn respond(
        self: &Arc<Self>,
        session: DriverSession,
        request_id: Uuid,
        round: u32,
        decision: Decision,
    ) -> Result<ResponseOutcome, AppError> {
        let attempt = AssignmentAttempt {
            request_id,
            driver_id: session.driver_id,
            round,
            decision,
            at: Utc::now(),
        };
        let first_seen = self.rounds.record_attempt(&attempt);

        let outcome = match decision {
            Decision::Accept => self.accept(&attempt).await?,
            Decision::Decline => self.decline(&attempt, first_seen).await?,
        };

        self.metrics
            .offer_responses_total
            .with_label_values(&[outcome.label()])
            .inc();
        Ok(outcome)
    }

    async fn accept(&self, attempt: &AssignmentAttempt) -> Result<ResponseOutcome, StoreError> {
        let driver_id = attempt.driver_id;
        // Not atomic with the accept write below: two requests accepted in the same instant
        // can both go to this driver. Closing that needs a store-level per-driver guard.
        let assignments = self.ledger.driver_assignments().await?;
        if assignments.busy.contains(&driver_id) {
            let current = self.ledger.get(attempt.request_id).await?;
            if current.assigned_driver_id != Some(driver_id) {
                debug!(request_id = %attempt.request_id, driver_id = %driver_id, "driver already committed elsewhere");
                return Ok(late_outcome(&current, attempt));
            }
        }

        match self
            .ledger
            .accept(attempt.request_id, driver_id, attempt.round, attempt.at)
            .await?
        {
            WriteResult::Applied(trip) => {
                info!(
                    request_id = %trip.id,
                    driver_id = %driver_id,
                    round = attempt.round,
                    "offer accepted"
                );
                if !self
                    .rounds
                    .signal(trip.id, attempt.round, RoundSignal::Won(driver_id))
                {
                    self.settle_won(&trip, driver_id).await;
                }
                Ok(ResponseOutcome::Accepted)
            }
            WriteResult::Stale(current) => {
                let outcome = late_outcome(&current, attempt);
                debug!(
                    request_id = %attempt.request_id,
                    driver_id = %driver_id,
                    round = attempt.round,
                    outcome = outcome.label(),
                    "accept did not win"
                );
                Ok(outcome)
            }
        }
    }

    async fn decline(
        &self,
        attempt: &AssignmentAttempt,
        first_seen: bool,
    ) -> Result<ResponseOutcome, StoreError> {
        let current = self.ledger.get(attempt.request_id).await?;
        if current.matching_round != attempt.round {
            return Ok(ResponseOutcome::InvalidRound);
        }
        if current.status != TripStatus::Matched
            || !current.candidate_set_snapshot.contains(&attempt.driver_id)
        {
            return Ok(ResponseOutcome::TooLate);
        }
        if first_seen {
            info!(
                request_id = %attempt.request_id,
                driver_id = %attempt.driver_id,
                round = attempt.round,
                "offer declined"
            );
        }
        Ok(ResponseOutcome::Declined)
    }

    /// `CancelRequest`, allowed to the requester until a driver has accepted.
    pub async fn cancel(
        self: &Arc<Self>,
        request_id: Uuid,
        requester_id: Uuid,
    ) -> Result<CancelOutcome, AppError> {
        let trip = self.ledger.get(request_id).await?;
        if trip.requester_id != requester_id {
            return Err(AppError::Forbidden(format!(
                "request {request_id} belongs to another requester"
            )));
        }

        match self.ledger.cancel(request_id, Utc::now()).await? {
            WriteResult::Applied(cancelled) => {
                info!(request_id = %request_id, round = cancelled.matching_round, "request cancelled");
                if !self.rounds.signal(
                    request_id,
                    cancelled.matching_round,
                    RoundSignal::Cancelled,
                ) {
                    self.settle_cancelled(&cancelled).await;
                }
                Ok(CancelOutcome::Cancelled)
            }
            WriteResult::Stale(current) => {
                debug!(request_id = %request_id, status = current.status.as_str(), "cancel refused");
                Ok(CancelOutcome::AlreadyTerminal)
            }
        }
    }

    /// `GetOffer`: the driver's live offer with the whole seconds left on its countdown.
    pub async fn current_offer(&self, session: DriverSession) -> Result<Option<DriverOffer>, AppError> {
        let now = Utc::now();
        let driver_id = session.driver_id;
        let location = self.geo.get(&driver_id).map(|record| record.location);

        let offer = self
            .ledger
            .list(&[TripStatus::Matched])
            .await?
            .into_iter()
            .filter(|trip| trip.candidate_set_snapshot.contains(&driver_id))
            .filter(|trip| !self.rounds.has_declined(trip.id, trip.matching_round, driver_id))
            .filter_map(|trip| {
                let deadline = trip.acceptance_deadline.filter(|deadline| *deadline > now)?;
                Some((deadline, trip))
            })
            .min_by_key(|(deadline, _)| *deadline)
            .map(|(deadline, trip)| {
                let distance_km = location
                    .map(|at| haversine_km(&at, &trip.pickup.location))
                    .unwrap_or(0.0);
                DriverOffer::new(offer_payload(&trip, deadline, distance_km), now)
            });

        Ok(offer)
    }

    pub async fn start_trip(
        &self,
        session: DriverSession,
        request_id: Uuid,
    ) -> Result<TripRequest, AppError> {
        match self
            .ledger
            .start_trip(request_id, session.driver_id, Utc::now())
            .await?
        {
            WriteResult::Applied(trip) => {
                info!(request_id = %request_id, driver_id = %session.driver_id, "pickup confirmed");
                Ok(trip)
            }
            WriteResult::Stale(current) => Err(AppError::Conflict(format!(
                "request {request_id} is {} and not startable by this driver",
                current.status.as_str()
            ))),
        }
    }

    pub async fn deliver(
        &self,
        session: DriverSession,
        request_id: Uuid,
    ) -> Result<TripRequest, AppError> {
        match self
            .ledger
            .deliver(request_id, session.driver_id, Utc::now())
            .await?
        {
            WriteResult::Applied(trip) => {
                info!(request_id = %request_id, driver_id = %session.driver_id, "delivery confirmed");
                Ok(trip)
            }
            WriteResult::Stale(current) => Err(AppError::Conflict(format!(
                "request {request_id} is {} and not deliverable by this driver",
                current.status.as_str()
            ))),
        }
    }
}

async fn wait_for_resolution(signal: &mut watch::Receiver<RoundSignal>, deadline: DateTime<Utc>) -> Wake {
    loop {
        let Ok(remaining) = (deadline - Utc::now()).to_std() else {
            return Wake::Deadline;
        };
        if remaining.is_zero() {
            return Wake::Deadline;
        }

        tokio::select! {
            changed = signal.changed() => {
                if changed.is_err() {
                    // Round replaced or closed elsewhere; the expiry write sorts out what happened.
                    return Wake::Deadline;
                }
                match *signal.borrow_and_update() {
                    RoundSignal::Won(driver_id) => return Wake::Won(driver_id),
                    RoundSignal::Cancelled => return Wake::Cancelled,
                    RoundSignal::Open => {}
                }
            }
            _ = sleep(remaining) => {}
        }
    }
}

/// Classifies an accept whose conditional write did not apply.
fn late_outcome(current: &TripRequest, attempt: &AssignmentAttempt) -> ResponseOutcome {
    if current.matching_round != attempt.round {
        return ResponseOutcome::InvalidRound;
    }
    let won_already = current.assigned_driver_id == Some(attempt.driver_id)
        && (current.status.is_committed() || current.status == TripStatus::Delivered);
    if won_already {
        ResponseOutcome::Accepted
    } else {
        ResponseOutcome::TooLate
    }
}

pub fn offer_payload(trip: &TripRequest, deadline: DateTime<Utc>, distance_km: f64) -> OfferPayload {
    OfferPayload {
        request_id: trip.id,
        round: trip.matching_round,
        deadline,
        pickup: trip.pickup.clone(),
        delivery: trip.delivery.clone(),
        material: trip.material.clone(),
        quoted_price: trip.quoted_price,
        distance_km,
    }
}

fn validate_submission(fields: &SubmitTrip) -> Result<(), AppError> {
    if !fields.pickup.location.is_valid() {
        return Err(AppError::BadRequest("pickup coordinate is invalid".to_string()));
    }
    if !fields.delivery.location.is_valid() {
        return Err(AppError::BadRequest(
            "delivery coordinate is invalid".to_string(),
        ));
    }
    if fields.material.description.trim().is_empty() {
        return Err(AppError::BadRequest(
            "material description cannot be empty".to_string(),
        ));
    }
    if fields.timing == TimingMode::Scheduled && fields.scheduled_for.is_none() {
        return Err(AppError::BadRequest(
            "scheduled requests need scheduled_for".to_string(),
        ));
    }
    if fields
        .quoted_price
        .is_some_and(|price| !price.is_finite() || price < 0.0)
    {
        return Err(AppError::BadRequest(
            "quoted_price must be >= 0".to_string(),
        ));
    }
    Ok(())
}
