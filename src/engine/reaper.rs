use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::engine::coordinator::AssignmentCoordinator;
use crate::error::StoreError;
use crate::models::round::RoundOutcome;
use crate::models::trip::{TimingMode, TripRequest, TripStatus};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub recovered: usize,
    pub restarted: usize,
    pub exhausted: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

pub async fn run_expiry_reaper(coordinator: Arc<AssignmentCoordinator>, every: Duration) {
    info!(interval_ms = every.as_millis() as u64, "expiry reaper started");

    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        match sweep(&coordinator, Utc::now()).await {
            Ok(report) if !report.is_empty() => info!(
                expired = report.expired,
                recovered = report.recovered,
                restarted = report.restarted,
                exhausted = report.exhausted,
                "reaper sweep"
            ),
            Ok(_) => {}
            Err(err) => error!(error = %err, "reaper sweep failed"),
        }
    }
}

/// One pass over the ledger. Safe to run from several instances at once: every step is a
/// conditional write, and only the writer that wins it moves the request on.
pub async fn sweep(
    coordinator: &Arc<AssignmentCoordinator>,
    now: DateTime<Utc>,
) -> Result<SweepReport, StoreError> {
    let settings = coordinator.settings();
    let grace_cutoff = now - settings.orphan_grace_chrono();
    let lead = settings.scheduled_lead_chrono();
    let mut report = SweepReport::default();

    let candidates = coordinator
        .ledger()
        .list(&[
            TripStatus::Pending,
            TripStatus::Matching,
            TripStatus::Matched,
            TripStatus::ExpiredNoResponse,
        ])
        .await?;

    for trip in candidates {
        let step = match trip.status {
            TripStatus::Matched
                if trip.acceptance_deadline.is_some_and(|deadline| deadline <= now) =>
            {
                let step = coordinator.expire_overdue(&trip).await?;
                if step.is_some() {
                    report.expired += 1;
                    record(coordinator, "expired");
                }
                step
            }
            TripStatus::Matching if trip.updated_at <= grace_cutoff => {
                let step = coordinator.recover_abandoned(&trip, grace_cutoff).await?;
                if step.is_some() {
                    report.recovered += 1;
                    record(coordinator, "abandoned");
                }
                step
            }
            TripStatus::ExpiredNoResponse if trip.updated_at <= grace_cutoff => {
                record(coordinator, "orphaned");
                Some(coordinator.after_expiry(&trip).await?)
            }
            TripStatus::Pending if is_due(&trip, now, lead, grace_cutoff) => {
                record(coordinator, "pending");
                Some(RoundOutcome::Expired)
            }
            _ => None,
        };

        match step {
            Some(RoundOutcome::Expired) => {
                debug!(request_id = %trip.id, "reaper starting next matching round");
                coordinator.spawn_matching(trip.id);
                report.restarted += 1;
            }
            Some(RoundOutcome::NoDriversAvailable) => report.exhausted += 1,
            _ => {}
        }
    }

    Ok(report)
}

/// Scheduled requests become due ahead of their pickup time; ASAP requests only reach the
/// reaper when the task started at submission never claimed them.
fn is_due(
    trip: &TripRequest,
    now: DateTime<Utc>,
    lead: chrono::Duration,
    grace_cutoff: DateTime<Utc>,
) -> bool {
    match trip.timing {
        TimingMode::Scheduled => trip.due_at(lead) <= now,
        TimingMode::Asap => trip.created_at <= grace_cutoff,
    }
}

fn record(coordinator: &AssignmentCoordinator, kind: &str) {
    coordinator
        .metrics()
        .reaper_recoveries_total
        .with_label_values(&[kind])
        .inc();
}
