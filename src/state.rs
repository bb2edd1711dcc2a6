use std::sync::Arc;

use tokio::sync::broadcast;

use crate::config::DispatchSettings;
use crate::engine::coordinator::AssignmentCoordinator;
use crate::engine::ledger::{RequestLedger, RetryPolicy};
use crate::engine::notify::{ChannelGateway, DispatchEvent, NotificationGateway};
use crate::engine::rounds::RoundBook;
use crate::engine::selector::{CandidateSelector, TagCapabilities};
use crate::engine::store::{InMemoryTripStore, TripStore};
use crate::geo::index::GeoIndex;
use crate::observability::metrics::Metrics;

pub struct AppState {
    pub geo: Arc<GeoIndex>,
    pub coordinator: Arc<AssignmentCoordinator>,
    pub events_tx: broadcast::Sender<DispatchEvent>,
    pub metrics: Metrics,
}

impl AppState {
    pub fn new(settings: DispatchSettings, event_buffer_size: usize) -> Self {
        let (events_tx, _unused_rx) = broadcast::channel(event_buffer_size);
        let gateway: Arc<dyn NotificationGateway> = Arc::new(ChannelGateway::new(events_tx.clone()));
        let store: Arc<dyn TripStore> = Arc::new(InMemoryTripStore::new());
        let metrics = Metrics::new();
        let geo = Arc::new(GeoIndex::new());
        let ledger = Arc::new(RequestLedger::new(
            store,
            RetryPolicy::new(settings.ledger_retry_attempts, settings.ledger_backoff),
        ));
        let selector = CandidateSelector::new(
            geo.clone(),
            Arc::new(TagCapabilities),
            settings.staleness_chrono(),
        );
        let coordinator = Arc::new(AssignmentCoordinator::new(
            ledger,
            selector,
            Arc::new(RoundBook::new()),
            gateway,
            geo.clone(),
            settings,
            metrics.clone(),
        ));

        Self {
            geo,
            coordinator,
            events_tx,
            metrics,
        }
    }
}
