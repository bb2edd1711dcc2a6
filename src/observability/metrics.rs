use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub rounds_total: IntCounterVec,
    pub offer_responses_total: IntCounterVec,
    pub active_rounds: IntGauge,
    pub round_duration_seconds: HistogramVec,
    pub notification_failures_total: IntCounterVec,
    pub reaper_recoveries_total: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let rounds_total = IntCounterVec::new(
            Opts::new("rounds_total", "Matching rounds by outcome"),
            &["outcome"],
        )
        .expect("valid rounds_total metric");

        let offer_responses_total = IntCounterVec::new(
            Opts::new("offer_responses_total", "Driver offer responses by outcome"),
            &["outcome"],
        )
        .expect("valid offer_responses_total metric");

        let active_rounds = IntGauge::new("active_rounds", "Rounds currently awaiting a response")
            .expect("valid active_rounds metric");

        let round_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "round_duration_seconds",
                "Wall time of one matching round in seconds",
            )
            .buckets(vec![0.05, 0.25, 1.0, 2.5, 5.0, 10.0, 15.0, 20.0, 30.0]),
            &["outcome"],
        )
        .expect("valid round_duration_seconds metric");

        let notification_failures_total = IntCounterVec::new(
            Opts::new(
                "notification_failures_total",
                "Failed gateway deliveries by kind",
            ),
            &["kind"],
        )
        .expect("valid notification_failures_total metric");

        let reaper_recoveries_total = IntCounterVec::new(
            Opts::new(
                "reaper_recoveries_total",
                "Requests moved forward by the expiry reaper",
            ),
            &["kind"],
        )
        .expect("valid reaper_recoveries_total metric");

        registry
            .register(Box::new(rounds_total.clone()))
            .expect("register rounds_total");
        registry
            .register(Box::new(offer_responses_total.clone()))
            .expect("register offer_responses_total");
        registry
            .register(Box::new(active_rounds.clone()))
            .expect("register active_rounds");
        registry
            .register(Box::new(round_duration_seconds.clone()))
            .expect("register round_duration_seconds");
        registry
            .register(Box::new(notification_failures_total.clone()))
            .expect("register notification_failures_total");
        registry
            .register(Box::new(reaper_recoveries_total.clone()))
            .expect("register reaper_recoveries_total");

        Self {
            registry,
            rounds_total,
            offer_responses_total,
            active_rounds,
            round_duration_seconds,
            notification_failures_total,
            reaper_recoveries_total,
        }
    }

    pub fn encode(&self) -> Result<String, String> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        TextEncoder::new()
            .encode(&metric_families, &mut buffer)
            .map_err(|err| format!("failed to encode metrics: {err}"))?;

        String::from_utf8(buffer).map_err(|err| format!("metrics are not valid utf8: {err}"))
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
