use prometheus::{
    HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};

/// Prometheus metrics for the execution engine
pub struct EngineMetrics {
    pub registry: Registry,

    // Job counters
    pub jobs_submitted: IntCounter,
    pub job_attempts: IntCounterVec,
    pub jobs_finished: IntCounterVec,
    pub job_retries: IntCounter,

    // Gauges
    pub jobs_in_flight: IntGauge,
    pub queue_depth: IntGauge,

    // Store health
    pub persistence_failures: IntCounter,

    // Handler duration
    pub job_duration: HistogramVec,
}

impl EngineMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let jobs_submitted = IntCounter::new("js_jobs_submitted_total", "Total number of submitted jobs")?;
        registry.register(Box::new(jobs_submitted.clone()))?;

        let job_attempts = IntCounterVec::new(
            Opts::new("js_job_attempts_total", "Dispatched attempts by handler"),
            &["handler"],
        )?;
        registry.register(Box::new(job_attempts.clone()))?;

        let jobs_finished = IntCounterVec::new(
            Opts::new("js_jobs_finished_total", "Jobs reaching a terminal state by status and handler"),
            &["status", "handler"],
        )?;
        registry.register(Box::new(jobs_finished.clone()))?;

        let job_retries = IntCounter::new("js_job_retries_total", "Failed attempts scheduled for retry")?;
        registry.register(Box::new(job_retries.clone()))?;

        let jobs_in_flight = IntGauge::new("js_jobs_in_flight", "Number of executing attempts")?;
        registry.register(Box::new(jobs_in_flight.clone()))?;

        let queue_depth = IntGauge::new("js_queue_depth", "Jobs waiting in the dispatch queue")?;
        registry.register(Box::new(queue_depth.clone()))?;

        let persistence_failures = IntCounter::new(
            "js_persistence_failures_total",
            "Store writes that failed during execution",
        )?;
        registry.register(Box::new(persistence_failures.clone()))?;

        let job_duration = HistogramVec::new(
            HistogramOpts::new("js_job_duration_seconds", "Handler run time in seconds"),
            &["handler"],
        )?;
        registry.register(Box::new(job_duration.clone()))?;

        Ok(EngineMetrics {
            registry,
            jobs_submitted,
            job_attempts,
            jobs_finished,
            job_retries,
            jobs_in_flight,
            queue_depth,
            persistence_failures,
            job_duration,
        })
    }

    /// Count one dispatch
    pub fn inc_attempts(&self, handler: &str) {
        self.job_attempts.with_label_values(&[handler]).inc();
    }

    /// Count a job reaching a terminal state
    pub fn inc_finished(&self, status: &str, handler: &str) {
        self.jobs_finished
            .with_label_values(&[status, handler])
            .inc();
    }

    /// Record handler run time
    pub fn observe_duration(&self, handler: &str, duration_secs: f64) {
        self.job_duration
            .with_label_values(&[handler])
            .observe(duration_secs);
    }

    /// Render every metric in the Prometheus text format
    pub fn encode(&self) -> prometheus::Result<String> {
        use prometheus::{Encoder, TextEncoder};

        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
