//! Prometheus metrics for clearance workflow monitoring.
//!
//! Counters at transition sites are emitted through the `metrics` facade regardless
//! of this module. This module adds an optional Prometheus registry with:
//! - **Gauges**: requests per status, waiting stages per unit
//! - **Counters**: stage decisions by action and role, certificate issuance outcomes
//! - **Histograms**: time from request creation to completion

#[cfg(feature = "metrics")]
use prometheus::{CounterVec, GaugeVec, Histogram, HistogramOpts, Opts, Registry};

#[cfg(feature = "metrics")]
use crate::domain::principal::VerifierRole;
#[cfg(feature = "metrics")]
use crate::domain::request::RequestStatus;
#[cfg(feature = "metrics")]
use crate::domain::stage::StageAction;
#[cfg(feature = "metrics")]
use crate::error::Result;
#[cfg(feature = "metrics")]
use crate::manager::DashboardStats;

/// Prometheus metrics registry for the clearance engine.
#[cfg(feature = "metrics")]
#[derive(Clone)]
pub struct ClearanceMetrics {
    registry: Registry,

    // Gauges (point-in-time state)
    requests_by_status: GaugeVec,
    pending_stages: GaugeVec,

    // Counters (cumulative totals)
    stage_decisions_total: CounterVec,
    certificates_total: CounterVec,

    // Histograms (distributions)
    clearance_duration_seconds: Histogram,
}

#[cfg(feature = "metrics")]
impl ClearanceMetrics {
    /// Register all metrics with the provided Prometheus registry.
    ///
    /// # Errors
    ///
    /// Returns an error if metrics fail to register (e.g., duplicate registration).
    pub fn new(registry: Registry) -> Result<Self> {
        let requests_by_status = GaugeVec::new(
            Opts::new(
                "clearance_requests",
                "Number of clearance requests by status",
            ),
            &["status"],
        )
        .map_err(|e| anyhow::anyhow!("Failed to create requests gauge: {}", e))?;

        let pending_stages = GaugeVec::new(
            Opts::new(
                "clearance_pending_stages",
                "Pending stages on open requests, for the busiest units",
            ),
            &["unit"],
        )
        .map_err(|e| anyhow::anyhow!("Failed to create pending_stages gauge: {}", e))?;

        let stage_decisions_total = CounterVec::new(
            Opts::new(
                "clearance_stage_decisions_total",
                "Total number of stage decisions by action and verifier role",
            ),
            &["action", "role"],
        )
        .map_err(|e| anyhow::anyhow!("Failed to create stage_decisions_total counter: {}", e))?;

        let certificates_total = CounterVec::new(
            Opts::new(
                "clearance_certificates_total",
                "Certificate issuance attempts by outcome",
            ),
            &["outcome"],
        )
        .map_err(|e| anyhow::anyhow!("Failed to create certificates_total counter: {}", e))?;

        // Clearances take days, not seconds
        let clearance_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "clearance_duration_seconds",
                "Time from request creation to completion in seconds",
            )
            .buckets(vec![
                3_600.0, 21_600.0, 86_400.0, 259_200.0, 604_800.0, 1_209_600.0, 2_592_000.0,
            ]),
        )
        .map_err(|e| anyhow::anyhow!("Failed to create clearance_duration_seconds histogram: {}", e))?;

        registry
            .register(Box::new(requests_by_status.clone()))
            .map_err(|e| anyhow::anyhow!("Failed to register requests gauge: {}", e))?;
        registry
            .register(Box::new(pending_stages.clone()))
            .map_err(|e| anyhow::anyhow!("Failed to register pending_stages: {}", e))?;
        registry
            .register(Box::new(stage_decisions_total.clone()))
            .map_err(|e| anyhow::anyhow!("Failed to register stage_decisions_total: {}", e))?;
        registry
            .register(Box::new(certificates_total.clone()))
            .map_err(|e| anyhow::anyhow!("Failed to register certificates_total: {}", e))?;
        registry
            .register(Box::new(clearance_duration_seconds.clone()))
            .map_err(|e| {
                anyhow::anyhow!("Failed to register clearance_duration_seconds: {}", e)
            })?;

        Ok(Self {
            registry,
            requests_by_status,
            pending_stages,
            stage_decisions_total,
            certificates_total,
            clearance_duration_seconds,
        })
    }

    /// Get the underlying Prometheus registry.
    ///
    /// Useful for exporting metrics via HTTP endpoint.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Replace the status and bottleneck gauges with a fresh snapshot.
    pub fn observe_dashboard(&self, stats: &DashboardStats) {
        for status in [
            RequestStatus::Pending,
            RequestStatus::InProgress,
            RequestStatus::Completed,
            RequestStatus::Rejected,
        ] {
            self.requests_by_status
                .with_label_values(&[status.as_str()])
                .set(stats.count(status) as f64);
        }

        // Units drop out of the top list, so stale labels must go
        self.pending_stages.reset();
        for bottleneck in &stats.bottlenecks {
            self.pending_stages
                .with_label_values(&[bottleneck.unit.to_string().as_str()])
                .set(bottleneck.pending_count as f64);
        }
    }

    pub fn record_stage_decision(&self, action: StageAction, role: VerifierRole) {
        self.stage_decisions_total
            .with_label_values(&[action.as_str(), role.as_str()])
            .inc();
    }

    /// `outcome` should be low-cardinality: "issued" or "failed".
    pub fn record_certificate(&self, outcome: &str) {
        self.certificates_total.with_label_values(&[outcome]).inc();
    }

    pub fn record_completion(&self, duration: chrono::Duration) {
        self.clearance_duration_seconds
            .observe(duration.num_milliseconds().max(0) as f64 / 1000.0);
    }
}
