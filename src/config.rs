//! Engine configuration.

use serde::{Deserialize, Serialize};

use crate::error::{ClearanceError, Result};
use crate::policy::PipelineConfig;

/// Configuration for the clearance manager and its background sweeper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Stage plan applied to every new request
    pub pipeline: PipelineConfig,

    /// How long an actionable stage may wait before its verifiers are reminded,
    /// as a humantime string ("7d", "36h")
    pub stale_stage_after: String,

    /// How long the sweeper sleeps between passes (milliseconds)
    pub sweep_interval_ms: u64,

    /// Maximum number of requests returned for one verifier queue, and of unissued
    /// certificates retried per sweeper pass
    pub sweep_batch_size: usize,

    /// How long an issuance claim may go without renewal before the sweeper retries
    /// it (milliseconds). The holder renews it three times per timeout while the
    /// issuer runs, so this only expires after a failure or a crash mid-issue.
    pub issuance_claim_timeout_ms: u64,

    /// Number of units listed in dashboard bottlenecks
    pub bottleneck_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pipeline: PipelineConfig::default(),
            stale_stage_after: "7d".to_string(),
            sweep_interval_ms: 3_600_000,      // hourly
            sweep_batch_size: 500,
            issuance_claim_timeout_ms: 300_000, // 5 minutes
            bottleneck_limit: 5,
        }
    }
}

impl EngineConfig {
    /// Parse a JSON document; absent fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.pipeline.validate()?;
        self.stale_stage_threshold()?;
        if self.sweep_interval_ms == 0 {
            return Err(ClearanceError::Configuration(
                "sweep_interval_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// `stale_stage_after` as a duration.
    pub fn stale_stage_threshold(&self) -> Result<chrono::Duration> {
        let parsed = humantime::parse_duration(&self.stale_stage_after).map_err(|e| {
            ClearanceError::Configuration(format!(
                "invalid stale_stage_after '{}': {}",
                self.stale_stage_after, e
            ))
        })?;
        chrono::Duration::from_std(parsed).map_err(|e| {
            ClearanceError::Configuration(format!(
                "stale_stage_after '{}' is out of range: {}",
                self.stale_stage_after, e
            ))
        })
    }

    pub fn issuance_claim_timeout(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.issuance_claim_timeout_ms as i64)
    }

    /// How often an in-flight issuance renews its claim: three times per timeout.
    pub fn issuance_heartbeat_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis((self.issuance_claim_timeout_ms / 3).max(1))
    }
}
