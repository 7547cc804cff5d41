//! Background sweeper for overdue stages and unfinished certificate issuance.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::manager::{ClearanceManager, Storage};

/// Periodically records reminders for stale stages and retries certificate
/// issuance that never finished.
///
/// Each pass runs both jobs, then refreshes the status snapshot. An error in one
/// job is logged and does not stop the loop.
pub struct Sweeper<S: Storage + 'static> {
    manager: Arc<ClearanceManager<S>>,
}

impl<S: Storage + 'static> Sweeper<S> {
    pub fn new(manager: Arc<ClearanceManager<S>>) -> Self {
        Self { manager }
    }

    /// Run one pass. Returns `(reminders, certificates)`.
    pub async fn sweep_once(&self) -> (usize, usize) {
        let reminders = match self.manager.send_stale_reminders(Utc::now()).await {
            Ok(count) => count,
            Err(e) => {
                tracing::error!(error = %e, "Failed to send stale stage reminders");
                0
            }
        };
        let certificates = match self.manager.retry_unissued_certificates().await {
            Ok(count) => count,
            Err(e) => {
                tracing::error!(error = %e, "Failed to retry certificate issuance");
                0
            }
        };
        if reminders > 0 || certificates > 0 {
            tracing::info!(reminders, certificates, "Sweep finished");
        }
        match self.manager.dashboard_stats().await {
            Ok(stats) => tracing::debug!(
                open = stats.pending + stats.in_progress,
                busiest_unit = ?stats.bottlenecks.first().map(|b| b.unit.to_string()),
                "Clearance status snapshot"
            ),
            Err(e) => tracing::warn!(error = %e, "Failed to compute dashboard stats"),
        }
        (reminders, certificates)
    }

    /// Loop until `shutdown_token` is cancelled. The first pass runs immediately.
    pub async fn run(self, shutdown_token: CancellationToken) {
        let interval_ms = self.manager.config().sweep_interval_ms;
        let mut interval = tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
        tracing::info!(interval_ms, "Clearance sweeper started");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.sweep_once().await;
                }
                _ = shutdown_token.cancelled() => {
                    tracing::info!("Shutting down clearance sweeper");
                    break;
                }
            }
        }
    }
}
