//! Rotation Scheduler
//!
//! Drives periodic rotation for every configuration with a
//! `rotation_interval` and automatic rotation enabled. Each configuration gets
//! its own loop; a fatal error disables automatic rotation for that
//! configuration and stops its loop, so a broken template is not retried
//! forever.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::task::JoinSet;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;

use crate::config::ConfigurationId;
use crate::error::{ErrorKind, RotationError, RotationResult};
use crate::orchestrator::Orchestrator;
use crate::settings::SchedulerSettings;

/// Spread `interval` by ±10%
pub fn apply_jitter(interval: Duration) -> Duration {
    let factor = rand::rng().random_range(0.9..=1.1);
    interval.mul_f64(factor)
}

/// Whether the scheduler should stop driving a configuration after `error`
///
/// Conflicts and cancellations belong to someone else's operation; retryable
/// errors already went through backoff and get another chance next interval.
pub fn is_fatal(error: &RotationError) -> bool {
    !error.is_retryable()
        && !matches!(
            error.kind(),
            ErrorKind::Conflict | ErrorKind::Cancelled | ErrorKind::NotFound
        )
}

/// Periodic rotation on top of an [`Orchestrator`]
#[derive(Clone)]
pub struct RotationScheduler {
    orchestrator: Arc<Orchestrator>,
    settings: SchedulerSettings,
}

impl RotationScheduler {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        let settings = orchestrator.settings().scheduler.clone();
        Self {
            orchestrator,
            settings,
        }
    }

    #[must_use]
    pub fn with_settings(mut self, settings: SchedulerSettings) -> Self {
        self.settings = settings;
        self
    }

    fn next_rotation_time(&self, interval: Duration) -> Instant {
        let wait = if self.settings.jitter {
            apply_jitter(interval)
        } else {
            interval
        };
        Instant::now() + wait
    }

    /// Run until `shutdown` fires
    ///
    /// Reconciles interrupted configurations first when enabled, then spawns
    /// one loop per scheduled configuration. Configurations registered later
    /// are picked up on the next start.
    pub async fn run(&self, shutdown: CancellationToken) -> RotationResult<()> {
        if self.settings.reconcile_on_start {
            for report in self.orchestrator.reconcile_all().await? {
                match report.result {
                    Ok(config) => tracing::info!(
                        config_id = %report.id,
                        status = %config.status,
                        "reconciled on start"
                    ),
                    Err(e) => tracing::warn!(
                        config_id = %report.id,
                        error = %e,
                        "reconcile on start failed"
                    ),
                }
            }
        }

        let configs = self.orchestrator.repository().list().await?;
        let mut loops = JoinSet::new();
        for config in configs.into_iter().filter(|c| c.is_scheduled()) {
            let Some(interval) = config.rotation_interval else {
                continue;
            };
            let scheduler = self.clone();
            let token = shutdown.child_token();
            loops.spawn(async move {
                let id = config.id;
                let outcome = scheduler.run_rotation_loop(id.clone(), interval, token).await;
                (id, outcome)
            });
        }
        tracing::info!(loops = loops.len(), "rotation scheduler started");

        while let Some(joined) = loops.join_next().await {
            match joined {
                Ok((id, Err(e))) => {
                    tracing::error!(config_id = %id, error = %e, "rotation loop stopped");
                }
                Ok((_, Ok(()))) => {}
                Err(e) => tracing::error!(error = %e, "rotation loop panicked"),
            }
        }
        tracing::info!("rotation scheduler stopped");
        Ok(())
    }

    /// Rotate `id` every `interval` until shutdown or a fatal error
    ///
    /// Returns the fatal error after disabling automatic rotation; returns
    /// `Ok` on shutdown or when the configuration is gone or no longer
    /// scheduled.
    pub async fn run_rotation_loop(
        &self,
        id: ConfigurationId,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> RotationResult<()> {
        loop {
            let next_rotation = self.next_rotation_time(interval);

            tokio::select! {
                () = sleep_until(next_rotation) => {}
                () = shutdown.cancelled() => {
                    tracing::info!(config_id = %id, "rotation loop shutting down gracefully");
                    return Ok(());
                }
            }

            match self.orchestrator.status(&id).await {
                Ok(config) if !config.is_scheduled() => {
                    tracing::info!(config_id = %id, "automatic rotation disabled; leaving loop");
                    return Ok(());
                }
                Ok(_) => {}
                Err(RotationError::NotFound { .. }) => {
                    tracing::info!(config_id = %id, "configuration removed; leaving loop");
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(config_id = %id, error = %e, "could not load configuration");
                    continue;
                }
            }

            match self.orchestrator.rotate_with_retry(&id).await {
                Ok(config) => {
                    tracing::info!(
                        config_id = %id,
                        active_index = %config.active_index,
                        "periodic rotation completed successfully"
                    );
                }
                Err(RotationError::NotFound { .. }) => return Ok(()),
                Err(e) if is_fatal(&e) => {
                    tracing::error!(
                        config_id = %id,
                        error_kind = %e.kind(),
                        error = %e,
                        "periodic rotation failed fatally; disabling automatic rotation"
                    );
                    if let Err(disable) = self.orchestrator.disable_auto_rotation(&id).await {
                        tracing::error!(config_id = %id, error = %disable, "could not disable automatic rotation");
                    }
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!(
                        config_id = %id,
                        error_kind = %e.kind(),
                        error = %e,
                        "periodic rotation failed; will retry next interval"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_jitter_stays_within_ten_percent() {
        let base = Duration::from_secs(1000);
        for _ in 0..100 {
            let jittered = apply_jitter(base);
            assert!(jittered >= Duration::from_secs(900), "{jittered:?}");
            assert!(jittered <= Duration::from_secs(1100), "{jittered:?}");
        }
    }

    #[rstest]
    #[case(RotationError::policy("no {{password}}"), true)]
    #[case(RotationError::Validation { username: "svc".into(), reason: "rejected".into() }, true)]
    #[case(RotationError::RedactionInvariantViolation, true)]
    #[case(RotationError::Connectivity { operation: "connect".into(), reason: "refused".into() }, false)]
    #[case(RotationError::ConcurrentOperation { config_id: "c".into(), status: "rotate".into() }, false)]
    #[case(RotationError::Cancelled { operation: "rotate".into() }, false)]
    fn test_fatal_classification(#[case] error: RotationError, #[case] fatal: bool) {
        assert_eq!(is_fatal(&error), fatal, "{error}");
    }
}
