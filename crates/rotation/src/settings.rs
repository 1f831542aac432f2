//! Engine-wide settings

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::generator::PasswordRequirements;
use crate::retry::RetryPolicy;

/// Default deadline for every external call
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Settings shared by every operation of an [`Orchestrator`](crate::Orchestrator)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Deadline applied to each connect, apply, probe and store call
    #[serde(with = "humantime_serde")]
    pub call_timeout: Duration,

    /// Backoff for retried transitions
    pub retry: RetryPolicy,

    pub scheduler: SchedulerSettings,

    /// Used when a configuration's parameters carry no requirements
    pub default_password_requirements: PasswordRequirements,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            call_timeout: DEFAULT_CALL_TIMEOUT,
            retry: RetryPolicy::default(),
            scheduler: SchedulerSettings::default(),
            default_password_requirements: PasswordRequirements::default(),
        }
    }
}

/// Periodic scheduler knobs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    /// Spread each wait by ±10% so configurations sharing an interval do not
    /// rotate in lockstep
    pub jitter: bool,

    /// Reconcile configurations left mid-operation before scheduling
    pub reconcile_on_start: bool,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            jitter: true,
            reconcile_on_start: true,
        }
    }
}
