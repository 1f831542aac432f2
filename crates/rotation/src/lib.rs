//! Keyshift Rotation - zero-downtime machine credential rotation
//!
//! Replaces credentials at an external system (initially database logins)
//! and republishes them to a secret store without ever leaving consumers
//! unable to authenticate.
//!
//! # Features
//!
//! - **Dual-slot rotation** - two identities take turns; only the standby one
//!   is ever changed, and it becomes active only after it verified
//! - **Pluggable strategies** - one [`RotationStrategy`] per target type
//! - **Scoped connections** - released on every exit path
//! - **Redacted errors** - generated passwords never leave the engine in
//!   error text
//! - **Secret hygiene** - passwords live in zeroizing [`SecretString`]s
#![forbid(unsafe_code)]

/// Lifecycle types: configuration, status, slots
pub mod config;
/// Connection adapter, resolver and driver seams
pub mod connection;
/// Per-operation deadline and cancellation
pub mod context;
/// Credentials and secret payload entries
pub mod credential;
/// Error types
pub mod error;
/// Password generation
pub mod generator;
/// Lifecycle driver
pub mod orchestrator;
/// Error scrubbing
pub mod redact;
/// Retry with backoff
pub mod retry;
/// Periodic rotation
pub mod scheduler;
pub mod secret;
/// Engine settings
pub mod settings;
/// Configuration repository and secret store seams
pub mod store;
/// Rotation strategies
pub mod strategy;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;

// ── Root re-exports ─────────────────────────────────────────────────────────

pub use crate::config::{
    ConfigurationId, RotationConfiguration, RotationStatus, SecretScope, SecretsMapping,
    SlotIndex, TargetType,
};
pub use crate::connection::{
    ConnectionAdapter, ConnectionDetails, ConnectionRef, ConnectionResolver, Dialect, Driver,
    ScopedConnection, Session, StaticConnectionResolver,
};
pub use crate::context::OperationContext;
pub use crate::credential::{Credential, GeneratedCredentialSet, SecretEntry};
pub use crate::error::{ErrorKind, RotationError, RotationResult};
pub use crate::generator::{PasswordRequirements, RequiredCounts, generate};
pub use crate::orchestrator::{Operation, Orchestrator, ReconcileReport};
pub use crate::redact::Redactor;
pub use crate::retry::RetryPolicy;
pub use crate::scheduler::RotationScheduler;
pub use crate::secret::SecretString;
pub use crate::settings::{EngineSettings, SchedulerSettings};
pub use crate::store::{
    ConfigurationRepository, MemoryConfigurationStore, MemorySecretStore, SecretStore,
};
pub use crate::strategy::{
    RotationStrategy, SqlCredentialsParameters, SqlCredentialsStrategy, StrategyContext,
    StrategyRegistry,
};

#[cfg(feature = "sql")]
pub use crate::connection::sql::SqlDriver;

/// Commonly used types and traits
pub mod prelude {
    pub use crate::{
        ConfigurationId, ConfigurationRepository, ConnectionAdapter, Credential, ErrorKind,
        Orchestrator, RotationConfiguration, RotationError, RotationResult, RotationStatus,
        RotationStrategy, SecretStore, SecretString, SlotIndex,
    };
}
