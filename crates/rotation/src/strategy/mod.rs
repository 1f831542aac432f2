//! Pluggable rotation strategies
//!
//! A [`RotationStrategy`] knows how to issue, rotate and revoke credentials
//! on one kind of target system. Strategies are registered by [`TargetType`]
//! in a [`StrategyRegistry`] and driven by the orchestrator.

pub mod sql;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::{SecretsMapping, SlotIndex, TargetType};
use crate::connection::{ConnectionAdapter, ConnectionRef, ScopedConnection};
use crate::context::OperationContext;
use crate::credential::{Credential, GeneratedCredentialSet, SecretEntry};
use crate::error::{RotationError, RotationResult};
use crate::generator::PasswordRequirements;
use crate::secret::SecretString;

pub use sql::{SqlCredentialsParameters, SqlCredentialsStrategy};

/// What a strategy needs from the engine for one operation
pub struct StrategyContext<'a> {
    pub adapter: &'a ConnectionAdapter,
    pub connection_ref: &'a ConnectionRef,
    pub ctx: &'a OperationContext,
    /// Used when the parameters carry no password requirements
    pub default_requirements: &'a PasswordRequirements,
}

impl StrategyContext<'_> {
    /// Open a connection with the admin login
    pub async fn open_admin(&self) -> RotationResult<ScopedConnection> {
        self.adapter.open(self.ctx, self.connection_ref, None).await
    }

    /// Prove `credential` authenticates, on a connection of its own
    ///
    /// Runs after apply, so cancellation is no longer honoured here. A
    /// rejected login becomes [`RotationError::Validation`]; connectivity
    /// failures and timeouts keep their kind and stay retryable.
    pub async fn verify(&self, credential: &Credential) -> RotationResult<()> {
        let ctx = self.ctx.without_cancellation();
        let classify = |e: RotationError| match e {
            RotationError::Connectivity { .. }
            | RotationError::Timeout { .. }
            | RotationError::Cancelled { .. } => e,
            other => RotationError::Validation {
                username: credential.username.clone(),
                reason: other.to_string(),
            },
        };

        let mut conn = self
            .adapter
            .open(&ctx, self.connection_ref, Some(credential))
            .await
            .map_err(classify)?;
        let probed = conn.probe(&ctx).await;
        conn.close().await;
        probed.map_err(classify)?;

        tracing::debug!(username = %credential.username, "credential verified");
        Ok(())
    }
}

/// Credential lifecycle on one kind of target system
#[async_trait]
pub trait RotationStrategy: Send + Sync {
    fn target_type(&self) -> TargetType;

    /// Reject unusable parameters before anything touches the target
    fn validate_parameters(&self, parameters: &Value) -> RotationResult<()>;

    /// Identities in slot order
    fn identities(&self, parameters: &Value) -> RotationResult<Vec<String>>;

    /// Set fresh passwords on every identity in one transaction, then verify
    /// each on its own connection
    async fn issue_credentials(
        &self,
        cx: &StrategyContext<'_>,
        parameters: &Value,
    ) -> RotationResult<GeneratedCredentialSet>;

    /// Replace the standby identity's password; the active identity is never
    /// touched
    async fn rotate_credentials(
        &self,
        cx: &StrategyContext<'_>,
        parameters: &Value,
        active: SlotIndex,
    ) -> RotationResult<Credential>;

    /// Set a discarded random password on each identity; safe to repeat
    async fn revoke_credentials(
        &self,
        cx: &StrategyContext<'_>,
        parameters: &Value,
        identities: &[String],
    ) -> RotationResult<()>;

    /// Map a credential onto the secret store keys
    fn get_secrets_payload(&self, credential: &Credential, mapping: &SecretsMapping) -> Vec<SecretEntry> {
        secrets_payload(credential, mapping)
    }
}

/// `[{username key, username}, {password key, password}]`
pub fn secrets_payload(credential: &Credential, mapping: &SecretsMapping) -> Vec<SecretEntry> {
    vec![
        SecretEntry::new(
            mapping.username.clone(),
            SecretString::new(credential.username.clone()),
        ),
        SecretEntry::new(mapping.password.clone(), credential.password.clone()),
    ]
}

/// Strategies by target type
#[derive(Default, Clone)]
pub struct StrategyRegistry {
    strategies: HashMap<TargetType, Arc<dyn RotationStrategy>>,
}

impl StrategyRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in strategy
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(SqlCredentialsStrategy::new()));
        registry
    }

    /// Register `strategy`, replacing any previous one for its target type
    pub fn register(&mut self, strategy: Arc<dyn RotationStrategy>) {
        self.strategies.insert(strategy.target_type(), strategy);
    }

    pub fn get(&self, target_type: TargetType) -> RotationResult<Arc<dyn RotationStrategy>> {
        self.strategies
            .get(&target_type)
            .cloned()
            .ok_or_else(|| RotationError::UnsupportedTarget {
                target_type: target_type.to_string(),
            })
    }
}
