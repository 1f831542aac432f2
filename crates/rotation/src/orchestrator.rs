//! Rotation Orchestrator
//!
//! Drives a [`RotationConfiguration`] through its lifecycle. Each operation:
//!
//! 1. registers itself in the in-process in-flight registry (a second caller
//!    for the same configuration fails fast with
//!    [`RotationError::ConcurrentOperation`]),
//! 2. claims the configuration by compare-and-set on its status,
//! 3. runs the strategy against a scoped connection,
//! 4. publishes the secrets payload, then flips `active_index`,
//! 5. records the outcome, with every error already redacted.
//!
//! A failed rotation never touches the active slot, so consumers keep
//! authenticating with the credential they already hold.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio_util::sync::CancellationToken;

use crate::config::{ConfigurationId, RotationConfiguration, RotationStatus, SlotIndex};
use crate::connection::ConnectionAdapter;
use crate::context::OperationContext;
use crate::credential::{Credential, GeneratedCredentialSet};
use crate::error::{RotationError, RotationResult};
use crate::redact::Redactor;
use crate::retry::retry_with_backoff;
use crate::settings::EngineSettings;
use crate::store::{ConfigurationRepository, SecretStore};
use crate::strategy::{RotationStrategy, StrategyContext, StrategyRegistry};

/// Operation holding a configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Register,
    Issue,
    Rotate,
    Revoke,
    Reconcile,
    Configure,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Register => "register",
            Self::Issue => "issue",
            Self::Rotate => "rotate",
            Self::Revoke => "revoke",
            Self::Reconcile => "reconcile",
            Self::Configure => "configure",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct InFlight {
    operation: Operation,
    cancel: CancellationToken,
}

/// Removes the registry entry when the operation ends, however it ends
struct InFlightGuard<'a> {
    registry: &'a DashMap<ConfigurationId, InFlight>,
    id: ConfigurationId,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.registry.remove(&self.id);
    }
}

/// Outcome of reconciling one configuration during [`Orchestrator::reconcile_all`]
#[derive(Debug)]
pub struct ReconcileReport {
    pub id: ConfigurationId,
    pub result: RotationResult<RotationConfiguration>,
}

/// Runs issue, rotate, revoke and reconcile against configured collaborators
pub struct Orchestrator {
    repository: Arc<dyn ConfigurationRepository>,
    secrets: Arc<dyn SecretStore>,
    strategies: StrategyRegistry,
    adapter: ConnectionAdapter,
    settings: EngineSettings,
    in_flight: DashMap<ConfigurationId, InFlight>,
}

impl Orchestrator {
    /// Orchestrator with the built-in strategies and default settings
    pub fn new(
        repository: Arc<dyn ConfigurationRepository>,
        secrets: Arc<dyn SecretStore>,
        adapter: ConnectionAdapter,
    ) -> Self {
        Self {
            repository,
            secrets,
            strategies: StrategyRegistry::with_defaults(),
            adapter,
            settings: EngineSettings::default(),
            in_flight: DashMap::new(),
        }
    }

    #[must_use]
    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    #[must_use]
    pub fn with_strategies(mut self, strategies: StrategyRegistry) -> Self {
        self.strategies = strategies;
        self
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn repository(&self) -> &Arc<dyn ConfigurationRepository> {
        &self.repository
    }

    /// Whether an operation on `id` is running in this process
    pub fn is_in_flight(&self, id: &ConfigurationId) -> bool {
        self.in_flight.contains_key(id)
    }

    /// Operation currently holding `id` in this process
    pub fn in_flight_operation(&self, id: &ConfigurationId) -> Option<Operation> {
        self.in_flight.get(id).map(|entry| entry.operation)
    }

    /// Request cancellation of the operation running on `id`
    ///
    /// Only honoured before the apply step. Returns `false` when nothing is
    /// running.
    pub fn cancel(&self, id: &ConfigurationId) -> bool {
        match self.in_flight.get(id) {
            Some(entry) => {
                tracing::info!(config_id = %id, operation = %entry.operation, "cancellation requested");
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    fn begin(
        &self,
        id: &ConfigurationId,
        operation: Operation,
    ) -> RotationResult<(InFlightGuard<'_>, OperationContext)> {
        let cancel = CancellationToken::new();
        match self.in_flight.entry(id.clone()) {
            Entry::Occupied(entry) => {
                return Err(RotationError::ConcurrentOperation {
                    config_id: id.to_string(),
                    status: entry.get().operation.to_string(),
                });
            }
            Entry::Vacant(entry) => {
                entry.insert(InFlight {
                    operation,
                    cancel: cancel.clone(),
                });
            }
        }
        let guard = InFlightGuard {
            registry: &self.in_flight,
            id: id.clone(),
        };
        let ctx = OperationContext::new(operation.as_str(), self.settings.call_timeout)
            .with_cancellation(cancel);
        Ok((guard, ctx))
    }

    fn strategy_context<'a>(
        &'a self,
        ctx: &'a OperationContext,
        config: &'a RotationConfiguration,
    ) -> StrategyContext<'a> {
        StrategyContext {
            adapter: &self.adapter,
            connection_ref: &config.connection_ref,
            ctx,
            default_requirements: &self.settings.default_password_requirements,
        }
    }

    async fn load(
        &self,
        ctx: &OperationContext,
        id: &ConfigurationId,
    ) -> RotationResult<RotationConfiguration> {
        ctx.cancellable("load configuration", self.repository.load(id))
            .await
    }

    /// Compare-and-set `config` from its current status to `next`
    async fn claim(
        &self,
        ctx: &OperationContext,
        config: &RotationConfiguration,
        next: RotationStatus,
    ) -> RotationResult<RotationConfiguration> {
        config.status.transition_to(next)?;
        let claimed = ctx
            .bounded(
                "claim configuration",
                self.repository
                    .compare_and_set_status(&config.id, config.status, next),
            )
            .await?;
        tracing::debug!(config_id = %config.id, from = %config.status, to = %next, "configuration claimed");
        Ok(claimed)
    }

    async fn persist(
        &self,
        ctx: &OperationContext,
        config: &RotationConfiguration,
    ) -> RotationResult<()> {
        ctx.bounded("save configuration", self.repository.save(config))
            .await
    }

    /// Persist a failed outcome; a store failure here is logged, the
    /// operation's own error is what the caller sees
    async fn record_failure(
        &self,
        ctx: &OperationContext,
        config: &mut RotationConfiguration,
        status: RotationStatus,
        error: &RotationError,
    ) {
        config.status = status;
        config.record_failure(error);
        if let Err(e) = self.persist(ctx, config).await {
            tracing::error!(
                config_id = %config.id,
                status = %status,
                error = %e,
                "failed to record operation failure"
            );
        }
    }

    async fn publish(
        &self,
        ctx: &OperationContext,
        strategy: &dyn RotationStrategy,
        config: &RotationConfiguration,
        credential: &Credential,
    ) -> RotationResult<()> {
        let payload = strategy.get_secrets_payload(credential, &config.secrets_mapping);
        let redactor = Redactor::for_credentials([credential]);
        ctx.bounded("publish secrets", self.secrets.publish(&config.scope, &payload))
            .await
            .map_err(|e| redactor.scrub(e))?;
        tracing::debug!(
            config_id = %config.id,
            scope = %config.scope,
            username = %credential.username,
            "secrets payload published"
        );
        Ok(())
    }

    /// Validate and store a new configuration in `pending`
    pub async fn register(
        &self,
        config: RotationConfiguration,
    ) -> RotationResult<RotationConfiguration> {
        let (_guard, ctx) = self.begin(&config.id, Operation::Register)?;
        if config.status != RotationStatus::Pending {
            return Err(RotationError::InvalidStateTransition {
                from: config.status.to_string(),
                to: RotationStatus::Pending.to_string(),
            });
        }
        let strategy = self.strategies.get(config.target_type)?;
        strategy.validate_parameters(&config.parameters)?;

        match ctx.bounded("load configuration", self.repository.load(&config.id)).await {
            Ok(existing) => {
                return Err(RotationError::policy(format!(
                    "configuration {} already exists ({})",
                    existing.id, existing.status
                )));
            }
            Err(RotationError::NotFound { .. }) => {}
            Err(e) => return Err(e),
        }

        self.persist(&ctx, &config).await?;
        tracing::info!(config_id = %config.id, target_type = %config.target_type, "configuration registered");
        Ok(config)
    }

    pub async fn status(&self, id: &ConfigurationId) -> RotationResult<RotationConfiguration> {
        let ctx = OperationContext::new("status", self.settings.call_timeout);
        ctx.bounded("load configuration", self.repository.load(id))
            .await
    }

    /// Issue initial credentials for both slots
    ///
    /// On success slot 0 is active and its credential is published. On
    /// failure the configuration returns to `pending`.
    #[tracing::instrument(skip_all, fields(config_id = %id))]
    pub async fn issue(&self, id: &ConfigurationId) -> RotationResult<RotationConfiguration> {
        let (_guard, ctx) = self.begin(id, Operation::Issue)?;
        let config = self.load(&ctx, id).await?;
        let strategy = self.strategies.get(config.target_type)?;
        let mut config = self.claim(&ctx, &config, RotationStatus::Issuing).await?;

        let outcome = self.run_issue(&ctx, strategy.as_ref(), &config).await;
        match outcome {
            Ok(_set) => {
                config.active_index = SlotIndex::Primary;
                config.status = RotationStatus::Active;
                config.record_success();
                self.persist(&ctx, &config).await?;
                tracing::info!(config_id = %id, "credentials issued");
                Ok(config)
            }
            Err(error) => {
                tracing::warn!(config_id = %id, error_kind = %error.kind(), error = %error, "issue failed");
                self.record_failure(&ctx, &mut config, RotationStatus::Pending, &error)
                    .await;
                Err(error)
            }
        }
    }

    async fn run_issue(
        &self,
        ctx: &OperationContext,
        strategy: &dyn RotationStrategy,
        config: &RotationConfiguration,
    ) -> RotationResult<GeneratedCredentialSet> {
        let cx = self.strategy_context(ctx, config);
        let set = strategy.issue_credentials(&cx, &config.parameters).await?;
        let primary = set
            .get(SlotIndex::Primary)
            .ok_or_else(|| RotationError::Internal("issued credential set is empty".into()))?;
        self.publish(&ctx.without_cancellation(), strategy, config, primary)
            .await?;
        Ok(set)
    }

    /// Replace the standby credential, publish it and make it active
    ///
    /// On failure the configuration moves to `error` with `active_index` and
    /// the active credential untouched. A cancelled rotation returns to the
    /// status it started from.
    #[tracing::instrument(skip_all, fields(config_id = %id))]
    pub async fn rotate(&self, id: &ConfigurationId) -> RotationResult<RotationConfiguration> {
        let (_guard, ctx) = self.begin(id, Operation::Rotate)?;
        let config = self.load(&ctx, id).await?;
        let strategy = self.strategies.get(config.target_type)?;
        let previous = config.status;
        let mut config = self.claim(&ctx, &config, RotationStatus::Rotating).await?;
        let active = config.active_index;

        let outcome = self.run_rotate(&ctx, strategy.as_ref(), &config).await;
        match outcome {
            Ok(()) => {
                config.active_index = active.other();
                config.status = RotationStatus::Active;
                config.record_success();
                self.persist(&ctx, &config).await?;
                tracing::info!(
                    config_id = %id,
                    active_index = %config.active_index,
                    "credentials rotated"
                );
                Ok(config)
            }
            Err(error) => {
                let status = match error {
                    RotationError::Cancelled { .. } => previous,
                    _ => RotationStatus::Error,
                };
                tracing::warn!(
                    config_id = %id,
                    active_index = %active,
                    error_kind = %error.kind(),
                    error = %error,
                    "rotation failed; active credential unchanged"
                );
                self.record_failure(&ctx, &mut config, status, &error).await;
                Err(error)
            }
        }
    }

    async fn run_rotate(
        &self,
        ctx: &OperationContext,
        strategy: &dyn RotationStrategy,
        config: &RotationConfiguration,
    ) -> RotationResult<()> {
        let cx = self.strategy_context(ctx, config);
        let credential = strategy
            .rotate_credentials(&cx, &config.parameters, config.active_index)
            .await?;
        self.publish(&ctx.without_cancellation(), strategy, config, &credential)
            .await
    }

    /// Invalidate both identities and delete the configuration
    ///
    /// Safe to repeat after a failure, which leaves the configuration in
    /// `error`.
    #[tracing::instrument(skip_all, fields(config_id = %id))]
    pub async fn revoke(&self, id: &ConfigurationId) -> RotationResult<()> {
        let (_guard, ctx) = self.begin(id, Operation::Revoke)?;
        let config = self.load(&ctx, id).await?;
        let strategy = self.strategies.get(config.target_type)?;
        let previous = config.status;
        let mut config = self.claim(&ctx, &config, RotationStatus::Revoking).await?;

        let outcome = async {
            let identities = strategy.identities(&config.parameters)?;
            let cx = self.strategy_context(&ctx, &config);
            strategy
                .revoke_credentials(&cx, &config.parameters, &identities)
                .await
        }
        .await;

        match outcome {
            Ok(()) => {
                ctx.bounded("remove configuration", self.repository.remove(id))
                    .await?;
                tracing::info!(config_id = %id, "credentials revoked and configuration removed");
                Ok(())
            }
            Err(error) => {
                let status = match error {
                    RotationError::Cancelled { .. } => previous,
                    _ => RotationStatus::Error,
                };
                tracing::warn!(config_id = %id, error_kind = %error.kind(), error = %error, "revoke failed");
                self.record_failure(&ctx, &mut config, status, &error).await;
                Err(error)
            }
        }
    }

    /// [`issue`](Self::issue), retried with backoff while the error is retryable
    pub async fn issue_with_retry(&self, id: &ConfigurationId) -> RotationResult<RotationConfiguration> {
        retry_with_backoff(&self.settings.retry, "issue", || self.issue(id)).await
    }

    /// [`rotate`](Self::rotate), retried with backoff while the error is retryable
    pub async fn rotate_with_retry(&self, id: &ConfigurationId) -> RotationResult<RotationConfiguration> {
        retry_with_backoff(&self.settings.retry, "rotate", || self.rotate(id)).await
    }

    /// [`revoke`](Self::revoke), retried with backoff while the error is retryable
    pub async fn revoke_with_retry(&self, id: &ConfigurationId) -> RotationResult<()> {
        retry_with_backoff(&self.settings.retry, "revoke", || self.revoke(id)).await
    }

    /// Stop the scheduler from driving `id`
    pub async fn disable_auto_rotation(&self, id: &ConfigurationId) -> RotationResult<()> {
        let (_guard, ctx) = self.begin(id, Operation::Configure)?;
        let mut config = self.load(&ctx, id).await?;
        if !config.auto_rotation_enabled {
            return Ok(());
        }
        config.auto_rotation_enabled = false;
        config.touch();
        self.persist(&ctx, &config).await?;
        tracing::warn!(config_id = %id, "automatic rotation disabled");
        Ok(())
    }

    /// Resolve a configuration left in `issuing`, `rotating` or `revoking`
    ///
    /// The credential found in the secret store is probed against the target.
    /// If it authenticates and belongs to a slot, that slot becomes active.
    /// Otherwise an interrupted issue returns to `pending` and anything else
    /// lands in `error`. Configurations that are not mid-operation are
    /// returned unchanged.
    #[tracing::instrument(skip_all, fields(config_id = %id))]
    pub async fn reconcile(&self, id: &ConfigurationId) -> RotationResult<RotationConfiguration> {
        let (_guard, ctx) = self.begin(id, Operation::Reconcile)?;
        let mut config = self.load(&ctx, id).await?;
        if !config.status.is_in_flight() {
            return Ok(config);
        }
        let interrupted = config.status;
        let strategy = self.strategies.get(config.target_type)?;

        let published = match interrupted {
            RotationStatus::Issuing | RotationStatus::Rotating => {
                self.probe_published(&ctx, strategy.as_ref(), &config).await
            }
            _ => None,
        };

        match (interrupted, published) {
            (RotationStatus::Issuing, Some(slot @ SlotIndex::Primary))
            | (RotationStatus::Rotating, Some(slot)) => {
                config.active_index = slot;
                config.status = RotationStatus::Active;
                config.record_success();
                self.persist(&ctx, &config).await?;
                tracing::info!(
                    config_id = %id,
                    interrupted = %interrupted,
                    active_index = %slot,
                    "reconciled to the published credential"
                );
            }
            _ => {
                let status = if interrupted == RotationStatus::Issuing {
                    RotationStatus::Pending
                } else {
                    RotationStatus::Error
                };
                let error = RotationError::Internal(format!(
                    "{interrupted} was interrupted before completion"
                ));
                self.record_failure(&ctx, &mut config, status, &error).await;
                tracing::warn!(
                    config_id = %id,
                    interrupted = %interrupted,
                    status = %status,
                    "no published credential validated; configuration reset"
                );
            }
        }
        Ok(config)
    }

    /// Slot whose identity matches the published username and whose
    /// published password authenticates
    async fn probe_published(
        &self,
        ctx: &OperationContext,
        strategy: &dyn RotationStrategy,
        config: &RotationConfiguration,
    ) -> Option<SlotIndex> {
        let mapping = &config.secrets_mapping;
        let fetched = async {
            let username = ctx
                .bounded("fetch secrets", self.secrets.fetch(&config.scope, &mapping.username))
                .await?;
            let password = ctx
                .bounded("fetch secrets", self.secrets.fetch(&config.scope, &mapping.password))
                .await?;
            RotationResult::Ok(username.zip(password))
        }
        .await;
        let (username, password) = match fetched {
            Ok(Some(pair)) => pair,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(config_id = %config.id, error = %e, "could not read published secrets");
                return None;
            }
        };

        let username = username.expose_secret(str::to_owned);
        let identities = strategy.identities(&config.parameters).ok()?;
        let slot = [SlotIndex::Primary, SlotIndex::Secondary]
            .into_iter()
            .find(|slot| identities.get(slot.index()) == Some(&username))?;

        let credential = Credential::new(username, password);
        let redactor = Redactor::for_credentials([&credential]);
        let probed = async {
            let mut conn = self
                .adapter
                .open(ctx, &config.connection_ref, Some(&credential))
                .await?;
            let result = conn.probe(ctx).await;
            conn.close().await;
            result
        }
        .await;
        match probed {
            Ok(()) => Some(slot),
            Err(e) => {
                tracing::debug!(
                    config_id = %config.id,
                    slot = %slot,
                    error = %redactor.scrub(e),
                    "published credential did not authenticate"
                );
                None
            }
        }
    }

    /// Reconcile every configuration left mid-operation that is not held by
    /// this process
    pub async fn reconcile_all(&self) -> RotationResult<Vec<ReconcileReport>> {
        let ctx = OperationContext::new("reconcile", self.settings.call_timeout);
        let configs = ctx
            .bounded("list configurations", self.repository.list())
            .await?;

        let mut reports = Vec::new();
        for config in configs {
            if !config.status.is_in_flight() || self.is_in_flight(&config.id) {
                continue;
            }
            let result = self.reconcile(&config.id).await;
            reports.push(ReconcileReport {
                id: config.id,
                result,
            });
        }
        Ok(reports)
    }
}
