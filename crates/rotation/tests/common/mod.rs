//! Shared fixtures for orchestrator integration tests
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use keyshift_rotation::testing::{FlakySecretStore, MockTarget};
use keyshift_rotation::{
    ConfigurationId, ConfigurationRepository, ConnectionAdapter, Dialect, Driver, EngineSettings,
    MemoryConfigurationStore, Orchestrator, RetryPolicy, RotationConfiguration, SecretScope,
    SecretsMapping, SqlCredentialsParameters, TargetType,
};

pub const INITIAL_A: &str = "initial-password-a";
pub const INITIAL_B: &str = "initial-password-b";
pub const USER_KEY: &str = "DB_USER";
pub const PASS_KEY: &str = "DB_PASS";

pub struct Harness {
    pub target: MockTarget,
    pub repository: Arc<MemoryConfigurationStore>,
    pub secrets: Arc<FlakySecretStore>,
    pub orchestrator: Arc<Orchestrator>,
    pub id: ConfigurationId,
}

pub fn fast_settings() -> EngineSettings {
    EngineSettings {
        call_timeout: Duration::from_secs(5),
        retry: RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            backoff_multiplier: 2.0,
            max_backoff: Duration::from_millis(10),
        },
        ..EngineSettings::default()
    }
}

pub fn scope() -> SecretScope {
    SecretScope::new("proj-1", "prod").with_path("/db")
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(fast_settings())
    }

    pub fn with_settings(settings: EngineSettings) -> Self {
        Self::build(MockTarget::new(), settings, |target| Arc::new(target.clone()))
    }

    /// MySQL-flavoured target
    pub fn mysql() -> Self {
        Self::build(MockTarget::with_dialect(Dialect::MySql), fast_settings(), |target| {
            Arc::new(target.clone())
        })
    }

    /// Connections go through the driver built by `driver` instead of the
    /// target itself
    pub fn with_driver(driver: impl FnOnce(&MockTarget) -> Arc<dyn Driver>) -> Self {
        Self::build(MockTarget::new(), fast_settings(), driver)
    }

    fn build(
        target: MockTarget,
        settings: EngineSettings,
        driver: impl FnOnce(&MockTarget) -> Arc<dyn Driver>,
    ) -> Self {
        let _ = keyshift_log::init_test();

        target.create_user("svc_a", INITIAL_A);
        target.create_user("svc_b", INITIAL_B);

        let repository = Arc::new(MemoryConfigurationStore::new());
        let secrets = Arc::new(FlakySecretStore::new());
        let adapter = ConnectionAdapter::new(Arc::new(target.resolver()), driver(&target));
        let orchestrator = Orchestrator::new(repository.clone(), secrets.clone(), adapter)
            .with_settings(settings);

        Self {
            target,
            repository,
            secrets,
            orchestrator: Arc::new(orchestrator),
            id: ConfigurationId::new("orders-db"),
        }
    }

    pub fn configuration(&self) -> RotationConfiguration {
        self.configuration_with(SqlCredentialsParameters::new("svc_a", "svc_b"))
    }

    pub fn configuration_with(&self, parameters: SqlCredentialsParameters) -> RotationConfiguration {
        RotationConfiguration::new(
            self.id.clone(),
            TargetType::SqlCredentials,
            self.target.connection_ref(),
            parameters.to_value().expect("parameters serialize"),
            SecretsMapping::new(USER_KEY, PASS_KEY),
            scope(),
        )
    }

    /// Registered, nothing issued
    pub async fn registered(self) -> Self {
        self.orchestrator
            .register(self.configuration())
            .await
            .expect("register");
        self
    }

    /// Registered and issued; slot 0 active
    pub async fn issued(self) -> Self {
        let harness = self.registered().await;
        harness.orchestrator.issue(&harness.id).await.expect("issue");
        harness
    }

    pub async fn stored(&self) -> RotationConfiguration {
        self.repository.load(&self.id).await.expect("stored configuration")
    }

    /// Currently published `(username, password)`
    pub fn published(&self) -> Option<(String, String)> {
        let username = self.secrets.get(&scope(), USER_KEY)?;
        let password = self.secrets.get(&scope(), PASS_KEY)?;
        Some((
            username.expose_secret(str::to_owned),
            password.expose_secret(str::to_owned),
        ))
    }

    /// The published credential authenticates at the target
    pub fn published_authenticates(&self) -> bool {
        self.published()
            .is_some_and(|(user, pass)| self.target.authenticate(&user, &pass))
    }
}
