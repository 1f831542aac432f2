//! Collaborator seams: configuration repository and secret store
//!
//! Both come with in-memory implementations for embedding and tests.

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::config::{ConfigurationId, RotationConfiguration, RotationStatus, SecretScope};
use crate::credential::SecretEntry;
use crate::error::{RotationError, RotationResult};
use crate::secret::SecretString;

/// Persistence for rotation configurations
#[async_trait]
pub trait ConfigurationRepository: Send + Sync {
    /// # Errors
    ///
    /// [`RotationError::NotFound`] when no configuration has `id`.
    async fn load(&self, id: &ConfigurationId) -> RotationResult<RotationConfiguration>;

    /// Atomically move `id` from `expected` to `next`
    ///
    /// # Errors
    ///
    /// [`RotationError::ConcurrentOperation`] when the stored status is not
    /// `expected`, i.e. someone else moved it first.
    async fn compare_and_set_status(
        &self,
        id: &ConfigurationId,
        expected: RotationStatus,
        next: RotationStatus,
    ) -> RotationResult<RotationConfiguration>;

    /// Insert or replace
    async fn save(&self, config: &RotationConfiguration) -> RotationResult<()>;

    /// Delete; removing a missing configuration is not an error
    async fn remove(&self, id: &ConfigurationId) -> RotationResult<()>;

    async fn list(&self) -> RotationResult<Vec<RotationConfiguration>>;
}

/// Destination of published credentials
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Write every entry of `payload` under `scope`
    async fn publish(&self, scope: &SecretScope, payload: &[SecretEntry]) -> RotationResult<()>;

    /// Read one published value back
    async fn fetch(&self, scope: &SecretScope, key: &str) -> RotationResult<Option<SecretString>>;
}

fn not_found(id: &ConfigurationId) -> RotationError {
    RotationError::NotFound {
        config_id: id.to_string(),
    }
}

/// [`ConfigurationRepository`] backed by a concurrent map
#[derive(Default)]
pub struct MemoryConfigurationStore {
    configs: DashMap<ConfigurationId, RotationConfiguration>,
}

impl MemoryConfigurationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.configs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }
}

#[async_trait]
impl ConfigurationRepository for MemoryConfigurationStore {
    async fn load(&self, id: &ConfigurationId) -> RotationResult<RotationConfiguration> {
        self.configs
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| not_found(id))
    }

    async fn compare_and_set_status(
        &self,
        id: &ConfigurationId,
        expected: RotationStatus,
        next: RotationStatus,
    ) -> RotationResult<RotationConfiguration> {
        match self.configs.entry(id.clone()) {
            Entry::Vacant(_) => Err(not_found(id)),
            Entry::Occupied(mut entry) => {
                let config = entry.get_mut();
                if config.status != expected {
                    return Err(RotationError::ConcurrentOperation {
                        config_id: id.to_string(),
                        status: config.status.to_string(),
                    });
                }
                config.status = next;
                config.touch();
                Ok(config.clone())
            }
        }
    }

    async fn save(&self, config: &RotationConfiguration) -> RotationResult<()> {
        self.configs.insert(config.id.clone(), config.clone());
        Ok(())
    }

    async fn remove(&self, id: &ConfigurationId) -> RotationResult<()> {
        self.configs.remove(id);
        Ok(())
    }

    async fn list(&self) -> RotationResult<Vec<RotationConfiguration>> {
        let mut configs: Vec<_> = self.configs.iter().map(|e| e.value().clone()).collect();
        configs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(configs)
    }
}

/// [`SecretStore`] backed by a concurrent map keyed by `(scope, key)`
#[derive(Default)]
pub struct MemorySecretStore {
    secrets: DashMap<(SecretScope, String), SecretString>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Synchronous read for assertions and embedding
    pub fn get(&self, scope: &SecretScope, key: &str) -> Option<SecretString> {
        self.secrets
            .get(&(scope.clone(), key.to_string()))
            .map(|entry| entry.value().clone())
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn publish(&self, scope: &SecretScope, payload: &[SecretEntry]) -> RotationResult<()> {
        for entry in payload {
            self.secrets
                .insert((scope.clone(), entry.key.clone()), entry.value.clone());
        }
        tracing::debug!(scope = %scope, keys = payload.len(), "published secrets");
        Ok(())
    }

    async fn fetch(&self, scope: &SecretScope, key: &str) -> RotationResult<Option<SecretString>> {
        Ok(self.get(scope, key))
    }
}
