//! JSON-file backed repository and secret store
//!
//! Every mutation is a read-modify-write cycle under an exclusive advisory
//! lock on a `<file>.lock` sibling, so separate `keyshift` processes sharing
//! a state file serialize against each other. New contents go to a uniquely
//! named owner-only temporary file that is renamed over the target; a crash
//! mid-write leaves the previous contents intact. Reads take no lock.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use fs2::FileExt;
use keyshift_rotation::store::{ConfigurationRepository, SecretStore};
use keyshift_rotation::{
    ConfigurationId, RotationConfiguration, RotationError, RotationResult, RotationStatus,
    SecretEntry, SecretScope, SecretString,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

fn io_error(path: &Path) -> impl Fn(std::io::Error) -> RotationError + '_ {
    move |e| RotationError::store(format!("{}: {e}", path.display()))
}

fn read_json<T: DeserializeOwned + Default>(path: &Path) -> RotationResult<T> {
    match std::fs::read(path) {
        Ok(bytes) if bytes.is_empty() => Ok(T::default()),
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map_err(|e| RotationError::store(format!("{}: {e}", path.display()))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(io_error(path)(e)),
    }
}

/// Replace `path` with `value`; the file is owner-only from creation on
fn write_json<T: Serialize>(path: &Path, value: &T) -> RotationResult<()> {
    let bytes = serde_json::to_vec_pretty(value).map_err(RotationError::store)?;
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let mut tmp = NamedTempFile::new_in(dir).map_err(io_error(path))?;
    tmp.write_all(&bytes).map_err(io_error(path))?;
    tmp.as_file().sync_all().map_err(io_error(path))?;
    tmp.persist(path).map_err(|e| io_error(path)(e.error))?;
    Ok(())
}

fn lock_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(OsString::from).unwrap_or_default();
    name.push(".lock");
    path.with_file_name(name)
}

/// Exclusive advisory lock, released when dropped
struct FileLock {
    _file: File,
}

impl FileLock {
    fn acquire(path: &Path) -> RotationResult<Self> {
        let lock_path = lock_path(path);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(io_error(&lock_path))?;
        FileExt::lock_exclusive(&file).map_err(io_error(&lock_path))?;
        Ok(Self { _file: file })
    }
}

async fn blocking<R, F>(task: F) -> RotationResult<R>
where
    R: Send + 'static,
    F: FnOnce() -> RotationResult<R> + Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|e| RotationError::store(format!("file store task failed: {e}")))?
}

/// Run `cycle` on `path` while holding its lock
async fn locked<R, F>(path: &Path, cycle: F) -> RotationResult<R>
where
    R: Send + 'static,
    F: FnOnce(&Path) -> RotationResult<R> + Send + 'static,
{
    let path = path.to_path_buf();
    blocking(move || {
        let _lock = FileLock::acquire(&path)?;
        cycle(&path)
    })
    .await
}

type Configurations = BTreeMap<ConfigurationId, RotationConfiguration>;

fn read_configs(path: &Path) -> RotationResult<Configurations> {
    let configs: Vec<RotationConfiguration> = read_json(path)?;
    Ok(configs.into_iter().map(|c| (c.id.clone(), c)).collect())
}

fn write_configs(path: &Path, configs: Configurations) -> RotationResult<()> {
    let configs: Vec<_> = configs.into_values().collect();
    write_json(path, &configs)
}

fn not_found(id: &ConfigurationId) -> RotationError {
    RotationError::NotFound {
        config_id: id.to_string(),
    }
}

/// [`ConfigurationRepository`] over a JSON array of configurations
pub struct JsonFileRepository {
    path: PathBuf,
}

impl JsonFileRepository {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn read(&self) -> RotationResult<Configurations> {
        let path = self.path.clone();
        blocking(move || read_configs(&path)).await
    }
}

#[async_trait]
impl ConfigurationRepository for JsonFileRepository {
    async fn load(&self, id: &ConfigurationId) -> RotationResult<RotationConfiguration> {
        self.read().await?.remove(id).ok_or_else(|| not_found(id))
    }

    async fn compare_and_set_status(
        &self,
        id: &ConfigurationId,
        expected: RotationStatus,
        next: RotationStatus,
    ) -> RotationResult<RotationConfiguration> {
        let id = id.clone();
        locked(&self.path, move |path| {
            let mut configs = read_configs(path)?;
            let config = configs.get_mut(&id).ok_or_else(|| not_found(&id))?;
            if config.status != expected {
                return Err(RotationError::ConcurrentOperation {
                    config_id: id.to_string(),
                    status: config.status.to_string(),
                });
            }
            config.status = next;
            config.touch();
            let updated = config.clone();
            write_configs(path, configs)?;
            Ok(updated)
        })
        .await
    }

    async fn save(&self, config: &RotationConfiguration) -> RotationResult<()> {
        let config = config.clone();
        locked(&self.path, move |path| {
            let mut configs = read_configs(path)?;
            configs.insert(config.id.clone(), config);
            write_configs(path, configs)
        })
        .await
    }

    async fn remove(&self, id: &ConfigurationId) -> RotationResult<()> {
        let id = id.clone();
        locked(&self.path, move |path| {
            let mut configs = read_configs(path)?;
            if configs.remove(&id).is_some() {
                write_configs(path, configs)?;
            }
            Ok(())
        })
        .await
    }

    async fn list(&self) -> RotationResult<Vec<RotationConfiguration>> {
        Ok(self.read().await?.into_values().collect())
    }
}

#[derive(Serialize, Deserialize)]
#[serde(transparent)]
struct StoredSecret(#[serde(with = "keyshift_rotation::secret::exposed")] SecretString);

type SecretsFile = BTreeMap<String, BTreeMap<String, StoredSecret>>;

/// [`SecretStore`] writing plaintext values to an owner-only JSON file,
/// grouped by scope
pub struct JsonFileSecretStore {
    path: PathBuf,
}

impl JsonFileSecretStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SecretStore for JsonFileSecretStore {
    async fn publish(&self, scope: &SecretScope, payload: &[SecretEntry]) -> RotationResult<()> {
        let key = scope.to_string();
        let entries: Vec<(String, SecretString)> = payload
            .iter()
            .map(|entry| (entry.key.clone(), entry.value.clone()))
            .collect();
        let count = entries.len();
        locked(&self.path, move |path| {
            let mut secrets: SecretsFile = read_json(path)?;
            let stored = secrets.entry(key).or_default();
            for (name, value) in entries {
                stored.insert(name, StoredSecret(value));
            }
            write_json(path, &secrets)
        })
        .await?;
        tracing::debug!(scope = %scope, keys = count, path = %self.path.display(), "published secrets");
        Ok(())
    }

    async fn fetch(&self, scope: &SecretScope, key: &str) -> RotationResult<Option<SecretString>> {
        let path = self.path.clone();
        let mut secrets: SecretsFile = blocking(move || read_json(&path)).await?;
        Ok(secrets
            .get_mut(&scope.to_string())
            .and_then(|entries| entries.remove(key))
            .map(|stored| stored.0))
    }
}
