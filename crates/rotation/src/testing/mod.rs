//! Test doubles for the engine's external collaborators
//!
//! [`MockTarget`] simulates a database server: it keeps a table of logins,
//! authenticates sessions against it and applies password changes
//! transactionally. Failure knobs reproduce the conditions the engine has to
//! survive (unreachable host, rejected statements, lock timeouts, slow
//! connects, logins that stop working).
//!
//! Available under `cfg(test)` and the `test-util` feature.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use crate::config::SecretScope;
use crate::connection::{
    ConnectionDetails, ConnectionRef, CredentialChange, Dialect, Driver, Session,
    StaticConnectionResolver,
};
use crate::credential::{Credential, SecretEntry};
use crate::error::{RotationError, RotationResult};
use crate::secret::SecretString;
use crate::store::{MemorySecretStore, SecretStore};

#[derive(Default)]
struct Knobs {
    unreachable: bool,
    echo_apply_failure: bool,
    transient_failures: u32,
    connect_delay: Option<Duration>,
    min_password_length: Option<usize>,
    rejected_logins: HashSet<String>,
}

struct Inner {
    dialect: Dialect,
    users: RwLock<HashMap<String, String>>,
    knobs: Mutex<Knobs>,
    live_sessions: AtomicUsize,
    opened_sessions: AtomicUsize,
    commits: AtomicUsize,
}

/// In-memory database server
///
/// Cloning shares the server; every clone sees the same logins and knobs.
#[derive(Clone)]
pub struct MockTarget {
    inner: Arc<Inner>,
}

impl Default for MockTarget {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTarget {
    pub const ADMIN_USER: &'static str = "admin";
    pub const ADMIN_PASSWORD: &'static str = "admin-password";
    pub const CONNECTION_REF: &'static str = "mock-db";

    /// PostgreSQL-flavoured server with only the admin login
    pub fn new() -> Self {
        Self::with_dialect(Dialect::Postgres)
    }

    pub fn with_dialect(dialect: Dialect) -> Self {
        let users = HashMap::from([(Self::ADMIN_USER.to_string(), Self::ADMIN_PASSWORD.to_string())]);
        Self {
            inner: Arc::new(Inner {
                dialect,
                users: RwLock::new(users),
                knobs: Mutex::new(Knobs::default()),
                live_sessions: AtomicUsize::new(0),
                opened_sessions: AtomicUsize::new(0),
                commits: AtomicUsize::new(0),
            }),
        }
    }

    pub fn connection_ref(&self) -> ConnectionRef {
        ConnectionRef::new(Self::CONNECTION_REF)
    }

    pub fn details(&self) -> ConnectionDetails {
        ConnectionDetails {
            dialect: self.inner.dialect,
            host: "mock.invalid".into(),
            port: match self.inner.dialect {
                Dialect::Postgres => 5432,
                Dialect::MySql => 3306,
            },
            database: "app".into(),
            username: Self::ADMIN_USER.into(),
            password: SecretString::new(Self::ADMIN_PASSWORD),
            tls: false,
        }
    }

    /// Resolver knowing only this server, under [`Self::CONNECTION_REF`]
    pub fn resolver(&self) -> StaticConnectionResolver {
        StaticConnectionResolver::new().with(self.connection_ref(), self.details())
    }

    pub fn create_user(&self, username: &str, password: &str) {
        self.inner
            .users
            .write()
            .insert(username.to_string(), password.to_string());
    }

    /// Current password of `username`
    pub fn password_of(&self, username: &str) -> Option<String> {
        self.inner.users.read().get(username).cloned()
    }

    /// Whether `username` / `password` would be accepted right now
    pub fn authenticate(&self, username: &str, password: &str) -> bool {
        let knobs = self.inner.knobs.lock();
        if knobs.unreachable || knobs.rejected_logins.contains(username) {
            return false;
        }
        drop(knobs);
        self.inner
            .users
            .read()
            .get(username)
            .is_some_and(|known| known == password)
    }

    /// Sessions currently open
    pub fn live_sessions(&self) -> usize {
        self.inner.live_sessions.load(Ordering::SeqCst)
    }

    /// Sessions opened since creation
    pub fn opened_sessions(&self) -> usize {
        self.inner.opened_sessions.load(Ordering::SeqCst)
    }

    /// Committed password-change transactions
    pub fn commits(&self) -> usize {
        self.inner.commits.load(Ordering::SeqCst)
    }

    /// Refuse every connection and fail probes on open sessions
    pub fn set_unreachable(&self, unreachable: bool) {
        self.inner.knobs.lock().unreachable = unreachable;
    }

    /// Reject every transaction with an error quoting the failed statement
    pub fn fail_apply_echoing_statement(&self, fail: bool) {
        self.inner.knobs.lock().echo_apply_failure = fail;
    }

    /// Fail the next `count` transactions with a lock timeout
    pub fn fail_next_applies(&self, count: u32) {
        self.inner.knobs.lock().transient_failures = count;
    }

    pub fn set_connect_delay(&self, delay: Option<Duration>) {
        self.inner.knobs.lock().connect_delay = delay;
    }

    /// Reject passwords shorter than `min`, quoting them in the error
    pub fn set_min_password_length(&self, min: Option<usize>) {
        self.inner.knobs.lock().min_password_length = min;
    }

    /// Refuse logins as `username` even with the right password
    pub fn reject_login(&self, username: &str) {
        self.inner
            .knobs
            .lock()
            .rejected_logins
            .insert(username.to_string());
    }

    fn open_session(&self) -> MockSession {
        self.inner.live_sessions.fetch_add(1, Ordering::SeqCst);
        self.inner.opened_sessions.fetch_add(1, Ordering::SeqCst);
        MockSession {
            target: self.clone(),
        }
    }

    fn commit(&self, changes: &[CredentialChange]) -> RotationResult<()> {
        {
            let mut knobs = self.inner.knobs.lock();
            if knobs.unreachable {
                return Err(RotationError::Connectivity {
                    operation: "apply".into(),
                    reason: "server closed the connection unexpectedly".into(),
                });
            }
            if knobs.transient_failures > 0 {
                knobs.transient_failures -= 1;
                return Err(RotationError::Apply {
                    username: changes.first().map(|c| c.username.clone()).unwrap_or_default(),
                    reason: "canceling statement due to lock timeout".into(),
                    transient: true,
                });
            }
            for change in changes {
                if knobs.echo_apply_failure {
                    return Err(RotationError::Apply {
                        username: change.username.clone(),
                        reason: change.statement.expose_secret(|sql| {
                            format!("syntax error at or near \"{sql}\"")
                        }),
                        transient: false,
                    });
                }
                if let Some(min) = knobs.min_password_length {
                    if change.password.len() < min {
                        return Err(RotationError::Apply {
                            username: change.username.clone(),
                            reason: change.password.expose_secret(|pw| {
                                format!("password \"{pw}\" is shorter than {min} characters")
                            }),
                            transient: false,
                        });
                    }
                }
            }
        }

        let mut users = self.inner.users.write();
        if let Some(missing) = changes.iter().find(|c| !users.contains_key(&c.username)) {
            return Err(RotationError::Apply {
                username: missing.username.clone(),
                reason: format!("role \"{}\" does not exist", missing.username),
                transient: false,
            });
        }
        for change in changes {
            let password = change.password.expose_secret(str::to_owned);
            users.insert(change.username.clone(), password);
        }
        self.inner.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl Driver for MockTarget {
    async fn connect(
        &self,
        details: &ConnectionDetails,
        login: Option<&Credential>,
    ) -> RotationResult<Box<dyn Session>> {
        let (unreachable, delay) = {
            let knobs = self.inner.knobs.lock();
            (knobs.unreachable, knobs.connect_delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if unreachable {
            return Err(RotationError::Connectivity {
                operation: "connect".into(),
                reason: format!("connection refused ({}:{})", details.host, details.port),
            });
        }

        let (username, accepted) = match login {
            Some(credential) => (
                credential.username.clone(),
                credential
                    .password
                    .expose_secret(|pw| self.authenticate(&credential.username, pw)),
            ),
            None => (
                details.username.clone(),
                details
                    .password
                    .expose_secret(|pw| self.authenticate(&details.username, pw)),
            ),
        };
        if !accepted {
            return Err(RotationError::AuthenticationRejected {
                username: username.clone(),
                reason: format!("password authentication failed for user \"{username}\""),
            });
        }
        Ok(Box::new(self.open_session()))
    }
}

struct MockSession {
    target: MockTarget,
}

#[async_trait]
impl Session for MockSession {
    async fn apply(&mut self, changes: &[CredentialChange]) -> RotationResult<()> {
        self.target.commit(changes)
    }

    async fn probe(&mut self) -> RotationResult<()> {
        if self.target.inner.knobs.lock().unreachable {
            return Err(RotationError::Connectivity {
                operation: "probe".into(),
                reason: "server closed the connection unexpectedly".into(),
            });
        }
        Ok(())
    }

    async fn close(self: Box<Self>) -> RotationResult<()> {
        Ok(())
    }
}

impl Drop for MockSession {
    fn drop(&mut self) {
        self.target.inner.live_sessions.fetch_sub(1, Ordering::SeqCst);
    }
}

/// [`MemorySecretStore`] that can be told to fail
#[derive(Default)]
pub struct FlakySecretStore {
    inner: MemorySecretStore,
    failures: AtomicU32,
    echo_payload: AtomicBool,
}

impl FlakySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` publishes
    pub fn fail_next_publishes(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Make publish failures quote the payload values
    pub fn echo_payload_on_failure(&self, echo: bool) {
        self.echo_payload.store(echo, Ordering::SeqCst);
    }

    pub fn get(&self, scope: &SecretScope, key: &str) -> Option<SecretString> {
        self.inner.get(scope, key)
    }
}

#[async_trait]
impl SecretStore for FlakySecretStore {
    async fn publish(&self, scope: &SecretScope, payload: &[SecretEntry]) -> RotationResult<()> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            let reason = if self.echo_payload.load(Ordering::SeqCst) {
                let values: Vec<String> = payload
                    .iter()
                    .map(|entry| entry.value.expose_secret(|v| format!("{}={v}", entry.key)))
                    .collect();
                format!("rejected write of {}", values.join(", "))
            } else {
                "secret store unavailable".to_string()
            };
            return Err(RotationError::store(reason));
        }
        self.inner.publish(scope, payload).await
    }

    async fn fetch(&self, scope: &SecretScope, key: &str) -> RotationResult<Option<SecretString>> {
        self.inner.fetch(scope, key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn change(username: &str, password: &str) -> CredentialChange {
        CredentialChange {
            username: username.into(),
            password: SecretString::new(password),
            statement: SecretString::new(format!("ALTER USER {username} '{password}'")),
        }
    }

    #[test]
    fn test_commit_is_all_or_nothing() {
        let target = MockTarget::new();
        target.create_user("svc_a", "old-a");

        let err = target
            .commit(&[change("svc_a", "new-a"), change("ghost", "new-g")])
            .unwrap_err();

        assert!(matches!(err, RotationError::Apply { transient: false, .. }));
        assert_eq!(target.password_of("svc_a").as_deref(), Some("old-a"));
        assert_eq!(target.commits(), 0);
    }

    #[test]
    fn test_transient_failures_count_down() {
        let target = MockTarget::new();
        target.create_user("svc_a", "old");
        target.fail_next_applies(1);

        assert!(target.commit(&[change("svc_a", "n1")]).unwrap_err().is_retryable());
        target.commit(&[change("svc_a", "n2")]).unwrap();
        assert!(target.authenticate("svc_a", "n2"));
    }

    #[tokio::test]
    async fn test_flaky_store_recovers() {
        let store = FlakySecretStore::new();
        let scope = SecretScope::new("p", "e");
        store.fail_next_publishes(1);
        let payload = [SecretEntry::new("K", SecretString::new("v"))];

        assert!(store.publish(&scope, &payload).await.is_err());
        store.publish(&scope, &payload).await.unwrap();
        assert!(store.get(&scope, "K").unwrap().matches("v"));
    }
}
