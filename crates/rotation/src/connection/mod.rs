//! Scoped connections to target systems
//!
//! A [`ConnectionAdapter`] resolves a [`ConnectionRef`] to
//! [`ConnectionDetails`] and asks a [`Driver`] for a [`Session`]. The session
//! is wrapped in a [`ScopedConnection`], which releases it on every exit path:
//! explicit [`close`](ScopedConnection::close), early return, panic, or the
//! owning future being dropped.

#[cfg(feature = "sql")]
pub mod sql;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::context::OperationContext;
use crate::credential::Credential;
use crate::error::{RotationError, RotationResult};
use crate::secret::SecretString;

/// Opaque reference to a target system, resolved by a [`ConnectionResolver`]
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionRef(String);

impl ConnectionRef {
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// SQL dialect spoken by the target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    Postgres,
    #[serde(rename = "mysql")]
    MySql,
}

impl Dialect {
    pub const ALL: [Dialect; 2] = [Dialect::Postgres, Dialect::MySql];
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Postgres => "postgres",
            Self::MySql => "mysql",
        })
    }
}

/// How to reach a target system, plus the admin login used to change passwords
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionDetails {
    pub dialect: Dialect,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: SecretString,
    #[serde(default)]
    pub tls: bool,
}

/// One password change, already rendered for the target's dialect
///
/// `statement` embeds the new password and is therefore secret as a whole.
#[derive(Debug, Clone)]
pub struct CredentialChange {
    pub username: String,
    pub password: SecretString,
    pub statement: SecretString,
}

/// Maps a [`ConnectionRef`] to connection details
#[async_trait]
pub trait ConnectionResolver: Send + Sync {
    async fn resolve(&self, connection_ref: &ConnectionRef) -> RotationResult<ConnectionDetails>;
}

/// Open connection to a target system
#[async_trait]
pub trait Session: Send {
    /// Apply every change inside one transaction; all or nothing
    async fn apply(&mut self, changes: &[CredentialChange]) -> RotationResult<()>;

    /// Cheap round trip proving the session is authenticated and usable
    async fn probe(&mut self) -> RotationResult<()>;

    /// Graceful shutdown
    async fn close(self: Box<Self>) -> RotationResult<()>;
}

/// Dialect-specific I/O
#[async_trait]
pub trait Driver: Send + Sync {
    /// Connect as `login`, or as the admin login from `details` when `None`
    async fn connect(
        &self,
        details: &ConnectionDetails,
        login: Option<&Credential>,
    ) -> RotationResult<Box<dyn Session>>;
}

/// Resolver over a fixed set of connections
#[derive(Default)]
pub struct StaticConnectionResolver {
    connections: DashMap<ConnectionRef, ConnectionDetails>,
}

impl StaticConnectionResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, connection_ref: ConnectionRef, details: ConnectionDetails) {
        self.connections.insert(connection_ref, details);
    }

    #[must_use]
    pub fn with(self, connection_ref: ConnectionRef, details: ConnectionDetails) -> Self {
        self.insert(connection_ref, details);
        self
    }
}

impl FromIterator<(ConnectionRef, ConnectionDetails)> for StaticConnectionResolver {
    fn from_iter<I: IntoIterator<Item = (ConnectionRef, ConnectionDetails)>>(iter: I) -> Self {
        Self {
            connections: iter.into_iter().collect(),
        }
    }
}

#[async_trait]
impl ConnectionResolver for StaticConnectionResolver {
    async fn resolve(&self, connection_ref: &ConnectionRef) -> RotationResult<ConnectionDetails> {
        self.connections
            .get(connection_ref)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                RotationError::policy(format!("unknown connection reference '{connection_ref}'"))
            })
    }
}

/// Opens [`ScopedConnection`]s
#[derive(Clone)]
pub struct ConnectionAdapter {
    resolver: Arc<dyn ConnectionResolver>,
    driver: Arc<dyn Driver>,
}

impl ConnectionAdapter {
    pub fn new(resolver: Arc<dyn ConnectionResolver>, driver: Arc<dyn Driver>) -> Self {
        Self { resolver, driver }
    }

    /// Open a connection as `login`, or as the admin login when `None`
    ///
    /// Both resolution and connect are cancellable and bounded by the
    /// context's call timeout.
    pub async fn open(
        &self,
        ctx: &OperationContext,
        connection_ref: &ConnectionRef,
        login: Option<&Credential>,
    ) -> RotationResult<ScopedConnection> {
        let details = ctx
            .cancellable("resolve connection", self.resolver.resolve(connection_ref))
            .await?;
        let username = login.map_or_else(|| details.username.clone(), |c| c.username.clone());

        let session = ctx
            .cancellable("connect", self.driver.connect(&details, login))
            .await?;

        tracing::debug!(
            connection_ref = %connection_ref,
            dialect = %details.dialect,
            username = %username,
            "connection opened"
        );

        Ok(ScopedConnection {
            session: Some(session),
            dialect: details.dialect,
            username,
            close_timeout: ctx.call_timeout(),
        })
    }
}

/// A session released when it goes out of scope
///
/// Prefer [`close`](Self::close); on drop the close is spawned onto the
/// current runtime, or the session is simply dropped outside a runtime.
pub struct ScopedConnection {
    session: Option<Box<dyn Session>>,
    dialect: Dialect,
    username: String,
    close_timeout: Duration,
}

impl fmt::Debug for ScopedConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedConnection")
            .field("dialect", &self.dialect)
            .field("username", &self.username)
            .field("open", &self.session.is_some())
            .finish()
    }
}

impl ScopedConnection {
    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Login the session authenticated as
    pub fn username(&self) -> &str {
        &self.username
    }

    fn session(&mut self) -> RotationResult<&mut (dyn Session + 'static)> {
        self.session
            .as_deref_mut()
            .ok_or_else(|| RotationError::Internal("connection already closed".into()))
    }

    /// Apply changes in one transaction, bounded by the call timeout
    pub async fn apply(
        &mut self,
        ctx: &OperationContext,
        changes: &[CredentialChange],
    ) -> RotationResult<()> {
        let session = self.session()?;
        ctx.bounded("apply", session.apply(changes)).await
    }

    /// Round trip on the session, bounded by the call timeout
    pub async fn probe(&mut self, ctx: &OperationContext) -> RotationResult<()> {
        let session = self.session()?;
        ctx.bounded("probe", session.probe()).await
    }

    /// Close the session now
    pub async fn close(mut self) {
        if let Some(session) = self.session.take() {
            close_session(session, self.close_timeout, &self.username).await;
        }
    }
}

async fn close_session(session: Box<dyn Session>, timeout: Duration, username: &str) {
    match tokio::time::timeout(timeout, session.close()).await {
        Ok(Ok(())) => tracing::debug!(username, "connection closed"),
        Ok(Err(e)) => tracing::debug!(username, error = %e, "connection close reported an error"),
        Err(_) => tracing::debug!(username, "connection close timed out"),
    }
}

impl Drop for ScopedConnection {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let timeout = self.close_timeout;
                let username = std::mem::take(&mut self.username);
                handle.spawn(async move { close_session(session, timeout, &username).await });
            }
            Err(_) => drop(session),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockTarget;

    fn adapter(target: &MockTarget) -> ConnectionAdapter {
        ConnectionAdapter::new(Arc::new(target.resolver()), Arc::new(target.clone()))
    }

    fn ctx() -> OperationContext {
        OperationContext::new("test", Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_open_as_admin_and_close() {
        let target = MockTarget::new();
        let adapter = adapter(&target);

        let mut conn = adapter.open(&ctx(), &target.connection_ref(), None).await.unwrap();
        assert_eq!(conn.username(), MockTarget::ADMIN_USER);
        conn.probe(&ctx()).await.unwrap();
        assert_eq!(target.live_sessions(), 1);

        conn.close().await;
        assert_eq!(target.live_sessions(), 0);
    }

    #[tokio::test]
    async fn test_drop_releases_session() {
        let target = MockTarget::new();
        let adapter = adapter(&target);
        {
            let _conn = adapter.open(&ctx(), &target.connection_ref(), None).await.unwrap();
            assert_eq!(target.live_sessions(), 1);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(target.live_sessions(), 0);
    }

    #[tokio::test]
    async fn test_drop_outside_runtime_releases_session() {
        let target = MockTarget::new();
        let conn = adapter(&target)
            .open(&ctx(), &target.connection_ref(), None)
            .await
            .unwrap();
        std::thread::spawn(move || drop(conn)).join().unwrap();
        assert_eq!(target.live_sessions(), 0);
    }

    #[tokio::test]
    async fn test_unknown_reference_is_policy_error() {
        let target = MockTarget::new();
        let err = adapter(&target)
            .open(&ctx(), &ConnectionRef::new("nope"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, RotationError::Policy { .. }));
    }

    #[tokio::test]
    async fn test_open_with_wrong_login_is_rejected() {
        let target = MockTarget::new();
        target.create_user("svc_a", "right");
        let login = Credential::new("svc_a", SecretString::new("wrong"));
        let err = adapter(&target)
            .open(&ctx(), &target.connection_ref(), Some(&login))
            .await
            .unwrap_err();
        assert!(matches!(err, RotationError::AuthenticationRejected { .. }));
        assert_eq!(target.live_sessions(), 0);
    }

    #[test]
    fn test_connection_details_deserialize() {
        let details: ConnectionDetails = serde_json::from_value(serde_json::json!({
            "dialect": "mysql",
            "host": "db.internal",
            "port": 3306,
            "database": "orders",
            "username": "root",
            "password": "admin-pw"
        }))
        .unwrap();
        assert_eq!(details.dialect, Dialect::MySql);
        assert!(!details.tls);
        assert!(details.password.matches("admin-pw"));
    }
}
