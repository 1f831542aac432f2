//! PostgreSQL and MySQL driver on sqlx
//!
//! One dedicated (unpooled) connection per [`Session`]: every verification
//! must authenticate from scratch, which a pool would hide.

use async_trait::async_trait;
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection, MySqlDatabaseError, MySqlSslMode};
use sqlx::postgres::{PgConnectOptions, PgConnection, PgSslMode};
use sqlx::{Connection, Executor};
use zeroize::Zeroizing;

use super::{ConnectionDetails, CredentialChange, Dialect, Driver, Session};
use crate::credential::Credential;
use crate::error::{RotationError, RotationResult};

/// SQLSTATEs meaning the login itself was refused
const AUTH_SQLSTATES: &[&str] = &["28P01", "28000"];
/// SQLSTATEs worth retrying: deadlock, serialization failure, lock timeout, cancelled
const TRANSIENT_SQLSTATES: &[&str] = &["40P01", "40001", "55P03", "57014"];
/// MySQL error numbers worth retrying: lock wait timeout, deadlock
const TRANSIENT_MYSQL_ERRORS: &[u16] = &[1205, 1213];
const MYSQL_ACCESS_DENIED: u16 = 1045;

/// [`Driver`] for [`Dialect::Postgres`] and [`Dialect::MySql`] targets
#[derive(Debug, Clone, Copy, Default)]
pub struct SqlDriver;

impl SqlDriver {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Driver for SqlDriver {
    async fn connect(
        &self,
        details: &ConnectionDetails,
        login: Option<&Credential>,
    ) -> RotationResult<Box<dyn Session>> {
        let (username, password) = match login {
            Some(credential) => (&credential.username, &credential.password),
            None => (&details.username, &details.password),
        };
        let password = Zeroizing::new(password.expose_secret(str::to_owned));

        let session = match details.dialect {
            Dialect::Postgres => {
                let options = PgConnectOptions::new_without_pgpass()
                    .host(&details.host)
                    .port(details.port)
                    .database(&details.database)
                    .username(username)
                    .password(&password)
                    .ssl_mode(if details.tls {
                        PgSslMode::Require
                    } else {
                        PgSslMode::Prefer
                    });
                let conn = PgConnection::connect_with(&options)
                    .await
                    .map_err(|e| connect_error(username, e))?;
                SqlSession::Postgres(conn)
            }
            Dialect::MySql => {
                let options = MySqlConnectOptions::new()
                    .host(&details.host)
                    .port(details.port)
                    .database(&details.database)
                    .username(username)
                    .password(&password)
                    .ssl_mode(if details.tls {
                        MySqlSslMode::Required
                    } else {
                        MySqlSslMode::Preferred
                    });
                let conn = MySqlConnection::connect_with(&options)
                    .await
                    .map_err(|e| connect_error(username, e))?;
                SqlSession::MySql(conn)
            }
        };
        Ok(Box::new(session))
    }
}

enum SqlSession {
    Postgres(PgConnection),
    MySql(MySqlConnection),
}

#[async_trait]
impl Session for SqlSession {
    async fn apply(&mut self, changes: &[CredentialChange]) -> RotationResult<()> {
        match self {
            Self::Postgres(conn) => {
                let mut tx = conn.begin().await.map_err(|e| io_error("begin", e))?;
                for change in changes {
                    let sql = Zeroizing::new(change.statement.expose_secret(str::to_owned));
                    (&mut *tx)
                        .execute(sql.as_str())
                        .await
                        .map_err(|e| apply_error(&change.username, e))?;
                }
                tx.commit().await.map_err(|e| io_error("commit", e))
            }
            // ALTER USER commits implicitly on MySQL; the transaction still
            // scopes any statements a custom template adds around it.
            Self::MySql(conn) => {
                let mut tx = conn.begin().await.map_err(|e| io_error("begin", e))?;
                for change in changes {
                    let sql = Zeroizing::new(change.statement.expose_secret(str::to_owned));
                    (&mut *tx)
                        .execute(sql.as_str())
                        .await
                        .map_err(|e| apply_error(&change.username, e))?;
                }
                tx.commit().await.map_err(|e| io_error("commit", e))
            }
        }
    }

    async fn probe(&mut self) -> RotationResult<()> {
        let result = match self {
            Self::Postgres(conn) => (&mut *conn).execute("SELECT 1").await.map(drop),
            Self::MySql(conn) => (&mut *conn).execute("SELECT 1").await.map(drop),
        };
        result.map_err(|e| io_error("probe", e))
    }

    async fn close(self: Box<Self>) -> RotationResult<()> {
        let result = match *self {
            Self::Postgres(conn) => conn.close().await,
            Self::MySql(conn) => conn.close().await,
        };
        result.map_err(|e| io_error("close", e))
    }
}

enum Classified {
    Auth,
    Transient,
    Other,
}

fn classify(error: &sqlx::Error) -> Option<Classified> {
    let sqlx::Error::Database(db) = error else {
        return None;
    };
    if let Some(mysql) = db.try_downcast_ref::<MySqlDatabaseError>() {
        let number = mysql.number();
        return Some(if number == MYSQL_ACCESS_DENIED {
            Classified::Auth
        } else if TRANSIENT_MYSQL_ERRORS.contains(&number) {
            Classified::Transient
        } else {
            Classified::Other
        });
    }
    let code = db.code();
    let code = code.as_deref().unwrap_or_default();
    Some(if AUTH_SQLSTATES.contains(&code) {
        Classified::Auth
    } else if TRANSIENT_SQLSTATES.contains(&code) {
        Classified::Transient
    } else {
        Classified::Other
    })
}

fn connect_error(username: &str, error: sqlx::Error) -> RotationError {
    match classify(&error) {
        Some(Classified::Auth) => RotationError::AuthenticationRejected {
            username: username.to_string(),
            reason: error.to_string(),
        },
        _ => io_error("connect", error),
    }
}

fn apply_error(username: &str, error: sqlx::Error) -> RotationError {
    match classify(&error) {
        Some(classified) => RotationError::Apply {
            username: username.to_string(),
            reason: error.to_string(),
            transient: matches!(classified, Classified::Transient),
        },
        None => io_error("apply", error),
    }
}

fn io_error(operation: &str, error: sqlx::Error) -> RotationError {
    RotationError::Connectivity {
        operation: operation.to_string(),
        reason: error.to_string(),
    }
}
