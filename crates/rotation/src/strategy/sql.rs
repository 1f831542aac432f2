//! SQL credentials strategy
//!
//! Two database logins (`username1`, `username2`) take turns: one is active,
//! the other is standby. Rotation only ever changes the standby login's
//! password.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{RotationStrategy, StrategyContext};
use crate::config::{SlotIndex, TargetType};
use crate::connection::{CredentialChange, Dialect};
use crate::credential::{Credential, GeneratedCredentialSet};
use crate::error::{RotationError, RotationResult};
use crate::generator::{PasswordRequirements, generate};
use crate::redact::Redactor;
use crate::secret::SecretString;

const USERNAME_PLACEHOLDER: &str = "{{username}}";
const PASSWORD_PLACEHOLDER: &str = "{{password}}";

const POSTGRES_STATEMENT: &str = r#"ALTER USER "{{username}}" WITH PASSWORD '{{password}}'"#;
const MYSQL_STATEMENT: &str = "ALTER USER '{{username}}' IDENTIFIED BY '{{password}}'";

static USERNAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_.$@-]{1,128}$").expect("static username pattern"));

/// Parameters of a `sql-credentials` configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SqlCredentialsParameters {
    pub username1: String,
    pub username2: String,
    /// Custom statement with `{{username}}` and `{{password}}` placeholders;
    /// the password is substituted already escaped for a single-quoted literal
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation_statement: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_requirements: Option<PasswordRequirements>,
}

impl SqlCredentialsParameters {
    pub fn new(username1: impl Into<String>, username2: impl Into<String>) -> Self {
        Self {
            username1: username1.into(),
            username2: username2.into(),
            rotation_statement: None,
            password_requirements: None,
        }
    }

    #[must_use]
    pub fn with_rotation_statement(mut self, statement: impl Into<String>) -> Self {
        self.rotation_statement = Some(statement.into());
        self
    }

    #[must_use]
    pub fn with_password_requirements(mut self, requirements: PasswordRequirements) -> Self {
        self.password_requirements = Some(requirements);
        self
    }

    /// Parse and validate
    pub fn from_value(parameters: &Value) -> RotationResult<Self> {
        let parsed: Self = serde_json::from_value(parameters.clone())
            .map_err(|e| RotationError::policy(format!("malformed sql-credentials parameters: {e}")))?;
        parsed.validate()?;
        Ok(parsed)
    }

    /// Serialize for [`RotationConfiguration::parameters`](crate::RotationConfiguration)
    pub fn to_value(&self) -> RotationResult<Value> {
        serde_json::to_value(self).map_err(|e| {
            RotationError::Internal(format!("failed to serialize sql-credentials parameters: {e}"))
        })
    }

    pub fn validate(&self) -> RotationResult<()> {
        for username in [&self.username1, &self.username2] {
            if !USERNAME.is_match(username) {
                return Err(RotationError::policy(format!(
                    "username '{username}' must be 1-128 characters from [A-Za-z0-9_.$@-]"
                )));
            }
        }
        if self.username1 == self.username2 {
            return Err(RotationError::policy(
                "username1 and username2 must be different logins",
            ));
        }
        if let Some(statement) = &self.rotation_statement {
            if !statement.contains(PASSWORD_PLACEHOLDER) {
                return Err(RotationError::policy(format!(
                    "rotation statement must contain {PASSWORD_PLACEHOLDER}"
                )));
            }
        }
        if let Some(requirements) = &self.password_requirements {
            requirements.validate()?;
        }
        Ok(())
    }

    /// Login held by `slot`
    pub fn identity(&self, slot: SlotIndex) -> &str {
        match slot {
            SlotIndex::Primary => &self.username1,
            SlotIndex::Secondary => &self.username2,
        }
    }

    fn requirements<'a>(&'a self, fallback: &'a PasswordRequirements) -> &'a PasswordRequirements {
        self.password_requirements.as_ref().unwrap_or(fallback)
    }

    fn change(&self, dialect: Dialect, credential: &Credential) -> CredentialChange {
        let template = self
            .rotation_statement
            .as_deref()
            .unwrap_or_else(|| default_statement(dialect));
        CredentialChange {
            username: credential.username.clone(),
            password: credential.password.clone(),
            statement: render_statement(template, dialect, &credential.username, &credential.password),
        }
    }
}

/// Built-in `ALTER USER` template for `dialect`
pub fn default_statement(dialect: Dialect) -> &'static str {
    match dialect {
        Dialect::Postgres => POSTGRES_STATEMENT,
        Dialect::MySql => MYSQL_STATEMENT,
    }
}

/// Escape `value` for use inside a single-quoted string literal
pub fn escape_literal(dialect: Dialect, value: &str) -> String {
    match dialect {
        // standard_conforming_strings: backslashes are literal
        Dialect::Postgres => value.replace('\'', "''"),
        Dialect::MySql => value.replace('\\', "\\\\").replace('\'', "''"),
    }
}

/// Substitute username and escaped password into `template`
///
/// The username is substituted first so placeholder-like text inside the
/// password is never expanded.
pub fn render_statement(
    template: &str,
    dialect: Dialect,
    username: &str,
    password: &SecretString,
) -> SecretString {
    let with_user = template.replace(USERNAME_PLACEHOLDER, username);
    password.expose_secret(|plain| {
        let escaped = zeroize::Zeroizing::new(escape_literal(dialect, plain));
        SecretString::new(with_user.replace(PASSWORD_PLACEHOLDER, &escaped))
    })
}

/// Redactor for `credentials`, covering each password both as generated and
/// as escaped into a statement literal for every dialect
fn statement_redactor<'a>(credentials: impl IntoIterator<Item = &'a Credential>) -> Redactor {
    let mut redactor = Redactor::new();
    for credential in credentials {
        redactor.track(&credential.password);
        for dialect in Dialect::ALL {
            redactor.track_rendered(&credential.password, |plain| escape_literal(dialect, plain));
        }
    }
    redactor
}

/// Dual-login strategy for PostgreSQL and MySQL
#[derive(Debug, Clone, Copy, Default)]
pub struct SqlCredentialsStrategy;

impl SqlCredentialsStrategy {
    pub fn new() -> Self {
        Self
    }

    /// Open an admin connection, apply `credentials` in one transaction, close
    async fn apply(
        &self,
        cx: &StrategyContext<'_>,
        params: &SqlCredentialsParameters,
        credentials: &[&Credential],
    ) -> RotationResult<()> {
        let mut admin = cx.open_admin().await?;
        let changes: Vec<CredentialChange> = credentials
            .iter()
            .map(|credential| params.change(admin.dialect(), credential))
            .collect();

        if let Err(e) = cx.ctx.checkpoint("apply") {
            admin.close().await;
            return Err(e);
        }
        let applied = admin.apply(cx.ctx, &changes).await;
        admin.close().await;
        applied
    }
}

#[async_trait]
impl RotationStrategy for SqlCredentialsStrategy {
    fn target_type(&self) -> TargetType {
        TargetType::SqlCredentials
    }

    fn validate_parameters(&self, parameters: &Value) -> RotationResult<()> {
        SqlCredentialsParameters::from_value(parameters).map(drop)
    }

    fn identities(&self, parameters: &Value) -> RotationResult<Vec<String>> {
        let params = SqlCredentialsParameters::from_value(parameters)?;
        Ok(vec![params.username1, params.username2])
    }

    async fn issue_credentials(
        &self,
        cx: &StrategyContext<'_>,
        parameters: &Value,
    ) -> RotationResult<GeneratedCredentialSet> {
        let params = SqlCredentialsParameters::from_value(parameters)?;
        let requirements = params.requirements(cx.default_requirements);

        let set = GeneratedCredentialSet::new(vec![
            Credential::new(&params.username1, generate(requirements)?),
            Credential::new(&params.username2, generate(requirements)?),
        ])?;
        let redactor = statement_redactor(&set);

        let outcome = async {
            let credentials: Vec<&Credential> = set.iter().collect();
            self.apply(cx, &params, &credentials).await?;
            for credential in &set {
                cx.verify(credential).await?;
            }
            Ok(())
        }
        .await;
        outcome.map_err(|e| redactor.scrub(e))?;

        tracing::info!(
            username1 = %params.username1,
            username2 = %params.username2,
            "issued credentials for both logins"
        );
        Ok(set)
    }

    async fn rotate_credentials(
        &self,
        cx: &StrategyContext<'_>,
        parameters: &Value,
        active: SlotIndex,
    ) -> RotationResult<Credential> {
        let params = SqlCredentialsParameters::from_value(parameters)?;
        let standby = active.other();
        let credential = Credential::new(
            params.identity(standby),
            generate(params.requirements(cx.default_requirements))?,
        );
        let redactor = statement_redactor([&credential]);

        let outcome = async {
            self.apply(cx, &params, &[&credential]).await?;
            cx.verify(&credential).await
        }
        .await;
        outcome.map_err(|e| redactor.scrub(e))?;

        tracing::info!(
            username = %credential.username,
            slot = %standby,
            "rotated standby login"
        );
        Ok(credential)
    }

    async fn revoke_credentials(
        &self,
        cx: &StrategyContext<'_>,
        parameters: &Value,
        identities: &[String],
    ) -> RotationResult<()> {
        let params = SqlCredentialsParameters::from_value(parameters)?;
        let requirements = params.requirements(cx.default_requirements);

        let mut discarded = Vec::with_capacity(identities.len());
        for identity in identities {
            if !USERNAME.is_match(identity) {
                return Err(RotationError::policy(format!("invalid username '{identity}'")));
            }
            discarded.push(Credential::new(identity, generate(requirements)?));
        }
        let redactor = statement_redactor(&discarded);

        let credentials: Vec<&Credential> = discarded.iter().collect();
        self.apply(cx, &params, &credentials)
            .await
            .map_err(|e| redactor.scrub(e))?;

        tracing::info!(count = identities.len(), "revoked logins");
        Ok(())
    }
}
