//! Rotation configuration and its lifecycle
//!
//! # Lifecycle
//!
//! ```text
//! Pending ──► Issuing ──► Active ◄──► Rotating ──► Error
//!    ▲           │          │             ▲          │
//!    └───────────┘          ▼             └──────────┘
//!                        Revoking ──► (removed)
//! ```
//!
//! `Revoking` is reachable from `Pending`, `Active` and `Error`; a failed
//! revocation lands in `Error`. A cancelled operation returns to the status it
//! started from.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::connection::ConnectionRef;
use crate::error::{ErrorKind, RotationError, RotationResult};

/// Longest status message kept on a configuration
pub const STATUS_MESSAGE_LIMIT: usize = 500;

/// Identifier of a rotation configuration
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigurationId(String);

impl ConfigurationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random identifier
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConfigurationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConfigurationId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Kind of target system; selects the rotation strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TargetType {
    SqlCredentials,
}

impl TargetType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SqlCredentials => "sql-credentials",
        }
    }
}

impl fmt::Display for TargetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One of the two credential slots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum SlotIndex {
    #[default]
    Primary,
    Secondary,
}

impl SlotIndex {
    /// The opposite slot
    pub fn other(self) -> Self {
        match self {
            Self::Primary => Self::Secondary,
            Self::Secondary => Self::Primary,
        }
    }

    pub fn index(self) -> usize {
        match self {
            Self::Primary => 0,
            Self::Secondary => 1,
        }
    }
}

impl TryFrom<u8> for SlotIndex {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Primary),
            1 => Ok(Self::Secondary),
            other => Err(format!("slot index must be 0 or 1, got {other}")),
        }
    }
}

impl From<SlotIndex> for u8 {
    fn from(slot: SlotIndex) -> Self {
        slot.index() as u8
    }
}

impl fmt::Display for SlotIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.index())
    }
}

/// Lifecycle status of a configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationStatus {
    /// Created, nothing issued yet
    Pending,
    /// Initial credentials are being issued
    Issuing,
    /// Both slots hold working credentials
    Active,
    /// Standby slot is being replaced
    Rotating,
    /// Last rotation or revocation failed; the active slot is untouched
    Error,
    /// Credentials are being revoked
    Revoking,
}

impl RotationStatus {
    /// Check if transition to the target status is valid
    #[must_use]
    pub fn can_transition_to(&self, target: RotationStatus) -> bool {
        use RotationStatus::{Active, Error, Issuing, Pending, Revoking, Rotating};

        matches!(
            (self, target),
            (Pending, Issuing | Revoking)
                | (Issuing, Active | Pending)
                | (Active | Error, Rotating | Revoking)
                | (Rotating, Active | Error)
                | (Revoking, Error | Active | Pending)
        )
    }

    /// Validate and perform the transition
    pub fn transition_to(&self, target: RotationStatus) -> RotationResult<RotationStatus> {
        if self.can_transition_to(target) {
            Ok(target)
        } else {
            Err(RotationError::InvalidStateTransition {
                from: self.to_string(),
                to: target.to_string(),
            })
        }
    }

    /// An operation owns the configuration while in this status
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Issuing | Self::Rotating | Self::Revoking)
    }
}

impl fmt::Display for RotationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Issuing => "issuing",
            Self::Active => "active",
            Self::Rotating => "rotating",
            Self::Error => "error",
            Self::Revoking => "revoking",
        };
        f.write_str(name)
    }
}

/// Destination keys for the published payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretsMapping {
    pub username: String,
    pub password: String,
}

impl SecretsMapping {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

/// Where in the secret store the payload is published
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct SecretScope {
    pub project_id: String,
    pub environment: String,
    #[serde(default = "default_secret_path")]
    pub secret_path: String,
}

fn default_secret_path() -> String {
    "/".to_string()
}

impl SecretScope {
    pub fn new(project_id: impl Into<String>, environment: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            environment: environment.into(),
            secret_path: default_secret_path(),
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.secret_path = path.into();
        self
    }
}

impl fmt::Display for SecretScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.project_id, self.environment, self.secret_path)
    }
}

/// A credential rotation configuration
///
/// `parameters` is strategy-specific JSON, interpreted by the strategy
/// registered for `target_type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotationConfiguration {
    pub id: ConfigurationId,
    pub target_type: TargetType,
    pub connection_ref: ConnectionRef,
    pub parameters: serde_json::Value,
    #[serde(default)]
    pub active_index: SlotIndex,
    pub secrets_mapping: SecretsMapping,
    pub scope: SecretScope,
    pub status: RotationStatus,
    #[serde(default)]
    pub status_message: Option<String>,
    #[serde(default)]
    pub last_error_kind: Option<ErrorKind>,
    #[serde(default)]
    pub last_rotated_at: Option<DateTime<Utc>>,
    #[serde(default, with = "humantime_serde")]
    pub rotation_interval: Option<Duration>,
    #[serde(default = "default_true")]
    pub auto_rotation_enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_true() -> bool {
    true
}

impl RotationConfiguration {
    /// New configuration in [`RotationStatus::Pending`] with slot 0 active
    pub fn new(
        id: ConfigurationId,
        target_type: TargetType,
        connection_ref: ConnectionRef,
        parameters: serde_json::Value,
        secrets_mapping: SecretsMapping,
        scope: SecretScope,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            target_type,
            connection_ref,
            parameters,
            active_index: SlotIndex::Primary,
            secrets_mapping,
            scope,
            status: RotationStatus::Pending,
            status_message: None,
            last_error_kind: None,
            last_rotated_at: None,
            rotation_interval: None,
            auto_rotation_enabled: true,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_rotation_interval(mut self, interval: Duration) -> Self {
        self.rotation_interval = Some(interval);
        self
    }

    /// Slot that is safe to mutate
    pub fn standby_slot(&self) -> SlotIndex {
        self.active_index.other()
    }

    /// Whether the in-process scheduler should drive this configuration
    pub fn is_scheduled(&self) -> bool {
        self.auto_rotation_enabled && self.rotation_interval.is_some()
    }

    /// Record a failed operation; `error` must already be redacted
    pub fn record_failure(&mut self, error: &RotationError) {
        self.status_message = Some(truncate(&error.to_string(), STATUS_MESSAGE_LIMIT));
        self.last_error_kind = Some(error.kind());
        self.touch();
    }

    /// Record a successful issue or rotation
    pub fn record_success(&mut self) {
        let now = Utc::now();
        self.status_message = None;
        self.last_error_kind = None;
        self.last_rotated_at = Some(now);
        self.updated_at = now;
    }

    /// Bump `updated_at`
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

fn truncate(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((end, _)) => text[..end].to_string(),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use RotationStatus::*;

    fn config() -> RotationConfiguration {
        RotationConfiguration::new(
            ConfigurationId::new("orders-db"),
            TargetType::SqlCredentials,
            ConnectionRef::new("orders"),
            serde_json::json!({"username1": "svc_a", "username2": "svc_b"}),
            SecretsMapping::new("DB_USER", "DB_PASS"),
            SecretScope::new("proj", "prod"),
        )
    }

    #[rstest]
    #[case(Pending, Issuing, true)]
    #[case(Issuing, Active, true)]
    #[case(Issuing, Pending, true)]
    #[case(Active, Rotating, true)]
    #[case(Error, Rotating, true)]
    #[case(Rotating, Active, true)]
    #[case(Rotating, Error, true)]
    #[case(Active, Revoking, true)]
    #[case(Error, Revoking, true)]
    #[case(Pending, Revoking, true)]
    #[case(Revoking, Error, true)]
    #[case(Pending, Rotating, false)]
    #[case(Active, Issuing, false)]
    #[case(Rotating, Rotating, false)]
    #[case(Issuing, Rotating, false)]
    #[case(Revoking, Rotating, false)]
    fn test_status_transitions(
        #[case] from: RotationStatus,
        #[case] to: RotationStatus,
        #[case] allowed: bool,
    ) {
        assert_eq!(from.can_transition_to(to), allowed, "{from} -> {to}");
        assert_eq!(from.transition_to(to).is_ok(), allowed);
    }

    #[test]
    fn test_invalid_transition_error_names_states() {
        let err = Pending.transition_to(Rotating).unwrap_err();
        assert_eq!(err.to_string(), "Invalid state transition from pending to rotating");
    }

    #[test]
    fn test_standby_slot_is_the_other_slot() {
        let mut config = config();
        assert_eq!(config.standby_slot(), SlotIndex::Secondary);
        config.active_index = SlotIndex::Secondary;
        assert_eq!(config.standby_slot(), SlotIndex::Primary);
    }

    #[test]
    fn test_slot_index_serializes_as_number() {
        assert_eq!(serde_json::to_string(&SlotIndex::Secondary).unwrap(), "1");
        let slot: SlotIndex = serde_json::from_str("0").unwrap();
        assert_eq!(slot, SlotIndex::Primary);
        assert!(serde_json::from_str::<SlotIndex>("2").is_err());
    }

    #[test]
    fn test_record_failure_truncates_message() {
        let mut config = config();
        config.record_failure(&RotationError::policy("x".repeat(2_000)));
        let message = config.status_message.as_deref().unwrap();
        assert_eq!(message.chars().count(), STATUS_MESSAGE_LIMIT);
        assert_eq!(config.last_error_kind, Some(ErrorKind::Policy));

        config.record_success();
        assert!(config.status_message.is_none());
        assert!(config.last_rotated_at.is_some());
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("ééé", 2), "éé");
        assert_eq!(truncate("ab", 5), "ab");
    }

    #[test]
    fn test_configuration_round_trips_through_json() {
        let config = config().with_rotation_interval(Duration::from_secs(3600));
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["target_type"], "sql-credentials");
        assert_eq!(json["status"], "pending");
        assert_eq!(json["rotation_interval"], "1h");

        let back: RotationConfiguration = serde_json::from_value(json).unwrap();
        assert_eq!(back.id, config.id);
        assert_eq!(back.rotation_interval, Some(Duration::from_secs(3600)));
        assert!(back.is_scheduled());
    }
}
