//! Credentials produced by a strategy and the payload published for them

use serde::Serialize;

use crate::config::SlotIndex;
use crate::error::{RotationError, RotationResult};
use crate::secret::SecretString;

/// A login for the target system
#[derive(Debug, Clone, Serialize)]
pub struct Credential {
    pub username: String,
    pub password: SecretString,
}

impl Credential {
    pub fn new(username: impl Into<String>, password: SecretString) -> Self {
        Self {
            username: username.into(),
            password,
        }
    }
}

/// One or two credentials in slot order
///
/// Dual-slot strategies return two entries, index 0 being slot 0.
#[derive(Debug, Clone)]
pub struct GeneratedCredentialSet {
    credentials: Vec<Credential>,
}

impl GeneratedCredentialSet {
    /// Wrap credentials in slot order
    ///
    /// # Errors
    ///
    /// Returns [`RotationError::Internal`] unless there are one or two entries.
    pub fn new(credentials: Vec<Credential>) -> RotationResult<Self> {
        if credentials.is_empty() || credentials.len() > 2 {
            return Err(RotationError::Internal(format!(
                "a credential set holds 1 or 2 credentials, got {}",
                credentials.len()
            )));
        }
        Ok(Self { credentials })
    }

    pub fn get(&self, slot: SlotIndex) -> Option<&Credential> {
        self.credentials.get(slot.index())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Credential> {
        self.credentials.iter()
    }

    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }

    pub fn into_inner(self) -> Vec<Credential> {
        self.credentials
    }
}

impl<'a> IntoIterator for &'a GeneratedCredentialSet {
    type Item = &'a Credential;
    type IntoIter = std::slice::Iter<'a, Credential>;

    fn into_iter(self) -> Self::IntoIter {
        self.credentials.iter()
    }
}

/// One `{key, value}` pair of a secrets payload
#[derive(Debug, Clone, Serialize)]
pub struct SecretEntry {
    pub key: String,
    pub value: SecretString,
}

impl SecretEntry {
    pub fn new(key: impl Into<String>, value: SecretString) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }
}
