//! Zeroizing holder for generated passwords and admin credentials

use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Placeholder written wherever a secret would otherwise appear
pub const REDACTED: &str = "[REDACTED]";

/// Password or other secret text, wiped from memory on drop
///
/// Debug, Display and Serialize all print the [`REDACTED`] placeholder; the
/// value is only reachable inside [`expose_secret`].
///
/// [`expose_secret`]: SecretString::expose_secret
///
/// # Examples
///
/// ```
/// use keyshift_rotation::SecretString;
///
/// let secret = SecretString::new("s3cr3t-pa55");
/// assert_eq!(secret.expose_secret(str::len), 11);
/// assert_eq!(format!("{secret:?}"), "[REDACTED]");
/// ```
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretString {
    inner: String,
}

impl SecretString {
    pub fn new<S: Into<String>>(s: S) -> Self {
        Self { inner: s.into() }
    }

    /// Accesses secret value within a closure scope
    ///
    /// The borrowed `&str` cannot escape the closure.
    pub fn expose_secret<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&str) -> R,
    {
        f(&self.inner)
    }

    /// Length in bytes
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Compare against a plaintext candidate without copying the secret out
    pub fn matches(&self, candidate: &str) -> bool {
        self.inner == candidate
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REDACTED)
    }
}

impl fmt::Display for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REDACTED)
    }
}

// Serializes as the placeholder; stores that need the value write it
// through `expose_secret`.
impl Serialize for SecretString {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(REDACTED)
    }
}

impl<'de> Deserialize<'de> for SecretString {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        String::deserialize(deserializer).map(SecretString::new)
    }
}

/// Serde adapter that writes the plaintext value
///
/// For persistence layers that are themselves the secret's destination
/// (`#[serde(with = "keyshift_rotation::secret::exposed")]`).
pub mod exposed {
    use super::SecretString;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(secret: &SecretString, serializer: S) -> Result<S::Ok, S::Error> {
        secret.expose_secret(|value| serializer.serialize_str(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<SecretString, D::Error> {
        String::deserialize(deserializer).map(SecretString::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_string_redacts_debug_and_display() {
        let secret = SecretString::new("hunter2");
        assert_eq!(format!("{secret:?}"), "[REDACTED]");
        assert_eq!(format!("{secret}"), "[REDACTED]");
    }

    #[test]
    fn test_secret_string_serializes_redacted() {
        let secret = SecretString::new("hunter2");
        let json = serde_json::to_string(&secret).unwrap();
        assert_eq!(json, "\"[REDACTED]\"");
    }

    #[test]
    fn test_secret_string_deserializes_plaintext() {
        let secret: SecretString = serde_json::from_str("\"hunter2\"").unwrap();
        assert!(secret.matches("hunter2"));
        assert_eq!(secret.len(), 7);
    }

    #[test]
    fn test_exposed_adapter_round_trips_value() {
        #[derive(Serialize, Deserialize)]
        struct Stored {
            #[serde(with = "exposed")]
            value: SecretString,
        }

        let json = serde_json::to_string(&Stored {
            value: SecretString::new("pa55"),
        })
        .unwrap();
        assert_eq!(json, r#"{"value":"pa55"}"#);
    }

    #[test]
    fn test_secret_string_zeroize() {
        let mut secret = SecretString::new("sensitive");
        secret.zeroize();
        assert!(secret.is_empty());
    }
}
