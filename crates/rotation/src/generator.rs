//! Password generation from a declarative complexity policy
//!
//! Required characters are drawn per class first, the remainder is filled from
//! the union of the required classes, and the whole buffer is shuffled with
//! the same CSPRNG (Fisher–Yates via [`SliceRandom::shuffle`]).

use rand::seq::SliceRandom;
use rand::{CryptoRng, Rng};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::error::{RotationError, RotationResult};
use crate::secret::SecretString;

const LOWERCASE: &[u8] = b"abcdefghijklmnopqrstuvwxyz";
const UPPERCASE: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const DIGITS: &[u8] = b"0123456789";

/// Longest password a policy may ask for
pub const MAX_PASSWORD_LENGTH: u32 = 250;

/// Minimum number of characters per class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RequiredCounts {
    pub lowercase: u32,
    pub uppercase: u32,
    pub digits: u32,
    pub symbols: u32,
}

impl RequiredCounts {
    pub fn total(&self) -> u64 {
        u64::from(self.lowercase)
            + u64::from(self.uppercase)
            + u64::from(self.digits)
            + u64::from(self.symbols)
    }
}

/// Complexity policy for generated passwords
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PasswordRequirements {
    pub length: u32,
    pub required: RequiredCounts,
    pub allowed_symbols: String,
}

impl Default for PasswordRequirements {
    fn default() -> Self {
        Self {
            length: 48,
            required: RequiredCounts {
                lowercase: 1,
                uppercase: 1,
                digits: 1,
                symbols: 0,
            },
            allowed_symbols: "-_.~!*".to_string(),
        }
    }
}

impl PasswordRequirements {
    /// Check that the policy can be satisfied
    ///
    /// # Errors
    ///
    /// [`RotationError::Generation`] when the length is outside
    /// `1..=MAX_PASSWORD_LENGTH`, the required counts exceed the length, or
    /// symbols are required but none are allowed.
    pub fn validate(&self) -> RotationResult<()> {
        if self.length == 0 || self.length > MAX_PASSWORD_LENGTH {
            return Err(generation_error(format!(
                "length must be between 1 and {MAX_PASSWORD_LENGTH}, got {}",
                self.length
            )));
        }
        if self.required.total() > u64::from(self.length) {
            return Err(generation_error(format!(
                "required character counts ({}) exceed length {}",
                self.required.total(),
                self.length
            )));
        }
        if let Some(bad) = self
            .allowed_symbols
            .chars()
            .find(|c| !c.is_ascii_graphic() || c.is_ascii_alphanumeric())
        {
            return Err(generation_error(format!(
                "allowed symbols must be printable ASCII punctuation, found {bad:?}"
            )));
        }
        if self.required.symbols > 0 && self.allowed_symbols.is_empty() {
            return Err(generation_error(
                "symbols are required but no allowed symbols are configured",
            ));
        }
        Ok(())
    }

    fn classes(&self) -> [(&[u8], u32); 4] {
        [
            (LOWERCASE, self.required.lowercase),
            (UPPERCASE, self.required.uppercase),
            (DIGITS, self.required.digits),
            (self.allowed_symbols.as_bytes(), self.required.symbols),
        ]
    }

    /// Characters used to fill the remainder after the required minimums
    fn fill_pool(&self) -> Vec<u8> {
        let classes = self.classes();
        let any_required = classes.iter().any(|(_, count)| *count > 0);
        classes
            .iter()
            .filter(|(_, count)| !any_required || *count > 0)
            .flat_map(|(chars, _)| chars.iter().copied())
            .collect()
    }
}

fn generation_error(reason: impl Into<String>) -> RotationError {
    RotationError::Generation {
        reason: reason.into(),
    }
}

/// Generate a password satisfying `requirements` using the thread-local CSPRNG
///
/// # Examples
///
/// ```
/// use keyshift_rotation::generator::{generate, PasswordRequirements};
///
/// let password = generate(&PasswordRequirements::default()).unwrap();
/// assert_eq!(password.len(), 48);
/// ```
pub fn generate(requirements: &PasswordRequirements) -> RotationResult<SecretString> {
    generate_with(requirements, &mut rand::rng())
}

/// Generate with a caller-supplied CSPRNG
pub fn generate_with<R>(requirements: &PasswordRequirements, rng: &mut R) -> RotationResult<SecretString>
where
    R: Rng + CryptoRng,
{
    requirements.validate()?;

    let length = requirements.length as usize;
    let mut buffer = Zeroizing::new(Vec::with_capacity(length));

    for (chars, count) in requirements.classes() {
        for _ in 0..count {
            buffer.push(chars[rng.random_range(0..chars.len())]);
        }
    }

    let pool = requirements.fill_pool();
    if buffer.len() < length && pool.is_empty() {
        return Err(generation_error("no characters available to fill the password"));
    }
    while buffer.len() < length {
        buffer.push(pool[rng.random_range(0..pool.len())]);
    }

    buffer.shuffle(rng);

    let password: String = buffer.iter().map(|&b| char::from(b)).collect();
    Ok(SecretString::new(password))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn count(password: &SecretString, class: &[u8]) -> usize {
        password.expose_secret(|p| p.bytes().filter(|b| class.contains(b)).count())
    }

    #[test]
    fn test_default_policy() {
        let password = generate(&PasswordRequirements::default()).unwrap();
        assert_eq!(password.len(), 48);
        assert!(count(&password, LOWERCASE) >= 1);
        assert!(count(&password, UPPERCASE) >= 1);
        assert!(count(&password, DIGITS) >= 1);
        // symbols are not required, so the fill pool excludes them
        assert_eq!(count(&password, b"-_.~!*"), 0);
    }

    #[test]
    fn test_exact_length_all_required() {
        let requirements = PasswordRequirements {
            length: 4,
            required: RequiredCounts {
                lowercase: 1,
                uppercase: 1,
                digits: 1,
                symbols: 1,
            },
            allowed_symbols: "!".into(),
        };
        let password = generate(&requirements).unwrap();
        assert_eq!(password.len(), 4);
        assert_eq!(count(&password, b"!"), 1);
    }

    #[test]
    fn test_no_requirements_draws_from_every_class() {
        let requirements = PasswordRequirements {
            length: 250,
            required: RequiredCounts::default(),
            allowed_symbols: "#".into(),
        };
        let password = generate_with(&requirements, &mut StdRng::seed_from_u64(7)).unwrap();
        assert_eq!(password.len(), 250);
        assert!(count(&password, LOWERCASE) > 0);
        assert!(count(&password, UPPERCASE) > 0);
        assert!(count(&password, DIGITS) > 0);
    }

    #[test]
    fn test_only_required_classes_fill_remainder() {
        let requirements = PasswordRequirements {
            length: 64,
            required: RequiredCounts {
                digits: 2,
                ..RequiredCounts::default()
            },
            allowed_symbols: String::new(),
        };
        let password = generate(&requirements).unwrap();
        assert_eq!(count(&password, DIGITS), 64);
    }

    #[test]
    fn test_rejects_unsatisfiable_policies() {
        let too_many = PasswordRequirements {
            length: 2,
            required: RequiredCounts {
                lowercase: 2,
                uppercase: 1,
                ..RequiredCounts::default()
            },
            ..PasswordRequirements::default()
        };
        assert!(matches!(generate(&too_many), Err(RotationError::Generation { .. })));

        let zero = PasswordRequirements {
            length: 0,
            required: RequiredCounts::default(),
            ..PasswordRequirements::default()
        };
        assert!(generate(&zero).is_err());

        let too_long = PasswordRequirements {
            length: MAX_PASSWORD_LENGTH + 1,
            ..PasswordRequirements::default()
        };
        assert!(generate(&too_long).is_err());

        let no_symbols = PasswordRequirements {
            length: 8,
            required: RequiredCounts {
                symbols: 1,
                ..RequiredCounts::default()
            },
            allowed_symbols: String::new(),
        };
        assert!(generate(&no_symbols).is_err());

        let alnum_symbols = PasswordRequirements {
            allowed_symbols: "a!".into(),
            ..PasswordRequirements::default()
        };
        assert!(generate(&alnum_symbols).is_err());
    }

    #[test]
    fn test_seeded_generation_is_reproducible() {
        let requirements = PasswordRequirements::default();
        let a = generate_with(&requirements, &mut StdRng::seed_from_u64(42)).unwrap();
        let b = generate_with(&requirements, &mut StdRng::seed_from_u64(42)).unwrap();
        assert!(a.expose_secret(|a| b.matches(a)));
    }

    #[test]
    fn test_requirements_deserialize_with_defaults() {
        let requirements: PasswordRequirements =
            serde_json::from_str(r#"{"length": 16, "required": {"digits": 3}}"#).unwrap();
        assert_eq!(requirements.length, 16);
        assert_eq!(requirements.required.digits, 3);
        assert_eq!(requirements.required.lowercase, 0);
        assert_eq!(requirements.allowed_symbols, "-_.~!*");
    }
}
