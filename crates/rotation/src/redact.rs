//! Scrubbing generated secrets out of error text
//!
//! Driver errors routinely echo the statement that failed, and the statement
//! carries the new password. Every error path that has seen a generated
//! [`Credential`] runs through a [`Redactor`] before the error leaves the
//! engine.

use zeroize::Zeroizing;

use crate::credential::Credential;
use crate::error::RotationError;
use crate::secret::{REDACTED, SecretString};

/// Replaces known secret values with [`REDACTED`]
#[derive(Default)]
pub struct Redactor {
    secrets: Vec<Zeroizing<String>>,
}

impl Redactor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_credentials<'a>(credentials: impl IntoIterator<Item = &'a Credential>) -> Self {
        let mut redactor = Self::new();
        for credential in credentials {
            redactor.track(&credential.password);
        }
        redactor
    }

    /// Start redacting one more secret
    pub fn track(&mut self, secret: &SecretString) {
        if secret.is_empty() {
            return;
        }
        self.insert(Zeroizing::new(secret.expose_secret(str::to_owned)));
    }

    /// Also redact `secret` in the form `render` gives it, e.g. escaped into
    /// a statement literal
    ///
    /// Nothing is added when the rendered form equals the plain one.
    pub fn track_rendered(&mut self, secret: &SecretString, render: impl FnOnce(&str) -> String) {
        if secret.is_empty() {
            return;
        }
        let rendered = secret.expose_secret(|plain| {
            let rendered = Zeroizing::new(render(plain));
            (rendered.as_str() != plain).then_some(rendered)
        });
        if let Some(rendered) = rendered {
            self.insert(rendered);
        }
    }

    fn insert(&mut self, value: Zeroizing<String>) {
        if value.is_empty() || self.secrets.iter().any(|known| known.as_str() == value.as_str()) {
            return;
        }
        // Longest first, so a secret that contains another is replaced whole.
        let position = self
            .secrets
            .iter()
            .position(|known| known.len() < value.len())
            .unwrap_or(self.secrets.len());
        self.secrets.insert(position, value);
    }

    /// Replace every occurrence of a tracked secret in `text`
    pub fn redact(&self, text: &str) -> String {
        self.secrets
            .iter()
            .fold(text.to_owned(), |acc, secret| acc.replace(secret.as_str(), REDACTED))
    }

    /// Whether `text` still contains a tracked secret
    pub fn contains_secret(&self, text: &str) -> bool {
        self.secrets.iter().any(|secret| text.contains(secret.as_str()))
    }

    /// Redact every text field of `error`
    ///
    /// If a secret survives redaction the whole message is replaced by
    /// [`RotationError::RedactionInvariantViolation`].
    pub fn scrub(&self, error: RotationError) -> RotationError {
        if self.secrets.is_empty() {
            return error;
        }
        let kind = error.kind();
        let scrubbed = error.map_text(|text| self.redact(text));
        if self.contains_secret(&scrubbed.to_string()) {
            tracing::error!(
                error_kind = %kind,
                "generated secret survived redaction; error details withheld"
            );
            return RotationError::RedactionInvariantViolation;
        }
        scrubbed
    }
}

/// Redact `error`'s message against the passwords of `credentials`
///
/// # Examples
///
/// ```
/// use keyshift_rotation::{Credential, SecretString, redact::redact};
///
/// let credentials = [Credential::new("svc", SecretString::new("Tr0ub4dor"))];
/// let message = redact(&"syntax error near 'Tr0ub4dor'", &credentials);
/// assert_eq!(message, "syntax error near '[REDACTED]'");
/// ```
pub fn redact(error: &impl std::fmt::Display, credentials: &[Credential]) -> String {
    let redactor = Redactor::for_credentials(credentials);
    let message = redactor.redact(&error.to_string());
    if redactor.contains_secret(&message) {
        return RotationError::RedactionInvariantViolation.to_string();
    }
    message
}
