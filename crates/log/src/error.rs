//! Errors raised while installing the global subscriber.

use thiserror::Error;

/// Logger setup failure
#[derive(Debug, Error)]
pub enum LogError {
    /// The level/filter directive could not be parsed
    #[error("Invalid filter '{filter}': {reason}")]
    Filter {
        /// Directive as supplied
        filter: String,
        /// Parser message
        reason: String,
    },

    /// A global subscriber is already installed
    #[error("Global subscriber already set: {0}")]
    AlreadyInitialized(String),
}

/// Result type for logger operations
pub type LogResult<T> = Result<T, LogError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_error_names_directive() {
        let error = LogError::Filter {
            filter: "debug,,=".into(),
            reason: "syntax error".into(),
        };
        assert!(error.to_string().contains("Invalid filter 'debug,,='"));
    }
}
