//! Configuration types and presets

use serde::{Deserialize, Serialize};

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log level filter (e.g., "info", "debug,sqlx=warn")
    pub level: String,

    /// Output format
    pub format: Format,

    /// Display configuration
    pub display: DisplayConfig,

    /// Global fields attached to the root span
    pub fields: Fields,
}

/// Output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    /// Human-readable with colors and indentation
    Pretty,
    /// Compact single-line output
    Compact,
    /// Structured JSON output
    Json,
}

impl Format {
    /// Parse a format name, falling back to [`Format::Compact`]
    pub fn parse_lossy(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "pretty" => Self::Pretty,
            "json" => Self::Json,
            _ => Self::Compact,
        }
    }
}

/// Display configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    /// Show timestamps
    pub time: bool,
    /// Show source location (file:line)
    pub source: bool,
    /// Show target module
    pub target: bool,
    /// Use ANSI colors
    pub colors: bool,
    /// Flatten JSON events
    pub flatten: bool,
}

/// Global fields configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fields {
    /// Service name
    pub service: Option<String>,
    /// Environment (dev/staging/prod)
    pub env: Option<String>,
    /// Version
    pub version: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: Format::Compact,
            display: DisplayConfig::default(),
            fields: Fields::default(),
        }
    }
}

impl Config {
    /// Create configuration from environment variables
    ///
    /// Reads `KEYSHIFT_LOG` (falling back to `RUST_LOG`), `KEYSHIFT_LOG_FORMAT`,
    /// `KEYSHIFT_LOG_TIME`, `KEYSHIFT_LOG_COLORS` and the service fields.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(level) = std::env::var("KEYSHIFT_LOG") {
            config.level = level;
        } else if let Ok(level) = std::env::var("RUST_LOG") {
            config.level = level;
        }

        if let Ok(format) = std::env::var("KEYSHIFT_LOG_FORMAT") {
            config.format = Format::parse_lossy(&format);
        }

        config.display.parse_env();
        config.fields = Fields::from_env();
        config
    }

    /// Development configuration (pretty, debug level)
    pub fn development() -> Self {
        Self {
            level: "debug".to_string(),
            format: Format::Pretty,
            display: DisplayConfig {
                colors: true,
                source: true,
                ..DisplayConfig::default()
            },
            ..Self::default()
        }
    }

    /// Production configuration (JSON, info level)
    pub fn production() -> Self {
        Self {
            level: "info".to_string(),
            format: Format::Json,
            display: DisplayConfig {
                colors: false,
                source: false,
                flatten: true,
                ..DisplayConfig::default()
            },
            ..Self::default()
        }
    }

    /// Test configuration: everything, no colors, no timestamps
    pub fn test() -> Self {
        Self {
            level: "trace".to_string(),
            format: Format::Compact,
            display: DisplayConfig {
                colors: false,
                time: false,
                ..DisplayConfig::default()
            },
            ..Self::default()
        }
    }

    /// Override the level filter
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            time: true,
            source: cfg!(debug_assertions),
            target: true,
            colors: std::io::IsTerminal::is_terminal(&std::io::stderr()),
            flatten: true,
        }
    }
}

impl DisplayConfig {
    fn parse_env(&mut self) {
        if let Ok(v) = std::env::var("KEYSHIFT_LOG_TIME") {
            self.time = flag(&v);
        }
        if let Ok(v) = std::env::var("KEYSHIFT_LOG_SOURCE") {
            self.source = flag(&v);
        }
        if let Ok(v) = std::env::var("KEYSHIFT_LOG_COLORS") {
            self.colors = flag(&v);
        }
    }
}

fn flag(value: &str) -> bool {
    value != "0" && !value.eq_ignore_ascii_case("false")
}

impl Fields {
    /// Create fields from environment variables
    pub fn from_env() -> Self {
        Self {
            service: std::env::var("KEYSHIFT_SERVICE").ok(),
            env: std::env::var("KEYSHIFT_ENV").ok(),
            version: std::env::var("KEYSHIFT_VERSION").ok(),
        }
    }

    /// Check if fields are empty
    pub fn is_empty(&self) -> bool {
        self.service.is_none() && self.env.is_none() && self.version.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    #[rstest]
    #[case("pretty", Format::Pretty)]
    #[case("JSON", Format::Json)]
    #[case("compact", Format::Compact)]
    #[case("logfmt", Format::Compact)]
    fn test_format_parse_lossy(#[case] input: &str, #[case] expected: Format) {
        assert_eq!(Format::parse_lossy(input), expected);
    }

    #[test]
    fn test_presets() {
        let dev = Config::development();
        assert_eq!(dev.level, "debug");
        assert_eq!(dev.format, Format::Pretty);

        let prod = Config::production();
        assert_eq!(prod.format, Format::Json);
        assert!(!prod.display.colors);

        let test = Config::test();
        assert_eq!(test.level, "trace");
        assert!(!test.display.time);
    }

    #[test]
    fn test_config_deserializes_partial_document() {
        let config: Config =
            serde_json::from_str(r#"{"level":"warn","format":"json"}"#).expect("valid config");
        assert_eq!(config.level, "warn");
        assert_eq!(config.format, Format::Json);
        assert!(config.fields.is_empty());
    }

    #[test]
    fn test_flag_parsing() {
        assert!(flag("1"));
        assert!(flag("yes"));
        assert!(!flag("0"));
        assert!(!flag("FALSE"));
    }
}
