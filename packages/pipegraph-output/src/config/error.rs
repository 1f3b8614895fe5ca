//! Configuration error types

use thiserror::Error;

/// Configuration error type
///
/// Every variant is raised before a run touches the filesystem.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No mode chosen for a path decision
    #[error("No {0} mode selected. Choose exactly one.")]
    MissingMode(&'static str),

    /// Two options that cannot be combined
    #[error("'{first}' cannot be combined with '{second}'")]
    Conflicting {
        first: &'static str,
        second: &'static str,
    },

    /// Malformed from-metadata template
    #[error("Invalid template '{template}': {reason}")]
    InvalidTemplate { template: String, reason: String },

    /// Group-by-metadata without keys
    #[error("Group-by-metadata needs at least one metadata key")]
    EmptyGroupKeys,

    /// Regex that fails to compile
    #[error("Invalid pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    /// Rewrite rule not in `search=replacement` form
    #[error("Invalid rewrite rule '{0}'. Expected search=replacement")]
    InvalidRewrite(String),

    /// Unparseable stage/kind selector or filter expression
    #[error("Invalid selector '{selector}': {reason}")]
    InvalidSelector { selector: String, reason: String },

    /// Selector naming a stage the instance doesn't have
    #[error("Stage '{selector}' is not a member of pipeline instance '{instance}'")]
    UnknownStage { selector: String, instance: String },

    #[error("No pipeline instance given")]
    MissingInstance,

    #[error("Destination root must not be empty")]
    EmptyRoot,

    /// Missing version field in YAML
    #[error("Missing 'version' field in configuration file. Add 'version: 1' to the top of your YAML file.")]
    MissingVersion,

    /// Unsupported version
    #[error("Unsupported configuration version {found}. Supported versions: {}", supported.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(", "))]
    UnsupportedVersion { found: u32, supported: Vec<u32> },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parsing error
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Configuration result type
pub type ConfigResult<T> = Result<T, ConfigError>;

impl ConfigError {
    pub fn invalid_template(template: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidTemplate {
            template: template.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_pattern(pattern: impl Into<String>, source: regex::Error) -> Self {
        Self::InvalidPattern {
            pattern: pattern.into(),
            source,
        }
    }
}
