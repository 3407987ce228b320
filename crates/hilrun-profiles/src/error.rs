//! Error types for profile loading, templating, and resolution.

use std::path::PathBuf;

use crate::parse::ValidationIssue;

/// Errors that can occur while loading or resolving platform profiles.
#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    /// TOML deserialization error.
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    /// I/O error reading profile files.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Profile file or registry directory not found.
    #[error("profile file not found: {}", path.display())]
    NotFound {
        /// The path that was not found.
        path: PathBuf,
    },

    /// No profile is registered under this id.
    #[error("unknown platform: '{id}'")]
    UnknownPlatform {
        /// The requested platform id.
        id: String,
    },

    /// A profile file's `id` disagrees with its file name.
    #[error("profile id '{id}' does not match file name '{}'", path.display())]
    IdMismatch { id: String, path: PathBuf },

    /// A placeholder template could not be parsed or expanded.
    #[error("template error in '{arg}': {detail}")]
    Template { arg: String, detail: String },

    /// The profile failed validation.
    #[error("profile '{id}' is invalid: {}", summarize(issues))]
    Invalid {
        id: String,
        issues: Vec<ValidationIssue>,
    },
}

fn summarize(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .filter(|i| i.is_error())
        .map(|i| i.message.as_str())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result type for profile operations.
pub type Result<T> = std::result::Result<T, ProfileError>;
