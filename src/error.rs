//! Error types for cohort compilation.

use thiserror::Error;

/// Result type alias for cohort compilation.
pub type Result<T> = std::result::Result<T, CohortError>;

/// Errors raised while parsing, resolving or compiling a cohort filter.
///
/// Compilation never yields partial output: any of these aborts before SQL
/// is produced.
#[derive(Error, Debug)]
pub enum CohortError {
    /// The filter JSON is structurally invalid.
    #[error("malformed filter at {path}: {message}")]
    MalformedFilter {
        /// JSON path of the offending node, e.g. `$.values[1].values[0]`.
        path: String,
        message: String,
    },

    /// A leaf references something the team does not have.
    #[error("unresolved {kind} reference: {reference}")]
    UnresolvedReference { kind: &'static str, reference: String },

    /// Catalog or compiler configuration could not be loaded.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CohortError {
    pub fn malformed(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::MalformedFilter {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn unresolved_action(action_id: i64) -> Self {
        Self::UnresolvedReference {
            kind: "action",
            reference: action_id.to_string(),
        }
    }
}
