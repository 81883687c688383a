//! Error taxonomy for pattern indexing, chunk planning, pipeline construction and execution.
//!
//! Collaborator code (caches, targets, codecs, stage bodies) speaks [`anyhow::Result`]; anything
//! the engine itself detects is a [`ForgeError`]. Stage failures are wrapped exactly once, at the
//! executor boundary, so callers see one error naming the stage and, for mapped stages, the item.

use serde_json::Value;
use thiserror::Error;

/// Boxed error carried by [`ForgeError::StageExecution`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum ForgeError {
    #[error("dimension `{0}` declared more than once")]
    DimensionConflict(String),

    #[error("invalid pattern: {0}")]
    InvalidPattern(String),

    #[error("formatting function failed for key {key}: {message}")]
    Formatting { key: String, message: String },

    #[error("invalid chunking: {0}")]
    InvalidChunking(String),

    #[error("cannot subset dimension `{dim}`: {reason}")]
    SubsetMismatch { dim: String, reason: String },

    #[error("stage name `{0}` is used by more than one stage")]
    DuplicateStageName(String),

    #[error("no stage named `{0}` in pipeline")]
    StageNotFound(String),

    #[error("stage `{stage}` failed{}: {source}", item_suffix(.item))]
    StageExecution {
        stage: String,
        item: Option<Value>,
        #[source]
        source: BoxError,
    },

    #[error("flow run failed: {message}")]
    FlowFailed { message: String },

    #[error("recipe error: {0}")]
    Recipe(String),

    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, ForgeError>;

impl ForgeError {
    pub(crate) fn stage_failed(stage: &str, item: Option<&Value>, err: anyhow::Error) -> Self {
        ForgeError::StageExecution {
            stage: stage.to_string(),
            item: item.cloned(),
            source: err.into(),
        }
    }

    /// Stage name for [`ForgeError::StageExecution`], `None` for every other variant.
    #[must_use]
    pub fn failed_stage(&self) -> Option<&str> {
        match self {
            ForgeError::StageExecution { stage, .. } => Some(stage),
            _ => None,
        }
    }

    /// Mapped item for a failed mapped stage.
    #[must_use]
    pub fn failed_item(&self) -> Option<&Value> {
        match self {
            ForgeError::StageExecution { item, .. } => item.as_ref(),
            _ => None,
        }
    }
}

fn item_suffix(item: &Option<Value>) -> String {
    match item {
        Some(v) => format!(" on item {v}"),
        None => String::new(),
    }
}
