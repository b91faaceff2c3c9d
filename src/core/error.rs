use crate::schema::validator::FieldError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Failure of an external collaborator (LLM, data aggregator, idea source).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    #[error("{provider} timed out after {after:?}")]
    Timeout { provider: String, after: Duration },

    #[error("{provider} request failed: {message}")]
    Request { provider: String, message: String },

    #[error("{provider} returned an empty response")]
    EmptyResponse { provider: String },
}

impl ProviderError {
    pub fn request(provider: impl Into<String>, err: impl fmt::Display) -> Self {
        Self::Request {
            provider: provider.into(),
            message: format!("{err:#}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapKind {
    DailyTarget,
    DailyMax,
    WeeklyMax,
}

impl fmt::Display for CapKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapKind::DailyTarget => f.write_str("daily target"),
            CapKind::DailyMax => f.write_str("daily max"),
            CapKind::WeeklyMax => f.write_str("weekly max"),
        }
    }
}

/// A deliberate stop: the next promotion would cross a cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind} reached ({current}/{limit})")]
pub struct CapacityExceeded {
    pub kind: CapKind,
    pub limit: u32,
    pub current: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("{schema} output failed validation ({} error(s))", errors.len())]
    Validation {
        schema: String,
        errors: Vec<FieldError>,
    },

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    CapacityExceeded(#[from] CapacityExceeded),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("cancelled")]
    Cancelled,

    #[error("task panicked: {0}")]
    Panicked(String),

    #[error("store error: {0:#}")]
    Store(#[from] anyhow::Error),
}

impl PipelineError {
    /// Short machine-friendly label used in reports and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Validation { .. } => "validation",
            PipelineError::Provider(_) => "provider",
            PipelineError::CapacityExceeded(_) => "capacity_exceeded",
            PipelineError::Configuration(_) => "configuration",
            PipelineError::Cancelled => "cancelled",
            PipelineError::Panicked(_) => "panicked",
            PipelineError::Store(_) => "store",
        }
    }
}
