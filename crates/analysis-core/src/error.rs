use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum AnalysisError {
    #[error("Insufficient data: {0}")]
    InsufficientData(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Request timeout: {0}")]
    Timeout(String),

    #[error("API error: {0}")]
    ApiError(String),

    #[error("Analysis failed: {0}")]
    AnalysisFailed(String),

    /// An error that has already been mapped to its user-facing form.
    #[error("{0}")]
    Classified(UserFriendlyError),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

/// User-facing error taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    Network,
    Data,
    Analysis,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Network => "network",
            ErrorCategory::Data => "data",
            ErrorCategory::Analysis => "analysis",
            ErrorCategory::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error safe to show to the end user: a category, a short message and an actionable suggestion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserFriendlyError {
    pub category: ErrorCategory,
    pub message: String,
    pub suggestion: String,
}

impl UserFriendlyError {
    pub fn new(
        category: ErrorCategory,
        message: impl Into<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self {
            category,
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }
}

impl fmt::Display for UserFriendlyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {} {}", self.category, self.message, self.suggestion)
    }
}

impl From<UserFriendlyError> for AnalysisError {
    fn from(err: UserFriendlyError) -> Self {
        AnalysisError::Classified(err)
    }
}
