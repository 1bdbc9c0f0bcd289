use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::eval::EvalError;
use crate::parse::ParseError;

pub type Result<T> = std::result::Result<T, FeatureError>;

#[derive(Debug, Error)]
pub enum FeatureError {
    #[error("no such feature with name {0}")]
    NotFound(String),

    #[error("invalid definition for feature {name}: {reason}")]
    InvalidFeature { name: String, reason: InvalidReason },

    #[error("unknown feature type for {name}")]
    UnknownType { name: String },

    #[error("empty config file {}", .0.display())]
    EmptyConfig(PathBuf),

    #[error("watch already established on {}", .0.display())]
    DuplicateWatch(PathBuf),

    #[error("feature {name}: {source}")]
    Evaluation {
        name: String,
        #[source]
        source: EvalError,
    },

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("invalid features JSON: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("filesystem notifier: {0}")]
    Notify(#[from] notify::Error),
}

/// Why a flag failed validation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InvalidReason {
    #[error("feature name must not be empty")]
    MissingName,
    #[error("percentage must be in [0, 100]; have {0}")]
    PercentageOutOfRange(i32),
    #[error("expression must not be empty")]
    EmptyExpression,
    #[error("could not parse expression: {0}")]
    Uncompilable(ParseError),
}

impl FeatureError {
    /// True for every error that means "this flag must not be stored",
    /// including flags whose type is unknown.
    pub fn is_invalid(&self) -> bool {
        matches!(
            self,
            FeatureError::InvalidFeature { .. } | FeatureError::UnknownType { .. }
        )
    }

    pub(crate) fn invalid(name: &str, reason: InvalidReason) -> Self {
        FeatureError::InvalidFeature {
            name: name.to_string(),
            reason,
        }
    }
}
