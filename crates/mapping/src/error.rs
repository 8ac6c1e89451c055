use thiserror::Error;

use erpbridge_core::{ConnectorError, EntityKind};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum MappingError {
    #[error("invalid field path `{path}`: {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("no mapping defined for {from_schema} -> {to_schema} ({entity_kind})")]
    MappingNotFound {
        from_schema: String,
        to_schema: String,
        entity_kind: EntityKind,
    },

    #[error("required field `{source_path}` (-> `{target_path}`) is missing")]
    RequiredFieldMissing {
        source_path: String,
        target_path: String,
    },

    #[error("required fields missing: {}", paths.join(", "))]
    MissingRequired { paths: Vec<String> },

    #[error("transform for `{path}` failed: {message}")]
    Transform { path: String, message: String },

    /// An inferred reverse mapping needs an explicit transform before it can be applied.
    #[error("no reverse transform registered for `{path}`")]
    MissingReverseTransform { path: String },

    #[error("cannot write `{path}`: {reason}")]
    PathConflict { path: String, reason: String },

    #[error("expected {expected}, got {found}")]
    UnexpectedInput { expected: &'static str, found: String },

    #[error("item {index}: {source}")]
    Item {
        index: usize,
        #[source]
        source: Box<MappingError>,
    },
}

impl MappingError {
    pub fn transform(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transform {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Mapping failures reach connector callers as validation errors (non-retryable).
impl From<MappingError> for ConnectorError {
    fn from(err: MappingError) -> Self {
        ConnectorError::validation(err.to_string())
    }
}
