//! Error type shared by every edge operation.
//!
//! Configuration and shape errors are setup-time failures: they mean the
//! network graph is structurally broken, so callers are expected to abort
//! rather than retry.

use thiserror::Error;

use crate::edge::EdgeKind;

pub type Result<T> = std::result::Result<T, EdgeError>;

#[derive(Debug, Error)]
pub enum EdgeError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("cannot tie edge `{edge}` ({kind}) to `{target}` ({target_kind})")]
    IncompatibleTie {
        edge: String,
        kind: EdgeKind,
        target: String,
        target_kind: EdgeKind,
    },

    #[error("shape error: {0}")]
    Shape(String),

    #[error(transparent)]
    Layout(#[from] ndarray::ShapeError),

    #[error("edge `{0}` was used before its image size was set")]
    ImageSizeUnset(String),

    #[error("edge `{0}` has no parameter memory bound")]
    Unbound(String),

    #[error("unknown edge `{0}`")]
    UnknownEdge(String),

    #[error("failed to parse edge configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub(crate) fn configuration(msg: impl Into<String>) -> EdgeError {
    EdgeError::Configuration(msg.into())
}

pub(crate) fn shape(msg: impl Into<String>) -> EdgeError {
    EdgeError::Shape(msg.into())
}
