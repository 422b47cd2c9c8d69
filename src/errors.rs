//! Error taxonomy for the node coordinator.
//!
//! Every variant here corresponds to one of the error kinds named in the
//! service specification: transient conditions the caller can retry,
//! and fatal conditions that abort startup.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum NodeError {
    /// Admission queue overflow: caller should back off and retry.
    #[error("admission queue full")]
    Full,

    /// A filesystem step (ensure_dir, rename, read, write) failed.
    #[error("{step} failed for {path:?}: {reason}")]
    Io {
        step: &'static str,
        path: PathBuf,
        reason: std::io::Error,
    },

    /// Tag has no index entry.
    #[error("tag not found")]
    NotFound,

    /// Required configuration key absent or invalid at init.
    #[error("missing or invalid configuration key '{key}'")]
    ConfigMissing { key: &'static str },

    /// ddfs_root could not be enumerated at startup.
    #[error("ddfs_root {0:?} is not enumerable")]
    RootUnreadable(PathBuf),

    /// A precondition the caller was supposed to guarantee did not hold
    /// (e.g. commit_map missing this node's entry). Never guessed at:
    /// always surfaced loudly.
    #[error("internal invariant violated: {detail}")]
    Internal { detail: String },
}

impl NodeError {
    pub fn io(step: &'static str, path: impl Into<PathBuf>, reason: std::io::Error) -> Self {
        NodeError::Io {
            step,
            path: path.into(),
            reason,
        }
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        NodeError::Internal {
            detail: detail.into(),
        }
    }
}
