//! Error taxonomy for the session lifecycle.
//!
//! Every variant names the stage that failed so callers can tell a failure
//! that left nothing behind (resolution, compose, apply) from one that had to
//! clean up a pod that already existed (post-apply).

use crate::kubectl::KubectlError;
use crate::manifest::TreeError;
use crate::replacer::ReplacerError;

/// Boxed error returned by collaborators such as the image builder.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The inherit reference could not be turned into a baseline.
    #[error("inherit: {0}")]
    Resolution(String),

    #[error("malformed object: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("manifest: {0}")]
    Compose(#[from] TreeError),

    /// The control plane rejected the final manifest.
    #[error("apply: {0}")]
    Apply(#[source] KubectlError),

    /// Something failed after the pod was accepted; the pod has been
    /// deleted on a best-effort basis before this is returned.
    #[error("{source}")]
    PostApply {
        stage: &'static str,
        #[source]
        source: BoxError,
    },

    /// A replacer job for the same identity could not be awaited.
    #[error(transparent)]
    Replacer(#[from] ReplacerError),

    /// The session pod's status could not be read.
    #[error("status: {0}")]
    Status(#[source] KubectlError),

    #[error("delete: {0}")]
    Teardown(#[source] KubectlError),

    #[error("{0}: timed out")]
    Timeout(&'static str),
}

impl SessionError {
    pub(crate) fn post_apply(stage: &'static str, source: impl Into<BoxError>) -> Self {
        SessionError::PostApply {
            stage,
            source: source.into(),
        }
    }
}
