//! Error types shared across the clrscope workspace.
//!
//! Unreadable target memory is deliberately *not* represented here: partial
//! dumps and unmapped pages are routine, so every read helper returns an
//! `Option` (or a partial byte count) and enumeration simply stops walking
//! the affected branch. The variants below cover the genuinely fatal cases.

/// Result alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, Error>;

/// Fatal analysis errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The target's runtime version has no supported ABI description.
    ///
    /// Surfaced at session construction: every subsequent offset lookup
    /// would be wrong, so this is never downgraded to a partial result.
    #[error("unsupported runtime version: {0}")]
    UnsupportedRuntime(String),

    /// The session has been disposed and can no longer serve queries.
    #[error("session has been disposed")]
    Disposed,

    /// Heap segments were reported out of order or overlapping.
    #[error("heap segment {index} out of order: {detail}")]
    SegmentsOutOfOrder {
        /// Index of the offending segment in start-address order.
        index: usize,
        /// Description of the violated invariant.
        detail: String,
    },

    /// Invalid session configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A cooperative cancellation token was signalled.
    ///
    /// Partially built caches are discarded by the operation that observed
    /// the cancellation.
    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    /// Create an unsupported-runtime error from any displayable version.
    pub fn unsupported_runtime(version: impl std::fmt::Display) -> Self {
        Self::UnsupportedRuntime(version.to_string())
    }

    /// Create a segment-ordering error.
    pub fn segments_out_of_order(index: usize, detail: impl Into<String>) -> Self {
        Self::SegmentsOutOfOrder {
            index,
            detail: detail.into(),
        }
    }

    /// Create an invalid-configuration error.
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }
}
