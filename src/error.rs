use std::path::PathBuf;

/// Failure taxonomy for one thumbnail production run.
///
/// None of these are fatal to the daemon: the resolver recovers from
/// `Resolution` and `Conversion` by moving to the next icon source, the
/// embedder recovers from `Metadata` by keeping the previous buffer, and a
/// `Publication` failure only aborts the current bundle.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ThumbnailError {
    /// No usable icon at one level of the fallback chain.
    #[error("no usable icon from {strategy}: {reason}")]
    Resolution {
        strategy: &'static str,
        reason: String,
    },

    /// Vector parsing, rasterization or PNG encoding failed.
    #[error("vector conversion failed: {0}")]
    Conversion(String),

    /// A provenance key could not be embedded.
    #[error("failed to embed {key}: {reason}")]
    Metadata { key: String, reason: String },

    /// Directory creation, file write, timestamp or rename failed.
    #[error("failed to publish {}: {reason}", .path.display())]
    Publication { path: PathBuf, reason: String },

    /// The job never ran to completion (queue closed, task panicked).
    #[error("thumbnail job failed: {0}")]
    Worker(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ThumbnailError {
    pub(crate) fn publication(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        ThumbnailError::Publication {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ThumbnailError>;
