use std::path::PathBuf;

/// Errors surfaced by the cache.
///
/// Most filesystem noise is classified and swallowed at the call sites
/// documented in each module (racing writers, files that vanish from a
/// cache); whatever reaches this enum is something the caller has to act
/// on.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A digest algorithm was requested that this build cannot compute.
    #[error("no implementation for digest algorithm `{0}`")]
    NoSuchAlgorithm(String),

    /// A declared size did not match the bytes that were actually seen.
    #[error("content size mismatch: expected {expected} bytes, found {found}")]
    SizeMismatch {
        /// The size the caller or index entry declared.
        expected: u64,
        /// The size actually observed.
        found: u64,
    },

    /// Content failed verification against its integrity string.
    #[error("integrity check failed: wanted `{expected}`, computed `{found}`")]
    IntegrityMismatch {
        /// The declared hashes for the checked algorithm.
        expected: String,
        /// The digest computed from the actual bytes.
        found: String,
    },

    /// A `get` found no live index entry for the key.
    #[error("no cache entry for `{key}` in {}", .cache.display())]
    EntryNotFound {
        /// The cache root that was searched.
        cache: PathBuf,
        /// The key that had no live entry.
        key: String,
    },

    /// The caller supplied inconsistent arguments; detected before any I/O.
    #[error("{0}")]
    BadArgument(String),

    /// An index entry could not be serialized.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Any I/O error not documented as swallowed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The result type used throughout this crate.
pub type Result<T> = std::result::Result<T, Error>;
