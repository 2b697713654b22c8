use std::path::{Path, PathBuf};

/// Why a manifest signature was not accepted.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum SignatureError {
    /// The signature is present but does not verify.
    #[error("invalid manifest signature: {path}: {reason}")]
    Invalid { path: PathBuf, reason: String },

    /// No signature block was found.
    #[error("missing signature in: {0}")]
    Missing(PathBuf),

    /// The signature verifies but does not reach the required trust level.
    #[error("untrusted manifest: {0}")]
    Untrusted(PathBuf),

    /// The manifest changed while it was being verified.
    #[error("manifest changed: {0}")]
    Tampered(PathBuf),

    /// The manifest could not be read or the checker could not run.
    #[error("error in verification of signatures: {0}")]
    Unverifiable(String),
}

/// Error type for repository, cache and matching operations.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    /// The package does not resolve to an ebuild, or its ebuild is broken.
    #[error("package not found: {0}")]
    NotFound(String),

    /// Malformed version, atom, slot or USE-conditional syntax.
    #[error("invalid dependency: {0}")]
    InvalidDependency(String),

    /// Invalid EAPI value.
    #[error("invalid EAPI: {0}")]
    InvalidEapi(String),

    /// Invalid keyword string.
    #[error("invalid keyword: {0}")]
    InvalidKeyword(String),

    /// Invalid IUSE flag entry.
    #[error("invalid IUSE entry: {0}")]
    InvalidIUse(String),

    /// Invalid SRC_URI expression.
    #[error("invalid SRC_URI: {0}")]
    InvalidSrcUri(String),

    /// Invalid LICENSE expression.
    #[error("invalid LICENSE: {0}")]
    InvalidLicense(String),

    /// A persisted metadata record could not be decoded.
    #[error("invalid cache entry: {0}")]
    InvalidCacheEntry(String),

    /// Malformed Manifest line.
    #[error("invalid Manifest entry: {0}")]
    InvalidManifest(String),

    /// Manifest signature policy rejected the file.
    #[error(transparent)]
    Signature(#[from] SignatureError),

    /// Filesystem failure.
    #[error("I/O error on {path}: {message}")]
    Io { path: PathBuf, message: String },
}

impl Error {
    pub(crate) fn io(path: &Path, err: std::io::Error) -> Self {
        Error::Io {
            path: path.to_path_buf(),
            message: err.to_string(),
        }
    }
}

/// Result type for portage-repo operations.
pub type Result<T> = std::result::Result<T, Error>;
