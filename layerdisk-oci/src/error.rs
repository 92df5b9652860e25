/// Errors produced while talking to a registry or decoding what it serves.
#[derive(Debug, thiserror::Error)]
pub enum OciError {
    /// The reference string could not be split into registry, repository
    /// and tag/digest.
    #[error("invalid image reference: {0}")]
    InvalidReference(String),

    /// A digest string is not `sha256:` followed by 64 lowercase hex.
    #[error("invalid digest: {0}")]
    InvalidDigest(String),

    /// The registry answered, but not with something usable.
    #[error("registry error: {0}")]
    Registry(String),

    /// 404 from the registry; carries the URL.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("manifest error: {0}")]
    Manifest(String),

    /// Content hashed to something other than its advertised digest.
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    /// A blob body was shorter or longer than its descriptor says.
    #[error("size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, OciError>;
