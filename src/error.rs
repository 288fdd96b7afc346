//! Error types for blobcrypt

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for blobcrypt
#[derive(Error, Debug)]
pub enum Error {
    // Crypto errors
    #[error("HMAC Invalid")]
    HmacInvalid,

    #[error("Invalid key length: expected {expected}, got {got}")]
    KeySize { expected: usize, got: usize },

    #[error("RSA key too small: {bits} bits, need at least {min}")]
    RsaKeySize { bits: usize, min: usize },

    #[error("RSA envelope error: {0}")]
    Envelope(#[from] rsa::Error),

    #[error("Unrecognized sealed key type: {0}")]
    SealedKeyType(String),

    #[error("Sealed manifest requires a private key")]
    PrivateKeyRequired,

    // Format errors
    #[error("Manifest format error: {0}")]
    ManifestFormat(String),

    #[error("Archive format error: {0}")]
    ArchiveFormat(String),

    #[error("Path escapes restore root: {0}")]
    PathEscape(String),

    // Store errors
    #[error("No manifest entry for blob: {0}")]
    UnknownBlob(String),

    #[error("Manifest save failed, store and manifest may be inconsistent: {0}")]
    ManifestSave(io::Error),

    // Config errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Scan errors
    #[error("Scan error at {}: {source}", .path.display())]
    Scan { path: PathBuf, source: io::Error },

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}
