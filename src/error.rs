//! Error types for Tessera
//!
//! Every failure the engine can produce is a [`TesseraError`]. Variants are
//! grouped into five broad kinds (see [`ErrorKind`]) so callers can branch on
//! what to do next without matching every variant:
//!
//! - **Validation**: malformed input, rejected before anything is written
//! - **Integrity**: a digest or decryption check failed; the offending artifact
//!   has already been deleted
//! - **MissingData**: a referenced file, chunk or transaction is not present
//!   locally; the caller may fetch it and retry
//! - **State**: the resource history does not allow the operation
//! - **Io**: filesystem failures
//!
//! A missing chunk is never reported as corruption. Use
//! [`TesseraError::is_missing_data`] to decide whether a network fetch should
//! be scheduled.

use std::path::PathBuf;
use thiserror::Error;

/// Type alias for Results in the Tessera library
pub type Result<T> = std::result::Result<T, TesseraError>;

/// Coarse classification of a [`TesseraError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed input or a bound was exceeded
    Validation,
    /// Digest, size or authentication tag mismatch
    Integrity,
    /// Referenced data is absent locally
    MissingData,
    /// Resource history does not permit the operation
    State,
    /// Generic filesystem or serialization failure
    Io,
}

/// Main error type for all Tessera operations
#[derive(Debug, Error)]
pub enum TesseraError {
    /// I/O errors during file operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors during JSON serialization/deserialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Errors during bincode serialization/deserialization
    #[error("Bincode error: {0}")]
    Bincode(String),

    /// Walk directory error from walkdir crate
    #[error("Walk directory error: {0}")]
    WalkDir(#[from] walkdir::Error),

    /// Input rejected before any work was done
    #[error("Validation failed: {0}")]
    Validation(String),

    /// File exceeds the configured size bound
    #[error("File too large: {path:?} ({size} bytes exceeds limit of {limit} bytes)")]
    FileTooLarge {
        /// Path to the file
        path: PathBuf,
        /// Actual file size
        size: u64,
        /// Configured size limit
        limit: u64,
    },

    /// Digest mismatch after store, join or merge
    #[error("Hash mismatch - expected: {expected}, actual: {actual}")]
    HashMismatch {
        /// Expected digest
        expected: String,
        /// Actual computed digest
        actual: String,
    },

    /// Declared size does not match the bytes on disk
    #[error("Size mismatch for {digest} - expected: {expected}, actual: {actual}")]
    SizeMismatch {
        /// Digest of the file
        digest: String,
        /// Declared size
        expected: u64,
        /// Size on disk
        actual: u64,
    },

    /// A layer could not be applied to its base
    #[error("Layer does not apply: {0}")]
    LayerMismatch(String),

    /// Encryption or decryption failure
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Archive creation or extraction failure
    #[error("Compression error: {0}")]
    Compression(String),

    /// Content files or chunks absent from the local store
    #[error("Missing data: {} file(s) not present locally", .0.len())]
    MissingData(Vec<String>),

    /// Transaction not known to the ledger
    #[error("Transaction not found: {0}")]
    TransactionNotFound(String),

    /// Resource history forbids the operation
    #[error("Invalid resource state: {0}")]
    State(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Refused to touch a path outside the managed roots
    #[error("Path {0:?} is outside the data and temp roots")]
    UnsafePath(PathBuf),
}

impl From<bincode::error::DecodeError> for TesseraError {
    fn from(err: bincode::error::DecodeError) -> Self {
        TesseraError::Bincode(err.to_string())
    }
}

impl From<bincode::error::EncodeError> for TesseraError {
    fn from(err: bincode::error::EncodeError) -> Self {
        TesseraError::Bincode(err.to_string())
    }
}

impl TesseraError {
    /// Create a validation error with a custom message
    pub fn validation(msg: impl Into<String>) -> Self {
        TesseraError::Validation(msg.into())
    }

    /// Create a state error with a custom message
    pub fn state(msg: impl Into<String>) -> Self {
        TesseraError::State(msg.into())
    }

    /// Create a compression error with a custom message
    pub fn compression(msg: impl Into<String>) -> Self {
        TesseraError::Compression(msg.into())
    }

    /// Create a crypto error with a custom message
    pub fn crypto(msg: impl Into<String>) -> Self {
        TesseraError::Crypto(msg.into())
    }

    /// Create a missing-data error for a single digest
    pub fn missing(digest: impl Into<String>) -> Self {
        TesseraError::MissingData(vec![digest.into()])
    }

    /// Broad classification of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            TesseraError::Validation(_)
            | TesseraError::FileTooLarge { .. }
            | TesseraError::InvalidConfiguration(_)
            | TesseraError::UnsafePath(_) => ErrorKind::Validation,
            TesseraError::HashMismatch { .. }
            | TesseraError::SizeMismatch { .. }
            | TesseraError::LayerMismatch(_)
            | TesseraError::Crypto(_) => ErrorKind::Integrity,
            TesseraError::MissingData(_) | TesseraError::TransactionNotFound(_) => {
                ErrorKind::MissingData
            }
            TesseraError::State(_) => ErrorKind::State,
            TesseraError::Io(_)
            | TesseraError::Json(_)
            | TesseraError::Bincode(_)
            | TesseraError::WalkDir(_)
            | TesseraError::Compression(_) => ErrorKind::Io,
        }
    }

    /// Digests the caller could fetch to make a retry succeed
    pub fn missing_hashes(&self) -> &[String] {
        match self {
            TesseraError::MissingData(hashes) => hashes,
            _ => &[],
        }
    }

    /// Check if this error means data needs fetching rather than repair
    pub fn is_missing_data(&self) -> bool {
        self.kind() == ErrorKind::MissingData
    }

    /// Check if this error indicates corruption
    pub fn is_corruption(&self) -> bool {
        self.kind() == ErrorKind::Integrity
    }

    /// Check if retrying the same call later may succeed
    pub fn is_recoverable(&self) -> bool {
        matches!(self.kind(), ErrorKind::MissingData | ErrorKind::Io)
    }

    /// Get a user-friendly error message with suggestions
    pub fn user_message(&self) -> String {
        match self {
            TesseraError::MissingData(hashes) => {
                format!(
                    "{} file(s) are not available locally. Fetch them from peers and retry.",
                    hashes.len()
                )
            }
            TesseraError::FileTooLarge { path, size, limit } => {
                format!(
                    "File {:?} is too large ({} bytes). Maximum allowed size is {} bytes.",
                    path, size, limit
                )
            }
            TesseraError::State(msg) => {
                format!("{}. Publish a PUT for this resource before patching it.", msg)
            }
            TesseraError::HashMismatch { .. } | TesseraError::SizeMismatch { .. } => {
                format!("{}. The local copy was discarded; fetch it again.", self)
            }
            _ => self.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TesseraError::TransactionNotFound("abc123".to_string());
        assert_eq!(err.to_string(), "Transaction not found: abc123");

        let err = TesseraError::MissingData(vec!["a".into(), "b".into()]);
        assert_eq!(err.to_string(), "Missing data: 2 file(s) not present locally");
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(TesseraError::validation("x").kind(), ErrorKind::Validation);
        assert_eq!(TesseraError::state("x").kind(), ErrorKind::State);
        assert_eq!(TesseraError::missing("ab").kind(), ErrorKind::MissingData);
        assert_eq!(
            TesseraError::HashMismatch {
                expected: "abc".to_string(),
                actual: "def".to_string(),
            }
            .kind(),
            ErrorKind::Integrity
        );
    }

    #[test]
    fn test_missing_data_is_not_corruption() {
        let err = TesseraError::missing("abcd");
        assert!(err.is_missing_data());
        assert!(!err.is_corruption());
        assert!(err.is_recoverable());
        assert_eq!(err.missing_hashes(), &["abcd".to_string()]);
    }

    #[test]
    fn test_error_corruption() {
        assert!(TesseraError::crypto("bad tag").is_corruption());
        assert!(!TesseraError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "test"
        ))
        .is_corruption());
    }
}
