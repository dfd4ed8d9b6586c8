//! Error types for repository operations

use std::error::Error;
use std::fmt;

/// Boxed error type for error sources
pub type BoxError = Box<dyn Error + Send + Sync + 'static>;

/// Result type alias for repository operations
pub type Result<T> = std::result::Result<T, RepoError>;

/// Repository operation error with rich diagnostics
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub struct RepoError {
    kind: RepoErrorKind,
    #[source]
    source: Option<BoxError>,
    #[help]
    help: Option<String>,
    context: Option<String>,
}

/// Error categories for repository operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepoErrorKind {
    /// Storage operation failed
    Storage,
    /// Invalid MST structure
    InvalidMst,
    /// Invalid commit structure
    InvalidCommit,
    /// Invalid key format
    InvalidKey,
    /// Invalid CID
    InvalidCid,
    /// Resource not found
    NotFound,
    /// Cryptographic operation failed
    Crypto,
    /// Serialization/deserialization failed
    Serialization,
    /// CAR file operation failed
    Car,
    /// Firehose subscription error
    Firehose,
    /// I/O error
    Io,
}

impl RepoError {
    /// Create a new error with the given kind and optional source
    pub fn new(kind: RepoErrorKind, source: Option<BoxError>) -> Self {
        Self {
            kind,
            source,
            help: None,
            context: None,
        }
    }

    /// Add a help message to the error
    pub fn with_help(mut self, help: impl Into<String>) -> Self {
        self.help = Some(help.into());
        self
    }

    /// Add context information to the error
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Get the error kind
    pub fn kind(&self) -> &RepoErrorKind {
        &self.kind
    }

    /// Create a storage error
    pub fn storage(source: impl Error + Send + Sync + 'static) -> Self {
        Self::new(RepoErrorKind::Storage, Some(Box::new(source)))
    }

    /// Create an invalid MST error
    pub fn invalid_mst(msg: impl Into<String>) -> Self {
        Self::new(RepoErrorKind::InvalidMst, Some(msg.into().into()))
            .with_help("MST nodes must follow the repository wire format")
    }

    /// Create an invalid commit error
    pub fn invalid_commit(msg: impl Into<String>) -> Self {
        Self::new(RepoErrorKind::InvalidCommit, Some(msg.into().into()))
    }

    /// Create an invalid key error
    pub fn invalid_key(key: impl Into<String>) -> Self {
        Self::new(RepoErrorKind::InvalidKey, None)
            .with_help("MST keys must match [a-zA-Z0-9._:~/-]+, max 256 bytes")
            .with_context(format!("key: {}", key.into()))
    }

    /// Create an invalid CID error
    pub fn invalid_cid(msg: impl Into<String>) -> Self {
        Self::new(RepoErrorKind::InvalidCid, Some(msg.into().into()))
    }

    /// Create a not found error
    pub fn not_found(resource: &str, id: impl fmt::Display) -> Self {
        Self::new(RepoErrorKind::NotFound, None)
            .with_context(format!("{} not found: {}", resource, id))
    }

    /// Create an already exists error
    pub fn already_exists(resource: &str, id: impl fmt::Display) -> Self {
        Self::new(RepoErrorKind::InvalidMst, None)
            .with_context(format!("{} already exists: {}", resource, id))
    }

    /// Create a crypto error
    pub fn crypto(source: impl Error + Send + Sync + 'static) -> Self {
        Self::new(RepoErrorKind::Crypto, Some(Box::new(source)))
    }

    /// Create a serialization error
    pub fn serialization(source: impl Error + Send + Sync + 'static) -> Self {
        Self::new(RepoErrorKind::Serialization, Some(Box::new(source)))
    }

    /// Create a CAR file error
    pub fn car(source: impl Error + Send + Sync + 'static) -> Self {
        Self::new(RepoErrorKind::Car, Some(Box::new(source)))
    }

    /// Create a CAR parse error (alias for car)
    pub fn car_parse(source: impl Error + Send + Sync + 'static) -> Self {
        Self::car(source).with_context("Failed to parse CAR archive".to_string())
    }

    /// Create a firehose error
    pub fn firehose(msg: impl Into<String>) -> Self {
        Self::new(RepoErrorKind::Firehose, Some(msg.into().into()))
    }

    /// Create an I/O error
    pub fn io(source: impl Error + Send + Sync + 'static) -> Self {
        Self::new(RepoErrorKind::Io, Some(Box::new(source)))
    }

    /// Create a generic invalid error
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::new(RepoErrorKind::InvalidMst, Some(msg.into().into()))
    }
}

impl fmt::Display for RepoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;

        if let Some(ctx) = &self.context {
            write!(f, ": {}", ctx)?;
        }

        if let Some(src) = &self.source {
            write!(f, ": {}", src)?;
        }

        Ok(())
    }
}

/// MST-specific errors
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum MstError {
    /// Empty key not allowed
    #[error("Empty key not allowed")]
    EmptyKey,

    /// Key too long
    #[error("Key too long: {len} bytes (max {max})")]
    KeyTooLong {
        /// Actual key length
        len: usize,
        /// Maximum allowed length
        max: usize,
    },

    /// Invalid key characters
    #[error("Invalid key characters: {key}")]
    InvalidKeyChars {
        /// The invalid key
        key: String,
    },

    /// Node structure invalid
    #[error("Node structure invalid: {0}")]
    InvalidNode(String),

    /// Serialization failed
    #[error("Serialization failed")]
    Serialization(#[source] BoxError),
}

impl From<MstError> for RepoError {
    fn from(e: MstError) -> Self {
        match e {
            MstError::EmptyKey => RepoError::invalid_key(""),
            MstError::KeyTooLong { len, max } => {
                RepoError::invalid_key(format!("length {}/{}", len, max))
            }
            MstError::InvalidKeyChars { key } => RepoError::invalid_key(key),
            MstError::InvalidNode(msg) => RepoError::invalid_mst(msg),
            MstError::Serialization(e) => RepoError::new(RepoErrorKind::Serialization, Some(e)),
        }
    }
}

/// Commit-specific errors
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum CommitError {
    /// Invalid commit version
    #[error("Invalid commit version: {0}")]
    InvalidVersion(i64),

    /// Invalid signature format
    #[error("Invalid signature format: {0}")]
    InvalidSignature(String),

    /// Signature verification failed
    #[error("Signature verification failed")]
    SignatureVerificationFailed,

    /// Signing operation failed
    #[error("Signing failed")]
    Signing(#[source] BoxError),

    /// Serialization failed
    #[error("Serialization failed")]
    Serialization(#[source] BoxError),
}

impl From<CommitError> for RepoError {
    fn from(e: CommitError) -> Self {
        match e {
            CommitError::InvalidVersion(v) => {
                RepoError::invalid_commit(format!("unsupported version {}", v))
            }
            CommitError::InvalidSignature(msg) => {
                RepoError::new(RepoErrorKind::Crypto, Some(msg.into()))
                    .with_context("invalid signature format".to_string())
            }
            CommitError::SignatureVerificationFailed => RepoError::new(RepoErrorKind::Crypto, None)
                .with_context("signature verification failed".to_string()),
            CommitError::Signing(e) => RepoError::new(RepoErrorKind::Crypto, Some(e)),
            CommitError::Serialization(e) => RepoError::new(RepoErrorKind::Serialization, Some(e)),
        }
    }
}

impl From<treadle_common::crypto::CryptoError> for RepoError {
    fn from(e: treadle_common::crypto::CryptoError) -> Self {
        RepoError::crypto(e)
    }
}

impl From<treadle_common::TypeError> for RepoError {
    fn from(e: treadle_common::TypeError) -> Self {
        RepoError::new(RepoErrorKind::InvalidKey, Some(Box::new(e)))
    }
}
