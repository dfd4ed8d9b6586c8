//! Validation errors for the baseline data types

/// Error raised when a string fails validation for one of the identifier
/// types in this crate.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, miette::Diagnostic)]
pub enum TypeError {
    /// Not a syntactically valid DID
    #[error("invalid DID: {0}")]
    #[diagnostic(help("DIDs must match ^did:[a-z]+:[a-zA-Z0-9._:%-]+$"))]
    InvalidDid(String),

    /// Not a syntactically valid NSID
    #[error("invalid collection NSID: {0}")]
    #[diagnostic(help("collections must be dotted lower-case identifiers, e.g. app.bsky.feed.post"))]
    InvalidNsid(String),

    /// Not a syntactically valid record key
    #[error("invalid record key: {0}")]
    #[diagnostic(help("record keys must match ^[a-zA-Z0-9._~-]+$ and be at most 512 bytes"))]
    InvalidRkey(String),

    /// Not a syntactically valid TID
    #[error("invalid TID: {0}")]
    InvalidTid(String),

    /// Not a syntactically valid at:// URI
    #[error("invalid at:// URI: {0}")]
    #[diagnostic(help("record URIs look like at://did:plc:abc/app.bsky.feed.post/3kabcdefghijk"))]
    InvalidAtUri(String),

    /// Not a valid Lexicon datetime
    #[error("invalid datetime: {0}")]
    InvalidDatetime(String),

    /// Not a CID this repository format accepts
    #[error("invalid CID: {0}")]
    #[diagnostic(help("repository CIDs are CIDv1, dag-cbor, sha2-256 with a 32-byte digest"))]
    InvalidCid(String),
}
