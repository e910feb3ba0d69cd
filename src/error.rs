//! Error types for the signer.
//!
//! Two layers live here:
//!
//! - [`Error`] covers low-level failures: PDF syntax, cross-reference tables, stream decoding,
//!   I/O, certificate parsing and the cryptographic backend.
//! - [`SignError`] is the batch-level taxonomy reported to callers. Each pipeline stage maps the
//!   low-level errors it sees into one of these kinds, so a caller never has to guess whether a
//!   parse error came from the document or from the certificate store.

use std::path::PathBuf;

/// Result type alias for low-level operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Low-level error types raised while parsing, writing or signing PDFs.
#[derive(Debug, thiserror::Error)]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    /// Invalid PDF header (expected '%PDF-')
    #[error("Invalid PDF header: expected '%PDF-', found '{0}'")]
    InvalidHeader(String),

    /// Parse error at specific byte offset
    #[error("Failed to parse object at byte {offset}: {reason}")]
    ParseError {
        /// Byte offset where error occurred
        offset: usize,
        /// Reason for parse failure
        reason: String,
    },

    /// Invalid or missing cross-reference data
    #[error("Invalid cross-reference table: {0}")]
    InvalidXref(String),

    /// Referenced object not found in cross-reference table
    #[error("Object not found: {0} {1} R")]
    ObjectNotFound(u32, u16),

    /// Object has wrong type
    #[error("Invalid object type: expected {expected}, found {found}")]
    InvalidObjectType {
        /// Expected object type
        expected: String,
        /// Actual object type found
        found: String,
    },

    /// Unexpected end of file
    #[error("End of file reached unexpectedly")]
    UnexpectedEof,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid PDF structure (generic)
    #[error("Invalid PDF: {0}")]
    InvalidPdf(String),

    /// The document is encrypted
    #[error("Document is encrypted")]
    Encrypted,

    /// Stream decoding error
    #[error("Stream decoding error: {0}")]
    Decode(String),

    /// Unsupported stream filter
    #[error("Unsupported filter: {0}")]
    UnsupportedFilter(String),

    /// Circular reference detected in object graph
    #[error("Circular reference detected: object {0}")]
    CircularReference(crate::object::ObjectRef),

    /// Recursion depth limit exceeded
    #[error("Recursion depth limit exceeded (max: {0})")]
    RecursionLimitExceeded(u32),

    /// Certificate could not be parsed or is unusable
    #[error("Certificate error: {0}")]
    Certificate(String),

    /// Private key could not be decoded
    #[error("Private key error: {0}")]
    PrivateKey(String),

    /// Cryptographic backend failure (digest, signature, CMS encoding)
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Invalid caller-supplied argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<der::Error> for Error {
    fn from(err: der::Error) -> Self {
        Error::Crypto(format!("DER: {}", err))
    }
}

impl From<rsa::Error> for Error {
    fn from(err: rsa::Error) -> Self {
        Error::Crypto(format!("RSA: {}", err))
    }
}

/// Classification of a [`SignError`], handy for tallies and pattern matching without the
/// attached detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum SignErrorKind {
    /// Credential store missing or locked
    CredentialUnavailable,
    /// Credential outside its validity window
    CredentialExpired,
    /// Certificate chain failed validation
    CredentialInvalidChain,
    /// Destination directory cannot be written
    DestinationUnavailable,
    /// Source file could not be read
    UnreadableFile,
    /// Source file is not a usable PDF
    MalformedDocument,
    /// Anchor page does not exist in the document
    PageIndexOutOfRange,
    /// Cryptographic operation failed
    SigningBackendError,
    /// Signing did not finish within the configured ceiling
    SigningTimeout,
    /// Signed output could not be written
    WriteFailure,
    /// The batch was cancelled before this file finished
    Cancelled,
}

/// Batch-level error taxonomy.
///
/// Credential and destination errors are fatal to a batch and returned from
/// [`BatchCoordinator::run`](crate::batch::BatchCoordinator::run). Everything else is recorded in
/// the failing file's [`SigningResult`](crate::batch::SigningResult) while the batch carries on.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SignError {
    /// Credential store missing or locked
    #[error("credential unavailable: {0}")]
    CredentialUnavailable(String),

    /// Credential outside its validity window
    #[error("credential expired: {0}")]
    CredentialExpired(String),

    /// Certificate chain failed validation
    #[error("invalid certificate chain: {0}")]
    CredentialInvalidChain(String),

    /// Destination directory cannot be written
    #[error("destination unavailable: {path}: {reason}")]
    DestinationUnavailable {
        /// Destination directory
        path: PathBuf,
        /// What went wrong
        reason: String,
    },

    /// Source file could not be read
    #[error("unreadable file: {0}")]
    UnreadableFile(String),

    /// Source file is not a usable PDF
    #[error("malformed document: {0}")]
    MalformedDocument(String),

    /// Anchor page does not exist in the document
    #[error("page index {page_index} out of range (document has {page_count} pages)")]
    PageIndexOutOfRange {
        /// Requested page
        page_index: usize,
        /// Pages in the document
        page_count: usize,
    },

    /// Cryptographic operation failed
    #[error("signing backend error: {0}")]
    SigningBackendError(String),

    /// Signing did not finish within the configured ceiling
    #[error("signing timed out after {0:?}")]
    SigningTimeout(std::time::Duration),

    /// Signed output could not be written
    #[error("write failure: {0}")]
    WriteFailure(String),

    /// The batch was cancelled before this file finished
    #[error("cancelled")]
    Cancelled,
}

impl SignError {
    /// The kind of this error, without detail.
    pub fn kind(&self) -> SignErrorKind {
        match self {
            SignError::CredentialUnavailable(_) => SignErrorKind::CredentialUnavailable,
            SignError::CredentialExpired(_) => SignErrorKind::CredentialExpired,
            SignError::CredentialInvalidChain(_) => SignErrorKind::CredentialInvalidChain,
            SignError::DestinationUnavailable { .. } => SignErrorKind::DestinationUnavailable,
            SignError::UnreadableFile(_) => SignErrorKind::UnreadableFile,
            SignError::MalformedDocument(_) => SignErrorKind::MalformedDocument,
            SignError::PageIndexOutOfRange { .. } => SignErrorKind::PageIndexOutOfRange,
            SignError::SigningBackendError(_) => SignErrorKind::SigningBackendError,
            SignError::SigningTimeout(_) => SignErrorKind::SigningTimeout,
            SignError::WriteFailure(_) => SignErrorKind::WriteFailure,
            SignError::Cancelled => SignErrorKind::Cancelled,
        }
    }

    /// Whether this error aborts a whole batch rather than a single file.
    pub fn is_batch_fatal(&self) -> bool {
        matches!(
            self.kind(),
            SignErrorKind::CredentialUnavailable
                | SignErrorKind::CredentialExpired
                | SignErrorKind::CredentialInvalidChain
                | SignErrorKind::DestinationUnavailable
        )
    }
}
