//! PDF digital signatures.
//!
//! Creating and verifying detached CMS signatures inside PDF documents.
//!
//! ## Pieces
//!
//! - **Credentials**: [`CredentialProvider`] loads a [`Credential`] (RSA key plus X.509 chain);
//!   [`FileCredentialStore`] is a software token on disk
//! - **Signing**: [`SigningEngine`] appends a signature as an incremental update
//! - **Verification**: [`SignatureVerifier`] checks every signature field of a document
//! - **ByteRange**: [`ByteRangeCalculator`] lays out and patches the signed ranges
//!
//! Only `adbe.pkcs7.detached` signatures are produced. The verifier reads the other sub-filters'
//! names but checks every signature as a detached one.
//!
//! ## Example
//!
//! ```ignore
//! use pdf_batch_signer::document::DocumentLoader;
//! use pdf_batch_signer::signatures::{CredentialProvider, FileCredentialStore, NoPin, SigningEngine};
//!
//! let credential = FileCredentialStore::new().load("keys/alice", &NoPin)?;
//! let document = DocumentLoader::new().load("contract.pdf".as_ref())?;
//! let signed = SigningEngine::default().sign(&document, &credential, None)?;
//! std::fs::write("contract-signed.pdf", &signed.bytes)?;
//! ```
//!
//! ## PDF Specification Reference
//!
//! - ISO 32000-1:2008 Section 12.8 - Digital Signatures
//! - RFC 5652 - Cryptographic Message Syntax

mod byterange;
mod chain;
mod cms;
mod credential;
mod signer;
mod types;
mod verifier;

pub use byterange::ByteRangeCalculator;
pub use chain::{ChainError, ChainTrust, order_chain, validate_chain};
pub use cms::{CmsReport, build_detached, verify_detached};
pub use credential::{
    CERTIFICATE_FILE, Credential, CredentialProvider, EnvPin, FileCredentialStore, NoPin,
    PRIVATE_KEY_FILE, PinSource, read_pem_certificates,
};
pub use signer::{SignedBytes, SigningEngine, pdf_date};
pub use types::{
    DigestAlgorithm, SignOptions, SignatureAppearance, SignatureInfo, SignatureSubFilter,
    VerificationResult, VerificationStatus,
};
pub use verifier::SignatureVerifier;
