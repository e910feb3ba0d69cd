// Allow some clippy lints that are too pedantic for this project
#![allow(clippy::too_many_arguments)]
#![allow(clippy::enum_variant_names)]
// Allow unused for tests
#![cfg_attr(test, allow(dead_code))]

//! # PDF Batch Signer
//!
//! Deterministic, verifiable digital signing of PDF batches.
//!
//! ## Core Features
//!
//! ### Signing
//! - **Incremental Updates**: Signatures are appended after the original `%%EOF`; the original
//!   bytes are never rewritten, so earlier signatures stay valid
//! - **Detached CMS**: `adbe.pkcs7.detached` signatures with RSA PKCS#1 v1.5 over SHA-256/384/512,
//!   embedding the full certificate chain
//! - **Visible or Invisible**: A normalized anchor places the appearance box on every document of a
//!   batch, whatever its page sizes
//! - **Cross-Reference Tables and Streams**: The update matches the document's latest section
//!
//! ### Batches
//! - **Bounded Concurrency**: Files run in parallel on tokio, signing on the blocking pool
//! - **Partial Failure**: A bad file fails alone; only the destination and the credential can
//!   stop a batch, and both are checked first
//! - **Progress and Cancellation**: Completion-ordered progress events, a per-file signing
//!   timeout and batch-wide cancellation
//!
//! ### Verification
//! - **Byte Range, Digest, Signature, Chain**: Every signature field of a document is checked
//!   against configurable trusted roots
//!
//! ## Architecture
//!
//! ```text
//! BatchCoordinator
//!     ├─ CredentialProvider ──→ Credential (once per batch)
//!     └─ per file:
//!          DocumentLoader ──→ PlacementResolver ──→ SigningEngine ──→ output file
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use pdf_batch_signer::batch::{BatchCoordinator, BatchRequest};
//! use pdf_batch_signer::placement::SignatureAnchor;
//! use pdf_batch_signer::signatures::{FileCredentialStore, NoPin};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let coordinator = BatchCoordinator::new(Arc::new(FileCredentialStore::new()));
//! let request = BatchRequest::new(
//!     vec!["a.pdf".into(), "b.pdf".into()],
//!     SignatureAnchor::new(0.5, 0.1, 0)?,
//!     "signed/",
//!     "keys/alice",
//! );
//! let report = coordinator.run(request, &NoPin, None, None).await?;
//! println!("{}", report.summary());
//! # Ok(())
//! # }
//! ```
//!
//! ## License
//!
//! Licensed under either of:
//!
//! * Apache License, Version 2.0 ([LICENSE-APACHE](LICENSE-APACHE) or <http://www.apache.org/licenses/LICENSE-2.0>)
//! * MIT license ([LICENSE-MIT](LICENSE-MIT) or <http://opensource.org/licenses/MIT>)
//!
//! at your option.

#![warn(missing_docs)]

// Error handling
pub mod error;

// Core PDF parsing
pub mod document;
pub mod lexer;
pub mod object;
pub mod objstm;
pub mod parser;
pub mod xref;

// Stream decoders
pub mod decoders;

// Page geometry and signature placement
pub mod geometry;
pub mod placement;

// Incremental update writing
pub mod writer;

// Digital signatures
pub mod signatures;

// Batch signing
pub mod batch;

// Configuration
pub mod config;

// Re-exports
pub use batch::{BatchCoordinator, BatchProgress, BatchReport, BatchRequest, CancelHandle, Outcome, SigningResult};
pub use config::SignerConfig;
pub use document::{DocumentLoader, SourceDocument};
pub use error::{Error, Result, SignError, SignErrorKind};
pub use placement::{PlacementRect, PlacementResolver, SignatureAnchor};

// Version info
/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        // VERSION is populated from CARGO_PKG_VERSION at compile time
        assert!(VERSION.starts_with("0."));
    }

    #[test]
    fn test_name() {
        assert_eq!(NAME, "pdf_batch_signer");
    }
}
