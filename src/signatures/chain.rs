//! X.509 certificate chain validation.
//!
//! Used both when loading a credential and when verifying an embedded signature. A chain is a
//! list of DER certificates, leaf first. Each certificate must be issued and signed by the next
//! one; the last one must be a trusted root, or be issued and signed by one. Every certificate
//! that issues another must be a CA (basicConstraints `CA:TRUE`) and, when it carries a key usage
//! extension, allow certificate signing.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::FromDer;

/// How a structurally valid chain is anchored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainTrust {
    /// Ends at (or is issued by) a configured trusted root
    Trusted,
    /// No trusted roots were configured and the chain ends in a self-signed certificate
    SelfSigned,
}

/// Outcome of checking a chain's links and anchor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    /// A link or the anchor did not verify; the chain is broken or forged
    Broken(String),
    /// The links verify but nothing trusted anchors the chain
    Untrusted(String),
}

impl std::fmt::Display for ChainError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChainError::Broken(reason) | ChainError::Untrusted(reason) => f.write_str(reason),
        }
    }
}

/// Parse one DER certificate.
pub fn parse_certificate(der: &[u8]) -> Result<X509Certificate<'_>> {
    X509Certificate::from_der(der)
        .map(|(_, cert)| cert)
        .map_err(|e| Error::Certificate(format!("malformed certificate: {}", e)))
}

/// Common name of a certificate's subject, or the whole subject when it has none.
pub fn subject_name(cert: &X509Certificate<'_>) -> String {
    cert.subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| cert.subject().to_string())
}

/// Intersection of every certificate's validity window.
pub fn validity_window(chain: &[Vec<u8>]) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
    let mut not_before = i64::MIN;
    let mut not_after = i64::MAX;
    for der in chain {
        let cert = parse_certificate(der)?;
        not_before = not_before.max(cert.validity().not_before.timestamp());
        not_after = not_after.min(cert.validity().not_after.timestamp());
    }
    let to_utc = |ts: i64| {
        DateTime::<Utc>::from_timestamp(ts, 0)
            .ok_or_else(|| Error::Certificate(format!("validity timestamp {} out of range", ts)))
    };
    Ok((to_utc(not_before)?, to_utc(not_after)?))
}

/// Validate `chain` against `trusted_roots` (both DER).
///
/// With no trusted roots, a chain whose last certificate is self-signed is accepted as
/// [`ChainTrust::SelfSigned`].
pub fn validate_chain(
    chain: &[Vec<u8>],
    trusted_roots: &[Vec<u8>],
) -> std::result::Result<ChainTrust, ChainError> {
    let parsed = chain
        .iter()
        .map(|der| parse_certificate(der))
        .collect::<Result<Vec<_>>>()
        .map_err(|e| ChainError::Broken(e.to_string()))?;
    let Some(last) = parsed.last() else {
        return Err(ChainError::Broken("certificate chain is empty".to_string()));
    };

    for pair in parsed.windows(2) {
        let (child, issuer) = (&pair[0], &pair[1]);
        if child.issuer() != issuer.subject() {
            return Err(ChainError::Broken(format!(
                "'{}' is not issued by the next certificate '{}'",
                subject_name(child),
                subject_name(issuer)
            )));
        }
        if child.verify_signature(Some(issuer.public_key())).is_err() {
            return Err(ChainError::Broken(format!(
                "signature on '{}' does not verify with the key of '{}'",
                subject_name(child),
                subject_name(issuer)
            )));
        }
        ensure_can_issue(issuer).map_err(ChainError::Broken)?;
    }

    let self_signed = last.issuer() == last.subject() && last.verify_signature(None).is_ok();

    if trusted_roots.is_empty() {
        return if self_signed {
            Ok(ChainTrust::SelfSigned)
        } else {
            Err(ChainError::Untrusted(format!(
                "chain ends at '{}' whose issuer is not included and no trusted roots are configured",
                subject_name(last)
            )))
        };
    }

    let last_der = chain.last().map(Vec::as_slice).unwrap_or_default();
    for root_der in trusted_roots {
        if root_der.as_slice() == last_der {
            return Ok(ChainTrust::Trusted);
        }
        let Ok(root) = parse_certificate(root_der) else {
            continue;
        };
        if last.issuer() == root.subject() && last.verify_signature(Some(root.public_key())).is_ok() {
            ensure_can_issue(&root).map_err(ChainError::Broken)?;
            return Ok(ChainTrust::Trusted);
        }
    }

    Err(ChainError::Untrusted(format!(
        "'{}' is not a trusted root and is not issued by one",
        subject_name(last)
    )))
}

/// Refuse `issuer` as the signer of another certificate unless it is a CA allowed to sign
/// certificates.
fn ensure_can_issue(issuer: &X509Certificate<'_>) -> std::result::Result<(), String> {
    let is_ca = matches!(issuer.basic_constraints(), Ok(Some(bc)) if bc.value.ca);
    if !is_ca {
        return Err(format!(
            "'{}' is not a CA certificate and cannot issue certificates",
            subject_name(issuer)
        ));
    }
    match issuer.key_usage() {
        Ok(None) => Ok(()),
        Ok(Some(usage)) if usage.value.key_cert_sign() => Ok(()),
        Ok(Some(_)) => Err(format!(
            "key usage of '{}' does not allow certificate signing",
            subject_name(issuer)
        )),
        Err(e) => Err(format!("key usage of '{}' is malformed: {}", subject_name(issuer), e)),
    }
}

/// Order a set of certificates into a chain starting at `leaf`.
///
/// CMS stores certificates as a SET, so the original order is lost.
pub fn order_chain(leaf: &[u8], pool: &[Vec<u8>]) -> Vec<Vec<u8>> {
    let mut chain = vec![leaf.to_vec()];
    let parsed: Vec<_> = pool
        .iter()
        .filter_map(|der| parse_certificate(der).ok().map(|c| (der, c)))
        .collect();

    while chain.len() <= pool.len() {
        let Some(current) = chain.last().and_then(|der| parse_certificate(der).ok()) else {
            break;
        };
        if current.issuer() == current.subject() {
            break;
        }
        let next = parsed
            .iter()
            .find(|(der, cert)| cert.subject() == current.issuer() && !chain.contains(der));
        match next {
            Some((der, _)) => chain.push((*der).clone()),
            None => break,
        }
    }
    chain
}

#[cfg(test)]
mod tests {
    use super::*;
    use x509_parser::pem::Pem;

    fn fixture(path: &str) -> Vec<Vec<u8>> {
        let data = std::fs::read(format!("{}/tests/fixtures/{}", env!("CARGO_MANIFEST_DIR"), path)).unwrap();
        Pem::iter_from_buffer(&data)
            .map(|pem| pem.unwrap().contents)
            .collect()
    }

    #[test]
    fn test_valid_chain_to_configured_root() {
        let chain = fixture("credentials/valid/certificate.pem");
        let roots = fixture("roots/test_root.pem");
        assert_eq!(validate_chain(&chain, &roots), Ok(ChainTrust::Trusted));
        // The leaf alone is issued by the root too
        assert_eq!(validate_chain(&chain[..1], &roots), Ok(ChainTrust::Trusted));
    }

    #[test]
    fn test_self_signed_without_roots() {
        let chain = fixture("credentials/valid/certificate.pem");
        assert_eq!(validate_chain(&chain, &[]), Ok(ChainTrust::SelfSigned));
        assert!(matches!(validate_chain(&chain[..1], &[]), Err(ChainError::Untrusted(_))));
    }

    #[test]
    fn test_foreign_root_is_untrusted() {
        let chain = fixture("credentials/untrusted/certificate.pem");
        let roots = fixture("roots/test_root.pem");
        assert!(matches!(validate_chain(&chain, &roots), Err(ChainError::Untrusted(_))));
    }

    #[test]
    fn test_broken_link() {
        let mut chain = fixture("credentials/valid/certificate.pem");
        let rogue = fixture("credentials/untrusted/certificate.pem");
        chain[1] = rogue[1].clone();
        assert!(matches!(validate_chain(&chain, &[]), Err(ChainError::Broken(_))));
    }

    #[test]
    fn test_end_entity_cannot_issue() {
        // Eve's certificate is signed with Alice's key; Alice is CA:FALSE
        let chain = fixture("credentials/forged/certificate.pem");
        let roots = fixture("roots/test_root.pem");
        assert_eq!(chain.len(), 3);
        let err = validate_chain(&chain, &roots).unwrap_err();
        assert!(matches!(&err, ChainError::Broken(reason) if reason.contains("Alice Signer")), "{:?}", err);
        assert!(matches!(validate_chain(&chain, &[]), Err(ChainError::Broken(_))));
        // Without Alice in the chain the link to the root is simply missing
        assert!(validate_chain(&chain[..1], &roots).is_err());
    }

    #[test]
    fn test_order_chain_and_window() {
        let chain = fixture("credentials/valid/certificate.pem");
        let shuffled = vec![chain[1].clone(), chain[0].clone()];
        assert_eq!(order_chain(&chain[0], &shuffled), chain);

        let leaf = parse_certificate(&chain[0]).unwrap();
        assert_eq!(subject_name(&leaf), "Alice Signer");
        let (not_before, not_after) = validity_window(&chain).unwrap();
        assert!(not_before < Utc::now() && Utc::now() < not_after);
    }
}
