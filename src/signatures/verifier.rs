//! PDF signature verification.
//!
//! Walks the AcroForm for signature fields with a value and checks each signature:
//!
//! - the `/ByteRange` is well formed and its gap is exactly the `/Contents` hex string
//! - the CMS message digest matches the bytes the range covers
//! - the RSA signature over the signed attributes verifies with the signer certificate
//! - the embedded chain links up and, when roots are configured, ends at a trusted one
//!
//! A signature whose range stops short of the end of the file is still valid for the revision
//! it signed, but the document changed afterwards; it is reported as
//! [`VerificationStatus::ValidWithWarnings`].

use super::byterange::ByteRangeCalculator;
use super::chain::{self, ChainError, ChainTrust};
use super::cms;
use super::types::{SignatureInfo, SignatureSubFilter, VerificationResult, VerificationStatus};
use crate::document::SourceDocument;
use crate::error::{Error, Result};
use crate::object::{Object, ObjectRef};
use std::collections::HashSet;
use std::path::Path;

/// Deepest field hierarchy walked.
const MAX_FIELD_DEPTH: u32 = 32;

/// Signature verifier for PDF documents.
#[derive(Debug, Clone, Default)]
pub struct SignatureVerifier {
    /// Trusted root certificates, DER
    trusted_roots: Vec<Vec<u8>>,
}

impl SignatureVerifier {
    /// Create a verifier with no trusted roots.
    ///
    /// Without roots, chains are only checked for internal consistency and a self-signed end.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a trusted root certificate (DER).
    pub fn add_trusted_root(&mut self, cert_der: Vec<u8>) {
        self.trusted_roots.push(cert_der);
    }

    /// Add multiple trusted root certificates (DER).
    pub fn add_trusted_roots(&mut self, certs: Vec<Vec<u8>>) {
        self.trusted_roots.extend(certs);
    }

    /// Number of configured roots.
    pub fn trusted_root_count(&self) -> usize {
        self.trusted_roots.len()
    }

    /// Verify every signature in a file.
    pub fn verify_file(&self, path: &Path) -> Result<Vec<VerificationResult>> {
        let data = std::fs::read(path)?;
        self.verify_document(&SourceDocument::from_bytes(path, data)?)
    }

    /// Verify every signature in an in-memory PDF.
    pub fn verify_bytes(&self, data: &[u8]) -> Result<Vec<VerificationResult>> {
        self.verify_document(&SourceDocument::from_bytes("<memory>", data.to_vec())?)
    }

    /// Verify every signature of a parsed document, in field order.
    pub fn verify_document(&self, document: &SourceDocument) -> Result<Vec<VerificationResult>> {
        let fields = signature_fields(document)?;
        log::debug!(
            "{}: {} signature field(s)",
            document.path().display(),
            fields.len()
        );
        fields
            .into_iter()
            .map(|(name, value)| {
                let sig_dict = document.resolve(&value)?;
                let mut info = self.extract_signature_info(&sig_dict)?;
                info.field_name = Some(name);
                Ok(self.verify_signature(document.raw_bytes(), &sig_dict, info))
            })
            .collect()
    }

    /// Read the descriptive entries of a signature dictionary.
    pub fn extract_signature_info(&self, sig_dict: &Object) -> Result<SignatureInfo> {
        let dict = sig_dict.as_dict().ok_or_else(|| Error::InvalidObjectType {
            expected: "Dictionary".to_string(),
            found: sig_dict.type_name().to_string(),
        })?;
        let text = |key: &str| dict.get(key).and_then(Object::as_text);

        Ok(SignatureInfo {
            signer_name: text("Name"),
            signing_time: text("M"),
            reason: text("Reason"),
            location: text("Location"),
            contact_info: text("ContactInfo"),
            sub_filter: dict
                .get("SubFilter")
                .and_then(Object::as_name)
                .and_then(SignatureSubFilter::from_pdf_name),
            byte_range: dict
                .get("ByteRange")
                .and_then(Object::as_array)
                .map(|items| items.iter().filter_map(Object::as_integer).collect())
                .unwrap_or_default(),
            ..Default::default()
        })
    }

    fn verify_signature(&self, data: &[u8], sig_dict: &Object, mut info: SignatureInfo) -> VerificationResult {
        let mut result = VerificationResult::default();

        let Some(byte_range) = sig_dict.get("ByteRange").and_then(ByteRangeCalculator::parse_byte_range) else {
            return invalid(result, info, "signature has no usable /ByteRange");
        };
        match ByteRangeCalculator::validate_byte_range(&byte_range, data.len()) {
            Ok(whole) => info.covers_whole_document = whole,
            Err(e) => return invalid(result, info, &e.to_string()),
        }
        let gap = &data[byte_range[1] as usize..byte_range[2] as usize];
        if gap.first() != Some(&b'<') || gap.last() != Some(&b'>') {
            return invalid(result, info, "/ByteRange gap is not the /Contents hex string");
        }

        let Some(contents) = sig_dict.get("Contents").and_then(Object::as_string) else {
            return invalid(result, info, "signature has no /Contents");
        };
        if !info.sub_filter.is_some_and(|f| f.is_detached()) {
            result.messages.push(format!(
                "sub-filter {:?} is checked as a detached signature",
                info.sub_filter
            ));
        }

        let report = match ByteRangeCalculator::signed_ranges(data, &byte_range)
            .and_then(|ranges| cms::verify_detached(contents, &ranges))
        {
            Ok(report) => report,
            Err(e) => return invalid(result, info, &format!("unreadable CMS: {}", e)),
        };
        result.digest_matches = report.digest_matches;
        result.signature_valid = report.signature_valid;
        result.messages.extend(report.problems.iter().cloned());
        info.digest_algorithm = report.digest_algorithm;

        if let Some(leaf_der) = &report.signer_certificate {
            self.check_certificate(leaf_der, &report, &mut info, &mut result);
        }

        result.status = if !result.digest_matches || !result.signature_valid || !result.chain_valid {
            VerificationStatus::Invalid
        } else if !self.trusted_roots.is_empty() && !result.certificate_trusted {
            VerificationStatus::Unknown
        } else if result.certificate_expired || !info.covers_whole_document {
            VerificationStatus::ValidWithWarnings
        } else {
            VerificationStatus::Valid
        };
        if !info.covers_whole_document {
            result
                .messages
                .push("document was modified after this signature".to_string());
        }
        result.signature_info = info;
        result
    }

    fn check_certificate(
        &self,
        leaf_der: &[u8],
        report: &cms::CmsReport,
        info: &mut SignatureInfo,
        result: &mut VerificationResult,
    ) {
        if let Ok(leaf) = chain::parse_certificate(leaf_der) {
            info.certificate_cn = Some(chain::subject_name(&leaf));
            info.certificate_issuer = Some(leaf.issuer().to_string());
            let validity = leaf.validity();
            info.valid_from = Some(validity.not_before.to_string());
            info.valid_to = Some(validity.not_after.to_string());
            if info.signer_name.is_none() {
                info.signer_name = info.certificate_cn.clone();
            }
            if let Some(at) = report.signing_time {
                let ts = at.timestamp();
                result.certificate_expired =
                    ts < validity.not_before.timestamp() || ts > validity.not_after.timestamp();
                if result.certificate_expired {
                    result
                        .messages
                        .push("signer certificate was not valid at the signing time".to_string());
                }
            }
        }

        let path = chain::order_chain(leaf_der, &report.certificates);
        match chain::validate_chain(&path, &self.trusted_roots) {
            Ok(ChainTrust::Trusted) => {
                result.chain_valid = true;
                result.certificate_trusted = true;
            },
            Ok(ChainTrust::SelfSigned) => result.chain_valid = true,
            Err(ChainError::Untrusted(reason)) => {
                result.chain_valid = true;
                result.messages.push(reason);
            },
            Err(ChainError::Broken(reason)) => result.messages.push(reason),
        }
    }
}

fn invalid(mut result: VerificationResult, info: SignatureInfo, message: &str) -> VerificationResult {
    result.status = VerificationStatus::Invalid;
    result.messages.push(message.to_string());
    result.signature_info = info;
    result
}

/// Signature fields that carry a value, as (fully qualified name, /V).
fn signature_fields(document: &SourceDocument) -> Result<Vec<(String, Object)>> {
    let Some(acroform) = document.catalog().get("AcroForm") else {
        return Ok(Vec::new());
    };
    let acroform = document.resolve(acroform)?;
    let Some(fields) = acroform.get("Fields") else {
        return Ok(Vec::new());
    };
    let fields = document.resolve(fields)?;

    let mut found = Vec::new();
    let mut visited = HashSet::new();
    for field in fields.as_array().map(Vec::as_slice).unwrap_or_default() {
        walk_field(document, field, "", None, &mut visited, &mut found, 0)?;
    }
    Ok(found)
}

fn walk_field(
    document: &SourceDocument,
    field: &Object,
    parent_name: &str,
    inherited_type: Option<&str>,
    visited: &mut HashSet<ObjectRef>,
    found: &mut Vec<(String, Object)>,
    depth: u32,
) -> Result<()> {
    if depth > MAX_FIELD_DEPTH {
        return Err(Error::RecursionLimitExceeded(MAX_FIELD_DEPTH));
    }
    if let Object::Reference(r) = field {
        if !visited.insert(*r) {
            return Ok(());
        }
    }
    let field = document.resolve(field)?;
    let Some(dict) = field.as_dict() else {
        return Ok(());
    };

    let name = match dict.get("T").and_then(Object::as_text) {
        Some(partial) if parent_name.is_empty() => partial,
        Some(partial) => format!("{}.{}", parent_name, partial),
        None => parent_name.to_string(),
    };
    let field_type = dict.get("FT").and_then(Object::as_name).or(inherited_type);

    if field_type == Some("Sig") {
        if let Some(value) = dict.get("V").filter(|v| !v.is_null()) {
            found.push((name.clone(), value.clone()));
        }
    }
    if let Some(kids) = dict.get("Kids") {
        let kids = document.resolve(kids)?;
        for kid in kids.as_array().map(Vec::as_slice).unwrap_or_default() {
            walk_field(document, kid, &name, field_type, visited, found, depth + 1)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn make_sig_dict() -> Object {
        let mut dict = HashMap::new();
        dict.insert("Type".to_string(), Object::name("Sig"));
        dict.insert("Filter".to_string(), Object::name("Adobe.PPKLite"));
        dict.insert("SubFilter".to_string(), Object::name("adbe.pkcs7.detached"));
        dict.insert(
            "ByteRange".to_string(),
            Object::Array(vec![
                Object::Integer(0),
                Object::Integer(100),
                Object::Integer(200),
                Object::Integer(300),
            ]),
        );
        dict.insert("Contents".to_string(), Object::String(vec![0; 16]));
        dict.insert("Name".to_string(), Object::text("Test Signer"));
        dict.insert("Reason".to_string(), Object::text("Testing"));
        dict.insert("M".to_string(), Object::text("D:20250101120000+00'00'"));
        Object::Dictionary(dict)
    }

    #[test]
    fn test_extract_signature_info() {
        let info = SignatureVerifier::new().extract_signature_info(&make_sig_dict()).unwrap();
        assert_eq!(info.signer_name.as_deref(), Some("Test Signer"));
        assert_eq!(info.reason.as_deref(), Some("Testing"));
        assert_eq!(info.sub_filter, Some(SignatureSubFilter::Pkcs7Detached));
        assert_eq!(info.byte_range, vec![0, 100, 200, 300]);
        assert_eq!(info.signing_time.as_deref(), Some("D:20250101120000+00'00'"));
    }

    #[test]
    fn test_bogus_byte_range_is_invalid() {
        let verifier = SignatureVerifier::new();
        let data = vec![b' '; 50];
        let info = verifier.extract_signature_info(&make_sig_dict()).unwrap();
        let result = verifier.verify_signature(&data, &make_sig_dict(), info);
        assert_eq!(result.status, VerificationStatus::Invalid);
        assert!(!result.messages.is_empty());
    }

    #[test]
    fn test_trusted_roots() {
        let mut verifier = SignatureVerifier::new();
        verifier.add_trusted_root(vec![1, 2, 3]);
        verifier.add_trusted_roots(vec![vec![4], vec![5]]);
        assert_eq!(verifier.trusted_root_count(), 3);
    }

    #[test]
    fn test_unsigned_document_has_no_results() {
        let body = "<< /Type /Catalog /Pages 2 0 R >>";
        let mut pdf = b"%PDF-1.4\n".to_vec();
        let o1 = pdf.len();
        pdf.extend_from_slice(format!("1 0 obj\n{}\nendobj\n", body).as_bytes());
        let o2 = pdf.len();
        pdf.extend_from_slice(b"2 0 obj\n<< /Type /Pages /Kids [3 0 R] /Count 1 >>\nendobj\n");
        let o3 = pdf.len();
        pdf.extend_from_slice(b"3 0 obj\n<< /Type /Page /Parent 2 0 R /MediaBox [0 0 200 200] >>\nendobj\n");
        let xref = pdf.len();
        pdf.extend_from_slice(
            format!(
                "xref\n0 4\n0000000000 65535 f \n{:010} 00000 n \n{:010} 00000 n \n{:010} 00000 n \ntrailer\n<< /Size 4 /Root 1 0 R >>\nstartxref\n{}\n%%EOF\n",
                o1, o2, o3, xref
            )
            .as_bytes(),
        );
        assert!(SignatureVerifier::new().verify_bytes(&pdf).unwrap().is_empty());
    }
}
