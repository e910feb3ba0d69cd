//! PDF signing engine.
//!
//! Signs a [`SourceDocument`] with an incremental update. The update adds a signature
//! dictionary, a merged signature field and widget, optionally a visible appearance, and the
//! page and AcroForm changes needed to reach the new field. The original bytes are copied
//! through untouched, so every earlier revision and signature stays intact.
//!
//! ## Flow
//!
//! 1. Write the update with a `/ByteRange` placeholder and a zero-filled `/Contents`.
//! 2. Locate both placeholders in the laid-out bytes and patch the real byte range in place.
//! 3. Digest the two ranges, build a detached CMS and hex-encode it into `/Contents`.
//!
//! Nothing moves after layout, so the byte range computed in step 2 stays exact.
//!
//! PDF Spec: ISO 32000-1:2008, Section 12.8 (Digital Signatures)

use super::byterange::ByteRangeCalculator;
use super::cms;
use super::credential::Credential;
use super::types::{DigestAlgorithm, SignOptions, SignatureSubFilter};
use crate::document::{PageNode, SourceDocument};
use crate::error::{Error, SignError};
use crate::geometry::Rect;
use crate::object::{Dict, Object, ObjectRef};
use crate::placement::PlacementRect;
use crate::writer::{AppearanceStreamBuilder, IncrementalUpdate};
use chrono::{DateTime, Utc};
use std::collections::HashSet;

/// Smallest `/Contents` reservation, in DER bytes.
const MIN_CONTENTS_CAPACITY: usize = 8192;

/// Room for the CMS structure, algorithm identifiers and signed attributes.
const CMS_OVERHEAD: usize = 2048;

/// Annotation flags for the widget: Print (4) and Locked (128).
const WIDGET_FLAGS: i64 = 132;

/// AcroForm `/SigFlags`: SignaturesExist (1) and AppendOnly (2).
const SIG_FLAGS: i64 = 3;

/// A signed document and what identifies the signature.
#[derive(Debug, Clone)]
pub struct SignedBytes {
    /// The complete signed file
    pub bytes: Vec<u8>,
    /// Lowercase hex SHA-256 of the two signed byte ranges
    pub signature_digest: String,
    /// The `/ByteRange` written into the signature dictionary
    pub byte_range: [i64; 4],
    /// Name of the new signature field
    pub field_name: String,
    /// Time recorded in `/M` and the CMS signing-time attribute
    pub signing_time: DateTime<Utc>,
}

/// Produces signed bytes for one document at a time.
///
/// The engine holds no per-document state, so one instance can serve every worker of a batch.
#[derive(Debug, Clone, Default)]
pub struct SigningEngine {
    options: SignOptions,
}

impl SigningEngine {
    /// Engine with the given signature options.
    pub fn new(options: SignOptions) -> Self {
        Self { options }
    }

    /// Options used for every signature.
    pub fn options(&self) -> &SignOptions {
        &self.options
    }

    /// Sign `document` now.
    ///
    /// With a `placement` the signature is visible on that page; without one it is an invisible
    /// signature with an empty rectangle on the first page.
    ///
    /// # Errors
    ///
    /// [`SignError::SigningBackendError`] when the credential is outside its validity window or
    /// the key fails, [`SignError::PageIndexOutOfRange`] for a placement on a missing page, and
    /// [`SignError::MalformedDocument`] when the form or page structure cannot be updated.
    pub fn sign(
        &self,
        document: &SourceDocument,
        credential: &Credential,
        placement: Option<&PlacementRect>,
    ) -> Result<SignedBytes, SignError> {
        self.sign_at(document, credential, placement, Utc::now())
    }

    /// Sign with an explicit signing time.
    pub fn sign_at(
        &self,
        document: &SourceDocument,
        credential: &Credential,
        placement: Option<&PlacementRect>,
        now: DateTime<Utc>,
    ) -> Result<SignedBytes, SignError> {
        if !credential.is_valid_at(now) {
            return Err(SignError::SigningBackendError(format!(
                "credential '{}' is not valid at {}",
                credential.signer_name(),
                now.format("%Y-%m-%d %H:%M:%S UTC")
            )));
        }

        let page_index = placement.map_or(0, |p| p.page_index);
        let page = document
            .pages()
            .get(page_index)
            .ok_or(SignError::PageIndexOutOfRange {
                page_index,
                page_count: document.page_count(),
            })?;
        let rect = placement.map_or(Rect::new(0.0, 0.0, 0.0, 0.0), |p| p.rect);

        let fields = form_fields(document).map_err(malformed)?;
        let field_name = unique_field_name(document, &fields.fields);
        let calculator = ByteRangeCalculator::new(self.contents_capacity(credential));

        let mut update = IncrementalUpdate::new(document);
        let sig_ref = update.allocate();
        let field_ref = update.allocate();

        update.put(
            sig_ref,
            Object::Dictionary(self.signature_dictionary(credential, &calculator, now)),
        );

        let mut widget = Dict::new();
        widget.insert("Type".to_string(), Object::name("Annot"));
        widget.insert("Subtype".to_string(), Object::name("Widget"));
        widget.insert("FT".to_string(), Object::name("Sig"));
        widget.insert("T".to_string(), Object::text(&field_name));
        widget.insert("V".to_string(), sig_ref.into());
        widget.insert("P".to_string(), page.reference.into());
        widget.insert("Rect".to_string(), rect.to_pdf_array());
        widget.insert("F".to_string(), Object::Integer(WIDGET_FLAGS));
        if let Some(placement) = placement {
            let ap_ref = update.allocate();
            update.put(ap_ref, self.appearance(credential, placement, now));
            let mut ap = Dict::new();
            ap.insert("N".to_string(), ap_ref.into());
            widget.insert("AP".to_string(), Object::Dictionary(ap));
        }
        update.put(field_ref, Object::Dictionary(widget));

        attach_to_page(document, &mut update, page, field_ref).map_err(malformed)?;
        attach_to_form(document, &mut update, fields, field_ref).map_err(malformed)?;

        let layout = update.write().map_err(backend)?;
        let sig_offset = layout
            .offset_of(sig_ref)
            .ok_or_else(|| SignError::SigningBackendError("signature object was not written".to_string()))?;
        let mut bytes = layout.bytes;

        let byte_range_offset = ByteRangeCalculator::find_byte_range_placeholder(&bytes, sig_offset)
            .ok_or_else(|| SignError::SigningBackendError("ByteRange placeholder not found".to_string()))?;
        let contents_offset = ByteRangeCalculator::find_contents_offset(&bytes, byte_range_offset)
            .ok_or_else(|| SignError::SigningBackendError("Contents placeholder not found".to_string()))?;

        let byte_range = calculator.calculate_byte_range(bytes.len(), contents_offset);
        ByteRangeCalculator::patch_byte_range(&mut bytes, byte_range_offset, &byte_range)
            .map_err(backend)?;

        let (digest, signature_digest) = {
            let ranges = ByteRangeCalculator::signed_ranges(&bytes, &byte_range).map_err(backend)?;
            (
                self.options.digest_algorithm.digest(&ranges),
                hex::encode(DigestAlgorithm::Sha256.digest(&ranges)),
            )
        };

        let signature = cms::build_detached(credential, self.options.digest_algorithm, &digest, now)
            .map_err(backend)?;
        calculator
            .insert_signature(&mut bytes, contents_offset, &signature)
            .map_err(backend)?;

        log::debug!(
            "signed {} as field '{}': {} byte CMS in a {} byte slot, ByteRange {:?}",
            document.path().display(),
            field_name,
            signature.len(),
            calculator.capacity(),
            byte_range
        );

        Ok(SignedBytes {
            bytes,
            signature_digest,
            byte_range,
            field_name,
            signing_time: now,
        })
    }

    /// DER bytes reserved for the CMS blob.
    ///
    /// The blob embeds the whole chain plus one signature the size of the modulus.
    pub fn contents_capacity(&self, credential: &Credential) -> usize {
        self.options.contents_size.unwrap_or_else(|| {
            let chain: usize = credential.chain_der().iter().map(Vec::len).sum();
            (chain + credential.key_size() + CMS_OVERHEAD).max(MIN_CONTENTS_CAPACITY)
        })
    }

    fn signature_dictionary(
        &self,
        credential: &Credential,
        calculator: &ByteRangeCalculator,
        now: DateTime<Utc>,
    ) -> Dict {
        let mut sig = Dict::new();
        sig.insert("Type".to_string(), Object::name("Sig"));
        sig.insert("Filter".to_string(), Object::name("Adobe.PPKLite"));
        sig.insert(
            "SubFilter".to_string(),
            Object::name(SignatureSubFilter::Pkcs7Detached.as_pdf_name()),
        );
        sig.insert("ByteRange".to_string(), ByteRangeCalculator::byte_range_placeholder());
        sig.insert("Contents".to_string(), calculator.contents_placeholder());
        sig.insert("M".to_string(), Object::String(pdf_date(now).into_bytes()));
        sig.insert("Name".to_string(), Object::text(self.signer_name(credential)));

        let optional = [
            ("Reason", &self.options.reason),
            ("Location", &self.options.location),
            ("ContactInfo", &self.options.contact_info),
        ];
        for (key, value) in optional {
            if let Some(value) = value {
                sig.insert(key.to_string(), Object::text(value));
            }
        }
        sig
    }

    fn appearance(&self, credential: &Credential, placement: &PlacementRect, now: DateTime<Utc>) -> Object {
        let look = &self.options.appearance;
        let (width, height) = placement.display_size();
        let mut builder = AppearanceStreamBuilder::new(width, height)
            .with_rotation(placement.rotation)
            .with_max_font_size(look.font_size)
            .with_border_width(look.border_width);
        if look.show_name {
            builder = builder.line(format!("Digitally signed by {}", self.signer_name(credential)));
        }
        if look.show_date {
            builder = builder.line(format!("Date: {}", now.format("%Y-%m-%d %H:%M:%S UTC")));
        }
        if look.show_reason {
            if let Some(reason) = &self.options.reason {
                builder = builder.line(format!("Reason: {}", reason));
            }
        }
        if look.show_location {
            if let Some(location) = &self.options.location {
                builder = builder.line(format!("Location: {}", location));
            }
        }
        builder.into_stream()
    }

    fn signer_name<'a>(&'a self, credential: &'a Credential) -> &'a str {
        self.options.name.as_deref().unwrap_or(credential.signer_name())
    }
}

/// PDF date string, ISO 32000-1 Section 7.9.4.
pub fn pdf_date(at: DateTime<Utc>) -> String {
    format!("D:{}+00'00'", at.format("%Y%m%d%H%M%S"))
}

fn malformed(err: Error) -> SignError {
    SignError::MalformedDocument(err.to_string())
}

fn backend(err: Error) -> SignError {
    SignError::SigningBackendError(err.to_string())
}

/// Where the AcroForm and its `/Fields` array live.
#[derive(Debug)]
enum FormLocation {
    /// No AcroForm yet
    Missing,
    /// Direct dictionary inside the catalog
    InCatalog(Dict),
    /// Indirect dictionary
    Indirect(ObjectRef, Dict),
}

#[derive(Debug)]
struct FormFields {
    location: FormLocation,
    /// Set when `/Fields` is an indirect array
    fields_ref: Option<ObjectRef>,
    fields: Vec<Object>,
}

fn form_fields(document: &SourceDocument) -> crate::error::Result<FormFields> {
    let location = match document.catalog().get("AcroForm") {
        None | Some(Object::Null) => FormLocation::Missing,
        Some(Object::Reference(r)) => match document.load_object(*r)? {
            Object::Dictionary(d) => FormLocation::Indirect(*r, d),
            other => {
                return Err(Error::InvalidObjectType {
                    expected: "Dictionary".to_string(),
                    found: other.type_name().to_string(),
                })
            },
        },
        Some(Object::Dictionary(d)) => FormLocation::InCatalog(d.clone()),
        Some(other) => {
            return Err(Error::InvalidObjectType {
                expected: "Dictionary".to_string(),
                found: other.type_name().to_string(),
            })
        },
    };

    let raw_fields = match &location {
        FormLocation::Missing => None,
        FormLocation::InCatalog(d) | FormLocation::Indirect(_, d) => d.get("Fields").cloned(),
    };
    let (fields_ref, fields) = match raw_fields {
        None | Some(Object::Null) => (None, Vec::new()),
        Some(Object::Array(items)) => (None, items),
        Some(Object::Reference(r)) => match document.load_object(r)? {
            Object::Array(items) => (Some(r), items),
            other => {
                return Err(Error::InvalidObjectType {
                    expected: "Array".to_string(),
                    found: other.type_name().to_string(),
                })
            },
        },
        Some(other) => {
            return Err(Error::InvalidObjectType {
                expected: "Array".to_string(),
                found: other.type_name().to_string(),
            })
        },
    };

    Ok(FormFields {
        location,
        fields_ref,
        fields,
    })
}

/// First `SignatureN` not already used by a top-level field.
fn unique_field_name(document: &SourceDocument, fields: &[Object]) -> String {
    let taken: HashSet<String> = fields
        .iter()
        .filter_map(|field| document.resolve(field).ok())
        .filter_map(|field| field.get("T").and_then(Object::as_text))
        .collect();
    (1..)
        .map(|n| format!("Signature{}", n))
        .find(|name| !taken.contains(name))
        .unwrap_or_else(|| "Signature".to_string())
}

fn attach_to_page(
    document: &SourceDocument,
    update: &mut IncrementalUpdate<'_>,
    page: &PageNode,
    field_ref: ObjectRef,
) -> crate::error::Result<()> {
    match page.dict.get("Annots") {
        Some(Object::Reference(annots_ref)) => {
            let Object::Array(mut annots) = document.load_object(*annots_ref)? else {
                return Err(Error::InvalidPdf(format!("/Annots of page {} is not an array", page.reference)));
            };
            annots.push(field_ref.into());
            update.put(*annots_ref, Object::Array(annots));
        },
        existing => {
            let mut annots = match existing {
                Some(Object::Array(items)) => items.clone(),
                None | Some(Object::Null) => Vec::new(),
                Some(other) => {
                    return Err(Error::InvalidObjectType {
                        expected: "Array".to_string(),
                        found: other.type_name().to_string(),
                    })
                },
            };
            annots.push(field_ref.into());
            let mut dict = page.dict.clone();
            dict.insert("Annots".to_string(), Object::Array(annots));
            update.put(page.reference, Object::Dictionary(dict));
        },
    }
    Ok(())
}

fn attach_to_form(
    document: &SourceDocument,
    update: &mut IncrementalUpdate<'_>,
    form: FormFields,
    field_ref: ObjectRef,
) -> crate::error::Result<()> {
    let FormFields {
        location,
        fields_ref,
        mut fields,
    } = form;
    fields.push(field_ref.into());

    let mut acroform = match &location {
        FormLocation::Missing => Dict::new(),
        FormLocation::InCatalog(d) | FormLocation::Indirect(_, d) => d.clone(),
    };
    match fields_ref {
        Some(r) => update.put(r, Object::Array(fields)),
        None => {
            acroform.insert("Fields".to_string(), Object::Array(fields));
        },
    }
    let flags = acroform.get("SigFlags").and_then(Object::as_integer).unwrap_or(0);
    acroform.insert("SigFlags".to_string(), Object::Integer(flags | SIG_FLAGS));

    match location {
        FormLocation::Indirect(r, _) => update.put(r, Object::Dictionary(acroform)),
        FormLocation::Missing | FormLocation::InCatalog(_) => {
            let mut catalog = document.catalog().clone();
            catalog.insert("AcroForm".to_string(), Object::Dictionary(acroform));
            update.put(document.catalog_ref(), Object::Dictionary(catalog));
        },
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signatures::credential::{CredentialProvider, FileCredentialStore, NoPin};
    use chrono::TimeZone;

    fn credential() -> Credential {
        let dir = format!("{}/tests/fixtures/credentials/valid", env!("CARGO_MANIFEST_DIR"));
        FileCredentialStore::new().load(&dir, &NoPin).unwrap()
    }

    /// One-page document with a classic xref table; `extra` goes into the catalog.
    fn minimal_pdf(extra: &str) -> Vec<u8> {
        let objects = [
            format!("<< /Type /Catalog /Pages 2 0 R {} >>", extra),
            "<< /Type /Pages /Kids [3 0 R] /Count 1 >>".to_string(),
            "<< /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] >>".to_string(),
        ];
        let mut out = b"%PDF-1.7\n".to_vec();
        let mut offsets = Vec::new();
        for (i, body) in objects.iter().enumerate() {
            offsets.push(out.len());
            out.extend_from_slice(format!("{} 0 obj\n{}\nendobj\n", i + 1, body).as_bytes());
        }
        let xref = out.len();
        out.extend_from_slice(format!("xref\n0 {}\n0000000000 65535 f \n", objects.len() + 1).as_bytes());
        for offset in offsets {
            out.extend_from_slice(format!("{:010} 00000 n \n", offset).as_bytes());
        }
        out.extend_from_slice(
            format!("trailer\n<< /Size {} /Root 1 0 R >>\nstartxref\n{}\n%%EOF\n", objects.len() + 1, xref)
                .as_bytes(),
        );
        out
    }

    fn document(bytes: Vec<u8>) -> SourceDocument {
        SourceDocument::from_bytes("test.pdf", bytes).unwrap()
    }

    #[test]
    fn test_pdf_date() {
        let at = Utc.with_ymd_and_hms(2025, 3, 4, 5, 6, 7).unwrap();
        assert_eq!(pdf_date(at), "D:20250304050607+00'00'");
    }

    #[test]
    fn test_sign_invisible_appends_only() {
        let original = minimal_pdf("");
        let doc = document(original.clone());
        let signed = SigningEngine::default().sign(&doc, &credential(), None).unwrap();

        assert!(signed.bytes.starts_with(&original));
        assert_eq!(signed.field_name, "Signature1");
        assert_eq!(signed.signature_digest.len(), 64);
        assert_eq!(signed.byte_range[0], 0);
        assert_eq!(
            (signed.byte_range[2] + signed.byte_range[3]) as usize,
            signed.bytes.len()
        );

        let reloaded = document(signed.bytes);
        assert!(reloaded.catalog().get("AcroForm").is_some());
        assert_eq!(reloaded.pages()[0].dict.get("Annots").and_then(Object::as_array).map(Vec::len), Some(1));
    }

    #[test]
    fn test_second_signature_gets_a_new_name() {
        let engine = SigningEngine::default();
        let credential = credential();
        let first = engine.sign(&document(minimal_pdf("")), &credential, None).unwrap();
        let second = engine.sign(&document(first.bytes.clone()), &credential, None).unwrap();
        assert_eq!(second.field_name, "Signature2");
        assert!(second.bytes.starts_with(&first.bytes));
    }

    #[test]
    fn test_expired_at_signing_time() {
        let credential = credential();
        let later = credential.not_after() + chrono::Duration::days(1);
        let err = SigningEngine::default()
            .sign_at(&document(minimal_pdf("")), &credential, None, later)
            .unwrap_err();
        assert!(matches!(err, SignError::SigningBackendError(_)));
    }

    #[test]
    fn test_contents_capacity() {
        let credential = credential();
        assert!(SigningEngine::default().contents_capacity(&credential) >= MIN_CONTENTS_CAPACITY);
        let fixed = SigningEngine::new(SignOptions::default().with_contents_size(20_000));
        assert_eq!(fixed.contents_capacity(&credential), 20_000);
    }

    #[test]
    fn test_too_small_contents_fails() {
        let engine = SigningEngine::new(SignOptions::default().with_contents_size(16));
        let err = engine.sign(&document(minimal_pdf("")), &credential(), None).unwrap_err();
        assert!(matches!(err, SignError::SigningBackendError(_)));
    }

    #[test]
    fn test_existing_direct_acroform_keeps_fields() {
        let doc = document(minimal_pdf("/AcroForm << /Fields [] /DA (/Helv 0 Tf 0 g) >>"));
        let signed = SigningEngine::default().sign(&doc, &credential(), None).unwrap();
        let reloaded = document(signed.bytes);
        let form = reloaded.catalog().get("AcroForm").and_then(Object::as_dict).unwrap();
        assert_eq!(form.get("SigFlags").and_then(Object::as_integer), Some(3));
        assert!(form.get("DA").is_some());
        assert_eq!(form.get("Fields").and_then(Object::as_array).map(Vec::len), Some(1));
    }

    #[test]
    fn test_sig_dictionary_contents() {
        let engine = SigningEngine::new(
            SignOptions::default()
                .with_reason("Approved")
                .with_location("Lisbon"),
        );
        let signed = engine.sign(&document(minimal_pdf("")), &credential(), None).unwrap();
        let text = String::from_utf8_lossy(&signed.bytes);
        assert!(text.contains("/Filter /Adobe.PPKLite"));
        assert!(text.contains("/SubFilter /adbe.pkcs7.detached"));
        assert!(text.contains("/Reason (Approved)"));
        assert!(text.contains("/Location (Lisbon)"));
        assert!(text.contains("/Name (Alice Signer)"));
        assert!(!text.contains("9999999999"));
    }
}
