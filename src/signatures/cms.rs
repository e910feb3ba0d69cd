//! CMS (PKCS#7) SignedData for detached PDF signatures.
//!
//! Signing produces a SignedData with no encapsulated content. The signed attributes carry the
//! content type, the digest of the byte ranges and the signing time; the RSA PKCS#1 v1.5
//! signature is computed over their DER encoding. Every certificate of the credential's chain is
//! embedded so a verifier can rebuild the path.
//!
//! RFC 5652, RFC 5911

use super::credential::Credential;
use super::types::DigestAlgorithm;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use cms::builder::{SignedDataBuilder, SignerInfoBuilder};
use cms::cert::{CertificateChoices, IssuerAndSerialNumber};
use cms::content_info::ContentInfo;
use cms::signed_data::{EncapsulatedContentInfo, SignedData, SignerIdentifier};
use const_oid::AssociatedOid;
use const_oid::db::rfc5911::{ID_DATA, ID_MESSAGE_DIGEST, ID_SIGNED_DATA, ID_SIGNING_TIME};
use der::asn1::{Any, GeneralizedTime, SetOfVec, UtcTime};
use der::{Decode, Encode, Tagged};
use rsa::RsaPublicKey;
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::DecodePublicKey;
use sha2::{Digest, Sha256, Sha384, Sha512};
use signature::{Keypair, Signer, Verifier};
use spki::{AlgorithmIdentifierOwned, DynSignatureAlgorithmIdentifier, EncodePublicKey};
use std::time::Duration;
use x509_cert::attr::Attribute;
use x509_cert::time::Time;

/// Build a detached SignedData over a precomputed `digest` of the signed bytes.
pub fn build_detached(
    credential: &Credential,
    algorithm: DigestAlgorithm,
    digest: &[u8],
    signing_time: DateTime<Utc>,
) -> Result<Vec<u8>> {
    match algorithm {
        DigestAlgorithm::Sha256 => build_with::<Sha256>(credential, digest, signing_time),
        DigestAlgorithm::Sha384 => build_with::<Sha384>(credential, digest, signing_time),
        DigestAlgorithm::Sha512 => build_with::<Sha512>(credential, digest, signing_time),
    }
}

fn build_with<D>(credential: &Credential, digest: &[u8], signing_time: DateTime<Utc>) -> Result<Vec<u8>>
where
    D: Digest + AssociatedOid,
    SigningKey<D>: Keypair + DynSignatureAlgorithmIdentifier + Signer<Signature>,
    <SigningKey<D> as Keypair>::VerifyingKey: EncodePublicKey,
{
    let leaf = credential.leaf();
    let sid = SignerIdentifier::IssuerAndSerialNumber(IssuerAndSerialNumber {
        issuer: leaf.tbs_certificate.issuer.clone(),
        serial_number: leaf.tbs_certificate.serial_number.clone(),
    });
    let digest_algorithm = AlgorithmIdentifierOwned {
        oid: D::OID,
        parameters: None,
    };
    let content = EncapsulatedContentInfo {
        econtent_type: ID_DATA,
        econtent: None,
    };
    let time_attribute = signing_time_attribute(signing_time)?;

    let content_info = credential.with_key(|key| -> Result<ContentInfo> {
        let signer = SigningKey::<D>::new(key.clone());
        let mut signer_info =
            SignerInfoBuilder::new(&signer, sid, digest_algorithm.clone(), &content, Some(digest))
                .map_err(builder_error)?;
        signer_info.add_signed_attribute(time_attribute).map_err(builder_error)?;

        let mut builder = SignedDataBuilder::new(&content);
        builder.add_digest_algorithm(digest_algorithm).map_err(builder_error)?;
        for cert in credential.certificate_chain() {
            builder
                .add_certificate(CertificateChoices::Certificate(cert.clone()))
                .map_err(builder_error)?;
        }
        builder
            .add_signer_info::<SigningKey<D>, Signature>(signer_info)
            .map_err(builder_error)?;
        builder.build().map_err(builder_error)
    })?;

    Ok(content_info.to_der()?)
}

fn builder_error(err: cms::builder::Error) -> Error {
    Error::Crypto(format!("CMS builder: {:?}", err))
}

fn signing_time_attribute(at: DateTime<Utc>) -> Result<Attribute> {
    let since_epoch = Duration::from_secs(u64::try_from(at.timestamp()).unwrap_or(0));
    // UTCTime covers 1950..2049, GeneralizedTime after that
    let time = match UtcTime::from_unix_duration(since_epoch) {
        Ok(utc) => Time::UtcTime(utc),
        Err(_) => Time::GeneralTime(GeneralizedTime::from_unix_duration(since_epoch)?),
    };
    let values = SetOfVec::try_from(vec![Any::encode_from(&time)?])?;
    Ok(Attribute {
        oid: ID_SIGNING_TIME,
        values,
    })
}

/// What a detached SignedData says about a set of signed bytes.
#[derive(Debug, Clone)]
pub struct CmsReport {
    /// Digest algorithm of the signer info, when supported
    pub digest_algorithm: Option<DigestAlgorithm>,
    /// Whether the messageDigest attribute equals the digest of the signed bytes
    pub digest_matches: bool,
    /// Whether the RSA signature over the signed attributes verifies with the signer's key
    pub signature_valid: bool,
    /// signingTime attribute
    pub signing_time: Option<DateTime<Utc>>,
    /// Signer certificate, DER
    pub signer_certificate: Option<Vec<u8>>,
    /// Every embedded certificate, DER
    pub certificates: Vec<Vec<u8>>,
    /// Problems found while checking
    pub problems: Vec<String>,
}

/// Check a detached SignedData against the bytes it claims to sign.
///
/// `contents` may carry trailing zero padding, as the `/Contents` placeholder does.
///
/// # Errors
///
/// Fails only when the blob is not a SignedData at all; everything else is reported in the
/// returned [`CmsReport`].
pub fn verify_detached(contents: &[u8], signed: &[&[u8]]) -> Result<CmsReport> {
    let content_info = ContentInfo::decode(&mut der::SliceReader::new(contents)?)?;
    if content_info.content_type != ID_SIGNED_DATA {
        return Err(Error::Crypto(format!(
            "CMS content type {} is not signed-data",
            content_info.content_type
        )));
    }
    let signed_data = SignedData::from_der(&content_info.content.to_der()?)?;

    let mut report = CmsReport {
        digest_algorithm: None,
        digest_matches: false,
        signature_valid: false,
        signing_time: None,
        signer_certificate: None,
        certificates: Vec::new(),
        problems: Vec::new(),
    };

    let certificates: Vec<x509_cert::Certificate> = signed_data
        .certificates
        .iter()
        .flat_map(|set| set.0.iter())
        .filter_map(|choice| match choice {
            CertificateChoices::Certificate(cert) => Some(cert.clone()),
            _ => None,
        })
        .collect();
    for cert in &certificates {
        report.certificates.push(cert.to_der()?);
    }

    let Some(signer_info) = signed_data.signer_infos.0.iter().next() else {
        report.problems.push("SignedData has no signer".to_string());
        return Ok(report);
    };

    let signer_cert = match &signer_info.sid {
        SignerIdentifier::IssuerAndSerialNumber(id) => certificates.iter().find(|cert| {
            cert.tbs_certificate.issuer == id.issuer
                && cert.tbs_certificate.serial_number == id.serial_number
        }),
        SignerIdentifier::SubjectKeyIdentifier(_) => certificates.first(),
    };
    let Some(signer_cert) = signer_cert else {
        report.problems.push("signer certificate is not embedded".to_string());
        return Ok(report);
    };
    report.signer_certificate = Some(signer_cert.to_der()?);

    let Some(algorithm) = DigestAlgorithm::from_oid(&signer_info.digest_alg.oid) else {
        report.problems.push(format!(
            "unsupported digest algorithm {}",
            signer_info.digest_alg.oid
        ));
        return Ok(report);
    };
    report.digest_algorithm = Some(algorithm);

    let Some(signed_attrs) = &signer_info.signed_attrs else {
        report.problems.push("signer info has no signed attributes".to_string());
        return Ok(report);
    };

    let actual_digest = algorithm.digest(signed);
    for attr in signed_attrs.iter() {
        let Some(value) = attr.values.iter().next() else {
            continue;
        };
        if attr.oid == ID_MESSAGE_DIGEST {
            report.digest_matches =
                value.tag() == der::Tag::OctetString && value.value() == actual_digest.as_slice();
        } else if attr.oid == ID_SIGNING_TIME {
            report.signing_time = Time::from_der(&value.to_der()?)
                .ok()
                .and_then(|t| i64::try_from(t.to_unix_duration().as_secs()).ok())
                .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0));
        }
    }
    if !report.digest_matches {
        report.problems.push("message digest does not match the signed bytes".to_string());
    }

    let public_key = RsaPublicKey::from_public_key_der(
        &signer_cert.tbs_certificate.subject_public_key_info.to_der()?,
    )
    .map_err(|e| Error::Crypto(format!("signer key is not RSA: {}", e)))?;
    let message = signed_attrs.to_der()?;
    let signature = signer_info.signature.as_bytes();
    report.signature_valid = match algorithm {
        DigestAlgorithm::Sha256 => verify_with::<Sha256>(public_key, &message, signature),
        DigestAlgorithm::Sha384 => verify_with::<Sha384>(public_key, &message, signature),
        DigestAlgorithm::Sha512 => verify_with::<Sha512>(public_key, &message, signature),
    };
    if !report.signature_valid {
        report.problems.push("signature over the signed attributes does not verify".to_string());
    }

    Ok(report)
}

fn verify_with<D>(public_key: RsaPublicKey, message: &[u8], signature: &[u8]) -> bool
where
    D: Digest + AssociatedOid,
{
    let Ok(signature) = Signature::try_from(signature) else {
        return false;
    };
    VerifyingKey::<D>::new(public_key).verify(message, &signature).is_ok()
}
