//! Shared helpers for the integration tests: small PDFs built by hand and the fixture store.

#![allow(dead_code)]

use pdf_batch_signer::signatures::{
    Credential, CredentialProvider, FileCredentialStore, NoPin, read_pem_certificates,
};
use std::path::{Path, PathBuf};

pub fn fixtures() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures")
}

pub fn root_pem() -> PathBuf {
    fixtures().join("roots/test_root.pem")
}

pub fn root_der() -> Vec<Vec<u8>> {
    read_pem_certificates(&root_pem()).unwrap()
}

pub fn credential_id(name: &str) -> String {
    fixtures().join("credentials").join(name).display().to_string()
}

pub fn store() -> FileCredentialStore {
    FileCredentialStore::new().with_trusted_roots_pem_file(&root_pem()).unwrap()
}

pub fn valid_credential() -> Credential {
    store().load(&credential_id("valid"), &NoPin).unwrap()
}

/// A document with one page per `(width, height)`, using a classic xref table.
pub fn classic_pdf(pages: &[(f64, f64)]) -> Vec<u8> {
    rotated_pdf(pages, 0)
}

/// Like [`classic_pdf`], with `/Rotate` on every page.
pub fn rotated_pdf(pages: &[(f64, f64)], rotate: i32) -> Vec<u8> {
    let mut pdf = b"%PDF-1.7\n%\xE2\xE3\xCF\xD3\n".to_vec();
    let mut offsets = Vec::new();
    for (id, body) in page_tree(pages, rotate).iter().enumerate() {
        offsets.push(pdf.len());
        pdf.extend_from_slice(format!("{} 0 obj\n{}\nendobj\n", id + 1, body).as_bytes());
    }
    let size = offsets.len() + 1;
    let xref = pdf.len();
    pdf.extend_from_slice(format!("xref\n0 {}\n0000000000 65535 f \n", size).as_bytes());
    for offset in &offsets {
        pdf.extend_from_slice(format!("{:010} 00000 n \n", offset).as_bytes());
    }
    pdf.extend_from_slice(
        format!("trailer\n<< /Size {} /Root 1 0 R >>\nstartxref\n{}\n%%EOF\n", size, xref).as_bytes(),
    );
    pdf
}

/// The same document with an uncompressed cross-reference stream instead of a table.
pub fn xref_stream_pdf(pages: &[(f64, f64)]) -> Vec<u8> {
    let mut pdf = b"%PDF-1.5\n".to_vec();
    let mut offsets = Vec::new();
    for (id, body) in page_tree(pages, 0).iter().enumerate() {
        offsets.push(pdf.len() as u32);
        pdf.extend_from_slice(format!("{} 0 obj\n{}\nendobj\n", id + 1, body).as_bytes());
    }
    let stream_id = offsets.len() + 1;
    let stream_offset = pdf.len() as u32;
    offsets.push(stream_offset);

    let mut rows = vec![0, 0, 0, 0, 0, 0xFF, 0xFF];
    for offset in &offsets {
        rows.push(1);
        rows.extend_from_slice(&offset.to_be_bytes());
        rows.extend_from_slice(&[0, 0]);
    }
    pdf.extend_from_slice(
        format!(
            "{} 0 obj\n<< /Type /XRef /Size {} /W [1 4 2] /Root 1 0 R /Length {} >>\nstream\n",
            stream_id,
            stream_id + 1,
            rows.len()
        )
        .as_bytes(),
    );
    pdf.extend_from_slice(&rows);
    pdf.extend_from_slice(b"\nendstream\nendobj\n");
    pdf.extend_from_slice(format!("startxref\n{}\n%%EOF\n", stream_offset).as_bytes());
    pdf
}

/// A document whose xref entries point three bytes past their objects.
pub fn corrupt_xref_pdf() -> Vec<u8> {
    let pdf = classic_pdf(&[(612.0, 792.0)]);
    let xref_start = pdf.windows(5).rposition(|w| w == b"xref\n").unwrap();
    let (head, tail) = pdf.split_at(xref_start);
    let shifted: String = String::from_utf8(tail.to_vec())
        .unwrap()
        .lines()
        .map(|line| match line.strip_suffix(" 00000 n ") {
            Some(offset) => format!("{:010} 00000 n \n", offset.parse::<usize>().unwrap() + 3),
            None => format!("{}\n", line),
        })
        .collect();
    let mut out = head.to_vec();
    out.extend_from_slice(shifted.as_bytes());
    out
}

fn page_tree(pages: &[(f64, f64)], rotate: i32) -> Vec<String> {
    let first_page = 3;
    let kids: Vec<String> = (0..pages.len()).map(|i| format!("{} 0 R", first_page + i)).collect();
    let mut objects = vec![
        "<< /Type /Catalog /Pages 2 0 R >>".to_string(),
        format!("<< /Type /Pages /Kids [{}] /Count {} >>", kids.join(" "), pages.len()),
    ];
    let rotate = match rotate {
        0 => String::new(),
        r => format!(" /Rotate {}", r),
    };
    for (width, height) in pages {
        objects.push(format!(
            "<< /Type /Page /Parent 2 0 R /MediaBox [0 0 {} {}]{} >>",
            width, height, rotate
        ));
    }
    objects
}

pub fn write(dir: &Path, name: &str, bytes: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, bytes).unwrap();
    path
}
