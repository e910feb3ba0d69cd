//! ByteRange calculation for PDF signatures.
//!
//! PDF digital signatures use a ByteRange array to specify which portions
//! of the document are covered by the signature. The signature itself is
//! stored in a placeholder that is excluded from the signed bytes.
//!
//! ## ByteRange Format
//!
//! The ByteRange is an array of four integers:
//! `[offset1, length1, offset2, length2]`
//!
//! Where:
//! - `offset1` = 0 (start of file)
//! - `length1` = byte offset where the signature value begins
//! - `offset2` = byte offset where the signature value ends
//! - `length2` = remaining bytes to end of file
//!
//! The signature value is a hex-encoded string within `<` and `>` delimiters.
//!
//! Neither value is known until the file is laid out, so both are written as fixed-width
//! placeholders first and patched in place afterwards without moving a single byte.

use crate::error::{Error, Result};
use crate::object::Object;

/// Placeholder number: wide enough for any offset below 10 GB.
const BYTE_RANGE_PLACEHOLDER: i64 = 9_999_999_999;

/// Calculator for PDF signature byte ranges.
#[derive(Debug)]
pub struct ByteRangeCalculator {
    /// Size of the placeholder for the signature value (hex digits + 2 for angle brackets)
    placeholder_size: usize,
}

impl ByteRangeCalculator {
    /// Create a new ByteRange calculator for a DER signature of up to `signature_capacity` bytes.
    ///
    /// The placeholder size is `(signature_capacity * 2) + 2` because the signature is
    /// hex-encoded and enclosed in angle brackets.
    pub fn new(signature_capacity: usize) -> Self {
        Self {
            placeholder_size: signature_capacity * 2 + 2,
        }
    }

    /// Get the placeholder size (for the /Contents value, brackets included).
    pub fn placeholder_size(&self) -> usize {
        self.placeholder_size
    }

    /// Bytes of DER the placeholder can hold.
    pub fn capacity(&self) -> usize {
        (self.placeholder_size - 2) / 2
    }

    /// `/Contents` placeholder object; serializes as `<00...00>` of exactly
    /// [`placeholder_size`](Self::placeholder_size) bytes.
    pub fn contents_placeholder(&self) -> Object {
        Object::String(vec![0; self.capacity()])
    }

    /// `/ByteRange` placeholder object.
    pub fn byte_range_placeholder() -> Object {
        Object::Array(vec![
            Object::Integer(0),
            Object::Integer(BYTE_RANGE_PLACEHOLDER),
            Object::Integer(BYTE_RANGE_PLACEHOLDER),
            Object::Integer(BYTE_RANGE_PLACEHOLDER),
        ])
    }

    /// The placeholder as the serializer writes it.
    pub fn byte_range_placeholder_text() -> String {
        format!(
            "[0 {p} {p} {p}]",
            p = BYTE_RANGE_PLACEHOLDER
        )
    }

    /// Calculate the ByteRange array given the position of the /Contents value.
    ///
    /// # Arguments
    ///
    /// * `file_size` - Total size of the PDF file
    /// * `contents_offset` - Byte offset where the /Contents value starts (including '<')
    ///
    /// # Returns
    ///
    /// An array `[0, before_sig, after_sig_start, after_sig_len]`
    pub fn calculate_byte_range(&self, file_size: usize, contents_offset: usize) -> [i64; 4] {
        let before_sig = contents_offset as i64;
        let after_sig_start = (contents_offset + self.placeholder_size) as i64;
        let after_sig_len = file_size as i64 - after_sig_start;

        [0, before_sig, after_sig_start, after_sig_len]
    }

    /// Format a ByteRange array as a PDF array string.
    pub fn format_byte_range(byte_range: &[i64; 4]) -> String {
        format!("[{} {} {} {}]", byte_range[0], byte_range[1], byte_range[2], byte_range[3])
    }

    /// Overwrite the ByteRange placeholder at `offset`, padding with spaces.
    pub fn patch_byte_range(pdf_data: &mut [u8], offset: usize, byte_range: &[i64; 4]) -> Result<()> {
        let placeholder = Self::byte_range_placeholder_text();
        let end = offset + placeholder.len();
        if pdf_data.get(offset..end) != Some(placeholder.as_bytes()) {
            return Err(Error::InvalidPdf(format!(
                "no ByteRange placeholder at byte {}",
                offset
            )));
        }

        let formatted = Self::format_byte_range(byte_range);
        if formatted.len() > placeholder.len() {
            return Err(Error::InvalidPdf(format!(
                "ByteRange {} does not fit its placeholder",
                formatted
            )));
        }
        let padded = format!("{:<width$}", formatted, width = placeholder.len());
        pdf_data[offset..end].copy_from_slice(padded.as_bytes());
        Ok(())
    }

    /// Read a `/ByteRange` array into four integers.
    pub fn parse_byte_range(obj: &Object) -> Option<[i64; 4]> {
        let items = obj.as_array()?;
        if items.len() != 4 {
            return None;
        }
        let mut out = [0i64; 4];
        for (slot, item) in out.iter_mut().zip(items) {
            *slot = item.as_integer()?;
        }
        Some(out)
    }

    /// Extract the bytes to be signed from a PDF file.
    ///
    /// Returns the two ranges specified by ByteRange, borrowed from `pdf_data`.
    pub fn signed_ranges<'a>(pdf_data: &'a [u8], byte_range: &[i64; 4]) -> Result<[&'a [u8]; 2]> {
        let mut ranges = [&pdf_data[..0]; 2];
        for (i, pair) in byte_range.chunks_exact(2).enumerate() {
            let (offset, length) = (pair[0], pair[1]);
            let range = usize::try_from(offset)
                .ok()
                .zip(usize::try_from(length).ok())
                .and_then(|(o, l)| Some(o..o.checked_add(l)?))
                .filter(|r| r.end <= pdf_data.len())
                .ok_or_else(|| {
                    Error::InvalidPdf(format!(
                        "ByteRange range {} ({} + {}) exceeds file size {}",
                        i + 1,
                        offset,
                        length,
                        pdf_data.len()
                    ))
                })?;
            ranges[i] = &pdf_data[range];
        }
        Ok(ranges)
    }

    /// Check that a ByteRange is well formed for a file of `file_size` bytes.
    ///
    /// The first range must start at 0, the gap must be non-empty, and the second range must end
    /// within the file. Returns whether it ends exactly at the end of the file, i.e. whether the
    /// signature covers the whole document.
    pub fn validate_byte_range(byte_range: &[i64; 4], file_size: usize) -> Result<bool> {
        let [offset1, length1, offset2, length2] = *byte_range;

        // First range must start at 0
        if offset1 != 0 {
            return Err(Error::InvalidPdf(format!("ByteRange must start at 0, got {}", offset1)));
        }
        if length1 <= 0 || length2 < 0 {
            return Err(Error::InvalidPdf("ByteRange has a negative or empty range".to_string()));
        }

        // First range must end before second range starts
        if length1 >= offset2 {
            return Err(Error::InvalidPdf(format!(
                "ByteRange first range ({}) overlaps with second range start ({})",
                length1, offset2
            )));
        }

        let actual_end = offset2 + length2;
        if actual_end > file_size as i64 {
            return Err(Error::InvalidPdf(format!(
                "ByteRange ends at {} beyond file size {}",
                actual_end, file_size
            )));
        }
        Ok(actual_end == file_size as i64)
    }

    /// Find the `/Contents <` key at or after `from` and return the offset of the `<`.
    ///
    /// Literal strings are skipped, so a `/ContactInfo` or `/Reason` value that spells out
    /// `/Contents <` is never taken for the key.
    pub fn find_contents_offset(pdf_data: &[u8], from: usize) -> Option<usize> {
        let key = b"/Contents";
        let window = pdf_data.get(from..)?;
        let mut depth = 0usize;
        let mut i = 0;
        while i < window.len() {
            match window[i] {
                b'\\' if depth > 0 => i += 1,
                b'(' => depth += 1,
                b')' if depth > 0 => depth -= 1,
                b'/' if depth == 0 && window[i..].starts_with(key) => {
                    let after = i + key.len();
                    let skipped = window[after..]
                        .iter()
                        .take_while(|b| matches!(b, b' ' | b'\t' | b'\n' | b'\r'))
                        .count();
                    if window.get(after + skipped) == Some(&b'<') {
                        return Some(from + after + skipped);
                    }
                },
                _ => {},
            }
            i += 1;
        }
        None
    }

    /// Find the ByteRange placeholder at or after `from`.
    pub fn find_byte_range_placeholder(pdf_data: &[u8], from: usize) -> Option<usize> {
        let placeholder = Self::byte_range_placeholder_text();
        find(pdf_data.get(from..)?, placeholder.as_bytes()).map(|p| from + p)
    }

    /// Replace the placeholder in the PDF with the actual signature.
    ///
    /// # Arguments
    ///
    /// * `pdf_data` - Mutable PDF file data
    /// * `contents_offset` - Byte offset where the /Contents value starts
    /// * `signature` - DER signature to insert
    pub fn insert_signature(
        &self,
        pdf_data: &mut [u8],
        contents_offset: usize,
        signature: &[u8],
    ) -> Result<()> {
        let signature_hex = hex::encode_upper(signature);
        // +2 for angle brackets
        let sig_len = signature_hex.len() + 2;
        if sig_len > self.placeholder_size {
            return Err(Error::InvalidPdf(format!(
                "Signature ({} bytes) exceeds placeholder size ({} bytes)",
                sig_len, self.placeholder_size
            )));
        }

        let end = contents_offset + self.placeholder_size;
        if end > pdf_data.len()
            || pdf_data[contents_offset] != b'<'
            || pdf_data[end - 1] != b'>'
        {
            return Err(Error::InvalidPdf(format!(
                "no signature placeholder at byte {}",
                contents_offset
            )));
        }

        let value = &mut pdf_data[contents_offset + 1..end - 1];
        value[..signature_hex.len()].copy_from_slice(signature_hex.as_bytes());
        value[signature_hex.len()..].fill(b'0');
        Ok(())
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::ObjectSerializer;

    #[test]
    fn test_placeholder_size() {
        let calc = ByteRangeCalculator::new(1024);
        // 1024 bytes * 2 (hex) + 2 (brackets) = 2050
        assert_eq!(calc.placeholder_size(), 2050);
        assert_eq!(calc.capacity(), 1024);
    }

    #[test]
    fn test_placeholders_serialize_to_expected_width() {
        let calc = ByteRangeCalculator::new(4);
        let s = ObjectSerializer::compact();
        assert_eq!(s.serialize_to_string(&calc.contents_placeholder()).unwrap(), "<00000000>");
        assert_eq!(
            s.serialize_to_string(&ByteRangeCalculator::byte_range_placeholder()).unwrap(),
            ByteRangeCalculator::byte_range_placeholder_text()
        );
    }

    #[test]
    fn test_calculate_byte_range() {
        let calc = ByteRangeCalculator::new(49);
        let byte_range = calc.calculate_byte_range(1000, 400);
        assert_eq!(byte_range, [0, 400, 500, 500]);
    }

    #[test]
    fn test_patch_byte_range_keeps_length() {
        let placeholder = ByteRangeCalculator::byte_range_placeholder_text();
        let mut data = format!("/ByteRange {}/Contents", placeholder).into_bytes();
        let before = data.len();
        ByteRangeCalculator::patch_byte_range(&mut data, 11, &[0, 100, 200, 300]).unwrap();
        assert_eq!(data.len(), before);
        let text = String::from_utf8(data).unwrap();
        assert!(text.starts_with("/ByteRange [0 100 200 300] "));
        assert!(text.ends_with(" /Contents"));

        let mut wrong = b"/ByteRange [0 0 0 0]".to_vec();
        assert!(ByteRangeCalculator::patch_byte_range(&mut wrong, 11, &[0, 1, 2, 3]).is_err());
    }

    #[test]
    fn test_signed_ranges() {
        let pdf_data = b"AAABBBCCC";
        let [first, second] = ByteRangeCalculator::signed_ranges(pdf_data, &[0, 3, 6, 3]).unwrap();
        assert_eq!(first, b"AAA");
        assert_eq!(second, b"CCC");
        assert!(ByteRangeCalculator::signed_ranges(pdf_data, &[0, 3, 6, 9]).is_err());
        assert!(ByteRangeCalculator::signed_ranges(pdf_data, &[0, -3, 6, 3]).is_err());
    }

    #[test]
    fn test_validate_byte_range() {
        assert!(ByteRangeCalculator::validate_byte_range(&[0, 100, 150, 50], 200).unwrap());
        assert!(!ByteRangeCalculator::validate_byte_range(&[0, 100, 150, 50], 300).unwrap());
        assert!(ByteRangeCalculator::validate_byte_range(&[10, 100, 150, 50], 200).is_err());
        assert!(ByteRangeCalculator::validate_byte_range(&[0, 100, 150, 100], 200).is_err());
        assert!(ByteRangeCalculator::validate_byte_range(&[0, 160, 150, 50], 200).is_err());
    }

    #[test]
    fn test_find_contents_offset() {
        let data = b"<< /ContentsX 1 /Contents <0000> >>";
        assert_eq!(ByteRangeCalculator::find_contents_offset(data, 0), Some(26));
        assert_eq!(ByteRangeCalculator::find_contents_offset(b"/Contents 5", 0), None);
    }

    #[test]
    fn test_find_contents_offset_skips_strings() {
        let data = b"<< /ContactInfo (see /Contents <1> \\) \\(x\\) (nested /Contents <2>)) /Contents <0000> >>";
        let at = ByteRangeCalculator::find_contents_offset(data, 0).unwrap();
        assert_eq!(&data[at..at + 6], b"<0000>");
        assert_eq!(ByteRangeCalculator::find_contents_offset(b"(/Contents <00>)", 0), None);
    }

    #[test]
    fn test_insert_signature() {
        let calc = ByteRangeCalculator::new(4);
        let mut pdf_data = b"XX<00000000>YY".to_vec();
        calc.insert_signature(&mut pdf_data, 2, &[0xAB, 0xCD]).unwrap();
        assert_eq!(&pdf_data, b"XX<ABCD0000>YY");
    }

    #[test]
    fn test_insert_signature_too_large() {
        let calc = ByteRangeCalculator::new(4);
        let mut pdf_data = b"XX<00000000>YY".to_vec();
        let result = calc.insert_signature(&mut pdf_data, 2, &[0xAA, 0xBB, 0xCC, 0xDD, 0xEE]);
        assert!(result.is_err());
    }
}
