//! Cross-reference reader.
//!
//! Follows `startxref` to the latest cross-reference section and walks the `/Prev` chain back to
//! the first one, merging entries so that later sections win. Classic tables (`xref` keyword),
//! cross-reference streams (`/Type /XRef`) and hybrid files (`/XRefStm` in a table trailer) are
//! supported.
//!
//! Unlike a viewer, the signer never reconstructs a broken table: a section that does not parse
//! is an error, because the incremental update we append has to chain onto it with `/Prev`.

use crate::error::{Error, Result};
use crate::lexer::skip_ws;
use crate::object::{Dict, Object};
use crate::parser::{parse_indirect_object, parse_object};
use std::collections::{HashMap, HashSet};

/// Longest `/Prev` chain we follow.
const MAX_SECTIONS: usize = 256;

/// Largest subsection we accept, to bound memory on garbage input.
const MAX_SUBSECTION: u64 = 10_000_000;

/// Format of a cross-reference section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XrefKind {
    /// Classic `xref` table followed by `trailer`
    Table,
    /// Cross-reference stream (PDF 1.5+)
    Stream,
}

/// Cross-reference table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XRefEntry {
    /// Free object
    Free {
        /// Generation to use if the number is reused
        generation: u16,
    },
    /// Uncompressed object at a byte offset
    InUse {
        /// Byte offset of `id gen obj`
        offset: u64,
        /// Generation number
        generation: u16,
    },
    /// Object stored in an object stream
    Compressed {
        /// Object number of the containing object stream
        stream: u32,
        /// Index within the object stream
        index: u32,
    },
}

impl XRefEntry {
    /// Whether this entry describes an object that exists.
    pub fn is_in_use(&self) -> bool {
        !matches!(self, XRefEntry::Free { .. })
    }

    /// Generation number of the object this entry points at (0 for compressed objects).
    pub fn generation(&self) -> u16 {
        match self {
            XRefEntry::Free { generation } | XRefEntry::InUse { generation, .. } => *generation,
            XRefEntry::Compressed { .. } => 0,
        }
    }
}

/// Merged cross-reference data for a whole document.
#[derive(Debug, Clone)]
pub struct CrossRefTable {
    entries: HashMap<u32, XRefEntry>,
    trailer: Dict,
    kind: XrefKind,
    startxref: u64,
    sections: usize,
}

impl CrossRefTable {
    /// Look up the entry for an object number.
    pub fn get(&self, object_number: u32) -> Option<&XRefEntry> {
        self.entries.get(&object_number)
    }

    /// Trailer of the latest section, with `/Size` raised to cover every merged entry.
    pub fn trailer(&self) -> &Dict {
        &self.trailer
    }

    /// Format of the latest section. An incremental update should use the same format.
    pub fn kind(&self) -> XrefKind {
        self.kind
    }

    /// Offset of the latest section, i.e. the value after the final `startxref`.
    pub fn startxref(&self) -> u64 {
        self.startxref
    }

    /// Number of sections in the `/Prev` chain (1 for a file never updated).
    pub fn section_count(&self) -> usize {
        self.sections
    }

    /// Entries, in no particular order.
    pub fn entries(&self) -> impl Iterator<Item = (u32, &XRefEntry)> + '_ {
        self.entries.iter().map(|(n, e)| (*n, e))
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The `/Size` a new section must declare: one past the highest object number in use.
    pub fn size(&self) -> u32 {
        let declared = self
            .trailer
            .get("Size")
            .and_then(Object::as_integer)
            .and_then(|s| u32::try_from(s).ok())
            .unwrap_or(0);
        let highest = self.entries.keys().max().map(|n| n + 1).unwrap_or(0);
        declared.max(highest)
    }

    fn merge_older(&mut self, entries: HashMap<u32, XRefEntry>) {
        for (number, entry) in entries {
            self.entries.entry(number).or_insert(entry);
        }
    }
}

/// Find the offset after the last `startxref` keyword.
///
/// # Errors
///
/// Returns [`Error::InvalidXref`] when the keyword or its offset is missing.
pub fn find_startxref(data: &[u8]) -> Result<u64> {
    let tail_start = data.len().saturating_sub(2048);
    let tail = &data[tail_start..];
    let keyword = b"startxref";
    let pos = tail
        .windows(keyword.len())
        .rposition(|w| w == keyword)
        .ok_or_else(|| Error::InvalidXref("startxref not found".to_string()))?;

    let after = skip_ws(&tail[pos + keyword.len()..]);
    let digits: Vec<u8> = after.iter().copied().take_while(u8::is_ascii_digit).collect();
    std::str::from_utf8(&digits)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .filter(|&offset| (offset as usize) < data.len())
        .ok_or_else(|| Error::InvalidXref("startxref offset missing or out of range".to_string()))
}

/// Read the whole cross-reference chain starting at `startxref`.
///
/// # Errors
///
/// Returns [`Error::InvalidXref`] for any section that does not parse, a `/Prev` that loops, or a
/// trailer without `/Root`.
pub fn parse_xref(data: &[u8], startxref: u64) -> Result<CrossRefTable> {
    let (kind, entries, trailer) = parse_section(data, startxref)?;
    let mut table = CrossRefTable {
        entries,
        trailer,
        kind,
        startxref,
        sections: 1,
    };

    let mut visited = HashSet::from([startxref]);
    let mut prev = prev_offset(&table.trailer)?;
    while let Some(offset) = prev {
        if !visited.insert(offset) {
            return Err(Error::InvalidXref(format!("/Prev loop at offset {}", offset)));
        }
        if table.sections >= MAX_SECTIONS {
            return Err(Error::InvalidXref("too many cross-reference sections".to_string()));
        }
        log::debug!("following /Prev to xref section at {}", offset);
        let (_, entries, older_trailer) = parse_section(data, offset)?;
        table.merge_older(entries);
        table.sections += 1;
        prev = prev_offset(&older_trailer)?;
    }

    if table.trailer.get("Root").and_then(Object::as_reference).is_none() {
        return Err(Error::InvalidXref("trailer has no /Root reference".to_string()));
    }

    log::debug!(
        "xref: {} entries over {} section(s), latest is {:?}",
        table.entries.len(),
        table.sections,
        table.kind
    );
    Ok(table)
}

fn prev_offset(trailer: &Dict) -> Result<Option<u64>> {
    match trailer.get("Prev") {
        None => Ok(None),
        Some(obj) => obj
            .as_integer()
            .and_then(|v| u64::try_from(v).ok())
            .map(Some)
            .ok_or_else(|| Error::InvalidXref("/Prev is not an offset".to_string())),
    }
}

type Section = (XrefKind, HashMap<u32, XRefEntry>, Dict);

fn parse_section(data: &[u8], offset: u64) -> Result<Section> {
    let start = usize::try_from(offset)
        .ok()
        .filter(|&o| o < data.len())
        .ok_or_else(|| Error::InvalidXref(format!("section offset {} beyond end of file", offset)))?;
    let input = skip_ws(&data[start..]);

    if input.starts_with(b"xref") {
        let (mut entries, trailer) = parse_table(&input[4..], offset)?;
        // Hybrid file: the stream carries the entries for compressed objects
        if let Some(stm) = trailer.get("XRefStm").and_then(Object::as_integer) {
            let stm = u64::try_from(stm)
                .map_err(|_| Error::InvalidXref("/XRefStm is not an offset".to_string()))?;
            let (stream_entries, _) = parse_stream_section(data, stm)?;
            for (number, entry) in stream_entries {
                match entries.get(&number) {
                    Some(existing) if existing.is_in_use() => {},
                    _ => {
                        entries.insert(number, entry);
                    },
                }
            }
        }
        Ok((XrefKind::Table, entries, trailer))
    } else {
        let (entries, dict) = parse_stream_section(data, offset)?;
        Ok((XrefKind::Stream, entries, dict))
    }
}

fn read_uint(input: &[u8]) -> Option<(&[u8], u64)> {
    let input = skip_ws(input);
    let len = input.iter().take_while(|c| c.is_ascii_digit()).count();
    if len == 0 {
        return None;
    }
    let value = std::str::from_utf8(&input[..len]).ok()?.parse().ok()?;
    Some((&input[len..], value))
}

fn parse_table(mut input: &[u8], offset: u64) -> Result<(HashMap<u32, XRefEntry>, Dict)> {
    let bad = |what: &str| Error::InvalidXref(format!("{} in xref table at {}", what, offset));
    let mut entries = HashMap::new();

    loop {
        input = skip_ws(input);
        if input.starts_with(b"trailer") {
            input = &input[b"trailer".len()..];
            break;
        }

        let (rest, first) = read_uint(input).ok_or_else(|| bad("bad subsection header"))?;
        let (rest, count) = read_uint(rest).ok_or_else(|| bad("bad subsection header"))?;
        if count > MAX_SUBSECTION {
            return Err(bad("subsection too large"));
        }
        input = rest;

        for i in 0..count {
            let (rest, field1) = read_uint(input).ok_or_else(|| bad("bad entry offset"))?;
            let (rest, generation) = read_uint(rest).ok_or_else(|| bad("bad entry generation"))?;
            let rest = skip_ws(rest);
            let generation = u16::try_from(generation).map_err(|_| bad("generation overflow"))?;
            let entry = match rest.first() {
                Some(b'n') => XRefEntry::InUse {
                    offset: field1,
                    generation,
                },
                Some(b'f') => XRefEntry::Free { generation },
                _ => return Err(bad("entry type is neither 'n' nor 'f'")),
            };
            let number = u32::try_from(first + i).map_err(|_| bad("object number overflow"))?;
            entries.insert(number, entry);
            input = &rest[1..];
        }
    }

    match parse_object(input) {
        Ok((_, Object::Dictionary(trailer))) => Ok((entries, trailer)),
        _ => Err(bad("missing trailer dictionary")),
    }
}

fn parse_stream_section(data: &[u8], offset: u64) -> Result<(HashMap<u32, XRefEntry>, Dict)> {
    let bad = |what: String| Error::InvalidXref(format!("{} in xref stream at {}", what, offset));
    let start = usize::try_from(offset)
        .ok()
        .filter(|&o| o < data.len())
        .ok_or_else(|| bad("offset beyond end of file".to_string()))?;

    let (_, (_, object)) =
        parse_indirect_object(&data[start..]).map_err(|_| bad("no indirect object".to_string()))?;
    let (dict, raw) = match object {
        Object::Stream { dict, data } => (dict, data),
        other => return Err(bad(format!("expected stream, found {}", other.type_name()))),
    };
    if dict.get("Type").and_then(Object::as_name) != Some("XRef") {
        return Err(bad("stream is not /Type /XRef".to_string()));
    }

    let decoded = crate::decoders::decode_stream(&dict, &raw).map_err(|e| bad(e.to_string()))?;

    let widths: Vec<usize> = dict
        .get("W")
        .and_then(Object::as_array)
        .map(|w| {
            w.iter()
                .filter_map(|v| v.as_integer().and_then(|v| usize::try_from(v).ok()))
                .collect()
        })
        .unwrap_or_default();
    if widths.len() != 3 || widths.iter().any(|&w| w > 8) {
        return Err(bad("invalid /W".to_string()));
    }

    let size = dict
        .get("Size")
        .and_then(Object::as_integer)
        .ok_or_else(|| bad("missing /Size".to_string()))?;
    let index: Vec<i64> = match dict.get("Index").and_then(Object::as_array) {
        Some(items) => items.iter().filter_map(Object::as_integer).collect(),
        None => vec![0, size],
    };
    if index.len() % 2 != 0 || index.iter().any(|&v| v < 0) {
        return Err(bad("invalid /Index".to_string()));
    }

    let row = widths.iter().sum::<usize>();
    let expected = index
        .chunks(2)
        .try_fold(0i64, |acc, pair| acc.checked_add(pair[1]))
        .and_then(|total| total.checked_mul(row as i64))
        .ok_or_else(|| bad("invalid /Index".to_string()))?;
    if row == 0 || (decoded.len() as i64) < expected {
        return Err(bad(format!("{} bytes of entry data, expected {}", decoded.len(), expected)));
    }

    let mut entries = HashMap::new();
    let mut rows = decoded.chunks_exact(row);
    for pair in index.chunks(2) {
        for i in 0..pair[1] {
            let Some(bytes) = rows.next() else {
                return Err(bad("truncated entry data".to_string()));
            };
            let (f1, rest) = bytes.split_at(widths[0]);
            let (f2, f3) = rest.split_at(widths[1]);
            // A zero-width type field defaults to 1
            let kind = if widths[0] == 0 { 1 } else { read_be(f1) };
            let (f2, f3) = (read_be(f2), read_be(f3));
            let entry = match kind {
                0 => XRefEntry::Free {
                    generation: f3 as u16,
                },
                1 => XRefEntry::InUse {
                    offset: f2,
                    generation: f3 as u16,
                },
                2 => XRefEntry::Compressed {
                    stream: u32::try_from(f2).map_err(|_| bad("stream number overflow".to_string()))?,
                    index: u32::try_from(f3).map_err(|_| bad("index overflow".to_string()))?,
                },
                // Unknown types are null references
                _ => continue,
            };
            let number = pair[0]
                .checked_add(i)
                .and_then(|n| u32::try_from(n).ok())
                .ok_or_else(|| bad("object number overflow".to_string()))?;
            entries.insert(number, entry);
        }
    }

    Ok((entries, dict))
}

fn read_be(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0u64, |acc, &b| (acc << 8) | u64::from(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classic_pdf() -> Vec<u8> {
        let mut pdf = b"%PDF-1.4\n".to_vec();
        let o1 = pdf.len();
        pdf.extend_from_slice(b"1 0 obj\n<< /Type /Catalog /Pages 2 0 R >>\nendobj\n");
        let o2 = pdf.len();
        pdf.extend_from_slice(b"2 0 obj\n<< /Type /Pages /Kids [] /Count 0 >>\nendobj\n");
        let xref = pdf.len();
        pdf.extend_from_slice(b"xref\n0 3\n0000000000 65535 f \n");
        pdf.extend_from_slice(format!("{:010} 00000 n \n{:010} 00000 n \n", o1, o2).as_bytes());
        pdf.extend_from_slice(b"trailer\n<< /Size 3 /Root 1 0 R >>\n");
        pdf.extend_from_slice(format!("startxref\n{}\n%%EOF\n", xref).as_bytes());
        pdf
    }

    #[test]
    fn test_find_startxref() {
        let pdf = classic_pdf();
        let offset = find_startxref(&pdf).unwrap();
        assert!(pdf[offset as usize..].starts_with(b"xref"));
    }

    #[test]
    fn test_find_startxref_missing() {
        assert!(find_startxref(b"%PDF-1.4\n1 0 obj\n<< >>\nendobj\n").is_err());
        assert!(find_startxref(b"%PDF-1.4\nstartxref\n99999\n%%EOF").is_err());
    }

    #[test]
    fn test_parse_classic_table() {
        let pdf = classic_pdf();
        let table = parse_xref(&pdf, find_startxref(&pdf).unwrap()).unwrap();
        assert_eq!(table.kind(), XrefKind::Table);
        assert_eq!(table.len(), 3);
        assert_eq!(table.size(), 3);
        assert!(!table.get(0).unwrap().is_in_use());
        assert!(matches!(table.get(1), Some(XRefEntry::InUse { offset: 9, generation: 0 })));
    }

    #[test]
    fn test_corrupt_entry_is_error() {
        let pdf = classic_pdf();
        let text = String::from_utf8(pdf).unwrap().replacen("00000 n", "00000 x", 1);
        let bytes = text.into_bytes();
        assert!(parse_xref(&bytes, find_startxref(&bytes).unwrap()).is_err());
    }

    #[test]
    fn test_prev_loop_detected() {
        let mut pdf = classic_pdf();
        let xref = find_startxref(&pdf).unwrap();
        let text = String::from_utf8(pdf.clone()).unwrap();
        let looped = text.replace("<< /Size 3 /Root 1 0 R >>", &format!("<< /Size 3 /Root 1 0 R /Prev {} >>", xref));
        pdf = looped.into_bytes();
        let err = parse_xref(&pdf, xref).unwrap_err();
        assert!(err.to_string().contains("loop"));
    }

    #[test]
    fn test_parse_uncompressed_xref_stream() {
        let mut pdf = b"%PDF-1.5\n".to_vec();
        let o1 = pdf.len() as u32;
        pdf.extend_from_slice(b"1 0 obj\n<< /Type /Catalog >>\nendobj\n");
        let o2 = pdf.len() as u32;
        let mut rows = Vec::new();
        rows.extend_from_slice(&[0, 0, 0, 0, 0, 0xFF, 0xFF]);
        rows.push(1);
        rows.extend_from_slice(&o1.to_be_bytes());
        rows.extend_from_slice(&[0, 0]);
        rows.push(1);
        rows.extend_from_slice(&o2.to_be_bytes());
        rows.extend_from_slice(&[0, 0]);
        pdf.extend_from_slice(
            format!(
                "2 0 obj\n<< /Type /XRef /Size 3 /W [1 4 2] /Root 1 0 R /Length {} >>\nstream\n",
                rows.len()
            )
            .as_bytes(),
        );
        pdf.extend_from_slice(&rows);
        pdf.extend_from_slice(b"\nendstream\nendobj\n");
        pdf.extend_from_slice(format!("startxref\n{}\n%%EOF\n", o2).as_bytes());

        let table = parse_xref(&pdf, find_startxref(&pdf).unwrap()).unwrap();
        assert_eq!(table.kind(), XrefKind::Stream);
        assert_eq!(table.startxref(), u64::from(o2));
        assert!(matches!(table.get(2), Some(XRefEntry::InUse { offset, .. }) if *offset == u64::from(o2)));
    }

    fn xref_stream_with(extra: &str, rows: &[u8]) -> Vec<u8> {
        let mut pdf = b"%PDF-1.5\n".to_vec();
        let offset = pdf.len();
        pdf.extend_from_slice(
            format!(
                "1 0 obj\n<< /Type /XRef /Size 2 /W [1 1 1] {} /Root 1 0 R /Length {} >>\nstream\n",
                extra,
                rows.len()
            )
            .as_bytes(),
        );
        pdf.extend_from_slice(rows);
        pdf.extend_from_slice(b"\nendstream\nendobj\n");
        pdf.extend_from_slice(format!("startxref\n{}\n%%EOF\n", offset).as_bytes());
        pdf
    }

    #[test]
    fn test_overflowing_index_is_invalid_xref() {
        let rows = [1, 9, 0, 1, 9, 0];
        for index in [
            "/Index [0 9223372036854775807 0 9223372036854775807]",
            "/Index [0 4611686018427387904]",
            "/Index [9223372036854775807 2]",
        ] {
            let pdf = xref_stream_with(index, &rows);
            let err = parse_xref(&pdf, find_startxref(&pdf).unwrap()).unwrap_err();
            assert!(matches!(err, Error::InvalidXref(_)), "{}: {:?}", index, err);
        }
    }

    #[test]
    fn test_read_be() {
        assert_eq!(read_be(&[0x01, 0x02]), 0x0102);
        assert_eq!(read_be(&[]), 0);
    }
}
