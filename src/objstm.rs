//! Object streams (PDF 1.5+).
//!
//! An object stream packs several non-stream objects into one compressed stream. Its decoded data
//! starts with `/N` pairs of integers (object number, offset relative to `/First`), followed by
//! the objects themselves.

use crate::error::{Error, Result};
use crate::object::Object;
use crate::parser::parse_object;
use std::collections::HashMap;

fn invalid(reason: impl Into<String>) -> Error {
    Error::InvalidPdf(format!("object stream: {}", reason.into()))
}

/// Parse every object in an object stream, keyed by object number.
///
/// # Errors
///
/// Returns [`Error::InvalidPdf`] for a missing or out-of-range `/N` or `/First`, a header that
/// does not hold `/N` integer pairs, or an object that fails to parse. Decode errors propagate.
pub fn parse_object_stream(stream_obj: &Object) -> Result<HashMap<u32, Object>> {
    let dict = stream_obj
        .as_dict()
        .filter(|_| matches!(stream_obj, Object::Stream { .. }))
        .ok_or_else(|| invalid("not a stream"))?;

    if let Some(kind) = dict.get("Type").and_then(Object::as_name) {
        if kind != "ObjStm" {
            return Err(invalid(format!("expected /Type /ObjStm, got /{}", kind)));
        }
    }

    let n = dict
        .get("N")
        .and_then(Object::as_integer)
        .filter(|n| (0..=1_000_000).contains(n))
        .ok_or_else(|| invalid("missing or invalid /N"))? as usize;
    let first = dict
        .get("First")
        .and_then(Object::as_integer)
        .filter(|f| *f >= 0)
        .ok_or_else(|| invalid("missing or invalid /First"))? as usize;

    let data = stream_obj.decode_stream_data()?;
    if data.len() < first {
        return Err(invalid(format!("{} bytes of data but /First is {}", data.len(), first)));
    }

    let mut header = &data[..first];
    let mut pairs = Vec::with_capacity(n);
    for _ in 0..n {
        let (rest, number) = parse_object(header).map_err(|_| invalid("truncated header"))?;
        let (rest, offset) = parse_object(rest).map_err(|_| invalid("truncated header"))?;
        let (Some(number), Some(offset)) = (number.as_integer(), offset.as_integer()) else {
            return Err(invalid("header entry is not an integer pair"));
        };
        let number = u32::try_from(number).map_err(|_| invalid("negative object number"))?;
        let offset = usize::try_from(offset).map_err(|_| invalid("negative offset"))?;
        pairs.push((number, offset));
        header = rest;
    }

    let body = &data[first..];
    let mut objects = HashMap::with_capacity(n);
    for (number, offset) in pairs {
        if offset >= body.len() {
            return Err(invalid(format!("object {} offset {} beyond data", number, offset)));
        }
        let (_, object) = parse_object(&body[offset..])
            .map_err(|_| invalid(format!("object {} does not parse", number)))?;
        objects.insert(number, object);
    }

    Ok(objects)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::Dict;
    use bytes::Bytes;

    fn object_stream(n: i64, first: i64, data: &[u8]) -> Object {
        let mut dict = Dict::new();
        dict.insert("Type".to_string(), Object::name("ObjStm"));
        dict.insert("N".to_string(), Object::Integer(n));
        dict.insert("First".to_string(), Object::Integer(first));
        Object::Stream {
            dict,
            data: Bytes::from(data.to_vec()),
        }
    }

    #[test]
    fn test_parse_catalog_and_pages() {
        let header = b"4 0 5 34 ";
        let body = b"<< /Type /Catalog /Pages 5 0 R >> << /Type /Pages /Count 0 /Kids [] >>";
        let mut data = header.to_vec();
        data.extend_from_slice(body);

        let objects = parse_object_stream(&object_stream(2, header.len() as i64, &data)).unwrap();
        assert_eq!(objects.len(), 2);
        assert_eq!(objects[&4].get("Type").and_then(Object::as_name), Some("Catalog"));
        assert_eq!(objects[&5].get("Count").and_then(Object::as_integer), Some(0));
    }

    #[test]
    fn test_missing_first_is_error() {
        let mut dict = Dict::new();
        dict.insert("N".to_string(), Object::Integer(1));
        let stream = Object::Stream {
            dict,
            data: Bytes::from_static(b"1 0 42"),
        };
        assert!(parse_object_stream(&stream).is_err());
    }

    #[test]
    fn test_offset_beyond_data_is_error() {
        let data = b"1 99 42";
        assert!(parse_object_stream(&object_stream(1, 5, data)).is_err());
    }

    #[test]
    fn test_not_a_stream() {
        assert!(parse_object_stream(&Object::Integer(1)).is_err());
    }
}
