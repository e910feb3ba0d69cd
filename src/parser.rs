//! PDF object parser.
//!
//! Recursive descent over the lexer's tokens. Composite objects must be closed: an array or
//! dictionary that runs off the end of the input is an error, not a partial object, because the
//! loader reports such files as malformed rather than guessing.

use crate::error::{Error, Result};
use crate::lexer::{Token, token};
use crate::object::{Dict, Object, ObjectRef};
use nom::IResult;

fn fail(input: &[u8], kind: nom::error::ErrorKind) -> nom::Err<nom::error::Error<&[u8]>> {
    nom::Err::Error(nom::error::Error::new(input, kind))
}

/// Decode escape sequences in a literal string body (ISO 32000-1, 7.3.4.2).
///
/// ```
/// # use pdf_batch_signer::parser::decode_literal_string_escapes;
/// assert_eq!(decode_literal_string_escapes(b"Section \\247 71.01"), b"Section \xa7 71.01");
/// assert_eq!(decode_literal_string_escapes(b"a\\(b\\)"), b"a(b)");
/// ```
pub fn decode_literal_string_escapes(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len());
    let mut i = 0;

    while i < raw.len() {
        let b = raw[i];
        if b != b'\\' || i + 1 >= raw.len() {
            out.push(b);
            i += 1;
            continue;
        }

        let next = raw[i + 1];
        i += 2;
        match next {
            b'n' => out.push(b'\n'),
            b'r' => out.push(b'\r'),
            b't' => out.push(b'\t'),
            b'b' => out.push(0x08),
            b'f' => out.push(0x0C),
            b'(' | b')' | b'\\' => out.push(next),
            b'\n' => {},
            b'\r' => {
                if raw.get(i) == Some(&b'\n') {
                    i += 1;
                }
            },
            b'0'..=b'7' => {
                let mut value = u32::from(next - b'0');
                let mut digits = 1;
                while digits < 3 {
                    match raw.get(i) {
                        Some(&d @ b'0'..=b'7') => {
                            value = value * 8 + u32::from(d - b'0');
                            i += 1;
                            digits += 1;
                        },
                        _ => break,
                    }
                }
                out.push((value & 0xFF) as u8);
            },
            // Unknown escapes drop the backslash
            other => out.push(other),
        }
    }

    out
}

/// Decode the digits of a hex string, ignoring whitespace and padding an odd final digit with 0.
///
/// ```
/// # use pdf_batch_signer::parser::decode_hex;
/// assert_eq!(decode_hex(b"48 65 6C 6C 6F").unwrap(), b"Hello");
/// assert_eq!(decode_hex(b"901FA").unwrap(), vec![0x90, 0x1F, 0xA0]);
/// ```
///
/// # Errors
///
/// Returns [`Error::ParseError`] when a non-hex, non-whitespace byte is present.
pub fn decode_hex(hex_bytes: &[u8]) -> Result<Vec<u8>> {
    let mut digits: Vec<u8> = hex_bytes
        .iter()
        .copied()
        .filter(|c| !c.is_ascii_whitespace())
        .collect();
    if digits.len() % 2 == 1 {
        digits.push(b'0');
    }
    hex::decode(&digits).map_err(|e| Error::ParseError {
        offset: 0,
        reason: format!("invalid hex string: {}", e),
    })
}

/// Parse a PDF object.
///
/// ```
/// use pdf_batch_signer::parser::parse_object;
/// use pdf_batch_signer::object::ObjectRef;
///
/// let (_, obj) = parse_object(b"<< /Type /Page /Parent 3 0 R >>").unwrap();
/// assert_eq!(obj.get("Parent").unwrap().as_reference(), Some(ObjectRef::new(3, 0)));
/// ```
///
/// # Errors
///
/// Returns `Err` if the input is not a complete PDF object.
pub fn parse_object(input: &[u8]) -> IResult<&[u8], Object> {
    let (rest, tok) = token(input)?;

    match tok {
        Token::Null => Ok((rest, Object::Null)),
        Token::True => Ok((rest, Object::Boolean(true))),
        Token::False => Ok((rest, Object::Boolean(false))),
        Token::Integer(i) => {
            // `id gen R` needs two tokens of lookahead
            if let Ok((after_gen, Token::Integer(gen))) = token(rest) {
                if let Ok((after_r, Token::R)) = token(after_gen) {
                    if let (Ok(id), Ok(gen)) = (u32::try_from(i), u16::try_from(gen)) {
                        return Ok((after_r, Object::Reference(ObjectRef::new(id, gen))));
                    }
                }
            }
            Ok((rest, Object::Integer(i)))
        },
        Token::Real(r) => Ok((rest, Object::Real(r))),
        Token::LiteralString(raw) => Ok((rest, Object::String(decode_literal_string_escapes(raw)))),
        Token::HexString(raw) => match decode_hex(raw) {
            Ok(bytes) => Ok((rest, Object::String(bytes))),
            Err(_) => Err(nom::Err::Failure(nom::error::Error::new(input, nom::error::ErrorKind::HexDigit))),
        },
        Token::Name(name) => Ok((rest, Object::Name(name))),
        Token::ArrayStart => parse_array(rest),
        Token::DictStart => {
            let (after_dict, dict) = parse_dictionary(rest)?;
            match token(after_dict) {
                Ok((after_kw, Token::StreamStart)) => {
                    let (remaining, data) = parse_stream_data(after_kw, &dict)?;
                    Ok((
                        remaining,
                        Object::Stream {
                            dict,
                            data: bytes::Bytes::from(data),
                        },
                    ))
                },
                _ => Ok((after_dict, Object::Dictionary(dict))),
            }
        },
        _ => Err(fail(input, nom::error::ErrorKind::Tag)),
    }
}

/// Parse an indirect object `id gen obj ... endobj`.
///
/// A missing `endobj` is tolerated since several producers omit it before `xref`.
pub fn parse_indirect_object(input: &[u8]) -> IResult<&[u8], (ObjectRef, Object)> {
    let (rest, id) = match token(input)? {
        (rest, Token::Integer(id)) if id >= 0 => (rest, id),
        _ => return Err(fail(input, nom::error::ErrorKind::Digit)),
    };
    let (rest, gen) = match token(rest)? {
        (rest, Token::Integer(gen)) if (0..=i64::from(u16::MAX)).contains(&gen) => (rest, gen),
        _ => return Err(fail(input, nom::error::ErrorKind::Digit)),
    };
    let rest = match token(rest)? {
        (rest, Token::ObjStart) => rest,
        _ => return Err(fail(input, nom::error::ErrorKind::Tag)),
    };

    let (rest, object) = parse_object(rest)?;
    let rest = match token(rest) {
        Ok((after, Token::ObjEnd)) => after,
        _ => rest,
    };

    let id = u32::try_from(id).map_err(|_| fail(input, nom::error::ErrorKind::Digit))?;
    Ok((rest, (ObjectRef::new(id, gen as u16), object)))
}

/// Read stream bytes after the `stream` keyword.
///
/// A direct `/Length` is trusted when `endstream` follows it; otherwise the data runs to the next
/// `endstream`, minus the end-of-line marker that precedes it.
fn parse_stream_data<'a>(input: &'a [u8], dict: &Dict) -> IResult<&'a [u8], Vec<u8>> {
    let input = if input.starts_with(b"\r\n") {
        &input[2..]
    } else if input.starts_with(b"\n") || input.starts_with(b"\r") {
        &input[1..]
    } else {
        input
    };

    if let Some(length) = dict.get("Length").and_then(Object::as_integer) {
        if let Ok(length) = usize::try_from(length) {
            if length <= input.len() {
                if let Ok((rest, Token::StreamEnd)) = token(&input[length..]) {
                    return Ok((rest, input[..length].to_vec()));
                }
            }
        }
        log::debug!("stream /Length {} does not reach endstream, scanning", length);
    }

    let pos = find_endstream(input).ok_or_else(|| fail(input, nom::error::ErrorKind::Eof))?;
    let mut data = &input[..pos];
    if data.ends_with(b"\r\n") {
        data = &data[..data.len() - 2];
    } else if data.ends_with(b"\n") || data.ends_with(b"\r") {
        data = &data[..data.len() - 1];
    }
    Ok((&input[pos + b"endstream".len()..], data.to_vec()))
}

fn find_endstream(input: &[u8]) -> Option<usize> {
    let keyword = b"endstream";
    input.windows(keyword.len()).position(|w| w == keyword)
}

fn parse_array(input: &[u8]) -> IResult<&[u8], Object> {
    let mut items = Vec::new();
    let mut remaining = input;

    loop {
        if let Ok((rest, Token::ArrayEnd)) = token(remaining) {
            return Ok((rest, Object::Array(items)));
        }
        let (rest, item) = parse_object(remaining)?;
        items.push(item);
        remaining = rest;
    }
}

fn parse_dictionary(input: &[u8]) -> IResult<&[u8], Dict> {
    let mut dict = Dict::new();
    let mut remaining = input;

    loop {
        match token(remaining)? {
            (rest, Token::DictEnd) => return Ok((rest, dict)),
            (rest, Token::Name(key)) => {
                let (rest, value) = parse_object(rest)?;
                // A null value is equivalent to an absent key
                if !value.is_null() {
                    dict.insert(key, value);
                }
                remaining = rest;
            },
            _ => return Err(fail(remaining, nom::error::ErrorKind::Tag)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_reference_vs_integers() {
        let (_, obj) = parse_object(b"12 0 R").unwrap();
        assert_eq!(obj, Object::Reference(ObjectRef::new(12, 0)));

        let (_, obj) = parse_object(b"[1 2 3]").unwrap();
        assert_eq!(
            obj,
            Object::Array(vec![Object::Integer(1), Object::Integer(2), Object::Integer(3)])
        );
    }

    #[test]
    fn test_parse_nested_dictionary() {
        let (_, obj) = parse_object(b"<< /MediaBox [0 0 612 792] /Res << /Font << >> >> >>").unwrap();
        let mb = obj.get("MediaBox").and_then(Object::as_array).unwrap();
        assert_eq!(mb.len(), 4);
        assert!(obj.get("Res").and_then(|r| r.get("Font")).is_some());
    }

    #[test]
    fn test_parse_unclosed_array_is_error() {
        assert!(parse_object(b"[1 2 3").is_err());
        assert!(parse_object(b"<< /A 1").is_err());
    }

    #[test]
    fn test_dictionary_key_must_be_name() {
        assert!(parse_object(b"<< 1 2 >>").is_err());
    }

    #[test]
    fn test_null_values_are_dropped() {
        let (_, obj) = parse_object(b"<< /A null /B 1 >>").unwrap();
        assert!(obj.get("A").is_none());
        assert_eq!(obj.get("B").and_then(Object::as_integer), Some(1));
    }

    #[test]
    fn test_parse_stream_with_length() {
        let input = b"<< /Length 5 >>\nstream\nhello\nendstream";
        let (rest, obj) = parse_object(input).unwrap();
        match obj {
            Object::Stream { data, .. } => assert_eq!(&data[..], b"hello"),
            other => panic!("expected stream, got {:?}", other),
        }
        assert!(rest.is_empty());
    }

    #[test]
    fn test_parse_stream_with_indirect_length() {
        let input = b"<< /Length 9 0 R >>\r\nstream\r\nabc\r\nendstream";
        let (_, obj) = parse_object(input).unwrap();
        match obj {
            Object::Stream { data, .. } => assert_eq!(&data[..], b"abc"),
            other => panic!("expected stream, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_indirect_object() {
        let (rest, (r, obj)) = parse_indirect_object(b"  7 0 obj\n<< /Type /Catalog >>\nendobj\nxref").unwrap();
        assert_eq!(r, ObjectRef::new(7, 0));
        assert_eq!(obj.get("Type").and_then(Object::as_name), Some("Catalog"));
        assert!(crate::lexer::skip_ws(rest).starts_with(b"xref"));
    }

    #[test]
    fn test_parse_indirect_object_rejects_garbage() {
        assert!(parse_indirect_object(b"xref\n0 1").is_err());
        assert!(parse_indirect_object(b"7 0 R").is_err());
    }

    #[test]
    fn test_decode_octal_and_continuation() {
        assert_eq!(decode_literal_string_escapes(b"\\101\\60x"), b"A0x");
        assert_eq!(decode_literal_string_escapes(b"ab\\\ncd"), b"abcd");
        assert_eq!(decode_literal_string_escapes(b"\\q"), b"q");
    }

    #[test]
    fn test_decode_hex_rejects_non_hex() {
        assert!(decode_hex(b"4G").is_err());
    }
}
