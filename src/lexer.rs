//! PDF lexer (tokenizer).
//!
//! Splits a PDF byte stream into tokens: numbers, literal and hex strings, names, keywords and
//! delimiters. Whitespace (space, \t, \r, \n, \0, \f) and comments (% to EOL) are skipped before
//! each token.
//!
//! Keywords are only recognized when followed by a delimiter, whitespace or end of input, so
//! `Rx` or `nullable` never lex as `R` or `null`.

use nom::{
    IResult,
    branch::alt,
    bytes::complete::{tag, take_till, take_while},
    character::complete::char,
    combinator::{map, value},
    multi::many0,
    sequence::{delimited, preceded},
};

/// Token types recognized by the PDF lexer.
#[derive(Debug, PartialEq, Clone)]
pub enum Token<'a> {
    /// Integer number (e.g., 42, -123)
    Integer(i64),

    /// Real number (e.g., 3.14, -2.5, .5)
    Real(f64),

    /// Literal string bytes between the outer parentheses, escapes not yet decoded
    LiteralString(&'a [u8]),

    /// Hex string digits between `<` and `>`, whitespace included
    HexString(&'a [u8]),

    /// Name with `#XX` escapes decoded, without the leading slash
    Name(String),

    /// `true`
    True,

    /// `false`
    False,

    /// `null`
    Null,

    /// `[`
    ArrayStart,

    /// `]`
    ArrayEnd,

    /// `<<`
    DictStart,

    /// `>>`
    DictEnd,

    /// `obj`
    ObjStart,

    /// `endobj`
    ObjEnd,

    /// `stream`
    StreamStart,

    /// `endstream`
    StreamEnd,

    /// `R` in `10 0 R`
    R,
}

/// PDF whitespace characters (ISO 32000-1, Table 1).
pub fn is_whitespace(c: u8) -> bool {
    matches!(c, b' ' | b'\t' | b'\r' | b'\n' | 0x00 | 0x0C)
}

/// PDF delimiter characters (ISO 32000-1, Table 2).
pub fn is_delimiter(c: u8) -> bool {
    matches!(c, b'(' | b')' | b'<' | b'>' | b'[' | b']' | b'{' | b'}' | b'/' | b'%')
}

fn nom_error(input: &[u8], kind: nom::error::ErrorKind) -> nom::Err<nom::error::Error<&[u8]>> {
    nom::Err::Error(nom::error::Error::new(input, kind))
}

fn comment(input: &[u8]) -> IResult<&[u8], ()> {
    value((), preceded(char('%'), take_till(|c| c == b'\r' || c == b'\n')))(input)
}

/// Skip all whitespace and comments.
pub fn skip_ws(input: &[u8]) -> &[u8] {
    let mut remaining = input;
    loop {
        let trimmed = match remaining.iter().position(|&c| !is_whitespace(c)) {
            Some(pos) => &remaining[pos..],
            None => return &remaining[remaining.len()..],
        };
        match comment(trimmed) {
            Ok((rest, _)) => remaining = rest,
            Err(_) => return trimmed,
        }
    }
}

/// Parse an integer or real number: `42`, `-123`, `+17`, `3.14`, `.5`, `-.002`, `4.`
fn parse_number(input: &[u8]) -> IResult<&[u8], Token<'_>> {
    let (rest, text) = take_while(|c: u8| c.is_ascii_digit() || matches!(c, b'+' | b'-' | b'.'))(
        input,
    )?;

    let digits = text.iter().filter(|c| c.is_ascii_digit()).count();
    let signs = text.iter().filter(|&&c| c == b'+' || c == b'-').count();
    let dots = text.iter().filter(|&&c| c == b'.').count();
    let sign_ok = signs == 0 || (signs == 1 && matches!(text[0], b'+' | b'-'));
    if digits == 0 || dots > 1 || !sign_ok {
        return Err(nom_error(input, nom::error::ErrorKind::Digit));
    }

    let s = std::str::from_utf8(text).map_err(|_| nom_error(input, nom::error::ErrorKind::Digit))?;
    let s = s.strip_prefix('+').unwrap_or(s);
    if dots == 1 {
        let normalized = if s.ends_with('.') {
            format!("{}0", s)
        } else {
            s.to_string()
        };
        let n: f64 = normalized
            .parse()
            .map_err(|_| nom_error(input, nom::error::ErrorKind::Float))?;
        Ok((rest, Token::Real(n)))
    } else {
        let n: i64 = s
            .parse()
            .map_err(|_| nom_error(input, nom::error::ErrorKind::Digit))?;
        Ok((rest, Token::Integer(n)))
    }
}

/// Parse a literal string with balanced parentheses. Escapes are skipped over but not decoded;
/// see [`crate::parser::decode_literal_string_escapes`].
fn parse_literal_string(input: &[u8]) -> IResult<&[u8], Token<'_>> {
    let (body, _) = char('(')(input)?;
    let mut depth = 1usize;
    let mut pos = 0;

    while pos < body.len() {
        match body[pos] {
            b'\\' => pos += 2,
            b'(' => {
                depth += 1;
                pos += 1;
            },
            b')' => {
                depth -= 1;
                if depth == 0 {
                    return Ok((&body[pos + 1..], Token::LiteralString(&body[..pos])));
                }
                pos += 1;
            },
            _ => pos += 1,
        }
    }

    Err(nom_error(input, nom::error::ErrorKind::Tag))
}

/// Parse a hexadecimal string `<48656C6C6F>`.
fn parse_hex_string(input: &[u8]) -> IResult<&[u8], Token<'_>> {
    if input.starts_with(b"<<") {
        return Err(nom_error(input, nom::error::ErrorKind::Tag));
    }

    delimited(
        char('<'),
        map(
            take_while(|c: u8| c.is_ascii_hexdigit() || is_whitespace(c)),
            Token::HexString,
        ),
        char('>'),
    )(input)
}

/// Decode `#XX` escape sequences in a raw name.
///
/// Invalid sequences are kept literally.
///
/// ```
/// # use pdf_batch_signer::lexer::decode_name_escapes;
/// assert_eq!(decode_name_escapes(b"A#20B#23C"), "A B#C");
/// assert_eq!(decode_name_escapes(b"Type"), "Type");
/// assert_eq!(decode_name_escapes(b"A#"), "A#");
/// ```
pub fn decode_name_escapes(raw: &[u8]) -> String {
    let mut out = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        if raw[i] == b'#' && i + 2 < raw.len() {
            let hex = std::str::from_utf8(&raw[i + 1..i + 3]).ok();
            if let Some(byte) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(raw[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn parse_name(input: &[u8]) -> IResult<&[u8], Token<'_>> {
    preceded(
        char('/'),
        map(
            take_while(|c: u8| !is_whitespace(c) && !is_delimiter(c)),
            |bytes: &[u8]| Token::Name(decode_name_escapes(bytes)),
        ),
    )(input)
}

fn parse_delimiter(input: &[u8]) -> IResult<&[u8], Token<'_>> {
    alt((
        value(Token::DictStart, tag(b"<<")),
        value(Token::DictEnd, tag(b">>")),
        value(Token::ArrayStart, tag(b"[")),
        value(Token::ArrayEnd, tag(b"]")),
    ))(input)
}

/// Keywords must end at a delimiter, whitespace or end of input.
fn parse_keyword(input: &[u8]) -> IResult<&[u8], Token<'_>> {
    let (rest, word) = take_while(|c: u8| c.is_ascii_alphabetic())(input)?;
    let token = match word {
        b"true" => Token::True,
        b"false" => Token::False,
        b"null" => Token::Null,
        b"obj" => Token::ObjStart,
        b"endobj" => Token::ObjEnd,
        b"stream" => Token::StreamStart,
        b"endstream" => Token::StreamEnd,
        b"R" => Token::R,
        _ => return Err(nom_error(input, nom::error::ErrorKind::Tag)),
    };
    match rest.first() {
        Some(&c) if !is_whitespace(c) && !is_delimiter(c) => {
            Err(nom_error(input, nom::error::ErrorKind::Tag))
        },
        _ => Ok((rest, token)),
    }
}

/// Parse a single PDF token, skipping leading whitespace and comments.
///
/// # Errors
///
/// Returns `Err` if the input doesn't start with a valid token.
pub fn token(input: &[u8]) -> IResult<&[u8], Token<'_>> {
    let input = skip_ws(input);
    alt((
        parse_delimiter,
        parse_keyword,
        parse_name,
        parse_number,
        parse_literal_string,
        parse_hex_string,
    ))(input)
}

/// Parse tokens until the input is exhausted or no token matches.
pub fn tokens(input: &[u8]) -> IResult<&[u8], Vec<Token<'_>>> {
    many0(token)(input)
}
