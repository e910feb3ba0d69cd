//! Stream decoders.
//!
//! Only the structural streams of a document are ever decoded here: cross-reference streams and
//! object streams. Producers compress those with FlateDecode, usually with a PNG predictor on
//! xref streams, so that is the whole filter set. Page content is never decoded.

use crate::error::{Error, Result};
use crate::object::{Dict, Object};

mod flate;
mod predictor;

pub use flate::FlateDecoder;
pub use predictor::{DecodeParams, decode_predictor};

/// Upper bound on decoded size of a structural stream.
const MAX_DECODED_SIZE: usize = 256 * 1024 * 1024;

/// A single PDF stream filter.
pub trait StreamDecoder {
    /// Decode `input`, returning the filtered bytes.
    fn decode(&self, input: &[u8]) -> Result<Vec<u8>>;

    /// The filter's PDF name, e.g. `FlateDecode`.
    fn name(&self) -> &str;
}

fn decoder_for(name: &str) -> Result<Box<dyn StreamDecoder>> {
    match name {
        "FlateDecode" | "Fl" => Ok(Box::new(FlateDecoder)),
        other => Err(Error::UnsupportedFilter(other.to_string())),
    }
}

/// Collect the filter names of a stream dictionary (`/Filter` may be a name or an array).
pub fn filter_names(dict: &Dict) -> Vec<String> {
    match dict.get("Filter") {
        Some(Object::Name(n)) => vec![n.clone()],
        Some(Object::Array(items)) => items
            .iter()
            .filter_map(|o| o.as_name().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

/// Decode stream `data` according to its dictionary's `/Filter` and `/DecodeParms`.
///
/// # Errors
///
/// Returns [`Error::UnsupportedFilter`] for anything but FlateDecode, or [`Error::Decode`] when
/// the data is corrupt or decodes past the size limit.
pub fn decode_stream(dict: &Dict, data: &[u8]) -> Result<Vec<u8>> {
    let filters = filter_names(dict);
    let mut current = data.to_vec();

    for name in &filters {
        current = decoder_for(name)?.decode(&current)?;
        if current.len() > MAX_DECODED_SIZE {
            return Err(Error::Decode(format!(
                "{} output of {} bytes exceeds limit of {} bytes",
                name,
                current.len(),
                MAX_DECODED_SIZE
            )));
        }
    }

    let params = match dict.get("DecodeParms") {
        Some(Object::Dictionary(d)) => Some(DecodeParams::from_dict(d)),
        Some(Object::Array(items)) => items
            .iter()
            .filter_map(Object::as_dict)
            .next()
            .map(DecodeParams::from_dict),
        _ => None,
    };

    match params {
        Some(params) if params.predictor > 1 => decode_predictor(&current, &params),
        _ => Ok(current),
    }
}
