//! PNG predictor reversal for FlateDecode streams.
//!
//! Cross-reference streams are almost always written with `/Predictor 12` (PNG Up). In PDF every
//! PNG-predicted row starts with its own tag byte, whatever value `/Predictor` holds between 10
//! and 15, so the tag byte decides the filter per row.

use crate::error::{Error, Result};
use crate::object::{Dict, Object};

/// `/DecodeParms` values relevant to predictors.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodeParams {
    /// Predictor algorithm (1 = none, 2 = TIFF, 10-15 = PNG)
    pub predictor: i64,
    /// Samples per row
    pub columns: usize,
    /// Color components per sample
    pub colors: usize,
    /// Bits per component
    pub bits_per_component: usize,
}

impl Default for DecodeParams {
    fn default() -> Self {
        Self {
            predictor: 1,
            columns: 1,
            colors: 1,
            bits_per_component: 8,
        }
    }
}

impl DecodeParams {
    /// Read parameters from a `/DecodeParms` dictionary, falling back to defaults.
    pub fn from_dict(dict: &Dict) -> Self {
        let defaults = Self::default();
        let get = |key: &str| dict.get(key).and_then(Object::as_integer);
        Self {
            predictor: get("Predictor").unwrap_or(defaults.predictor),
            columns: get("Columns").map(|v| v.max(1) as usize).unwrap_or(defaults.columns),
            colors: get("Colors").map(|v| v.max(1) as usize).unwrap_or(defaults.colors),
            bits_per_component: get("BitsPerComponent")
                .map(|v| v.max(1) as usize)
                .unwrap_or(defaults.bits_per_component),
        }
    }

    /// Bytes of sample data per row, without the PNG tag byte.
    pub fn row_bytes(&self) -> usize {
        (self.columns * self.colors * self.bits_per_component).div_ceil(8)
    }

    fn bytes_per_pixel(&self) -> usize {
        (self.colors * self.bits_per_component).div_ceil(8).max(1)
    }
}

/// Reverse a predictor.
///
/// # Errors
///
/// Returns [`Error::Decode`] for TIFF or unknown predictors, for data that is not a whole number
/// of rows, and for invalid row tags.
pub fn decode_predictor(data: &[u8], params: &DecodeParams) -> Result<Vec<u8>> {
    match params.predictor {
        1 => Ok(data.to_vec()),
        10..=15 => decode_png(data, params),
        other => Err(Error::Decode(format!("unsupported predictor {}", other))),
    }
}

fn decode_png(data: &[u8], params: &DecodeParams) -> Result<Vec<u8>> {
    let row_bytes = params.row_bytes();
    let stride = row_bytes + 1;
    if data.len() % stride != 0 {
        return Err(Error::Decode(format!(
            "predicted data length {} is not a multiple of row size {}",
            data.len(),
            stride
        )));
    }

    let bpp = params.bytes_per_pixel();
    let mut output = Vec::with_capacity(data.len() / stride * row_bytes);
    let mut prev = vec![0u8; row_bytes];

    for row in data.chunks_exact(stride) {
        let (tag, encoded) = (row[0], &row[1..]);
        let mut current = vec![0u8; row_bytes];

        for i in 0..row_bytes {
            let left = if i >= bpp { current[i - bpp] } else { 0 };
            let up = prev[i];
            let up_left = if i >= bpp { prev[i - bpp] } else { 0 };
            let predicted = match tag {
                0 => 0,
                1 => left,
                2 => up,
                3 => ((u16::from(left) + u16::from(up)) / 2) as u8,
                4 => paeth(left, up, up_left),
                other => {
                    return Err(Error::Decode(format!("invalid PNG predictor tag {}", other)));
                },
            };
            current[i] = encoded[i].wrapping_add(predicted);
        }

        output.extend_from_slice(&current);
        prev = current;
    }

    Ok(output)
}

fn paeth(a: u8, b: u8, c: u8) -> u8 {
    let p = i16::from(a) + i16::from(b) - i16::from(c);
    let pa = (p - i16::from(a)).abs();
    let pb = (p - i16::from(b)).abs();
    let pc = (p - i16::from(c)).abs();
    if pa <= pb && pa <= pc {
        a
    } else if pb <= pc {
        b
    } else {
        c
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(columns: usize) -> DecodeParams {
        DecodeParams {
            predictor: 12,
            columns,
            ..DecodeParams::default()
        }
    }

    #[test]
    fn test_png_sub_and_up_rows() {
        let data = [1u8, 5, 1, 1, 2, 1, 1, 1];
        assert_eq!(decode_predictor(&data, &params(3)).unwrap(), vec![5, 6, 7, 6, 7, 8]);
    }

    #[test]
    fn test_png_average_and_paeth() {
        let data = [0u8, 10, 20, 3, 0, 0, 4, 0, 0];
        let out = decode_predictor(&data, &params(2)).unwrap();
        assert_eq!(&out[..2], &[10, 20]);
        // Average of left (0) and up (10) is 5, then left 5 + up 20 over 2 is 12
        assert_eq!(&out[2..4], &[5, 12]);
        // Paeth falls back to the byte above when there is no left neighbour
        assert_eq!(out[4], 5);
    }

    #[test]
    fn test_png_rejects_partial_row() {
        assert!(decode_predictor(&[2, 1, 1], &params(3)).is_err());
    }

    #[test]
    fn test_tiff_predictor_unsupported() {
        let p = DecodeParams {
            predictor: 2,
            ..DecodeParams::default()
        };
        assert!(decode_predictor(&[1, 2], &p).is_err());
    }

    #[test]
    fn test_from_dict_defaults() {
        let mut dict = Dict::new();
        dict.insert("Columns".to_string(), Object::Integer(5));
        let p = DecodeParams::from_dict(&dict);
        assert_eq!(p.columns, 5);
        assert_eq!(p.predictor, 1);
        assert_eq!(p.row_bytes(), 5);
    }
}
