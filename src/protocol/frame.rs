//! Frame codec for the transparent UART link.
//!
//! Outbound payloads are split into units that fit one characteristic write.
//! Inbound sensor payloads carry 16-bit samples as little-endian packed BCD:
//! the uppercase hex text of each byte pair, read high byte first, is the
//! decimal value of the sample. Nibbles `D`, `E` and `F` are also read the
//! way the peripheral's reference app reads them, as a type suffix or an
//! exponent marker (`"123F"` is 123, `"1E23"` is 1e23).
//!
//! ```text
//! bytes:   [0x34, 0x12]
//! hex:     "3412"
//! reorder: chars [2, 3, 0, 1] -> "1234"
//! sample:  1234.0
//! ```

use bytes::Bytes;

use crate::error::{Error, Result};

/// Source bytes per decoded sample.
pub const BYTES_PER_SAMPLE: usize = 2;

/// Samples carried by one sub-chunk.
pub const SAMPLES_PER_CHUNK: usize = 100;

/// Source bytes in one sub-chunk (400 hex characters).
pub const CHUNK_BYTES: usize = SAMPLES_PER_CHUNK * BYTES_PER_SAMPLE;

/// Payloads longer than this carry two sub-chunks back to back.
pub const DOUBLE_BURST_THRESHOLD: usize = CHUNK_BYTES;

/// Shape of an inbound payload, judged by its length alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadKind {
    /// Nothing received.
    Empty,
    /// One 100-sample sub-chunk.
    Single,
    /// Two 100-sample sub-chunks concatenated.
    Double,
}

impl PayloadKind {
    /// Classify a payload of `len` bytes.
    pub fn classify(len: usize) -> Self {
        match len {
            0 => Self::Empty,
            n if n > DOUBLE_BURST_THRESHOLD => Self::Double,
            _ => Self::Single,
        }
    }
}

/// Split `payload` into chunks of at most `unit_size` bytes.
///
/// An empty payload yields no chunks.
///
/// # Errors
///
/// Returns [`Error::InvalidParameter`] if `unit_size` is zero.
///
/// # Example
///
/// ```
/// use transparent_uart_ble::protocol::frame::encode;
///
/// let chunks = encode(b"hello world", 4).unwrap();
/// assert_eq!(chunks.len(), 3);
/// assert_eq!(&chunks[2][..], b"rld");
/// ```
pub fn encode(payload: &[u8], unit_size: usize) -> Result<Vec<Bytes>> {
    if unit_size == 0 {
        return Err(Error::InvalidParameter {
            name: "unit_size".to_string(),
            value: unit_size.to_string(),
        });
    }

    Ok(payload
        .chunks(unit_size)
        .map(Bytes::copy_from_slice)
        .collect())
}

const HEX_DIGITS: &[u8; 16] = b"0123456789ABCDEF";

/// Parse a 4-character sample literal.
///
/// Accepts decimal digits with an optional inner `E` exponent and an optional
/// trailing `F` or `D` type suffix, e.g. `"1234"`, `"123F"`, `"1E23"`,
/// `"1E2D"`. Anything else, including `A`-`C` and a leading `E`, is rejected.
fn parse_literal(text: &str) -> Option<f32> {
    let body = text
        .strip_suffix(|c| c == 'F' || c == 'D')
        .unwrap_or(text);

    let is_digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    let valid = match body.split_once('E') {
        Some((mantissa, exponent)) => is_digits(mantissa) && is_digits(exponent),
        None => is_digits(body),
    };

    if valid {
        body.parse::<f32>().ok()
    } else {
        None
    }
}

/// Decode one sample from a byte pair.
///
/// Returns `None` if the reordered hex text is not a numeric literal.
#[inline]
fn decode_pair(lo: u8, hi: u8) -> Option<f32> {
    let text = [
        HEX_DIGITS[usize::from(hi >> 4)],
        HEX_DIGITS[usize::from(hi & 0x0F)],
        HEX_DIGITS[usize::from(lo >> 4)],
        HEX_DIGITS[usize::from(lo & 0x0F)],
    ];
    std::str::from_utf8(&text).ok().and_then(parse_literal)
}

/// Decode every sample in `raw`.
///
/// # Errors
///
/// Returns [`Error::Framing`] if `raw` holds a partial sample or any
/// sample is not a numeric literal.
///
/// # Example
///
/// ```
/// use transparent_uart_ble::protocol::frame::decode_samples;
///
/// let samples = decode_samples(&[0x34, 0x12, 0x01, 0x01]).unwrap();
/// assert_eq!(samples, vec![1234.0, 101.0]);
/// ```
pub fn decode_samples(raw: &[u8]) -> Result<Vec<f32>> {
    if raw.len() % BYTES_PER_SAMPLE != 0 {
        return Err(Error::framing(format!(
            "{} bytes is not a whole number of {}-character samples",
            raw.len(),
            BYTES_PER_SAMPLE * 2
        )));
    }

    raw.chunks_exact(BYTES_PER_SAMPLE)
        .enumerate()
        .map(|(i, pair)| {
            decode_pair(pair[0], pair[1]).ok_or_else(|| {
                Error::framing(format!(
                    "sample {} \"{:02X}{:02X}\" is not numeric",
                    i, pair[1], pair[0]
                ))
            })
        })
        .collect()
}

/// Decode the `index`-th 100-sample sub-chunk of a payload.
///
/// # Errors
///
/// Returns [`Error::Framing`] if the payload is too short to hold the
/// sub-chunk or the sub-chunk does not decode.
pub fn decode_chunk(payload: &[u8], index: usize) -> Result<Vec<f32>> {
    let start = index * CHUNK_BYTES;
    let end = start + CHUNK_BYTES;
    let chunk = payload.get(start..end).ok_or_else(|| {
        Error::framing(format!(
            "sub-chunk {} needs bytes {}..{} but payload has {}",
            index,
            start,
            end,
            payload.len()
        ))
    })?;

    decode_samples(chunk)
}

/// Encode samples back into wire bytes.
///
/// Values are truncated to integers in `0..=9999`. Used to build test
/// payloads and loopback fixtures.
pub fn encode_samples(samples: &[u16]) -> Vec<u8> {
    fn bcd(v: u16) -> u8 {
        ((((v / 10) % 10) as u8) << 4) | (v % 10) as u8
    }

    samples
        .iter()
        .flat_map(|&s| {
            let s = s.min(9999);
            [bcd(s % 100), bcd(s / 100)]
        })
        .collect()
}
