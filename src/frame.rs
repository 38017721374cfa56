use std::io::Cursor;

use base64::{engine::general_purpose::STANDARD, Engine};
use image::{codecs::jpeg::JpegEncoder, RgbImage};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("empty frame")]
    Empty,
    #[error("invalid base64 frame: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("bad image: {0}")]
    Image(#[from] image::ImageError),
}

/// Turns an uploaded payload into an RGB raster.
///
/// Browsers post canvas captures as `data:image/jpeg;base64,...` URLs; other
/// clients send the encoded image as-is or as bare base64.
pub fn decode_frame(bytes: &[u8]) -> Result<RgbImage, DecodeError> {
    let bytes = trim_ascii(bytes);
    if bytes.is_empty() {
        return Err(DecodeError::Empty);
    }
    if let Some(payload) = strip_data_url(bytes) {
        return decode_raster(&STANDARD.decode(payload)?);
    }
    if image::guess_format(bytes).is_ok() {
        return decode_raster(bytes);
    }
    decode_raster(&STANDARD.decode(bytes)?)
}

fn decode_raster(bytes: &[u8]) -> Result<RgbImage, DecodeError> {
    if bytes.is_empty() {
        return Err(DecodeError::Empty);
    }
    Ok(image::load_from_memory(bytes)?.to_rgb8())
}

fn strip_data_url(bytes: &[u8]) -> Option<&[u8]> {
    if !bytes.starts_with(b"data:") {
        return None;
    }
    let comma = bytes.iter().position(|x| *x == b',')?;
    Some(&bytes[comma + 1..])
}

fn trim_ascii(mut bytes: &[u8]) -> &[u8] {
    while let [first, rest @ ..] = bytes {
        if !first.is_ascii_whitespace() {
            break;
        }
        bytes = rest;
    }
    while let [rest @ .., last] = bytes {
        if !last.is_ascii_whitespace() {
            break;
        }
        bytes = rest;
    }
    bytes
}

pub fn encode_jpeg(frame: &RgbImage, quality: u8) -> Result<Vec<u8>, image::ImageError> {
    let mut out = Cursor::new(Vec::new());
    JpegEncoder::new_with_quality(&mut out, quality).encode_image(frame)?;
    Ok(out.into_inner())
}
