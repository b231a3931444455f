use chrono::{DateTime, Utc};
use image::{ImageReader, RgbaImage};
use std::io::Cursor;

/// One accepted snapshot for a place.
///
/// Frames are immutable once stored. `data` holds the PNG-encoded image as
/// persisted by the frame store; `sequence_id` is assigned by the store and
/// increases monotonically across all places.
#[derive(Debug, Clone)]
pub struct Frame {
    pub sequence_id: i64,
    pub place_id: i64,
    pub captured_at: DateTime<Utc>,
    /// Opaque submitter fingerprint (hashed client address, never a raw IP).
    pub submitter: String,
    /// PNG-encoded image bytes.
    pub data: Vec<u8>,
}

impl Frame {
    /// Decode the stored bytes into an RGBA pixel grid.
    pub fn decode(&self) -> Result<RgbaImage, CodecError> {
        decode_image(&self.data)
    }
}

/// Decode raw submitted bytes into an RGBA pixel grid.
///
/// The container format is guessed from the bytes, so submitters are not
/// limited to PNG even though frames are re-encoded as PNG on storage.
pub fn decode_image(bytes: &[u8]) -> Result<RgbaImage, CodecError> {
    let img = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| CodecError::Malformed(e.to_string()))?
        .decode()
        .map_err(|e| CodecError::Malformed(e.to_string()))?;
    Ok(img.to_rgba8())
}

/// Encode an RGBA pixel grid as PNG for storage.
pub fn encode_png(pixels: &RgbaImage) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::new();
    pixels
        .write_to(&mut Cursor::new(&mut out), image::ImageFormat::Png)
        .map_err(|e| CodecError::Encode(e.to_string()))?;
    Ok(out)
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("malformed image data: {0}")]
    Malformed(String),
    #[error("failed to encode image: {0}")]
    Encode(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    #[test]
    fn png_roundtrip() {
        let mut pixels = RgbaImage::from_pixel(2, 2, Rgba([10, 20, 30, 255]));
        pixels.put_pixel(1, 1, Rgba([200, 0, 100, 255]));

        let bytes = encode_png(&pixels).unwrap();
        let decoded = decode_image(&bytes).unwrap();
        assert_eq!(decoded, pixels);
    }

    #[test]
    fn garbage_bytes_are_malformed() {
        let err = decode_image(&[0xDE, 0xAD, 0xBE, 0xEF, 0x00, 0x01]).unwrap_err();
        assert!(matches!(err, CodecError::Malformed(_)));
    }

    #[test]
    fn empty_input_is_malformed() {
        assert!(matches!(decode_image(&[]), Err(CodecError::Malformed(_))));
    }

    #[test]
    fn frame_decode_uses_stored_bytes() {
        let pixels = RgbaImage::from_pixel(3, 1, Rgba([0, 0, 0, 255]));
        let frame = Frame {
            sequence_id: 1,
            place_id: 42,
            captured_at: Utc::now(),
            submitter: "abc123".into(),
            data: encode_png(&pixels).unwrap(),
        };
        assert_eq!(frame.decode().unwrap(), pixels);
    }
}
