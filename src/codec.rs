//! Conversion between response payloads and raster images.

use image::{DynamicImage, ImageFormat, RgbaImage};
use std::io::Cursor;
use tracing::{debug, warn};

/// What a response payload looks like before any comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Image(ImageFormat),
    Text,
    Empty,
}

/// Classify a payload by its magic bytes without decoding it.
pub fn sniff(bytes: &[u8]) -> PayloadKind {
    if bytes.is_empty() {
        return PayloadKind::Empty;
    }
    match image::guess_format(bytes) {
        Ok(format) => PayloadKind::Image(format),
        Err(_) => PayloadKind::Text,
    }
}

/// Decode a PNG/JPEG/GIF payload into RGBA pixels. `None` means the
/// payload should be treated as text.
pub fn decode(bytes: &[u8]) -> Option<RgbaImage> {
    if bytes.is_empty() {
        return None;
    }
    match image::load_from_memory(bytes) {
        Ok(img) => Some(img.to_rgba8()),
        Err(err) => {
            debug!("payload is not a decodable image: {}", err);
            None
        }
    }
}

/// Encode an image as PNG. Returns an empty buffer if the encoder
/// fails, which only happens on allocation or I/O errors.
pub fn encode(img: &RgbaImage) -> Vec<u8> {
    let mut buf = Cursor::new(Vec::new());
    if let Err(err) =
        DynamicImage::ImageRgba8(img.clone()).write_to(&mut buf, ImageFormat::Png)
    {
        warn!("failed to encode image as PNG: {}", err);
        return Vec::new();
    }
    buf.into_inner()
}

/// Text payloads are equal only when their bytes are identical.
pub fn text_eq(a: &[u8], b: &[u8]) -> bool {
    a == b
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    fn sample() -> RgbaImage {
        RgbaImage::from_fn(7, 5, |x, y| {
            Rgba([(x * 30) as u8, (y * 50) as u8, ((x + y) * 10) as u8, 255])
        })
    }

    #[test]
    fn test_encode_decode_is_pixel_identical() {
        let img = sample();
        let bytes = encode(&img);
        assert!(!bytes.is_empty());
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded.dimensions(), img.dimensions());
        assert_eq!(decoded.as_raw(), img.as_raw());
    }

    #[test]
    fn test_text_is_not_an_image() {
        let xml = b"<?xml version=\"1.0\"?><ServiceExceptionReport/>";
        assert!(decode(xml).is_none());
        assert_eq!(sniff(xml), PayloadKind::Text);
    }

    #[test]
    fn test_empty_payload() {
        assert!(decode(&[]).is_none());
        assert_eq!(sniff(&[]), PayloadKind::Empty);
    }

    #[test]
    fn test_sniff_png() {
        let bytes = encode(&sample());
        assert_eq!(sniff(&bytes), PayloadKind::Image(ImageFormat::Png));
    }

    #[test]
    fn test_truncated_png_is_text() {
        let bytes = encode(&sample());
        assert!(decode(&bytes[..bytes.len() / 2]).is_none());
    }

    #[test]
    fn test_text_eq() {
        assert!(text_eq(b"abc", b"abc"));
        assert!(!text_eq(b"abc", b"abd"));
    }

    #[test]
    fn test_text_eq_invalid_utf8_is_byte_exact() {
        assert!(!text_eq(b"ok\xff", b"ok\xfe"));
        assert!(text_eq(b"ok\xff", b"ok\xff"));
    }
}
