// Image payload codec - lossless PNG encoding for transferred images

use crate::{MeshError, Result};
use image::{DynamicImage, ImageFormat};
use std::io::Cursor;

/// Encode an image into the PNG byte representation used on the wire.
pub fn encode_image(img: &DynamicImage) -> Result<Vec<u8>> {
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, ImageFormat::Png)
        .map_err(|e| MeshError::Codec(format!("encode failed: {}", e)))?;
    Ok(buf.into_inner())
}

/// Decode payload bytes back into an image. Malformed bytes are an error,
/// never a panic; callers surface the failure to the collaborator.
pub fn decode_image(bytes: &[u8]) -> Result<DynamicImage> {
    image::load_from_memory(bytes).map_err(|e| MeshError::Codec(format!("decode failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbaImage;

    fn sample_image() -> DynamicImage {
        let img = RgbaImage::from_fn(16, 12, |x, y| {
            image::Rgba([x as u8 * 10, y as u8 * 20, (x + y) as u8, 255])
        });
        DynamicImage::ImageRgba8(img)
    }

    #[test]
    fn test_encode_decode_roundtrip_is_lossless() {
        let original = sample_image();
        let bytes = encode_image(&original).unwrap();
        let decoded = decode_image(&bytes).unwrap();
        assert_eq!(original.to_rgba8(), decoded.to_rgba8());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let result = decode_image(b"definitely not an image");
        assert!(matches!(result, Err(MeshError::Codec(_))));
    }

    #[test]
    fn test_decode_rejects_truncated_payload() {
        let bytes = encode_image(&sample_image()).unwrap();
        let result = decode_image(&bytes[..bytes.len() / 2]);
        assert!(matches!(result, Err(MeshError::Codec(_))));
    }
}
