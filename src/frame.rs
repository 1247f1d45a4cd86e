//! Decoding of camera frames uploaded as base64 or `data:` URLs.

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use image::{DynamicImage, ImageFormat};

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("not a decodable image: {0}")]
    Image(#[from] image::ImageError),
}

/// A decoded camera frame that still remembers its wire encoding.
pub struct Frame {
    pub image: DynamicImage,
    pub format: ImageFormat,
    base64: String,
}

impl Frame {
    /// Decodes a base64 payload, with or without a `data:<mime>;base64,` prefix.
    pub fn decode(payload: &str) -> Result<Self, FrameError> {
        // line-wrapped payloads are common, so whitespace is dropped
        let base64: String = strip_data_url(payload)
            .chars()
            .filter(|c| !c.is_ascii_whitespace())
            .collect();
        let bytes = BASE64.decode(&base64)?;
        let format = image::guess_format(&bytes)?;
        let image = image::load_from_memory_with_format(&bytes, format)?;

        Ok(Self {
            image,
            format,
            base64,
        })
    }

    /// `data:` URL suitable for a hosted multimodal model.
    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.format.to_mime_type(), self.base64)
    }
}

/// Drops everything up to and including the first comma, if any.
pub fn strip_data_url(payload: &str) -> &str {
    payload
        .split_once(',')
        .map_or(payload, |(_, data)| data)
        .trim()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use std::io::Cursor;

    fn red_png_base64() -> String {
        let mut bytes = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(RgbImage::from_pixel(1, 1, Rgb([255, 0, 0])))
            .write_to(&mut bytes, ImageFormat::Png)
            .unwrap();
        BASE64.encode(bytes.into_inner())
    }

    #[test]
    fn test_strip_data_url() {
        assert_eq!(strip_data_url("data:image/png;base64,AAAA"), "AAAA");
        assert_eq!(strip_data_url("AAAA"), "AAAA");
        assert_eq!(strip_data_url("a,b,c"), "b,c");
    }

    #[test]
    fn test_decode_plain_base64() {
        let frame = Frame::decode(&red_png_base64()).unwrap();
        assert_eq!(frame.format, ImageFormat::Png);
        assert_eq!((frame.image.width(), frame.image.height()), (1, 1));
        assert_eq!(frame.image.to_rgb8().get_pixel(0, 0), &Rgb([255, 0, 0]));
    }

    #[test]
    fn test_decode_data_url_and_rebuild() {
        let payload = format!("data:image/jpeg;base64,{}", red_png_base64());
        let frame = Frame::decode(&payload).unwrap();
        // the advertised mime comes from the bytes, not from the client
        assert_eq!(
            frame.data_url(),
            format!("data:image/png;base64,{}", red_png_base64())
        );
    }

    #[test]
    fn test_decode_line_wrapped_base64() {
        let plain = red_png_base64();
        let wrapped = plain
            .as_bytes()
            .chunks(16)
            .map(|line| std::str::from_utf8(line).unwrap())
            .collect::<Vec<_>>()
            .join("\r\n");
        let frame = Frame::decode(&format!("data:image/png;base64,{wrapped}\n")).unwrap();
        assert_eq!(frame.format, ImageFormat::Png);
        assert_eq!(frame.data_url(), format!("data:image/png;base64,{plain}"));
    }

    #[test]
    fn test_invalid_base64() {
        assert!(matches!(
            Frame::decode("not-valid-base64!!!"),
            Err(FrameError::Base64(_))
        ));
    }

    #[test]
    fn test_not_an_image() {
        let payload = BASE64.encode(b"hello, definitely not pixels");
        assert!(matches!(Frame::decode(&payload), Err(FrameError::Image(_))));
    }
}
