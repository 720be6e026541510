//! 图片重新编码：按内容识别格式，统一压缩为固定质量的 JPEG。

use bytes::Bytes;
use image::ImageFormat;
use image::codecs::jpeg::JpegEncoder;
use thiserror::Error;

use crate::config::ImagePolicy;

pub const NORMALIZED_MIME: &str = "image/jpeg";

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("unable to decode image: {0}")]
    Decode(String),
    #[error("unable to compress image: {0}")]
    Encode(String),
}

#[derive(Clone, Copy, Debug)]
pub struct ImageNormalizer {
    policy: ImagePolicy,
    quality: u8,
}

impl ImageNormalizer {
    pub fn new(policy: ImagePolicy, quality: u8) -> Self {
        Self {
            policy,
            quality: quality.clamp(1, 100),
        }
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }

    /// 仅在策略允许且内容识别为图片时才需要重新编码。
    pub fn applies_to(&self, data: &[u8]) -> bool {
        self.policy == ImagePolicy::Compress && sniff(data).is_some()
    }

    /// 解码任意支持的图片格式并以 JPEG 重新编码，丢弃原格式与元数据。
    pub fn normalize(&self, data: &[u8]) -> Result<Bytes, NormalizeError> {
        let decoded =
            image::load_from_memory(data).map_err(|err| NormalizeError::Decode(err.to_string()))?;
        // JPEG has no alpha channel.
        let rgb = decoded.to_rgb8();

        let mut buf = Vec::new();
        JpegEncoder::new_with_quality(&mut buf, self.quality)
            .encode_image(&rgb)
            .map_err(|err| NormalizeError::Encode(err.to_string()))?;
        Ok(Bytes::from(buf))
    }
}

/// BITMAPCOREHEADER 到 BITMAPV5HEADER 的合法 DIB 头长度。
const BMP_DIB_HEADER_SIZES: [u32; 7] = [12, 40, 52, 56, 64, 108, 124];

/// 根据文件头识别图片格式，不参考扩展名。
///
/// 只接受签名足够长的格式；`BM`、`P1` 这类两字节前缀在普通文本里很常见，
/// BMP 需额外校验 DIB 头长度，PNM 等格式不参与识别。
pub fn sniff(data: &[u8]) -> Option<ImageFormat> {
    let format = image::guess_format(data).ok()?;
    match format {
        ImageFormat::Png
        | ImageFormat::Jpeg
        | ImageFormat::Gif
        | ImageFormat::WebP
        | ImageFormat::Tiff => Some(format),
        ImageFormat::Bmp if has_bmp_header(data) => Some(format),
        _ => None,
    }
}

fn has_bmp_header(data: &[u8]) -> bool {
    let Some(size) = data.get(14..18) else {
        return false;
    };
    let dib_size = u32::from_le_bytes([size[0], size[1], size[2], size[3]]);
    BMP_DIB_HEADER_SIZES.contains(&dib_size)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::{DynamicImage, Rgb, RgbImage, Rgba, RgbaImage};
    use std::io::Cursor;

    pub(crate) fn sample_image(format: ImageFormat) -> Vec<u8> {
        let img = RgbImage::from_fn(16, 12, |x, y| Rgb([(x * 15) as u8, (y * 20) as u8, 128]));
        let mut cursor = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img)
            .write_to(&mut cursor, format)
            .expect("encode sample");
        cursor.into_inner()
    }

    pub(crate) fn corrupt_png() -> Vec<u8> {
        let mut data = b"\x89PNG\r\n\x1a\n".to_vec();
        data.extend_from_slice(b"definitely not image data");
        data
    }

    #[test]
    fn png_is_reencoded_as_jpeg() {
        let normalizer = ImageNormalizer::new(ImagePolicy::Compress, 90);
        let png = sample_image(ImageFormat::Png);
        assert!(normalizer.applies_to(&png));

        let out = normalizer.normalize(&png).expect("normalize");
        assert_eq!(sniff(&out), Some(ImageFormat::Jpeg));
        let decoded = image::load_from_memory(&out).expect("decode output");
        assert_eq!((decoded.width(), decoded.height()), (16, 12));
    }

    #[test]
    fn normalize_is_deterministic() {
        let normalizer = ImageNormalizer::new(ImagePolicy::Compress, 90);
        let jpeg = sample_image(ImageFormat::Jpeg);
        let first = normalizer.normalize(&jpeg).expect("first");
        let second = normalizer.normalize(&jpeg).expect("second");
        assert_eq!(first, second);
    }

    #[test]
    fn transparent_image_is_flattened() {
        let img = RgbaImage::from_pixel(4, 4, Rgba([10, 20, 30, 0]));
        let mut cursor = Cursor::new(Vec::new());
        DynamicImage::ImageRgba8(img)
            .write_to(&mut cursor, ImageFormat::Png)
            .expect("encode rgba");

        let normalizer = ImageNormalizer::new(ImagePolicy::Compress, 90);
        let out = normalizer.normalize(cursor.get_ref()).expect("normalize rgba");
        assert_eq!(sniff(&out), Some(ImageFormat::Jpeg));
    }

    #[test]
    fn strong_signature_formats_are_recognized() {
        for format in [
            ImageFormat::Png,
            ImageFormat::Jpeg,
            ImageFormat::Tiff,
            ImageFormat::Bmp,
        ] {
            assert_eq!(sniff(&sample_image(format)), Some(format), "{format:?}");
        }
        assert_eq!(sniff(&sample_image(ImageFormat::Pnm)), None);
    }

    #[test]
    fn corrupt_image_is_decode_error() {
        let normalizer = ImageNormalizer::new(ImagePolicy::Compress, 90);
        let data = corrupt_png();
        assert!(normalizer.applies_to(&data));
        assert!(matches!(
            normalizer.normalize(&data),
            Err(NormalizeError::Decode(_))
        ));
    }

    #[test]
    fn non_images_and_passthrough_policy_bypass_normalizer() {
        let compress = ImageNormalizer::new(ImagePolicy::Compress, 90);
        assert!(!compress.applies_to(b"%PDF-1.7 plain document"));
        assert!(!compress.applies_to(b"hello, world"));

        assert!(!compress.applies_to(b"BMI report for 2024\n"));
        assert!(!compress.applies_to(b"P1 meeting notes\n"));
        assert!(!compress.applies_to(b"P6 quarterly numbers,42\n"));

        let passthrough = ImageNormalizer::new(ImagePolicy::Passthrough, 90);
        assert!(!passthrough.applies_to(&sample_image(ImageFormat::Png)));
    }
}
