//! Upload validator (C4) — the ordered, fail-closed rejection funnel from
//! spec §4.4: size → magic bytes → dimensions/pixel count → malware scan →
//! filename sanitization. Each stage either returns or stops the pipeline;
//! no partial state survives a rejection.

use std::io::Cursor;
use std::sync::Arc;

use image::ImageFormat;

use crate::error::{AppError, AppResult};
use crate::scanner::{MalwareScanner, ScanOutcome};

pub struct ValidatedUpload {
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
    pub sanitized_filename: String,
}

pub struct UploadValidator {
    scanner: Arc<dyn MalwareScanner>,
    max_bytes: u64,
    max_dimension: u32,
    max_pixels: u64,
}

impl UploadValidator {
    pub fn new(
        scanner: Arc<dyn MalwareScanner>,
        max_bytes: u64,
        max_dimension: u32,
        max_pixels: u64,
    ) -> Self {
        UploadValidator {
            scanner,
            max_bytes,
            max_dimension,
            max_pixels,
        }
    }

    pub async fn validate(&self, bytes: &[u8], filename: &str) -> AppResult<ValidatedUpload> {
        // 1. Size gate.
        let size = bytes.len() as u64;
        if size == 0 || size > self.max_bytes {
            return Err(AppError::PayloadTooLarge);
        }

        // 2. Magic-byte gate. The filename extension is advisory only — it
        //    never participates in this decision (spec §4.4, P5).
        let format = sniff_format(bytes).ok_or(AppError::UnsupportedFormat)?;

        // 3. Dimension gate. Reads only the header, not the full pixel
        //    buffer — cheap enough to run before the malware scan.
        let (width, height) = read_dimensions(bytes, format)?;
        if width > self.max_dimension || height > self.max_dimension {
            return Err(AppError::ImageTooLarge(format!(
                "dimensions {width}x{height} exceed the {} px limit",
                self.max_dimension
            )));
        }
        let pixels = width as u64 * height as u64;
        if pixels > self.max_pixels {
            return Err(AppError::ImageTooLarge(format!(
                "{pixels} pixels exceeds the {} pixel limit",
                self.max_pixels
            )));
        }

        // 4. Malware scan. `error` is explicitly not equivalent to clean —
        //    the upload is rejected either way, but the caller/client can
        //    distinguish a retryable 503 from a terminal 422.
        match self.scanner.scan(bytes).await {
            ScanOutcome::Clean => {}
            ScanOutcome::Infected { signature_name } => {
                return Err(AppError::MalwareDetected(signature_name));
            }
            ScanOutcome::Error { .. } => {
                return Err(AppError::ScanUnavailable);
            }
        }

        // 5. Filename sanitization.
        let sanitized_filename = sanitize_filename(filename);

        Ok(ValidatedUpload {
            format,
            width,
            height,
            sanitized_filename,
        })
    }
}

/// Classifies `bytes` by magic-byte signature per spec §4.4. Requires at
/// least 12 bytes; anything shorter or unrecognized is `None` (unsupported).
fn sniff_format(bytes: &[u8]) -> Option<ImageFormat> {
    if bytes.len() < 12 {
        return None;
    }
    if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return Some(ImageFormat::Jpeg);
    }
    if bytes.starts_with(&[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A]) {
        return Some(ImageFormat::Png);
    }
    if bytes.starts_with(&[0x47, 0x49, 0x46, 0x38]) {
        return Some(ImageFormat::Gif);
    }
    if &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        return Some(ImageFormat::WebP);
    }
    None
}

/// Reads the image header to recover width/height without decoding the full
/// pixel buffer (spec §4.4 stage 3). Any decode error here means the magic
/// bytes lied about the real format — treated as `unsupported_format`,
/// matching the dimension gate's fail-closed posture.
fn read_dimensions(bytes: &[u8], format: ImageFormat) -> AppResult<(u32, u32)> {
    let mut reader = image::ImageReader::new(Cursor::new(bytes));
    reader.set_format(format);
    reader
        .into_dimensions()
        .map_err(|_| AppError::UnsupportedFormat)
}

/// Strips directory separators, NUL bytes, and control characters, then
/// truncates to 255 bytes of UTF-8 on a char boundary (spec §4.4 stage 5).
fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| !matches!(c, '/' | '\\' | '\0') && !c.is_control())
        .collect();

    if cleaned.len() <= 255 {
        return cleaned;
    }
    let mut truncate_at = 255;
    while !cleaned.is_char_boundary(truncate_at) {
        truncate_at -= 1;
    }
    cleaned[..truncate_at].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::ScanErrorKind;
    use async_trait::async_trait;

    struct FixedScanner(ScanOutcome);

    #[async_trait]
    impl MalwareScanner for FixedScanner {
        async fn scan(&self, _bytes: &[u8]) -> ScanOutcome {
            self.0.clone()
        }
    }

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = image::DynamicImage::new_rgb8(width, height);
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    fn validator(scanner: ScanOutcome) -> UploadValidator {
        UploadValidator::new(Arc::new(FixedScanner(scanner)), 10 * 1024 * 1024, 8192, 100_000_000)
    }

    #[tokio::test]
    async fn rejects_empty_upload() {
        let v = validator(ScanOutcome::Clean);
        let err = v.validate(&[], "a.png").await.unwrap_err();
        assert!(matches!(err, AppError::PayloadTooLarge));
    }

    #[tokio::test]
    async fn rejects_mismatched_magic_bytes_regardless_of_extension() {
        // PE header bytes disguised as a .png — spec P5 / S4.
        let v = validator(ScanOutcome::Clean);
        let mut bytes = vec![0x4D, 0x5A];
        bytes.extend(std::iter::repeat(0).take(20));
        let err = v.validate(&bytes, "photo.png").await.unwrap_err();
        assert!(matches!(err, AppError::UnsupportedFormat));
    }

    #[tokio::test]
    async fn rejects_pixel_bomb() {
        let v = validator(ScanOutcome::Clean);
        let bytes = png_bytes(9000, 1);
        let err = v.validate(&bytes, "wide.png").await.unwrap_err();
        assert!(matches!(err, AppError::ImageTooLarge(_)));
    }

    #[tokio::test]
    async fn accepts_a_valid_small_png() {
        let v = validator(ScanOutcome::Clean);
        let bytes = png_bytes(100, 80);
        let validated = v.validate(&bytes, "../../evil\0.png").await.unwrap();
        assert_eq!(validated.width, 100);
        assert_eq!(validated.height, 80);
        assert_eq!(validated.sanitized_filename, "....evil.png");
    }

    #[tokio::test]
    async fn infected_scan_is_rejected_with_signature() {
        let v = validator(ScanOutcome::Infected {
            signature_name: "Eicar-Test-Signature".to_string(),
        });
        let bytes = png_bytes(10, 10);
        let err = v.validate(&bytes, "evil.png").await.unwrap_err();
        assert!(matches!(err, AppError::MalwareDetected(_)));
    }

    #[tokio::test]
    async fn scan_error_is_not_treated_as_clean() {
        let v = validator(ScanOutcome::Error {
            kind: ScanErrorKind::Unreachable,
        });
        let bytes = png_bytes(10, 10);
        let err = v.validate(&bytes, "photo.png").await.unwrap_err();
        assert!(matches!(err, AppError::ScanUnavailable));
    }
}
