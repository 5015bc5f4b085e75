//! Image transcoder (C3).
//!
//! Decodes the source image, strips all metadata, produces the four derived
//! variants (contain-fit scaled, webp-encoded) plus a re-encoded `original`,
//! and enforces a process-wide bound on concurrent transforms and a
//! per-image deadline. The re-encode through a real decoder is the primary
//! defense against polyglot payloads: whatever bytes followed the image
//! data in the upload simply aren't read by the decoder and can't survive
//! into the re-encoded output.

use image::{DynamicImage, ImageFormat};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::timeout;

use crate::db::models::VariantKind;
use crate::error::{AppError, AppResult};

/// WebP quality used for every derived (non-original) variant, fixed rather
/// than configurable so output size stays predictable.
const WEBP_QUALITY: f32 = 85.0;

const TRANSCODE_DEADLINE: Duration = Duration::from_secs(30);

/// Conservative multiplier from encoded byte size to estimated peak working
/// set (decode buffer plus a resized working copy) used to charge the
/// memory-budget semaphore before the real size is known. Deliberately
/// generous: a JPEG decodes to an RGBA8 buffer alone at roughly 10-20x its
/// compressed size, before any resize copies.
const DECODE_EXPANSION_FACTOR: u64 = 24;

/// Estimated working-set size in MiB for an `encoded_len`-byte input,
/// clamped to the full cap so a single large-but-valid upload (already
/// bounded by the validator's pixel-count gate) queues for the whole budget
/// rather than being rejected outright.
fn estimate_working_set_mb(encoded_len: usize, cap_mb: u32) -> u32 {
    let mb = (encoded_len as u64 * DECODE_EXPANSION_FACTOR) / (1024 * 1024);
    (mb.max(1) as u32).min(cap_mb)
}

pub struct EncodedVariant {
    pub kind: VariantKind,
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub format: &'static str,
}

pub struct TranscodeOutput {
    pub original_width: u32,
    pub original_height: u32,
    pub variants: Vec<EncodedVariant>,
}

/// Process-wide gates on concurrent transforms: one gate bounds the transform
/// *count* (spec §4.3: "bounded-parallelism pool (≤32 concurrent
/// transforms)"), the other bounds aggregate estimated memory (spec §4.3/§5:
/// "total memory cap (≈256 MiB working set)") — the two are independent,
/// since a handful of very large images can exhaust the memory budget well
/// under the concurrency ceiling. One instance is created at startup and
/// shared via `AppState`; it is not reentrant — callers observe contention as
/// latency, never as additional parallelism.
pub struct Transcoder {
    concurrency: Arc<Semaphore>,
    memory: Arc<Semaphore>,
    mem_cap_mb: u32,
}

impl Transcoder {
    pub fn new(concurrency: usize, mem_cap_mb: u64) -> Self {
        let mem_cap_mb = mem_cap_mb.max(1).min(u32::MAX as u64) as u32;
        Transcoder {
            concurrency: Arc::new(Semaphore::new(concurrency.max(1))),
            memory: Arc::new(Semaphore::new(mem_cap_mb as usize)),
            mem_cap_mb,
        }
    }

    /// Decodes `bytes`, produces every derived variant plus the re-encoded
    /// original, and returns them all. `detected_format` comes from the
    /// upload validator's magic-byte sniff and is used only to pick the
    /// original's re-encode container; the transcoder still independently
    /// decodes the bytes rather than trusting the caller's classification.
    pub async fn process(
        &self,
        bytes: Vec<u8>,
        detected_format: ImageFormat,
    ) -> AppResult<TranscodeOutput> {
        let estimated_mb = estimate_working_set_mb(bytes.len(), self.mem_cap_mb);

        let concurrency_permit = self
            .concurrency
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| AppError::Internal("transcoder semaphore closed".into()))?;
        let memory_permit = self
            .memory
            .clone()
            .acquire_many_owned(estimated_mb)
            .await
            .map_err(|_| AppError::Internal("transcoder memory semaphore closed".into()))?;

        let result = timeout(
            TRANSCODE_DEADLINE,
            tokio::task::spawn_blocking(move || {
                let _permits = (concurrency_permit, memory_permit);
                process_blocking(bytes, detected_format)
            }),
        )
        .await;

        match result {
            Ok(Ok(inner)) => inner,
            Ok(Err(join_err)) => Err(AppError::Internal(format!(
                "transcode task panicked: {join_err}"
            ))),
            Err(_) => Err(AppError::Internal("transcode timed out".into())),
        }
    }
}

fn process_blocking(bytes: Vec<u8>, detected_format: ImageFormat) -> AppResult<TranscodeOutput> {
    let img = image::load_from_memory(&bytes).map_err(|e| {
        tracing::debug!("decode failed: {e}");
        AppError::UnsupportedFormat
    })?;

    let (orig_w, orig_h) = (img.width(), img.height());

    let mut variants = Vec::with_capacity(5);

    for kind in VariantKind::derived_kinds() {
        let max_dim = kind.max_dimension().expect("derived kinds have a max dimension");
        let resized = resize_contain(&img, max_dim);
        let encoded = encode_webp(&resized)?;
        variants.push(EncodedVariant {
            kind,
            width: resized.width(),
            height: resized.height(),
            bytes: encoded,
            format: "webp",
        });
    }

    // Re-encode the original through the same decoder, which strips any
    // trailing/interleaved bytes the source file carried (spec §4.3e).
    let (original_bytes, original_format) = encode_original(&img, detected_format)?;
    variants.push(EncodedVariant {
        kind: VariantKind::Original,
        width: orig_w,
        height: orig_h,
        bytes: original_bytes,
        format: original_format,
    });

    Ok(TranscodeOutput {
        original_width: orig_w,
        original_height: orig_h,
        variants,
    })
}

/// Contain-fit scale to `max_dim` on the longer side, preserving aspect
/// ratio, never upscaling (spec §4.3c). If the source already fits, the
/// decoded (but not yet re-encoded) source is returned unchanged — the
/// caller still re-encodes it to webp, so metadata stripping still applies.
fn resize_contain(img: &DynamicImage, max_dim: u32) -> DynamicImage {
    if img.width() <= max_dim && img.height() <= max_dim {
        img.clone()
    } else {
        img.resize(max_dim, max_dim, image::imageops::FilterType::Lanczos3)
    }
}

/// The `webp` crate's encoder only accepts RGB8/RGBA8 input, so every
/// variant is normalized to RGBA8 first — this also discards any ICC/EXIF
/// metadata the `image` crate might otherwise have round-tripped.
fn encode_webp(img: &DynamicImage) -> AppResult<Vec<u8>> {
    let rgba = img.to_rgba8();
    let encoder = webp::Encoder::from_rgba(rgba.as_raw(), rgba.width(), rgba.height());
    let encoded = encoder.encode(WEBP_QUALITY);
    Ok(encoded.to_vec())
}

/// Re-encodes the original at full resolution in its source container
/// format (JPEG/PNG/GIF/WebP), stripping metadata along the way. GIF is
/// re-encoded as PNG: the `image` crate's GIF encoder only supports
/// single-frame output and a re-saved animated GIF would silently lose all
/// but the first frame, which is worse than being explicit about the format
/// change.
fn encode_original(img: &DynamicImage, detected_format: ImageFormat) -> AppResult<(Vec<u8>, &'static str)> {
    let mut buf = std::io::Cursor::new(Vec::new());
    let (format, label) = match detected_format {
        ImageFormat::Jpeg => (ImageFormat::Jpeg, "jpeg"),
        ImageFormat::Png => (ImageFormat::Png, "png"),
        ImageFormat::Gif => (ImageFormat::Png, "png"),
        ImageFormat::WebP => (ImageFormat::WebP, "webp"),
        _ => (ImageFormat::Png, "png"),
    };
    img.write_to(&mut buf, format)
        .map_err(|e| AppError::Internal(format!("failed to re-encode original: {e}")))?;
    Ok((buf.into_inner(), label))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_png(width: u32, height: u32) -> Vec<u8> {
        let img = DynamicImage::new_rgb8(width, height);
        let mut buf = std::io::Cursor::new(Vec::new());
        img.write_to(&mut buf, ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    #[test]
    fn working_set_estimate_is_clamped_to_the_cap() {
        // A 50 MiB encoded input would estimate well past a 16 MiB cap;
        // the estimate must clamp rather than exceed the semaphore's total
        // permits, or `acquire_many_owned` would block forever.
        let huge = 50 * 1024 * 1024;
        assert_eq!(estimate_working_set_mb(huge, 16), 16);
    }

    #[test]
    fn working_set_estimate_is_never_zero() {
        assert_eq!(estimate_working_set_mb(1, 256), 1);
    }

    #[tokio::test]
    async fn an_input_whose_estimate_exceeds_the_cap_still_completes() {
        // Cap is deliberately tiny relative to the sample image's encoded
        // size, exercising the clamp in `estimate_working_set_mb` end to end
        // rather than just unit-testing the pure function.
        let transcoder = Transcoder::new(1, 1);
        let bytes = sample_png(64, 64);
        let output = transcoder.process(bytes, ImageFormat::Png).await.unwrap();
        assert_eq!(output.variants.len(), 5);
    }

    #[tokio::test]
    async fn produces_all_five_variants_within_bounds() {
        let transcoder = Transcoder::new(4, 256);
        let bytes = sample_png(2048, 1536);
        let output = transcoder.process(bytes, ImageFormat::Png).await.unwrap();

        assert_eq!(output.original_width, 2048);
        assert_eq!(output.original_height, 1536);
        assert_eq!(output.variants.len(), 5);

        for variant in &output.variants {
            if variant.kind != VariantKind::Original {
                assert_eq!(variant.format, "webp");
                let max_dim = variant.kind.max_dimension().unwrap();
                assert!(variant.width <= max_dim && variant.height <= max_dim);
            }
        }
    }

    #[tokio::test]
    async fn never_upscales_a_small_source() {
        let transcoder = Transcoder::new(1, 256);
        let bytes = sample_png(50, 40);
        let output = transcoder.process(bytes, ImageFormat::Png).await.unwrap();

        let thumb = output
            .variants
            .iter()
            .find(|v| v.kind == VariantKind::Thumbnail)
            .unwrap();
        assert_eq!(thumb.width, 50);
        assert_eq!(thumb.height, 40);
    }

    #[tokio::test]
    async fn garbage_bytes_are_rejected_not_panicked() {
        let transcoder = Transcoder::new(1, 256);
        let err = transcoder
            .process(b"not an image".to_vec(), ImageFormat::Png)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::UnsupportedFormat));
    }
}
