use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use bytefit_core::{CoreError, OutputFormat};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];
const JPEG_COM: [u8; 2] = [0xFF, 0xFE];
/// Marker plus the two length bytes.
const JPEG_SEGMENT_OVERHEAD: u64 = 4;
/// The length field counts itself, so a segment carries at most this much.
pub const JPEG_COMMENT_MAX_PAYLOAD: u64 = u16::MAX as u64 - 2;

const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
const PNG_IEND_CHUNK_LEN: usize = 12;
/// Length, type and CRC fields.
const PNG_CHUNK_OVERHEAD: u64 = 12;
const PNG_TEXT_KEYWORD: &[u8] = b"Comment\0";
const PNG_MAX_CHUNK_DATA: u64 = i32::MAX as u64;

const FILLER: u8 = b' ';

#[derive(Debug, Error)]
pub enum PadError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to replace {path}: {message}")]
    Persist { path: String, message: String },
}

impl From<PadError> for CoreError {
    fn from(err: PadError) -> Self {
        CoreError::Io(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PaddingStrategy {
    None,
    JpegComment,
    PngText,
    TrailingZeros,
}

#[derive(Debug, Clone)]
pub struct Padded {
    pub buffer: Vec<u8>,
    pub strategy: PaddingStrategy,
    pub metadata_bytes: u64,
    pub trailing_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PadReport {
    pub initial_size: u64,
    pub final_size: u64,
    pub target: u64,
    pub strategy: PaddingStrategy,
    pub metadata_bytes: u64,
    pub trailing_bytes: u64,
}

pub fn within_tolerance(size: u64, target: u64, tolerance: u64) -> bool {
    size.abs_diff(target) <= tolerance
}

/// Grows `buffer` to exactly `target` bytes without breaking the image.
///
/// JPEG gets COM segments after SOI and any leading APP0/APP1 segments, PNG gets tEXt chunks before
/// IEND. Everything else, and any remainder too small for a segment, is
/// zero-filled after the end of the stream. Buffers already at or above the
/// target are returned untouched.
pub fn pad_buffer(buffer: Vec<u8>, format: OutputFormat, target: u64) -> Padded {
    let current = buffer.len() as u64;
    if current >= target {
        return Padded {
            buffer,
            strategy: PaddingStrategy::None,
            metadata_bytes: 0,
            trailing_bytes: 0,
        };
    }
    let needed = target - current;

    let embedded = match format {
        OutputFormat::Jpeg => embed_jpeg_comments(&buffer, needed).map(|b| (b, PaddingStrategy::JpegComment)),
        OutputFormat::Png => embed_png_text(&buffer, needed).map(|b| (b, PaddingStrategy::PngText)),
        OutputFormat::Webp => None,
    };
    let (mut padded, strategy) = embedded.unwrap_or((buffer, PaddingStrategy::TrailingZeros));
    let metadata_bytes = padded.len() as u64 - current;

    let short = target.saturating_sub(padded.len() as u64);
    if short > 0 {
        padded.resize(target as usize, 0);
    }

    Padded {
        buffer: padded,
        strategy,
        metadata_bytes,
        trailing_bytes: short,
    }
}

/// Splits `needed` into COM segment sizes, never leaving a remainder that is
/// non-zero but smaller than an empty segment.
fn jpeg_segment_sizes(needed: u64) -> Vec<u64> {
    let max_segment = JPEG_COMMENT_MAX_PAYLOAD + JPEG_SEGMENT_OVERHEAD;
    let mut sizes = Vec::new();
    let mut remaining = needed;
    while remaining >= JPEG_SEGMENT_OVERHEAD {
        let mut total = remaining.min(max_segment);
        let rest = remaining - total;
        if rest > 0 && rest < JPEG_SEGMENT_OVERHEAD {
            total -= JPEG_SEGMENT_OVERHEAD - rest;
        }
        sizes.push(total);
        remaining -= total;
    }
    sizes
}

fn embed_jpeg_comments(buffer: &[u8], needed: u64) -> Option<Vec<u8>> {
    if buffer.len() < 2 || buffer[..2] != JPEG_SOI {
        return None;
    }
    let sizes = jpeg_segment_sizes(needed);
    if sizes.is_empty() {
        return None;
    }

    let at = leading_app_segments_end(buffer);
    let mut out = Vec::with_capacity(buffer.len() + needed as usize);
    out.extend_from_slice(&buffer[..at]);
    for total in sizes {
        let payload = total - JPEG_SEGMENT_OVERHEAD;
        out.extend_from_slice(&JPEG_COM);
        out.extend_from_slice(&((payload + 2) as u16).to_be_bytes());
        out.resize(out.len() + payload as usize, FILLER);
    }
    out.extend_from_slice(&buffer[at..]);
    Some(out)
}

/// Offset just past SOI and the JFIF/Exif application segments that must
/// stay first in the stream.
fn leading_app_segments_end(buffer: &[u8]) -> usize {
    let mut pos = JPEG_SOI.len();
    while pos + 4 <= buffer.len() && buffer[pos] == 0xFF && matches!(buffer[pos + 1], 0xE0 | 0xE1) {
        let len = u16::from_be_bytes([buffer[pos + 2], buffer[pos + 3]]) as usize;
        let next = pos + 2 + len;
        if len < 2 || next > buffer.len() {
            break;
        }
        pos = next;
    }
    pos
}

fn png_text_chunk(data_len: u64) -> Vec<u8> {
    let mut data = Vec::with_capacity(data_len as usize);
    data.extend_from_slice(PNG_TEXT_KEYWORD);
    data.resize(data_len as usize, FILLER);

    let mut crc = flate2::Crc::new();
    crc.update(b"tEXt");
    crc.update(&data);

    let mut chunk = Vec::with_capacity(data.len() + PNG_CHUNK_OVERHEAD as usize);
    chunk.extend_from_slice(&(data_len as u32).to_be_bytes());
    chunk.extend_from_slice(b"tEXt");
    chunk.extend_from_slice(&data);
    chunk.extend_from_slice(&crc.sum().to_be_bytes());
    chunk
}

fn embed_png_text(buffer: &[u8], needed: u64) -> Option<Vec<u8>> {
    let min_chunk = PNG_CHUNK_OVERHEAD + PNG_TEXT_KEYWORD.len() as u64;
    if needed < min_chunk || buffer.len() < PNG_SIGNATURE.len() + PNG_IEND_CHUNK_LEN || buffer[..8] != PNG_SIGNATURE {
        return None;
    }
    let iend_at = buffer.len() - PNG_IEND_CHUNK_LEN;
    if &buffer[iend_at + 4..iend_at + 8] != b"IEND" {
        return None;
    }

    let mut out = Vec::with_capacity(buffer.len() + needed as usize);
    out.extend_from_slice(&buffer[..iend_at]);
    let mut remaining = needed;
    while remaining >= min_chunk {
        let data_len = (remaining - PNG_CHUNK_OVERHEAD).min(PNG_MAX_CHUNK_DATA);
        out.extend_from_slice(&png_text_chunk(data_len));
        remaining -= data_len + PNG_CHUNK_OVERHEAD;
    }
    out.extend_from_slice(&buffer[iend_at..]);
    Some(out)
}

/// Replaces `path` with `bytes` through a temporary file in the same
/// directory, so readers never observe a partial file.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), PadError> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => std::env::current_dir()?,
    };
    fs::create_dir_all(&dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|err| PadError::Persist {
        path: path.display().to_string(),
        message: err.error.to_string(),
    })?;
    Ok(())
}

/// Pads the file at `path` up to `target` bytes in place.
pub fn pad_file(path: &Path, format: OutputFormat, target: u64) -> Result<PadReport, PadError> {
    let buffer = fs::read(path)?;
    let initial_size = buffer.len() as u64;
    if initial_size >= target {
        return Ok(PadReport {
            initial_size,
            final_size: initial_size,
            target,
            strategy: PaddingStrategy::None,
            metadata_bytes: 0,
            trailing_bytes: 0,
        });
    }
    write_padded(path, buffer, format, target)
}

/// Pads `buffer` in memory and writes it to `path` in one replace, then
/// checks the on-disk length and zero-fills any shortfall.
pub fn write_padded(path: &Path, buffer: Vec<u8>, format: OutputFormat, target: u64) -> Result<PadReport, PadError> {
    let initial_size = buffer.len() as u64;
    let padded = pad_buffer(buffer, format, target);
    write_atomic(path, &padded.buffer)?;

    let mut trailing_bytes = padded.trailing_bytes;
    let mut final_size = fs::metadata(path)?.len();
    if final_size < target {
        let residual = target - final_size;
        tracing::warn!(residual, path = %path.display(), "padding came up short, appending zeros");
        let mut file = OpenOptions::new().append(true).open(path)?;
        file.write_all(&vec![0u8; residual as usize])?;
        file.sync_all()?;
        trailing_bytes += residual;
        final_size = fs::metadata(path)?.len();
    }

    if padded.strategy != PaddingStrategy::None {
        tracing::info!(
            initial_size,
            final_size,
            target,
            strategy = ?padded.strategy,
            "padded output to target size"
        );
    }
    Ok(PadReport {
        initial_size,
        final_size,
        target,
        strategy: padded.strategy,
        metadata_bytes: padded.metadata_bytes,
        trailing_bytes,
    })
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use image::{DynamicImage, ImageBuffer, ImageFormat, Rgb};

    use super::*;

    fn sample(format: ImageFormat) -> Vec<u8> {
        let img = ImageBuffer::from_fn(32, 24, |x, y| Rgb([(x * 8) as u8, (y * 10) as u8, 128]));
        let mut out = Vec::new();
        DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut out), format)
            .expect("encode sample");
        out
    }

    #[test]
    fn jpeg_padding_uses_comment_segments_and_still_decodes() {
        let jpeg = sample(ImageFormat::Jpeg);
        let target = jpeg.len() as u64 + 1_000;
        let padded = pad_buffer(jpeg, OutputFormat::Jpeg, target);
        assert_eq!(padded.buffer.len() as u64, target);
        assert_eq!(padded.strategy, PaddingStrategy::JpegComment);
        assert_eq!(padded.trailing_bytes, 0);
        let at = leading_app_segments_end(&padded.buffer);
        assert_eq!(&padded.buffer[at..at + 2], &JPEG_COM);
        let decoded = image::load_from_memory(&padded.buffer).expect("padded jpeg decodes");
        assert_eq!((decoded.width(), decoded.height()), (32, 24));
    }

    #[test]
    fn jpeg_comments_follow_jfif_and_exif_headers() {
        let mut stream = JPEG_SOI.to_vec();
        stream.extend_from_slice(&[0xFF, 0xE0, 0x00, 0x06, b'J', b'F', b'I', b'F']);
        stream.extend_from_slice(&[0xFF, 0xE1, 0x00, 0x04, 0xAA, 0xBB]);
        stream.extend_from_slice(&[0xFF, 0xDB, 0x00, 0x02, 0xFF, 0xD9]);
        assert_eq!(leading_app_segments_end(&stream), 16);

        let padded = pad_buffer(stream.clone(), OutputFormat::Jpeg, stream.len() as u64 + 10);
        assert_eq!(padded.strategy, PaddingStrategy::JpegComment);
        assert_eq!(&padded.buffer[..16], &stream[..16]);
        assert_eq!(&padded.buffer[16..18], &JPEG_COM);
        assert_eq!(&padded.buffer[26..], &stream[16..]);
    }

    #[test]
    fn truncated_app_segment_keeps_comments_after_soi() {
        let stream = vec![0xFF, 0xD8, 0xFF, 0xE0, 0x40, 0x00, 0x01];
        assert_eq!(leading_app_segments_end(&stream), 2);
    }

    #[test]
    fn webp_trailing_zeros_still_decode() {
        let webp = sample(ImageFormat::WebP);
        let target = webp.len() as u64 + 300;
        let padded = pad_buffer(webp, OutputFormat::Webp, target);
        assert_eq!(padded.buffer.len() as u64, target);
        assert_eq!(padded.strategy, PaddingStrategy::TrailingZeros);
        assert_eq!(padded.trailing_bytes, 300);
        let decoded = image::load_from_memory(&padded.buffer).expect("padded webp decodes");
        assert_eq!((decoded.width(), decoded.height()), (32, 24));
    }

    #[test]
    fn jpeg_padding_spans_multiple_segments() {
        let jpeg = sample(ImageFormat::Jpeg);
        let target = jpeg.len() as u64 + 200_000;
        let padded = pad_buffer(jpeg, OutputFormat::Jpeg, target);
        assert_eq!(padded.buffer.len() as u64, target);
        assert_eq!(padded.metadata_bytes, 200_000);
        image::load_from_memory(&padded.buffer).expect("padded jpeg decodes");
    }

    #[test]
    fn jpeg_segment_split_never_strands_a_tiny_remainder() {
        let needed = JPEG_COMMENT_MAX_PAYLOAD + JPEG_SEGMENT_OVERHEAD + 2;
        let sizes = jpeg_segment_sizes(needed);
        assert_eq!(sizes.iter().sum::<u64>(), needed);
        assert!(sizes.iter().all(|s| *s >= JPEG_SEGMENT_OVERHEAD));
        assert!(sizes.iter().all(|s| *s <= JPEG_COMMENT_MAX_PAYLOAD + JPEG_SEGMENT_OVERHEAD));
    }

    #[test]
    fn jpeg_remainder_below_segment_size_is_zero_filled() {
        let jpeg = sample(ImageFormat::Jpeg);
        let target = jpeg.len() as u64 + 3;
        let padded = pad_buffer(jpeg, OutputFormat::Jpeg, target);
        assert_eq!(padded.buffer.len() as u64, target);
        assert_eq!(padded.strategy, PaddingStrategy::TrailingZeros);
        assert_eq!(padded.trailing_bytes, 3);
    }

    #[test]
    fn png_padding_inserts_text_chunk_before_iend() {
        let png = sample(ImageFormat::Png);
        let target = png.len() as u64 + 500;
        let padded = pad_buffer(png, OutputFormat::Png, target);
        assert_eq!(padded.buffer.len() as u64, target);
        assert_eq!(padded.strategy, PaddingStrategy::PngText);
        let tail = &padded.buffer[padded.buffer.len() - 8..padded.buffer.len() - 4];
        assert_eq!(tail, b"IEND");
        let decoded = image::load_from_memory(&padded.buffer).expect("padded png decodes");
        assert_eq!((decoded.width(), decoded.height()), (32, 24));
    }

    #[test]
    fn png_padding_below_chunk_size_appends_zeros() {
        let png = sample(ImageFormat::Png);
        let target = png.len() as u64 + 10;
        let padded = pad_buffer(png, OutputFormat::Png, target);
        assert_eq!(padded.buffer.len() as u64, target);
        assert_eq!(padded.strategy, PaddingStrategy::TrailingZeros);
        image::load_from_memory(&padded.buffer).expect("trailing zeros after IEND are ignored");
    }

    #[test]
    fn webp_and_malformed_streams_get_trailing_zeros() {
        let padded = pad_buffer(b"RIFF....WEBP".to_vec(), OutputFormat::Webp, 40);
        assert_eq!(padded.buffer.len(), 40);
        assert_eq!(padded.strategy, PaddingStrategy::TrailingZeros);
        assert!(padded.buffer[12..].iter().all(|b| *b == 0));

        let broken = pad_buffer(vec![1, 2, 3], OutputFormat::Jpeg, 100);
        assert_eq!(broken.buffer.len(), 100);
        assert_eq!(broken.strategy, PaddingStrategy::TrailingZeros);
    }

    #[test]
    fn buffers_at_or_over_target_are_untouched() {
        let jpeg = sample(ImageFormat::Jpeg);
        let len = jpeg.len() as u64;
        let padded = pad_buffer(jpeg.clone(), OutputFormat::Jpeg, len - 10);
        assert_eq!(padded.buffer, jpeg);
        assert_eq!(padded.strategy, PaddingStrategy::None);
    }

    #[test]
    fn pad_file_reaches_exact_size_on_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out.jpg");
        let jpeg = sample(ImageFormat::Jpeg);
        write_atomic(&path, &jpeg).expect("write");
        let target = jpeg.len() as u64 + 4_321;
        let report = pad_file(&path, OutputFormat::Jpeg, target).expect("pad");
        assert_eq!(report.final_size, report.target);
        assert_eq!(fs::metadata(&path).expect("metadata").len(), target);
        assert!(within_tolerance(report.final_size, target, 0));
    }

    #[test]
    fn write_padded_writes_once_at_target_length() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out.png");
        let png = sample(ImageFormat::Png);
        let target = png.len() as u64 + 777;
        let report = write_padded(&path, png, OutputFormat::Png, target).expect("pad");
        assert_eq!(report.strategy, PaddingStrategy::PngText);
        assert_eq!(fs::metadata(&path).expect("metadata").len(), target);
        image::open(&path).expect("padded png decodes");
    }

    #[test]
    fn pad_file_leaves_large_files_alone() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("big.bin");
        write_atomic(&path, &[7u8; 64]).expect("write");
        let report = pad_file(&path, OutputFormat::Webp, 10).expect("pad");
        assert_eq!(report.strategy, PaddingStrategy::None);
        assert_eq!(report.final_size, 64);
        assert_ne!(report.final_size, report.target);
    }

    #[test]
    fn write_atomic_replaces_existing_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("out.bin");
        write_atomic(&path, b"first").expect("write");
        write_atomic(&path, b"second").expect("rewrite");
        assert_eq!(fs::read(&path).expect("read"), b"second");
    }
}
