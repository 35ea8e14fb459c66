use std::fmt::{Display, Formatter};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use bytefit_core::{
    measure, report, CoreError, EncodeResult, Encoder, OutputFormat, ProgressEvent, ProgressSink, Raster, Resampler, SearchConfig,
    SearchPhase, MAX_QUALITY,
};
use bytefit_image::{effective_scale, ImageSize};
use bytefit_pad::{pad_file, within_tolerance, write_atomic, write_padded, PadReport};
use bytefit_search::{minimum_fallback, reduce_overshoot, search_combined, search_quality, search_scale};
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType as PngFilter, PngEncoder};
use image::imageops::FilterType;
use image::{DynamicImage, ExtendedColorType, ImageEncoder, ImageFormat};
use serde::{Deserialize, Serialize};

/// Quality used for lossy formats when the caller passes none.
const DEFAULT_LOSSY_QUALITY: u8 = 75;

#[derive(Debug, Clone)]
pub struct Frame(pub DynamicImage);

impl Raster for Frame {
    fn size(&self) -> ImageSize {
        ImageSize::new(self.0.width(), self.0.height())
    }
}

/// Encoder and resampler backed by the `image` crate, with lossy WebP
/// through libwebp.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageCodec;

impl Encoder for ImageCodec {
    type Image = Frame;

    fn encode(&self, image: &Frame, format: OutputFormat, quality: Option<u8>) -> Result<Vec<u8>, CoreError> {
        let encode_err = |message: String| CoreError::Encode { format, message };
        let img = &image.0;
        let (width, height) = (img.width(), img.height());
        let mut out = Vec::new();
        match format {
            OutputFormat::Jpeg => {
                let rgb = img.to_rgb8();
                let encoder = JpegEncoder::new_with_quality(&mut out, quality.unwrap_or(DEFAULT_LOSSY_QUALITY));
                encoder
                    .write_image(rgb.as_raw(), width, height, ExtendedColorType::Rgb8)
                    .map_err(|e| encode_err(e.to_string()))?;
            }
            OutputFormat::Png => {
                let encoder = PngEncoder::new_with_quality(&mut out, png_compression(quality), PngFilter::Adaptive);
                if img.color().has_alpha() {
                    let rgba = img.to_rgba8();
                    encoder
                        .write_image(rgba.as_raw(), width, height, ExtendedColorType::Rgba8)
                        .map_err(|e| encode_err(e.to_string()))?;
                } else {
                    let rgb = img.to_rgb8();
                    encoder
                        .write_image(rgb.as_raw(), width, height, ExtendedColorType::Rgb8)
                        .map_err(|e| encode_err(e.to_string()))?;
                }
            }
            OutputFormat::Webp => {
                let quality = quality.unwrap_or(DEFAULT_LOSSY_QUALITY) as f32;
                let encoded = if img.color().has_alpha() {
                    let rgba = img.to_rgba8();
                    webp::Encoder::from_rgba(&rgba, width, height).encode_simple(false, quality)
                } else {
                    let rgb = img.to_rgb8();
                    webp::Encoder::from_rgb(&rgb, width, height).encode_simple(false, quality)
                };
                let encoded = encoded.map_err(|e| encode_err(format!("{:?}", e)))?;
                out.extend_from_slice(&encoded);
            }
        }
        Ok(out)
    }
}

impl Resampler for ImageCodec {
    type Image = Frame;

    fn resize(&self, image: &Frame, size: ImageSize) -> Result<Frame, CoreError> {
        if size.width == 0 || size.height == 0 {
            return Err(CoreError::Resize {
                width: size.width,
                height: size.height,
                message: "dimensions must be positive".to_string(),
            });
        }
        Ok(Frame(image.0.resize_exact(size.width, size.height, FilterType::Lanczos3)))
    }
}

/// PNG has no quality knob; `quality / 10` picks a compression effort.
fn png_compression(quality: Option<u8>) -> CompressionType {
    match quality.map(|q| (q / 10).min(9)) {
        None => CompressionType::Default,
        Some(0..=2) => CompressionType::Fast,
        Some(3..=6) => CompressionType::Default,
        Some(_) => CompressionType::Best,
    }
}

pub fn detect_format(bytes: &[u8]) -> Option<OutputFormat> {
    match image::guess_format(bytes).ok()? {
        ImageFormat::Jpeg => Some(OutputFormat::Jpeg),
        ImageFormat::Png => Some(OutputFormat::Png),
        ImageFormat::WebP => Some(OutputFormat::Webp),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct LoadedInput {
    pub frame: Frame,
    pub bytes: Vec<u8>,
    pub source_format: Option<OutputFormat>,
}

impl LoadedInput {
    pub fn file_size(&self) -> u64 {
        self.bytes.len() as u64
    }
}

pub fn load_input(path: &Path) -> Result<LoadedInput, CoreError> {
    let bytes = fs::read(path).map_err(|e| CoreError::Input(format!("{}: {}", path.display(), e)))?;
    let image = image::load_from_memory(&bytes).map_err(|e| CoreError::Input(format!("{}: {}", path.display(), e)))?;
    Ok(LoadedInput {
        frame: Frame(image),
        source_format: detect_format(&bytes),
        bytes,
    })
}

/// Requested format wins, then the detected source format, then the
/// input file's extension.
pub fn resolve_output_format(
    requested: Option<OutputFormat>,
    source: Option<OutputFormat>,
    input_path: &Path,
) -> Result<OutputFormat, CoreError> {
    if let Some(format) = requested.or(source) {
        return Ok(format);
    }
    let ext = input_path.extension().and_then(|e| e.to_str()).unwrap_or_default();
    OutputFormat::from_name(ext).ok_or_else(|| {
        CoreError::UnsupportedFormat(format!(
            "{} (choose one of jpg, png, webp as output format)",
            if ext.is_empty() { "unknown" } else { ext }
        ))
    })
}

/// `<stem>_resized.<ext>` next to the input.
pub fn default_output_path(input: &Path, format: OutputFormat) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());
    let name = format!("{}_resized.{}", stem, format.extension());
    match input.parent() {
        Some(parent) => parent.join(name),
        None => PathBuf::from(name),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResizeRequest {
    pub image_path: PathBuf,
    pub target_size_bytes: u64,
    pub output_path: Option<PathBuf>,
    pub format: Option<OutputFormat>,
    pub min_dimension: Option<u32>,
    pub exact_size: bool,
    pub quiet: bool,
}

impl ResizeRequest {
    pub fn new(image_path: impl Into<PathBuf>, target_size_bytes: u64) -> Self {
        Self {
            image_path: image_path.into(),
            target_size_bytes,
            output_path: None,
            format: None,
            min_dimension: None,
            exact_size: true,
            quiet: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    Unchanged,
    FormatConversion,
    Baseline,
    Quality,
    Combined,
    Scale,
    MinimumFallback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum Warning {
    ExceedsTarget { final_size: u64, target: u64 },
    MissesTarget { final_size: u64, target: u64, tolerance: u64 },
}

impl Display for Warning {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ExceedsTarget { final_size, target } => {
                write!(f, "output is {} bytes, above the {} byte target", final_size, target)
            }
            Self::MissesTarget {
                final_size,
                target,
                tolerance,
            } => write!(
                f,
                "output is {} bytes, more than {} bytes away from the {} byte target",
                final_size, tolerance, target
            ),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResizeReport {
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    pub format: OutputFormat,
    pub strategy: Strategy,
    pub target: u64,
    pub original_size: u64,
    pub original_dimensions: ImageSize,
    pub final_size: u64,
    pub final_dimensions: ImageSize,
    /// Larger of the width and height ratios between final and original.
    pub scale: f64,
    pub quality: Option<u8>,
    pub padding: Option<PadReport>,
    pub warnings: Vec<Warning>,
    pub elapsed_ms: u64,
}

/// Re-encodes `request.image_path` so the written file lands as close to
/// the target byte count as possible without exceeding it, padding up to the
/// exact count when `exact_size` is set.
pub fn resize_to_target_filesize(
    request: &ResizeRequest,
    config: &SearchConfig,
    sink: Option<&dyn ProgressSink>,
) -> Result<ResizeReport, CoreError> {
    let start = Instant::now();
    let sink = if request.quiet { None } else { sink };
    let target = request.target_size_bytes;

    let input = load_input(&request.image_path)?;
    let format = resolve_output_format(request.format, input.source_format, &request.image_path)?;
    let output_path = request
        .output_path
        .clone()
        .unwrap_or_else(|| default_output_path(&request.image_path, format));
    let original_dimensions = input.frame.size();
    tracing::info!(
        input = %request.image_path.display(),
        output = %output_path.display(),
        %format,
        dimensions = %original_dimensions,
        original_size = input.file_size(),
        target,
        "resizing to target file size"
    );

    let finish = |strategy: Strategy, result: &EncodeResult, padding: Option<PadReport>, warnings: Vec<Warning>| ResizeReport {
        input_path: request.image_path.clone(),
        output_path: output_path.clone(),
        format,
        strategy,
        target,
        original_size: input.file_size(),
        original_dimensions,
        final_size: padding.as_ref().map(|p| p.final_size).unwrap_or(result.size),
        final_dimensions: result.dimensions,
        scale: effective_scale(original_dimensions, result.dimensions),
        quality: result.quality,
        padding,
        warnings,
        elapsed_ms: start.elapsed().as_millis() as u64,
    };

    let codec = ImageCodec;
    if input.file_size() <= target {
        if input.source_format == Some(format) {
            write_atomic(&output_path, &input.bytes)?;
            tracing::info!(size = input.file_size(), target, "input already fits, copied unchanged");
            let copied = EncodeResult::new(input.bytes.clone(), original_dimensions, None);
            return Ok(finish(Strategy::Unchanged, &copied, None, Vec::new()));
        }
        let quality = format.supports_quality().then_some(config.conversion_quality);
        let converted = measure(&codec, &input.frame, format, quality)?;
        if converted.fits(target) {
            write_atomic(&output_path, &converted.buffer)?;
            tracing::info!(size = converted.size, target, "input fits after format conversion");
            return Ok(finish(Strategy::FormatConversion, &converted, None, Vec::new()));
        }
        tracing::info!(size = converted.size, target, "converted input exceeds target, searching");
    }

    let (strategy, chosen) = search(&codec, &input.frame, format, target, request.min_dimension, config, sink)?;
    write_atomic(&output_path, &chosen.buffer)?;
    tracing::info!(?strategy, size = chosen.size, dimensions = %chosen.dimensions, target, "wrote best candidate");

    let (result, mut padding) = if request.exact_size {
        let (result, pad) = fit_written_output(&codec, &output_path, chosen, format, target, config, sink)?;
        (result, Some(pad))
    } else {
        (chosen, None)
    };

    let final_size = match &padding {
        Some(_) => fs::metadata(&output_path)?.len(),
        None => result.size,
    };
    if let Some(pad) = padding.as_mut() {
        pad.final_size = final_size;
    }

    let mut warnings = Vec::new();
    if final_size > target {
        warnings.push(Warning::ExceedsTarget { final_size, target });
    }
    if request.exact_size && !within_tolerance(final_size, target, config.size_tolerance) {
        warnings.push(Warning::MissesTarget {
            final_size,
            target,
            tolerance: config.size_tolerance,
        });
    }
    for warning in &warnings {
        tracing::warn!(%warning, "target not met");
        report(sink, || ProgressEvent::warning(SearchPhase::Padding, target, warning.to_string()));
    }

    Ok(finish(strategy, &result, padding, warnings))
}

/// Probes the full-size image, then runs the strategy chain until one
/// produces a candidate.
fn search(
    codec: &ImageCodec,
    frame: &Frame,
    format: OutputFormat,
    target: u64,
    min_dimension: Option<u32>,
    config: &SearchConfig,
    sink: Option<&dyn ProgressSink>,
) -> Result<(Strategy, EncodeResult), CoreError> {
    let trigger = (target as f64 * config.combined_trigger_ratio) as u64;
    report(sink, || ProgressEvent::phase_start(SearchPhase::Baseline, target));
    let baseline = measure(codec, frame, format, format.supports_quality().then_some(MAX_QUALITY))?;
    tracing::debug!(size = baseline.size, target, "baseline probe");
    if baseline.fits(target) {
        report(sink, || ProgressEvent::phase_end(SearchPhase::Baseline, target, Some(&baseline)));
        // A full-quality encode far below the target leaves room to upscale.
        if format.supports_quality() && baseline.size < trigger {
            if let Some(combined) = search_combined(codec, codec, frame, format, target, min_dimension, config, sink)? {
                return Ok((Strategy::Combined, combined.result));
            }
        }
        return Ok((Strategy::Baseline, baseline));
    }
    report(sink, || ProgressEvent::phase_end(SearchPhase::Baseline, target, None));

    if format.supports_quality() {
        let quality = search_quality(codec, frame, format, target, config, sink)?;
        if quality.as_ref().map(|c| c.result.size < trigger).unwrap_or(true) {
            if let Some(combined) = search_combined(codec, codec, frame, format, target, min_dimension, config, sink)? {
                return Ok((Strategy::Combined, combined.result));
            }
        }
        if let Some(quality) = quality {
            return Ok((Strategy::Quality, quality.result));
        }
    }

    if let Some(scaled) = search_scale(codec, codec, frame, format, target, min_dimension, config, sink)? {
        return Ok((Strategy::Scale, scaled.result));
    }
    let minimum = minimum_fallback(codec, codec, frame, format, target, min_dimension, sink)?;
    Ok((Strategy::MinimumFallback, minimum))
}

/// Brings the file already written at `output_path` to exactly `target`
/// bytes. An over-target result first gets one bounded quality reduction;
/// if that finds nothing the file is padded as is and stays over target.
fn fit_written_output(
    codec: &ImageCodec,
    output_path: &Path,
    result: EncodeResult,
    format: OutputFormat,
    target: u64,
    config: &SearchConfig,
    sink: Option<&dyn ProgressSink>,
) -> Result<(EncodeResult, PadReport), CoreError> {
    if !result.fits(target) {
        if let Some(reduced) = shrink_overshoot(codec, &result, format, target, config, sink)? {
            let pad = write_padded(output_path, reduced.buffer.clone(), format, target)?;
            return Ok((reduced, pad));
        }
    }
    let pad = pad_file(output_path, format, target)?;
    Ok((result, pad))
}

/// Lowers the quality of an over-target result at its current dimensions.
fn shrink_overshoot(
    codec: &ImageCodec,
    result: &EncodeResult,
    format: OutputFormat,
    target: u64,
    config: &SearchConfig,
    sink: Option<&dyn ProgressSink>,
) -> Result<Option<EncodeResult>, CoreError> {
    if !format.supports_quality() {
        return Ok(None);
    }
    let written = image::load_from_memory(&result.buffer).map_err(|e| CoreError::Encode {
        format,
        message: format!("failed to decode written output: {}", e),
    })?;
    let reduced = reduce_overshoot(codec, &Frame(written), format, target, config, sink)?;
    if let Some(candidate) = &reduced {
        tracing::info!(
            quality = candidate.param,
            size = candidate.result.size,
            target,
            "reduced quality to fit target"
        );
    }
    Ok(reduced.map(|c| c.result))
}
