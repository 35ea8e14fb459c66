use std::fmt::{Display, Formatter};

use bytefit_image::ImageSize;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MIN_QUALITY: u8 = 1;
pub const MAX_QUALITY: u8 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputFormat {
    Jpeg,
    Png,
    Webp,
}

impl OutputFormat {
    pub fn all() -> [OutputFormat; 3] {
        [OutputFormat::Jpeg, OutputFormat::Png, OutputFormat::Webp]
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().trim_start_matches('.').to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" => Some(Self::Jpeg),
            "png" => Some(Self::Png),
            "webp" => Some(Self::Webp),
            _ => None,
        }
    }

    /// Formats with a lossy quality knob that the quality search can drive.
    pub fn supports_quality(self) -> bool {
        matches!(self, Self::Jpeg | Self::Webp)
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Jpeg => "jpg",
            Self::Png => "png",
            Self::Webp => "webp",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Jpeg => "JPEG",
            Self::Png => "PNG",
            Self::Webp => "WEBP",
        }
    }
}

impl Display for OutputFormat {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodeResult {
    pub size: u64,
    pub buffer: Vec<u8>,
    pub dimensions: ImageSize,
    pub quality: Option<u8>,
}

impl EncodeResult {
    pub fn new(buffer: Vec<u8>, dimensions: ImageSize, quality: Option<u8>) -> Self {
        Self {
            size: buffer.len() as u64,
            buffer,
            dimensions,
            quality,
        }
    }

    pub fn fits(&self, target: u64) -> bool {
        self.size <= target
    }

    pub fn distance_to(&self, target: u64) -> u64 {
        self.size.abs_diff(target)
    }
}

pub trait Raster {
    fn size(&self) -> ImageSize;
}

pub trait Encoder {
    type Image: Raster;

    fn encode(&self, image: &Self::Image, format: OutputFormat, quality: Option<u8>) -> Result<Vec<u8>, CoreError>;
}

pub trait Resampler {
    type Image: Raster;

    fn resize(&self, image: &Self::Image, size: ImageSize) -> Result<Self::Image, CoreError>;
}

/// Encodes `image` and reports how many bytes it took.
pub fn measure<E: Encoder + ?Sized>(
    encoder: &E,
    image: &E::Image,
    format: OutputFormat,
    quality: Option<u8>,
) -> Result<EncodeResult, CoreError> {
    let quality = quality.map(|q| q.clamp(MIN_QUALITY, MAX_QUALITY));
    let buffer = encoder.encode(image, format, quality)?;
    Ok(EncodeResult::new(buffer, image.size(), quality))
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("failed to read input image: {0}")]
    Input(String),
    #[error("failed to encode {format}: {message}")]
    Encode { format: OutputFormat, message: String },
    #[error("failed to resize to {width}x{height}: {message}")]
    Resize { width: u32, height: u32, message: String },
    #[error("unsupported image format: {0}")]
    UnsupportedFormat(String),
    #[error("{0} has no quality parameter")]
    QualityUnsupported(OutputFormat),
    #[error("io error: {0}")]
    Io(String),
}

impl CoreError {
    /// Errors that only make a single probe infeasible; searches keep going.
    pub fn is_probe_local(&self) -> bool {
        matches!(self, Self::Encode { .. } | Self::Resize { .. })
    }

    pub fn as_error_info(&self) -> ErrorInfo {
        let code = match self {
            Self::Input(_) => ErrorCode::InputError,
            Self::Encode { .. } => ErrorCode::EncodeError,
            Self::Resize { .. } => ErrorCode::ResizeError,
            Self::UnsupportedFormat(_) | Self::QualityUnsupported(_) => ErrorCode::UnsupportedFormat,
            Self::Io(_) => ErrorCode::IoError,
        };
        ErrorInfo {
            code,
            message: self.to_string(),
        }
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    InputError,
    EncodeError,
    ResizeError,
    UnsupportedFormat,
    IoError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorInfo {
    pub code: ErrorCode,
    pub message: String,
}

/// Whether the combined search may pick a candidate above the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OvershootPolicy {
    /// Only candidates at or below the target are eligible.
    Forbid,
    /// An over-target candidate wins when it is closer to the target than
    /// every under-target candidate seen in the same sweep.
    AllowClosest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchConfig {
    pub quality_iterations: u32,
    pub scale_iterations: u32,
    pub scale_convergence: f64,
    pub min_scale: f64,
    pub max_scale: f64,
    pub combined_trigger_ratio: f64,
    pub combined_good_enough_ratio: f64,
    pub small_target_threshold: u64,
    pub small_target_multipliers: Vec<f64>,
    pub enlarge_multipliers: Vec<f64>,
    pub max_dimension: u32,
    pub overshoot_iterations: u32,
    pub size_tolerance: u64,
    pub conversion_quality: u8,
    pub overshoot_policy: OvershootPolicy,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            quality_iterations: 12,
            scale_iterations: 12,
            scale_convergence: 0.005,
            min_scale: 0.01,
            max_scale: 1.0,
            combined_trigger_ratio: 0.9,
            combined_good_enough_ratio: 0.95,
            small_target_threshold: 5 * 1024,
            small_target_multipliers: vec![0.1, 0.2, 0.3, 0.4, 0.5],
            enlarge_multipliers: vec![1.0, 1.25, 1.5, 2.0, 3.0],
            max_dimension: 10_000,
            overshoot_iterations: 8,
            size_tolerance: 50,
            conversion_quality: 90,
            overshoot_policy: OvershootPolicy::AllowClosest,
        }
    }
}

impl SearchConfig {
    pub fn multipliers_for(&self, target: u64) -> &[f64] {
        if target < self.small_target_threshold {
            &self.small_target_multipliers
        } else {
            &self.enlarge_multipliers
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchOverrides {
    pub quality_iterations: Option<u32>,
    pub scale_iterations: Option<u32>,
    pub size_tolerance: Option<u64>,
    pub max_dimension: Option<u32>,
    pub overshoot_policy: Option<OvershootPolicy>,
}

pub fn resolve_search_config(overrides: SearchOverrides) -> SearchConfig {
    let mut cfg = SearchConfig::default();
    if let Some(iterations) = overrides.quality_iterations.filter(|n| *n > 0) {
        cfg.quality_iterations = iterations;
    }
    if let Some(iterations) = overrides.scale_iterations.filter(|n| *n > 0) {
        cfg.scale_iterations = iterations;
    }
    if let Some(tolerance) = overrides.size_tolerance {
        cfg.size_tolerance = tolerance;
    }
    if let Some(max) = overrides.max_dimension.filter(|n| *n > 0) {
        cfg.max_dimension = max;
    }
    if let Some(policy) = overrides.overshoot_policy {
        cfg.overshoot_policy = policy;
    }
    cfg
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SearchPhase {
    Baseline,
    Quality,
    Combined,
    Scale,
    MinimumFallback,
    OvershootReduction,
    Padding,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProgressEventType {
    PhaseStart,
    Probe,
    PhaseSuccess,
    PhaseExhausted,
    Warning,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub event_type: ProgressEventType,
    pub phase: SearchPhase,
    pub target: u64,
    pub parameter: Option<f64>,
    pub size: Option<u64>,
    pub dimensions: Option<ImageSize>,
    pub detail: Option<String>,
}

impl ProgressEvent {
    pub fn phase_start(phase: SearchPhase, target: u64) -> Self {
        Self {
            event_type: ProgressEventType::PhaseStart,
            phase,
            target,
            parameter: None,
            size: None,
            dimensions: None,
            detail: None,
        }
    }

    pub fn probe(phase: SearchPhase, target: u64, parameter: f64, result: &EncodeResult) -> Self {
        Self {
            event_type: ProgressEventType::Probe,
            phase,
            target,
            parameter: Some(parameter),
            size: Some(result.size),
            dimensions: Some(result.dimensions),
            detail: None,
        }
    }

    pub fn phase_end(phase: SearchPhase, target: u64, outcome: Option<&EncodeResult>) -> Self {
        Self {
            event_type: if outcome.is_some() {
                ProgressEventType::PhaseSuccess
            } else {
                ProgressEventType::PhaseExhausted
            },
            phase,
            target,
            parameter: outcome.and_then(|r| r.quality).map(f64::from),
            size: outcome.map(|r| r.size),
            dimensions: outcome.map(|r| r.dimensions),
            detail: None,
        }
    }

    pub fn warning(phase: SearchPhase, target: u64, detail: impl Into<String>) -> Self {
        Self {
            event_type: ProgressEventType::Warning,
            phase,
            target,
            parameter: None,
            size: None,
            dimensions: None,
            detail: Some(detail.into()),
        }
    }
}

pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: ProgressEvent);
}

/// Emits an event when a sink is attached; the event is only built then.
pub fn report(sink: Option<&dyn ProgressSink>, event: impl FnOnce() -> ProgressEvent) {
    if let Some(sink) = sink {
        sink.emit(event());
    }
}

/// Parameter space explored by [`maximize_under_target`].
pub trait SearchSpace {
    type Param: Copy + std::fmt::Debug;

    fn bounds(&self) -> (Self::Param, Self::Param);
    fn exhausted(&self, low: Self::Param, high: Self::Param) -> bool;
    fn midpoint(&self, low: Self::Param, high: Self::Param) -> Self::Param;
    /// New lower bound after `mid` fit the target.
    fn above(&self, mid: Self::Param) -> Self::Param;
    /// New upper bound after `mid` overshot the target.
    fn below(&self, mid: Self::Param) -> Self::Param;
}

/// Integer quality range; bounds move past the probed value.
#[derive(Debug, Clone, Copy)]
pub struct QualitySpace {
    pub low: u8,
    pub high: u8,
}

impl QualitySpace {
    pub fn new(low: u8, high: u8) -> Self {
        Self {
            low: low.clamp(MIN_QUALITY, MAX_QUALITY),
            high: high.clamp(MIN_QUALITY, MAX_QUALITY),
        }
    }
}

impl Default for QualitySpace {
    fn default() -> Self {
        Self::new(MIN_QUALITY, MAX_QUALITY)
    }
}

impl SearchSpace for QualitySpace {
    type Param = u8;

    fn bounds(&self) -> (u8, u8) {
        (self.low, self.high)
    }

    fn exhausted(&self, low: u8, high: u8) -> bool {
        low > high
    }

    fn midpoint(&self, low: u8, high: u8) -> u8 {
        ((low as u16 + high as u16) / 2) as u8
    }

    fn above(&self, mid: u8) -> u8 {
        mid.saturating_add(1)
    }

    fn below(&self, mid: u8) -> u8 {
        mid.saturating_sub(1)
    }
}

/// Continuous scale range; bounds move onto the probed value.
#[derive(Debug, Clone, Copy)]
pub struct ScaleSpace {
    pub low: f64,
    pub high: f64,
    pub convergence: f64,
}

impl ScaleSpace {
    pub fn from_config(config: &SearchConfig) -> Self {
        Self {
            low: config.min_scale,
            high: config.max_scale,
            convergence: config.scale_convergence,
        }
    }
}

impl SearchSpace for ScaleSpace {
    type Param = f64;

    fn bounds(&self) -> (f64, f64) {
        (self.low, self.high)
    }

    fn exhausted(&self, low: f64, high: f64) -> bool {
        high - low < self.convergence
    }

    fn midpoint(&self, low: f64, high: f64) -> f64 {
        (low + high) / 2.0
    }

    fn above(&self, mid: f64) -> f64 {
        mid
    }

    fn below(&self, mid: f64) -> f64 {
        mid
    }
}

#[derive(Debug, Clone)]
pub struct Candidate<P> {
    pub param: P,
    pub result: EncodeResult,
}

#[derive(Debug, Clone)]
pub struct SearchState<P> {
    pub low: P,
    pub high: P,
    pub best: Option<Candidate<P>>,
    pub iterations: u32,
    pub rejected_probes: u32,
}

impl<P: Copy> SearchState<P> {
    fn new(low: P, high: P) -> Self {
        Self {
            low,
            high,
            best: None,
            iterations: 0,
            rejected_probes: 0,
        }
    }

    fn record(&mut self, param: P, result: EncodeResult) {
        let improves = self.best.as_ref().map(|best| result.size > best.result.size).unwrap_or(true);
        if improves {
            self.best = Some(Candidate { param, result });
        }
    }

    pub fn best_size(&self) -> Option<u64> {
        self.best.as_ref().map(|c| c.result.size)
    }
}

/// Binary search for the largest parameter whose probe still fits `target`.
///
/// Assumes size grows with the parameter. The best feasible probe is kept
/// even if the search ends elsewhere, so a non-monotone oracle only costs
/// precision. Probe-local failures count as infeasible; anything else aborts.
pub fn maximize_under_target<S, F>(
    space: &S,
    max_iterations: u32,
    target: u64,
    mut probe: F,
) -> Result<SearchState<S::Param>, CoreError>
where
    S: SearchSpace,
    F: FnMut(S::Param) -> Result<EncodeResult, CoreError>,
{
    let (low, high) = space.bounds();
    let mut state = SearchState::new(low, high);
    while !space.exhausted(state.low, state.high) && state.iterations < max_iterations {
        state.iterations += 1;
        let mid = space.midpoint(state.low, state.high);
        match probe(mid) {
            Ok(result) if result.fits(target) => {
                state.record(mid, result);
                state.low = space.above(mid);
            }
            Ok(_) => state.high = space.below(mid),
            Err(err) if err.is_probe_local() => {
                tracing::debug!(param = ?mid, error = %err, "probe rejected");
                state.rejected_probes += 1;
                state.high = space.below(mid);
            }
            Err(err) => return Err(err),
        }
    }
    tracing::debug!(
        iterations = state.iterations,
        rejected = state.rejected_probes,
        best = ?state.best_size(),
        target,
        "search finished"
    );
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Flat(ImageSize);

    impl Raster for Flat {
        fn size(&self) -> ImageSize {
            self.0
        }
    }

    struct LinearEncoder;

    impl Encoder for LinearEncoder {
        type Image = Flat;

        fn encode(&self, image: &Flat, _format: OutputFormat, quality: Option<u8>) -> Result<Vec<u8>, CoreError> {
            let len = image.0.pixels() * quality.unwrap_or(50) as u64 / 10 + 100;
            Ok(vec![0; len as usize])
        }
    }

    fn linear_probe(q: u8) -> Result<EncodeResult, CoreError> {
        measure(&LinearEncoder, &Flat(ImageSize::new(10, 10)), OutputFormat::Jpeg, Some(q))
    }

    #[test]
    fn format_names_normalize_jpg_aliases() {
        assert_eq!(OutputFormat::from_name("JPG"), Some(OutputFormat::Jpeg));
        assert_eq!(OutputFormat::from_name(".jpeg"), Some(OutputFormat::Jpeg));
        assert_eq!(OutputFormat::from_name("WebP"), Some(OutputFormat::Webp));
        assert_eq!(OutputFormat::from_name("gif"), None);
        assert!(!OutputFormat::Png.supports_quality());
    }

    #[test]
    fn measure_reports_buffer_length_and_clamps_quality() {
        let result = measure(&LinearEncoder, &Flat(ImageSize::new(10, 10)), OutputFormat::Jpeg, Some(0)).expect("encode");
        assert_eq!(result.quality, Some(1));
        assert_eq!(result.size, result.buffer.len() as u64);
        assert_eq!(result.size, 110);
    }

    #[test]
    fn quality_space_finds_maximal_feasible_quality() {
        // size = 10 * q + 100, so q = 37 is the last one under 475
        let state = maximize_under_target(&QualitySpace::default(), 12, 475, linear_probe).expect("search");
        let best = state.best.expect("feasible");
        assert_eq!(best.param, 37);
        assert_eq!(best.result.size, 470);
    }

    #[test]
    fn quality_space_reports_nothing_when_minimum_overshoots() {
        let state = maximize_under_target(&QualitySpace::default(), 12, 50, linear_probe).expect("search");
        assert!(state.best.is_none());
        assert!(state.iterations <= 7);
    }

    #[test]
    fn quality_space_respects_iteration_cap() {
        let mut calls = 0;
        let state = maximize_under_target(&QualitySpace::default(), 3, 475, |q| {
            calls += 1;
            linear_probe(q)
        })
        .expect("search");
        assert_eq!(calls, 3);
        assert_eq!(state.iterations, 3);
    }

    #[test]
    fn scale_space_converges_within_threshold() {
        let space = ScaleSpace::from_config(&SearchConfig::default());
        let state = maximize_under_target(&space, 64, 500, |scale| {
            let len = (scale * 1000.0) as usize;
            Ok(EncodeResult::new(vec![0; len], ImageSize::new(1, 1), None))
        })
        .expect("search");
        let best = state.best.expect("feasible");
        assert!(best.result.size <= 500);
        assert!(best.param > 0.49 && best.param < 0.501);
        assert!(state.high - state.low < 0.005);
    }

    #[test]
    fn probe_local_errors_are_treated_as_infeasible() {
        let state = maximize_under_target(&QualitySpace::default(), 12, 10_000, |q| {
            if q > 60 {
                Err(CoreError::Encode {
                    format: OutputFormat::Webp,
                    message: "rejected".to_string(),
                })
            } else {
                linear_probe(q)
            }
        })
        .expect("search");
        assert_eq!(state.best.expect("feasible").param, 60);
        assert!(state.rejected_probes > 0);
    }

    #[test]
    fn fatal_errors_abort_the_search() {
        let err = maximize_under_target(&QualitySpace::default(), 12, 10_000, |_| Err(CoreError::Io("disk".to_string())))
            .expect_err("io errors propagate");
        assert!(matches!(err, CoreError::Io(_)));
    }

    #[test]
    fn overrides_ignore_zero_iteration_counts() {
        let cfg = resolve_search_config(SearchOverrides {
            quality_iterations: Some(0),
            scale_iterations: Some(6),
            size_tolerance: Some(10),
            max_dimension: None,
            overshoot_policy: Some(OvershootPolicy::Forbid),
        });
        assert_eq!(cfg.quality_iterations, 12);
        assert_eq!(cfg.scale_iterations, 6);
        assert_eq!(cfg.size_tolerance, 10);
        assert_eq!(cfg.overshoot_policy, OvershootPolicy::Forbid);
    }

    #[test]
    fn small_targets_use_downscaling_multipliers() {
        let cfg = SearchConfig::default();
        assert_eq!(cfg.multipliers_for(1024)[0], 0.1);
        assert_eq!(cfg.multipliers_for(50 * 1024)[0], 1.0);
    }

    #[test]
    fn error_info_carries_stable_codes() {
        let info = CoreError::Input("missing".to_string()).as_error_info();
        assert_eq!(info.code, ErrorCode::InputError);
        assert!(info.message.contains("missing"));
    }
}
