use bytefit_core::{
    maximize_under_target, measure, report, Candidate, CoreError, EncodeResult, Encoder, OutputFormat, OvershootPolicy, ProgressEvent,
    ProgressSink, QualitySpace, Raster, Resampler, ScaleSpace, SearchConfig, SearchPhase, SearchState, MIN_QUALITY,
};
use bytefit_image::{apply_min_dimension, exceeds_max_dimension, minimum_size, scale_dimensions, ImageSize};

/// Highest quality at the image's current dimensions whose encoding fits `target`.
pub fn search_quality<E: Encoder + ?Sized>(
    encoder: &E,
    image: &E::Image,
    format: OutputFormat,
    target: u64,
    config: &SearchConfig,
    sink: Option<&dyn ProgressSink>,
) -> Result<Option<Candidate<u8>>, CoreError> {
    report(sink, || ProgressEvent::phase_start(SearchPhase::Quality, target));
    let state = quality_state(encoder, image, format, target, config.quality_iterations, SearchPhase::Quality, sink)?;
    report(sink, || {
        ProgressEvent::phase_end(SearchPhase::Quality, target, state.best.as_ref().map(|c| &c.result))
    });
    if let Some(best) = &state.best {
        tracing::info!(quality = best.param, size = best.result.size, target, "quality search converged");
    }
    Ok(state.best)
}

fn quality_state<E: Encoder + ?Sized>(
    encoder: &E,
    image: &E::Image,
    format: OutputFormat,
    target: u64,
    iterations: u32,
    phase: SearchPhase,
    sink: Option<&dyn ProgressSink>,
) -> Result<SearchState<u8>, CoreError> {
    if !format.supports_quality() {
        return Err(CoreError::QualityUnsupported(format));
    }
    maximize_under_target(&QualitySpace::default(), iterations, target, |quality| {
        let result = measure(encoder, image, format, Some(quality))?;
        tracing::debug!(quality, size = result.size, target, "quality probe");
        report(sink, || ProgressEvent::probe(phase, target, f64::from(quality), &result));
        Ok(result)
    })
}

/// Best encoding at the image's current dimensions: the quality search result
/// when one fits, otherwise the quality-1 (or parameterless) encoding.
fn best_fit_at<E: Encoder + ?Sized>(
    encoder: &E,
    image: &E::Image,
    format: OutputFormat,
    target: u64,
    config: &SearchConfig,
    phase: SearchPhase,
    sink: Option<&dyn ProgressSink>,
) -> Result<EncodeResult, CoreError> {
    if !format.supports_quality() {
        return measure(encoder, image, format, None);
    }
    let state = quality_state(encoder, image, format, target, config.quality_iterations, phase, sink)?;
    match state.best {
        Some(best) => Ok(best.result),
        None => measure(encoder, image, format, Some(MIN_QUALITY)),
    }
}

/// Runs `f` on `image` resampled to `size`, skipping the resample when the
/// dimensions already match.
fn with_size<R, T, F>(resampler: &R, image: &R::Image, size: ImageSize, f: F) -> Result<T, CoreError>
where
    R: Resampler + ?Sized,
    F: FnOnce(&R::Image) -> Result<T, CoreError>,
{
    if image.size() == size {
        return f(image);
    }
    let resized = resampler.resize(image, size)?;
    f(&resized)
}

/// Largest uniform scale in `[min_scale, max_scale]` whose best encoding fits `target`.
#[allow(clippy::too_many_arguments)]
pub fn search_scale<E, R, I>(
    encoder: &E,
    resampler: &R,
    image: &I,
    format: OutputFormat,
    target: u64,
    min_dimension: Option<u32>,
    config: &SearchConfig,
    sink: Option<&dyn ProgressSink>,
) -> Result<Option<Candidate<f64>>, CoreError>
where
    E: Encoder<Image = I> + ?Sized,
    R: Resampler<Image = I> + ?Sized,
    I: Raster,
{
    report(sink, || ProgressEvent::phase_start(SearchPhase::Scale, target));
    let original = image.size();
    let state = maximize_under_target(&ScaleSpace::from_config(config), config.scale_iterations, target, |scale| {
        let size = apply_min_dimension(scale_dimensions(original, scale), min_dimension);
        let result = with_size(resampler, image, size, |resized| {
            best_fit_at(encoder, resized, format, target, config, SearchPhase::Scale, sink)
        })?;
        tracing::debug!(scale, dimensions = %size, size = result.size, target, "scale probe");
        report(sink, || ProgressEvent::probe(SearchPhase::Scale, target, scale, &result));
        Ok(result)
    })?;
    report(sink, || {
        ProgressEvent::phase_end(SearchPhase::Scale, target, state.best.as_ref().map(|c| &c.result))
    });
    match &state.best {
        Some(best) => tracing::info!(
            scale = best.param,
            dimensions = %best.result.dimensions,
            size = best.result.size,
            "scale search converged"
        ),
        None => tracing::info!(target, "no scale fits the target"),
    }
    Ok(state.best)
}

/// Sweeps the configured scale multipliers with a quality search at each and
/// keeps the candidate closest to `target`.
///
/// Under [`OvershootPolicy::AllowClosest`] a multiplier where nothing fits
/// contributes its quality-1 encoding, and that over-target candidate wins
/// when it is closer than every fitting one. With no fitting candidate at all
/// the sweep reports nothing so the caller can fall through.
#[allow(clippy::too_many_arguments)]
pub fn search_combined<E, R, I>(
    encoder: &E,
    resampler: &R,
    image: &I,
    format: OutputFormat,
    target: u64,
    min_dimension: Option<u32>,
    config: &SearchConfig,
    sink: Option<&dyn ProgressSink>,
) -> Result<Option<Candidate<f64>>, CoreError>
where
    E: Encoder<Image = I> + ?Sized,
    R: Resampler<Image = I> + ?Sized,
    I: Raster,
{
    if !format.supports_quality() {
        return Err(CoreError::QualityUnsupported(format));
    }
    report(sink, || ProgressEvent::phase_start(SearchPhase::Combined, target));
    let original = image.size();
    let good_enough = (target as f64 * config.combined_good_enough_ratio) as u64;
    let mut under: Option<Candidate<f64>> = None;
    let mut over: Option<Candidate<f64>> = None;

    for &multiplier in config.multipliers_for(target) {
        let size = apply_min_dimension(scale_dimensions(original, multiplier), min_dimension);
        if exceeds_max_dimension(size, config.max_dimension) {
            tracing::debug!(multiplier, dimensions = %size, "skipping oversized multiplier");
            continue;
        }

        let measured = with_size(resampler, image, size, |resized| {
            let state = quality_state(encoder, resized, format, target, config.quality_iterations, SearchPhase::Combined, sink)?;
            match (state.best, config.overshoot_policy) {
                (Some(best), _) => Ok(Some(best.result)),
                (None, OvershootPolicy::AllowClosest) => measure(encoder, resized, format, Some(MIN_QUALITY)).map(Some),
                (None, OvershootPolicy::Forbid) => Ok(None),
            }
        });
        let result = match measured {
            Ok(Some(result)) => result,
            Ok(None) => continue,
            Err(err) if err.is_probe_local() => {
                tracing::debug!(multiplier, error = %err, "multiplier rejected");
                continue;
            }
            Err(err) => return Err(err),
        };
        report(sink, || ProgressEvent::probe(SearchPhase::Combined, target, multiplier, &result));

        let fits = result.fits(target);
        let slot = if fits { &mut under } else { &mut over };
        let closer = slot
            .as_ref()
            .map(|best| result.distance_to(target) < best.result.distance_to(target))
            .unwrap_or(true);
        if closer {
            *slot = Some(Candidate {
                param: multiplier,
                result,
            });
        }

        if fits && under.as_ref().map(|c| c.result.size >= good_enough).unwrap_or(false) {
            break;
        }
    }

    let chosen = match (under, over) {
        (None, _) => None,
        (Some(under), Some(over)) if over.result.distance_to(target) < under.result.distance_to(target) => {
            tracing::info!(
                multiplier = over.param,
                size = over.result.size,
                target,
                "closest combined candidate exceeds the target"
            );
            Some(over)
        }
        (Some(under), _) => Some(under),
    };
    report(sink, || {
        ProgressEvent::phase_end(SearchPhase::Combined, target, chosen.as_ref().map(|c| &c.result))
    });
    Ok(chosen)
}

/// Smallest image the engine produces: `min_dimension` square (or 1x1) at
/// the lowest quality. There is no further reduction below this.
pub fn minimum_fallback<E, R, I>(
    encoder: &E,
    resampler: &R,
    image: &I,
    format: OutputFormat,
    target: u64,
    min_dimension: Option<u32>,
    sink: Option<&dyn ProgressSink>,
) -> Result<EncodeResult, CoreError>
where
    E: Encoder<Image = I> + ?Sized,
    R: Resampler<Image = I> + ?Sized,
    I: Raster,
{
    report(sink, || ProgressEvent::phase_start(SearchPhase::MinimumFallback, target));
    let size = minimum_size(min_dimension);
    let quality = format.supports_quality().then_some(MIN_QUALITY);
    let result = with_size(resampler, image, size, |resized| measure(encoder, resized, format, quality))?;
    tracing::warn!(dimensions = %size, size = result.size, target, "using minimum size and quality");
    report(sink, || ProgressEvent::phase_end(SearchPhase::MinimumFallback, target, Some(&result)));
    Ok(result)
}

/// Single bounded downward quality pass for an encoding that overshot.
pub fn reduce_overshoot<E: Encoder + ?Sized>(
    encoder: &E,
    image: &E::Image,
    format: OutputFormat,
    target: u64,
    config: &SearchConfig,
    sink: Option<&dyn ProgressSink>,
) -> Result<Option<Candidate<u8>>, CoreError> {
    if !format.supports_quality() {
        return Ok(None);
    }
    report(sink, || ProgressEvent::phase_start(SearchPhase::OvershootReduction, target));
    let state = quality_state(
        encoder,
        image,
        format,
        target,
        config.overshoot_iterations,
        SearchPhase::OvershootReduction,
        sink,
    )?;
    report(sink, || {
        ProgressEvent::phase_end(SearchPhase::OvershootReduction, target, state.best.as_ref().map(|c| &c.result))
    });
    Ok(state.best)
}
