use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

impl ImageSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn pixels(self) -> u64 {
        (self.width as u64).saturating_mul(self.height as u64)
    }

    pub fn min_side(self) -> u32 {
        self.width.min(self.height)
    }
}

impl std::fmt::Display for ImageSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Uniformly scales both sides, never going below a single pixel.
pub fn scale_dimensions(size: ImageSize, scale: f64) -> ImageSize {
    ImageSize {
        width: scale_side(size.width, scale),
        height: scale_side(size.height, scale),
    }
}

fn scale_side(side: u32, scale: f64) -> u32 {
    let scaled = (side as f64 * scale).round();
    if scaled < 1.0 {
        1
    } else if scaled >= u32::MAX as f64 {
        u32::MAX
    } else {
        scaled as u32
    }
}

/// Enlarges `size` so neither side is below `min_dimension`.
///
/// Both sides grow by the larger of the two required ratios so the aspect
/// ratio is kept, then each side is clamped to at least `min_dimension` to
/// absorb rounding.
pub fn apply_min_dimension(size: ImageSize, min_dimension: Option<u32>) -> ImageSize {
    let min = match min_dimension {
        Some(min) if min > 0 => min,
        _ => return size,
    };
    if size.width >= min && size.height >= min {
        return size;
    }

    let width = size.width.max(1);
    let height = size.height.max(1);
    let ratio_w = if width < min { min as f64 / width as f64 } else { 1.0 };
    let ratio_h = if height < min { min as f64 / height as f64 } else { 1.0 };
    let ratio = ratio_w.max(ratio_h);

    ImageSize {
        width: scale_side(width, ratio).max(min),
        height: scale_side(height, ratio).max(min),
    }
}

pub fn exceeds_max_dimension(size: ImageSize, max_dimension: u32) -> bool {
    size.width > max_dimension || size.height > max_dimension
}

/// Smallest size the search engine will ever produce.
pub fn minimum_size(min_dimension: Option<u32>) -> ImageSize {
    match min_dimension {
        Some(min) if min > 0 => ImageSize::new(min, min),
        _ => ImageSize::new(1, 1),
    }
}

/// Scale actually applied relative to `original`, taken from the wider ratio.
pub fn effective_scale(original: ImageSize, size: ImageSize) -> f64 {
    if original.width == 0 || original.height == 0 {
        return 0.0;
    }
    let sx = size.width as f64 / original.width as f64;
    let sy = size.height as f64 / original.height as f64;
    sx.max(sy)
}
