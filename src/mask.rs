use opencv::core::Vec3b;
use opencv::prelude::*;

use crate::config::MaskConfig;
use crate::error::{AlignError, Result};
use crate::features::Features;

/// Keep only the keypoints whose mask pixel is set.
///
/// Keypoint `(x, y)` is looked up at `(round(x * scale), round(y * scale))`,
/// clamped into the mask. `mask` must be an 8-bit BGR image.
pub fn filter_by_mask(features: Features, mask: &Mat, config: &MaskConfig) -> Result<Features> {
    if mask.empty() || mask.channels() != 3 {
        return Err(AlignError::image(
            &config.path,
            "mask must be a non-empty 3-channel image",
        ));
    }
    if config.channel > 2 {
        return Err(AlignError::image(
            &config.path,
            format!("mask channel {} does not exist", config.channel),
        ));
    }

    let max_col = mask.cols() - 1;
    let max_row = mask.rows() - 1;

    let mut kept = Vec::with_capacity(features.len());
    for (i, kp) in features.keypoints().iter().enumerate() {
        let col = ((kp.x as f64 * config.scale).round() as i32).clamp(0, max_col);
        let row = ((kp.y as f64 * config.scale).round() as i32).clamp(0, max_row);
        let pixel = mask.at_2d::<Vec3b>(row, col)?;
        if pixel[config.channel] != 0 {
            kept.push(i);
        }
    }

    if kept.len() == features.len() {
        return Ok(features);
    }
    features.select(&kept)
}
