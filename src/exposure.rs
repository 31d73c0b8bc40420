//! Exposure-time metadata and the blur strength derived from it.
//!
//! Long exposures of the same scene are noisier than short ones. Blurring
//! them before feature extraction keeps the noise from dominating the
//! descriptors, so bracketed shots still match each other.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use crate::config::BlurConfig;
use crate::error::{AlignError, Result};

/// Source of per-image exposure times, in seconds.
pub trait ExposureSource: Send + Sync {
    fn exposure_time(&self, path: &Path) -> Result<f64>;
}

/// Reads the EXIF `ExposureTime` tag.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExifExposure;

impl ExposureSource for ExifExposure {
    fn exposure_time(&self, path: &Path) -> Result<f64> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        let exif = exif::Reader::new()
            .read_from_container(&mut reader)
            .map_err(|e| AlignError::metadata(path, e))?;

        let field = exif
            .get_field(exif::Tag::ExposureTime, exif::In::PRIMARY)
            .ok_or_else(|| AlignError::metadata(path, "no ExposureTime tag"))?;

        let seconds = match field.value {
            exif::Value::Rational(ref values) if !values.is_empty() => values[0].to_f64(),
            _ => {
                return Err(AlignError::metadata(
                    path,
                    format!("unexpected ExposureTime value {:?}", field.value),
                ))
            }
        };
        validate_exposure(path, seconds)
    }
}

pub(crate) fn validate_exposure(path: &Path, seconds: f64) -> Result<f64> {
    if seconds.is_finite() && seconds > 0.0 {
        Ok(seconds)
    } else {
        Err(AlignError::metadata(
            path,
            format!("exposure time {} is not a positive duration", seconds),
        ))
    }
}

/// Raw kernel estimate `round(slope * t - offset)`, bumped to odd.
pub fn estimate_kernel(exposure_secs: f64, config: &BlurConfig) -> i32 {
    let kernel = (config.slope * exposure_secs - config.offset).round() as i32;
    if kernel % 2 == 0 {
        kernel + 1
    } else {
        kernel
    }
}

/// Kernel size to blur with, or `None` when the exposure is short enough.
pub fn blur_kernel(exposure_secs: f64, config: &BlurConfig) -> Option<i32> {
    let estimate = estimate_kernel(exposure_secs, config);
    if estimate >= 3 {
        Some(config.fixed_kernel.unwrap_or(estimate))
    } else {
        None
    }
}
