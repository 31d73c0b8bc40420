//! Deterministic test doubles shared by the pipeline and batch tests.

use opencv::core;
use opencv::prelude::*;
use std::path::{Path, PathBuf};

use crate::error::{AlignError, Result};
use crate::exposure::ExposureSource;
use crate::features::{Descriptors, FeatureExtractor, Features, Keypoint};
use crate::image_io;

/// Marker positions `(x, y)` in the reference frame. Each gets a distinct value.
pub const MARKERS: [(i32, i32); 12] = [
    (20, 22),
    (35, 18),
    (52, 25),
    (71, 20),
    (24, 41),
    (47, 45),
    (66, 38),
    (78, 52),
    (21, 68),
    (40, 74),
    (58, 63),
    (75, 77),
];

const DESCRIPTOR_LEN: i32 = 32;

pub fn marker_value(i: usize) -> u8 {
    40 + 15 * i as u8
}

/// Black 100x100 image with the markers moved by `(dx, dy)`.
pub fn write_marker_image(dir: &Path, name: &str, dx: i32, dy: i32) -> Result<PathBuf> {
    let mut mat = Mat::new_rows_cols_with_default(100, 100, core::CV_8UC1, core::Scalar::all(0.0))?;
    for (i, &(x, y)) in MARKERS.iter().enumerate() {
        *mat.at_2d_mut::<u8>(y + dy, x + dx)? = marker_value(i);
    }
    let path = dir.join(name);
    image_io::write_image(&path, &mat)?;
    Ok(path)
}

/// Largest absolute pixel difference of two 8-bit gray images inside `region`.
pub fn max_abs_diff(a: &Mat, b: &Mat, region: core::Rect) -> Result<u8> {
    let mut max = 0u8;
    for y in region.y..region.y + region.height {
        for x in region.x..region.x + region.width {
            let pa = *a.at_2d::<u8>(y, x)?;
            let pb = *b.at_2d::<u8>(y, x)?;
            max = max.max(pa.abs_diff(pb));
        }
    }
    Ok(max)
}

/// One keypoint per nonzero pixel, described by its intensity.
#[derive(Debug, Default, Clone, Copy)]
pub struct MarkerExtractor;

impl FeatureExtractor for MarkerExtractor {
    fn extract(&self, gray: &Mat) -> Result<Features> {
        let mut keypoints = Vec::new();
        let mut bytes = Vec::new();
        for y in 0..gray.rows() {
            for x in 0..gray.cols() {
                let value = *gray.at_2d::<u8>(y, x)?;
                if value != 0 {
                    keypoints.push(Keypoint::at(x as f32, y as f32));
                    bytes.extend(std::iter::repeat(value).take(DESCRIPTOR_LEN as usize));
                }
            }
        }
        let descriptors =
            Descriptors::from_bytes(keypoints.len() as i32, DESCRIPTOR_LEN, core::CV_8UC1, &bytes)?;
        Features::new(keypoints, descriptors)
    }
}

/// Same exposure time for every file except the ones marked missing.
#[derive(Debug, Default, Clone)]
pub struct FixedExposure {
    default: Option<f64>,
    missing: Vec<PathBuf>,
}

impl FixedExposure {
    pub fn all(seconds: f64) -> Self {
        Self {
            default: Some(seconds),
            ..Self::default()
        }
    }

    pub fn without(mut self, path: &Path) -> Self {
        self.missing.push(path.to_path_buf());
        self
    }
}

impl ExposureSource for FixedExposure {
    fn exposure_time(&self, path: &Path) -> Result<f64> {
        if self.missing.iter().any(|p| p == path) {
            return Err(AlignError::metadata(path, "no ExposureTime tag"));
        }
        self.default
            .ok_or_else(|| AlignError::metadata(path, "no ExposureTime tag"))
    }
}
