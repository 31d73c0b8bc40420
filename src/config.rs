use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use opencv::core;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeatureDetector {
    ORB,
    SIFT,
    AKAZE,
}

impl FeatureDetector {
    /// Distance metric matching the descriptor type this detector emits.
    pub fn norm_type(self) -> i32 {
        match self {
            FeatureDetector::ORB => core::NORM_HAMMING,
            FeatureDetector::SIFT => core::NORM_L2,
            FeatureDetector::AKAZE => core::NORM_HAMMING,
        }
    }
}

impl std::fmt::Display for FeatureDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FeatureDetector::ORB => write!(f, "ORB (Fast)"),
            FeatureDetector::SIFT => write!(f, "SIFT (Best Quality)"),
            FeatureDetector::AKAZE => write!(f, "AKAZE (Balanced)"),
        }
    }
}

/// Calibration of the exposure-time to blur-kernel estimate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlurConfig {
    /// Kernel grows by this much per second of exposure.
    pub slope: f64,
    pub offset: f64,
    /// Box kernel used whenever blur is required. `None` uses the estimate itself.
    pub fixed_kernel: Option<i32>,
}

impl Default for BlurConfig {
    fn default() -> Self {
        Self {
            slope: 87.5,
            offset: 1.6,
            fixed_kernel: Some(7),
        }
    }
}

/// Restricts reference keypoints to the regions marked in a mask image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaskConfig {
    pub path: PathBuf,
    /// Mask pixels per reference pixel. The usual mask is drawn at half resolution.
    pub scale: f64,
    /// BGR channel inspected; a nonzero value keeps the keypoint.
    pub channel: usize,
}

impl MaskConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            scale: 0.5,
            channel: 2,
        }
    }
}

/// Fill policy for pixels that map outside the query image.
/// Images with alpha are always filled transparent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BorderPolicy {
    Black,
    Replicate,
}

impl BorderPolicy {
    pub fn border_mode(self) -> i32 {
        match self {
            BorderPolicy::Black => core::BORDER_CONSTANT,
            BorderPolicy::Replicate => core::BORDER_REPLICATE,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlignConfig {
    pub feature_detector: FeatureDetector,
    // Refinement
    pub ratio_threshold: f32,
    pub ransac_threshold: f64,
    pub inlier_threshold: f64,
    pub blur: BlurConfig,
    pub mask: Option<MaskConfig>,
    // Worker pool
    pub workers: Option<usize>,
    pub max_workers: usize,
    // Output
    pub output_dir: PathBuf,
    pub cache_dir: Option<PathBuf>,
    pub aligned_prefix: String,
    pub output_extension: String,
    pub border: BorderPolicy,
    pub write_debug_images: bool,
    pub keep_scratch: bool,
    pub copy_reference: bool,
}

impl AlignConfig {
    /// Directory holding keypoint/descriptor caches and per-image logs.
    pub fn cache_dir(&self) -> PathBuf {
        self.cache_dir
            .clone()
            .unwrap_or_else(|| self.output_dir.clone())
    }

    /// Output path of the aligned version of `query`: the full file name,
    /// extension included, so `a.jpg` and `a.tif` never share an output.
    pub fn aligned_path(&self, query: &std::path::Path) -> PathBuf {
        let name = query.file_name().unwrap_or_default().to_string_lossy();
        self.output_dir.join(format!(
            "{}{}.{}",
            self.aligned_prefix, name, self.output_extension
        ))
    }

    /// Output path of the re-encoded reference image.
    pub fn reference_copy_path(&self) -> PathBuf {
        self.output_dir.join(format!(
            "{}000.{}",
            self.aligned_prefix, self.output_extension
        ))
    }

    /// True for files produced by an earlier run.
    pub fn is_aligned_output(&self, path: &std::path::Path) -> bool {
        path.file_name()
            .map(|name| name.to_string_lossy().starts_with(&self.aligned_prefix))
            .unwrap_or(false)
    }
}

impl Default for AlignConfig {
    fn default() -> Self {
        Self {
            feature_detector: FeatureDetector::AKAZE,
            ratio_threshold: 0.9,
            ransac_threshold: 5.0,
            inlier_threshold: 12.5,
            blur: BlurConfig::default(),
            mask: None,
            workers: None,
            max_workers: 8,
            output_dir: PathBuf::from("."),
            cache_dir: None,
            aligned_prefix: "al_".to_string(),
            output_extension: "tif".to_string(),
            border: BorderPolicy::Black,
            write_debug_images: false,
            keep_scratch: false,
            copy_reference: true,
        }
    }
}
