//! OpenCV compatibility wrappers for cross-version support.
//!
//! Newer OpenCV releases keep adding trailing parameters (`AlgorithmHint` on
//! filters, `enable_precise_upscale` on SIFT, `max_points` on AKAZE). The
//! opencv crate generates its signatures from the installed headers, so the
//! full-argument functions differ between distributions.
//!
//! The `_def` variants apply OpenCV's own defaults and exist on every
//! supported version, so the pipeline only calls those.

use opencv::core::{ToInputArray, ToInputOutputArray, ToOutputArray};
use opencv::{core, features2d, imgproc, Result};

/// Normalized box filter of `ksize`×`ksize`.
pub fn box_blur(src: &impl ToInputArray, dst: &mut impl ToOutputArray, ksize: i32) -> Result<()> {
    imgproc::blur_def(src, dst, core::Size::new(ksize, ksize))
}

/// AKAZE with defaults: MLDB descriptors, threshold 0.001, 4 octaves,
/// 4 layers, PM_G2 diffusivity, unlimited points.
pub fn akaze_create() -> Result<core::Ptr<features2d::AKAZE>> {
    features2d::AKAZE::create_def()
}

/// ORB with defaults (500 features, 8 levels, Harris score).
pub fn orb_create() -> Result<core::Ptr<features2d::ORB>> {
    features2d::ORB::create_def()
}

/// SIFT with defaults: all features, 3 layers, contrast 0.04, sigma 1.6.
pub fn sift_create() -> Result<core::Ptr<features2d::SIFT>> {
    features2d::SIFT::create_def()
}

pub fn draw_keypoints(
    image: &impl ToInputArray,
    keypoints: &core::Vector<core::KeyPoint>,
    out_image: &mut impl ToInputOutputArray,
) -> Result<()> {
    features2d::draw_keypoints(
        image,
        keypoints,
        out_image,
        core::Scalar::new(0.0, 0.0, 255.0, 0.0),
        features2d::DrawMatchesFlags::DRAW_RICH_KEYPOINTS,
    )
}

pub fn draw_matches(
    query: &impl ToInputArray,
    query_keypoints: &core::Vector<core::KeyPoint>,
    reference: &impl ToInputArray,
    reference_keypoints: &core::Vector<core::KeyPoint>,
    matches: &core::Vector<core::DMatch>,
    out_image: &mut impl ToInputOutputArray,
) -> Result<()> {
    features2d::draw_matches_def(
        query,
        query_keypoints,
        reference,
        reference_keypoints,
        matches,
        out_image,
    )
}
