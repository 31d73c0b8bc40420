use opencv::prelude::*;
use opencv::{calib3d, core};

use crate::error::{AlignError, FitPass, Result};
use crate::features::Keypoint;

/// Minimum correspondences a projective fit needs.
pub const MIN_CORRESPONDENCES: usize = 4;

/// Projective transform from query pixel coordinates to reference pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Homography(pub [[f64; 3]; 3]);

impl Homography {
    pub fn identity() -> Self {
        Self([[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]])
    }

    pub fn translation(dx: f64, dy: f64) -> Self {
        Self([[1.0, 0.0, dx], [0.0, 1.0, dy], [0.0, 0.0, 1.0]])
    }

    pub fn from_mat(mat: &Mat) -> Result<Self> {
        if mat.rows() != 3 || mat.cols() != 3 {
            return Err(AlignError::invalid_data(format!(
                "homography must be 3x3, got {}x{}",
                mat.rows(),
                mat.cols()
            )));
        }
        let mut h = [[0.0; 3]; 3];
        for (r, row) in h.iter_mut().enumerate() {
            for (c, value) in row.iter_mut().enumerate() {
                *value = *mat.at_2d::<f64>(r as i32, c as i32)?;
            }
        }
        Ok(Self(h))
    }

    pub fn to_mat(&self) -> Result<Mat> {
        Ok(Mat::from_slice_2d(&self.0)?)
    }

    /// Apply the transform with perspective division. `None` for points
    /// mapped to infinity.
    pub fn project(&self, x: f64, y: f64) -> Option<(f64, f64)> {
        let h = &self.0;
        let w = h[2][0] * x + h[2][1] * y + h[2][2];
        if w.abs() < f64::EPSILON {
            return None;
        }
        let px = (h[0][0] * x + h[0][1] * y + h[0][2]) / w;
        let py = (h[1][0] * x + h[1][1] * y + h[1][2]) / w;
        Some((px, py))
    }

    pub fn determinant(&self) -> f64 {
        let m = &self.0;
        m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
            - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
            + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0])
    }

    fn is_usable(&self) -> bool {
        self.0.iter().flatten().all(|v| v.is_finite()) && self.determinant().abs() > 1e-12
    }
}

impl std::fmt::Display for Homography {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for row in &self.0 {
            writeln!(f, "[{:>12.6} {:>12.6} {:>12.6}]", row[0], row[1], row[2])?;
        }
        Ok(())
    }
}

/// Fit a homography mapping `query` points onto `reference` points with RANSAC.
///
/// `pass` only labels the error when the fit fails.
pub fn fit_homography(
    query: &[Keypoint],
    reference: &[Keypoint],
    ransac_threshold: f64,
    pass: FitPass,
) -> Result<Homography> {
    let survivors = query.len().min(reference.len());
    let failed = || AlignError::Geometry { pass, survivors };

    if survivors < MIN_CORRESPONDENCES {
        return Err(failed());
    }

    let mut src_pts = core::Vector::<core::Point2f>::with_capacity(survivors);
    let mut dst_pts = core::Vector::<core::Point2f>::with_capacity(survivors);
    for (q, r) in query.iter().zip(reference) {
        src_pts.push(core::Point2f::new(q.x, q.y));
        dst_pts.push(core::Point2f::new(r.x, r.y));
    }

    let mut inliers = Mat::default();
    let mat = match calib3d::find_homography(
        &src_pts,
        &dst_pts,
        &mut inliers,
        calib3d::RANSAC,
        ransac_threshold,
    ) {
        Ok(mat) => mat,
        Err(e) => {
            log::debug!("find_homography ({}) failed: {}", pass, e);
            return Err(failed());
        }
    };
    if mat.empty() {
        return Err(failed());
    }

    let homography = Homography::from_mat(&mat)?;
    if !homography.is_usable() {
        return Err(failed());
    }
    Ok(homography)
}
