use opencv::prelude::*;
use opencv::core;

use crate::config::FeatureDetector;
use crate::error::{AlignError, Result};
use crate::opencv_compat;

/// A detected feature location with its scale-space metadata.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    pub size: f32,
    /// Orientation in degrees, -1 when not applicable.
    pub angle: f32,
    pub response: f32,
    pub octave: i32,
    pub class_id: i32,
}

impl Keypoint {
    /// A keypoint at `(x, y)` with neutral metadata.
    pub fn at(x: f32, y: f32) -> Self {
        Self {
            x,
            y,
            size: 1.0,
            angle: -1.0,
            response: 0.0,
            octave: 0,
            class_id: -1,
        }
    }

    pub fn from_cv(kp: &core::KeyPoint) -> Self {
        let pt = kp.pt();
        Self {
            x: pt.x,
            y: pt.y,
            size: kp.size(),
            angle: kp.angle(),
            response: kp.response(),
            octave: kp.octave(),
            class_id: kp.class_id(),
        }
    }

    pub fn to_cv(&self) -> Result<core::KeyPoint> {
        Ok(core::KeyPoint::new_coords(
            self.x,
            self.y,
            self.size,
            self.angle,
            self.response,
            self.octave,
            self.class_id,
        )?)
    }
}

pub fn to_cv_keypoints(keypoints: &[Keypoint]) -> Result<core::Vector<core::KeyPoint>> {
    let mut out = core::Vector::with_capacity(keypoints.len());
    for kp in keypoints {
        out.push(kp.to_cv()?);
    }
    Ok(out)
}

/// Descriptor matrix, one row per keypoint.
///
/// Binary detectors produce `CV_8U` rows, SIFT produces `CV_32F` rows. The
/// matrix is always kept continuous so rows can be copied as bytes.
#[derive(Debug)]
pub struct Descriptors {
    mat: Mat,
}

impl Descriptors {
    pub fn empty() -> Self {
        Self { mat: Mat::default() }
    }

    pub fn from_mat(mat: Mat) -> Result<Self> {
        if mat.empty() || mat.rows() == 0 {
            return Ok(Self::empty());
        }
        if mat.channels() != 1 {
            return Err(AlignError::invalid_data(format!(
                "descriptor matrix must be single-channel, got {} channels",
                mat.channels()
            )));
        }
        let mat = if mat.is_continuous() { mat } else { mat.try_clone()? };
        Ok(Self { mat })
    }

    /// Build from raw row-major bytes as stored on disk.
    pub fn from_bytes(rows: i32, cols: i32, typ: i32, bytes: &[u8]) -> Result<Self> {
        if rows == 0 {
            return Ok(Self::empty());
        }
        let mut mat = Mat::new_rows_cols_with_default(rows, cols, typ, core::Scalar::all(0.0))?;
        let dst = mat.data_bytes_mut()?;
        if dst.len() != bytes.len() {
            return Err(AlignError::invalid_data(format!(
                "descriptor payload has {} bytes, expected {}",
                bytes.len(),
                dst.len()
            )));
        }
        dst.copy_from_slice(bytes);
        Self::from_mat(mat)
    }

    pub fn len(&self) -> usize {
        self.mat.rows().max(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn cols(&self) -> i32 {
        self.mat.cols()
    }

    pub fn typ(&self) -> i32 {
        self.mat.typ()
    }

    pub fn as_mat(&self) -> &Mat {
        &self.mat
    }

    pub fn as_bytes(&self) -> Result<&[u8]> {
        if self.is_empty() {
            return Ok(&[]);
        }
        Ok(self.mat.data_bytes()?)
    }

    fn row_bytes(&self) -> Result<usize> {
        Ok(self.mat.cols() as usize * self.mat.elem_size()?)
    }

    /// New matrix holding the given rows, in the given order.
    pub fn select(&self, rows: &[usize]) -> Result<Self> {
        if rows.is_empty() {
            return Ok(Self::empty());
        }
        let row_bytes = self.row_bytes()?;
        let src = self.as_bytes()?;

        let mut mat = Mat::new_rows_cols_with_default(
            rows.len() as i32,
            self.mat.cols(),
            self.mat.typ(),
            core::Scalar::all(0.0),
        )?;
        let dst = mat.data_bytes_mut()?;
        for (out_row, &row) in rows.iter().enumerate() {
            if row >= self.len() {
                return Err(AlignError::invalid_data(format!(
                    "descriptor row {} out of range ({} rows)",
                    row,
                    self.len()
                )));
            }
            dst[out_row * row_bytes..(out_row + 1) * row_bytes]
                .copy_from_slice(&src[row * row_bytes..(row + 1) * row_bytes]);
        }
        Ok(Self { mat })
    }
}

/// Keypoints with their index-aligned descriptors.
#[derive(Debug)]
pub struct Features {
    keypoints: Vec<Keypoint>,
    descriptors: Descriptors,
}

impl Features {
    pub fn new(keypoints: Vec<Keypoint>, descriptors: Descriptors) -> Result<Self> {
        if keypoints.len() != descriptors.len() {
            return Err(AlignError::invalid_data(format!(
                "{} keypoints but {} descriptors",
                keypoints.len(),
                descriptors.len()
            )));
        }
        Ok(Self {
            keypoints,
            descriptors,
        })
    }

    pub fn empty() -> Self {
        Self {
            keypoints: Vec::new(),
            descriptors: Descriptors::empty(),
        }
    }

    pub fn keypoints(&self) -> &[Keypoint] {
        &self.keypoints
    }

    pub fn descriptors(&self) -> &Descriptors {
        &self.descriptors
    }

    pub fn len(&self) -> usize {
        self.keypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty()
    }

    /// Keep the entries at `indices`, preserving their order.
    pub fn select(&self, indices: &[usize]) -> Result<Self> {
        let descriptors = self.descriptors.select(indices)?;
        let keypoints = indices.iter().map(|&i| self.keypoints[i]).collect();
        Self::new(keypoints, descriptors)
    }
}

/// Detects keypoints and computes their descriptors on a grayscale image.
///
/// Implementations must be deterministic: the reference cache is only valid
/// if the same pixels always yield the same features.
pub trait FeatureExtractor: Send + Sync {
    fn extract(&self, gray: &Mat) -> Result<Features>;
}

/// Extractor backed by the OpenCV feature detectors.
#[derive(Debug, Clone, Copy)]
pub struct OpenCvExtractor {
    detector: FeatureDetector,
}

impl OpenCvExtractor {
    pub fn new(detector: FeatureDetector) -> Self {
        Self { detector }
    }
}

impl FeatureExtractor for OpenCvExtractor {
    fn extract(&self, gray: &Mat) -> Result<Features> {
        let mut keypoints = core::Vector::<core::KeyPoint>::new();
        let mut descriptors = Mat::default();
        let mask = Mat::default();

        match self.detector {
            FeatureDetector::AKAZE => {
                let mut akaze = opencv_compat::akaze_create()?;
                akaze.detect_and_compute(gray, &mask, &mut keypoints, &mut descriptors, false)?;
            }
            FeatureDetector::ORB => {
                let mut orb = opencv_compat::orb_create()?;
                orb.detect_and_compute(gray, &mask, &mut keypoints, &mut descriptors, false)?;
            }
            FeatureDetector::SIFT => {
                let mut sift = opencv_compat::sift_create()?;
                sift.detect_and_compute(gray, &mask, &mut keypoints, &mut descriptors, false)?;
            }
        }

        let keypoints = keypoints.iter().map(|kp| Keypoint::from_cv(&kp)).collect();
        Features::new(keypoints, Descriptors::from_mat(descriptors)?)
    }
}

/// Apply the exposure-derived box blur, if any.
pub fn prepare_gray(gray: Mat, kernel: Option<i32>) -> Result<Mat> {
    match kernel {
        Some(k) if k >= 3 => {
            let mut blurred = Mat::default();
            opencv_compat::box_blur(&gray, &mut blurred, k)?;
            Ok(blurred)
        }
        _ => Ok(gray),
    }
}
