//! Optional debug visualisations written next to the feature cache.

use opencv::core;
use opencv::prelude::*;
use std::path::Path;

use crate::error::Result;
use crate::features::{to_cv_keypoints, Keypoint};
use crate::image_io::write_image;
use crate::opencv_compat;
use crate::refine::Correspondences;

/// Draw `keypoints` over the grayscale image they were detected on.
pub fn write_keypoints_image(path: &Path, gray: &Mat, keypoints: &[Keypoint]) -> Result<()> {
    let mut out = Mat::default();
    opencv_compat::draw_keypoints(gray, &to_cv_keypoints(keypoints)?, &mut out)?;
    write_image(path, &out)
}

/// Side-by-side view of the final correspondences.
pub fn write_matches_image(
    path: &Path,
    query_gray: &Mat,
    reference_gray: &Mat,
    correspondences: &Correspondences,
) -> Result<()> {
    let mut matches = core::Vector::<core::DMatch>::with_capacity(correspondences.len());
    for m in &correspondences.matches {
        matches.push(m.to_cv());
    }

    let mut out = Mat::default();
    opencv_compat::draw_matches(
        query_gray,
        &to_cv_keypoints(&correspondences.query)?,
        reference_gray,
        &to_cv_keypoints(&correspondences.reference)?,
        &matches,
        &mut out,
    )?;
    write_image(path, &out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matching::Match;

    #[test]
    fn test_debug_images_are_written() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let gray = Mat::new_rows_cols_with_default(40, 40, core::CV_8UC1, core::Scalar::all(80.0))?;
        let keypoints = vec![Keypoint::at(10.0, 10.0), Keypoint::at(30.0, 20.0)];

        let kp_path = dir.path().join("q_keypoints.jpg");
        write_keypoints_image(&kp_path, &gray, &keypoints)?;
        assert!(kp_path.is_file());

        let correspondences = Correspondences {
            query: keypoints.clone(),
            reference: keypoints,
            matches: vec![Match::new(0, 0, 0.0), Match::new(1, 1, 0.0)],
        };
        let matches_path = dir.path().join("q_matches.jpg");
        write_matches_image(&matches_path, &gray, &gray, &correspondences)?;
        assert!(matches_path.is_file());
        Ok(())
    }
}
