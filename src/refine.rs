//! Two-stage match refinement.
//!
//! Stage A drops ambiguous matches with the ratio test. A coarse homography
//! fitted on the survivors then drives stage B, which drops every match whose
//! projected query point lands too far from its reference point. The final
//! homography is refitted on the stage B survivors.
//!
//! Each stage builds fresh compacted keypoint lists and re-indexes its matches
//! against them, so `matches[i]` always pairs `query[i]` with `reference[i]`.

use crate::error::{FitPass, Result};
use crate::features::Keypoint;
use crate::homography::{fit_homography, Homography};
use crate::matching::{KnnMatch, Match};

/// Matched keypoint pairs after a refinement stage.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Correspondences {
    pub query: Vec<Keypoint>,
    pub reference: Vec<Keypoint>,
    pub matches: Vec<Match>,
}

impl Correspondences {
    pub fn len(&self) -> usize {
        self.matches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matches.is_empty()
    }

    fn push(&mut self, query: Keypoint, reference: Keypoint, distance: f32) {
        let index = self.matches.len();
        self.query.push(query);
        self.reference.push(reference);
        self.matches.push(Match::new(index, index, distance));
    }
}

/// Stage A: keep `best` only if it is clearly closer than `second`.
///
/// Matches without a second neighbour cannot be judged and are dropped, as
/// are matches whose indices fall outside the keypoint lists.
pub fn ratio_test(
    query: &[Keypoint],
    reference: &[Keypoint],
    knn: &[KnnMatch],
    ratio: f32,
) -> Correspondences {
    let mut out = Correspondences::default();
    for candidate in knn {
        let Some(second) = candidate.second else {
            continue;
        };
        let best = candidate.best;
        if !(best.distance < ratio * second.distance) {
            continue;
        }
        match (query.get(best.query_index), reference.get(best.reference_index)) {
            (Some(&q), Some(&r)) => out.push(q, r, best.distance),
            _ => log::warn!(
                "Dropping match {}->{} outside the keypoint lists",
                best.query_index,
                best.reference_index
            ),
        }
    }
    out
}

/// Distance in reference pixels between the projected query point and its
/// reference point. Infinite for points projected to infinity.
pub fn reprojection_distance(query: &Keypoint, reference: &Keypoint, homography: &Homography) -> f64 {
    match homography.project(query.x as f64, query.y as f64) {
        Some((x, y)) => (x - reference.x as f64).hypot(y - reference.y as f64),
        None => f64::INFINITY,
    }
}

/// Stage B: keep pairs consistent with `homography` within `inlier_threshold` pixels.
pub fn geometric_filter(
    stage: &Correspondences,
    homography: &Homography,
    inlier_threshold: f64,
) -> Correspondences {
    let mut out = Correspondences::default();
    for m in &stage.matches {
        let q = stage.query[m.query_index];
        let r = stage.reference[m.reference_index];
        if reprojection_distance(&q, &r, homography) < inlier_threshold {
            out.push(q, r, m.distance);
        }
    }
    out
}

/// Everything the refiner produced, for logging and warping.
#[derive(Debug, Clone)]
pub struct Refinement {
    pub ratio_survivors: Correspondences,
    pub coarse: Homography,
    pub inliers: Correspondences,
    /// Homography used for warping.
    pub homography: Homography,
}

#[derive(Debug, Clone, Copy)]
pub struct TwoStageRefiner {
    pub ratio: f32,
    pub ransac_threshold: f64,
    pub inlier_threshold: f64,
}

impl Default for TwoStageRefiner {
    fn default() -> Self {
        Self {
            ratio: 0.9,
            ransac_threshold: 5.0,
            inlier_threshold: 12.5,
        }
    }
}

impl TwoStageRefiner {
    pub fn refine(
        &self,
        query: &[Keypoint],
        reference: &[Keypoint],
        knn: &[KnnMatch],
    ) -> Result<Refinement> {
        let ratio_survivors = ratio_test(query, reference, knn, self.ratio);
        let coarse = fit_homography(
            &ratio_survivors.query,
            &ratio_survivors.reference,
            self.ransac_threshold,
            FitPass::Coarse,
        )?;

        let inliers = geometric_filter(&ratio_survivors, &coarse, self.inlier_threshold);
        let homography = fit_homography(
            &inliers.query,
            &inliers.reference,
            self.ransac_threshold,
            FitPass::Refined,
        )?;

        Ok(Refinement {
            ratio_survivors,
            coarse,
            inliers,
            homography,
        })
    }
}
