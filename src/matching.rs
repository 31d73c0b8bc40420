use opencv::prelude::*;
use opencv::{core, features2d};

use crate::error::Result;
use crate::features::Descriptors;

/// A correspondence between a query keypoint and a reference keypoint.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Match {
    pub query_index: usize,
    pub reference_index: usize,
    pub distance: f32,
}

impl Match {
    pub fn new(query_index: usize, reference_index: usize, distance: f32) -> Self {
        Self {
            query_index,
            reference_index,
            distance,
        }
    }

    fn from_cv(m: &core::DMatch) -> Self {
        Self::new(m.query_idx as usize, m.train_idx as usize, m.distance)
    }

    pub fn to_cv(&self) -> core::DMatch {
        core::DMatch {
            query_idx: self.query_index as i32,
            train_idx: self.reference_index as i32,
            img_idx: -1,
            distance: self.distance,
        }
    }
}

/// The two nearest reference descriptors of one query descriptor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KnnMatch {
    pub best: Match,
    /// Absent when the reference set holds a single descriptor.
    pub second: Option<Match>,
}

pub trait DescriptorMatcher: Send + Sync {
    /// Two nearest neighbours in `reference` for every row of `query`.
    fn knn_match(&self, query: &Descriptors, reference: &Descriptors) -> Result<Vec<KnnMatch>>;
}

/// Exhaustive matcher under a fixed OpenCV norm.
#[derive(Debug, Clone, Copy)]
pub struct BruteForceMatcher {
    norm_type: i32,
}

impl BruteForceMatcher {
    pub fn new(norm_type: i32) -> Self {
        Self { norm_type }
    }

    pub fn hamming() -> Self {
        Self::new(core::NORM_HAMMING)
    }
}

impl DescriptorMatcher for BruteForceMatcher {
    fn knn_match(&self, query: &Descriptors, reference: &Descriptors) -> Result<Vec<KnnMatch>> {
        if query.is_empty() || reference.is_empty() {
            return Ok(Vec::new());
        }

        let matcher = features2d::BFMatcher::create(self.norm_type, false)?;
        let mut knn = core::Vector::<core::Vector<core::DMatch>>::new();
        matcher.knn_train_match(
            query.as_mat(),
            reference.as_mat(),
            &mut knn,
            2,
            &core::Mat::default(),
            false,
        )?;

        Ok(knn
            .iter()
            .filter_map(|neighbours| {
                let best = Match::from_cv(&neighbours.get(0).ok()?);
                let second = neighbours.get(1).ok().map(|m| Match::from_cv(&m));
                Some(KnnMatch { best, second })
            })
            .collect())
    }
}
