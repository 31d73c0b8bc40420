//! Alignment of one query image against a prepared reference frame.

use opencv::core;
use opencv::prelude::*;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::AlignConfig;
use crate::debug_draw;
use crate::error::{AlignError, Result};
use crate::exposure::{blur_kernel, ExposureSource};
use crate::features::{prepare_gray, FeatureExtractor, Features};
use crate::image_io::{self, PixelFormat};
use crate::mask::filter_by_mask;
use crate::matching::DescriptorMatcher;
use crate::refine::TwoStageRefiner;
use crate::store::{CacheKey, FeatureStore};
use crate::warp::warp_to_reference;

/// Free-text diagnostics for one image, written to `<key>_log.txt`.
#[derive(Debug, Default)]
pub struct AlignLog {
    text: String,
}

impl AlignLog {
    pub fn new(reference: &Path, query: &Path) -> Self {
        let mut log = Self::default();
        log.line(format_args!("Reference img: {}", reference.display()));
        log.line(format_args!("Query img: {}\n", query.display()));
        log
    }

    pub fn line(&mut self, args: std::fmt::Arguments<'_>) {
        let _ = self.text.write_fmt(args);
        self.text.push('\n');
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        std::fs::write(path, &self.text)?;
        Ok(())
    }
}

/// Reference image whose features are already in the store.
#[derive(Debug, Clone)]
pub struct ReferenceFrame {
    pub path: PathBuf,
    pub key: CacheKey,
    pub size: core::Size,
    pub format: PixelFormat,
}

/// Result of a successful alignment.
#[derive(Debug, Clone)]
pub struct AlignedImage {
    pub query: PathBuf,
    pub output: PathBuf,
    pub key: CacheKey,
    pub matches: usize,
    pub ratio_survivors: usize,
    pub inliers: usize,
}

/// Runs extraction, matching, refinement and warping for single image pairs.
pub struct Aligner {
    config: AlignConfig,
    store: FeatureStore,
    extractor: Arc<dyn FeatureExtractor>,
    matcher: Arc<dyn DescriptorMatcher>,
    exposure: Arc<dyn ExposureSource>,
    refiner: TwoStageRefiner,
}

impl Aligner {
    pub fn new(
        config: AlignConfig,
        extractor: Arc<dyn FeatureExtractor>,
        matcher: Arc<dyn DescriptorMatcher>,
        exposure: Arc<dyn ExposureSource>,
    ) -> Self {
        let store = FeatureStore::new(config.cache_dir());
        let refiner = TwoStageRefiner {
            ratio: config.ratio_threshold,
            ransac_threshold: config.ransac_threshold,
            inlier_threshold: config.inlier_threshold,
        };
        Self {
            config,
            store,
            extractor,
            matcher,
            exposure,
            refiner,
        }
    }

    pub fn config(&self) -> &AlignConfig {
        &self.config
    }

    pub fn store(&self) -> &FeatureStore {
        &self.store
    }

    pub fn log_path(&self, key: &CacheKey) -> PathBuf {
        self.store.dir().join(format!("{}_log.txt", key))
    }

    fn debug_path(&self, key: &CacheKey, what: &str) -> PathBuf {
        self.store.dir().join(format!("{}_{}.jpg", key, what))
    }

    /// Grayscale copy of `path`, blurred according to its exposure time.
    fn prepared_gray(&self, path: &Path, log: &mut AlignLog) -> Result<Mat> {
        let exposure = self.exposure.exposure_time(path)?;
        let kernel = blur_kernel(exposure, &self.config.blur);
        log.line(format_args!(
            "{} exposure time: {:.6} s, blur kernel: {}",
            path.file_name().unwrap_or_default().to_string_lossy(),
            exposure,
            kernel.map_or_else(|| "none".to_string(), |k| format!("{}x{}", k, k))
        ));
        prepare_gray(image_io::load_gray(path)?, kernel)
    }

    /// Compute the reference features once and cache them.
    ///
    /// A cache hit skips extraction entirely. This must complete before any
    /// worker calls [`Aligner::align`] with the returned frame.
    pub fn prepare_reference(&self, reference: &Path) -> Result<ReferenceFrame> {
        let key = CacheKey::for_image(reference)?.as_reference();
        let full = image_io::load_unchanged(reference)?;
        let frame = ReferenceFrame {
            path: reference.to_path_buf(),
            key: key.clone(),
            size: full.size(),
            format: full.format,
        };
        drop(full);

        if self.store.contains(&key) {
            log::info!("Reference features for {} loaded from cache", reference.display());
            return Ok(frame);
        }

        let mut log = AlignLog::new(reference, reference);
        let gray = self.prepared_gray(reference, &mut log)?;
        let mut features = self.extractor.extract(&gray)?;
        log.line(format_args!("found {} keypoints in reference img", features.len()));

        if let Some(ref mask_config) = self.config.mask {
            let mask = image_io::load_color(&mask_config.path)?;
            features = filter_by_mask(features, &mask, mask_config)?;
            log.line(format_args!(
                "{} keypoints left after filter using mask",
                features.len()
            ));
        }

        self.store.save(&features, &key)?;
        if self.config.write_debug_images {
            debug_draw::write_keypoints_image(
                &self.debug_path(&key, "keypoints"),
                &gray,
                features.keypoints(),
            )?;
        }
        log.write_to(&self.log_path(&key))?;

        log::info!(
            "Reference {}: {} keypoints cached as {}",
            reference.display(),
            features.len(),
            key
        );
        Ok(frame)
    }

    fn query_features(&self, key: &CacheKey, gray: &Mat, log: &mut AlignLog) -> Result<Features> {
        if self.store.contains(key) {
            let features = self.store.load(key)?;
            log.line(format_args!("load {} keypoints for query img from file", features.len()));
            return Ok(features);
        }
        let features = self.extractor.extract(gray)?;
        self.store.save(&features, key)?;
        log.line(format_args!("found {} keypoints in query img", features.len()));
        Ok(features)
    }

    /// Align `query` onto `reference` and write the warped image.
    ///
    /// The per-image log is written whether or not the alignment succeeds.
    pub fn align(&self, reference: &ReferenceFrame, query: &Path) -> Result<AlignedImage> {
        let key = CacheKey::for_image(query)?;
        let mut log = AlignLog::new(&reference.path, query);

        let result = self.align_logged(reference, query, &key, &mut log);
        if let Err(ref e) = result {
            log.line(format_args!("\nFAILED ({}): {}", e.kind(), e));
        }
        if let Err(e) = log.write_to(&self.log_path(&key)) {
            log::warn!("Cannot write log for {}: {}", query.display(), e);
        }
        result
    }

    fn align_logged(
        &self,
        reference: &ReferenceFrame,
        query: &Path,
        key: &CacheKey,
        log: &mut AlignLog,
    ) -> Result<AlignedImage> {
        let query_gray = self.prepared_gray(query, log)?;
        let query_features = self.query_features(key, &query_gray, log)?;

        let reference_features = match self.store.load(&reference.key) {
            Ok(features) => features,
            Err(e @ AlignError::NotFound { .. }) => {
                log::error!(
                    "Reference cache for {} vanished before {} was aligned: {}",
                    reference.path.display(),
                    query.display(),
                    e
                );
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        log.line(format_args!(
            "load {} keypoints for reference img from file",
            reference_features.len()
        ));

        if self.config.write_debug_images {
            debug_draw::write_keypoints_image(
                &self.debug_path(key, "keypoints"),
                &query_gray,
                query_features.keypoints(),
            )?;
        }

        let knn = self
            .matcher
            .knn_match(query_features.descriptors(), reference_features.descriptors())?;
        log.line(format_args!("{} matches has been found between images", knn.len()));

        let refinement = self.refiner.refine(
            query_features.keypoints(),
            reference_features.keypoints(),
            &knn,
        );
        let refinement = match refinement {
            Ok(r) => r,
            Err(e) => {
                log::warn!("{}: {}", query.display(), e);
                return Err(e);
            }
        };
        log.line(format_args!(
            "{} matches left after first refinement",
            refinement.ratio_survivors.len()
        ));
        log.line(format_args!(
            "{} matches left after second refinement",
            refinement.inliers.len()
        ));
        log.line(format_args!("homography:\n{}", refinement.homography));

        if self.config.write_debug_images {
            let reference_gray = image_io::load_gray(&reference.path)?;
            debug_draw::write_matches_image(
                &self.debug_path(key, "matches"),
                &query_gray,
                &reference_gray,
                &refinement.inliers,
            )?;
        }
        drop(query_gray);

        let full = image_io::load_unchanged(query)?;
        let warped = warp_to_reference(&full, &refinement.homography, reference.size, self.config.border)?;
        drop(full);

        let output = self.config.aligned_path(query);
        image_io::write_image(&output, &warped.mat)?;
        log.line(format_args!("aligned image written to {}", output.display()));

        log::info!(
            "Aligned {} ({} of {} matches kept) -> {}",
            query.display(),
            refinement.inliers.len(),
            knn.len(),
            output.display()
        );

        Ok(AlignedImage {
            query: query.to_path_buf(),
            output,
            key: key.clone(),
            matches: knn.len(),
            ratio_survivors: refinement.ratio_survivors.len(),
            inliers: refinement.inliers.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::matching::BruteForceMatcher;
    use crate::test_support::{self, FixedExposure, MarkerExtractor};

    fn test_config(dir: &Path) -> AlignConfig {
        AlignConfig {
            output_dir: dir.join("out"),
            output_extension: "png".to_string(),
            ..AlignConfig::default()
        }
    }

    fn aligner(dir: &Path, exposure: FixedExposure) -> Aligner {
        aligner_with(test_config(dir), exposure)
    }

    fn aligner_with(config: AlignConfig, exposure: FixedExposure) -> Aligner {
        std::fs::create_dir_all(&config.output_dir).unwrap();
        Aligner::new(
            config,
            Arc::new(MarkerExtractor),
            Arc::new(BruteForceMatcher::hamming()),
            Arc::new(exposure),
        )
    }

    #[test]
    fn test_translated_query_realigns() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let reference = test_support::write_marker_image(dir.path(), "ref.png", 0, 0)?;
        let query = test_support::write_marker_image(dir.path(), "q1.png", 5, -3)?;
        let aligner = aligner(dir.path(), FixedExposure::all(0.01));

        let frame = aligner.prepare_reference(&reference)?;
        assert!(aligner.store().contains(&frame.key));

        let aligned = aligner.align(&frame, &query)?;
        assert_eq!(aligned.inliers, test_support::MARKERS.len());
        assert_eq!(aligned.output, dir.path().join("out").join("al_q1.png.png"));

        let warped = image_io::load_gray(&aligned.output)?;
        let original = image_io::load_gray(&reference)?;
        assert_eq!((warped.cols(), warped.rows()), (100, 100));
        let max_error = test_support::max_abs_diff(&warped, &original, core::Rect::new(0, 3, 95, 97))?;
        assert!(max_error <= 1, "max pixel error {}", max_error);

        let log = std::fs::read_to_string(aligner.log_path(&aligned.key))?;
        assert!(log.contains("matches left after second refinement"));
        Ok(())
    }

    #[test]
    fn test_missing_reference_cache_is_not_found() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let reference = test_support::write_marker_image(dir.path(), "ref.png", 0, 0)?;
        let query = test_support::write_marker_image(dir.path(), "q1.png", 2, 2)?;
        let aligner = aligner(dir.path(), FixedExposure::all(0.01));

        let frame = aligner.prepare_reference(&reference)?;
        aligner.store().remove(&frame.key)?;

        let err = aligner.align(&frame, &query).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        Ok(())
    }

    #[test]
    fn test_missing_exposure_fails_before_extraction() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let reference = test_support::write_marker_image(dir.path(), "ref.png", 0, 0)?;
        let query = test_support::write_marker_image(dir.path(), "q1.png", 1, 1)?;
        let aligner = aligner(dir.path(), FixedExposure::all(0.01).without(&query));

        let frame = aligner.prepare_reference(&reference)?;
        let err = aligner.align(&frame, &query).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Metadata);

        let key = CacheKey::for_image(&query)?;
        assert!(!aligner.store().contains(&key));
        let log = std::fs::read_to_string(aligner.log_path(&key))?;
        assert!(log.contains("FAILED (metadata)"));
        Ok(())
    }

    #[test]
    fn test_featureless_query_is_geometry_error() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let reference = test_support::write_marker_image(dir.path(), "ref.png", 0, 0)?;
        let blank = dir.path().join("blank.png");
        let mat = Mat::new_rows_cols_with_default(100, 100, core::CV_8UC1, core::Scalar::all(0.0))?;
        image_io::write_image(&blank, &mat)?;
        let aligner = aligner(dir.path(), FixedExposure::all(0.01));

        let frame = aligner.prepare_reference(&reference)?;
        match aligner.align(&frame, &blank) {
            Err(AlignError::Geometry { survivors, .. }) => assert_eq!(survivors, 0),
            other => panic!("expected geometry error, got {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn test_reference_cache_hit_skips_extraction() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let reference = test_support::write_marker_image(dir.path(), "ref.png", 0, 0)?;
        let aligner = aligner(dir.path(), FixedExposure::all(0.01));

        let first = aligner.prepare_reference(&reference)?;
        let cached = aligner.store().load(&first.key)?;

        // a cache hit no longer needs exposure metadata
        let strict = Aligner::new(
            aligner.config().clone(),
            Arc::new(MarkerExtractor),
            Arc::new(BruteForceMatcher::hamming()),
            Arc::new(FixedExposure::default()),
        );
        let second = strict.prepare_reference(&reference)?;
        assert_eq!(second.key, first.key);
        assert_eq!(strict.store().load(&second.key)?.keypoints(), cached.keypoints());
        Ok(())
    }

    #[test]
    fn test_debug_images_follow_cache_keys() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let reference = test_support::write_marker_image(dir.path(), "ref.png", 0, 0)?;
        let query = test_support::write_marker_image(dir.path(), "q1.png", -2, 4)?;
        let config = AlignConfig {
            write_debug_images: true,
            ..test_config(dir.path())
        };
        let aligner = aligner_with(config, FixedExposure::all(0.01));

        let frame = aligner.prepare_reference(&reference)?;
        let aligned = aligner.align(&frame, &query)?;

        let reference_keypoints = aligner.debug_path(&frame.key, "keypoints");
        let query_keypoints = aligner.debug_path(&aligned.key, "keypoints");
        let matches = aligner.debug_path(&aligned.key, "matches");
        for path in [&reference_keypoints, &query_keypoints, &matches] {
            assert!(path.is_file(), "{} missing", path.display());
        }
        assert_eq!(
            matches.file_name().unwrap().to_string_lossy(),
            format!("{}_matches.jpg", aligned.key)
        );

        // side by side: the matches view is wider than either input
        let view = image_io::load_color(&matches)?;
        assert_eq!((view.cols(), view.rows()), (200, 100));
        Ok(())
    }

    #[test]
    fn test_masked_reference_does_not_leak_into_query_entry() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let reference = test_support::write_marker_image(dir.path(), "ref.png", 0, 0)?;

        // half-resolution mask keeping the left half of the frame
        let mut mask = Mat::new_rows_cols_with_default(50, 50, core::CV_8UC3, core::Scalar::all(0.0))?;
        for row in 0..50 {
            for col in 0..25 {
                mask.at_2d_mut::<core::Vec3b>(row, col)?[2] = 255;
            }
        }
        let mask_path = dir.path().join("mask.png");
        image_io::write_image(&mask_path, &mask)?;

        let config = AlignConfig {
            mask: Some(crate::config::MaskConfig::new(&mask_path)),
            ..test_config(dir.path())
        };
        let aligner = aligner_with(config, FixedExposure::all(0.01));

        let frame = aligner.prepare_reference(&reference)?;
        let left_half = test_support::MARKERS.iter().filter(|&&(x, _)| x < 50).count();
        assert_eq!(aligner.store().load(&frame.key)?.len(), left_half);

        // the reference file used as a query gets its own, unmasked entry
        let _ = aligner.align(&frame, &reference);
        let query_key = CacheKey::for_image(&reference)?;
        assert_ne!(query_key, frame.key);
        assert_eq!(aligner.store().load(&query_key)?.len(), test_support::MARKERS.len());
        assert_eq!(aligner.store().load(&frame.key)?.len(), left_half);
        Ok(())
    }
}
