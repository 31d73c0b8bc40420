//! Error types for the alignment pipeline.
//!
//! `AlignError` covers everything that can go wrong while aligning a single
//! query image. Those errors stay local to one query. `BatchError` is reserved
//! for conditions that stop the whole batch.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Which homography fit failed inside the refiner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FitPass {
    /// Fit on the ratio-test survivors.
    Coarse,
    /// Fit on the geometrically consistent survivors, used for warping.
    Refined,
}

impl fmt::Display for FitPass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FitPass::Coarse => write!(f, "pass 1"),
            FitPass::Refined => write!(f, "pass 2"),
        }
    }
}

/// Coarse classification used in batch reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Metadata,
    NotFound,
    Geometry,
    Io,
    Vision,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Metadata => "metadata",
            ErrorKind::NotFound => "not found",
            ErrorKind::Geometry => "geometry",
            ErrorKind::Io => "io",
            ErrorKind::Vision => "vision",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum AlignError {
    #[error("cannot read exposure time of {path}: {reason}")]
    Metadata { path: PathBuf, reason: String },

    #[error("cache artifact missing: {path}")]
    NotFound { path: PathBuf },

    #[error("homography {pass} failed with {survivors} correspondences")]
    Geometry { pass: FitPass, survivors: usize },

    #[error("cannot use image {path}: {reason}")]
    Image { path: PathBuf, reason: String },

    #[error("output {output} of {path} is already written by another image")]
    OutputConflict { path: PathBuf, output: PathBuf },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("opencv: {0}")]
    OpenCv(#[from] opencv::Error),
}

impl AlignError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AlignError::Metadata { .. } => ErrorKind::Metadata,
            AlignError::NotFound { .. } => ErrorKind::NotFound,
            AlignError::Geometry { .. } => ErrorKind::Geometry,
            AlignError::Image { .. } | AlignError::OutputConflict { .. } | AlignError::Io(_) => {
                ErrorKind::Io
            }
            AlignError::OpenCv(_) => ErrorKind::Vision,
        }
    }

    pub(crate) fn metadata(path: impl Into<PathBuf>, reason: impl fmt::Display) -> Self {
        AlignError::Metadata {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn image(path: impl Into<PathBuf>, reason: impl fmt::Display) -> Self {
        AlignError::Image {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn invalid_data(reason: impl fmt::Display) -> Self {
        AlignError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            reason.to_string(),
        ))
    }
}

/// Errors that abort a whole batch.
#[derive(Debug, Error)]
pub enum BatchError {
    #[error("no query images to align")]
    NoQueries,

    #[error("reference image {path} cannot be prepared: {source}")]
    Reference {
        path: PathBuf,
        #[source]
        source: AlignError,
    },

    #[error("cannot start worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AlignError>;
