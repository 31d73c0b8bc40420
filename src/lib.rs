//! Batch registration of bracketed exposures onto a reference frame.
//!
//! Features are extracted on an exposure-blurred grayscale copy of each
//! image, matched against the cached reference features, refined in two
//! stages and turned into a homography that warps the full image onto the
//! reference pixel grid.

pub mod batch;
pub mod config;
pub mod debug_draw;
pub mod error;
pub mod exposure;
pub mod features;
pub mod homography;
pub mod image_io;
pub mod logger;
pub mod mask;
pub mod matching;
pub mod opencv_compat;
pub mod pipeline;
pub mod refine;
pub mod settings;
pub mod store;
pub mod system_info;
pub mod warp;

#[cfg(test)]
mod test_support;

pub use batch::{split_reference, BatchAligner, BatchReport, QueryOutcome};
pub use config::AlignConfig;
pub use error::{AlignError, BatchError, ErrorKind};
