use opencv::prelude::*;
use opencv::{core, imgcodecs};
use std::path::{Path, PathBuf};

use crate::error::{AlignError, Result};

/// Pixel layouts the warper accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Opaque8,
    Alpha8,
    Opaque16,
    Alpha16,
}

impl PixelFormat {
    /// Classify a decoded buffer. Gray and BGR are opaque, BGRA carries alpha.
    pub fn of(mat: &Mat) -> Option<Self> {
        let alpha = match mat.channels() {
            1 | 3 => false,
            4 => true,
            _ => return None,
        };
        match (mat.depth(), alpha) {
            (core::CV_8U, false) => Some(PixelFormat::Opaque8),
            (core::CV_8U, true) => Some(PixelFormat::Alpha8),
            (core::CV_16U, false) => Some(PixelFormat::Opaque16),
            (core::CV_16U, true) => Some(PixelFormat::Alpha16),
            _ => None,
        }
    }

    pub fn has_alpha(self) -> bool {
        matches!(self, PixelFormat::Alpha8 | PixelFormat::Alpha16)
    }

    pub fn bytes_per_channel(self) -> i32 {
        match self {
            PixelFormat::Opaque8 | PixelFormat::Alpha8 => 1,
            PixelFormat::Opaque16 | PixelFormat::Alpha16 => 2,
        }
    }
}

/// A decoded image together with where it came from.
pub struct ImageRecord {
    pub path: PathBuf,
    pub mat: Mat,
    pub format: PixelFormat,
}

impl ImageRecord {
    pub fn from_mat(path: impl Into<PathBuf>, mat: Mat) -> Result<Self> {
        let path = path.into();
        let format = PixelFormat::of(&mat).ok_or_else(|| {
            AlignError::image(
                &path,
                format!(
                    "unsupported pixel layout (depth {}, {} channels)",
                    mat.depth(),
                    mat.channels()
                ),
            )
        })?;
        Ok(Self { path, mat, format })
    }

    pub fn width(&self) -> i32 {
        self.mat.cols()
    }

    pub fn height(&self) -> i32 {
        self.mat.rows()
    }

    pub fn size(&self) -> core::Size {
        core::Size::new(self.width(), self.height())
    }
}

fn path_str(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| AlignError::image(path, "path is not valid UTF-8"))
}

fn read(path: &Path, flags: i32) -> Result<Mat> {
    let start = std::time::Instant::now();
    if !path.is_file() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("image not found: {}", path.display()),
        )
        .into());
    }

    let img = imgcodecs::imread(path_str(path)?, flags)?;
    if img.empty() {
        return Err(AlignError::image(path, "decoder returned an empty image"));
    }

    log::debug!(
        "Loaded {} in {:?} - Size: {}x{}, Channels: {}",
        path.display(),
        start.elapsed(),
        img.cols(),
        img.rows(),
        img.channels()
    );
    Ok(img)
}

/// Load an 8-bit grayscale copy for feature work.
pub fn load_gray(path: &Path) -> Result<Mat> {
    read(path, imgcodecs::IMREAD_GRAYSCALE)
}

/// Load the image at full bit depth, keeping alpha.
pub fn load_unchanged(path: &Path) -> Result<ImageRecord> {
    let mat = read(path, imgcodecs::IMREAD_UNCHANGED)?;
    ImageRecord::from_mat(path, mat)
}

/// Load a BGR copy, used for masks.
pub fn load_color(path: &Path) -> Result<Mat> {
    read(path, imgcodecs::IMREAD_COLOR)
}

pub fn write_image(path: &Path, img: &impl core::ToInputArray) -> Result<()> {
    if !imgcodecs::imwrite(path_str(path)?, img, &core::Vector::new())? {
        return Err(AlignError::image(path, "encoder refused to write the image"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pixel_format_classification() -> Result<()> {
        let gray8 = Mat::new_rows_cols_with_default(4, 4, core::CV_8UC1, core::Scalar::all(0.0))?;
        let bgra8 = Mat::new_rows_cols_with_default(4, 4, core::CV_8UC4, core::Scalar::all(0.0))?;
        let bgr16 = Mat::new_rows_cols_with_default(4, 4, core::CV_16UC3, core::Scalar::all(0.0))?;
        let bgra16 = Mat::new_rows_cols_with_default(4, 4, core::CV_16UC4, core::Scalar::all(0.0))?;
        let float = Mat::new_rows_cols_with_default(4, 4, core::CV_32FC1, core::Scalar::all(0.0))?;

        assert_eq!(PixelFormat::of(&gray8), Some(PixelFormat::Opaque8));
        assert_eq!(PixelFormat::of(&bgra8), Some(PixelFormat::Alpha8));
        assert_eq!(PixelFormat::of(&bgr16), Some(PixelFormat::Opaque16));
        assert_eq!(PixelFormat::of(&bgra16), Some(PixelFormat::Alpha16));
        assert_eq!(PixelFormat::of(&float), None);
        assert!(ImageRecord::from_mat("f.exr", float).is_err());
        Ok(())
    }

    #[test]
    fn test_sixteen_bit_png_keeps_depth() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("deep.png");
        let img = Mat::new_rows_cols_with_default(8, 6, core::CV_16UC3, core::Scalar::all(40000.0))?;
        write_image(&path, &img)?;

        let record = load_unchanged(&path)?;
        assert_eq!(record.format, PixelFormat::Opaque16);
        assert_eq!((record.width(), record.height()), (6, 8));

        let gray = load_gray(&path)?;
        assert_eq!(gray.depth(), core::CV_8U);
        Ok(())
    }

    #[test]
    fn test_missing_image_is_io_error() {
        let err = load_gray(Path::new("/nonexistent/shot.png")).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Io);
    }
}
