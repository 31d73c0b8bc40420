use opencv::prelude::*;
use opencv::{core, imgproc};

use crate::config::BorderPolicy;
use crate::error::Result;
use crate::homography::Homography;
use crate::image_io::ImageRecord;

/// Resample `image` into the reference pixel grid of size `target`.
///
/// `homography` maps query coordinates to reference coordinates; OpenCV
/// inverts it and samples the query bilinearly for every target pixel.
/// Pixels with no source are transparent for images with alpha and follow
/// `border` otherwise.
pub fn warp_to_reference(
    image: &ImageRecord,
    homography: &Homography,
    target: core::Size,
    border: BorderPolicy,
) -> Result<ImageRecord> {
    let border_mode = if image.format.has_alpha() {
        core::BORDER_CONSTANT
    } else {
        border.border_mode()
    };

    let mut warped = Mat::default();
    imgproc::warp_perspective(
        &image.mat,
        &mut warped,
        &homography.to_mat()?,
        target,
        imgproc::INTER_LINEAR,
        border_mode,
        core::Scalar::all(0.0),
    )?;

    log::debug!(
        "Warped {} ({}x{}) onto {}x{} reference grid",
        image.path.display(),
        image.width(),
        image.height(),
        target.width,
        target.height
    );

    ImageRecord::from_mat(image.path.clone(), warped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image_io::PixelFormat;

    fn record(typ: i32, value: core::Scalar) -> Result<ImageRecord> {
        let mat = Mat::new_rows_cols_with_default(20, 30, typ, value)?;
        ImageRecord::from_mat("q.png", mat)
    }

    #[test]
    fn test_alpha_images_get_transparent_border() -> Result<()> {
        let image = record(core::CV_8UC4, core::Scalar::all(200.0))?;
        let warped = warp_to_reference(
            &image,
            &Homography::translation(10.0, 0.0),
            core::Size::new(30, 20),
            BorderPolicy::Replicate,
        )?;

        assert_eq!(warped.format, PixelFormat::Alpha8);
        assert_eq!(warped.mat.at_2d::<core::Vec4b>(5, 2)?[3], 0);
        assert_eq!(warped.mat.at_2d::<core::Vec4b>(5, 20)?[3], 200);
        Ok(())
    }

    #[test]
    fn test_opaque_border_policies() -> Result<()> {
        let image = record(core::CV_16UC3, core::Scalar::all(1000.0))?;
        let shift = Homography::translation(0.0, 5.0);
        let size = core::Size::new(30, 20);

        let black = warp_to_reference(&image, &shift, size, BorderPolicy::Black)?;
        assert_eq!(black.format, PixelFormat::Opaque16);
        assert_eq!(black.mat.at_2d::<core::Vec3w>(1, 10)?[0], 0);

        let replicated = warp_to_reference(&image, &shift, size, BorderPolicy::Replicate)?;
        assert_eq!(replicated.mat.at_2d::<core::Vec3w>(1, 10)?[0], 1000);
        Ok(())
    }

    #[test]
    fn test_output_takes_reference_size() -> Result<()> {
        let image = record(core::CV_8UC1, core::Scalar::all(9.0))?;
        let warped = warp_to_reference(
            &image,
            &Homography::identity(),
            core::Size::new(40, 25),
            BorderPolicy::Black,
        )?;
        assert_eq!((warped.width(), warped.height()), (40, 25));
        assert_eq!(*warped.mat.at_2d::<u8>(10, 10)?, 9);
        // source is untouched
        assert_eq!((image.width(), image.height()), (30, 20));
        Ok(())
    }
}
