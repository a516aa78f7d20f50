use std::path::Path;

use anyhow::{bail, Context, Result};
use image::{DynamicImage, Rgb, RgbImage};
use ndarray::{Array2, Array3, ArrayD, Axis, Ix2};

/// Canonical single-channel label grid, `(height, width)`.
pub type NormalizedMask = Array2<u8>;

/// Reduce a candidate array to two dimensions. Stacked instance/prompt masks
/// merge by element-wise maximum over the leading axis; arrays with more than
/// three dimensions keep folding their leading axis the same way.
pub fn collapse(mut array: ArrayD<u8>) -> Result<NormalizedMask> {
    if array.ndim() < 2 {
        bail!(
            "mask payload has {} dimension(s); expected 2 or more",
            array.ndim()
        );
    }
    while array.ndim() > 2 {
        if array.len_of(Axis(0)) == 0 {
            bail!("mask payload has an empty stack axis");
        }
        array = array.fold_axis(Axis(0), 0u8, |acc, value| (*acc).max(*value));
    }
    array
        .into_dimensionality::<Ix2>()
        .context("mask payload did not collapse to two dimensions")
}

/// Nearest-neighbour resize. Each output cell copies exactly one source cell,
/// `src = floor(dst * src_len / dst_len)`, so no new label values appear.
pub fn resize_nearest(mask: &NormalizedMask, height: usize, width: usize) -> NormalizedMask {
    let (src_height, src_width) = mask.dim();
    if (src_height, src_width) == (height, width) {
        return mask.clone();
    }
    Array2::from_shape_fn((height, width), |(row, col)| {
        let src_row = (row * src_height / height).min(src_height - 1);
        let src_col = (col * src_width / width).min(src_width - 1);
        mask[[src_row, src_col]]
    })
}

/// Reconcile a normalized mask with the source image resolution.
pub fn postprocess(mask: NormalizedMask, source_shape: (usize, usize)) -> Result<NormalizedMask> {
    let (height, width) = source_shape;
    if height == 0 || width == 0 {
        bail!("source image has zero size ({height}x{width})");
    }
    if mask.is_empty() {
        bail!("mask is empty, nothing to resize");
    }
    if mask.dim() == source_shape {
        return Ok(mask);
    }
    tracing::debug!(
        from = ?mask.dim(),
        to = ?source_shape,
        "resizing mask to source resolution"
    );
    Ok(resize_nearest(&mask, height, width))
}

/// `(height, width)` of an image on disk, read from its header only.
pub fn source_shape(path: &Path) -> Result<(usize, usize)> {
    let (width, height) = image::image_dimensions(path)
        .with_context(|| format!("failed reading image size of {}", path.display()))?;
    Ok((height as usize, width as usize))
}

/// Decoded image as a `(height, width)` grid for grayscale images, or a
/// `(3, height, width)` RGB stack otherwise. Alpha is dropped.
pub fn image_to_array(image: DynamicImage) -> Result<ArrayD<u8>> {
    let (width, height) = (image.width() as usize, image.height() as usize);
    if !image.color().has_color() {
        let gray = image.to_luma8();
        return Ok(Array2::from_shape_vec((height, width), gray.into_raw())?.into_dyn());
    }
    let raw = image.to_rgb8().into_raw();
    let stack = Array3::from_shape_fn((3, height, width), |(channel, row, col)| {
        raw[(row * width + col) * 3 + channel]
    });
    Ok(stack.into_dyn())
}

/// Debug overlay: 70% source image blended with 30% green wherever the mask is set.
pub fn overlay(image: &RgbImage, mask: &NormalizedMask) -> Result<RgbImage> {
    let (width, height) = image.dimensions();
    if mask.dim() != (height as usize, width as usize) {
        bail!(
            "overlay mask is {:?} but image is {}x{}",
            mask.dim(),
            height,
            width
        );
    }
    let blend = |base: u8, tint: u8| -> u8 {
        ((7 * u32::from(base) + 3 * u32::from(tint) + 5) / 10).min(255) as u8
    };
    let mut out = RgbImage::new(width, height);
    for (x, y, pixel) in image.enumerate_pixels() {
        let green = if mask[[y as usize, x as usize]] > 0 { 255 } else { 0 };
        out.put_pixel(
            x,
            y,
            Rgb([
                blend(pixel[0], 0),
                blend(pixel[1], green),
                blend(pixel[2], 0),
            ]),
        );
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use image::{DynamicImage, GrayImage, Luma, Rgb, RgbImage};
    use ndarray::{array, Array3};

    use super::{collapse, image_to_array, overlay, postprocess, resize_nearest, source_shape};

    #[test]
    fn collapse_takes_elementwise_max_over_stack() -> anyhow::Result<()> {
        let stack = Array3::from_shape_vec(
            (3, 2, 2),
            vec![1, 0, 0, 0, 0, 2, 0, 0, 0, 0, 0, 7],
        )?;
        let mask = collapse(stack.into_dyn())?;
        assert_eq!(mask, array![[1u8, 2], [0, 7]]);
        Ok(())
    }

    #[test]
    fn collapse_keeps_two_dimensional_input() -> anyhow::Result<()> {
        let mask = collapse(array![[0u8, 1], [1, 0]].into_dyn())?;
        assert_eq!(mask.dim(), (2, 2));
        Ok(())
    }

    #[test]
    fn collapse_folds_every_leading_axis_of_deeper_arrays() -> anyhow::Result<()> {
        let deep = ndarray::Array4::from_shape_fn((2, 2, 1, 2), |(a, b, _, c)| {
            (a * 4 + b * 2 + c) as u8
        });
        let mask = collapse(deep.into_dyn())?;
        assert_eq!(mask, array![[6u8, 7]]);
        Ok(())
    }

    #[test]
    fn collapse_rejects_flat_payloads() {
        assert!(collapse(ndarray::arr1(&[1u8, 2, 3]).into_dyn()).is_err());
    }

    #[test]
    fn nearest_upscale_replicates_blocks() {
        let small = array![[1u8, 2], [3, 4]];
        let big = resize_nearest(&small, 4, 4);
        assert_eq!(
            big,
            array![[1u8, 1, 2, 2], [1, 1, 2, 2], [3, 3, 4, 4], [3, 3, 4, 4]]
        );
    }

    #[test]
    fn nearest_resize_never_invents_values() {
        let labels = array![[0u8, 255, 0], [255, 0, 9], [9, 9, 0]];
        for (height, width) in [(7, 5), (2, 2), (1, 11), (13, 3)] {
            let resized = resize_nearest(&labels, height, width);
            assert_eq!(resized.dim(), (height, width));
            assert!(resized.iter().all(|value| [0, 9, 255].contains(value)));
        }
    }

    #[test]
    fn postprocess_resizes_only_on_shape_mismatch() -> anyhow::Result<()> {
        let mask = array![[1u8, 0], [0, 1]];
        assert_eq!(postprocess(mask.clone(), (2, 2))?, mask);
        let resized = postprocess(mask, (4, 6))?;
        assert_eq!(resized.dim(), (4, 6));
        assert_eq!(resized[[0, 0]], 1);
        assert_eq!(resized[[3, 5]], 1);
        assert_eq!(resized[[0, 5]], 0);
        Ok(())
    }

    #[test]
    fn source_shape_reads_height_then_width() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("frame.png");
        RgbImage::new(5, 3).save(&path)?;
        assert_eq!(source_shape(&path)?, (3, 5));
        Ok(())
    }

    #[test]
    fn color_images_become_channel_stacks() -> anyhow::Result<()> {
        let mut rgb = RgbImage::new(2, 1);
        rgb.put_pixel(1, 0, Rgb([0, 0, 200]));
        let stack = image_to_array(DynamicImage::ImageRgb8(rgb))?;
        assert_eq!(stack.shape(), &[3, 1, 2]);
        assert_eq!(super::collapse(stack)?, array![[0u8, 200]]);

        let gray = GrayImage::from_pixel(3, 2, Luma([4]));
        assert_eq!(image_to_array(DynamicImage::ImageLuma8(gray))?.shape(), &[2, 3]);
        Ok(())
    }

    #[test]
    fn overlay_tints_masked_pixels_green() -> anyhow::Result<()> {
        let image = RgbImage::from_pixel(2, 1, Rgb([100, 100, 100]));
        let out = overlay(&image, &array![[0u8, 1]])?;
        assert_eq!(out.get_pixel(0, 0), &Rgb([70, 70, 70]));
        assert_eq!(out.get_pixel(1, 0), &Rgb([70, 147, 70]));
        assert!(overlay(&image, &array![[1u8]]).is_err());
        Ok(())
    }
}
