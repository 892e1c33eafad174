//! Object extraction: turns an image plus its annotation masks into per-object
//! sub-images whose background is fully transparent.

use std::path::Path;

use image::{DynamicImage, GenericImageView, GrayImage, Rgba, RgbaImage, RgbImage};
use imageproc::contours::{find_contours, BorderType};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::annotations::{AnnotationSource, Mask};
use crate::error::{Error, Result};
use crate::preprocessing;

/// How an object is cut out of its image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CropMode
{
    /// One crop per external contour, sized to the contour's bounding box.
    Tight,
    /// One crop per mask, keeping the full image dimensions.
    FullFrame,
}

/// Axis-aligned box in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundingBox
{
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// A cut-out object. Pixels outside the object have alpha 0 and zeroed colour.
#[derive(Debug, Clone)]
pub struct ObjectCrop
{
    pub image: RgbaImage,
    /// Where the crop sits in the source image.
    pub bbox: BoundingBox,
}

impl ObjectCrop
{
    /// Drops the alpha channel; removed background becomes black.
    pub fn into_rgb(self) -> DynamicImage
    {
        DynamicImage::ImageRgb8(DynamicImage::ImageRgba8(self.image).to_rgb8())
    }
}

/// Bounding boxes of the outermost contours of a mask.
/// Holes, and anything nested inside a hole, do not produce boxes.
pub fn external_bounding_boxes(mask: &Mask) -> Vec<BoundingBox>
{
    // Objects touching the image edge are labelled unreliably, so trace a
    // copy with a one-pixel empty border and shift the points back.
    let mut padded = GrayImage::new(mask.width() + 2, mask.height() + 2);
    for (x, y, pixel) in mask.enumerate_pixels()
    {
        padded.put_pixel(x + 1, y + 1, *pixel);
    }

    find_contours::<i32>(&padded)
        .into_iter()
        .filter(|contour| contour.border_type == BorderType::Outer && contour.parent.is_none())
        .filter_map(|contour| {
            let min_x = contour.points.iter().map(|p| p.x).min()? - 1;
            let max_x = contour.points.iter().map(|p| p.x).max()? - 1;
            let min_y = contour.points.iter().map(|p| p.y).min()? - 1;
            let max_y = contour.points.iter().map(|p| p.y).max()? - 1;
            Some(BoundingBox {
                x: min_x as u32,
                y: min_y as u32,
                width: (max_x - min_x + 1) as u32,
                height: (max_y - min_y + 1) as u32,
            })
        })
        .collect()
}

/// Whether any pixel of the crop belongs to the object.
pub fn has_object_pixels(crop: &ObjectCrop) -> bool
{
    crop.image.pixels().any(|p| p.0[3] != 0)
}

/// Keeps the pixels the mask marks and makes everything else transparent.
fn apply_mask(image: &RgbImage, mask: &GrayImage) -> RgbaImage
{
    RgbaImage::from_fn(image.width(), image.height(), |x, y| {
        if mask.get_pixel(x, y).0[0] != 0
        {
            let [r, g, b] = image.get_pixel(x, y).0;
            Rgba([r, g, b, 255])
        }
        else
        {
            Rgba([0, 0, 0, 0])
        }
    })
}

fn check_mask_size(name: &str, image: &RgbImage, mask: &Mask) -> Result<()>
{
    if image.dimensions() != mask.dimensions()
    {
        return Err(Error::MaskSize {
            name: name.to_string(),
            width: image.width(),
            height: image.height(),
            mask_width: mask.width(),
            mask_height: mask.height(),
        });
    }
    Ok(())
}

/// One crop per external contour of each mask, cropped to the contour's bounding box.
/// The cropped mask still includes any other region of the same mask that falls inside the box.
pub fn tight_crops(name: &str, image: &DynamicImage, masks: &[Mask]) -> Result<Vec<ObjectCrop>>
{
    let rgb = image.to_rgb8();
    let mut crops = Vec::new();
    for mask in masks
    {
        check_mask_size(name, &rgb, mask)?;
        for bbox in external_bounding_boxes(mask)
        {
            let cropped_image = rgb.view(bbox.x, bbox.y, bbox.width, bbox.height).to_image();
            let cropped_mask = mask.view(bbox.x, bbox.y, bbox.width, bbox.height).to_image();
            crops.push(ObjectCrop { image: apply_mask(&cropped_image, &cropped_mask), bbox });
        }
    }
    Ok(crops)
}

/// One crop per mask at full image size, with only the masked object visible.
pub fn full_frame_crops(name: &str, image: &DynamicImage, masks: &[Mask]) -> Result<Vec<ObjectCrop>>
{
    let rgb = image.to_rgb8();
    let bbox = BoundingBox { x: 0, y: 0, width: rgb.width(), height: rgb.height() };
    masks.iter()
        .map(|mask| {
            check_mask_size(name, &rgb, mask)?;
            Ok(ObjectCrop { image: apply_mask(&rgb, mask), bbox })
        })
        .collect()
}

pub fn extract_objects(name: &str, image: &DynamicImage, masks: &[Mask], mode: CropMode) -> Result<Vec<ObjectCrop>>
{
    match mode
    {
        CropMode::Tight => tight_crops(name, image, masks),
        CropMode::FullFrame => full_frame_crops(name, image, masks),
    }
}

/// Writes crops as `img_obj_<n>.png`, numbered from zero on every call.
/// Names are reused between calls, so files only reflect the latest image.
pub fn save_crops(crops: &[ObjectCrop], dir: &Path) -> Result<()>
{
    std::fs::create_dir_all(dir)?;
    for (count, crop) in crops.iter().enumerate()
    {
        crop.image.save(dir.join(format!("img_obj_{}.png", count)))?;
    }
    Ok(())
}

/// Extracts the annotated objects of one image, looked up by file name.
pub struct ObjectExtractor<'a>
{
    pub source: &'a dyn AnnotationSource,
    pub image_dir: &'a Path,
    pub mode: CropMode,
    pub crop_dir: Option<&'a Path>,
}

impl<'a> ObjectExtractor<'a>
{
    pub fn objects_for_image(&self, file_name: &str) -> Result<Vec<ObjectCrop>>
    {
        let id = self.source.image_id(file_name)?;
        let masks = self.source.masks_for_image(id)?;
        let image = preprocessing::load_image(&self.image_dir.join(file_name))?;

        let crops = extract_objects(file_name, &image, &masks, self.mode)?;
        debug!("{}: {} masks -> {} objects ({:?})", file_name, masks.len(), crops.len(), self.mode);

        if let Some(dir) = self.crop_dir
        {
            save_crops(&crops, dir)?;
            info!("Saved {} objects of {} to {:?}", crops.len(), file_name, dir);
        }
        Ok(crops)
    }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use image::Luma;

    fn fill(mask: &mut Mask, x0: u32, y0: u32, x1: u32, y1: u32)
    {
        for y in y0..=y1
        {
            for x in x0..=x1
            {
                mask.put_pixel(x, y, Luma([1]));
            }
        }
    }

    fn gradient_image(width: u32, height: u32) -> DynamicImage
    {
        DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| image::Rgb([x as u8 * 10, y as u8 * 10, 200])))
    }

    #[test]
    fn tight_crop_per_external_contour()
    {
        let image = gradient_image(12, 10);
        let mut two_regions = GrayImage::new(12, 10);
        fill(&mut two_regions, 1, 1, 3, 2);
        fill(&mut two_regions, 7, 5, 10, 8);
        let mut one_region = GrayImage::new(12, 10);
        fill(&mut one_region, 5, 0, 5, 9);

        let crops = tight_crops("img.png", &image, &[two_regions, one_region]).unwrap();
        assert_eq!(crops.len(), 3);

        let mut sizes: Vec<(u32, u32)> = crops.iter().map(|c| c.image.dimensions()).collect();
        sizes.sort();
        assert_eq!(sizes, vec![(1, 10), (3, 2), (4, 4)]);

        let small = crops.iter().find(|c| c.bbox.width == 3).unwrap();
        assert_eq!(small.bbox, BoundingBox { x: 1, y: 1, width: 3, height: 2 });
        // Inside the object, colour comes from the source and alpha is opaque.
        assert_eq!(small.image.get_pixel(0, 0).0, [10, 10, 200, 255]);
    }

    #[test]
    fn hole_does_not_add_crops()
    {
        let image = gradient_image(9, 9);
        let mut ring = GrayImage::new(9, 9);
        fill(&mut ring, 1, 1, 7, 7);
        for y in 3..=5
        {
            for x in 3..=5
            {
                ring.put_pixel(x, y, Luma([0]));
            }
        }
        let crops = tight_crops("ring.png", &image, &[ring]).unwrap();
        assert_eq!(crops.len(), 1);
        let crop = &crops[0];
        assert_eq!(crop.image.dimensions(), (7, 7));
        // The hole is transparent.
        assert_eq!(crop.image.get_pixel(3, 3).0, [0, 0, 0, 0]);
    }

    #[test]
    fn full_frame_keeps_dimensions_and_counts_masks()
    {
        let image = gradient_image(8, 6);
        let mut object = GrayImage::new(8, 6);
        fill(&mut object, 2, 2, 4, 3);
        let empty = GrayImage::new(8, 6);

        let crops = full_frame_crops("img.png", &image, &[object, empty]).unwrap();
        assert_eq!(crops.len(), 2);
        assert!(crops.iter().all(|c| c.image.dimensions() == (8, 6)));
        assert_eq!(crops[0].image.get_pixel(0, 0).0[3], 0);
        assert_eq!(crops[0].image.get_pixel(3, 2).0[3], 255);
        assert!(crops[1].image.pixels().all(|p| p.0[3] == 0));
    }

    #[test]
    fn empty_mask_has_no_tight_crops()
    {
        let image = gradient_image(5, 5);
        let crops = tight_crops("img.png", &image, &[GrayImage::new(5, 5)]).unwrap();
        assert!(crops.is_empty());
    }

    #[test]
    fn mismatched_mask_is_rejected()
    {
        let image = gradient_image(5, 5);
        let err = extract_objects("img.png", &image, &[GrayImage::new(4, 5)], CropMode::FullFrame).unwrap_err();
        assert!(matches!(err, Error::MaskSize { mask_width: 4, .. }));
    }

    #[test]
    fn rgb_conversion_blackens_background()
    {
        let image = gradient_image(4, 4);
        let mut mask = GrayImage::new(4, 4);
        fill(&mut mask, 0, 0, 1, 1);
        let crop = full_frame_crops("img.png", &image, &[mask]).unwrap().remove(0);
        let rgb = crop.into_rgb().to_rgb8();
        assert_eq!(rgb.get_pixel(3, 3).0, [0, 0, 0]);
        assert_eq!(rgb.get_pixel(1, 1).0, [10, 10, 200]);
    }

    #[test]
    fn objects_on_the_image_edge_are_kept()
    {
        let square = |x0: u32, y0: u32| {
            let mut mask = GrayImage::new(8, 8);
            fill(&mut mask, x0, y0, x0 + 2, y0 + 2);
            mask
        };
        for (x0, y0) in [(0, 3), (0, 0), (3, 0), (5, 3), (3, 5), (5, 5), (3, 3)]
        {
            let boxes = external_bounding_boxes(&square(x0, y0));
            assert_eq!(boxes, vec![BoundingBox { x: x0, y: y0, width: 3, height: 3 }], "square at ({}, {})", x0, y0);
        }

        let mut full = GrayImage::new(8, 8);
        fill(&mut full, 0, 0, 7, 7);
        assert_eq!(external_bounding_boxes(&full), vec![BoundingBox { x: 0, y: 0, width: 8, height: 8 }]);

        let mut pair = square(0, 0);
        fill(&mut pair, 4, 4, 6, 6);
        let mut boxes = external_bounding_boxes(&pair);
        boxes.sort_by_key(|b| (b.x, b.y));
        assert_eq!(boxes, vec![
            BoundingBox { x: 0, y: 0, width: 3, height: 3 },
            BoundingBox { x: 4, y: 4, width: 3, height: 3 },
        ]);
    }

    #[test]
    fn empty_full_frame_crop_has_no_object_pixels()
    {
        let image = gradient_image(6, 6);
        let mut object = GrayImage::new(6, 6);
        fill(&mut object, 0, 0, 1, 1);
        let crops = full_frame_crops("img.png", &image, &[object, GrayImage::new(6, 6)]).unwrap();
        assert!(has_object_pixels(&crops[0]));
        assert!(!has_object_pixels(&crops[1]));
    }

    #[test]
    fn saved_crops_are_numbered()
    {
        let dir = tempfile::tempdir().unwrap();
        let image = gradient_image(6, 6);
        let mut mask = GrayImage::new(6, 6);
        fill(&mut mask, 0, 0, 1, 1);
        fill(&mut mask, 4, 4, 5, 5);
        let crops = tight_crops("img.png", &image, &[mask]).unwrap();
        save_crops(&crops, dir.path()).unwrap();
        assert!(dir.path().join("img_obj_0.png").exists());
        assert!(dir.path().join("img_obj_1.png").exists());
        assert!(!dir.path().join("img_obj_2.png").exists());
    }
}
