//! COCO-style object annotations.
//!
//! The pipeline only relies on the `AnnotationSource` trait: list the images and
//! hand back one binary mask per annotated object. `CocoIndex` is the concrete
//! reader for COCO instance files, supporting polygon, uncompressed RLE and
//! compressed (string) RLE segmentations.

use std::path::Path;

use image::{GrayImage, Luma};
use imageproc::drawing::draw_polygon_mut;
use imageproc::point::Point;
use log::{debug, info};
use rustc_hash::FxHashMap;
use serde::Deserialize;

use crate::error::{Error, Result};

/// A binary mask; any non-zero pixel belongs to the object.
pub type Mask = GrayImage;

const MASK_ON: Luma<u8> = Luma([1]);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageEntry
{
    pub id: u64,
    pub file_name: String,
}

/// Read-only access to an annotated image set.
/// Implementations are shared between worker threads, so they must be `Sync`.
pub trait AnnotationSource: Send + Sync
{
    fn list_images(&self) -> Vec<ImageEntry>;

    /// Resolves a file name to its image id; `Error::ImageNotFound` when absent.
    fn image_id(&self, file_name: &str) -> Result<u64>;

    fn masks_for_image(&self, id: u64) -> Result<Vec<Mask>>;
}

#[derive(Debug, Clone, Deserialize)]
pub struct CocoFile
{
    pub images: Vec<CocoImage>,
    #[serde(default)]
    pub annotations: Vec<CocoAnnotation>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CocoImage
{
    pub id: u64,
    pub file_name: String,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CocoAnnotation
{
    pub id: u64,
    pub image_id: u64,
    #[serde(default)]
    pub category_id: u64,
    pub segmentation: Segmentation,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Segmentation
{
    Polygons(Vec<Vec<f64>>),
    Rle(Rle),
}

/// Run-length encoding; `size` is `[height, width]` and runs are column-major,
/// starting with a run of background pixels.
#[derive(Debug, Clone, Deserialize)]
pub struct Rle
{
    pub size: [u32; 2],
    pub counts: RleCounts,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RleCounts
{
    Uncompressed(Vec<u32>),
    Compressed(String),
}

pub struct CocoIndex
{
    images: Vec<CocoImage>,
    annotations: Vec<CocoAnnotation>,
    id_by_file_name: FxHashMap<String, u64>,
    image_by_id: FxHashMap<u64, usize>,
    annotations_by_image: FxHashMap<u64, Vec<usize>>,
}

impl CocoIndex
{
    pub fn from_file(path: &Path) -> Result<Self>
    {
        let file = std::fs::File::open(path)?;
        let coco: CocoFile = serde_json::from_reader(std::io::BufReader::new(file))?;
        info!("Loaded {} images and {} annotations from {:?}", coco.images.len(), coco.annotations.len(), path);
        Ok(Self::new(coco))
    }

    pub fn new(coco: CocoFile) -> Self
    {
        let mut id_by_file_name = FxHashMap::default();
        let mut image_by_id = FxHashMap::default();
        for (idx, image) in coco.images.iter().enumerate()
        {
            // First entry wins for duplicated file names, matching a linear scan.
            id_by_file_name.entry(image.file_name.clone()).or_insert(image.id);
            image_by_id.insert(image.id, idx);
        }

        let mut annotations_by_image: FxHashMap<u64, Vec<usize>> = FxHashMap::default();
        for (idx, annotation) in coco.annotations.iter().enumerate()
        {
            annotations_by_image.entry(annotation.image_id).or_default().push(idx);
        }

        CocoIndex {
            images: coco.images,
            annotations: coco.annotations,
            id_by_file_name,
            image_by_id,
            annotations_by_image,
        }
    }

    pub fn image(&self, id: u64) -> Result<&CocoImage>
    {
        self.image_by_id.get(&id)
            .map(|idx| &self.images[*idx])
            .ok_or(Error::ImageIdNotFound(id))
    }
}

impl AnnotationSource for CocoIndex
{
    fn list_images(&self) -> Vec<ImageEntry>
    {
        self.images.iter()
            .map(|image| ImageEntry { id: image.id, file_name: image.file_name.clone() })
            .collect()
    }

    fn image_id(&self, file_name: &str) -> Result<u64>
    {
        self.id_by_file_name.get(file_name)
            .copied()
            .ok_or_else(|| Error::ImageNotFound(file_name.to_string()))
    }

    fn masks_for_image(&self, id: u64) -> Result<Vec<Mask>>
    {
        let image = self.image(id)?;
        let Some(indices) = self.annotations_by_image.get(&id) else {
            return Ok(Vec::new());
        };

        let masks = indices.iter()
            .map(|idx| {
                let annotation = &self.annotations[*idx];
                debug!("Rasterizing annotation {} for image {}", annotation.id, image.file_name);
                annotation_to_mask(&annotation.segmentation, image.width, image.height)
            })
            .collect::<Result<Vec<Mask>>>()?;

        Ok(masks)
    }
}

/// Converts one annotation's segmentation into a binary mask of the image's size.
pub fn annotation_to_mask(segmentation: &Segmentation, width: u32, height: u32) -> Result<Mask>
{
    match segmentation
    {
        Segmentation::Polygons(polygons) => Ok(polygons_to_mask(polygons, width, height)),
        Segmentation::Rle(rle) =>
        {
            let [rle_height, rle_width] = rle.size;
            if rle_height != height || rle_width != width
            {
                return Err(Error::Segmentation(format!(
                    "RLE size {}x{} does not match image size {}x{}",
                    rle_width, rle_height, width, height)));
            }
            let counts = match &rle.counts
            {
                RleCounts::Uncompressed(counts) => counts.clone(),
                RleCounts::Compressed(encoded) => decode_rle_string(encoded)?,
            };
            rle_to_mask(&counts, width, height)
        }
    }
}

/// Fills each polygon (flat `[x0, y0, x1, y1, ...]` lists) into one mask.
pub fn polygons_to_mask(polygons: &[Vec<f64>], width: u32, height: u32) -> Mask
{
    let mut mask = GrayImage::new(width, height);
    for polygon in polygons
    {
        let mut points: Vec<Point<i32>> = polygon
            .chunks_exact(2)
            .map(|xy| Point::new(xy[0].round() as i32, xy[1].round() as i32))
            .collect();
        points.dedup();
        // The fill routine rejects explicitly closed rings.
        while points.len() > 1 && points.first() == points.last()
        {
            points.pop();
        }
        if points.len() < 3
        {
            continue;
        }
        draw_polygon_mut(&mut mask, &points, MASK_ON);
    }
    mask
}

/// Expands column-major run lengths into a mask. Runs alternate background/foreground.
pub fn rle_to_mask(counts: &[u32], width: u32, height: u32) -> Result<Mask>
{
    let total = width as u64 * height as u64;
    let covered: u64 = counts.iter().map(|c| *c as u64).sum();
    if covered != total
    {
        return Err(Error::Segmentation(format!(
            "RLE covers {} pixels but the image has {}", covered, total)));
    }

    let mut mask = GrayImage::new(width, height);
    let mut position: u64 = 0;
    for (run, count) in counts.iter().enumerate()
    {
        let count = *count as u64;
        if run % 2 == 1
        {
            for idx in position..position + count
            {
                let x = (idx / height as u64) as u32;
                let y = (idx % height as u64) as u32;
                mask.put_pixel(x, y, MASK_ON);
            }
        }
        position += count;
    }
    Ok(mask)
}

/// Decodes the compact string form of COCO RLE counts.
///
/// Each count is a little-endian sequence of 5-bit groups stored as `char - 48`;
/// bit 0x20 marks a continuation and bit 0x10 of the last group is the sign.
/// From the fourth count on, values are stored as deltas against the count two
/// positions earlier.
pub fn decode_rle_string(encoded: &str) -> Result<Vec<u32>>
{
    let bytes = encoded.as_bytes();
    let mut counts: Vec<i64> = Vec::new();
    let mut p = 0;
    while p < bytes.len()
    {
        let mut x: i64 = 0;
        let mut k = 0;
        let mut more = true;
        while more
        {
            if 5 * k >= 60
            {
                return Err(Error::Segmentation("compressed RLE count too long".to_string()));
            }
            let byte = *bytes.get(p)
                .ok_or_else(|| Error::Segmentation("truncated compressed RLE".to_string()))?;
            if byte < 48
            {
                return Err(Error::Segmentation(format!("invalid compressed RLE byte {:?}", byte as char)));
            }
            let c = (byte - 48) as i64;
            x |= (c & 0x1f) << (5 * k);
            more = c & 0x20 != 0;
            p += 1;
            k += 1;
            if !more && c & 0x10 != 0
            {
                x |= -1i64 << (5 * k);
            }
        }
        if counts.len() > 2
        {
            x += counts[counts.len() - 2];
        }
        counts.push(x);
    }

    counts.into_iter()
        .map(|c| u32::try_from(c).map_err(|_| Error::Segmentation(format!("negative RLE count {}", c))))
        .collect()
}
