//! Preprocessing of images into the tensor layout the feature backends expect:
//! a batch of NCHW `f32` images, resized to the configured size and normalized.

use std::path::Path;

use image::{imageops::FilterType, DynamicImage, GenericImageView};
use ndarray::{Array, Dim};
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
use walkdir::WalkDir;

use crate::config::Normalization;
use crate::error::Result;

/// Size and normalization shared by every image fed to a backend during a run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeatureSettings
{
	pub width: u32,
	pub height: u32,
	pub normalization: Normalization,
	pub seed: u64,
}

pub fn load_image(path: &Path) -> Result<DynamicImage>
{
	Ok(image::open(path)?)
}

/// Image files directly inside `dir`, by file name, sorted.
/// Anything the `image` crate cannot name a format for is skipped.
pub fn list_image_files(dir: &Path) -> Result<Vec<String>>
{
	let mut names = Vec::new();
	for entry in WalkDir::new(dir).min_depth(1).max_depth(1)
	{
		let entry = entry.map_err(std::io::Error::from)?;
		if !entry.file_type().is_file() || image::ImageFormat::from_path(entry.path()).is_err()
		{
			continue;
		}
		if let Some(name) = entry.file_name().to_str()
		{
			names.push(name.to_string());
		}
	}
	names.sort();
	Ok(names)
}

pub fn resize_images(images: &[DynamicImage], width: u32, height: u32) -> Vec<DynamicImage>
{
	// Resize the images in parallel
	images.par_iter().map(
		|original_img|
		{
			if original_img.dimensions() == (width, height)
			{
				original_img.clone()
			}
			else
			{
				original_img.resize_exact(width, height, FilterType::CatmullRom)
			}
		}
	).collect::<Vec<DynamicImage>>()
}

// Convert the images to the 4D array expected by the backends.
// Images must already be resized to `width` x `height`.
pub fn images_to_tensor(images: &[DynamicImage], width: u32, height: u32, normalization: Normalization) -> Array<f32, Dim<[usize; 4]>>
{
	let mut image_input = Array::zeros((images.len(), 3, height as usize, width as usize));
	for (idx, img) in images.iter().enumerate()
	{
		let rgb = img.to_rgb8();
		for (x, y, pixel) in rgb.enumerate_pixels()
		{
			let (x, y) = (x as usize, y as usize);
			for channel in 0..3
			{
				image_input[[idx, channel, y, x]] = normalization.apply(channel, pixel.0[channel]);
			}
		}
	}

	image_input
}

/// Resizes and normalizes a batch in one step.
pub fn prepare_batch(images: &[DynamicImage], settings: &FeatureSettings) -> Array<f32, Dim<[usize; 4]>>
{
	let resized = resize_images(images, settings.width, settings.height);
	images_to_tensor(&resized, settings.width, settings.height, settings.normalization)
}

#[cfg(test)]
mod tests
{
	use super::*;
	use approx::assert_abs_diff_eq;
	use image::{Rgb, RgbImage};

	fn solid(width: u32, height: u32, colour: [u8; 3]) -> DynamicImage
	{
		DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb(colour)))
	}

	#[test]
	fn batch_has_nchw_shape()
	{
		let settings = FeatureSettings { width: 8, height: 4, normalization: Normalization::Unit, seed: 0 };
		let batch = prepare_batch(&[solid(20, 10, [255, 0, 51]), solid(3, 3, [0, 0, 0])], &settings);
		assert_eq!(batch.shape(), &[2, 3, 4, 8]);
		assert_abs_diff_eq!(batch[[0, 0, 2, 5]], 1.0);
		assert_abs_diff_eq!(batch[[0, 1, 2, 5]], 0.0);
		assert_abs_diff_eq!(batch[[0, 2, 0, 0]], 0.2, epsilon = 1e-6);
		assert_abs_diff_eq!(batch[[1, 0, 3, 7]], 0.0);
	}

	#[test]
	fn imagenet_normalization_is_applied()
	{
		let batch = images_to_tensor(&[solid(2, 2, [0, 0, 0])], 2, 2, Normalization::Imagenet);
		assert_abs_diff_eq!(batch[[0, 1, 1, 1]], -0.456 / 0.224, epsilon = 1e-6);
	}

	#[test]
	fn lists_only_images()
	{
		let dir = tempfile::tempdir().unwrap();
		solid(2, 2, [1, 2, 3]).save(dir.path().join("b.png")).unwrap();
		solid(2, 2, [1, 2, 3]).save(dir.path().join("a.png")).unwrap();
		std::fs::write(dir.path().join("notes.txt"), "not an image").unwrap();
		std::fs::create_dir(dir.path().join("nested.png")).unwrap();

		assert_eq!(list_image_files(dir.path()).unwrap(), vec!["a.png", "b.png"]);
	}
}
