//! Convenience helpers for loading and saving planar volumes via the `image`
//! crate.
//!
//! Available when the `image-io` feature is enabled. Images map to volumes
//! with `nz == 1`, unit spacing and the origin at voxel `(0, 0, 0)`.

use crate::util::{QwarpError, QwarpResult};
use crate::volume::{Grid, Volume};
use std::path::Path;

/// Creates a planar volume from a grayscale image buffer.
pub fn volume_from_gray_image(img: &image::GrayImage) -> QwarpResult<Volume> {
    let width = img.width() as usize;
    let height = img.height() as usize;
    let grid = Grid::new([width, height, 1])?;
    let data = img.as_raw().iter().map(|&v| v as f32).collect();
    Volume::new(grid, data)
}

/// Loads an image from disk and converts it to a planar volume.
pub fn load_gray_volume<P: AsRef<Path>>(path: P) -> QwarpResult<Volume> {
    let img = image::open(path).map_err(|err| QwarpError::ImageIo {
        reason: err.to_string(),
    })?;
    volume_from_gray_image(&img.to_luma8())
}

/// Converts a planar volume to an 8-bit image, rounding and clamping values.
pub fn gray_image_from_volume(vol: &Volume) -> QwarpResult<image::GrayImage> {
    let [nx, ny, nz] = vol.dims();
    if !vol.grid().is_planar() {
        return Err(QwarpError::ImageIo {
            reason: format!("cannot store a {nx}x{ny}x{nz} volume as a 2D image"),
        });
    }
    let pixels = vol
        .data()
        .iter()
        .map(|v| v.round().clamp(0.0, 255.0) as u8)
        .collect();
    image::GrayImage::from_raw(nx as u32, ny as u32, pixels).ok_or(QwarpError::ImageIo {
        reason: "pixel buffer does not match image size".to_string(),
    })
}

/// Saves a planar volume as an 8-bit grayscale image.
pub fn save_gray_volume<P: AsRef<Path>>(path: P, vol: &Volume) -> QwarpResult<()> {
    gray_image_from_volume(vol)?
        .save(path)
        .map_err(|err| QwarpError::ImageIo {
            reason: err.to_string(),
        })
}
