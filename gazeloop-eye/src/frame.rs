//! Frame sources feeding the pipeline

use gazeloop_core::{Error, HostTensor, Region, Result};
use image::imageops::{self, FilterType};
use image::RgbImage;
use std::path::Path;

/// A 2D image the pipeline can turn into model input.
pub trait FrameSource: Send {
    /// (width, height) in pixels.
    fn dimensions(&self) -> (u32, u32);

    /// Crop `region` and resample it to `target` as a `[1, 3, h, w]` tensor.
    fn to_tensor(&self, region: Region, target: (u32, u32)) -> Result<HostTensor>;
}

/// RGB image held in memory.
pub struct ImageFrame {
    image: RgbImage,
}

impl ImageFrame {
    pub fn new(image: RgbImage) -> Self {
        Self { image }
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let image = image::open(path)
            .map_err(|e| Error::InputUnavailable(format!("failed to read {:?}: {}", path, e)))?
            .to_rgb8();
        Ok(Self { image })
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }
}

impl From<RgbImage> for ImageFrame {
    fn from(image: RgbImage) -> Self {
        Self::new(image)
    }
}

impl FrameSource for ImageFrame {
    fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    fn to_tensor(&self, region: Region, target: (u32, u32)) -> Result<HostTensor> {
        let (width, height) = self.image.dimensions();
        let fits = region.x.checked_add(region.width).map_or(false, |r| r <= width)
            && region.y.checked_add(region.height).map_or(false, |b| b <= height);
        if region.area() == 0 || !fits {
            return Err(Error::InputUnavailable(format!(
                "region {:?} outside {}x{} frame",
                region, width, height
            )));
        }
        if target.0 == 0 || target.1 == 0 {
            return Err(Error::Configuration(format!("invalid tensor size {:?}", target)));
        }

        let cropped = imageops::crop_imm(&self.image, region.x, region.y, region.width, region.height)
            .to_image();
        let resized = if (region.width, region.height) == target {
            cropped
        } else {
            imageops::resize(&cropped, target.0, target.1, FilterType::Triangle)
        };

        chw_tensor(&resized)
    }
}

/// Planar RGB, normalized to [0, 1].
fn chw_tensor(image: &RgbImage) -> Result<HostTensor> {
    let (w, h) = image.dimensions();
    let plane = (w * h) as usize;
    let mut data = vec![0.0f32; plane * 3];

    for (x, y, pixel) in image.enumerate_pixels() {
        let idx = (y * w + x) as usize;
        for c in 0..3 {
            data[c * plane + idx] = pixel.0[c] as f32 / 255.0;
        }
    }

    HostTensor::new(vec![1, 3, h as usize, w as usize], data)
}
