use anyhow::Result;
use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::{DType, Device, IndexOp, Tensor};
use image::imageops::FilterType;
use image::DynamicImage;

use crate::DeviceMap;

pub fn select_best_device(device_map: DeviceMap) -> Result<Device> {
    match device_map {
        DeviceMap::ForceCpu => Ok(Device::Cpu),
        DeviceMap::Ordinal(ordinal) if cuda_is_available() => Ok(Device::new_cuda(ordinal)?),
        DeviceMap::Ordinal(ordinal) if metal_is_available() => Ok(Device::new_metal(ordinal)?),
        DeviceMap::Ordinal(_) => {
            #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
            {
                tracing::warn!(
                    "Running on CPU, to run on GPU(metal), build with `--features metal`"
                );
            }
            #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
            {
                tracing::warn!("Running on CPU, to run on GPU, build with `--features cuda`");
            }
            Ok(Device::Cpu)
        }
    }
}

/// Converts a u8 tensor with shape (batch, 3, height, width) into images.
pub fn tensor_to_images(images: &Tensor) -> Result<Vec<DynamicImage>> {
    let (batch, channels, height, width) = images.dims4()?;
    if channels != 3 {
        anyhow::bail!("tensor_to_images expects images with 3 channels, got {channels}");
    }
    let mut out = Vec::with_capacity(batch);
    for idx in 0..batch {
        let img = images.i(idx)?.permute((1, 2, 0))?.flatten_all()?;
        let pixels = img.to_vec1::<u8>()?;
        let buffer = image::ImageBuffer::from_raw(width as u32, height as u32, pixels)
            .ok_or_else(|| candle_core::Error::msg("error converting tensor to image buffer"))?;
        out.push(DynamicImage::ImageRgb8(buffer));
    }
    Ok(out)
}

/// Resizes `image` to exactly `width`x`height` and scales pixels into [-1, 1],
/// returning a (1, 3, height, width) f32 tensor.
pub fn image_to_tensor(image: &DynamicImage, width: u32, height: u32, device: &Device) -> Result<Tensor> {
    let img = image
        .resize_exact(width, height, FilterType::Triangle)
        .to_rgb8()
        .into_raw();
    let tensor = Tensor::from_vec(img, (height as usize, width as usize, 3), &Device::Cpu)?
        .permute((2, 0, 1))?
        .to_dtype(DType::F32)?
        .affine(2. / 255., -1.)?
        .unsqueeze(0)?
        .to_device(device)?;
    Ok(tensor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;

    #[test]
    fn image_tensor_round_trip_shape() -> Result<()> {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(10, 6, image::Rgb([255, 0, 128])));
        let t = image_to_tensor(&img, 16, 8, &Device::Cpu)?;
        assert_eq!(t.dims(), &[1, 3, 8, 16]);
        let max = t.max_all()?.to_scalar::<f32>()?;
        let min = t.min_all()?.to_scalar::<f32>()?;
        assert!((max - 1.0).abs() < 1e-6);
        assert!((min + 1.0).abs() < 1e-6);

        let back = ((t + 1.0)? * 127.5)?.round()?.to_dtype(DType::U8)?;
        let images = tensor_to_images(&back)?;
        assert_eq!(images.len(), 1);
        assert_eq!((images[0].width(), images[0].height()), (16, 8));
        Ok(())
    }

    #[test]
    fn rejects_non_rgb_tensors() {
        let t = Tensor::zeros((1, 4, 2, 2), DType::U8, &Device::Cpu).unwrap();
        assert!(tensor_to_images(&t).is_err());
    }
}
