use std::path::Path;

use anyhow::{Context, Result};
use candle_core::{DType, Device, Module, Tensor, D};
use candle_nn::{Linear, VarBuilder};
use candle_transformers::models::clip::text_model::Activation;
use candle_transformers::models::clip::vision_model::{ClipVisionConfig, ClipVisionTransformer};
use hf_hub::api::tokio::Api;
use image::imageops::FilterType;
use image::DynamicImage;

/// Hub repo holding the standalone safety checker weights.
pub const SAFETY_CHECKER_REPO: &str = "CompVis/stable-diffusion-safety-checker";

const IMAGE_SIZE: u32 = 224;
const CLIP_MEAN: [f32; 3] = [0.481_454_66, 0.457_827_5, 0.408_210_73];
const CLIP_STD: [f32; 3] = [0.268_629_54, 0.261_302_58, 0.275_777_11];
const SPECIAL_CARE_ADJUSTMENT: f32 = 0.01;

/// Flags images that should not be returned.
pub trait SafetyFilter: Send {
    /// One flag per image, `true` meaning unsafe.
    fn check(&self, images: &[DynamicImage]) -> Result<Vec<bool>>;
}

/// The Stable Diffusion safety checker: a CLIP ViT-L/14 image tower whose
/// projected embedding is compared against fixed concept embeddings.
pub struct SafetyChecker {
    device: Device,
    vision: ClipVisionTransformer,
    projection: Linear,
    concept_embeds: Tensor,
    concept_thresholds: Vec<f32>,
    special_care_embeds: Tensor,
    special_care_thresholds: Vec<f32>,
}

fn vit_large_patch14() -> ClipVisionConfig {
    ClipVisionConfig {
        embed_dim: 1024,
        activation: Activation::QuickGelu,
        intermediate_size: 4096,
        num_hidden_layers: 24,
        num_attention_heads: 16,
        projection_dim: 768,
        num_channels: 3,
        image_size: IMAGE_SIZE as usize,
        patch_size: 14,
    }
}

impl SafetyChecker {
    pub async fn download(api: &Api, device: &Device) -> Result<Self> {
        let weights = api
            .model(SAFETY_CHECKER_REPO.to_string())
            .get("model.safetensors")
            .await
            .context("failed to get safety checker weights")?;
        Self::load(&weights, device)
    }

    pub fn load(weights: &Path, device: &Device) -> Result<Self> {
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[weights], DType::F32, device)
                .context("failed to build safety checker var builder")?
        };
        let config = vit_large_patch14();
        let vision = ClipVisionTransformer::new(vb.pp("vision_model.vision_model"), &config)
            .context("failed to load safety checker vision model")?;
        let projection = candle_nn::linear_no_bias(
            config.embed_dim,
            config.projection_dim,
            vb.pp("visual_projection"),
        )?;
        let concept_embeds = vb.get((17, config.projection_dim), "concept_embeds")?;
        let special_care_embeds = vb.get((3, config.projection_dim), "special_care_embeds")?;
        let concept_thresholds = vb.get(17, "concept_embeds_weights")?.to_vec1::<f32>()?;
        let special_care_thresholds = vb.get(3, "special_care_embeds_weights")?.to_vec1::<f32>()?;

        Ok(Self {
            device: device.clone(),
            vision,
            projection,
            concept_embeds: normalize(&concept_embeds)?,
            concept_thresholds,
            special_care_embeds: normalize(&special_care_embeds)?,
            special_care_thresholds,
        })
    }
}

impl SafetyFilter for SafetyChecker {
    fn check(&self, images: &[DynamicImage]) -> Result<Vec<bool>> {
        if images.is_empty() {
            return Ok(Vec::new());
        }
        let pixels = images
            .iter()
            .map(|img| clip_pixels(img, &self.device))
            .collect::<Result<Vec<_>>>()?;
        let pixels = Tensor::stack(&pixels, 0)?;

        let pooled = self.vision.forward(&pixels)?;
        let embeds = normalize(&self.projection.forward(&pooled)?)?;
        let special = embeds
            .matmul(&self.special_care_embeds.t()?)?
            .to_vec2::<f32>()?;
        let concepts = embeds.matmul(&self.concept_embeds.t()?)?.to_vec2::<f32>()?;

        Ok(special
            .iter()
            .zip(&concepts)
            .map(|(special, concepts)| {
                is_flagged(
                    special,
                    &self.special_care_thresholds,
                    concepts,
                    &self.concept_thresholds,
                )
            })
            .collect())
    }
}

fn normalize(t: &Tensor) -> Result<Tensor> {
    let norm = t.sqr()?.sum_keepdim(D::Minus1)?.sqrt()?;
    Ok(t.broadcast_div(&norm)?)
}

fn round3(x: f32) -> f32 {
    (x * 1000.0).round() / 1000.0
}

/// Decides one image from its cosine similarities to the special-care and
/// concept embeddings. A special-care hit lowers the bar for every concept.
pub fn is_flagged(
    special: &[f32],
    special_thresholds: &[f32],
    concepts: &[f32],
    concept_thresholds: &[f32],
) -> bool {
    let hit = special
        .iter()
        .zip(special_thresholds)
        .any(|(score, threshold)| round3(score - threshold) > 0.0);
    let adjustment = if hit { SPECIAL_CARE_ADJUSTMENT } else { 0.0 };
    concepts
        .iter()
        .zip(concept_thresholds)
        .any(|(score, threshold)| round3(score - threshold + adjustment) > 0.0)
}

/// CLIP preprocessing: shortest side to 224, center crop, mean/std
/// normalisation. Returns a (3, 224, 224) f32 tensor.
pub fn clip_pixels(image: &DynamicImage, device: &Device) -> Result<Tensor> {
    let (w, h) = (image.width().max(1), image.height().max(1));
    let scale = IMAGE_SIZE as f64 / w.min(h) as f64;
    let (rw, rh) = (
        ((w as f64 * scale).round() as u32).max(IMAGE_SIZE),
        ((h as f64 * scale).round() as u32).max(IMAGE_SIZE),
    );
    let resized = image.resize_exact(rw, rh, FilterType::CatmullRom);
    let cropped = resized
        .crop_imm((rw - IMAGE_SIZE) / 2, (rh - IMAGE_SIZE) / 2, IMAGE_SIZE, IMAGE_SIZE)
        .to_rgb8()
        .into_raw();

    let size = IMAGE_SIZE as usize;
    let mean = Tensor::new(&CLIP_MEAN, &Device::Cpu)?.reshape((3, 1, 1))?;
    let std = Tensor::new(&CLIP_STD, &Device::Cpu)?.reshape((3, 1, 1))?;
    let pixels = Tensor::from_vec(cropped, (size, size, 3), &Device::Cpu)?
        .permute((2, 0, 1))?
        .to_dtype(DType::F32)?
        .affine(1. / 255., 0.)?
        .broadcast_sub(&mean)?
        .broadcast_div(&std)?;
    Ok(pixels.to_device(device)?)
}
