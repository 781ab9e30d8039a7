use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use hf_hub::api::tokio::Api;
use serde::{Deserialize, Serialize};

use crate::lora::{LoraFetcher, LoraManager, WeightsCache, DEFAULT_MIN_DISK_FREE};
use crate::output::{encode, write_outputs, EncodedImage};
use crate::request::{img2img_dimensions, truncate_prompt, PredictionRequest};
use crate::safety::{SafetyChecker, SafetyFilter};
use crate::{
    load_model, select_best_device, DeviceMap, Error, GenerationParams, ModelLike, Result,
};

/// Everything needed to bring a predictor up.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PredictorConfig {
    /// Hub repo of the base model.
    pub model: String,
    pub device: DeviceMap,
    /// Load half precision weights on accelerators.
    pub use_f16: bool,
    pub cache_dir: PathBuf,
    /// Bytes to keep free on the cache's disk.
    pub min_disk_free: u64,
    pub load_safety_checker: bool,
    /// When set, every prediction is also written here as `out-{i}.{ext}`.
    pub output_dir: Option<PathBuf>,
}

impl Default for PredictorConfig {
    fn default() -> Self {
        Self {
            model: "runwayml/stable-diffusion-v1-5".to_string(),
            device: DeviceMap::default(),
            use_f16: true,
            cache_dir: PathBuf::from("./weights-cache"),
            min_disk_free: DEFAULT_MIN_DISK_FREE,
            load_safety_checker: true,
            output_dir: None,
        }
    }
}

/// Result of one prediction.
#[derive(Debug, Clone)]
pub struct Prediction {
    pub seed: u64,
    pub images: Vec<EncodedImage>,
}

pub struct Predictor {
    model: Box<dyn ModelLike>,
    safety: Option<Box<dyn SafetyFilter>>,
    loras: LoraManager,
    output_dir: Option<PathBuf>,
}

impl Predictor {
    pub fn new(
        model: Box<dyn ModelLike>,
        safety: Option<Box<dyn SafetyFilter>>,
        loras: LoraManager,
    ) -> Self {
        Self {
            model,
            safety,
            loras,
            output_dir: None,
        }
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    /// Loads the model, the safety checker and the LoRA cache described by
    /// `config`.
    pub async fn setup(config: PredictorConfig) -> anyhow::Result<Self> {
        let api = Api::new().context("failed to create hub client")?;

        let safety: Option<Box<dyn SafetyFilter>> = if config.load_safety_checker {
            let device = select_best_device(config.device)?;
            let checker = SafetyChecker::download(&api, &device)
                .await
                .context("failed to load safety checker")?;
            Some(Box::new(checker))
        } else {
            None
        };

        let model = load_model(api.clone(), config.clone()).await?;

        let cache = WeightsCache::new(&config.cache_dir, config.min_disk_free)
            .context("failed to open weights cache")?;
        tracing::info!(
            "LoRA cache at {} holds {} entries",
            cache.base_dir().display(),
            cache.len()
        );
        let loras = LoraManager::new(LoraFetcher::new(cache, Arc::new(api)));

        let mut predictor = Self::new(model, safety, loras);
        predictor.output_dir = config.output_dir;
        Ok(predictor)
    }

    pub fn loras(&self) -> &LoraManager {
        &self.loras
    }

    pub async fn predict(&mut self, request: PredictionRequest) -> Result<Prediction> {
        request.validate()?;

        let seed = request
            .seed
            .unwrap_or_else(|| u64::from(rand::random::<u16>()));
        tracing::info!("Using seed: {seed}");

        let prompt = truncate_prompt(&request.prompt);
        if prompt != request.prompt {
            tracing::warn!("Prompt truncated to: {prompt}");
        }

        let (width, height, init_image) = match request.image {
            Some(image) => {
                tracing::info!("img2img mode");
                let (width, height) = img2img_dimensions(image.width(), image.height());
                (width as usize, height as usize, Some(image))
            }
            None => {
                tracing::info!("txt2img mode");
                let (width, height) = request.aspect_ratio.dimensions();
                (width, height, None)
            }
        };

        let outcome = self
            .loras
            .apply(&mut *self.model, &request.hf_loras, &request.lora_scales)
            .await?;
        tracing::debug!("LoRA state: {outcome:?}");

        let params = GenerationParams {
            prompt,
            width,
            height,
            num_outputs: request.num_outputs,
            num_inference_steps: request.num_inference_steps,
            guidance_scale: request.guidance_scale,
            seed,
            init_image,
            strength: request.prompt_strength,
        };
        let images = match self.model.generate(&params) {
            Ok(images) => images,
            Err(e) if is_shape_mismatch(&e) => {
                if !self.model.fallback_attention()? {
                    return Err(e.into());
                }
                tracing::warn!("Generation failed with {e:#}, retrying with fallback attention");
                self.model.generate(&params)?
            }
            Err(e) => return Err(e.into()),
        };

        let flags = match (&self.safety, request.disable_safety_checker) {
            (Some(checker), false) => checker.check(&images)?,
            (None, false) => {
                tracing::warn!("Safety checker requested but not loaded, skipping");
                vec![false; images.len()]
            }
            (_, true) => vec![false; images.len()],
        };

        let mut encoded = Vec::with_capacity(images.len());
        for (index, (image, flagged)) in images.iter().zip(flags).enumerate() {
            if flagged {
                tracing::warn!("NSFW content detected in image {index}");
                continue;
            }
            let bytes = encode(image, request.output_format, request.output_quality)?;
            encoded.push(EncodedImage {
                index,
                format: request.output_format,
                bytes,
            });
        }
        if encoded.is_empty() {
            return Err(Error::NsfwOnly);
        }

        if let Some(dir) = &self.output_dir {
            let paths = write_outputs(dir, &encoded)?;
            tracing::debug!("Wrote {} outputs to {}", paths.len(), dir.display());
        }

        Ok(Prediction {
            seed,
            images: encoded,
        })
    }
}

fn is_shape_mismatch(e: &anyhow::Error) -> bool {
    format!("{e:#}").to_lowercase().contains("shape mismatch")
}
