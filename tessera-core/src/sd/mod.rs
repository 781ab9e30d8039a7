use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use anyhow::{Context, Error, Result};
use candle_core::{DType, Device, Module, Tensor};
use candle_transformers::models::stable_diffusion::{
    self, clip::ClipTextTransformer, schedulers::Scheduler, unet_2d::UNet2DConditionModel,
    vae::AutoEncoderKL, StableDiffusionConfig,
};
use hf_hub::api::tokio::Api;
use image::DynamicImage;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;
use tokenizers::Tokenizer;

use crate::lora::merge::{merge_into, LoraAdapter, LoraTarget};
use crate::lora::{AdapterHost, AdapterName};
use crate::{
    image_to_tensor, select_best_device, tensor_to_images, GenerationParams, Loader, ModelLike,
    ModelVariant, PredictorConfig,
};

const VAE_SCALE: f64 = 0.18215;
const TOKENIZER_REPO: &str = "openai/clip-vit-base-patch32";
const SLICED_ATTENTION_SIZE: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdVersion {
    V1_5,
    V2_1,
}

impl SdVersion {
    pub fn default_repo(&self) -> &'static str {
        match self {
            SdVersion::V1_5 => "runwayml/stable-diffusion-v1-5",
            SdVersion::V2_1 => "stabilityai/stable-diffusion-2-1",
        }
    }

    fn config(&self, sliced_attention_size: Option<usize>) -> StableDiffusionConfig {
        match self {
            SdVersion::V1_5 => StableDiffusionConfig::v1_5(sliced_attention_size, None, None),
            SdVersion::V2_1 => StableDiffusionConfig::v2_1(sliced_attention_size, None, None),
        }
    }
}

/// Base weights of the components adapters can patch. The tensors are read
/// from disk the first time an adapter needs them.
struct BaseWeights {
    unet_file: PathBuf,
    clip_file: PathBuf,
    unet: Option<HashMap<String, Tensor>>,
    clip: Option<HashMap<String, Tensor>>,
}

impl BaseWeights {
    fn file(&self, target: LoraTarget) -> &Path {
        match target {
            LoraTarget::Unet => &self.unet_file,
            LoraTarget::TextEncoder => &self.clip_file,
        }
    }

    fn tensors(&mut self, target: LoraTarget) -> Result<&HashMap<String, Tensor>> {
        let (slot, file) = match target {
            LoraTarget::Unet => (&mut self.unet, &self.unet_file),
            LoraTarget::TextEncoder => (&mut self.clip, &self.clip_file),
        };
        if slot.is_none() {
            let tensors = candle_core::safetensors::load(file, &Device::Cpu)
                .with_context(|| format!("failed to read base weights {}", file.display()))?;
            *slot = Some(tensors);
        }
        slot.as_ref()
            .ok_or_else(|| anyhow::anyhow!("base weights for {target:?} not loaded"))
    }
}

pub struct StableDiffusionModel {
    version: SdVersion,
    device: Device,
    dtype: DType,
    config: StableDiffusionConfig,
    use_flash_attn: bool,
    sliced: bool,
    tokenizer: Tokenizer,
    text_model: ClipTextTransformer,
    vae: AutoEncoderKL,
    unet: UNet2DConditionModel,
    base: BaseWeights,
    unet_weights: PathBuf,
    clip_weights: PathBuf,
    adapters: BTreeMap<AdapterName, LoraAdapter>,
    active: Vec<(AdapterName, f64)>,
    work_dir: TempDir,
}

impl StableDiffusionModel {
    pub fn version(&self) -> SdVersion {
        self.version
    }

    fn text_embeddings(&self, prompt: &str, use_guide: bool) -> Result<Tensor> {
        let vocab = self.tokenizer.get_vocab(true);
        let pad = self.config.clip.pad_with.as_deref().unwrap_or("<|endoftext|>");
        let pad_id = *vocab
            .get(pad)
            .ok_or_else(|| anyhow::anyhow!("tokenizer has no `{pad}` token"))?;

        let cond = self.text_model.forward(&self.tokenize(prompt, pad_id)?)?;
        let embeddings = if use_guide {
            let uncond = self.text_model.forward(&self.tokenize("", pad_id)?)?;
            Tensor::cat(&[uncond, cond], 0)?
        } else {
            cond
        };
        Ok(embeddings.to_dtype(self.dtype)?)
    }

    fn tokenize(&self, prompt: &str, pad_id: u32) -> Result<Tensor> {
        let max_len = self.config.clip.max_position_embeddings;
        let mut tokens = self
            .tokenizer
            .encode(prompt, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        tokens.truncate(max_len);
        tokens.resize(max_len, pad_id);
        Ok(Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?)
    }

    fn build_unet(&self, weights: &Path) -> Result<UNet2DConditionModel> {
        self.config
            .build_unet(weights, &self.device, 4, self.use_flash_attn, self.dtype)
            .context("failed to build unet")
    }

    /// Folds the active adapters into the base weights and rebuilds whatever
    /// component changed.
    fn recompose(&mut self) -> Result<()> {
        let chosen: Vec<(&LoraAdapter, f64)> = self
            .active
            .iter()
            .filter_map(|(name, scale)| self.adapters.get(name).map(|a| (a, *scale)))
            .collect();
        let unet_path = compose(&mut self.base, LoraTarget::Unet, &chosen, self.work_dir.path())?;
        let clip_path =
            compose(&mut self.base, LoraTarget::TextEncoder, &chosen, self.work_dir.path())?;

        if unet_path != self.unet_weights || unet_path.starts_with(self.work_dir.path()) {
            self.unet = self.build_unet(&unet_path)?;
            self.unet_weights = unet_path;
        }
        if clip_path != self.clip_weights || clip_path.starts_with(self.work_dir.path()) {
            self.text_model = stable_diffusion::build_clip_transformer(
                &self.config.clip,
                &clip_path,
                &self.device,
                self.dtype,
            )
            .context("failed to build text encoder")?;
            self.clip_weights = clip_path;
        }
        Ok(())
    }

    fn denoise(
        &self,
        params: &GenerationParams,
        text_embeddings: &Tensor,
        init_latents: Option<&Tensor>,
        rng: &mut StdRng,
    ) -> Result<Tensor> {
        let use_guide = params.guidance_scale > 1.0;
        let mut scheduler = self.config.build_scheduler(params.num_inference_steps)?;
        let timesteps = scheduler.timesteps().to_vec();
        let shape = (1, 4, params.height / 8, params.width / 8);

        let (mut latents, t_start) = match init_latents {
            Some(init) => {
                let steps = params.num_inference_steps;
                let t_start = steps - (steps as f64 * params.strength) as usize;
                let noise = seeded_noise(rng, shape, &self.device)?.to_dtype(self.dtype)?;
                let latents = match timesteps.get(t_start) {
                    Some(&t) => scheduler.add_noise(init, noise, t)?,
                    None => init.clone(),
                };
                (latents, t_start)
            }
            None => {
                let noise = seeded_noise(rng, shape, &self.device)?;
                ((noise * scheduler.init_noise_sigma())?.to_dtype(self.dtype)?, 0)
            }
        };

        for (index, &timestep) in timesteps.iter().enumerate() {
            if index < t_start {
                continue;
            }
            let input = if use_guide {
                Tensor::cat(&[&latents, &latents], 0)?
            } else {
                latents.clone()
            };
            let input = scheduler.scale_model_input(input, timestep)?;
            let noise_pred = self.unet.forward(&input, timestep as f64, text_embeddings)?;
            let noise_pred = if use_guide {
                let chunks = noise_pred.chunk(2, 0)?;
                let (uncond, cond) = (&chunks[0], &chunks[1]);
                (uncond + ((cond - uncond)? * params.guidance_scale)?)?
            } else {
                noise_pred
            };
            latents = scheduler.step(&noise_pred, timestep, &latents)?;
            tracing::debug!("step {}/{} done", index + 1, timesteps.len());
        }

        let decoded = self.vae.decode(&(&latents / VAE_SCALE)?)?;
        let decoded = ((decoded.to_dtype(DType::F32)? / 2.)? + 0.5)?.to_device(&Device::Cpu)?;
        Ok((decoded.clamp(0f32, 1.)? * 255.)?.to_dtype(DType::U8)?)
    }
}

/// Writes `target`'s base weights with every chosen adapter folded in, or
/// returns the untouched base file when no adapter patches it.
fn compose(
    base: &mut BaseWeights,
    target: LoraTarget,
    chosen: &[(&LoraAdapter, f64)],
    work_dir: &Path,
) -> Result<PathBuf> {
    if !chosen.iter().any(|(adapter, _)| adapter.targets(target)) {
        return Ok(base.file(target).to_path_buf());
    }
    let (merged, report) = merge_into(base.tensors(target)?, target, chosen)?;
    if !report.unmatched.is_empty() {
        tracing::warn!(
            "{} {target:?} LoRA modules matched no weight, e.g. {}",
            report.unmatched.len(),
            report.unmatched[0]
        );
    }
    tracing::info!("Patched {} {target:?} weights", report.patched);

    let path = work_dir.join(match target {
        LoraTarget::Unet => "unet.safetensors",
        LoraTarget::TextEncoder => "text_encoder.safetensors",
    });
    candle_core::safetensors::save(&merged, &path)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(path)
}

/// Standard normal noise from a seeded host RNG, so the same seed gives the
/// same image on every device.
fn seeded_noise(rng: &mut StdRng, shape: (usize, usize, usize, usize), device: &Device) -> Result<Tensor> {
    let len = shape.0 * shape.1 * shape.2 * shape.3;
    let mut values = Vec::with_capacity(len);
    while values.len() < len {
        let u1: f32 = 1.0 - rng.gen::<f32>();
        let u2: f32 = rng.gen::<f32>();
        let radius = (-2.0 * u1.ln()).sqrt();
        let theta = 2.0 * std::f32::consts::PI * u2;
        values.push(radius * theta.cos());
        if values.len() < len {
            values.push(radius * theta.sin());
        }
    }
    Ok(Tensor::from_vec(values, shape, device)?)
}

impl AdapterHost for StableDiffusionModel {
    fn load_adapter(&mut self, name: AdapterName, weights: &Path) -> Result<()> {
        let adapter = LoraAdapter::from_safetensors(weights, &Device::Cpu)?;
        if adapter.is_empty() {
            anyhow::bail!("{} holds no LoRA modules", weights.display());
        }
        tracing::debug!("adapter {name}: {} modules", adapter.len());
        self.adapters.insert(name, adapter);
        Ok(())
    }

    fn set_adapters(&mut self, adapters: &[(AdapterName, f64)]) -> Result<()> {
        if let Some((name, _)) = adapters.iter().find(|(n, _)| !self.adapters.contains_key(n)) {
            anyhow::bail!("adapter {name} is not loaded");
        }
        self.active = adapters.to_vec();
        self.recompose()
    }

    fn unload_adapters(&mut self) -> Result<()> {
        self.adapters.clear();
        self.active.clear();
        self.recompose()
    }
}

impl ModelLike for StableDiffusionModel {
    fn generate(&mut self, params: &GenerationParams) -> Result<Vec<DynamicImage>> {
        if params.width % 8 != 0 || params.height % 8 != 0 {
            anyhow::bail!(
                "image size {}x{} is not a multiple of 8",
                params.width,
                params.height
            );
        }
        if let Err(e) = self.device.set_seed(params.seed) {
            tracing::debug!("device RNG not seeded: {e}");
        }
        let mut rng = StdRng::seed_from_u64(params.seed);

        let use_guide = params.guidance_scale > 1.0;
        let text_embeddings = self.text_embeddings(&params.prompt, use_guide)?;

        let init_latents = match &params.init_image {
            Some(image) => {
                let image = image_to_tensor(
                    image,
                    params.width as u32,
                    params.height as u32,
                    &self.device,
                )?
                .to_dtype(self.dtype)?;
                let dist = self.vae.encode(&image)?;
                Some((dist.sample()? * VAE_SCALE)?)
            }
            None => None,
        };

        let mut images = Vec::with_capacity(params.num_outputs);
        for idx in 0..params.num_outputs {
            tracing::info!("Generating image {}/{}", idx + 1, params.num_outputs);
            let pixels =
                self.denoise(params, &text_embeddings, init_latents.as_ref(), &mut rng)?;
            images.extend(tensor_to_images(&pixels)?);
        }
        Ok(images)
    }

    fn fallback_attention(&mut self) -> Result<bool> {
        if self.sliced {
            return Ok(false);
        }
        tracing::info!("Switching to sliced attention");
        self.config = self.version.config(Some(SLICED_ATTENTION_SIZE));
        self.use_flash_attn = false;
        self.sliced = true;
        let weights = self.unet_weights.clone();
        self.unet = self.build_unet(&weights)?;
        Ok(true)
    }
}

pub struct StableDiffusionLoader;

impl Loader for StableDiffusionLoader {
    type Model = StableDiffusionModel;

    fn default_repo(variant: ModelVariant) -> &'static str {
        let ModelVariant::StableDiffusion(version) = variant;
        version.default_repo()
    }

    async fn load(variant: ModelVariant, api: Api, config: PredictorConfig) -> Result<Self::Model> {
        let ModelVariant::StableDiffusion(version) = variant;

        // Configure device.
        let device = select_best_device(config.device).context("failed to set up device")?;
        let dtype = if config.use_f16 && !device.is_cpu() {
            DType::F16
        } else {
            DType::F32
        };
        let suffix = if config.use_f16 {
            ".fp16.safetensors"
        } else {
            ".safetensors"
        };
        let use_flash_attn = cfg!(feature = "flash-attn");
        let sd_config = version.config(None);

        let repo_id = if config.model.contains('/') {
            config.model.clone()
        } else {
            Self::default_repo(variant).to_string()
        };
        let repo = api.model(repo_id.clone());

        // --- Tokenizer and text encoder ---
        let tokenizer_file = api
            .model(TOKENIZER_REPO.to_string())
            .get("tokenizer.json")
            .await
            .context("failed to get CLIP tokenizer")?;
        let tokenizer = Tokenizer::from_file(tokenizer_file)
            .map_err(Error::msg)
            .context("failed to load CLIP tokenizer")?;
        let clip_file = repo
            .get(&format!("text_encoder/model{suffix}"))
            .await
            .context("failed to get text encoder weights")?;
        let text_model =
            stable_diffusion::build_clip_transformer(&sd_config.clip, &clip_file, &device, dtype)
                .context("failed to load text encoder")?;

        // --- VAE ---
        let vae_file = repo
            .get(&format!("vae/diffusion_pytorch_model{suffix}"))
            .await
            .context("failed to get vae weights")?;
        let vae = sd_config
            .build_vae(&vae_file, &device, dtype)
            .context("failed to load vae")?;

        // --- UNet ---
        let unet_file = repo
            .get(&format!("unet/diffusion_pytorch_model{suffix}"))
            .await
            .context("failed to get unet weights")?;
        let unet = sd_config
            .build_unet(&unet_file, &device, 4, use_flash_attn, dtype)
            .context("failed to load unet")?;

        let work_dir = tempfile::Builder::new()
            .prefix("tessera-lora-")
            .tempdir()
            .context("failed to create LoRA work dir")?;

        tracing::info!("Loaded {:?} from {} on {:?}", version, repo_id, device);
        Ok(StableDiffusionModel {
            version,
            device,
            dtype,
            config: sd_config,
            use_flash_attn,
            sliced: false,
            tokenizer,
            text_model,
            vae,
            unet,
            base: BaseWeights {
                unet_file: unet_file.clone(),
                clip_file: clip_file.clone(),
                unet: None,
                clip: None,
            },
            unet_weights: unet_file,
            clip_weights: clip_file,
            adapters: BTreeMap::new(),
            active: Vec::new(),
            work_dir,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeded_noise_is_reproducible() -> Result<()> {
        let shape = (1, 4, 8, 8);
        let a = seeded_noise(&mut StdRng::seed_from_u64(7), shape, &Device::Cpu)?;
        let b = seeded_noise(&mut StdRng::seed_from_u64(7), shape, &Device::Cpu)?;
        let c = seeded_noise(&mut StdRng::seed_from_u64(8), shape, &Device::Cpu)?;
        assert_eq!(a.dims(), &[1, 4, 8, 8]);
        assert_eq!(a.flatten_all()?.to_vec1::<f32>()?, b.flatten_all()?.to_vec1::<f32>()?);
        assert_ne!(a.flatten_all()?.to_vec1::<f32>()?, c.flatten_all()?.to_vec1::<f32>()?);

        let mean = a.mean_all()?.to_scalar::<f32>()?;
        assert!(mean.abs() < 0.5);
        Ok(())
    }

    #[test]
    fn untouched_components_keep_base_file() -> Result<()> {
        let dir = TempDir::new()?;
        let mut base = BaseWeights {
            unet_file: dir.path().join("unet.bin"),
            clip_file: dir.path().join("clip.bin"),
            unet: None,
            clip: None,
        };
        let path = compose(&mut base, LoraTarget::Unet, &[], dir.path())?;
        assert_eq!(path, dir.path().join("unet.bin"));
        assert!(base.unet.is_none());
        Ok(())
    }

    #[test]
    fn composes_patched_weights_to_work_dir() -> Result<()> {
        let dir = TempDir::new()?;
        let weights = dir.path().join("base.safetensors");
        let base_tensors = HashMap::from([(
            "proj.weight".to_string(),
            Tensor::zeros((2, 2), DType::F32, &Device::Cpu)?,
        )]);
        candle_core::safetensors::save(&base_tensors, &weights)?;

        let adapter = LoraAdapter::from_tensors(
            HashMap::from([
                (
                    "unet.proj.lora_A.weight".to_string(),
                    Tensor::new(&[[1f32, 0.]], &Device::Cpu)?,
                ),
                (
                    "unet.proj.lora_B.weight".to_string(),
                    Tensor::new(&[[1f32], [0.]], &Device::Cpu)?,
                ),
            ]),
            None,
        )?;
        let mut base = BaseWeights {
            unet_file: weights,
            clip_file: dir.path().join("clip.safetensors"),
            unet: None,
            clip: None,
        };
        let work = TempDir::new()?;
        let path = compose(&mut base, LoraTarget::Unet, &[(&adapter, 0.5)], work.path())?;
        assert!(path.starts_with(work.path()));

        let merged = candle_core::safetensors::load(&path, &Device::Cpu)?;
        let values = merged["proj.weight"].to_vec2::<f32>()?;
        assert_eq!(values, vec![vec![0.5, 0.], vec![0., 0.]]);
        Ok(())
    }
}
