pub mod device_map;
mod error;
pub mod loader;
mod loader_factory;
pub mod lora;
pub mod output;
mod predictor;
pub mod request;
pub mod safety;
mod sd;
mod util;

pub use device_map::*;
pub use error::*;
use image::DynamicImage;
pub use loader::*;
pub use loader_factory::*;
use lora::AdapterHost;
pub use output::EncodedImage;
pub use predictor::*;
pub use request::{AspectRatio, OutputFormat, PredictionRequest};
pub use sd::{SdVersion, StableDiffusionLoader, StableDiffusionModel};
pub use util::*;

/// What one denoising run needs, after request validation and sizing.
#[derive(Debug, Clone)]
pub struct GenerationParams {
    pub prompt: String,
    pub width: usize,
    pub height: usize,
    pub num_outputs: usize,
    pub num_inference_steps: usize,
    pub guidance_scale: f64,
    pub seed: u64,
    /// img2img source, already sized to `width`x`height`.
    pub init_image: Option<DynamicImage>,
    /// How far img2img departs from the source, 0..=1.
    pub strength: f64,
}

pub trait ModelLike: AdapterHost + Send {
    fn generate(&mut self, params: &GenerationParams) -> anyhow::Result<Vec<DynamicImage>>;

    /// Switches to the slower, shape-tolerant attention path. Returns `false`
    /// when it is already in use.
    fn fallback_attention(&mut self) -> anyhow::Result<bool>;
}
