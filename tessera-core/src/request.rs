use image::DynamicImage;
use serde::{Deserialize, Serialize};

use crate::RequestError;

/// Longest side, in pixels, an img2img source may keep.
pub const MAX_IMAGE_SIZE: u32 = 1440;

/// Word budget for prompts, roughly CLIP's 77 token window minus specials.
pub const MAX_PROMPT_WORDS: usize = 75;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
pub enum AspectRatio {
    #[default]
    #[serde(rename = "1:1")]
    Square,
    #[serde(rename = "16:9")]
    Wide16x9,
    #[serde(rename = "21:9")]
    Wide21x9,
    #[serde(rename = "3:2")]
    Landscape3x2,
    #[serde(rename = "2:3")]
    Portrait2x3,
    #[serde(rename = "4:5")]
    Portrait4x5,
    #[serde(rename = "5:4")]
    Landscape5x4,
    #[serde(rename = "3:4")]
    Portrait3x4,
    #[serde(rename = "4:3")]
    Landscape4x3,
    #[serde(rename = "9:16")]
    Tall9x16,
    #[serde(rename = "9:21")]
    Tall9x21,
}

serde_plain::derive_display_from_serialize!(AspectRatio);
serde_plain::derive_fromstr_from_deserialize!(AspectRatio);

impl AspectRatio {
    pub const ALL: [AspectRatio; 11] = [
        AspectRatio::Square,
        AspectRatio::Wide16x9,
        AspectRatio::Wide21x9,
        AspectRatio::Landscape3x2,
        AspectRatio::Portrait2x3,
        AspectRatio::Portrait4x5,
        AspectRatio::Landscape5x4,
        AspectRatio::Portrait3x4,
        AspectRatio::Landscape4x3,
        AspectRatio::Tall9x16,
        AspectRatio::Tall9x21,
    ];

    /// `(width, height)` in pixels.
    pub fn dimensions(&self) -> (usize, usize) {
        match self {
            AspectRatio::Square => (1024, 1024),
            AspectRatio::Wide16x9 => (1344, 768),
            AspectRatio::Wide21x9 => (1536, 640),
            AspectRatio::Landscape3x2 => (1216, 832),
            AspectRatio::Portrait2x3 => (832, 1216),
            AspectRatio::Portrait4x5 => (896, 1088),
            AspectRatio::Landscape5x4 => (1088, 896),
            AspectRatio::Portrait3x4 => (896, 1152),
            AspectRatio::Landscape4x3 => (1152, 896),
            AspectRatio::Tall9x16 => (768, 1344),
            AspectRatio::Tall9x21 => (640, 1536),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Webp,
    Jpg,
    Png,
}

serde_plain::derive_display_from_serialize!(OutputFormat);
serde_plain::derive_fromstr_from_deserialize!(OutputFormat);

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Webp => "webp",
            OutputFormat::Jpg => "jpg",
            OutputFormat::Png => "png",
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            OutputFormat::Webp => "image/webp",
            OutputFormat::Jpg => "image/jpeg",
            OutputFormat::Png => "image/png",
        }
    }
}

fn default_prompt_strength() -> f64 {
    0.8
}

fn default_num_outputs() -> usize {
    1
}

fn default_num_inference_steps() -> usize {
    28
}

fn default_guidance_scale() -> f64 {
    3.5
}

fn default_output_quality() -> u8 {
    80
}

fn default_disable_safety_checker() -> bool {
    true
}

/// Everything a caller can ask of one prediction.
///
/// The input image is carried already decoded; transports decide how it
/// arrives (the server takes base64).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PredictionRequest {
    pub prompt: String,
    #[serde(default)]
    pub aspect_ratio: AspectRatio,
    #[serde(skip)]
    pub image: Option<DynamicImage>,
    #[serde(default = "default_prompt_strength")]
    pub prompt_strength: f64,
    #[serde(default = "default_num_outputs")]
    pub num_outputs: usize,
    #[serde(default = "default_num_inference_steps")]
    pub num_inference_steps: usize,
    #[serde(default = "default_guidance_scale")]
    pub guidance_scale: f64,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub output_format: OutputFormat,
    #[serde(default = "default_output_quality")]
    pub output_quality: u8,
    #[serde(default)]
    pub hf_loras: Vec<String>,
    #[serde(default)]
    pub lora_scales: Vec<f64>,
    #[serde(default = "default_disable_safety_checker")]
    pub disable_safety_checker: bool,
}

impl PredictionRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            aspect_ratio: AspectRatio::default(),
            image: None,
            prompt_strength: default_prompt_strength(),
            num_outputs: default_num_outputs(),
            num_inference_steps: default_num_inference_steps(),
            guidance_scale: default_guidance_scale(),
            seed: None,
            output_format: OutputFormat::default(),
            output_quality: default_output_quality(),
            hf_loras: Vec::new(),
            lora_scales: Vec::new(),
            disable_safety_checker: default_disable_safety_checker(),
        }
    }

    pub fn validate(&self) -> Result<(), RequestError> {
        if self.prompt.trim().is_empty() {
            return Err(RequestError::EmptyPrompt);
        }
        check_range("prompt_strength", self.prompt_strength, 0.0, 1.0)?;
        check_range("num_outputs", self.num_outputs as f64, 1.0, 4.0)?;
        check_range("num_inference_steps", self.num_inference_steps as f64, 1.0, 50.0)?;
        check_range("guidance_scale", self.guidance_scale, 0.0, 10.0)?;
        check_range("output_quality", self.output_quality as f64, 0.0, 100.0)?;
        Ok(())
    }
}

fn check_range(field: &'static str, value: f64, min: f64, max: f64) -> Result<(), RequestError> {
    if value.is_nan() || value < min || value > max {
        return Err(RequestError::OutOfRange {
            field,
            value,
            min,
            max,
        });
    }
    Ok(())
}

/// Keeps at most [`MAX_PROMPT_WORDS`] whitespace separated words.
pub fn truncate_prompt(prompt: &str) -> String {
    let words: Vec<&str> = prompt.split_whitespace().collect();
    if words.len() <= MAX_PROMPT_WORDS {
        return prompt.to_string();
    }
    words[..MAX_PROMPT_WORDS].join(" ")
}

pub fn make_multiple_of_16(n: u32) -> u32 {
    n.div_ceil(16) * 16
}

/// Output size for an img2img source: shrunk to fit [`MAX_IMAGE_SIZE`], never
/// enlarged, then rounded up to a multiple of 16.
pub fn img2img_dimensions(width: u32, height: u32) -> (u32, u32) {
    let max = MAX_IMAGE_SIZE as f64;
    let scale = (max / width as f64).min(max / height as f64).min(1.0);
    let (width, height) = if scale < 1.0 {
        let scaled = (
            (width as f64 * scale) as u32,
            (height as f64 * scale) as u32,
        );
        tracing::info!("Scaling image down to {}x{}", scaled.0, scaled.1);
        scaled
    } else {
        (width, height)
    };
    (make_multiple_of_16(width), make_multiple_of_16(height))
}
