use anyhow::{anyhow, Result};
use hf_hub::api::tokio::Api;

use crate::{Loader, ModelLike, PredictorConfig, SdVersion, StableDiffusionLoader};

/// Enum of supported model types
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ModelType {
    StableDiffusion,
}

impl ModelType {
    /// Detect model type from model name
    pub fn from_name(model_name: &str) -> Option<Self> {
        let name_upper = model_name.to_uppercase();

        if name_upper.contains("STABLE-DIFFUSION") || name_upper.contains("SD-") {
            Some(ModelType::StableDiffusion)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ModelVariant {
    StableDiffusion(SdVersion),
}

impl ModelVariant {
    /// Detect model variant from model name
    pub fn from_name(model_name: &str) -> Option<Self> {
        let name_upper = model_name.to_uppercase();

        match ModelType::from_name(model_name)? {
            ModelType::StableDiffusion => Some(ModelVariant::StableDiffusion(
                if name_upper.contains("2-1") || name_upper.contains("2.1") {
                    SdVersion::V2_1
                } else {
                    SdVersion::V1_5
                },
            )),
        }
    }
}

/// Load a model based on its name, automatically detecting the appropriate loader
pub async fn load_model(api: Api, config: PredictorConfig) -> Result<Box<dyn ModelLike>> {
    let model_name = config.model.clone();
    let model_type = ModelType::from_name(&model_name)
        .ok_or_else(|| anyhow!("Unsupported model type: {}", model_name))?;
    let model_variant = ModelVariant::from_name(&model_name)
        .ok_or_else(|| anyhow!("Unsupported model variant: {}", model_name))?;

    tracing::info!(
        "Loading model: {} (detected type: {:?}/variant: {:?})",
        model_name,
        model_type,
        model_variant
    );

    match model_type {
        ModelType::StableDiffusion => {
            let model = StableDiffusionLoader::load(model_variant, api, config).await?;
            Ok(Box::new(model))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_versions_from_repo_names() {
        assert_eq!(
            ModelVariant::from_name("runwayml/stable-diffusion-v1-5"),
            Some(ModelVariant::StableDiffusion(SdVersion::V1_5))
        );
        assert_eq!(
            ModelVariant::from_name("stabilityai/stable-diffusion-2-1"),
            Some(ModelVariant::StableDiffusion(SdVersion::V2_1))
        );
        assert_eq!(
            ModelType::from_name("sd-legacy/stable-diffusion-v1-5"),
            Some(ModelType::StableDiffusion)
        );
        assert_eq!(ModelVariant::from_name("black-forest-labs/FLUX.1-dev"), None);
    }
}
