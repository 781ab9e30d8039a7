use std::future::Future;

use anyhow::Result;
use hf_hub::api::tokio::Api;
use loader_factory::ModelVariant;

use crate::{loader_factory, ModelLike, PredictorConfig};

/// Builds a ready-to-run model from hub weights.
pub trait Loader {
    type Model: ModelLike;

    /// Hub repo to pull from when the configured model is a bare name rather
    /// than `owner/name`.
    fn default_repo(variant: ModelVariant) -> &'static str;

    fn load(
        variant: ModelVariant,
        api: Api,
        config: PredictorConfig,
    ) -> impl Future<Output = Result<Self::Model>>
    where
        Self: Sized;
}
