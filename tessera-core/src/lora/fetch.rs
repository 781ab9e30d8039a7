use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use super::cache::{EntryKind, WeightsCache};
use super::LoraId;
use crate::LoraError;

/// File a hub repo is expected to hold when only the slug is given.
pub const HUB_DEFAULT_WEIGHT_NAME: &str = "pytorch_lora_weights.safetensors";

/// Where Replicate's trainer leaves the weights inside `trained_model.tar`.
pub const REPLICATE_LORA_PATH: &str = "output/flux_train_replicate/lora.safetensors";

/// Largest safetensors header accepted while checking a download.
const MAX_HEADER_LEN: u64 = 100 << 20;

/// Minimal hub access, so tests can stand in for the real API.
#[async_trait]
pub trait HubClient: Send + Sync {
    /// Downloads `file` from the model repo `repo` and returns its local path.
    async fn fetch(&self, repo: &str, file: &str) -> Result<PathBuf, LoraError>;
}

#[async_trait]
impl HubClient for hf_hub::api::tokio::Api {
    async fn fetch(&self, repo: &str, file: &str) -> Result<PathBuf, LoraError> {
        self.model(repo.to_string())
            .get(file)
            .await
            .map_err(|e| LoraError::Hub {
                repo: repo.to_string(),
                file: file.to_string(),
                message: e.to_string(),
            })
    }
}

/// Turns LoRA identifiers into local `.safetensors` files.
pub struct LoraFetcher {
    cache: WeightsCache,
    hub: Arc<dyn HubClient>,
}

impl LoraFetcher {
    pub fn new(cache: WeightsCache, hub: Arc<dyn HubClient>) -> Self {
        Self { cache, hub }
    }

    pub fn cache(&self) -> &WeightsCache {
        &self.cache
    }

    /// Lets the cache evict everything fetched so far.
    pub fn release(&mut self) {
        self.cache.unpin_all();
    }

    pub async fn fetch(&mut self, id: &LoraId) -> Result<PathBuf, LoraError> {
        let path = match id {
            LoraId::HubSlug { repo } => self.hub.fetch(repo, HUB_DEFAULT_WEIGHT_NAME).await?,
            LoraId::HubUrl { repo, weight_name } => {
                tracing::info!("HuggingFace slug from URL: {repo}, weight name: {weight_name}");
                self.hub.fetch(repo, weight_name).await?
            }
            LoraId::ReplicateTar { .. } => {
                let dir = self.cache.ensure(&id.source_key(), EntryKind::Archive).await?;
                let weights = dir.join(REPLICATE_LORA_PATH);
                if !weights.is_file() {
                    return Err(LoraError::MissingWeights(weights));
                }
                weights
            }
            LoraId::Civitai { url } => {
                let slug = url.split("?type").next().unwrap_or(url);
                tracing::debug!("Civitai model {slug}");
                self.cache.ensure(url, EntryKind::File).await?
            }
            LoraId::SafetensorsUrl { .. } => {
                self.cache.ensure(&id.source_key(), EntryKind::File).await?
            }
            LoraId::LocalFile { path } => {
                if !path.is_file() {
                    return Err(LoraError::MissingWeights(path.clone()));
                }
                path.clone()
            }
            LoraId::LocalArchive { path } => {
                if !path.is_file() {
                    return Err(LoraError::MissingWeights(path.clone()));
                }
                let dir = self.cache.ensure_local_archive(path).await?;
                locate_weights(&dir)?
            }
        };
        check_safetensors_header(&path)?;
        Ok(path)
    }
}

/// Finds the weights inside an unpacked archive: the Replicate layout if present,
/// otherwise the first `.safetensors` file in sorted order.
pub fn locate_weights(dir: &Path) -> Result<PathBuf, LoraError> {
    let replicate = dir.join(REPLICATE_LORA_PATH);
    if replicate.is_file() {
        return Ok(replicate);
    }
    first_safetensors(dir)?.ok_or_else(|| LoraError::MissingWeights(dir.to_path_buf()))
}

fn first_safetensors(dir: &Path) -> Result<Option<PathBuf>, LoraError> {
    let mut entries = std::fs::read_dir(dir)?
        .map(|e| e.map(|e| e.path()))
        .collect::<Result<Vec<_>, _>>()?;
    entries.sort();
    for path in entries {
        if path.is_dir() {
            if let Some(found) = first_safetensors(&path)? {
                return Ok(Some(found));
            }
        } else if path.extension().is_some_and(|ext| ext == "safetensors") {
            return Ok(Some(path));
        }
    }
    Ok(None)
}

/// Reads just the JSON header so an HTML error page or a truncated download is
/// caught before the weights reach the model.
pub fn check_safetensors_header(path: &Path) -> Result<(), LoraError> {
    let invalid = |message: String| LoraError::InvalidWeights {
        path: path.to_path_buf(),
        message,
    };

    let mut file = File::open(path)?;
    let file_len = file.metadata()?.len();
    let mut len_bytes = [0u8; 8];
    file.read_exact(&mut len_bytes)
        .map_err(|_| invalid("file is shorter than the header length".to_string()))?;
    let header_len = u64::from_le_bytes(len_bytes);
    if header_len > MAX_HEADER_LEN || header_len + 8 > file_len {
        return Err(invalid(format!("implausible header length {header_len}")));
    }

    let mut header = vec![0u8; header_len as usize];
    file.read_exact(&mut header)?;
    serde_json::from_slice::<HashMap<String, serde_json::Value>>(&header)
        .map_err(|e| invalid(e.to_string()))?;
    Ok(())
}
