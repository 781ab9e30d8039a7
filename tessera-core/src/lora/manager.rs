use std::path::PathBuf;
use std::time::Instant;

use super::fetch::LoraFetcher;
use super::scales::resolve_scales;
use super::slots::SlotPool;
use super::state::{LoadedAdapter, LoadedSet, LoraDiff};
use super::{AdapterHost, LoraId};
use crate::LoraError;

/// What [`LoraManager::apply`] had to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoraOutcome {
    /// Adapters were removed because none were requested.
    Cleared,
    Unchanged,
    /// Same adapters, new weights.
    Rescaled,
    Reloaded { loaded: usize, skipped: usize },
}

/// Keeps the pipeline's adapters in sync with what each request asks for.
pub struct LoraManager {
    fetcher: LoraFetcher,
    loaded: LoadedSet,
}

impl LoraManager {
    pub fn new(fetcher: LoraFetcher) -> Self {
        Self {
            fetcher,
            loaded: LoadedSet::default(),
        }
    }

    pub fn loaded(&self) -> &LoadedSet {
        &self.loaded
    }

    pub fn fetcher(&self) -> &LoraFetcher {
        &self.fetcher
    }

    /// Brings `host` to the requested adapter set.
    ///
    /// Scales, identifiers and slot capacity are validated before anything is
    /// fetched, and everything is fetched before the host is touched, so a bad
    /// request or a failed download leaves the previous adapters in place.
    pub async fn apply<H>(
        &mut self,
        host: &mut H,
        loras: &[String],
        scales: &[f64],
    ) -> Result<LoraOutcome, LoraError>
    where
        H: AdapterHost + ?Sized,
    {
        if loras.is_empty() {
            if self.loaded.is_empty() {
                return Ok(LoraOutcome::Unchanged);
            }
            host.unload_adapters().map_err(LoraError::Apply)?;
            self.loaded = LoadedSet::default();
            return Ok(LoraOutcome::Cleared);
        }

        let scales = resolve_scales(loras.len(), scales)?;
        SlotPool::check_capacity(loras.len())?;
        let ids = loras
            .iter()
            .map(|raw| LoraId::parse(raw))
            .collect::<Result<Vec<_>, _>>()?;

        match self.loaded.diff(loras, &scales) {
            LoraDiff::Unchanged => {
                tracing::debug!("LoRAs unchanged, skipping reload");
                return Ok(LoraOutcome::Unchanged);
            }
            LoraDiff::Rescale => {
                let mut rescaled = self.loaded.clone();
                let active = rescaled.rescale(&scales);
                tracing::info!("Rescaling {} loaded LoRAs", active.len());
                host.set_adapters(&active).map_err(LoraError::Apply)?;
                self.loaded = rescaled;
                return Ok(LoraOutcome::Rescaled);
            }
            LoraDiff::Reload => {}
        }

        let result = self.reload(host, loras, &ids, &scales).await;
        self.fetcher.release();
        result
    }

    /// Fetches every adapter, then swaps the host over to them. Fetched
    /// entries stay pinned in the cache until the caller releases them.
    async fn reload<H>(
        &mut self,
        host: &mut H,
        loras: &[String],
        ids: &[LoraId],
        scales: &[f64],
    ) -> Result<LoraOutcome, LoraError>
    where
        H: AdapterHost + ?Sized,
    {
        let mut fetched: Vec<(String, f64, Option<PathBuf>)> = Vec::with_capacity(ids.len());
        for ((raw, id), scale) in loras.iter().zip(ids).zip(scales) {
            tracing::info!("Downloading LoRA weights from - {}: {id}", id.describe());
            let start = Instant::now();
            match self.fetcher.fetch(id).await {
                Ok(path) => {
                    tracing::info!(
                        "Fetching LoRA took: {:.2} seconds",
                        start.elapsed().as_secs_f64()
                    );
                    fetched.push((raw.clone(), *scale, Some(path)));
                }
                Err(e) if id.is_optional() => {
                    tracing::warn!("Error downloading LoRA weights, skipping {id}: {e}");
                    fetched.push((raw.clone(), *scale, None));
                }
                Err(e) => return Err(e),
            }
        }

        if !self.loaded.is_empty() {
            host.unload_adapters().map_err(LoraError::Apply)?;
            self.loaded = LoadedSet::default();
        }

        match load_all(host, fetched) {
            Ok(set) => {
                let loaded = set.active().len();
                let skipped = set.adapters().len() - loaded;
                self.loaded = set;
                Ok(LoraOutcome::Reloaded { loaded, skipped })
            }
            Err(e) => {
                if let Err(unload) = host.unload_adapters() {
                    tracing::warn!("Failed to unload partially loaded LoRAs: {unload:#}");
                }
                Err(e)
            }
        }
    }
}

fn load_all<H>(
    host: &mut H,
    fetched: Vec<(String, f64, Option<PathBuf>)>,
) -> Result<LoadedSet, LoraError>
where
    H: AdapterHost + ?Sized,
{
    let mut pool = SlotPool::new();
    let mut adapters = Vec::with_capacity(fetched.len());
    for (identifier, scale, path) in fetched {
        let slot = match path {
            Some(path) => {
                let start = Instant::now();
                let name = pool.assign()?;
                host.load_adapter(name, &path).map_err(LoraError::Apply)?;
                tracing::info!(
                    "Loading LoRA {identifier} into slot {name} took: {:.2} seconds",
                    start.elapsed().as_secs_f64()
                );
                Some(name)
            }
            None => None,
        };
        adapters.push(LoadedAdapter {
            identifier,
            scale,
            slot,
        });
    }

    let set = LoadedSet::new(adapters);
    host.set_adapters(&set.active()).map_err(LoraError::Apply)?;
    Ok(set)
}
