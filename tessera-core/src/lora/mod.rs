//! LoRA acquisition and composition.
//!
//! Identifiers are classified by [`LoraId`], fetched to local files by
//! [`LoraFetcher`] (hub files through `hf-hub`, everything else through the
//! URL-keyed [`WeightsCache`]), assigned to named slots, and handed to an
//! [`AdapterHost`] together with their scales. [`LoraManager`] remembers what
//! the host currently has so repeated requests don't reload anything.

use std::path::Path;

mod cache;
mod fetch;
mod id;
mod manager;
pub mod merge;
mod scales;
mod slots;
mod state;

pub use cache::{EntryKind, SpaceProbe, WeightsCache, DEFAULT_MIN_DISK_FREE};
pub use fetch::{
    check_safetensors_header, locate_weights, HubClient, LoraFetcher, HUB_DEFAULT_WEIGHT_NAME,
    REPLICATE_LORA_PATH,
};
pub use id::LoraId;
pub use manager::{LoraManager, LoraOutcome};
pub use scales::{resolve_scales, DEFAULT_LORA_SCALE};
pub use slots::{AdapterName, SlotPool, SLOT_COUNT};
pub use state::{LoadedAdapter, LoadedSet, LoraDiff};

/// The adapter API of a diffusion pipeline.
pub trait AdapterHost {
    /// Loads the weights at `weights` into slot `name` without activating them.
    fn load_adapter(&mut self, name: AdapterName, weights: &Path) -> anyhow::Result<()>;

    /// Activates exactly `adapters`, each with its weight. An empty slice means
    /// the base model.
    fn set_adapters(&mut self, adapters: &[(AdapterName, f64)]) -> anyhow::Result<()>;

    /// Drops every loaded adapter and restores the base weights.
    fn unload_adapters(&mut self) -> anyhow::Result<()>;
}
