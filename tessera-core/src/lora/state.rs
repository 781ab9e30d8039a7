use super::AdapterName;

/// One requested adapter and where it ended up.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedAdapter {
    pub identifier: String,
    pub scale: f64,
    /// `None` when the adapter was requested but skipped during loading.
    pub slot: Option<AdapterName>,
}

/// What the pipeline currently has applied, in request order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadedSet {
    adapters: Vec<LoadedAdapter>,
}

/// How a new request relates to the loaded set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoraDiff {
    Unchanged,
    /// Same adapters in the same order, only the weights moved.
    Rescale,
    Reload,
}

impl LoadedSet {
    pub fn new(adapters: Vec<LoadedAdapter>) -> Self {
        Self { adapters }
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    pub fn adapters(&self) -> &[LoadedAdapter] {
        &self.adapters
    }

    pub fn diff(&self, identifiers: &[String], scales: &[f64]) -> LoraDiff {
        let same_ids = self.adapters.len() == identifiers.len()
            && self
                .adapters
                .iter()
                .zip(identifiers)
                .all(|(a, id)| &a.identifier == id);
        if !same_ids {
            return LoraDiff::Reload;
        }
        let same_scales = self
            .adapters
            .iter()
            .zip(scales)
            .all(|(a, s)| a.scale == *s);
        if same_scales {
            LoraDiff::Unchanged
        } else {
            LoraDiff::Rescale
        }
    }

    /// Applies new scales to the same adapters, returning the slot weights to
    /// hand to the pipeline.
    pub fn rescale(&mut self, scales: &[f64]) -> Vec<(AdapterName, f64)> {
        for (adapter, scale) in self.adapters.iter_mut().zip(scales) {
            adapter.scale = *scale;
        }
        self.active()
    }

    /// The slots that are actually loaded, with their weights.
    pub fn active(&self) -> Vec<(AdapterName, f64)> {
        self.adapters
            .iter()
            .filter_map(|a| a.slot.map(|slot| (slot, a.scale)))
            .collect()
    }
}
