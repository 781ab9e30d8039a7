//! Parsing of LoRA weight files and folding their deltas into base weights.
//!
//! Three key layouts are understood:
//!
//! * kohya-ss: `lora_unet_<module>.lora_down.weight`, `.lora_up.weight`, `.alpha`
//!   with the module path underscored (`lora_te_` for the text encoder);
//! * PEFT / diffusers: `unet.<module>.lora_A.weight` and `.lora_B.weight`, or
//!   `<module>.lora.down.weight` and `.lora.up.weight`;
//! * legacy attention processors: `<block>.processor.to_q_lora.down.weight`.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use safetensors::SafeTensors;

/// Which model component a LoRA module patches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoraTarget {
    Unet,
    TextEncoder,
}

/// How a module path is spelled in the adapter file.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ModulePath {
    /// `down_blocks.0.attentions.0.proj_in`
    Dotted(String),
    /// `down_blocks_0_attentions_0_proj_in`
    Underscored(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Part {
    Down,
    Up,
    Alpha,
}

/// One low-rank pair.
#[derive(Debug, Clone)]
pub struct LoraModule {
    pub down: Tensor,
    pub up: Tensor,
    pub alpha: Option<f64>,
}

impl LoraModule {
    pub fn rank(&self) -> Result<usize> {
        Ok(self.down.dim(0)?)
    }

    /// `scale * alpha / rank * (up @ down)`, shaped like the weight it patches.
    pub fn delta(&self, shape: &[usize], scale: f64) -> Result<Tensor> {
        let rank = self.rank()?;
        let alpha = self.alpha.unwrap_or(rank as f64);
        let down = self.down.to_dtype(DType::F32)?.flatten_from(1)?;
        let up = self.up.to_dtype(DType::F32)?.flatten_from(1)?;
        let delta = up.matmul(&down)?;
        let delta = (delta * (scale * alpha / rank as f64))?;
        delta
            .reshape(shape)
            .with_context(|| format!("lora delta {:?} does not fit weight {shape:?}", delta.dims()))
    }
}

/// A parsed adapter file.
#[derive(Debug, Clone, Default)]
pub struct LoraAdapter {
    modules: HashMap<(LoraTarget, ModulePath), LoraModule>,
}

/// Result of folding adapters into one component.
#[derive(Debug, Default)]
pub struct MergeReport {
    pub patched: usize,
    pub unmatched: Vec<String>,
}

impl LoraAdapter {
    pub fn from_safetensors(path: &Path, device: &Device) -> Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("failed to read lora weights {}", path.display()))?;
        let (_, metadata) = SafeTensors::read_metadata(&bytes)
            .map_err(|e| anyhow::anyhow!("{e:?}"))
            .with_context(|| format!("failed to parse {}", path.display()))?;
        let default_alpha = metadata
            .metadata()
            .as_ref()
            .and_then(|m| m.get("ss_network_alpha"))
            .and_then(|a| a.parse::<f64>().ok());
        let tensors = candle_core::safetensors::load_buffer(&bytes, device)
            .with_context(|| format!("failed to load tensors from {}", path.display()))?;
        Self::from_tensors(tensors, default_alpha)
    }

    pub fn from_tensors(tensors: HashMap<String, Tensor>, default_alpha: Option<f64>) -> Result<Self> {
        let mut downs = HashMap::new();
        let mut ups = HashMap::new();
        let mut alphas = HashMap::new();

        for (key, tensor) in tensors {
            let Some((target, module, part)) = parse_key(&key) else {
                tracing::debug!("Ignoring lora tensor {key}");
                continue;
            };
            match part {
                Part::Down => {
                    downs.insert((target, module), tensor);
                }
                Part::Up => {
                    ups.insert((target, module), tensor);
                }
                Part::Alpha => {
                    let alpha = tensor.to_dtype(DType::F64)?.flatten_all()?.to_vec1::<f64>()?;
                    if let Some(alpha) = alpha.first() {
                        alphas.insert((target, module), *alpha);
                    }
                }
            }
        }

        let mut modules = HashMap::new();
        for (key, down) in downs {
            let Some(up) = ups.remove(&key) else {
                anyhow::bail!("lora module {:?} has a down projection but no up projection", key.1);
            };
            let alpha = alphas.get(&key).copied().or(default_alpha);
            modules.insert(key, LoraModule { down, up, alpha });
        }
        if let Some(key) = ups.keys().next() {
            anyhow::bail!("lora module {:?} has an up projection but no down projection", key.1);
        }
        if modules.is_empty() {
            anyhow::bail!("no lora modules found");
        }

        Ok(Self { modules })
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn targets(&self, target: LoraTarget) -> bool {
        self.modules.keys().any(|(t, _)| *t == target)
    }
}

/// Folds every adapter's `target` modules into a copy of `base`.
///
/// Tensors that no adapter touches are shared with `base`; patched ones are
/// summed in f32 and cast back to the base dtype.
pub fn merge_into(
    base: &HashMap<String, Tensor>,
    target: LoraTarget,
    adapters: &[(&LoraAdapter, f64)],
) -> Result<(HashMap<String, Tensor>, MergeReport)> {
    let underscored: HashMap<String, &String> = base
        .keys()
        .filter_map(|k| {
            k.strip_suffix(".weight")
                .map(|m| (m.replace('.', "_"), k))
        })
        .collect();

    let mut report = MergeReport::default();
    let mut deltas: HashMap<String, Tensor> = HashMap::new();
    for (adapter, scale) in adapters {
        for ((t, module), lora) in &adapter.modules {
            if *t != target {
                continue;
            }
            let base_key = match module {
                ModulePath::Dotted(path) => {
                    let key = format!("{path}.weight");
                    base.contains_key(&key).then_some(key)
                }
                ModulePath::Underscored(path) => underscored.get(path).map(|k| (*k).clone()),
            };
            let Some(base_key) = base_key else {
                report.unmatched.push(match module {
                    ModulePath::Dotted(p) | ModulePath::Underscored(p) => p.clone(),
                });
                continue;
            };
            let weight = &base[&base_key];
            let delta = lora.delta(weight.dims(), *scale)?;
            let delta = match deltas.remove(&base_key) {
                Some(acc) => (acc + delta)?,
                None => delta,
            };
            deltas.insert(base_key, delta);
        }
    }

    let mut merged = base.clone();
    for (key, delta) in deltas {
        let weight = &base[&key];
        let patched = (weight.to_dtype(DType::F32)? + delta.to_device(weight.device())?)?
            .to_dtype(weight.dtype())?;
        merged.insert(key, patched);
        report.patched += 1;
    }
    report.unmatched.sort();
    report.unmatched.dedup();
    Ok((merged, report))
}

fn parse_key(key: &str) -> Option<(LoraTarget, ModulePath, Part)> {
    for (prefix, target) in [
        ("lora_unet_", LoraTarget::Unet),
        ("lora_te1_", LoraTarget::TextEncoder),
        ("lora_te_", LoraTarget::TextEncoder),
    ] {
        if let Some(rest) = key.strip_prefix(prefix) {
            let (module, suffix) = rest.split_once('.')?;
            let part = match suffix {
                "lora_down.weight" => Part::Down,
                "lora_up.weight" => Part::Up,
                "alpha" => Part::Alpha,
                _ => return None,
            };
            return Some((target, ModulePath::Underscored(module.to_string()), part));
        }
    }

    let (target, rest) = if let Some(rest) = key.strip_prefix("unet.") {
        (LoraTarget::Unet, rest)
    } else if let Some(rest) = key.strip_prefix("text_encoder.") {
        (LoraTarget::TextEncoder, rest)
    } else {
        (LoraTarget::Unet, key)
    };

    for (suffix, part) in [
        (".lora_A.weight", Part::Down),
        (".lora_B.weight", Part::Up),
        (".lora.down.weight", Part::Down),
        (".lora.up.weight", Part::Up),
        (".lora_down.weight", Part::Down),
        (".lora_up.weight", Part::Up),
        (".alpha", Part::Alpha),
    ] {
        if let Some(module) = rest.strip_suffix(suffix) {
            return Some((target, ModulePath::Dotted(module.to_string()), part));
        }
    }

    // attn1.processor.to_q_lora.down.weight -> attn1.to_q
    for (suffix, part) in [("_lora.down.weight", Part::Down), ("_lora.up.weight", Part::Up)] {
        if let Some(module) = rest.strip_suffix(suffix) {
            let (block, projection) = module.split_once(".processor.")?;
            let projection = if projection == "to_out" {
                "to_out.0"
            } else {
                projection
            };
            return Some((
                target,
                ModulePath::Dotted(format!("{block}.{projection}")),
                part,
            ));
        }
    }

    None
}
