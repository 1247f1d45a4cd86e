//! Merging of PEFT-style LoRA adapters into base weights.
//!
//! An adapter directory holds `adapter_config.json` and
//! `adapter_model.safetensors`. Every adapted linear layer contributes a pair
//! `<module>.lora_A.weight` (r x in) and `<module>.lora_B.weight` (out x r);
//! merging replaces `<module>.weight` with `W + scale * B A`.

use candle_core::{DType, Device, Tensor};
use serde::Deserialize;
use std::{
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf},
};

pub const ADAPTER_CONFIG_FILE: &str = "adapter_config.json";
pub const ADAPTER_WEIGHTS_FILE: &str = "adapter_model.safetensors";

const PEFT_PREFIX: &str = "base_model.model.";

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid adapter config: {0}")]
    Config(#[from] serde_json::Error),
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
    #[error("adapter rank must be positive")]
    ZeroRank,
    #[error("adapter module {0} is missing its {1} weight")]
    IncompletePair(String, &'static str),
    #[error("adapter module {0} has no matching base weight")]
    MissingBaseWeight(String),
}

/// The subset of `adapter_config.json` needed for merging.
#[derive(Debug, Clone, Deserialize)]
pub struct AdapterConfig {
    pub r: usize,
    pub lora_alpha: f64,
    #[serde(default)]
    pub use_rslora: bool,
    #[serde(default)]
    pub fan_in_fan_out: bool,
}

impl AdapterConfig {
    /// Multiplier applied to `B A` before it is added to the base weight.
    pub fn scale(&self) -> f64 {
        if self.use_rslora {
            self.lora_alpha / (self.r as f64).sqrt()
        } else {
            self.lora_alpha / self.r as f64
        }
    }
}

struct LoraPair {
    a: Tensor,
    b: Tensor,
}

/// A loaded adapter, ready to be merged into a base checkpoint.
pub struct LoraAdapter {
    config: AdapterConfig,
    pairs: BTreeMap<String, LoraPair>,
}

impl LoraAdapter {
    /// Loads an adapter from a PEFT output directory.
    pub fn load(dir: &Path) -> Result<Self, AdapterError> {
        let config_path = dir.join(ADAPTER_CONFIG_FILE);
        let raw = std::fs::read_to_string(&config_path).map_err(|source| AdapterError::Io {
            path: config_path,
            source,
        })?;
        let config: AdapterConfig = serde_json::from_str(&raw)?;

        let tensors = candle_core::safetensors::load(dir.join(ADAPTER_WEIGHTS_FILE), &Device::Cpu)?;
        Self::from_tensors(config, tensors)
    }

    /// Groups raw adapter tensors into A/B pairs keyed by base module name.
    pub fn from_tensors(
        config: AdapterConfig,
        tensors: HashMap<String, Tensor>,
    ) -> Result<Self, AdapterError> {
        if config.r == 0 {
            return Err(AdapterError::ZeroRank);
        }

        let mut halves: BTreeMap<String, (Option<Tensor>, Option<Tensor>)> = BTreeMap::new();
        for (key, tensor) in tensors {
            let Some((module, half)) = split_adapter_key(&key) else {
                log::debug!("Ignoring non-LoRA adapter tensor {key}");
                continue;
            };
            let entry = halves.entry(module).or_default();
            match half {
                Half::A => entry.0 = Some(tensor),
                Half::B => entry.1 = Some(tensor),
            }
        }

        let mut pairs = BTreeMap::new();
        for (module, (a, b)) in halves {
            let a = a.ok_or_else(|| AdapterError::IncompletePair(module.clone(), "lora_A"))?;
            let b = b.ok_or_else(|| AdapterError::IncompletePair(module.clone(), "lora_B"))?;
            pairs.insert(module, LoraPair { a, b });
        }

        Ok(Self { config, pairs })
    }

    /// Number of adapted modules.
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Merges every pair into `weights` in place and returns the number of
    /// weights that were updated.
    pub fn merge_into(&self, weights: &mut HashMap<String, Tensor>) -> Result<usize, AdapterError> {
        let scale = self.config.scale();

        for (module, pair) in &self.pairs {
            let key = format!("{module}.weight");
            let base = weights
                .get(&key)
                .ok_or_else(|| AdapterError::MissingBaseWeight(module.clone()))?;

            let a = pair.a.to_dtype(DType::F32)?;
            let b = pair.b.to_dtype(DType::F32)?;
            let mut delta = (b.matmul(&a)? * scale)?;
            if self.config.fan_in_fan_out {
                delta = delta.t()?;
            }

            let merged = (base.to_dtype(DType::F32)? + delta)?.to_dtype(base.dtype())?;
            log::debug!("Merged LoRA delta into {key}");
            weights.insert(key, merged);
        }

        Ok(self.pairs.len())
    }
}

#[derive(Debug, PartialEq)]
enum Half {
    A,
    B,
}

/// Maps `base_model.model.<module>.lora_A[.default].weight` to `(<module>, A)`.
fn split_adapter_key(key: &str) -> Option<(String, Half)> {
    let key = key.strip_prefix(PEFT_PREFIX).unwrap_or(key);
    let key = key.strip_suffix(".weight")?;
    let key = key.strip_suffix(".default").unwrap_or(key);

    if let Some(module) = key.strip_suffix(".lora_A") {
        Some((module.to_string(), Half::A))
    } else {
        key.strip_suffix(".lora_B")
            .map(|module| (module.to_string(), Half::B))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(r: usize, alpha: f64) -> AdapterConfig {
        AdapterConfig {
            r,
            lora_alpha: alpha,
            use_rslora: false,
            fan_in_fan_out: false,
        }
    }

    fn tensor(data: &[f32], shape: (usize, usize)) -> Tensor {
        Tensor::from_slice(data, shape, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_split_adapter_key() {
        assert_eq!(
            split_adapter_key("base_model.model.text_decoder.bert.layer.0.query.lora_A.weight"),
            Some(("text_decoder.bert.layer.0.query".to_string(), Half::A))
        );
        assert_eq!(
            split_adapter_key("base_model.model.vision_model.qkv.lora_B.default.weight"),
            Some(("vision_model.qkv".to_string(), Half::B))
        );
        assert_eq!(split_adapter_key("base_model.model.vision_model.qkv.bias"), None);
    }

    #[test]
    fn test_scale() {
        assert_eq!(config(8, 16.0).scale(), 2.0);
        let rs = AdapterConfig {
            use_rslora: true,
            ..config(4, 8.0)
        };
        assert_eq!(rs.scale(), 4.0);
    }

    #[test]
    fn test_merge_adds_scaled_delta() {
        let mut adapter_tensors = HashMap::new();
        // rank 1: A is 1x2, B is 2x1, so B A is 2x2
        adapter_tensors.insert(
            "base_model.model.proj.lora_A.weight".to_string(),
            tensor(&[1.0, 2.0], (1, 2)),
        );
        adapter_tensors.insert(
            "base_model.model.proj.lora_B.weight".to_string(),
            tensor(&[3.0, 4.0], (2, 1)),
        );
        let adapter = LoraAdapter::from_tensors(config(1, 2.0), adapter_tensors).unwrap();
        assert_eq!(adapter.len(), 1);

        let mut weights = HashMap::new();
        weights.insert("proj.weight".to_string(), tensor(&[1.0, 1.0, 1.0, 1.0], (2, 2)));
        weights.insert("proj.bias".to_string(), tensor(&[0.0, 0.0], (1, 2)));

        assert_eq!(adapter.merge_into(&mut weights).unwrap(), 1);

        let merged = weights["proj.weight"].to_vec2::<f32>().unwrap();
        // 1 + 2 * [[3, 6], [4, 8]]
        assert_eq!(merged, vec![vec![7.0, 13.0], vec![9.0, 17.0]]);
        let bias = weights["proj.bias"].to_vec2::<f32>().unwrap();
        assert_eq!(bias, vec![vec![0.0, 0.0]]);
    }

    #[test]
    fn test_missing_base_weight_is_rejected() {
        let mut adapter_tensors = HashMap::new();
        adapter_tensors.insert("ghost.lora_A.weight".to_string(), tensor(&[1.0], (1, 1)));
        adapter_tensors.insert("ghost.lora_B.weight".to_string(), tensor(&[1.0], (1, 1)));
        let adapter = LoraAdapter::from_tensors(config(1, 1.0), adapter_tensors).unwrap();

        let mut weights = HashMap::new();
        assert!(matches!(
            adapter.merge_into(&mut weights),
            Err(AdapterError::MissingBaseWeight(ref m)) if m == "ghost"
        ));
    }

    #[test]
    fn test_incomplete_pair_is_rejected() {
        let mut adapter_tensors = HashMap::new();
        adapter_tensors.insert("proj.lora_A.weight".to_string(), tensor(&[1.0], (1, 1)));
        assert!(matches!(
            LoraAdapter::from_tensors(config(1, 1.0), adapter_tensors),
            Err(AdapterError::IncompletePair(_, "lora_B"))
        ));
    }

    #[test]
    fn test_zero_rank_is_rejected() {
        assert!(matches!(
            LoraAdapter::from_tensors(config(0, 1.0), HashMap::new()),
            Err(AdapterError::ZeroRank)
        ));
    }

    #[test]
    fn test_config_parses_peft_json() {
        let raw = r#"{
            "r": 8,
            "lora_alpha": 32,
            "target_modules": ["query", "value"],
            "peft_type": "LORA"
        }"#;
        let config: AdapterConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.r, 8);
        assert_eq!(config.scale(), 4.0);
        assert!(!config.fan_in_fan_out);
    }
}
