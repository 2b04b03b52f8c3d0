use std::{
    collections::{BTreeSet, HashSet},
    fs,
    path::{Path, PathBuf},
};

use hf_hub::{Repo, RepoType, api::sync::Api};
use serde::Deserialize;
use tch::{Kind, Tensor, nn::VarStore, no_grad};
use tokenizers::Tokenizer;
use tracing::{debug, info};

use crate::{
    config::AppConfig,
    device::DeviceKind,
    error::ServiceError,
    model::{config::ModelConfig, llama::CausalLm},
};

const SINGLE_WEIGHTS_FILE: &str = "model.safetensors";
const WEIGHTS_INDEX_FILE: &str = "model.safetensors.index.json";

/// End-of-sequence spellings tried when `config.json` names none.
const FALLBACK_EOS_TOKENS: [&str; 3] = ["</s>", "<|EOT|>", "<|endoftext|>"];

/// Local paths of everything needed to build the model host.
#[derive(Debug)]
pub struct ModelArtifacts {
    pub config_path: PathBuf,
    pub tokenizer_path: PathBuf,
    pub weight_paths: Vec<PathBuf>,
}

#[derive(Deserialize)]
struct WeightIndex {
    weight_map: std::collections::HashMap<String, String>,
}

impl ModelArtifacts {
    /// `MODEL_ID` may name an existing directory; anything else is treated
    /// as a hub repository id and fetched into the local hub cache.
    pub fn resolve(config: &AppConfig) -> Result<Self, ServiceError> {
        let local = Path::new(&config.model_id);
        if local.is_dir() {
            info!(path = %local.display(), "using local model directory");
            return Self::from_dir(local);
        }
        if config.model_id.starts_with(['/', '.']) {
            return Err(ServiceError::ModelLoad(format!(
                "model directory not found: {}",
                local.display()
            )));
        }
        Self::from_hub(&config.model_id, &config.revision)
    }

    pub fn from_dir(dir: &Path) -> Result<Self, ServiceError> {
        let require = |name: &str| {
            let path = dir.join(name);
            if path.exists() {
                Ok(path)
            } else {
                Err(ServiceError::ModelLoad(format!(
                    "model artifact missing: {}",
                    path.display()
                )))
            }
        };

        let config_path = require("config.json")?;
        let tokenizer_path = require("tokenizer.json")?;
        let weight_paths = if dir.join(WEIGHTS_INDEX_FILE).exists() {
            shard_names(&dir.join(WEIGHTS_INDEX_FILE))?
                .iter()
                .map(|name| require(name.as_str()))
                .collect::<Result<Vec<_>, _>>()?
        } else {
            vec![require(SINGLE_WEIGHTS_FILE)?]
        };

        Ok(Self {
            config_path,
            tokenizer_path,
            weight_paths,
        })
    }

    fn from_hub(model_id: &str, revision: &str) -> Result<Self, ServiceError> {
        let hub_err = |e: hf_hub::api::sync::ApiError| {
            ServiceError::ModelLoad(format!("{model_id}@{revision}: {e}"))
        };

        let api = Api::new().map_err(hub_err)?;
        let repo = api.repo(Repo::with_revision(
            model_id.to_string(),
            RepoType::Model,
            revision.to_string(),
        ));

        info!(model_id, revision, "fetching model artifacts");
        let config_path = repo.get("config.json").map_err(hub_err)?;
        let tokenizer_path = repo.get("tokenizer.json").map_err(hub_err)?;
        let weight_paths = match repo.get(WEIGHTS_INDEX_FILE) {
            Ok(index_path) => shard_names(&index_path)?
                .iter()
                .map(|name| repo.get(name).map_err(hub_err))
                .collect::<Result<Vec<_>, _>>()?,
            Err(_) => vec![repo.get(SINGLE_WEIGHTS_FILE).map_err(hub_err)?],
        };

        Ok(Self {
            config_path,
            tokenizer_path,
            weight_paths,
        })
    }

    pub fn load_tokenizer(&self) -> Result<Tokenizer, ServiceError> {
        Tokenizer::from_file(self.tokenizer_path.as_path())
            .map_err(|e| ServiceError::ModelLoad(format!("tokenizer: {e}")))
    }

    pub fn load_config(&self) -> Result<ModelConfig, ServiceError> {
        let raw =
            fs::read_to_string(&self.config_path).map_err(|e| load_error(&self.config_path, e))?;
        let config: ModelConfig = serde_json::from_str(&raw)
            .map_err(|e| ServiceError::ModelLoad(format!("invalid config.json: {e}")))?;
        if !config.is_llama_family() {
            return Err(ServiceError::ModelLoad(format!(
                "unsupported model_type {:?}",
                config.model_type
            )));
        }
        Ok(config)
    }

    /// Builds the model on the CPU, loads every weight by name, then moves the
    /// whole store to `device`.
    pub fn load_model(
        &self,
        config: &ModelConfig,
        device: DeviceKind,
    ) -> Result<(VarStore, CausalLm), ServiceError> {
        let (mut vs, mut model) = self.load_weights(config, device.weight_kind())?;
        vs.set_device(device.to_tch());
        model.move_rotary(device.to_tch());
        Ok((vs, model))
    }

    /// Variables are cast to `kind` before any checkpoint tensor is read, so
    /// the store never holds a full-precision copy next to the shards.
    fn load_weights(
        &self,
        config: &ModelConfig,
        kind: Kind,
    ) -> Result<(VarStore, CausalLm), ServiceError> {
        let mut vs = VarStore::new(tch::Device::Cpu);
        let model = CausalLm::new(&vs.root(), config);
        vs.set_kind(kind);

        let mut variables = vs.variables();
        let mut missing: BTreeSet<String> = variables.keys().cloned().collect();
        for path in &self.weight_paths {
            debug!(path = %path.display(), "reading weights");
            let tensors = Tensor::read_safetensors(path).map_err(|e| load_error(path, e))?;
            for (name, tensor) in tensors {
                if let Some(var) = variables.get_mut(&name) {
                    no_grad(|| var.f_copy_(&tensor))
                        .map_err(|e| load_error(path, format!("{name}: {e}")))?;
                    missing.remove(&name);
                }
            }
        }
        if !missing.is_empty() {
            let sample: Vec<_> = missing.iter().take(5).cloned().collect();
            return Err(ServiceError::ModelLoad(format!(
                "{} weights missing from checkpoint, e.g. {sample:?}",
                missing.len()
            )));
        }

        Ok((vs, model))
    }
}

fn load_error(path: &Path, err: impl std::fmt::Display) -> ServiceError {
    ServiceError::ModelLoad(format!("{}: {err}", path.display()))
}

fn shard_names(index_path: &Path) -> Result<Vec<String>, ServiceError> {
    let raw = fs::read_to_string(index_path).map_err(|e| load_error(index_path, e))?;
    let index: WeightIndex = serde_json::from_str(&raw)
        .map_err(|e| ServiceError::ModelLoad(format!("invalid weight index: {e}")))?;
    let shards: BTreeSet<String> = index.weight_map.into_values().collect();
    Ok(shards.into_iter().collect())
}

/// End-of-sequence ids from the model config, else from well-known tokenizer
/// spellings.
pub fn eos_token_ids(config: &ModelConfig, tokenizer: &Tokenizer) -> HashSet<i64> {
    let from_config: HashSet<i64> = config.eos_token_ids().into_iter().map(i64::from).collect();
    if !from_config.is_empty() {
        return from_config;
    }
    FALLBACK_EOS_TOKENS
        .iter()
        .filter_map(|token| tokenizer.token_to_id(token))
        .map(i64::from)
        .collect()
}
