use std::{
    any::Any,
    collections::HashSet,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tch::{Tensor, nn::VarStore, no_grad};
use tokenizers::Tokenizer;
use tokio::task;
use tracing::{debug, info};

use crate::{
    backend::CompletionBackend,
    config::AppConfig,
    device::{DeviceKind, select_device},
    error::ServiceError,
    model::{
        GenerationParams,
        llama::{CausalLm, KvCache},
        loader::{ModelArtifacts, eos_token_ids},
        sampling::Sampler,
    },
};

/// Tokenizer and causal LM, loaded once and shared read-only for the life of
/// the process.
#[derive(Clone)]
pub struct ModelHost {
    inner: Arc<HostInner>,
}

struct HostInner {
    model_id: String,
    device: DeviceKind,
    tokenizer: Tokenizer,
    eos_ids: HashSet<i64>,
    max_positions: usize,
    weights: Mutex<LoadedWeights>,
}

struct LoadedWeights {
    _store: VarStore,
    model: CausalLm,
}

impl ModelHost {
    /// Blocks until the weights are resident on the selected device. Any
    /// error here must abort startup.
    pub fn initialize(config: &AppConfig) -> Result<Self, ServiceError> {
        let device = select_device();
        info!(%device, model_id = %config.model_id, "initialising model host");

        let artifacts = ModelArtifacts::resolve(config)?;
        Self::from_artifacts(&config.model_id, &artifacts, device)
    }

    pub fn from_artifacts(
        model_id: &str,
        artifacts: &ModelArtifacts,
        device: DeviceKind,
    ) -> Result<Self, ServiceError> {
        let tokenizer = artifacts.load_tokenizer()?;
        let model_config = artifacts.load_config()?;
        info!(
            layers = model_config.num_hidden_layers,
            hidden = model_config.hidden_size,
            shards = artifacts.weight_paths.len(),
            "loading weights"
        );
        let (store, model) = artifacts.load_model(&model_config, device)?;
        let eos_ids = eos_token_ids(&model_config, &tokenizer);
        info!(%device, ?eos_ids, "model ready");

        Ok(Self {
            inner: Arc::new(HostInner {
                model_id: model_id.to_string(),
                device,
                tokenizer,
                eos_ids,
                max_positions: model_config.max_position_embeddings,
                weights: Mutex::new(LoadedWeights {
                    _store: store,
                    model,
                }),
            }),
        })
    }

    pub fn device(&self) -> DeviceKind {
        self.inner.device
    }

    pub fn model_id(&self) -> &str {
        &self.inner.model_id
    }

    /// Runs to completion on the calling thread. `max_length` bounds the whole
    /// sequence, prompt included; the decoded text therefore starts with the
    /// prompt.
    pub fn generate(
        &self,
        prompt: &str,
        max_length: usize,
        randomness: f64,
    ) -> Result<String, ServiceError> {
        let inner = &self.inner;
        let encoding = inner
            .tokenizer
            .encode(prompt, true)
            .map_err(|e| ServiceError::Tokenizer(e.to_string()))?;
        let mut tokens: Vec<i64> = encoding.get_ids().iter().map(|&id| i64::from(id)).collect();

        let max_length = max_length.min(inner.max_positions);
        let sampler = Sampler::from_randomness(randomness);
        let device = inner.device.to_tch();
        let prompt_len = tokens.len();

        no_grad(|| {
            let weights = inner.weights.lock();
            let mut cache = KvCache::new(weights.model.num_layers());
            while !tokens.is_empty() && tokens.len() < max_length {
                let pending = &tokens[cache.seq_len()..];
                let input = Tensor::from_slice(pending)
                    .view([1, pending.len() as i64])
                    .to_device(device);
                let logits = weights.model.forward(&input, &mut cache);
                let next = sampler.sample(&logits);
                tokens.push(next);
                if inner.eos_ids.contains(&next) {
                    break;
                }
            }
        });
        debug!(prompt_len, generated = tokens.len() - prompt_len, "generation finished");

        let ids: Vec<u32> = tokens.iter().map(|&id| id as u32).collect();
        inner
            .tokenizer
            .decode(&ids, true)
            .map_err(|e| ServiceError::Tokenizer(e.to_string()))
    }
}

#[async_trait]
impl CompletionBackend for ModelHost {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn complete(&self, params: GenerationParams) -> Result<String, ServiceError> {
        let host = self.clone();
        task::spawn_blocking(move || {
            // libtorch reports failures by panicking; keep them inside the request.
            panic::catch_unwind(AssertUnwindSafe(|| {
                host.generate(&params.prompt, params.max_length, params.randomness)
            }))
            .unwrap_or_else(|payload| Err(ServiceError::Inference(panic_message(payload))))
        })
        .await
        .map_err(|err| ServiceError::Inference(format!("inference task failed: {err}")))?
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else {
        "generation panicked".to_string()
    }
}
