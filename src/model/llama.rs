use tch::{Device, Kind, Tensor, nn, nn::Module};

use crate::model::config::ModelConfig;

/// Per-call key/value cache. Lives only for a single generation so the model
/// itself stays read-only.
pub struct KvCache {
    layers: Vec<Option<(Tensor, Tensor)>>,
    seq_len: usize,
}

impl KvCache {
    pub fn new(num_layers: usize) -> Self {
        Self {
            layers: (0..num_layers).map(|_| None).collect(),
            seq_len: 0,
        }
    }

    pub fn seq_len(&self) -> usize {
        self.seq_len
    }
}

#[derive(Debug)]
struct RmsNorm {
    weight: Tensor,
    eps: f64,
}

impl RmsNorm {
    fn new(vs: nn::Path, size: i64, eps: f64) -> Self {
        let weight = vs.var("weight", &[size], nn::Init::Const(1.0));
        Self { weight, eps }
    }
}

impl Module for RmsNorm {
    fn forward(&self, xs: &Tensor) -> Tensor {
        let kind = xs.kind();
        let xs = xs.to_kind(Kind::Float);
        let variance = (&xs * &xs).mean_dim(-1, true, Kind::Float);
        let normed = xs * (variance + self.eps).rsqrt();
        normed.to_kind(kind) * &self.weight
    }
}

#[derive(Debug)]
struct Rotary {
    cos: Tensor,
    sin: Tensor,
}

impl Rotary {
    fn new(config: &ModelConfig, device: Device) -> Self {
        let head_dim = config.head_dim();
        let inv_freq: Vec<f32> = (0..head_dim)
            .step_by(2)
            .map(|i| (1.0 / config.rope_theta.powf(i as f64 / head_dim as f64)) as f32)
            .collect();
        let inv_freq = Tensor::from_slice(&inv_freq).to_device(device);
        let positions = Tensor::arange(config.max_position_embeddings as i64, (Kind::Float, device))
            / config.rope_position_scale();
        let freqs = positions.unsqueeze(1).matmul(&inv_freq.unsqueeze(0));
        let emb = Tensor::cat(&[&freqs, &freqs], -1);
        Self {
            cos: emb.cos(),
            sin: emb.sin(),
        }
    }

    /// `xs` is `[batch, heads, seq, head_dim]`, starting at absolute position
    /// `offset`.
    fn apply(&self, xs: &Tensor, offset: i64) -> Tensor {
        let seq_len = xs.size()[2];
        let cos = self.cos.narrow(0, offset, seq_len).to_kind(xs.kind());
        let sin = self.sin.narrow(0, offset, seq_len).to_kind(xs.kind());
        xs * cos + rotate_half(xs) * sin
    }
}

fn rotate_half(xs: &Tensor) -> Tensor {
    let half = xs.size()[3] / 2;
    let x1 = xs.narrow(-1, 0, half);
    let x2 = xs.narrow(-1, half, half);
    Tensor::cat(&[&x2.neg(), &x1], -1)
}

fn linear(vs: nn::Path, in_dim: usize, out_dim: usize) -> nn::Linear {
    let config = nn::LinearConfig {
        bias: false,
        ..Default::default()
    };
    nn::linear(vs, in_dim as i64, out_dim as i64, config)
}

#[derive(Debug)]
struct Attention {
    q_proj: nn::Linear,
    k_proj: nn::Linear,
    v_proj: nn::Linear,
    o_proj: nn::Linear,
    num_heads: i64,
    num_kv_heads: i64,
    head_dim: i64,
}

impl Attention {
    fn new(vs: nn::Path, config: &ModelConfig) -> Self {
        let head_dim = config.head_dim();
        let kv_dim = config.num_kv_heads() * head_dim;
        Self {
            q_proj: linear(&vs / "q_proj", config.hidden_size, config.hidden_size),
            k_proj: linear(&vs / "k_proj", config.hidden_size, kv_dim),
            v_proj: linear(&vs / "v_proj", config.hidden_size, kv_dim),
            o_proj: linear(&vs / "o_proj", config.hidden_size, config.hidden_size),
            num_heads: config.num_attention_heads as i64,
            num_kv_heads: config.num_kv_heads() as i64,
            head_dim: head_dim as i64,
        }
    }

    fn forward(
        &self,
        xs: &Tensor,
        rotary: &Rotary,
        cache: &mut Option<(Tensor, Tensor)>,
        offset: i64,
    ) -> Tensor {
        let size = xs.size();
        let (batch, seq_len, hidden) = (size[0], size[1], size[2]);
        let q = xs
            .apply(&self.q_proj)
            .view([batch, seq_len, self.num_heads, self.head_dim])
            .transpose(1, 2);
        let k = xs
            .apply(&self.k_proj)
            .view([batch, seq_len, self.num_kv_heads, self.head_dim])
            .transpose(1, 2);
        let v = xs
            .apply(&self.v_proj)
            .view([batch, seq_len, self.num_kv_heads, self.head_dim])
            .transpose(1, 2);

        let q = rotary.apply(&q, offset);
        let k = rotary.apply(&k, offset);

        let (k, v) = match cache.take() {
            Some((past_k, past_v)) => (
                Tensor::cat(&[&past_k, &k], 2),
                Tensor::cat(&[&past_v, &v], 2),
            ),
            None => (k, v),
        };
        *cache = Some((k.shallow_clone(), v.shallow_clone()));

        let k = self.repeat_kv(k);
        let v = self.repeat_kv(v);
        let total_len = k.size()[2];

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let mut scores = q.matmul(&k.transpose(-2, -1)) * scale;
        if seq_len > 1 {
            // Query i sits at absolute position offset + i and may see keys up to it.
            let mask = Tensor::ones([seq_len, total_len], (Kind::Bool, xs.device()))
                .triu(offset + 1);
            scores = scores.masked_fill(&mask, f64::NEG_INFINITY);
        }
        let probs = scores.softmax(-1, Kind::Float).to_kind(v.kind());

        probs
            .matmul(&v)
            .transpose(1, 2)
            .contiguous()
            .view([batch, seq_len, hidden])
            .apply(&self.o_proj)
    }

    fn repeat_kv(&self, xs: Tensor) -> Tensor {
        let n_rep = self.num_heads / self.num_kv_heads;
        if n_rep == 1 {
            return xs;
        }
        let size = xs.size();
        let (batch, kv_heads, seq_len, head_dim) = (size[0], size[1], size[2], size[3]);
        xs.unsqueeze(2)
            .expand([batch, kv_heads, n_rep, seq_len, head_dim], false)
            .reshape([batch, kv_heads * n_rep, seq_len, head_dim])
    }
}

#[derive(Debug)]
struct Mlp {
    gate_proj: nn::Linear,
    up_proj: nn::Linear,
    down_proj: nn::Linear,
}

impl Mlp {
    fn new(vs: nn::Path, config: &ModelConfig) -> Self {
        Self {
            gate_proj: linear(&vs / "gate_proj", config.hidden_size, config.intermediate_size),
            up_proj: linear(&vs / "up_proj", config.hidden_size, config.intermediate_size),
            down_proj: linear(&vs / "down_proj", config.intermediate_size, config.hidden_size),
        }
    }
}

impl Module for Mlp {
    fn forward(&self, xs: &Tensor) -> Tensor {
        let gate = xs.apply(&self.gate_proj).silu();
        (gate * xs.apply(&self.up_proj)).apply(&self.down_proj)
    }
}

#[derive(Debug)]
struct DecoderLayer {
    input_layernorm: RmsNorm,
    self_attn: Attention,
    post_attention_layernorm: RmsNorm,
    mlp: Mlp,
}

impl DecoderLayer {
    fn new(vs: nn::Path, config: &ModelConfig) -> Self {
        let hidden = config.hidden_size as i64;
        Self {
            input_layernorm: RmsNorm::new(&vs / "input_layernorm", hidden, config.rms_norm_eps),
            self_attn: Attention::new(&vs / "self_attn", config),
            post_attention_layernorm: RmsNorm::new(
                &vs / "post_attention_layernorm",
                hidden,
                config.rms_norm_eps,
            ),
            mlp: Mlp::new(&vs / "mlp", config),
        }
    }

    fn forward(
        &self,
        xs: &Tensor,
        rotary: &Rotary,
        cache: &mut Option<(Tensor, Tensor)>,
        offset: i64,
    ) -> Tensor {
        let residual = xs;
        let attn = self
            .self_attn
            .forward(&xs.apply(&self.input_layernorm), rotary, cache, offset);
        let xs = residual + attn;
        let mlp = xs.apply(&self.post_attention_layernorm).apply(&self.mlp);
        xs + mlp
    }
}

/// Llama-family causal language model. Variable names follow the Hugging Face
/// checkpoint layout so safetensors weights load by name.
#[derive(Debug)]
pub struct CausalLm {
    embed_tokens: nn::Embedding,
    layers: Vec<DecoderLayer>,
    norm: RmsNorm,
    lm_head: Tensor,
    rotary: Rotary,
}

impl CausalLm {
    pub fn new(vs: &nn::Path, config: &ModelConfig) -> Self {
        let model = vs / "model";
        let embed_tokens = nn::embedding(
            &model / "embed_tokens",
            config.vocab_size as i64,
            config.hidden_size as i64,
            Default::default(),
        );
        let layers = (0..config.num_hidden_layers)
            .map(|idx| DecoderLayer::new(&model / "layers" / idx, config))
            .collect();
        let norm = RmsNorm::new(&model / "norm", config.hidden_size as i64, config.rms_norm_eps);
        let lm_head = if config.tie_word_embeddings {
            embed_tokens.ws.shallow_clone()
        } else {
            (vs / "lm_head").var(
                "weight",
                &[config.vocab_size as i64, config.hidden_size as i64],
                nn::Init::Const(0.0),
            )
        };
        // Rotary tables stay in full precision; they are cast per call.
        let rotary = Rotary::new(config, vs.device());

        Self {
            embed_tokens,
            layers,
            norm,
            lm_head,
            rotary,
        }
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Rotary tables are built on the device the var store had at
    /// construction time; call this after the store has been moved.
    pub fn move_rotary(&mut self, device: Device) {
        self.rotary.cos = self.rotary.cos.to_device(device);
        self.rotary.sin = self.rotary.sin.to_device(device);
    }

    /// Runs the tokens not yet in `cache` and returns float logits for the
    /// last position, shape `[vocab]`.
    pub fn forward(&self, input_ids: &Tensor, cache: &mut KvCache) -> Tensor {
        let offset = cache.seq_len as i64;
        let seq_len = input_ids.size()[1];

        let mut xs = input_ids.apply(&self.embed_tokens);
        for (layer, layer_cache) in self.layers.iter().zip(cache.layers.iter_mut()) {
            xs = layer.forward(&xs, &self.rotary, layer_cache, offset);
        }
        cache.seq_len += seq_len as usize;

        let last = xs.narrow(1, seq_len - 1, 1).apply(&self.norm);
        last.matmul(&self.lm_head.tr())
            .squeeze()
            .to_kind(Kind::Float)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_config() -> ModelConfig {
        serde_json::from_value(serde_json::json!({
            "model_type": "llama",
            "hidden_size": 32,
            "intermediate_size": 64,
            "num_hidden_layers": 2,
            "num_attention_heads": 4,
            "num_key_value_heads": 2,
            "vocab_size": 50,
            "max_position_embeddings": 64,
            "tie_word_embeddings": true
        }))
        .unwrap()
    }

    #[test]
    fn logits_cover_the_vocabulary() {
        let vs = nn::VarStore::new(Device::Cpu);
        let config = tiny_config();
        let model = CausalLm::new(&vs.root(), &config);
        let mut cache = KvCache::new(model.num_layers());

        let input = Tensor::from_slice(&[1i64, 5, 9]).view([1, 3]);
        let logits = tch::no_grad(|| model.forward(&input, &mut cache));

        assert_eq!(logits.size(), vec![50]);
        assert_eq!(cache.seq_len(), 3);
    }

    #[test]
    fn cached_step_matches_full_recompute() {
        let vs = nn::VarStore::new(Device::Cpu);
        let config = tiny_config();
        let model = CausalLm::new(&vs.root(), &config);

        let full = tch::no_grad(|| {
            let mut cache = KvCache::new(model.num_layers());
            model.forward(&Tensor::from_slice(&[3i64, 4, 5, 6]).view([1, 4]), &mut cache)
        });

        let incremental = tch::no_grad(|| {
            let mut cache = KvCache::new(model.num_layers());
            model.forward(&Tensor::from_slice(&[3i64, 4, 5]).view([1, 3]), &mut cache);
            model.forward(&Tensor::from_slice(&[6i64]).view([1, 1]), &mut cache)
        });

        let diff = (full - incremental).abs().max().double_value(&[]);
        assert!(diff < 1e-4, "cached logits drifted by {diff}");
    }
}
