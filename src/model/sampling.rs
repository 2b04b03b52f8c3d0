use tch::{Kind, Tensor};

/// Picks the next token from last-position logits.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Sampler {
    Greedy,
    Temperature(f64),
}

impl Sampler {
    /// Non-positive (or NaN) randomness means deterministic decoding.
    pub fn from_randomness(randomness: f64) -> Self {
        if randomness.is_nan() || randomness <= 0.0 {
            Sampler::Greedy
        } else {
            Sampler::Temperature(randomness)
        }
    }

    pub fn sample(&self, logits: &Tensor) -> i64 {
        match *self {
            Sampler::Greedy => logits.argmax(-1, false).int64_value(&[]),
            Sampler::Temperature(temperature) => {
                let probs = (logits.to_kind(Kind::Float) / temperature).softmax(-1, Kind::Float);
                probs.multinomial(1, false).int64_value(&[0])
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_and_nan_are_greedy() {
        assert_eq!(Sampler::from_randomness(0.0), Sampler::Greedy);
        assert_eq!(Sampler::from_randomness(-1.0), Sampler::Greedy);
        assert_eq!(Sampler::from_randomness(f64::NAN), Sampler::Greedy);
        assert_eq!(Sampler::from_randomness(0.7), Sampler::Temperature(0.7));
    }

    #[test]
    fn greedy_takes_the_argmax() {
        let logits = Tensor::from_slice(&[0.1f32, 3.0, -2.0, 1.5]);
        assert_eq!(Sampler::Greedy.sample(&logits), 1);
    }

    #[test]
    fn temperature_sampling_stays_in_vocabulary() {
        let logits = Tensor::from_slice(&[0.0f32, 0.0, 0.0, 0.0, 0.0]);
        let sampler = Sampler::Temperature(0.7);
        for _ in 0..20 {
            let token = sampler.sample(&logits);
            assert!((0..5).contains(&token));
        }
    }

    #[test]
    fn low_temperature_concentrates_on_the_peak() {
        let logits = Tensor::from_slice(&[0.0f32, 20.0, 0.0]);
        let sampler = Sampler::Temperature(0.05);
        for _ in 0..10 {
            assert_eq!(sampler.sample(&logits), 1);
        }
    }
}
