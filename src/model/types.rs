use serde::{Deserialize, Serialize};

use crate::{device::DeviceKind, error::ServiceError};

pub const DEFAULT_MAX_LENGTH: usize = 1024;
pub const DEFAULT_RANDOMNESS: f64 = 0.7;

/// Field types are strict: `max_length` must be a JSON integer (`50.0` is
/// rejected) and `use_openai` a JSON boolean (`"true"` is rejected). Both
/// surface as 422.
#[derive(Debug, Clone, Deserialize)]
pub struct GenerateRequest {
    pub prompt: String,
    #[serde(default = "default_max_length")]
    pub max_length: usize,
    /// Sampling temperature. Not range-checked.
    #[serde(default = "default_randomness")]
    pub randomness: f64,
    #[serde(default)]
    pub use_openai: bool,
}

fn default_max_length() -> usize {
    DEFAULT_MAX_LENGTH
}

fn default_randomness() -> f64 {
    DEFAULT_RANDOMNESS
}

impl GenerateRequest {
    pub fn params(&self) -> Result<GenerationParams, ServiceError> {
        if self.max_length == 0 {
            return Err(ServiceError::InvalidRequest(
                "max_length must be a positive integer".into(),
            ));
        }
        Ok(GenerationParams {
            prompt: self.prompt.clone(),
            max_length: self.max_length,
            randomness: self.randomness,
        })
    }
}

/// What a backend receives. The local model treats `max_length` as a bound on
/// prompt plus completion; the remote API treats it as a completion budget.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    pub prompt: String,
    pub max_length: usize,
    pub randomness: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateResponse {
    pub response: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub device: DeviceKind,
    pub platform: String,
    pub python_version: &'static str,
    pub torch_version: &'static str,
    pub openai_available: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn omitted_fields_take_defaults() {
        let request: GenerateRequest =
            serde_json::from_str(r#"{"prompt": "def add(a, b):"}"#).unwrap();
        assert_eq!(request.max_length, 1024);
        assert_eq!(request.randomness, 0.7);
        assert!(!request.use_openai);
    }

    #[test]
    fn zero_max_length_is_a_client_error() {
        let request: GenerateRequest =
            serde_json::from_str(r#"{"prompt": "x", "max_length": 0}"#).unwrap();
        assert!(matches!(request.params(), Err(ServiceError::InvalidRequest(_))));
    }

    #[test]
    fn randomness_is_passed_through_unchecked() {
        let request: GenerateRequest =
            serde_json::from_str(r#"{"prompt": "x", "randomness": 3.5}"#).unwrap();
        assert_eq!(request.params().unwrap().randomness, 3.5);
    }

    #[test]
    fn negative_max_length_does_not_deserialize() {
        let parsed = serde_json::from_str::<GenerateRequest>(r#"{"prompt": "x", "max_length": -5}"#);
        assert!(parsed.is_err());
    }
}
