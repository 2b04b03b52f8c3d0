pub mod config;
mod types;

#[cfg(feature = "tch-backend")]
mod host;
#[cfg(feature = "tch-backend")]
pub mod llama;
#[cfg(feature = "tch-backend")]
pub mod loader;
#[cfg(feature = "tch-backend")]
pub mod sampling;

#[cfg(feature = "tch-backend")]
pub use host::ModelHost;
pub use types::{
    DEFAULT_MAX_LENGTH, DEFAULT_RANDOMNESS, GenerateRequest, GenerateResponse, GenerationParams,
    HealthResponse,
};
