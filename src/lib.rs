pub mod backend;
pub mod config;
pub mod device;
pub mod error;
pub mod model;
pub mod remote;
pub mod server;

pub use backend::CompletionBackend;
pub use config::AppConfig;
pub use device::{DeviceKind, select_device};
pub use error::ServiceError;
#[cfg(feature = "tch-backend")]
pub use model::ModelHost;
pub use model::{GenerateRequest, GenerateResponse, GenerationParams};
pub use remote::OpenAiClient;
pub use server::{AppState, build_router};
