use async_trait::async_trait;

use crate::{error::ServiceError, model::GenerationParams};

/// Something that turns a prompt into text. The local model host and the
/// remote chat-completion client both implement it, and the router only ever
/// sees this trait.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn complete(&self, params: GenerationParams) -> Result<String, ServiceError>;
}
