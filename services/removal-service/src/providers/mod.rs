pub mod error;
pub mod local;
pub mod remote;

use async_trait::async_trait;
use bytes::Bytes;

pub use error::{ProviderError, ProviderErrorKind};
pub use local::LocalRemover;
pub use remote::RemoteRemover;

/// Turns an image into the same image without its background.
///
/// Implementations own their timeouts; callers wait for a definite outcome.
#[async_trait]
pub trait BackgroundRemover: Send + Sync {
    fn name(&self) -> &'static str;

    async fn process(&self, image: Bytes) -> Result<Bytes, ProviderError>;
}
