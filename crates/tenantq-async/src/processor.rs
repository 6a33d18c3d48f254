use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use tenantq_core::Message;

use crate::error::ProcessError;

/// Business logic applied to each dispatched message.
///
/// Implementations may take arbitrary time but must return promptly once
/// `cancel` fires, preferably with [`ProcessError::Cancelled`].
#[async_trait]
pub trait MessageProcessor: Send + Sync + 'static {
    async fn process(
        &self,
        message: &Message,
        cancel: &CancellationToken,
    ) -> Result<(), ProcessError>;
}
