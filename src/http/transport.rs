//! Transport seam.

use async_trait::async_trait;

use super::descriptor::RequestDescriptor;
use super::error::PipelineError;
use super::response::ResponseEnvelope;

/// Sends a fully prepared request.
///
/// Implementations return `Ok` for every response that arrived, whatever its
/// status; status validation happens in the pipeline. `Err` means no response
/// was received and should be [`PipelineError::Network`].
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Send `request` and decode the reply according to its response type.
    async fn send(&self, request: RequestDescriptor) -> Result<ResponseEnvelope, PipelineError>;
}
