use std::sync::Arc;

use crate::pipeline::PipelineCtx;

/// Shared application state for the upload server. The pipeline context
/// already carries every dependency handle, so the HTTP layer borrows
/// the same one the workers use.
pub struct AppState {
    pub ctx: Arc<PipelineCtx>,
    /// Bearer secret gating the internal finalize hook.
    pub internal_secret: Vec<u8>,
    pub metrics_token: Option<String>,
}
