//! Offline hold and bounded silent replay.
//!
//! While the shared connectivity flag reads offline, outgoing requests are
//! held until it clears. When a request comes back with an unavailable status
//! or no response at all, the stage marks the process offline, waits for
//! connectivity to return and replays the request through the owning
//! pipeline's top-level entry point. After [`ResilienceConfig::max_retries`]
//! replays the last outcome is handed back as-is: a response stays a
//! response, an error stays an error.
//!
//! A replay carries `ignore_response_transformation` so the inner passes of the
//! other stages skip it. The flag is restored to its previous value when the
//! replay settles, so only the caller's own pass sees the final outcome.

use std::sync::OnceLock;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::core::Deferred;
use crate::core::constants::{EXEMPT_PATHS, MAX_RETRIES, UNAVAILABLE_STATUSES};
use crate::http::descriptor::RequestDescriptor;
use crate::http::error::PipelineError;
use crate::http::interceptor::{Interceptor, PipelineHandle};
use crate::http::response::ResponseEnvelope;
use crate::state::ConnectivityMonitor;

/// Retry policy.
#[derive(Debug, Clone)]
pub struct ResilienceConfig {
    /// Replays allowed per caller-visible request.
    pub max_retries: u32,

    /// Statuses treated as "server unavailable". No response at all always is.
    pub unavailable_statuses: Vec<u16>,

    /// Paths never held or replayed.
    pub exempt_paths: Vec<String>,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            max_retries: MAX_RETRIES,
            unavailable_statuses: UNAVAILABLE_STATUSES.to_vec(),
            exempt_paths: EXEMPT_PATHS.iter().map(|p| p.to_string()).collect(),
        }
    }
}

impl ResilienceConfig {
    /// Whether `path` matches an exempt path exactly or as a trailing segment.
    pub fn is_exempt(&self, path: &str) -> bool {
        let path = path.trim_matches('/');
        self.exempt_paths.iter().any(|exempt| {
            let exempt = exempt.trim_matches('/');
            path == exempt
                || path
                    .strip_suffix(exempt)
                    .is_some_and(|head| head.ends_with('/'))
        })
    }

    /// Whether `status` means the server is unavailable. `None` is "no response".
    pub fn is_unavailable(&self, status: Option<u16>) -> bool {
        match status {
            None => true,
            Some(status) => self.unavailable_statuses.contains(&status),
        }
    }
}

/// The resilience stage. Register it innermost so it sees raw outcomes.
#[derive(Debug)]
pub struct ResilienceInterceptor {
    connectivity: ConnectivityMonitor,
    config: ResilienceConfig,
    pipeline: OnceLock<PipelineHandle>,
}

impl ResilienceInterceptor {
    /// Use `connectivity` as the shared offline flag.
    pub fn new(connectivity: ConnectivityMonitor, config: ResilienceConfig) -> Self {
        Self {
            connectivity,
            config,
            pipeline: OnceLock::new(),
        }
    }

    fn should_replay(&self, request: &RequestDescriptor, status: Option<u16>) -> bool {
        if !self.config.is_unavailable(status) || self.config.is_exempt(&request.path()) {
            return false;
        }
        if request.retry_count >= self.config.max_retries {
            warn!(
                url = %request.url,
                retry_count = request.retry_count,
                ?status,
                "retries exhausted, returning last outcome"
            );
            return false;
        }
        true
    }

    /// Wait for connectivity, then resubmit `request` through the pipeline.
    ///
    /// `None` when the pipeline is gone and nothing can be replayed.
    async fn replay(
        &self,
        mut request: RequestDescriptor,
    ) -> Option<Result<ResponseEnvelope, PipelineError>> {
        let pipeline = self.pipeline.get().and_then(PipelineHandle::upgrade)?;

        self.connectivity.go_offline_and_wait_online().await;

        let outer_flag = request.ignore_response_transformation;
        request.retry_count += 1;
        request.ignore_response_transformation = true;
        info!(url = %request.url, retry_count = request.retry_count, "replaying request");

        let reply: Deferred<ResponseEnvelope, PipelineError> = Deferred::new();
        let completer = reply.clone();
        tokio::spawn(async move {
            let completed = match pipeline.request(request).await {
                Ok(response) => completer.resolve(response),
                Err(e) => completer.reject(e),
            };
            if let Err(e) = completed {
                warn!(error = %e, "replay outcome dropped");
            }
        });

        let outcome = match reply.wait().await {
            Ok(mut response) => {
                response.request.ignore_response_transformation = outer_flag;
                Ok(response)
            }
            Err(mut e) => {
                if let Some(request) = e.request_mut() {
                    request.ignore_response_transformation = outer_flag;
                }
                Err(e)
            }
        };
        Some(outcome)
    }
}

#[async_trait]
impl Interceptor for ResilienceInterceptor {
    fn name(&self) -> &'static str {
        "resilience"
    }

    fn attach(&self, pipeline: PipelineHandle) {
        if self.pipeline.set(pipeline).is_err() {
            warn!("resilience stage already attached to a pipeline");
        }
    }

    async fn on_request(
        &self,
        request: RequestDescriptor,
    ) -> Result<RequestDescriptor, PipelineError> {
        if self.connectivity.is_offline() && !self.config.is_exempt(&request.path()) {
            debug!(url = %request.url, "offline, holding request");
            self.connectivity.wait_online().await;
        }
        Ok(request)
    }

    async fn on_response(
        &self,
        response: ResponseEnvelope,
    ) -> Result<ResponseEnvelope, PipelineError> {
        if !self.should_replay(&response.request, Some(response.status)) {
            return Ok(response);
        }
        match self.replay(response.request.clone()).await {
            Some(outcome) => outcome,
            None => Ok(response),
        }
    }

    async fn on_response_error(
        &self,
        error: PipelineError,
    ) -> Result<ResponseEnvelope, PipelineError> {
        let status = match &error {
            PipelineError::Network { .. } => None,
            PipelineError::Status { response } => Some(response.status),
            _ => return Err(error),
        };
        let Some(request) = error.request() else {
            return Err(error);
        };
        if !self.should_replay(request, status) {
            return Err(error);
        }
        match self.replay(request.clone()).await {
            Some(outcome) => outcome,
            None => Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exempt_paths() {
        let config = ResilienceConfig::default();
        assert!(config.is_exempt("status/ping"));
        assert!(config.is_exempt("/auth/login"));
        assert!(config.is_exempt("v2/auth/logout"));
        assert!(!config.is_exempt("devices"));
        assert!(!config.is_exempt("myauth/login"));
    }

    #[test]
    fn test_unavailable_statuses() {
        let config = ResilienceConfig::default();
        assert!(config.is_unavailable(None));
        assert!(config.is_unavailable(Some(503)));
        assert!(config.is_unavailable(Some(522)));
        assert!(!config.is_unavailable(Some(500)));
        assert!(!config.is_unavailable(Some(200)));
    }
}
