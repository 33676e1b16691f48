//! Interceptors and the chain that runs them.
//!
//! The chain behaves like nested middleware. For interceptors registered as
//! `[A, B, C]`:
//!
//! ```text
//!   request  ──► A.on_request ──► B.on_request ──► C.on_request ──► transport
//!                                                                     │
//!   caller ◄── A.on_response ◄── B.on_response ◄── C.on_response ◄───┘
//! ```
//!
//! `A` is the outermost layer: it sees the request first and the response
//! last. At every stage exactly one hook runs: the success hook when the value
//! coming in is `Ok`, the error hook when it is `Err`. An error hook may
//! recover by returning `Ok`.
//!
//! A request-stage failure skips the transport and enters the response pass
//! as an error.

use std::fmt;
use std::sync::{Arc, Weak};

use async_trait::async_trait;

use super::descriptor::RequestDescriptor;
use super::error::PipelineError;
use super::pipeline::{Pipeline, PipelineInner};
use super::response::ResponseEnvelope;

/// A request/response transformer attached to a pipeline.
///
/// All four hooks are optional; the defaults pass values through untouched.
#[async_trait]
pub trait Interceptor: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Called once when the owning pipeline is built.
    fn attach(&self, pipeline: PipelineHandle) {
        let _ = pipeline;
    }

    /// Transform an outgoing request.
    async fn on_request(
        &self,
        request: RequestDescriptor,
    ) -> Result<RequestDescriptor, PipelineError> {
        Ok(request)
    }

    /// Handle a failure raised by an outer request stage.
    async fn on_request_error(
        &self,
        error: PipelineError,
    ) -> Result<RequestDescriptor, PipelineError> {
        Err(error)
    }

    /// Transform a response coming back from an inner stage.
    async fn on_response(
        &self,
        response: ResponseEnvelope,
    ) -> Result<ResponseEnvelope, PipelineError> {
        Ok(response)
    }

    /// Handle a failure coming back from an inner stage or the transport.
    async fn on_response_error(
        &self,
        error: PipelineError,
    ) -> Result<ResponseEnvelope, PipelineError> {
        Err(error)
    }
}

/// Weak back-reference from an interceptor to its owning pipeline.
#[derive(Clone)]
pub struct PipelineHandle {
    inner: Weak<PipelineInner>,
}

impl PipelineHandle {
    pub(super) fn new(inner: Weak<PipelineInner>) -> Self {
        Self { inner }
    }

    /// The pipeline, if it is still alive.
    pub fn upgrade(&self) -> Option<Pipeline> {
        self.inner.upgrade().map(Pipeline::from_inner)
    }
}

impl fmt::Debug for PipelineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineHandle")
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}

/// Ordered interceptor list.
#[derive(Clone, Default)]
pub struct InterceptorChain {
    stages: Vec<Arc<dyn Interceptor>>,
}

impl InterceptorChain {
    /// Build a chain; the first element is the outermost layer.
    pub fn new(stages: Vec<Arc<dyn Interceptor>>) -> Self {
        Self { stages }
    }

    /// Number of registered stages.
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Whether the chain is empty.
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Stage names in registration order.
    pub fn names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|stage| stage.name()).collect()
    }

    pub(super) fn attach(&self, handle: &PipelineHandle) {
        for stage in &self.stages {
            stage.attach(handle.clone());
        }
    }

    /// Request pass, outermost first.
    pub async fn run_request(
        &self,
        request: RequestDescriptor,
    ) -> Result<RequestDescriptor, PipelineError> {
        let mut current = Ok(request);
        for stage in &self.stages {
            current = match current {
                Ok(request) => stage.on_request(request).await,
                Err(error) => stage.on_request_error(error).await,
            };
        }
        current
    }

    /// Response pass, innermost first.
    pub async fn run_response(
        &self,
        outcome: Result<ResponseEnvelope, PipelineError>,
    ) -> Result<ResponseEnvelope, PipelineError> {
        let mut current = outcome;
        for stage in self.stages.iter().rev() {
            current = match current {
                Ok(response) => stage.on_response(response).await,
                Err(error) => stage.on_response_error(error).await,
            };
        }
        current
    }
}

impl fmt::Debug for InterceptorChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{Method, ResponseBody};
    use ::http::HeaderValue;
    use std::sync::Mutex;

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Interceptor for Recorder {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn on_request(
            &self,
            mut request: RequestDescriptor,
        ) -> Result<RequestDescriptor, PipelineError> {
            self.log.lock().unwrap().push(format!("req:{}", self.name));
            let trail = format!("{}{}", request.header("x-trail").unwrap_or_default(), self.name);
            request
                .headers
                .insert("x-trail", HeaderValue::from_str(&trail).unwrap());
            Ok(request)
        }

        async fn on_response(
            &self,
            response: ResponseEnvelope,
        ) -> Result<ResponseEnvelope, PipelineError> {
            self.log.lock().unwrap().push(format!("res:{}", self.name));
            Ok(response)
        }

        async fn on_response_error(
            &self,
            error: PipelineError,
        ) -> Result<ResponseEnvelope, PipelineError> {
            self.log.lock().unwrap().push(format!("err:{}", self.name));
            Err(error)
        }
    }

    struct Rejecter;

    #[async_trait]
    impl Interceptor for Rejecter {
        fn name(&self) -> &'static str {
            "rejecter"
        }

        async fn on_response(
            &self,
            _response: ResponseEnvelope,
        ) -> Result<ResponseEnvelope, PipelineError> {
            Err(PipelineError::Interceptor("rejected".into()))
        }
    }

    fn recorder(name: &'static str, log: &Arc<Mutex<Vec<String>>>) -> Arc<dyn Interceptor> {
        Arc::new(Recorder {
            name,
            log: Arc::clone(log),
        })
    }

    #[tokio::test]
    async fn test_nested_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = InterceptorChain::new(vec![
            recorder("a", &log),
            recorder("b", &log),
            recorder("c", &log),
        ]);

        let request = chain
            .run_request(RequestDescriptor::new(Method::GET, "x"))
            .await
            .unwrap();
        assert_eq!(request.header("x-trail"), Some("abc"));

        let response = ResponseEnvelope::new(200, ResponseBody::Empty, request);
        chain.run_response(Ok(response)).await.unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec!["req:a", "req:b", "req:c", "res:c", "res:b", "res:a"]
        );
    }

    #[tokio::test]
    async fn test_rejection_flows_outward_as_error() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = InterceptorChain::new(vec![
            recorder("outer", &log),
            Arc::new(Rejecter),
            recorder("inner", &log),
        ]);

        let request = RequestDescriptor::new(Method::GET, "x");
        let response = ResponseEnvelope::new(200, ResponseBody::Empty, request);
        let result = chain.run_response(Ok(response)).await;

        assert!(matches!(result, Err(PipelineError::Interceptor(_))));
        assert_eq!(*log.lock().unwrap(), vec!["res:inner", "err:outer"]);
    }

    #[test]
    fn test_names() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = InterceptorChain::new(vec![recorder("a", &log), Arc::new(Rejecter)]);
        assert_eq!(chain.names(), vec!["a", "rejecter"]);
        assert_eq!(chain.len(), 2);
    }
}
