//! Base-URL resolution stage.

use async_trait::async_trait;
use tracing::trace;

use crate::http::descriptor::RequestDescriptor;
use crate::http::error::PipelineError;
use crate::http::interceptor::Interceptor;
use crate::http::path::{is_absolute_url, join_path};
use crate::state::BaseUrlCache;

/// Fills in `base_url` as `<resolved base>/<api prefix>`.
///
/// Requests with an absolute URL or an explicit base URL are left alone. When
/// the base URL is not known yet the request waits for it; other requests are
/// unaffected.
#[derive(Debug, Clone)]
pub struct BaseUrlInterceptor {
    cache: BaseUrlCache,
    api_prefix: String,
}

impl BaseUrlInterceptor {
    /// Resolve through `cache` and append `api_prefix`.
    pub fn new(cache: BaseUrlCache, api_prefix: impl Into<String>) -> Self {
        Self {
            cache,
            api_prefix: api_prefix.into(),
        }
    }
}

#[async_trait]
impl Interceptor for BaseUrlInterceptor {
    fn name(&self) -> &'static str {
        "base_url"
    }

    async fn on_request(
        &self,
        mut request: RequestDescriptor,
    ) -> Result<RequestDescriptor, PipelineError> {
        if is_absolute_url(&request.url) || request.base_url.is_some() {
            return Ok(request);
        }

        let base = self.cache.resolve().await?;
        let base = join_path(&base, &self.api_prefix);
        trace!(%base, url = %request.url, "base url applied");
        request.base_url = Some(base);
        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Method;

    #[tokio::test]
    async fn test_joins_base_and_prefix() {
        let stage = BaseUrlInterceptor::new(
            BaseUrlCache::new(Some("https://cloud.example.com/".into())),
            "/api/v1/",
        );

        let request = stage
            .on_request(RequestDescriptor::new(Method::GET, "/devices"))
            .await
            .unwrap();
        assert_eq!(request.full_url(), "https://cloud.example.com/api/v1/devices");
    }

    #[tokio::test]
    async fn test_explicit_base_kept() {
        let stage = BaseUrlInterceptor::new(BaseUrlCache::default(), "api/v1");

        let request = stage
            .on_request(
                RequestDescriptor::new(Method::GET, "files/1").with_base_url("https://cdn.example.com"),
            )
            .await
            .unwrap();
        assert_eq!(request.full_url(), "https://cdn.example.com/files/1");

        let absolute = stage
            .on_request(RequestDescriptor::new(Method::GET, "https://other.example.com/x"))
            .await
            .unwrap();
        assert!(absolute.base_url.is_none());
    }
}
