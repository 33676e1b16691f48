//! Layered HTTP request pipeline.
//!
//! A [`Pipeline`] threads a [`RequestDescriptor`] through its
//! [`InterceptorChain`], hands it to an [`HttpTransport`] and threads the
//! outcome back out. The built-in stages live in [`interceptors`].

mod descriptor;
mod error;
mod interceptor;
pub mod interceptors;
#[cfg(feature = "http-client")]
mod native;
mod path;
mod pipeline;
mod response;
mod transport;

pub use ::http::header::{HeaderMap, HeaderName, HeaderValue};
pub use descriptor::{Method, RequestBody, RequestDescriptor, ResponseType};
pub use error::PipelineError;
pub use interceptor::{Interceptor, InterceptorChain, PipelineHandle};
#[cfg(feature = "http-client")]
#[cfg_attr(docsrs, doc(cfg(feature = "http-client")))]
pub use native::ReqwestTransport;
pub use path::{is_absolute_url, join_path, join_paths};
pub use pipeline::{Pipeline, PipelineConfig, PipelineConfigBuilder, default_validate_status};
pub use response::{ResponseBody, ResponseEnvelope};
pub use transport::HttpTransport;
