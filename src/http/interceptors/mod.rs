//! Built-in interceptors.
//!
//! [`Pipeline::standard`](super::Pipeline::standard) registers them as
//! `[BaseUrl, Auth, Normalize, Resilience]`.

mod auth;
mod base_url;
mod normalize;
mod resilience;

pub use auth::{AuthConfig, AuthInterceptor};
pub use base_url::BaseUrlInterceptor;
pub use normalize::NormalizeInterceptor;
pub use resilience::{ResilienceConfig, ResilienceInterceptor};
