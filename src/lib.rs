//! # Tether
//!
//! Resilient transport core for a cloud IoT client SDK.
//!
//! Two halves share one set of process-wide state:
//!
//! - **Request pipeline**: HTTP requests pass through an ordered interceptor
//!   chain. The standard stack resolves the base URL, attaches credentials,
//!   normalizes the server's `resultCode` envelope and transparently replays
//!   requests the server could not answer, holding them while offline.
//! - **Subscription protocol**: one WebSocket carries goal-tagged packets
//!   correlated with their replies by id, plus unsolicited data pushes routed
//!   to the [`Subscription`](ws::Subscription) that owns them.
//!
//! ## Feature Flags
//!
//! - `http-client` (default): reqwest-backed [`HttpTransport`](crate::http::HttpTransport)
//! - `websocket` (default): tokio-tungstenite socket driver
//!
//! ## Modules
//!
//! - [`core`]: constants, error types, result codes and [`Deferred`](crate::core::Deferred)
//! - [`state`]: connectivity flag, base-URL cache, session store
//! - [`http`]: request pipeline and built-in interceptors
//! - [`ws`]: packets, subscriptions and the correlation engine
//! - [`client`]: configuration and the [`TetherClient`](client::TetherClient) facade
//!
//! ## Example Usage
//!
//! ```ignore
//! use tether::prelude::*;
//!
//! let config = ClientConfig::from_env()?;
//! let client = TetherClient::with_reqwest(config);
//!
//! let devices = client.pipeline().get("devices").await?;
//!
//! let subscription = Subscription::new("device", OperationMask::ALL, serde_json::json!({}));
//! subscription.on_create().listen(|event| println!("{:?}", event.payload));
//! client.protocol().subscribe(&subscription).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod client;
pub mod core;
pub mod http;
pub mod state;
pub mod ws;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::client::{ClientConfig, TetherClient, TetherClientBuilder};
    pub use crate::core::{ApiFailure, Deferred, DeferredError, ResultCode, TetherError};
    pub use crate::http::interceptors::{AuthConfig, ResilienceConfig};
    pub use crate::http::{
        HttpTransport, Interceptor, Method, Pipeline, PipelineConfig, PipelineError,
        RequestDescriptor, ResponseBody, ResponseEnvelope,
    };
    pub use crate::state::{ConnectivityMonitor, ReloginReason, SessionStore, SharedState};
    pub use crate::ws::{
        DataEvent, Goal, OperationMask, PacketRequest, PacketResponse, ProtocolConfig,
        ProtocolError, Subscription, SubscriptionProtocol, SubscriptionStatus,
    };

    #[cfg(feature = "http-client")]
    pub use crate::http::ReqwestTransport;
    #[cfg(feature = "websocket")]
    pub use crate::ws::WsConnection;
}

// Re-export commonly used items at crate root
pub use crate::client::{ClientConfig, TetherClient, TetherClientBuilder};
pub use crate::core::TetherError;
pub use crate::http::{Pipeline, PipelineError};
pub use crate::ws::{Subscription, SubscriptionProtocol};
