//! Core types shared by the HTTP pipeline and the subscription protocol.

pub mod constants;
mod deferred;
mod error;
mod result;

pub use constants::*;
pub use deferred::{Deferred, DeferredState};
pub use error::{DeferredError, DeferredPhase, TetherError};
pub use result::{ApiFailure, ResultCode};
