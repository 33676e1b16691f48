//! Client facade.
//!
//! High-level API bundling the request pipeline, the subscription protocol
//! and the state they share.

#[allow(clippy::module_inception)]
mod client;

pub use client::*;
