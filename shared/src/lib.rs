//! Shared types and models for the wholesale allocation engine
//!
//! This crate holds the storage-free part of the engine: the stock and order
//! model, the allocation policies and order status projection. It is used by
//! the backend and, via WASM, by the admin UI for plan previews.

pub mod models;
pub mod policy;
pub mod projection;
pub mod types;
pub mod validation;

pub use models::*;
pub use policy::*;
pub use projection::*;
pub use types::*;
pub use validation::*;
