//! HTTP handlers for the allocation engine

pub mod allocation;
pub mod health;
pub mod stock;

pub use allocation::*;
pub use health::*;
pub use stock::*;
