//! Domain models for the wholesale allocation engine

mod customer;
mod order;
mod stock;

pub use customer::*;
pub use order::*;
pub use stock::*;
