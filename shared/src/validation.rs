//! Validation utilities for the allocation engine

use crate::models::MovementType;

/// Maximum units a single adjustment or shipment may move
pub const MAX_QUANTITY: i32 = 1_000_000;

/// Treats empty or whitespace-only option values as "no option".
///
/// Older rows store `''` for products without color/size.
pub fn normalize_option(value: Option<String>) -> Option<String> {
    value.and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

/// Validate a reserve/release/ship quantity
pub fn validate_quantity(quantity: i32) -> Result<(), &'static str> {
    if quantity <= 0 {
        return Err("Quantity must be positive");
    }
    if quantity > MAX_QUANTITY {
        return Err("Quantity is too large");
    }
    Ok(())
}

/// Validate a physical adjustment against its movement type
pub fn validate_adjustment(delta: i32, movement_type: MovementType) -> Result<(), &'static str> {
    if delta == 0 {
        return Err("Adjustment delta must not be zero");
    }
    if delta.abs() > MAX_QUANTITY {
        return Err("Adjustment delta is too large");
    }
    if !movement_type.is_physical_adjustment() {
        return Err("Movement type is reserved for order allocation and shipment");
    }
    match movement_type {
        MovementType::Inbound | MovementType::InitialStock if delta < 0 => {
            Err("Inbound adjustments must be positive")
        }
        MovementType::Outbound | MovementType::SampleOut if delta > 0 => {
            Err("Outbound adjustments must be negative")
        }
        _ => Ok(()),
    }
}
