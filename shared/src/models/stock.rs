//! Stock variant and movement ledger models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::types::{ParseEnumError, Reference, ReferenceType};

/// Address of a sellable configuration: product × color × size.
///
/// A product without options uses `(product_id, None, None)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VariantKey {
    pub product_id: Uuid,
    pub color: Option<String>,
    pub size: Option<String>,
}

impl VariantKey {
    pub fn new(product_id: Uuid, color: Option<String>, size: Option<String>) -> Self {
        Self {
            product_id,
            color: crate::validation::normalize_option(color),
            size: crate::validation::normalize_option(size),
        }
    }

    /// The implicit variant of a product that has no options
    pub fn product(product_id: Uuid) -> Self {
        Self {
            product_id,
            color: None,
            size: None,
        }
    }
}

impl std::fmt::Display for VariantKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.product_id,
            self.color.as_deref().unwrap_or("-"),
            self.size.as_deref().unwrap_or("-")
        )
    }
}

/// Stock counters for one variant
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StockVariant {
    pub id: Uuid,
    pub key: VariantKey,
    /// Units actually on hand
    pub physical_stock: i32,
    /// Units promised to open order lines
    pub allocated_stock: i32,
    /// Set when an invariant check failed; cleared by reconciliation
    pub is_blocked: bool,
    pub blocked_reason: Option<String>,
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}

/// Invariant violations detected on a stock variant
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StockInvariantViolation {
    #[error("physical stock is negative ({0})")]
    NegativePhysical(i32),
    #[error("allocated stock is negative ({0})")]
    NegativeAllocated(i32),
    #[error("allocated stock {allocated} exceeds physical stock {physical}")]
    OverAllocated { physical: i32, allocated: i32 },
    #[error("allocated stock {recorded} does not match order line reservations {expected}")]
    Drift { recorded: i32, expected: i32 },
}

impl StockVariant {
    /// Available stock. Never stored, always derived.
    ///
    /// Negative only when the ledger is corrupt; callers must check
    /// [`StockVariant::check_invariants`] instead of clamping.
    pub fn available_stock(&self) -> i32 {
        self.physical_stock - self.allocated_stock
    }

    /// Checks `0 <= allocated_stock <= physical_stock`
    pub fn check_invariants(&self) -> Result<(), StockInvariantViolation> {
        if self.physical_stock < 0 {
            return Err(StockInvariantViolation::NegativePhysical(self.physical_stock));
        }
        if self.allocated_stock < 0 {
            return Err(StockInvariantViolation::NegativeAllocated(self.allocated_stock));
        }
        if self.allocated_stock > self.physical_stock {
            return Err(StockInvariantViolation::OverAllocated {
                physical: self.physical_stock,
                allocated: self.allocated_stock,
            });
        }
        Ok(())
    }

    /// Checks the recorded allocation against the sum of outstanding line reservations
    pub fn check_against_lines(&self, outstanding: i32) -> Result<(), StockInvariantViolation> {
        self.check_invariants()?;
        if self.allocated_stock != outstanding {
            return Err(StockInvariantViolation::Drift {
                recorded: self.allocated_stock,
                expected: outstanding,
            });
        }
        Ok(())
    }
}

/// Kinds of stock movement
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MovementType {
    Inbound,
    Outbound,
    OrderAllocation,
    OrderShipment,
    InitialStock,
    SampleOut,
}

impl MovementType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MovementType::Inbound => "inbound",
            MovementType::Outbound => "outbound",
            MovementType::OrderAllocation => "order_allocation",
            MovementType::OrderShipment => "order_shipment",
            MovementType::InitialStock => "initial_stock",
            MovementType::SampleOut => "sample_out",
        }
    }

    /// Whether this type may be used for a manual physical adjustment
    pub fn is_physical_adjustment(&self) -> bool {
        matches!(
            self,
            MovementType::Inbound
                | MovementType::Outbound
                | MovementType::InitialStock
                | MovementType::SampleOut
        )
    }
}

impl std::str::FromStr for MovementType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inbound" => Ok(MovementType::Inbound),
            "outbound" => Ok(MovementType::Outbound),
            "order_allocation" => Ok(MovementType::OrderAllocation),
            "order_shipment" => Ok(MovementType::OrderShipment),
            "initial_stock" => Ok(MovementType::InitialStock),
            "sample_out" => Ok(MovementType::SampleOut),
            other => Err(ParseEnumError::new("movement_type", other)),
        }
    }
}

/// Which counter(s) a movement moved
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MovementEffect {
    Physical,
    Allocated,
    Both,
}

impl MovementEffect {
    pub fn as_str(&self) -> &'static str {
        match self {
            MovementEffect::Physical => "physical",
            MovementEffect::Allocated => "allocated",
            MovementEffect::Both => "both",
        }
    }

    pub fn touches_physical(&self) -> bool {
        matches!(self, MovementEffect::Physical | MovementEffect::Both)
    }

    pub fn touches_allocated(&self) -> bool {
        matches!(self, MovementEffect::Allocated | MovementEffect::Both)
    }
}

impl std::str::FromStr for MovementEffect {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "physical" => Ok(MovementEffect::Physical),
            "allocated" => Ok(MovementEffect::Allocated),
            "both" => Ok(MovementEffect::Both),
            other => Err(ParseEnumError::new("movement_effect", other)),
        }
    }
}

/// An immutable, append-only ledger record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StockMovement {
    pub id: Uuid,
    pub product_id: Uuid,
    pub color: Option<String>,
    pub size: Option<String>,
    /// Positive = inbound/restock or deallocation, negative = outbound/allocation/shipment
    pub quantity_delta: i32,
    pub movement_type: MovementType,
    pub affects: MovementEffect,
    pub reference_type: Option<ReferenceType>,
    pub reference_id: Option<Uuid>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl StockMovement {
    pub fn key(&self) -> VariantKey {
        VariantKey {
            product_id: self.product_id,
            color: self.color.clone(),
            size: self.size.clone(),
        }
    }

    pub fn reference(&self) -> Option<Reference> {
        match (self.reference_type, self.reference_id) {
            (Some(reference_type), Some(reference_id)) => Some(Reference {
                reference_type,
                reference_id,
            }),
            _ => None,
        }
    }
}

/// Why a physical adjustment happened
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AdjustmentReason {
    pub movement_type: MovementType,
    pub reference: Option<Reference>,
    pub notes: Option<String>,
}

impl AdjustmentReason {
    pub fn new(movement_type: MovementType) -> Self {
        Self {
            movement_type,
            reference: None,
            notes: None,
        }
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    pub fn with_reference(mut self, reference: Reference) -> Self {
        self.reference = Some(reference);
        self
    }
}

/// Rebuilds physical stock from a movement history
pub fn replay_physical(movements: &[StockMovement]) -> i32 {
    movements
        .iter()
        .filter(|m| m.affects.touches_physical())
        .map(|m| m.quantity_delta)
        .sum()
}

/// Rebuilds allocated stock from a movement history.
///
/// Allocation movements carry a negative delta (stock leaves the available
/// pool), so the allocated counter moves by the opposite sign. Shipments are
/// negative and consume allocation, so they also reduce it.
pub fn replay_allocated(movements: &[StockMovement]) -> i32 {
    movements
        .iter()
        .filter(|m| m.affects.touches_allocated())
        .map(|m| match m.affects {
            MovementEffect::Both => m.quantity_delta,
            _ => -m.quantity_delta,
        })
        .sum()
}
