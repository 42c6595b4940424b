//! Allocation engine services

pub mod allocator;
pub mod engine;
pub mod ledger;
pub mod locks;
pub mod projector;
pub mod reconciliation;

pub use allocator::{AllocationRun, Allocator, SkippedGrant};
pub use engine::{
    AllocationEngine, BulkShipmentReport, Cancellation, OrderAllocation, ShipmentFailure,
    ShipmentRequest, StockAdjustment,
};
pub use ledger::{StockLedger, VariantAudit, VariantStock};
pub use locks::{VariantGuard, VariantLocks};
pub use projector::OrderStateProjector;
pub use reconciliation::{DriftCorrection, ReconciliationJob, ReconciliationSummary};
