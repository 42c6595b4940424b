//! Allocation engine facade
//!
//! Entry points called by order intake, stock adjustment, shipping and the
//! back office. Each one runs the allocator for the affected variants and
//! projects the orders it touched.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use shared::{
    validate_quantity, AdjustmentReason, AllocationPolicy, OrderStatus, Reference, StockMovement,
    VariantKey,
};
use uuid::Uuid;

use super::allocator::{AllocationRun, Allocator};
use super::ledger::{StockLedger, VariantAudit};
use super::locks::VariantLocks;
use super::projector::OrderStateProjector;
use super::reconciliation::{ReconciliationJob, ReconciliationSummary};
use crate::config::AllocationSettings;
use crate::error::{AppError, AppResult};
use crate::store::{AllocationScope, AllocationStore, Shipment};

/// Engine wiring shared by every handler
#[derive(Clone)]
pub struct AllocationEngine {
    store: Arc<dyn AllocationStore>,
    ledger: StockLedger,
    allocator: Allocator,
    projector: OrderStateProjector,
    reconciliation: ReconciliationJob,
    settings: AllocationSettings,
}

/// Allocation result for a newly created order
#[derive(Debug, Clone, Serialize)]
pub struct OrderAllocation {
    pub order_id: Uuid,
    pub status: OrderStatus,
    pub runs: Vec<AllocationRun>,
}

/// A physical change and the allocation it triggered
#[derive(Debug, Clone, Serialize)]
pub struct StockAdjustment {
    pub movement: StockMovement,
    pub available_stock: i32,
    pub run: Option<AllocationRun>,
}

/// One entry of a bulk shipment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShipmentRequest {
    pub order_line_id: Uuid,
    pub quantity: i32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ShipmentFailure {
    pub order_line_id: Uuid,
    pub quantity: i32,
    pub code: &'static str,
    pub message: String,
}

/// Per-line outcome of a bulk shipment
#[derive(Debug, Clone, Default, Serialize)]
pub struct BulkShipmentReport {
    pub shipped: Vec<Shipment>,
    pub failed: Vec<ShipmentFailure>,
    pub total_units: i32,
}

/// Outcome of cancelling an order
#[derive(Debug, Clone, Serialize)]
pub struct Cancellation {
    pub order_id: Uuid,
    pub units_released: i32,
    pub runs: Vec<AllocationRun>,
}

impl AllocationEngine {
    pub fn new(store: Arc<dyn AllocationStore>, settings: AllocationSettings) -> Self {
        let locks = VariantLocks::new();
        let ledger = StockLedger::new(store.clone());
        let projector = OrderStateProjector::new(store.clone());
        let allocator = Allocator::new(
            store.clone(),
            locks.clone(),
            projector.clone(),
            settings.clone(),
        );
        let reconciliation = ReconciliationJob::new(
            store.clone(),
            locks,
            allocator.clone(),
            projector.clone(),
            settings.max_retries + 1,
        );
        Self {
            store,
            ledger,
            allocator,
            projector,
            reconciliation,
            settings,
        }
    }

    pub fn ledger(&self) -> &StockLedger {
        &self.ledger
    }

    pub fn settings(&self) -> &AllocationSettings {
        &self.settings
    }

    /// Allocate stock to a new order: one run per distinct variant of its
    /// lines, then projection of every order the runs touched
    pub async fn on_order_created(&self, order_id: Uuid) -> AppResult<OrderAllocation> {
        let order = self
            .store
            .get_order(order_id)
            .await?
            .ok_or_else(|| AppError::NotFound("Order".to_string()))?;
        if order.status.is_terminal() {
            return Err(AppError::InvalidStateTransition(format!(
                "order {} is already {}",
                order_id, order.status
            )));
        }

        let lines = self.store.order_lines(order_id).await?;
        let keys: BTreeSet<VariantKey> = lines.into_iter().map(|l| l.key).collect();

        let runs = self
            .allocate_each(&keys, self.settings.default_policy)
            .await?;

        let mut touched = touched_orders(&runs);
        if !touched.contains(&order_id) {
            touched.push(order_id);
        }
        let statuses = self.projector.project_many(&touched).await?;
        let status = statuses
            .iter()
            .find(|(id, _)| *id == order_id)
            .map(|(_, s)| *s)
            .unwrap_or(order.status);

        tracing::info!("Order {} allocated: {}", order_id, status);

        Ok(OrderAllocation {
            order_id,
            status,
            runs,
        })
    }

    /// Apply a physical change; inbound stock goes straight to waiting orders
    pub async fn on_physical_stock_changed(
        &self,
        key: &VariantKey,
        delta: i32,
        reason: &AdjustmentReason,
    ) -> AppResult<StockAdjustment> {
        let movement = self.ledger.adjust_physical(key, delta, reason).await?;

        let run = if delta > 0 {
            let run = self
                .allocator
                .allocate(key, self.settings.default_policy, &AllocationScope::All)
                .await?;
            self.projector.project_many(&run.touched_orders).await?;
            Some(run)
        } else {
            None
        };

        let available_stock = self.ledger.get_available(key).await?;
        Ok(StockAdjustment {
            movement,
            available_stock,
            run,
        })
    }

    /// Ship reserved units of one line
    pub async fn ship_allocated(&self, order_line_id: Uuid, quantity: i32) -> AppResult<Shipment> {
        self.ship(order_line_id, quantity, None).await
    }

    /// Ship reserved units tied to a statement or other document
    pub async fn ship_with_reference(
        &self,
        order_line_id: Uuid,
        quantity: i32,
        reference: Reference,
    ) -> AppResult<Shipment> {
        self.ship(order_line_id, quantity, Some(reference)).await
    }

    async fn ship(
        &self,
        order_line_id: Uuid,
        quantity: i32,
        reference: Option<Reference>,
    ) -> AppResult<Shipment> {
        validate_quantity(quantity)
            .map_err(|msg| AppError::validation("quantity", msg, "출고 수량이 올바르지 않습니다"))?;
        let shipment = self
            .store
            .ship_line(order_line_id, quantity, reference)
            .await?;
        tracing::info!(
            "Shipped {} units of line {}{}",
            quantity,
            order_line_id,
            if shipment.order_completed {
                ", order complete"
            } else {
                ""
            }
        );
        Ok(shipment)
    }

    /// Ship many lines; each line succeeds or fails on its own
    pub async fn ship_bulk(&self, items: &[ShipmentRequest]) -> BulkShipmentReport {
        let mut report = BulkShipmentReport::default();
        for item in items {
            match self.ship_allocated(item.order_line_id, item.quantity).await {
                Ok(shipment) => {
                    report.total_units += shipment.shipped_quantity;
                    report.shipped.push(shipment);
                }
                Err(err) => {
                    tracing::warn!("Bulk shipment of line {} failed: {}", item.order_line_id, err);
                    report.failed.push(ShipmentFailure {
                        order_line_id: item.order_line_id,
                        quantity: item.quantity,
                        code: err.code(),
                        message: err.to_string(),
                    });
                }
            }
        }
        tracing::info!(
            "Bulk shipment: {} lines shipped, {} failed",
            report.shipped.len(),
            report.failed.len()
        );
        report
    }

    /// Cancel an order, release its reservations and hand the freed stock
    /// to waiting orders
    pub async fn cancel_order(&self, order_id: Uuid) -> AppResult<Cancellation> {
        let order = self
            .store
            .get_order(order_id)
            .await?
            .ok_or_else(|| AppError::NotFound("Order".to_string()))?;
        match order.status {
            OrderStatus::Cancelled => {
                return Ok(Cancellation {
                    order_id,
                    units_released: 0,
                    runs: Vec::new(),
                })
            }
            OrderStatus::Shipped => {
                return Err(AppError::InvalidStateTransition(format!(
                    "order {} is already shipped",
                    order_id
                )))
            }
            _ => {}
        }

        // Close the order first so no allocator run can grant to it again
        self.store
            .set_order_status(order_id, OrderStatus::Cancelled)
            .await?;

        let lines = self.store.order_lines(order_id).await?;
        let mut units_released = 0;
        let mut freed = BTreeSet::new();
        for line in &lines {
            if let Some(release) = self.store.release_line(line.id, "order cancelled").await? {
                units_released += release.released;
                if release.released > 0 {
                    freed.insert(line.key.clone());
                }
            }
        }

        let runs = self
            .allocate_each(&freed, self.settings.default_policy)
            .await?;
        self.projector.project_many(&touched_orders(&runs)).await?;

        tracing::info!(
            "Cancelled order {}, released {} units",
            order_id,
            units_released
        );

        Ok(Cancellation {
            order_id,
            units_released,
            runs,
        })
    }

    /// Manual run for one variant, e.g. a priority allocation from the back office
    pub async fn allocate_variant(
        &self,
        key: &VariantKey,
        policy: Option<AllocationPolicy>,
    ) -> AppResult<AllocationRun> {
        let policy = policy.unwrap_or(self.settings.default_policy);
        let run = self
            .allocator
            .allocate(key, policy, &AllocationScope::All)
            .await?;
        self.projector.project_many(&run.touched_orders).await?;
        Ok(run)
    }

    /// Reset and rebuild allocations for a scope
    pub async fn reconcile(
        &self,
        scope: &AllocationScope,
        policy: Option<AllocationPolicy>,
    ) -> AppResult<ReconciliationSummary> {
        let policy = policy.unwrap_or(self.settings.default_policy);
        self.reconciliation.run(scope, policy).await
    }

    pub async fn audit_product(&self, product_id: Uuid) -> AppResult<Vec<VariantAudit>> {
        self.ledger.audit_product(product_id).await
    }

    /// One run per variant. If a run fails, orders granted stock by the
    /// earlier runs are projected before the error is returned.
    async fn allocate_each(
        &self,
        keys: &BTreeSet<VariantKey>,
        policy: AllocationPolicy,
    ) -> AppResult<Vec<AllocationRun>> {
        let mut runs = Vec::with_capacity(keys.len());
        for key in keys {
            match self
                .allocator
                .allocate(key, policy, &AllocationScope::All)
                .await
            {
                Ok(run) => runs.push(run),
                Err(err) => {
                    let committed = touched_orders(&runs);
                    self.projector.project_after_failure(&committed).await;
                    return Err(err);
                }
            }
        }
        Ok(runs)
    }
}

/// Distinct orders touched by the runs, sorted
fn touched_orders(runs: &[AllocationRun]) -> Vec<Uuid> {
    runs.iter()
        .flat_map(|r| r.touched_orders.iter().copied())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}
