//! Reconciliation: reset allocations for a scope and rebuild them
//!
//! The pass runs while holding every affected variant's lock. Each step is
//! made of atomic store calls, so an aborted pass can simply be run again.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;
use shared::{AllocationPolicy, Order, OrderLine, StatusTally, VariantKey};
use uuid::Uuid;

use super::allocator::{AllocationRun, Allocator};
use super::locks::{VariantGuard, VariantLocks};
use super::projector::OrderStateProjector;
use crate::error::{AppError, AppResult};
use crate::store::{AllocationScope, AllocationStore};

const RESET_NOTE: &str = "reconciliation reset";
const DRIFT_NOTE: &str = "reconciliation drift correction";

/// Rebuilds allocations from scratch for a scope
#[derive(Clone)]
pub struct ReconciliationJob {
    store: Arc<dyn AllocationStore>,
    locks: VariantLocks,
    allocator: Allocator,
    projector: OrderStateProjector,
    max_lock_attempts: u32,
}

/// A variant whose allocated counter disagreed with its order lines
#[derive(Debug, Clone, Serialize)]
pub struct DriftCorrection {
    pub key: VariantKey,
    pub recorded: i32,
    pub expected: i32,
}

struct Rebuild {
    lines_reset: usize,
    units_released: i32,
    drift_corrections: Vec<DriftCorrection>,
    orders: Vec<Order>,
    runs: Vec<AllocationRun>,
}

/// Outcome of a reconciliation pass
#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationSummary {
    pub scope: AllocationScope,
    pub policy: AllocationPolicy,
    pub orders_processed: usize,
    pub fully_allocated: usize,
    pub partially_allocated: usize,
    pub unallocated: usize,
    pub lines_reset: usize,
    pub units_released: i32,
    pub drift_corrections: Vec<DriftCorrection>,
    pub runs: Vec<AllocationRun>,
}

impl ReconciliationJob {
    pub fn new(
        store: Arc<dyn AllocationStore>,
        locks: VariantLocks,
        allocator: Allocator,
        projector: OrderStateProjector,
        max_lock_attempts: u32,
    ) -> Self {
        Self {
            store,
            locks,
            allocator,
            projector,
            max_lock_attempts: max_lock_attempts.max(1),
        }
    }

    /// Run one full pass over `scope`
    pub async fn run(
        &self,
        scope: &AllocationScope,
        policy: AllocationPolicy,
    ) -> AppResult<ReconciliationSummary> {
        tracing::info!("Reconciling {} with {} policy", scope, policy.as_str());

        let (_guard, lines) = self.lock_scope(scope).await?;

        let rebuild = match self.rebuild(scope, policy, &lines).await {
            Ok(rebuild) => rebuild,
            Err(err) => {
                // Reset lines stay reset; their orders must say so
                tracing::error!("Reconciliation of {} stopped part way: {}", scope, err);
                let affected: Vec<Uuid> = lines
                    .iter()
                    .map(|l| l.order_id)
                    .collect::<BTreeSet<_>>()
                    .into_iter()
                    .collect();
                self.projector.project_after_failure(&affected).await;
                return Err(err);
            }
        };

        // 5. Project every order in scope
        let order_ids: Vec<Uuid> = rebuild.orders.iter().map(|o| o.id).collect();
        let statuses = self.projector.project_many(&order_ids).await?;
        let mut tally = StatusTally::default();
        for (_, status) in &statuses {
            tally.record(*status);
        }

        let summary = ReconciliationSummary {
            scope: scope.clone(),
            policy,
            orders_processed: tally.total(),
            fully_allocated: tally.fully_allocated,
            partially_allocated: tally.partially_allocated,
            unallocated: tally.unallocated,
            lines_reset: rebuild.lines_reset,
            units_released: rebuild.units_released,
            drift_corrections: rebuild.drift_corrections,
            runs: rebuild.runs,
        };

        tracing::info!(
            "Reconciled {}: {} orders ({} full, {} partial, {} none), {} drift corrections",
            scope,
            summary.orders_processed,
            summary.fully_allocated,
            summary.partially_allocated,
            summary.unallocated,
            summary.drift_corrections.len()
        );

        Ok(summary)
    }

    /// Reset, drift check and reallocation; the caller holds every lock
    async fn rebuild(
        &self,
        scope: &AllocationScope,
        policy: AllocationPolicy,
        lines: &[OrderLine],
    ) -> AppResult<Rebuild> {
        let keys: BTreeSet<VariantKey> = lines.iter().map(|l| l.key.clone()).collect();

        // 1. Release every in-scope reservation
        let mut lines_reset = 0;
        let mut units_released = 0;
        for line in lines.iter().filter(|l| l.outstanding_reservation() > 0) {
            if let Some(release) = self.store.release_line(line.id, RESET_NOTE).await? {
                if release.was_floored() {
                    tracing::warn!(
                        "Line {} held {} units but {} had only {} allocated",
                        line.id,
                        release.requested,
                        line.key,
                        release.released
                    );
                }
                lines_reset += 1;
                units_released += release.released;
            }
        }

        // 2. What remains allocated must belong to out-of-scope lines
        let mut drift_corrections = Vec::new();
        for key in &keys {
            let variant = match self.store.get_variant(key).await? {
                Some(v) => v,
                None => continue,
            };
            let expected = self.store.outstanding_reservations(key).await?;
            if variant.allocated_stock != expected {
                tracing::warn!(
                    "Allocated stock drift on {}: recorded {}, expected {}",
                    key,
                    variant.allocated_stock,
                    expected
                );
                drift_corrections.push(DriftCorrection {
                    key: key.clone(),
                    recorded: variant.allocated_stock,
                    expected,
                });
            }
            if variant.allocated_stock != expected || variant.is_blocked {
                self.store.correct_allocated(key, expected, DRIFT_NOTE).await?;
            }
        }

        // 3. In-scope orders, oldest first
        let orders = self.store.orders_in_scope(scope).await?;

        // 4. Allocate per variant; FIFO demand order matches order creation order
        let mut runs = Vec::with_capacity(keys.len());
        for key in &keys {
            runs.push(self.allocator.allocate_locked(key, policy, scope).await?);
        }

        Ok(Rebuild {
            lines_reset,
            units_released,
            drift_corrections,
            orders,
            runs,
        })
    }

    /// Lock every variant the scope touches. Lines read before locking are
    /// re-read afterwards; if new variants showed up in between, the locks
    /// are dropped and the set is recomputed.
    async fn lock_scope(
        &self,
        scope: &AllocationScope,
    ) -> AppResult<(VariantGuard, Vec<OrderLine>)> {
        let mut lines = self.store.lines_in_scope(scope).await?;
        for attempt in 1..=self.max_lock_attempts {
            let keys: BTreeSet<&VariantKey> = lines.iter().map(|l| &l.key).collect();
            let guard = self.locks.acquire_many(keys).await;

            let current = self.store.lines_in_scope(scope).await?;
            if current.iter().all(|l| guard.covers(&l.key)) {
                return Ok((guard, current));
            }
            tracing::debug!(
                "Scope {} gained variants while locking (attempt {})",
                scope,
                attempt
            );
            drop(guard);
            lines = current;
        }
        Err(AppError::ConcurrentModification(format!(
            "variants of {} kept changing during reconciliation",
            scope
        )))
    }
}
