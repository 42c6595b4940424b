//! Allocator: applies a policy to one variant's pending demands
//!
//! Each grant is its own atomic unit (reserve + line update + movement), so a
//! run that stops half way leaves only fully applied grants behind. Re-running
//! is safe because demands are read as `allocated < ordered`.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use shared::{AllocationPolicy, Grant, VariantKey};
use uuid::Uuid;

use super::locks::VariantLocks;
use super::projector::OrderStateProjector;
use crate::config::AllocationSettings;
use crate::error::{AppError, AppResult};
use crate::store::{AllocationScope, AllocationStore};

/// Allocation runs over single variants
#[derive(Clone)]
pub struct Allocator {
    store: Arc<dyn AllocationStore>,
    locks: VariantLocks,
    projector: OrderStateProjector,
    settings: AllocationSettings,
}

/// A planned grant that could not be applied
#[derive(Debug, Clone, Serialize)]
pub struct SkippedGrant {
    pub order_line_id: Uuid,
    pub order_id: Uuid,
    pub requested: i32,
    pub code: &'static str,
    pub reason: String,
}

/// Report of one allocator run
#[derive(Debug, Clone, Serialize)]
pub struct AllocationRun {
    pub key: VariantKey,
    pub policy: AllocationPolicy,
    pub available_before: i32,
    pub grants: Vec<Grant>,
    pub granted_total: i32,
    pub skipped: Vec<SkippedGrant>,
    /// Lines still short after this run
    pub unmet: Vec<Uuid>,
    /// Orders with at least one applied grant
    pub touched_orders: Vec<Uuid>,
}

impl AllocationRun {
    fn empty(key: &VariantKey, policy: AllocationPolicy, available_before: i32) -> Self {
        Self {
            key: key.clone(),
            policy,
            available_before,
            grants: Vec::new(),
            granted_total: 0,
            skipped: Vec::new(),
            unmet: Vec::new(),
            touched_orders: Vec::new(),
        }
    }
}

impl Allocator {
    pub fn new(
        store: Arc<dyn AllocationStore>,
        locks: VariantLocks,
        projector: OrderStateProjector,
        settings: AllocationSettings,
    ) -> Self {
        Self {
            store,
            locks,
            projector,
            settings,
        }
    }

    /// Run the allocator for one variant under its lock
    pub async fn allocate(
        &self,
        key: &VariantKey,
        policy: AllocationPolicy,
        scope: &AllocationScope,
    ) -> AppResult<AllocationRun> {
        let _guard = self.locks.acquire(key).await;
        self.allocate_locked(key, policy, scope).await
    }

    /// Run the allocator for a variant whose lock the caller already holds
    pub async fn allocate_locked(
        &self,
        key: &VariantKey,
        policy: AllocationPolicy,
        scope: &AllocationScope,
    ) -> AppResult<AllocationRun> {
        let available = match self.store.get_variant(key).await? {
            Some(variant) => {
                if variant.is_blocked {
                    return Err(AppError::LedgerInconsistency {
                        variant: key.to_string(),
                        reason: variant
                            .blocked_reason
                            .unwrap_or_else(|| "variant is blocked".to_string()),
                    });
                }
                if let Err(violation) = variant.check_invariants() {
                    tracing::error!("Refusing to allocate {}: {}", key, violation);
                    self.store
                        .set_blocked(key, Some(violation.to_string()))
                        .await?;
                    return Err(AppError::LedgerInconsistency {
                        variant: key.to_string(),
                        reason: violation.to_string(),
                    });
                }
                variant.available_stock()
            }
            None => 0,
        };

        let demands = self.store.pending_demands(key, scope).await?;
        let mut run = AllocationRun::empty(key, policy, available);
        if demands.is_empty() {
            tracing::debug!("No pending demand for {}", key);
            return Ok(run);
        }

        let plan = policy.plan(&demands, available);
        let mut touched = BTreeSet::new();
        let mut short: BTreeSet<Uuid> = plan.unmet.iter().copied().collect();

        for grant in plan.grants {
            match self.apply_with_retry(&grant).await {
                Ok(_) => {
                    tracing::debug!(
                        "Granted {} of {} to line {}",
                        grant.granted_quantity,
                        key,
                        grant.order_line_id
                    );
                    touched.insert(grant.order_id);
                    run.granted_total += grant.granted_quantity;
                    run.grants.push(grant);
                }
                Err(
                    err @ (AppError::InsufficientAvailableStock { .. }
                    | AppError::InvalidStateTransition(_)),
                ) => {
                    tracing::debug!("Skipping grant to line {}: {}", grant.order_line_id, err);
                    short.insert(grant.order_line_id);
                    run.skipped.push(SkippedGrant {
                        order_line_id: grant.order_line_id,
                        order_id: grant.order_id,
                        requested: grant.granted_quantity,
                        code: err.code(),
                        reason: err.to_string(),
                    });
                }
                Err(err) => {
                    // Grants applied so far stay committed; their orders
                    // must not keep a stale status
                    if !touched.is_empty() {
                        tracing::warn!(
                            "Run on {} failed after {} grants: {}",
                            key,
                            run.grants.len(),
                            err
                        );
                        let committed: Vec<Uuid> = touched.into_iter().collect();
                        self.projector.project_after_failure(&committed).await;
                    }
                    return Err(err);
                }
            }
        }

        run.unmet = demands
            .iter()
            .map(|d| d.order_line_id)
            .filter(|id| short.contains(id))
            .collect();
        run.touched_orders = touched.into_iter().collect();

        tracing::info!(
            "Allocated {} of {} available units of {} with {} policy ({} grants, {} skipped, {} short)",
            run.granted_total,
            available,
            key,
            policy.as_str(),
            run.grants.len(),
            run.skipped.len(),
            run.unmet.len()
        );

        Ok(run)
    }

    async fn apply_with_retry(&self, grant: &Grant) -> AppResult<()> {
        let mut attempt: u32 = 0;
        loop {
            match self
                .store
                .allocate_line(grant.order_line_id, grant.granted_quantity)
                .await
            {
                Ok(_) => return Ok(()),
                Err(err) if err.is_transient() && attempt < self.settings.max_retries => {
                    attempt += 1;
                    tracing::warn!(
                        "Grant to line {} lost a race (attempt {}/{}): {}",
                        grant.order_line_id,
                        attempt,
                        self.settings.max_retries,
                        err
                    );
                    let backoff = self.settings.retry_backoff_ms * u64::from(attempt);
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
