//! Stock ledger service: physical, allocated and available numbers per variant

use std::sync::Arc;

use serde::Serialize;
use shared::{
    replay_physical, validate_adjustment, validate_quantity, AdjustmentReason, Reference,
    StockMovement, StockVariant, VariantKey, MAX_QUANTITY,
};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::store::{AllocationStore, Release};

/// Ledger operations with validation and invariant checks on top of the store
#[derive(Clone)]
pub struct StockLedger {
    store: Arc<dyn AllocationStore>,
}

/// Result of checking one variant against its order lines and movement log
#[derive(Debug, Clone, Serialize)]
pub struct VariantAudit {
    pub key: VariantKey,
    pub physical_stock: i32,
    pub allocated_stock: i32,
    pub available_stock: i32,
    /// Sum of `allocated - shipped` over the variant's order lines
    pub outstanding_reservations: i32,
    /// Physical stock rebuilt from the movement log
    pub replayed_physical: i32,
    pub violation: Option<String>,
    pub is_blocked: bool,
}

impl VariantAudit {
    pub fn is_consistent(&self) -> bool {
        self.violation.is_none() && self.replayed_physical == self.physical_stock
    }
}

/// Current numbers of one variant as exposed to callers
#[derive(Debug, Clone, Serialize)]
pub struct VariantStock {
    #[serde(flatten)]
    pub variant: StockVariant,
    pub available_stock: i32,
}

impl From<StockVariant> for VariantStock {
    fn from(variant: StockVariant) -> Self {
        let available_stock = variant.available_stock();
        Self {
            variant,
            available_stock,
        }
    }
}

impl StockLedger {
    pub fn new(store: Arc<dyn AllocationStore>) -> Self {
        Self { store }
    }

    /// Get a variant, failing on a missing one
    pub async fn get_variant(&self, key: &VariantKey) -> AppResult<StockVariant> {
        self.store
            .get_variant(key)
            .await?
            .ok_or_else(|| AppError::NotFound("Stock variant".to_string()))
    }

    /// `physical - allocated`; a variant never stocked has 0 available.
    ///
    /// A corrupt variant is blocked and reported instead of being clamped.
    pub async fn get_available(&self, key: &VariantKey) -> AppResult<i32> {
        let variant = match self.store.get_variant(key).await? {
            Some(v) => v,
            None => return Ok(0),
        };
        if let Err(violation) = variant.check_invariants() {
            tracing::error!("Ledger violation on {}: {}", key, violation);
            self.store
                .set_blocked(key, Some(violation.to_string()))
                .await?;
            return Err(AppError::LedgerInconsistency {
                variant: key.to_string(),
                reason: violation.to_string(),
            });
        }
        Ok(variant.available_stock())
    }

    /// List variants of a product with derived availability
    pub async fn list_variants(&self, product_id: Uuid) -> AppResult<Vec<VariantStock>> {
        let variants = self.store.list_variants(product_id).await?;
        Ok(variants.into_iter().map(VariantStock::from).collect())
    }

    /// Register a variant with its opening stock
    pub async fn define_variant(
        &self,
        key: &VariantKey,
        initial_stock: i32,
    ) -> AppResult<StockVariant> {
        if !(0..=MAX_QUANTITY).contains(&initial_stock) {
            return Err(AppError::validation(
                "initial_stock",
                "Initial stock must be between 0 and 1,000,000",
                "초기 재고는 0 이상 1,000,000 이하이어야 합니다",
            ));
        }
        let variant = self.store.define_variant(key, initial_stock).await?;
        tracing::info!("Defined stock variant {} with {} units", key, initial_stock);
        Ok(variant)
    }

    /// Apply a physical stock change and append its movement
    pub async fn adjust_physical(
        &self,
        key: &VariantKey,
        delta: i32,
        reason: &AdjustmentReason,
    ) -> AppResult<StockMovement> {
        validate_adjustment(delta, reason.movement_type).map_err(|msg| {
            AppError::validation("quantity_delta", msg, "재고 조정 수량이 올바르지 않습니다")
        })?;

        let movement = self.store.adjust_physical(key, delta, reason).await?;
        tracing::info!(
            "Physical stock of {} changed by {} ({})",
            key,
            delta,
            reason.movement_type.as_str()
        );
        Ok(movement)
    }

    /// Reserve stock without tying it to an order line
    pub async fn reserve(
        &self,
        key: &VariantKey,
        quantity: i32,
        reference: Option<Reference>,
    ) -> AppResult<StockMovement> {
        validate_quantity(quantity)
            .map_err(|msg| AppError::validation("quantity", msg, "수량이 올바르지 않습니다"))?;
        self.store.reserve(key, quantity, reference).await
    }

    /// Release reserved stock, flooring at zero
    pub async fn release(
        &self,
        key: &VariantKey,
        quantity: i32,
        reference: Option<Reference>,
    ) -> AppResult<Release> {
        validate_quantity(quantity)
            .map_err(|msg| AppError::validation("quantity", msg, "수량이 올바르지 않습니다"))?;
        let release = self.store.release(key, quantity, reference).await?;
        if release.was_floored() {
            tracing::warn!(
                "Over-release on {}: requested {}, only {} was allocated",
                key,
                release.requested,
                release.released
            );
        }
        Ok(release)
    }

    pub async fn movements(&self, key: &VariantKey) -> AppResult<Vec<StockMovement>> {
        self.store.movements(key).await
    }

    pub async fn product_movements(&self, product_id: Uuid) -> AppResult<Vec<StockMovement>> {
        self.store.product_movements(product_id).await
    }

    /// Physical stock rebuilt from the movement log
    pub async fn replay_physical(&self, key: &VariantKey) -> AppResult<i32> {
        let movements = self.store.movements(key).await?;
        Ok(replay_physical(&movements))
    }

    /// Check counters against order lines and the movement log.
    ///
    /// A failed invariant blocks the variant until reconciliation repairs it.
    pub async fn audit(&self, key: &VariantKey) -> AppResult<VariantAudit> {
        let variant = self.get_variant(key).await?;
        let outstanding = self.store.outstanding_reservations(key).await?;
        let replayed_physical = self.replay_physical(key).await?;

        let violation = variant
            .check_against_lines(outstanding)
            .err()
            .map(|v| v.to_string());

        let mut is_blocked = variant.is_blocked;
        if let Some(reason) = &violation {
            tracing::error!("Audit failed for {}: {}", key, reason);
            if !is_blocked {
                self.store.set_blocked(key, Some(reason.clone())).await?;
                is_blocked = true;
            }
        }
        if replayed_physical != variant.physical_stock {
            tracing::warn!(
                "Movement log of {} replays to {} but physical stock is {}",
                key,
                replayed_physical,
                variant.physical_stock
            );
        }

        Ok(VariantAudit {
            key: key.clone(),
            physical_stock: variant.physical_stock,
            allocated_stock: variant.allocated_stock,
            available_stock: variant.available_stock(),
            outstanding_reservations: outstanding,
            replayed_physical,
            violation,
            is_blocked,
        })
    }

    /// Audit every variant of a product
    pub async fn audit_product(&self, product_id: Uuid) -> AppResult<Vec<VariantAudit>> {
        let variants = self.store.list_variants(product_id).await?;
        let mut audits = Vec::with_capacity(variants.len());
        for variant in variants {
            audits.push(self.audit(&variant.key).await?);
        }
        Ok(audits)
    }
}
