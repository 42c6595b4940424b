//! Order status projection service

use std::sync::Arc;

use shared::OrderStatus;
use uuid::Uuid;

use crate::error::AppResult;
use crate::store::AllocationStore;

/// Recomputes and persists order statuses from line allocation state
#[derive(Clone)]
pub struct OrderStateProjector {
    store: Arc<dyn AllocationStore>,
}

impl OrderStateProjector {
    pub fn new(store: Arc<dyn AllocationStore>) -> Self {
        Self { store }
    }

    /// Project one order. The store reads the lines and writes the status
    /// in one step, so a cancel or final shipment committed meanwhile is
    /// never overwritten.
    pub async fn project(&self, order_id: Uuid) -> AppResult<OrderStatus> {
        let (previous, status) = self.store.project_order(order_id).await?;
        if status != previous {
            tracing::debug!("Order {} moved {} -> {}", order_id, previous, status);
        }
        Ok(status)
    }

    /// Project several orders, in the given order
    pub async fn project_many(&self, order_ids: &[Uuid]) -> AppResult<Vec<(Uuid, OrderStatus)>> {
        let mut statuses = Vec::with_capacity(order_ids.len());
        for order_id in order_ids {
            statuses.push((*order_id, self.project(*order_id).await?));
        }
        Ok(statuses)
    }

    /// Bring orders up to date after a run failed part way. Projection
    /// errors are only logged; the caller returns the original failure.
    pub async fn project_after_failure(&self, order_ids: &[Uuid]) {
        for order_id in order_ids {
            if let Err(err) = self.project(*order_id).await {
                tracing::error!(
                    "Could not project order {} after a failed run: {}",
                    order_id,
                    err
                );
            }
        }
    }
}
