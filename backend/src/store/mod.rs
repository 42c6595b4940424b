//! Persistence seam for the allocation engine
//!
//! Every mutating method is one atomic unit: it either commits the counter
//! change, the order line change and the movement record together, or
//! nothing at all. Postgres implements this with a transaction per call; the
//! in-memory store holds a single lock for the duration of the call.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use shared::{
    AdjustmentReason, Demand, Order, OrderLine, OrderStatus, Reference, StockMovement,
    StockVariant, VariantKey,
};
use uuid::Uuid;

use crate::error::AppResult;

pub use memory::MemoryStore;
pub use postgres::PgAllocationStore;

/// Which orders a reconciliation or scoped allocation run covers.
///
/// Only open (non-terminal) orders are ever in scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AllocationScope {
    /// Every open order
    All,
    /// Lines of one product
    Product { product_id: Uuid },
    /// Orders created in `[from, to)`
    CreatedBetween {
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    },
}

impl AllocationScope {
    /// Orders created on `date` in the business time zone
    pub fn day(date: NaiveDate, offset: FixedOffset) -> Self {
        let start = date.and_hms_opt(0, 0, 0).unwrap_or_default();
        let from = offset
            .from_local_datetime(&start)
            .single()
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|| Utc.from_utc_datetime(&start));
        Self::CreatedBetween {
            from,
            to: from + chrono::Duration::days(1),
        }
    }

    pub fn product_id(&self) -> Option<Uuid> {
        match self {
            AllocationScope::Product { product_id } => Some(*product_id),
            _ => None,
        }
    }

    pub fn window(&self) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
        match self {
            AllocationScope::CreatedBetween { from, to } => (Some(*from), Some(*to)),
            _ => (None, None),
        }
    }

    /// Whether a line of an open order falls in this scope
    pub fn matches(&self, order: &Order, line: &OrderLine) -> bool {
        match self {
            AllocationScope::All => true,
            AllocationScope::Product { product_id } => line.key.product_id == *product_id,
            AllocationScope::CreatedBetween { from, to } => {
                order.created_at >= *from && order.created_at < *to
            }
        }
    }
}

impl std::fmt::Display for AllocationScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AllocationScope::All => write!(f, "all open orders"),
            AllocationScope::Product { product_id } => write!(f, "product {}", product_id),
            AllocationScope::CreatedBetween { from, to } => {
                write!(f, "orders created {} .. {}", from, to)
            }
        }
    }
}

/// Outcome of releasing reserved stock
#[derive(Debug, Clone, Serialize)]
pub struct Release {
    pub requested: i32,
    pub released: i32,
    /// None when nothing was allocated, so no counter changed
    pub movement: Option<StockMovement>,
}

impl Release {
    /// True when more was asked for than was allocated
    pub fn was_floored(&self) -> bool {
        self.released < self.requested
    }
}

/// Outcome of shipping reserved units of one line
#[derive(Debug, Clone, Serialize)]
pub struct Shipment {
    pub order_line_id: Uuid,
    pub order_id: Uuid,
    pub shipped_quantity: i32,
    pub movement: StockMovement,
    /// The order moved to `shipped` with this shipment
    pub order_completed: bool,
}

/// Storage operations the engine is built on
#[async_trait]
pub trait AllocationStore: Send + Sync {
    // ========== Stock variants ==========

    /// Get a variant by key
    async fn get_variant(&self, key: &VariantKey) -> AppResult<Option<StockVariant>>;

    /// List all variants of a product
    async fn list_variants(&self, product_id: Uuid) -> AppResult<Vec<StockVariant>>;

    /// Create a variant, recording an `initial_stock` movement when stock is given
    async fn define_variant(&self, key: &VariantKey, initial_stock: i32) -> AppResult<StockVariant>;

    /// Add `delta` to physical stock. Never lets physical fall below zero or
    /// below the allocated amount. Creates the variant for a positive delta.
    async fn adjust_physical(
        &self,
        key: &VariantKey,
        delta: i32,
        reason: &AdjustmentReason,
    ) -> AppResult<StockMovement>;

    /// Conditionally raise allocated stock when enough is available
    async fn reserve(
        &self,
        key: &VariantKey,
        quantity: i32,
        reference: Option<Reference>,
    ) -> AppResult<StockMovement>;

    /// Lower allocated stock, flooring at zero
    async fn release(
        &self,
        key: &VariantKey,
        quantity: i32,
        reference: Option<Reference>,
    ) -> AppResult<Release>;

    /// Overwrite allocated stock with `expected`, recording a correction
    /// movement and clearing the blocked flag
    async fn correct_allocated(
        &self,
        key: &VariantKey,
        expected: i32,
        notes: &str,
    ) -> AppResult<Option<StockMovement>>;

    /// Block (Some) or unblock (None) a variant
    async fn set_blocked(&self, key: &VariantKey, reason: Option<String>) -> AppResult<()>;

    /// Sum of `allocated - shipped` over every line of the variant
    async fn outstanding_reservations(&self, key: &VariantKey) -> AppResult<i32>;

    // ========== Order lines ==========

    /// Reserve stock and raise the line's allocated quantity in one unit
    async fn allocate_line(&self, order_line_id: Uuid, quantity: i32) -> AppResult<StockMovement>;

    /// Release the line's outstanding reservation and reset its allocation
    /// to what was already shipped
    async fn release_line(&self, order_line_id: Uuid, notes: &str) -> AppResult<Option<Release>>;

    /// Turn reserved units into a physical decrement
    async fn ship_line(
        &self,
        order_line_id: Uuid,
        quantity: i32,
        reference: Option<Reference>,
    ) -> AppResult<Shipment>;

    /// Lines of open orders still needing stock for this variant, with order metadata
    async fn pending_demands(
        &self,
        key: &VariantKey,
        scope: &AllocationScope,
    ) -> AppResult<Vec<Demand>>;

    /// Lines of open orders in scope, ordered by order creation time
    async fn lines_in_scope(&self, scope: &AllocationScope) -> AppResult<Vec<OrderLine>>;

    async fn get_line(&self, order_line_id: Uuid) -> AppResult<Option<OrderLine>>;

    // ========== Orders ==========

    async fn get_order(&self, order_id: Uuid) -> AppResult<Option<Order>>;

    async fn order_lines(&self, order_id: Uuid) -> AppResult<Vec<OrderLine>>;

    /// Open orders with at least one line in scope, oldest first
    async fn orders_in_scope(&self, scope: &AllocationScope) -> AppResult<Vec<Order>>;

    /// Persist a status on an open order; returns false when it was already
    /// set. A shipped or cancelled order rejects any other status with
    /// `InvalidStateTransition`.
    async fn set_order_status(&self, order_id: Uuid, status: OrderStatus) -> AppResult<bool>;

    /// Recompute an order's status from its lines and persist it in one
    /// atomic step. Returns `(previous, projected)`; terminal orders come
    /// back unchanged.
    async fn project_order(&self, order_id: Uuid) -> AppResult<(OrderStatus, OrderStatus)>;

    // ========== Movements ==========

    /// Movement history of a variant, oldest first
    async fn movements(&self, key: &VariantKey) -> AppResult<Vec<StockMovement>>;

    /// Movement history of every variant of a product, oldest first
    async fn product_movements(&self, product_id: Uuid) -> AppResult<Vec<StockMovement>>;
}
