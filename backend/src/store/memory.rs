//! In-memory allocation store
//!
//! Holds the whole ledger behind one async mutex, so every call is atomic
//! in the same sense a Postgres transaction is. Used by the test suites and
//! for running the engine without a database.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use shared::{
    next_status, order_total_amount, AdjustmentReason, Customer, Demand, MovementEffect,
    MovementType, Order, OrderLine, OrderStatus, Reference, StockMovement, StockVariant, UserType,
    VariantKey,
};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{AllocationScope, AllocationStore, Release, Shipment};
use crate::error::{AppError, AppResult};

#[derive(Default)]
struct MemoryState {
    variants: BTreeMap<VariantKey, StockVariant>,
    movements: Vec<StockMovement>,
    customers: HashMap<Uuid, Customer>,
    orders: HashMap<Uuid, Order>,
    lines: HashMap<Uuid, OrderLine>,
}

/// Ledger and orders kept in process memory
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    injected_conflicts: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a customer
    pub async fn add_customer(&self, user_type: UserType, priority_level: i32) -> Customer {
        let customer = Customer {
            id: Uuid::new_v4(),
            user_type,
            priority_level,
        };
        let mut state = self.state.lock().await;
        state.customers.insert(customer.id, customer.clone());
        customer
    }

    /// Record an order as order intake would; lines start unallocated
    pub async fn add_order(
        &self,
        customer_id: Uuid,
        created_at: DateTime<Utc>,
        lines: &[(VariantKey, i32, Decimal)],
    ) -> AppResult<(Order, Vec<OrderLine>)> {
        let mut state = self.state.lock().await;
        let customer = state
            .customers
            .get(&customer_id)
            .cloned()
            .ok_or_else(|| AppError::NotFound("Customer".to_string()))?;

        let order = Order {
            id: Uuid::new_v4(),
            customer_id,
            user_type: customer.user_type,
            customer_priority: customer.priority_level,
            status: OrderStatus::Pending,
            created_at,
        };
        let mut created = Vec::with_capacity(lines.len());
        for (key, quantity, unit_price) in lines {
            if *quantity <= 0 {
                return Err(AppError::validation(
                    "quantity",
                    "Ordered quantity must be positive",
                    "주문 수량은 0보다 커야 합니다",
                ));
            }
            created.push(OrderLine {
                id: Uuid::new_v4(),
                order_id: order.id,
                key: key.clone(),
                ordered_quantity: *quantity,
                allocated_quantity: 0,
                shipped_quantity: 0,
                unit_price: *unit_price,
            });
        }
        state.orders.insert(order.id, order.clone());
        for line in &created {
            state.lines.insert(line.id, line.clone());
        }
        Ok((order, created))
    }

    /// Overwrite allocated stock without a movement, the way a lost update would
    pub async fn force_allocated(&self, key: &VariantKey, allocated: i32) -> AppResult<()> {
        let mut state = self.state.lock().await;
        let variant = state
            .variants
            .get_mut(key)
            .ok_or_else(|| AppError::NotFound("Stock variant".to_string()))?;
        variant.allocated_stock = allocated;
        Ok(())
    }

    /// Make the next `count` line allocations fail as lost races
    pub fn inject_conflicts(&self, count: u32) {
        self.injected_conflicts.store(count, Ordering::SeqCst);
    }

    fn take_injected_conflict(&self) -> bool {
        self.injected_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl MemoryState {
    fn is_open(&self, order_id: Uuid) -> bool {
        self.orders
            .get(&order_id)
            .map(|o| !o.status.is_terminal())
            .unwrap_or(false)
    }

    fn record(
        &mut self,
        key: &VariantKey,
        delta: i32,
        movement_type: MovementType,
        affects: MovementEffect,
        reference: Option<Reference>,
        notes: Option<String>,
    ) -> StockMovement {
        let movement = StockMovement {
            id: Uuid::new_v4(),
            product_id: key.product_id,
            color: key.color.clone(),
            size: key.size.clone(),
            quantity_delta: delta,
            movement_type,
            affects,
            reference_type: reference.map(|r| r.reference_type),
            reference_id: reference.map(|r| r.reference_id),
            notes,
            created_at: Utc::now(),
        };
        self.movements.push(movement.clone());
        movement
    }

    fn reserve_variant(&mut self, key: &VariantKey, quantity: i32) -> AppResult<()> {
        let variant = match self.variants.get_mut(key) {
            Some(v) => v,
            None => {
                return Err(AppError::InsufficientAvailableStock {
                    variant: key.to_string(),
                    available: 0,
                    requested: quantity,
                })
            }
        };
        if variant.is_blocked {
            return Err(AppError::LedgerInconsistency {
                variant: key.to_string(),
                reason: variant
                    .blocked_reason
                    .clone()
                    .unwrap_or_else(|| "variant is blocked".to_string()),
            });
        }
        if variant.available_stock() < quantity {
            return Err(AppError::InsufficientAvailableStock {
                variant: key.to_string(),
                available: variant.available_stock().max(0),
                requested: quantity,
            });
        }
        variant.allocated_stock += quantity;
        touch(variant);
        Ok(())
    }

    /// Returns the amount actually released
    fn release_variant(&mut self, key: &VariantKey, quantity: i32) -> i32 {
        match self.variants.get_mut(key) {
            Some(variant) => {
                let released = quantity.min(variant.allocated_stock).max(0);
                if released > 0 {
                    variant.allocated_stock -= released;
                    touch(variant);
                }
                released
            }
            None => 0,
        }
    }

    fn demand_for(&self, line: &OrderLine) -> Option<Demand> {
        let order = self.orders.get(&line.order_id)?;
        let order_lines: Vec<OrderLine> = self
            .lines
            .values()
            .filter(|l| l.order_id == order.id)
            .cloned()
            .collect();
        Some(Demand {
            order_line_id: line.id,
            order_id: order.id,
            order_created_at: order.created_at,
            customer_priority: order.customer_priority,
            user_type_rank: order.user_type.rank(),
            order_total_amount: order_total_amount(&order_lines),
            needed_quantity: line.needed_quantity(),
        })
    }

    fn sorted_lines<'a>(&'a self, lines: impl Iterator<Item = &'a OrderLine>) -> Vec<OrderLine> {
        let mut out: Vec<OrderLine> = lines.cloned().collect();
        out.sort_by(|a, b| {
            let ca = self.orders.get(&a.order_id).map(|o| o.created_at);
            let cb = self.orders.get(&b.order_id).map(|o| o.created_at);
            ca.cmp(&cb)
                .then_with(|| a.order_id.cmp(&b.order_id))
                .then_with(|| a.id.cmp(&b.id))
        });
        out
    }
}

fn touch(variant: &mut StockVariant) {
    variant.version += 1;
    variant.updated_at = Utc::now();
}

fn new_variant(key: &VariantKey) -> StockVariant {
    StockVariant {
        id: Uuid::new_v4(),
        key: key.clone(),
        physical_stock: 0,
        allocated_stock: 0,
        is_blocked: false,
        blocked_reason: None,
        version: 0,
        updated_at: Utc::now(),
    }
}

#[async_trait]
impl AllocationStore for MemoryStore {
    async fn get_variant(&self, key: &VariantKey) -> AppResult<Option<StockVariant>> {
        let state = self.state.lock().await;
        Ok(state.variants.get(key).cloned())
    }

    async fn list_variants(&self, product_id: Uuid) -> AppResult<Vec<StockVariant>> {
        let state = self.state.lock().await;
        Ok(state
            .variants
            .values()
            .filter(|v| v.key.product_id == product_id)
            .cloned()
            .collect())
    }

    async fn define_variant(
        &self,
        key: &VariantKey,
        initial_stock: i32,
    ) -> AppResult<StockVariant> {
        let mut state = self.state.lock().await;
        if state.variants.contains_key(key) {
            return Err(AppError::Conflict {
                resource: "stock_variant".to_string(),
                message: format!("Stock variant {} already exists", key),
                message_ko: format!("이미 등록된 옵션입니다: {}", key),
            });
        }
        let mut variant = new_variant(key);
        variant.physical_stock = initial_stock;
        state.variants.insert(key.clone(), variant.clone());
        if initial_stock > 0 {
            state.record(
                key,
                initial_stock,
                MovementType::InitialStock,
                MovementEffect::Physical,
                None,
                Some("initial stock".to_string()),
            );
        }
        Ok(variant)
    }

    async fn adjust_physical(
        &self,
        key: &VariantKey,
        delta: i32,
        reason: &AdjustmentReason,
    ) -> AppResult<StockMovement> {
        let mut state = self.state.lock().await;
        let (physical, allocated) = state
            .variants
            .get(key)
            .map(|v| (v.physical_stock, v.allocated_stock))
            .unwrap_or((0, 0));
        let new_physical = physical + delta;
        if new_physical < 0 || new_physical < allocated {
            return Err(AppError::InsufficientPhysicalStock {
                variant: key.to_string(),
                physical,
                allocated,
                delta,
            });
        }
        let variant = state
            .variants
            .entry(key.clone())
            .or_insert_with(|| new_variant(key));
        variant.physical_stock = new_physical;
        touch(variant);
        Ok(state.record(
            key,
            delta,
            reason.movement_type,
            MovementEffect::Physical,
            reason.reference,
            reason.notes.clone(),
        ))
    }

    async fn reserve(
        &self,
        key: &VariantKey,
        quantity: i32,
        reference: Option<Reference>,
    ) -> AppResult<StockMovement> {
        let mut state = self.state.lock().await;
        state.reserve_variant(key, quantity)?;
        Ok(state.record(
            key,
            -quantity,
            MovementType::OrderAllocation,
            MovementEffect::Allocated,
            reference,
            None,
        ))
    }

    async fn release(
        &self,
        key: &VariantKey,
        quantity: i32,
        reference: Option<Reference>,
    ) -> AppResult<Release> {
        let mut state = self.state.lock().await;
        let released = state.release_variant(key, quantity);
        let movement = (released > 0).then(|| {
            state.record(
                key,
                released,
                MovementType::OrderAllocation,
                MovementEffect::Allocated,
                reference,
                Some("release".to_string()),
            )
        });
        Ok(Release {
            requested: quantity,
            released,
            movement,
        })
    }

    async fn correct_allocated(
        &self,
        key: &VariantKey,
        expected: i32,
        notes: &str,
    ) -> AppResult<Option<StockMovement>> {
        let mut state = self.state.lock().await;
        let variant = state
            .variants
            .get_mut(key)
            .ok_or_else(|| AppError::NotFound("Stock variant".to_string()))?;
        let recorded = variant.allocated_stock;
        variant.is_blocked = false;
        variant.blocked_reason = None;
        if recorded == expected {
            return Ok(None);
        }
        variant.allocated_stock = expected;
        touch(variant);
        Ok(Some(state.record(
            key,
            recorded - expected,
            MovementType::OrderAllocation,
            MovementEffect::Allocated,
            None,
            Some(notes.to_string()),
        )))
    }

    async fn set_blocked(&self, key: &VariantKey, reason: Option<String>) -> AppResult<()> {
        let mut state = self.state.lock().await;
        if let Some(variant) = state.variants.get_mut(key) {
            variant.is_blocked = reason.is_some();
            variant.blocked_reason = reason;
            touch(variant);
        }
        Ok(())
    }

    async fn outstanding_reservations(&self, key: &VariantKey) -> AppResult<i32> {
        let state = self.state.lock().await;
        Ok(state
            .lines
            .values()
            .filter(|l| &l.key == key)
            .map(OrderLine::outstanding_reservation)
            .sum())
    }

    async fn allocate_line(&self, order_line_id: Uuid, quantity: i32) -> AppResult<StockMovement> {
        if self.take_injected_conflict() {
            return Err(AppError::ConcurrentModification(format!(
                "order line {} was modified concurrently",
                order_line_id
            )));
        }
        let mut state = self.state.lock().await;
        let line = state
            .lines
            .get(&order_line_id)
            .cloned()
            .ok_or_else(|| AppError::NotFound("Order line".to_string()))?;
        if !state.is_open(line.order_id) {
            return Err(AppError::InvalidStateTransition(format!(
                "order {} is closed",
                line.order_id
            )));
        }
        if line.allocated_quantity + quantity > line.ordered_quantity {
            return Err(AppError::InvalidStateTransition(format!(
                "order line {} needs only {} more",
                line.id,
                line.needed_quantity()
            )));
        }
        state.reserve_variant(&line.key, quantity)?;
        if let Some(stored) = state.lines.get_mut(&order_line_id) {
            stored.allocated_quantity += quantity;
        }
        Ok(state.record(
            &line.key,
            -quantity,
            MovementType::OrderAllocation,
            MovementEffect::Allocated,
            Some(Reference::order(line.order_id)),
            Some(format!("allocated to line {}", line.id)),
        ))
    }

    async fn release_line(&self, order_line_id: Uuid, notes: &str) -> AppResult<Option<Release>> {
        let mut state = self.state.lock().await;
        let line = state
            .lines
            .get(&order_line_id)
            .cloned()
            .ok_or_else(|| AppError::NotFound("Order line".to_string()))?;
        let outstanding = line.outstanding_reservation();
        if outstanding == 0 {
            return Ok(None);
        }
        if let Some(stored) = state.lines.get_mut(&order_line_id) {
            stored.allocated_quantity = stored.shipped_quantity;
        }
        let released = state.release_variant(&line.key, outstanding);
        let movement = (released > 0).then(|| {
            state.record(
                &line.key,
                released,
                MovementType::OrderAllocation,
                MovementEffect::Allocated,
                Some(Reference::order(line.order_id)),
                Some(notes.to_string()),
            )
        });
        Ok(Some(Release {
            requested: outstanding,
            released,
            movement,
        }))
    }

    async fn ship_line(
        &self,
        order_line_id: Uuid,
        quantity: i32,
        reference: Option<Reference>,
    ) -> AppResult<Shipment> {
        let mut state = self.state.lock().await;
        let line = state
            .lines
            .get(&order_line_id)
            .cloned()
            .ok_or_else(|| AppError::NotFound("Order line".to_string()))?;
        if !state.is_open(line.order_id) {
            return Err(AppError::InvalidStateTransition(format!(
                "order {} is closed",
                line.order_id
            )));
        }
        if quantity > line.outstanding_reservation() {
            return Err(AppError::InvalidStateTransition(format!(
                "order line {} has only {} reserved units to ship",
                line.id,
                line.outstanding_reservation()
            )));
        }
        let variant = state.variants.get_mut(&line.key).ok_or_else(|| {
            AppError::LedgerInconsistency {
                variant: line.key.to_string(),
                reason: "reserved line has no stock variant".to_string(),
            }
        })?;
        if variant.allocated_stock < quantity || variant.physical_stock < quantity {
            return Err(AppError::LedgerInconsistency {
                variant: line.key.to_string(),
                reason: format!(
                    "cannot ship {} units: physical {}, allocated {}",
                    quantity, variant.physical_stock, variant.allocated_stock
                ),
            });
        }
        variant.physical_stock -= quantity;
        variant.allocated_stock -= quantity;
        touch(variant);
        if let Some(stored) = state.lines.get_mut(&order_line_id) {
            stored.shipped_quantity += quantity;
        }

        let reference = reference.or(Some(Reference::order(line.order_id)));
        let movement = state.record(
            &line.key,
            -quantity,
            MovementType::OrderShipment,
            MovementEffect::Both,
            reference,
            Some(format!("shipped from line {}", line.id)),
        );

        let order_completed = state
            .lines
            .values()
            .filter(|l| l.order_id == line.order_id)
            .all(OrderLine::is_fully_shipped);
        if order_completed {
            if let Some(order) = state.orders.get_mut(&line.order_id) {
                order.status = OrderStatus::Shipped;
            }
        }

        Ok(Shipment {
            order_line_id,
            order_id: line.order_id,
            shipped_quantity: quantity,
            movement,
            order_completed,
        })
    }

    async fn pending_demands(
        &self,
        key: &VariantKey,
        scope: &AllocationScope,
    ) -> AppResult<Vec<Demand>> {
        let state = self.state.lock().await;
        let candidates = state.lines.values().filter(|l| {
            &l.key == key
                && l.needed_quantity() > 0
                && state
                    .orders
                    .get(&l.order_id)
                    .map(|o| !o.status.is_terminal() && scope.matches(o, l))
                    .unwrap_or(false)
        });
        Ok(state
            .sorted_lines(candidates)
            .iter()
            .filter_map(|l| state.demand_for(l))
            .collect())
    }

    async fn lines_in_scope(&self, scope: &AllocationScope) -> AppResult<Vec<OrderLine>> {
        let state = self.state.lock().await;
        let candidates = state.lines.values().filter(|l| {
            state
                .orders
                .get(&l.order_id)
                .map(|o| !o.status.is_terminal() && scope.matches(o, l))
                .unwrap_or(false)
        });
        Ok(state.sorted_lines(candidates))
    }

    async fn get_line(&self, order_line_id: Uuid) -> AppResult<Option<OrderLine>> {
        let state = self.state.lock().await;
        Ok(state.lines.get(&order_line_id).cloned())
    }

    async fn get_order(&self, order_id: Uuid) -> AppResult<Option<Order>> {
        let state = self.state.lock().await;
        Ok(state.orders.get(&order_id).cloned())
    }

    async fn order_lines(&self, order_id: Uuid) -> AppResult<Vec<OrderLine>> {
        let state = self.state.lock().await;
        let mut lines: Vec<OrderLine> = state
            .lines
            .values()
            .filter(|l| l.order_id == order_id)
            .cloned()
            .collect();
        lines.sort_by_key(|l| l.id);
        Ok(lines)
    }

    async fn orders_in_scope(&self, scope: &AllocationScope) -> AppResult<Vec<Order>> {
        let state = self.state.lock().await;
        let mut orders: Vec<Order> = state
            .orders
            .values()
            .filter(|o| {
                !o.status.is_terminal()
                    && state
                        .lines
                        .values()
                        .any(|l| l.order_id == o.id && scope.matches(o, l))
            })
            .cloned()
            .collect();
        orders.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(orders)
    }

    async fn set_order_status(&self, order_id: Uuid, status: OrderStatus) -> AppResult<bool> {
        let mut state = self.state.lock().await;
        let order = state
            .orders
            .get_mut(&order_id)
            .ok_or_else(|| AppError::NotFound("Order".to_string()))?;
        if order.status == status {
            return Ok(false);
        }
        if order.status.is_terminal() {
            return Err(AppError::InvalidStateTransition(format!(
                "order {} is already {}",
                order_id, order.status
            )));
        }
        order.status = status;
        Ok(true)
    }

    async fn project_order(&self, order_id: Uuid) -> AppResult<(OrderStatus, OrderStatus)> {
        let mut state = self.state.lock().await;
        let previous = state
            .orders
            .get(&order_id)
            .map(|o| o.status)
            .ok_or_else(|| AppError::NotFound("Order".to_string()))?;
        let lines: Vec<OrderLine> = state
            .lines
            .values()
            .filter(|l| l.order_id == order_id)
            .cloned()
            .collect();
        let projected = next_status(previous, &lines);
        if let Some(order) = state.orders.get_mut(&order_id) {
            order.status = projected;
        }
        Ok((previous, projected))
    }

    async fn movements(&self, key: &VariantKey) -> AppResult<Vec<StockMovement>> {
        let state = self.state.lock().await;
        Ok(state
            .movements
            .iter()
            .filter(|m| &m.key() == key)
            .cloned()
            .collect())
    }

    async fn product_movements(&self, product_id: Uuid) -> AppResult<Vec<StockMovement>> {
        let state = self.state.lock().await;
        Ok(state
            .movements
            .iter()
            .filter(|m| m.product_id == product_id)
            .cloned()
            .collect())
    }
}
