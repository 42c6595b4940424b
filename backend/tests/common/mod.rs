//! Shared fixtures for the engine test suites

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use rust_decimal::Decimal;
use shared::{
    AdjustmentReason, Demand, Order, OrderLine, OrderStatus, Reference, StockMovement,
    StockVariant, UserType, VariantKey,
};
use uuid::Uuid;
use wholesale_allocation_backend::{
    config::AllocationSettings,
    store::{AllocationScope, AllocationStore, MemoryStore, Release, Shipment},
    AllocationEngine, AppError, AppResult,
};

pub struct Fixture {
    pub store: Arc<MemoryStore>,
    pub hooks: Arc<HookedStore>,
    pub engine: AllocationEngine,
}

pub fn settings() -> AllocationSettings {
    AllocationSettings {
        retry_backoff_ms: 1,
        ..AllocationSettings::default()
    }
}

pub fn fixture() -> Fixture {
    let store = Arc::new(MemoryStore::new());
    let hooks = Arc::new(HookedStore::new(store.clone()));
    let engine = AllocationEngine::new(hooks.clone(), settings());
    Fixture {
        store,
        hooks,
        engine,
    }
}

/// 2024-05-10 00:00 UTC plus `minutes`
pub fn at(minutes: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 10, 0, 0, 0).unwrap() + Duration::minutes(minutes)
}

pub fn won(amount: i64) -> Decimal {
    Decimal::new(amount, 0)
}

impl Fixture {
    /// A fresh single-option variant holding `stock` units
    pub async fn variant(&self, stock: i32) -> VariantKey {
        let key = VariantKey::new(Uuid::new_v4(), Some("black".to_string()), Some("M".to_string()));
        self.store.define_variant(&key, stock).await.unwrap();
        key
    }

    /// A one-line order from a fresh customer
    pub async fn order(
        &self,
        user_type: UserType,
        priority: i32,
        created_at: DateTime<Utc>,
        key: &VariantKey,
        quantity: i32,
        unit_price: Decimal,
    ) -> (Order, OrderLine) {
        let customer = self.store.add_customer(user_type, priority).await;
        let (order, mut lines) = self
            .store
            .add_order(customer.id, created_at, &[(key.clone(), quantity, unit_price)])
            .await
            .unwrap();
        (order, lines.remove(0))
    }

    /// A one-line retailer order at the default priority
    pub async fn retail_order(
        &self,
        created_at: DateTime<Utc>,
        key: &VariantKey,
        quantity: i32,
    ) -> (Order, OrderLine) {
        self.order(UserType::Retailer, 3, created_at, key, quantity, won(10_000))
            .await
    }

    pub async fn stock(&self, key: &VariantKey) -> StockVariant {
        self.store.get_variant(key).await.unwrap().unwrap()
    }

    pub async fn line(&self, id: Uuid) -> OrderLine {
        self.store.get_line(id).await.unwrap().unwrap()
    }

    pub async fn status(&self, order_id: Uuid) -> OrderStatus {
        self.store.get_order(order_id).await.unwrap().unwrap().status
    }

    /// Asserts `0 <= allocated <= physical` and `allocated == Σ outstanding`
    pub async fn assert_consistent(&self, key: &VariantKey) {
        let variant = self.stock(key).await;
        let outstanding = self.store.outstanding_reservations(key).await.unwrap();
        assert!(
            variant.check_against_lines(outstanding).is_ok(),
            "ledger of {} inconsistent: physical {}, allocated {}, outstanding {}",
            key,
            variant.physical_stock,
            variant.allocated_stock,
            outstanding
        );
    }
}

/// Memory store the engine talks to, with switches for slow projections
/// and failing grants. Idle unless a test turns a switch on.
pub struct HookedStore {
    inner: Arc<MemoryStore>,
    slow_projections: AtomicU32,
    projection_delay_ms: AtomicU32,
    grants_before_failure: AtomicU32,
    failing_grants: AtomicBool,
}

impl HookedStore {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            slow_projections: AtomicU32::new(0),
            projection_delay_ms: AtomicU32::new(0),
            grants_before_failure: AtomicU32::new(0),
            failing_grants: AtomicBool::new(false),
        }
    }

    /// Delay the next `count` projections by `delay_ms` before they run
    pub fn slow_down_projections(&self, count: u32, delay_ms: u32) {
        self.projection_delay_ms.store(delay_ms, Ordering::SeqCst);
        self.slow_projections.store(count, Ordering::SeqCst);
    }

    /// Let `successes` more grants through, then fail every later one with
    /// a concurrent modification
    pub fn fail_grants_after(&self, successes: u32) {
        self.grants_before_failure.store(successes, Ordering::SeqCst);
        self.failing_grants.store(true, Ordering::SeqCst);
    }

    fn grant_fails(&self) -> bool {
        if !self.failing_grants.load(Ordering::SeqCst) {
            return false;
        }
        self.grants_before_failure
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_err()
    }
}

#[async_trait]
impl AllocationStore for HookedStore {
    async fn get_variant(&self, key: &VariantKey) -> AppResult<Option<StockVariant>> {
        self.inner.get_variant(key).await
    }

    async fn list_variants(&self, product_id: Uuid) -> AppResult<Vec<StockVariant>> {
        self.inner.list_variants(product_id).await
    }

    async fn define_variant(
        &self,
        key: &VariantKey,
        initial_stock: i32,
    ) -> AppResult<StockVariant> {
        self.inner.define_variant(key, initial_stock).await
    }

    async fn adjust_physical(
        &self,
        key: &VariantKey,
        delta: i32,
        reason: &AdjustmentReason,
    ) -> AppResult<StockMovement> {
        self.inner.adjust_physical(key, delta, reason).await
    }

    async fn reserve(
        &self,
        key: &VariantKey,
        quantity: i32,
        reference: Option<Reference>,
    ) -> AppResult<StockMovement> {
        self.inner.reserve(key, quantity, reference).await
    }

    async fn release(
        &self,
        key: &VariantKey,
        quantity: i32,
        reference: Option<Reference>,
    ) -> AppResult<Release> {
        self.inner.release(key, quantity, reference).await
    }

    async fn correct_allocated(
        &self,
        key: &VariantKey,
        expected: i32,
        notes: &str,
    ) -> AppResult<Option<StockMovement>> {
        self.inner.correct_allocated(key, expected, notes).await
    }

    async fn set_blocked(&self, key: &VariantKey, reason: Option<String>) -> AppResult<()> {
        self.inner.set_blocked(key, reason).await
    }

    async fn outstanding_reservations(&self, key: &VariantKey) -> AppResult<i32> {
        self.inner.outstanding_reservations(key).await
    }

    async fn allocate_line(&self, order_line_id: Uuid, quantity: i32) -> AppResult<StockMovement> {
        if self.grant_fails() {
            return Err(AppError::ConcurrentModification(format!(
                "order line {} was modified concurrently",
                order_line_id
            )));
        }
        self.inner.allocate_line(order_line_id, quantity).await
    }

    async fn release_line(&self, order_line_id: Uuid, notes: &str) -> AppResult<Option<Release>> {
        self.inner.release_line(order_line_id, notes).await
    }

    async fn ship_line(
        &self,
        order_line_id: Uuid,
        quantity: i32,
        reference: Option<Reference>,
    ) -> AppResult<Shipment> {
        self.inner.ship_line(order_line_id, quantity, reference).await
    }

    async fn pending_demands(
        &self,
        key: &VariantKey,
        scope: &AllocationScope,
    ) -> AppResult<Vec<Demand>> {
        self.inner.pending_demands(key, scope).await
    }

    async fn lines_in_scope(&self, scope: &AllocationScope) -> AppResult<Vec<OrderLine>> {
        self.inner.lines_in_scope(scope).await
    }

    async fn get_line(&self, order_line_id: Uuid) -> AppResult<Option<OrderLine>> {
        self.inner.get_line(order_line_id).await
    }

    async fn get_order(&self, order_id: Uuid) -> AppResult<Option<Order>> {
        self.inner.get_order(order_id).await
    }

    async fn order_lines(&self, order_id: Uuid) -> AppResult<Vec<OrderLine>> {
        self.inner.order_lines(order_id).await
    }

    async fn orders_in_scope(&self, scope: &AllocationScope) -> AppResult<Vec<Order>> {
        self.inner.orders_in_scope(scope).await
    }

    async fn set_order_status(&self, order_id: Uuid, status: OrderStatus) -> AppResult<bool> {
        self.inner.set_order_status(order_id, status).await
    }

    async fn project_order(&self, order_id: Uuid) -> AppResult<(OrderStatus, OrderStatus)> {
        let slow = self
            .slow_projections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if slow {
            let delay = self.projection_delay_ms.load(Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(u64::from(delay))).await;
        }
        self.inner.project_order(order_id).await
    }

    async fn movements(&self, key: &VariantKey) -> AppResult<Vec<StockMovement>> {
        self.inner.movements(key).await
    }

    async fn product_movements(&self, product_id: Uuid) -> AppResult<Vec<StockMovement>> {
        self.inner.product_movements(product_id).await
    }
}
