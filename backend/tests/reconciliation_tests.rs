//! Reconciliation tests
//!
//! Tests for resetting and rebuilding allocations:
//! - A second pass over the same scope changes nothing
//! - Drifted counters are corrected and unblocked
//! - Product and day scopes leave everything else alone
//! - Shipped units survive a reset
//! - A rebuild that fails after the reset still reprojects its orders

mod common;

use chrono::NaiveDate;
use common::{at, fixture, won, Fixture};
use proptest::prelude::*;
use shared::{AllocationPolicy, OrderStatus, UserType, VariantKey};
use uuid::Uuid;
use wholesale_allocation_backend::{
    config::AllocationSettings,
    store::{AllocationScope, AllocationStore},
    AppError,
};

async fn allocations(fx: &Fixture, line_ids: &[Uuid]) -> Vec<i32> {
    let mut out = Vec::with_capacity(line_ids.len());
    for id in line_ids {
        out.push(fx.line(*id).await.allocated_quantity);
    }
    out
}

async fn statuses(fx: &Fixture, order_ids: &[Uuid]) -> Vec<OrderStatus> {
    let mut out = Vec::with_capacity(order_ids.len());
    for id in order_ids {
        out.push(fx.status(*id).await);
    }
    out
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod unit_tests {
    use super::*;

    #[tokio::test]
    async fn test_reconcile_rebuilds_fifo_order_and_is_repeatable() {
        let fx = fixture();
        let key = fx.variant(100).await;
        let (o1, l1) = fx
            .order(UserType::Retailer, 3, at(0), &key, 40, won(10_000))
            .await;
        let (o2, l2) = fx
            .order(UserType::Retailer, 3, at(1), &key, 50, won(8_000))
            .await;
        let (o3, l3) = fx
            .order(UserType::MainDistributor, 0, at(2), &key, 30, won(10_000))
            .await;
        let lines = [l1.id, l2.id, l3.id];
        let orders = [o1.id, o2.id, o3.id];

        // Start from the priority outcome
        fx.engine
            .allocate_variant(&key, Some(AllocationPolicy::Priority))
            .await
            .unwrap();
        assert_eq!(allocations(&fx, &lines).await, vec![40, 30, 30]);

        let first = fx
            .engine
            .reconcile(&AllocationScope::All, Some(AllocationPolicy::Fifo))
            .await
            .unwrap();
        let after_first = allocations(&fx, &lines).await;
        let statuses_first = statuses(&fx, &orders).await;

        assert_eq!(after_first, vec![40, 50, 10]);
        assert_eq!(
            statuses_first,
            vec![
                OrderStatus::Confirmed,
                OrderStatus::Confirmed,
                OrderStatus::Partial
            ]
        );
        assert_eq!(first.orders_processed, 3);
        assert_eq!(first.fully_allocated, 2);
        assert_eq!(first.partially_allocated, 1);
        assert_eq!(first.unallocated, 0);
        assert_eq!(first.lines_reset, 3);
        assert_eq!(first.units_released, 100);
        assert!(first.drift_corrections.is_empty());

        let second = fx
            .engine
            .reconcile(&AllocationScope::All, Some(AllocationPolicy::Fifo))
            .await
            .unwrap();

        assert_eq!(allocations(&fx, &lines).await, after_first);
        assert_eq!(statuses(&fx, &orders).await, statuses_first);
        assert_eq!(fx.stock(&key).await.allocated_stock, 100);
        assert_eq!(second.fully_allocated, first.fully_allocated);
        assert_eq!(second.partially_allocated, first.partially_allocated);
        assert_eq!(second.unallocated, first.unallocated);
        fx.assert_consistent(&key).await;
    }

    #[tokio::test]
    async fn test_drift_is_corrected_and_variant_unblocked() {
        let fx = fixture();
        let key = fx.variant(30).await;
        let (order, line) = fx.retail_order(at(0), &key, 10).await;
        fx.engine.on_order_created(order.id).await.unwrap();

        // A lost update left the counter behind the lines
        fx.store.force_allocated(&key, 25).await.unwrap();
        fx.engine.ledger().audit(&key).await.unwrap();
        assert!(fx.stock(&key).await.is_blocked);

        let summary = fx
            .engine
            .reconcile(
                &AllocationScope::Product {
                    product_id: key.product_id,
                },
                None,
            )
            .await
            .unwrap();

        assert_eq!(summary.drift_corrections.len(), 1);
        assert_eq!(summary.drift_corrections[0].recorded, 15);
        assert_eq!(summary.drift_corrections[0].expected, 0);
        let variant = fx.stock(&key).await;
        assert!(!variant.is_blocked);
        assert_eq!(variant.allocated_stock, 10);
        assert_eq!(fx.line(line.id).await.allocated_quantity, 10);
        fx.assert_consistent(&key).await;
    }

    #[tokio::test]
    async fn test_product_scope_leaves_other_products_alone() {
        let fx = fixture();
        let shirts = fx.variant(10).await;
        let socks = fx.variant(10).await;
        let (shirt_order, _) = fx.retail_order(at(0), &shirts, 4).await;
        let (sock_order, sock_line) = fx.retail_order(at(1), &socks, 4).await;
        fx.engine.on_order_created(shirt_order.id).await.unwrap();
        fx.engine.on_order_created(sock_order.id).await.unwrap();
        let sock_movements = fx.engine.ledger().movements(&socks).await.unwrap().len();

        let summary = fx
            .engine
            .reconcile(
                &AllocationScope::Product {
                    product_id: shirts.product_id,
                },
                None,
            )
            .await
            .unwrap();

        assert_eq!(summary.orders_processed, 1);
        assert_eq!(fx.line(sock_line.id).await.allocated_quantity, 4);
        assert_eq!(
            fx.engine.ledger().movements(&socks).await.unwrap().len(),
            sock_movements
        );
    }

    #[tokio::test]
    async fn test_day_scope_uses_business_day() {
        let fx = fixture();
        let key = fx.variant(10).await;
        // 2024-05-10 23:00 KST
        let (late_evening, evening_line) = fx
            .retail_order(common::at(14 * 60), &key, 6)
            .await;
        // 2024-05-11 01:00 KST
        let (next_morning, morning_line) = fx
            .retail_order(common::at(16 * 60), &key, 6)
            .await;
        fx.engine.on_order_created(late_evening.id).await.unwrap();
        fx.engine.on_order_created(next_morning.id).await.unwrap();

        let offset = AllocationSettings::default().business_offset();
        let scope = AllocationScope::day(NaiveDate::from_ymd_opt(2024, 5, 11).unwrap(), offset);
        let summary = fx.engine.reconcile(&scope, None).await.unwrap();

        assert_eq!(summary.orders_processed, 1);
        assert_eq!(summary.partially_allocated, 1);
        assert_eq!(summary.lines_reset, 1);
        assert_eq!(summary.units_released, 4);
        assert_eq!(fx.line(evening_line.id).await.allocated_quantity, 6);
        assert_eq!(fx.line(morning_line.id).await.allocated_quantity, 4);
        fx.assert_consistent(&key).await;
    }

    #[tokio::test]
    async fn test_shipped_units_survive_a_reset() {
        let fx = fixture();
        let key = fx.variant(10).await;
        let (order, line) = fx.retail_order(at(0), &key, 8).await;
        fx.engine.on_order_created(order.id).await.unwrap();
        fx.engine.ship_allocated(line.id, 3).await.unwrap();

        let summary = fx.engine.reconcile(&AllocationScope::All, None).await.unwrap();

        assert_eq!(summary.units_released, 5);
        let stored = fx.line(line.id).await;
        assert_eq!(stored.shipped_quantity, 3);
        assert_eq!(stored.allocated_quantity, 8);
        let variant = fx.stock(&key).await;
        assert_eq!(variant.physical_stock, 7);
        assert_eq!(variant.allocated_stock, 5);
        fx.assert_consistent(&key).await;
    }

    #[tokio::test]
    async fn test_terminal_orders_are_out_of_scope() {
        let fx = fixture();
        let key = fx.variant(5).await;
        let (shipped, shipped_line) = fx.retail_order(at(0), &key, 2).await;
        let (cancelled, _) = fx.retail_order(at(1), &key, 2).await;
        let (open, open_line) = fx.retail_order(at(2), &key, 2).await;
        fx.engine.on_order_created(shipped.id).await.unwrap();
        fx.engine.ship_allocated(shipped_line.id, 2).await.unwrap();
        fx.engine.cancel_order(cancelled.id).await.unwrap();

        let summary = fx.engine.reconcile(&AllocationScope::All, None).await.unwrap();

        assert_eq!(summary.orders_processed, 1);
        assert_eq!(fx.status(shipped.id).await, OrderStatus::Shipped);
        assert_eq!(fx.status(cancelled.id).await, OrderStatus::Cancelled);
        assert_eq!(fx.line(open_line.id).await.allocated_quantity, 2);
    }

    #[tokio::test]
    async fn test_empty_scope_is_a_no_op() {
        let fx = fixture();
        let summary = fx
            .engine
            .reconcile(
                &AllocationScope::Product {
                    product_id: Uuid::new_v4(),
                },
                None,
            )
            .await
            .unwrap();
        assert_eq!(summary.orders_processed, 0);
        assert!(summary.runs.is_empty());
    }

    #[tokio::test]
    async fn test_failed_rebuild_reprojects_reset_orders() {
        let fx = fixture();
        let key = fx.variant(10).await;
        let (order, line) = fx.retail_order(at(0), &key, 10).await;
        fx.engine.on_order_created(order.id).await.unwrap();
        assert_eq!(fx.status(order.id).await, OrderStatus::Confirmed);
        fx.hooks.fail_grants_after(0);

        let err = fx
            .engine
            .reconcile(&AllocationScope::All, None)
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::ConcurrentModification(_)));
        assert_eq!(fx.line(line.id).await.allocated_quantity, 0);
        assert_eq!(fx.stock(&key).await.allocated_stock, 0);
        assert_eq!(fx.status(order.id).await, OrderStatus::Pending);
        fx.assert_consistent(&key).await;
    }
}

// ============================================================================
// Property-Based Tests
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(40))]

    /// FIFO reconciliation lands where processing each order at intake, in
    /// creation order, would have landed; a second pass changes nothing
    #[test]
    fn prop_fifo_reconciliation_matches_intake_order(
        stock in 0i32..120,
        orders in prop::collection::vec((1i32..40, 0i32..10, any::<bool>()), 1..8),
    ) {
        tokio_test::block_on(async {
            let reconciled = fixture();
            let replayed = fixture();
            let product_id = Uuid::new_v4();
            let key = VariantKey::product(product_id);
            reconciled.store.define_variant(&key, stock).await.unwrap();
            replayed.store.define_variant(&key, stock).await.unwrap();

            let mut reconciled_lines = Vec::new();
            let mut replayed_orders = Vec::new();
            let mut replayed_lines = Vec::new();
            for (i, (qty, priority, top_tier)) in orders.iter().enumerate() {
                let user_type = if *top_tier {
                    UserType::MainDistributor
                } else {
                    UserType::Retailer
                };
                let (_, line) = reconciled
                    .order(user_type, *priority, at(i as i64), &key, *qty, won(1_000))
                    .await;
                reconciled_lines.push(line.id);
                let (order, line) = replayed
                    .order(user_type, *priority, at(i as i64), &key, *qty, won(1_000))
                    .await;
                replayed_orders.push(order.id);
                replayed_lines.push(line.id);
            }

            // Scramble the first store with the priority policy
            reconciled
                .engine
                .allocate_variant(&key, Some(AllocationPolicy::Priority))
                .await
                .unwrap();
            reconciled
                .engine
                .reconcile(&AllocationScope::All, Some(AllocationPolicy::Fifo))
                .await
                .unwrap();
            let first = allocations(&reconciled, &reconciled_lines).await;

            for order_id in &replayed_orders {
                replayed.engine.on_order_created(*order_id).await.unwrap();
            }
            prop_assert_eq!(&first, &allocations(&replayed, &replayed_lines).await);

            reconciled
                .engine
                .reconcile(&AllocationScope::All, Some(AllocationPolicy::Fifo))
                .await
                .unwrap();
            prop_assert_eq!(&first, &allocations(&reconciled, &reconciled_lines).await);

            let variant = reconciled.stock(&key).await;
            let outstanding = reconciled.store.outstanding_reservations(&key).await.unwrap();
            prop_assert!(variant.check_against_lines(outstanding).is_ok());
            Ok(())
        })?;
    }
}
