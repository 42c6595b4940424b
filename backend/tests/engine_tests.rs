//! Shipping and cancellation tests
//!
//! Tests for the engine entry points that consume or free reservations:
//! - Shipping turns reserved units into a physical decrement
//! - Bulk shipping reports each line on its own
//! - Cancelling an order hands its stock to waiting orders
//! - Terminal orders keep their status against late projections

mod common;

use std::time::Duration;

use common::{at, fixture};
use shared::{MovementEffect, MovementType, OrderStatus, ReferenceType};
use uuid::Uuid;
use wholesale_allocation_backend::{services::ShipmentRequest, store::AllocationStore, AppError};

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod unit_tests {
    use super::*;

    #[tokio::test]
    async fn test_shipping_consumes_reservation_and_physical_stock() {
        let fx = fixture();
        let key = fx.variant(10).await;
        let (order, line) = fx.retail_order(at(0), &key, 6).await;
        fx.engine.on_order_created(order.id).await.unwrap();

        let shipment = fx.engine.ship_allocated(line.id, 4).await.unwrap();

        assert!(!shipment.order_completed);
        assert_eq!(shipment.movement.quantity_delta, -4);
        assert_eq!(shipment.movement.movement_type, MovementType::OrderShipment);
        assert_eq!(shipment.movement.affects, MovementEffect::Both);
        assert_eq!(shipment.movement.reference_type, Some(ReferenceType::Order));
        let variant = fx.stock(&key).await;
        assert_eq!(variant.physical_stock, 6);
        assert_eq!(variant.allocated_stock, 2);
        assert_eq!(variant.available_stock(), 4);
        fx.assert_consistent(&key).await;
    }

    #[tokio::test]
    async fn test_fully_shipped_order_becomes_shipped() {
        let fx = fixture();
        let key = fx.variant(10).await;
        let (order, line) = fx.retail_order(at(0), &key, 6).await;
        fx.engine.on_order_created(order.id).await.unwrap();

        fx.engine.ship_allocated(line.id, 4).await.unwrap();
        let last = fx.engine.ship_allocated(line.id, 2).await.unwrap();

        assert!(last.order_completed);
        assert_eq!(fx.status(order.id).await, OrderStatus::Shipped);
        assert_eq!(fx.stock(&key).await.allocated_stock, 0);
    }

    #[tokio::test]
    async fn test_cannot_ship_more_than_reserved() {
        let fx = fixture();
        let key = fx.variant(3).await;
        let (order, line) = fx.retail_order(at(0), &key, 6).await;
        fx.engine.on_order_created(order.id).await.unwrap();

        let err = fx.engine.ship_allocated(line.id, 4).await.unwrap_err();

        assert!(matches!(err, AppError::InvalidStateTransition(_)));
        let variant = fx.stock(&key).await;
        assert_eq!(variant.physical_stock, 3);
        assert_eq!(variant.allocated_stock, 3);
    }

    #[tokio::test]
    async fn test_ship_quantity_must_be_positive() {
        let fx = fixture();
        let key = fx.variant(3).await;
        let (_, line) = fx.retail_order(at(0), &key, 3).await;

        let err = fx.engine.ship_allocated(line.id, 0).await.unwrap_err();
        assert!(matches!(err, AppError::Validation { .. }));
    }

    #[tokio::test]
    async fn test_ship_against_statement_reference() {
        let fx = fixture();
        let key = fx.variant(5).await;
        let (order, line) = fx.retail_order(at(0), &key, 5).await;
        fx.engine.on_order_created(order.id).await.unwrap();
        let statement_id = Uuid::new_v4();

        let shipment = fx
            .engine
            .ship_with_reference(line.id, 5, shared::Reference::statement(statement_id))
            .await
            .unwrap();

        assert_eq!(
            shipment.movement.reference_type,
            Some(ReferenceType::Statement)
        );
        assert_eq!(shipment.movement.reference_id, Some(statement_id));
    }

    #[tokio::test]
    async fn test_bulk_shipment_reports_each_line() {
        let fx = fixture();
        let key = fx.variant(10).await;
        let (first, first_line) = fx.retail_order(at(0), &key, 4).await;
        let (second, second_line) = fx.retail_order(at(1), &key, 4).await;
        fx.engine.on_order_created(first.id).await.unwrap();
        fx.engine.on_order_created(second.id).await.unwrap();

        let report = fx
            .engine
            .ship_bulk(&[
                ShipmentRequest {
                    order_line_id: first_line.id,
                    quantity: 4,
                },
                ShipmentRequest {
                    order_line_id: second_line.id,
                    quantity: 9,
                },
                ShipmentRequest {
                    order_line_id: Uuid::new_v4(),
                    quantity: 1,
                },
            ])
            .await;

        assert_eq!(report.shipped.len(), 1);
        assert_eq!(report.total_units, 4);
        assert_eq!(report.failed.len(), 2);
        assert_eq!(report.failed[0].code, "INVALID_STATE_TRANSITION");
        assert_eq!(report.failed[1].code, "NOT_FOUND");
        assert_eq!(fx.status(first.id).await, OrderStatus::Shipped);
        assert_eq!(fx.line(second_line.id).await.shipped_quantity, 0);
        fx.assert_consistent(&key).await;
    }

    #[tokio::test]
    async fn test_cancel_frees_stock_for_waiting_orders() {
        let fx = fixture();
        let key = fx.variant(10).await;
        let (first, _) = fx.retail_order(at(0), &key, 10).await;
        let (second, second_line) = fx.retail_order(at(1), &key, 5).await;
        fx.engine.on_order_created(first.id).await.unwrap();
        fx.engine.on_order_created(second.id).await.unwrap();
        assert_eq!(fx.status(second.id).await, OrderStatus::Pending);

        let cancellation = fx.engine.cancel_order(first.id).await.unwrap();

        assert_eq!(cancellation.units_released, 10);
        assert_eq!(cancellation.runs.len(), 1);
        assert_eq!(fx.status(first.id).await, OrderStatus::Cancelled);
        assert_eq!(fx.status(second.id).await, OrderStatus::Confirmed);
        assert_eq!(fx.line(second_line.id).await.allocated_quantity, 5);
        assert_eq!(fx.stock(&key).await.allocated_stock, 5);
        fx.assert_consistent(&key).await;
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let fx = fixture();
        let key = fx.variant(10).await;
        let (order, _) = fx.retail_order(at(0), &key, 4).await;
        fx.engine.on_order_created(order.id).await.unwrap();

        fx.engine.cancel_order(order.id).await.unwrap();
        let again = fx.engine.cancel_order(order.id).await.unwrap();

        assert_eq!(again.units_released, 0);
        assert_eq!(fx.stock(&key).await.allocated_stock, 0);
    }

    #[tokio::test]
    async fn test_shipped_order_cannot_be_cancelled() {
        let fx = fixture();
        let key = fx.variant(10).await;
        let (order, line) = fx.retail_order(at(0), &key, 4).await;
        fx.engine.on_order_created(order.id).await.unwrap();
        fx.engine.ship_allocated(line.id, 4).await.unwrap();

        let err = fx.engine.cancel_order(order.id).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidStateTransition(_)));
    }

    #[tokio::test]
    async fn test_cancel_during_slow_projection_stays_cancelled() {
        let fx = fixture();
        let key = fx.variant(10).await;
        let (order, line) = fx.retail_order(at(0), &key, 4).await;
        fx.hooks.slow_down_projections(1, 150);

        let engine = fx.engine.clone();
        let run_key = key.clone();
        let run = tokio::spawn(async move { engine.allocate_variant(&run_key, None).await });
        tokio::time::sleep(Duration::from_millis(30)).await;
        fx.engine.cancel_order(order.id).await.unwrap();
        run.await.unwrap().unwrap();

        assert_eq!(fx.status(order.id).await, OrderStatus::Cancelled);
        assert_eq!(fx.line(line.id).await.allocated_quantity, 0);
        assert_eq!(fx.stock(&key).await.allocated_stock, 0);
        fx.assert_consistent(&key).await;
    }

    #[tokio::test]
    async fn test_terminal_status_is_not_overwritten() {
        let fx = fixture();
        let key = fx.variant(10).await;
        let (order, line) = fx.retail_order(at(0), &key, 4).await;
        fx.engine.on_order_created(order.id).await.unwrap();
        fx.engine.ship_allocated(line.id, 4).await.unwrap();

        let err = fx
            .store
            .set_order_status(order.id, OrderStatus::Cancelled)
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::InvalidStateTransition(_)));
        assert_eq!(fx.status(order.id).await, OrderStatus::Shipped);
    }

    #[tokio::test]
    async fn test_projection_leaves_cancelled_order_alone() {
        let fx = fixture();
        let key = fx.variant(10).await;
        let (order, _) = fx.retail_order(at(0), &key, 4).await;
        fx.engine.on_order_created(order.id).await.unwrap();
        fx.engine.cancel_order(order.id).await.unwrap();

        let (previous, projected) = fx.store.project_order(order.id).await.unwrap();

        assert_eq!(previous, OrderStatus::Cancelled);
        assert_eq!(projected, OrderStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_unknown_order_is_not_found() {
        let fx = fixture();
        let err = fx.engine.on_order_created(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }
}
