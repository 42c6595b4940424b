//! Route definitions for the allocation engine

use axum::{
    routing::{get, post},
    Router,
};

use crate::{handlers, AppState};

/// Create API routes
pub fn api_routes() -> Router<AppState> {
    Router::new()
        // Health check
        .route("/health", get(handlers::health_check))
        // Stock ledger
        .nest("/stock", stock_routes())
        // Allocation, shipping and reconciliation
        .nest("/allocation", allocation_routes())
}

/// Stock ledger routes
fn stock_routes() -> Router<AppState> {
    Router::new()
        .route("/products/:product_id/variants", get(handlers::list_variants))
        .route("/products/:product_id/audit", get(handlers::audit_product))
        .route("/available", get(handlers::get_available))
        .route("/variants", post(handlers::define_variant))
        .route("/adjust", post(handlers::adjust_stock))
        .route("/movements", get(handlers::list_movements))
}

/// Allocation routes
fn allocation_routes() -> Router<AppState> {
    Router::new()
        .route("/orders/:order_id", post(handlers::allocate_order))
        .route("/orders/:order_id/cancel", post(handlers::cancel_order))
        .route("/variants/run", post(handlers::run_variant))
        .route("/ship", post(handlers::ship))
        .route("/ship/bulk", post(handlers::ship_bulk))
        .route("/reconcile", post(handlers::reconcile))
}
