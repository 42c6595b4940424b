//! HTTP handlers for allocation, shipping and reconciliation endpoints

use axum::{
    extract::{Path, State},
    Json,
};
use chrono::NaiveDate;
use serde::Deserialize;
use shared::{AllocationPolicy, Reference, VariantKey};
use uuid::Uuid;
use validator::Validate;

use crate::error::{AppError, AppResult};
use crate::services::{
    AllocationRun, BulkShipmentReport, Cancellation, OrderAllocation, ReconciliationSummary,
    ShipmentRequest,
};
use crate::store::{AllocationScope, Shipment};
use crate::AppState;

#[derive(Debug, Deserialize, Validate)]
pub struct RunVariantInput {
    pub product_id: Uuid,
    #[validate(length(max = 64))]
    pub color: Option<String>,
    #[validate(length(max = 64))]
    pub size: Option<String>,
    pub policy: Option<AllocationPolicy>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ShipInput {
    pub order_line_id: Uuid,
    #[validate(range(min = 1, max = 1000000))]
    pub quantity: i32,
    /// Statement the shipment belongs to, if any
    pub statement_id: Option<Uuid>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct BulkShipInput {
    #[validate(length(min = 1, max = 1000))]
    pub items: Vec<ShipmentRequest>,
}

/// Reconciliation scope as sent by the back office
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeKind {
    All,
    Product,
    Day,
}

#[derive(Debug, Deserialize)]
pub struct ReconcileInput {
    pub scope: ScopeKind,
    pub product_id: Option<Uuid>,
    /// Business-local date for the `day` scope
    pub date: Option<NaiveDate>,
    pub policy: Option<AllocationPolicy>,
}

impl ReconcileInput {
    fn to_scope(&self, offset: chrono::FixedOffset) -> AppResult<AllocationScope> {
        match self.scope {
            ScopeKind::All => Ok(AllocationScope::All),
            ScopeKind::Product => self
                .product_id
                .map(|product_id| AllocationScope::Product { product_id })
                .ok_or_else(|| {
                    AppError::validation(
                        "product_id",
                        "product_id is required for the product scope",
                        "상품 범위에는 상품 ID가 필요합니다",
                    )
                }),
            ScopeKind::Day => self
                .date
                .map(|date| AllocationScope::day(date, offset))
                .ok_or_else(|| {
                    AppError::validation(
                        "date",
                        "date is required for the day scope",
                        "일자 범위에는 날짜가 필요합니다",
                    )
                }),
        }
    }
}

/// Allocate stock to a newly created order
pub async fn allocate_order(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
) -> AppResult<Json<OrderAllocation>> {
    let allocation = state.engine.on_order_created(order_id).await?;
    Ok(Json(allocation))
}

/// Cancel an order and release its reservations
pub async fn cancel_order(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
) -> AppResult<Json<Cancellation>> {
    let cancellation = state.engine.cancel_order(order_id).await?;
    Ok(Json(cancellation))
}

/// Run the allocator for one variant
pub async fn run_variant(
    State(state): State<AppState>,
    Json(input): Json<RunVariantInput>,
) -> AppResult<Json<AllocationRun>> {
    input.validate()?;
    let key = VariantKey::new(input.product_id, input.color, input.size);
    let run = state.engine.allocate_variant(&key, input.policy).await?;
    Ok(Json(run))
}

/// Ship reserved units of one line
pub async fn ship(
    State(state): State<AppState>,
    Json(input): Json<ShipInput>,
) -> AppResult<Json<Shipment>> {
    input.validate()?;
    let shipment = match input.statement_id {
        Some(statement_id) => {
            state
                .engine
                .ship_with_reference(
                    input.order_line_id,
                    input.quantity,
                    Reference::statement(statement_id),
                )
                .await?
        }
        None => {
            state
                .engine
                .ship_allocated(input.order_line_id, input.quantity)
                .await?
        }
    };
    Ok(Json(shipment))
}

/// Ship many lines, reporting per-line success or failure
pub async fn ship_bulk(
    State(state): State<AppState>,
    Json(input): Json<BulkShipInput>,
) -> AppResult<Json<BulkShipmentReport>> {
    input.validate()?;
    let report = state.engine.ship_bulk(&input.items).await;
    Ok(Json(report))
}

/// Reset and rebuild allocations for a scope
pub async fn reconcile(
    State(state): State<AppState>,
    Json(input): Json<ReconcileInput>,
) -> AppResult<Json<ReconciliationSummary>> {
    let scope = input.to_scope(state.config.allocation.business_offset())?;
    let summary = state.engine.reconcile(&scope, input.policy).await?;
    Ok(Json(summary))
}
