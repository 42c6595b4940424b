//! HTTP handlers for stock ledger endpoints

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use shared::{AdjustmentReason, MovementType, Reference, ReferenceType, StockMovement, VariantKey};
use uuid::Uuid;
use validator::Validate;

use crate::error::{AppError, AppResult};
use crate::services::{StockAdjustment, VariantAudit, VariantStock};
use crate::AppState;

/// Variant address in a query string
#[derive(Debug, Deserialize)]
pub struct VariantQuery {
    pub product_id: Uuid,
    pub color: Option<String>,
    pub size: Option<String>,
}

impl VariantQuery {
    fn key(&self) -> VariantKey {
        VariantKey::new(self.product_id, self.color.clone(), self.size.clone())
    }
}

#[derive(Debug, Serialize)]
pub struct AvailableStock {
    pub key: VariantKey,
    pub available_stock: i32,
}

#[derive(Debug, Deserialize, Validate)]
pub struct DefineVariantInput {
    pub product_id: Uuid,
    #[validate(length(max = 64))]
    pub color: Option<String>,
    #[validate(length(max = 64))]
    pub size: Option<String>,
    #[validate(range(min = 0, max = 1000000))]
    #[serde(default)]
    pub initial_stock: i32,
}

#[derive(Debug, Deserialize, Validate)]
pub struct AdjustStockInput {
    pub product_id: Uuid,
    #[validate(length(max = 64))]
    pub color: Option<String>,
    #[validate(length(max = 64))]
    pub size: Option<String>,
    /// Sign and bounds are checked by the ledger against `movement_type`
    pub quantity_delta: i32,
    pub movement_type: MovementType,
    pub reference_type: Option<ReferenceType>,
    pub reference_id: Option<Uuid>,
    #[validate(length(max = 500))]
    pub notes: Option<String>,
}

impl AdjustStockInput {
    fn reason(&self) -> AppResult<AdjustmentReason> {
        let mut reason = AdjustmentReason::new(self.movement_type);
        match (self.reference_type, self.reference_id) {
            (Some(reference_type), Some(reference_id)) => {
                reason = reason.with_reference(Reference {
                    reference_type,
                    reference_id,
                });
            }
            (None, None) => {}
            _ => {
                return Err(AppError::validation(
                    "reference_id",
                    "reference_type and reference_id must be given together",
                    "참조 유형과 참조 ID는 함께 입력해야 합니다",
                ))
            }
        }
        if let Some(notes) = &self.notes {
            reason = reason.with_notes(notes.clone());
        }
        Ok(reason)
    }
}

#[derive(Debug, Deserialize)]
pub struct MovementQuery {
    pub product_id: Uuid,
    pub color: Option<String>,
    pub size: Option<String>,
    pub format: Option<String>, // "json" or "csv"
}

/// List variants of a product
pub async fn list_variants(
    State(state): State<AppState>,
    Path(product_id): Path<Uuid>,
) -> AppResult<Json<Vec<VariantStock>>> {
    let variants = state.engine.ledger().list_variants(product_id).await?;
    Ok(Json(variants))
}

/// Get available stock of one variant
pub async fn get_available(
    State(state): State<AppState>,
    Query(query): Query<VariantQuery>,
) -> AppResult<Json<AvailableStock>> {
    let key = query.key();
    let available_stock = state.engine.ledger().get_available(&key).await?;
    Ok(Json(AvailableStock {
        key,
        available_stock,
    }))
}

/// Register a new variant
pub async fn define_variant(
    State(state): State<AppState>,
    Json(input): Json<DefineVariantInput>,
) -> AppResult<impl IntoResponse> {
    input.validate()?;
    let key = VariantKey::new(input.product_id, input.color, input.size);
    let variant = state
        .engine
        .ledger()
        .define_variant(&key, input.initial_stock)
        .await?;
    Ok((StatusCode::CREATED, Json(VariantStock::from(variant))))
}

/// Adjust physical stock; inbound stock is allocated to waiting orders
pub async fn adjust_stock(
    State(state): State<AppState>,
    Json(input): Json<AdjustStockInput>,
) -> AppResult<Json<StockAdjustment>> {
    input.validate()?;
    let reason = input.reason()?;
    let key = VariantKey::new(input.product_id, input.color, input.size);
    let adjustment = state
        .engine
        .on_physical_stock_changed(&key, input.quantity_delta, &reason)
        .await?;
    Ok(Json(adjustment))
}

/// Movement history of a variant, or of the whole product when no option
/// is given
pub async fn list_movements(
    State(state): State<AppState>,
    Query(query): Query<MovementQuery>,
) -> AppResult<impl IntoResponse> {
    let ledger = state.engine.ledger();
    let movements = if query.color.is_none() && query.size.is_none() {
        ledger.product_movements(query.product_id).await?
    } else {
        let key = VariantKey::new(query.product_id, query.color, query.size);
        ledger.movements(&key).await?
    };

    if query.format.as_deref() == Some("csv") {
        let csv = movements_to_csv(&movements)?;
        Ok((
            [
                (header::CONTENT_TYPE, "text/csv"),
                (
                    header::CONTENT_DISPOSITION,
                    "attachment; filename=\"stock_movements.csv\"",
                ),
            ],
            csv,
        )
            .into_response())
    } else {
        Ok(Json(movements).into_response())
    }
}

/// Audit every variant of a product
pub async fn audit_product(
    State(state): State<AppState>,
    Path(product_id): Path<Uuid>,
) -> AppResult<Json<Vec<VariantAudit>>> {
    let audits = state.engine.audit_product(product_id).await?;
    Ok(Json(audits))
}

/// Serialize movements as CSV rows
pub fn movements_to_csv(movements: &[StockMovement]) -> AppResult<String> {
    let mut wtr = csv::Writer::from_writer(vec![]);
    for movement in movements {
        wtr.serialize(movement)
            .map_err(|e| AppError::Internal(format!("CSV serialization error: {}", e)))?;
    }
    let bytes = wtr
        .into_inner()
        .map_err(|e| AppError::Internal(format!("CSV writer error: {}", e)))?;
    String::from_utf8(bytes)
        .map_err(|e| AppError::Internal(format!("UTF-8 conversion error: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use shared::MovementEffect;

    #[test]
    fn test_movements_to_csv_has_header_and_rows() {
        let movement = StockMovement {
            id: Uuid::new_v4(),
            product_id: Uuid::new_v4(),
            color: Some("black".to_string()),
            size: None,
            quantity_delta: -5,
            movement_type: MovementType::OrderShipment,
            affects: MovementEffect::Both,
            reference_type: Some(ReferenceType::Order),
            reference_id: Some(Uuid::new_v4()),
            notes: None,
            created_at: Utc::now(),
        };
        let csv = movements_to_csv(&[movement]).unwrap();
        let mut lines = csv.lines();
        let header = lines.next().unwrap();
        assert!(header.starts_with("id,product_id,color,size,quantity_delta,movement_type"));
        let row = lines.next().unwrap();
        assert!(row.contains(",-5,order_shipment,both,order,"));
    }

    #[test]
    fn test_reference_requires_both_parts() {
        let input = AdjustStockInput {
            product_id: Uuid::new_v4(),
            color: None,
            size: None,
            quantity_delta: 10,
            movement_type: MovementType::Inbound,
            reference_type: Some(ReferenceType::Statement),
            reference_id: None,
            notes: None,
        };
        assert!(input.reason().is_err());
    }
}
