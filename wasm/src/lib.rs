//! WebAssembly module for the wholesale allocation back office
//!
//! Provides client-side computation for:
//! - Allocation plan previews (FIFO and priority)
//! - Order status projection
//! - Stock adjustment validation before submit

use shared::{AllocationPolicy, Demand, MovementType, OrderLine};
use wasm_bindgen::prelude::*;

// Re-export shared types for use in JavaScript
pub use shared::models::*;
pub use shared::policy::*;
pub use shared::validation::*;

fn to_js_error(message: String) -> JsValue {
    web_sys::console::warn_1(&JsValue::from_str(&message));
    js_sys::Error::new(&message).into()
}

fn plan_json(demands_json: &str, available_stock: i32, policy: &str) -> Result<String, String> {
    let demands: Vec<Demand> =
        serde_json::from_str(demands_json).map_err(|e| format!("Invalid demands JSON: {}", e))?;
    let policy: AllocationPolicy = policy.parse().map_err(|e| format!("{}", e))?;
    let plan = policy.plan(&demands, available_stock);
    serde_json::to_string(&plan).map_err(|e| format!("Failed to encode plan: {}", e))
}

fn status_of(lines_json: &str) -> Result<String, String> {
    let lines: Vec<OrderLine> =
        serde_json::from_str(lines_json).map_err(|e| format!("Invalid order lines JSON: {}", e))?;
    Ok(shared::project_status(&lines).as_str().to_string())
}

/// Preview the grants a policy would make for one variant
#[wasm_bindgen]
pub fn preview_allocation_plan(
    demands_json: &str,
    available_stock: i32,
    policy: &str,
) -> Result<String, JsValue> {
    plan_json(demands_json, available_stock, policy).map_err(to_js_error)
}

/// Project an order's status from its lines
#[wasm_bindgen]
pub fn project_order_status(lines_json: &str) -> Result<String, JsValue> {
    status_of(lines_json).map_err(to_js_error)
}

/// Available stock; negative means the ledger is corrupt
#[wasm_bindgen]
pub fn available_stock(physical_stock: i32, allocated_stock: i32) -> i32 {
    physical_stock - allocated_stock
}

/// Check an adjustment before sending it; returns an empty string when valid
#[wasm_bindgen]
pub fn check_stock_adjustment(delta: i32, movement_type: &str) -> String {
    let movement_type: MovementType = match movement_type.parse() {
        Ok(t) => t,
        Err(e) => return format!("{}", e),
    };
    match validate_adjustment(delta, movement_type) {
        Ok(()) => String::new(),
        Err(msg) => msg.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use rust_decimal::Decimal;
    use uuid::Uuid;

    fn demand(minute: u32, needed: i32) -> Demand {
        Demand {
            order_line_id: Uuid::new_v4(),
            order_id: Uuid::new_v4(),
            order_created_at: Utc.with_ymd_and_hms(2024, 5, 10, 9, minute, 0).unwrap(),
            customer_priority: 3,
            user_type_rank: 2,
            order_total_amount: Decimal::new(100_000, 0),
            needed_quantity: needed,
        }
    }

    #[test]
    fn test_preview_fifo_plan() {
        let demands = vec![demand(0, 40), demand(1, 50), demand(2, 30)];
        let json = serde_json::to_string(&demands).unwrap();
        let encoded = plan_json(&json, 100, "fifo").unwrap();
        let plan: AllocationPlan = serde_json::from_str(&encoded).unwrap();
        assert_eq!(plan.granted_total(), 100);
        assert_eq!(plan.granted_for(demands[2].order_line_id), 10);
    }

    #[test]
    fn test_unknown_policy_is_rejected() {
        assert!(plan_json("[]", 10, "lifo").is_err());
    }

    #[test]
    fn test_project_order_status() {
        let line = OrderLine {
            id: Uuid::new_v4(),
            order_id: Uuid::new_v4(),
            key: VariantKey::product(Uuid::new_v4()),
            ordered_quantity: 30,
            allocated_quantity: 10,
            shipped_quantity: 0,
            unit_price: Decimal::new(8_000, 0),
        };
        let json = serde_json::to_string(&vec![line]).unwrap();
        assert_eq!(status_of(&json).unwrap(), "partial");
    }

    #[test]
    fn test_check_stock_adjustment() {
        assert_eq!(check_stock_adjustment(10, "inbound"), "");
        assert!(!check_stock_adjustment(-10, "inbound").is_empty());
        assert!(!check_stock_adjustment(5, "order_allocation").is_empty());
    }
}
