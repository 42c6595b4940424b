//! Order and order line models

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{UserType, VariantKey};
use crate::types::ParseEnumError;

/// Order status. The first three are derived by projection, the last two are terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Partial,
    Confirmed,
    Shipped,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Partial => "partial",
            OrderStatus::Confirmed => "confirmed",
            OrderStatus::Shipped => "shipped",
            OrderStatus::Cancelled => "cancelled",
        }
    }

    /// Terminal orders never take part in allocation
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Shipped | OrderStatus::Cancelled)
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OrderStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OrderStatus::Pending),
            "partial" => Ok(OrderStatus::Partial),
            // older rows were written as "allocated"
            "confirmed" | "allocated" => Ok(OrderStatus::Confirmed),
            "shipped" => Ok(OrderStatus::Shipped),
            "cancelled" => Ok(OrderStatus::Cancelled),
            other => Err(ParseEnumError::new("order_status", other)),
        }
    }
}

/// An order as seen by the allocation engine
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Order {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub user_type: UserType,
    /// Lower = higher priority
    pub customer_priority: i32,
    pub status: OrderStatus,
    /// Sole ordering key for FIFO allocation
    pub created_at: DateTime<Utc>,
}

/// One line item of an order
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OrderLine {
    pub id: Uuid,
    pub order_id: Uuid,
    pub key: VariantKey,
    pub ordered_quantity: i32,
    pub allocated_quantity: i32,
    pub shipped_quantity: i32,
    pub unit_price: Decimal,
}

impl OrderLine {
    /// Quantity still waiting for stock
    pub fn needed_quantity(&self) -> i32 {
        (self.ordered_quantity - self.allocated_quantity).max(0)
    }

    /// Quantity reserved in the ledger and not yet shipped
    pub fn outstanding_reservation(&self) -> i32 {
        (self.allocated_quantity - self.shipped_quantity).max(0)
    }

    pub fn is_fully_allocated(&self) -> bool {
        self.allocated_quantity >= self.ordered_quantity
    }

    pub fn is_fully_shipped(&self) -> bool {
        self.shipped_quantity >= self.ordered_quantity
    }

    pub fn line_amount(&self) -> Decimal {
        self.unit_price * Decimal::from(self.ordered_quantity)
    }
}

/// Total amount of an order, used by the priority policy
pub fn order_total_amount(lines: &[OrderLine]) -> Decimal {
    lines.iter().map(OrderLine::line_amount).sum()
}
