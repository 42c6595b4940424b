//! Allocation policies
//!
//! A policy turns a set of pending demands for one stock variant into an
//! ordered allocation plan. Policies are pure: the same demands and the same
//! available stock always give the same plan, which is what lets
//! reconciliation re-run them and land on identical results.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::ParseEnumError;

/// Which ordering to allocate by
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum AllocationPolicy {
    /// Oldest order first
    #[default]
    Fifo,
    /// Customer tier first, then larger orders, then older orders
    Priority,
}

impl AllocationPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            AllocationPolicy::Fifo => "fifo",
            AllocationPolicy::Priority => "priority",
        }
    }

    /// Sorts demands into allocation order
    pub fn order(&self, demands: &mut [Demand]) {
        match self {
            AllocationPolicy::Fifo => demands.sort_by(fifo_cmp),
            AllocationPolicy::Priority => demands.sort_by(priority_cmp),
        }
    }

    /// Builds an allocation plan for one variant
    pub fn plan(&self, demands: &[Demand], available_stock: i32) -> AllocationPlan {
        let mut ordered = demands.to_vec();
        self.order(&mut ordered);
        greedy_grant(&ordered, available_stock)
    }
}

impl std::str::FromStr for AllocationPolicy {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fifo" => Ok(AllocationPolicy::Fifo),
            "priority" => Ok(AllocationPolicy::Priority),
            other => Err(ParseEnumError::new("allocation_policy", other)),
        }
    }
}

/// One order line's unmet need for a variant
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Demand {
    pub order_line_id: Uuid,
    pub order_id: Uuid,
    pub order_created_at: DateTime<Utc>,
    pub customer_priority: i32,
    pub user_type_rank: i32,
    pub order_total_amount: Decimal,
    pub needed_quantity: i32,
}

/// Quantity granted to one order line
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Grant {
    pub order_line_id: Uuid,
    pub order_id: Uuid,
    pub granted_quantity: i32,
}

/// Ordered list of grants plus what remained unmet
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AllocationPlan {
    pub grants: Vec<Grant>,
    /// Demands that received less than they needed, in allocation order
    pub unmet: Vec<Uuid>,
    pub remaining_stock: i32,
}

impl AllocationPlan {
    pub fn granted_total(&self) -> i32 {
        self.grants.iter().map(|g| g.granted_quantity).sum()
    }

    pub fn granted_for(&self, order_line_id: Uuid) -> i32 {
        self.grants
            .iter()
            .filter(|g| g.order_line_id == order_line_id)
            .map(|g| g.granted_quantity)
            .sum()
    }
}

fn fifo_cmp(a: &Demand, b: &Demand) -> Ordering {
    a.order_created_at
        .cmp(&b.order_created_at)
        .then_with(|| a.order_line_id.cmp(&b.order_line_id))
}

fn priority_cmp(a: &Demand, b: &Demand) -> Ordering {
    a.customer_priority
        .cmp(&b.customer_priority)
        .then_with(|| a.user_type_rank.cmp(&b.user_type_rank))
        .then_with(|| b.order_total_amount.cmp(&a.order_total_amount))
        .then_with(|| fifo_cmp(a, b))
}

/// Grants demands in the given order until stock runs out.
///
/// Only grants greater than zero are emitted.
fn greedy_grant(ordered: &[Demand], available_stock: i32) -> AllocationPlan {
    let mut remaining = available_stock.max(0);
    let mut plan = AllocationPlan::default();

    for demand in ordered {
        let need = demand.needed_quantity.max(0);
        if need == 0 {
            continue;
        }
        let granted = need.min(remaining);
        if granted > 0 {
            remaining -= granted;
            plan.grants.push(Grant {
                order_line_id: demand.order_line_id,
                order_id: demand.order_id,
                granted_quantity: granted,
            });
        }
        if granted < need {
            plan.unmet.push(demand.order_line_id);
        }
    }

    plan.remaining_stock = remaining;
    plan
}
