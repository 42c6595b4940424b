//! Order status projection from line allocation state

use serde::Serialize;

use crate::models::{OrderLine, OrderStatus};

/// Derives an order's status from its lines.
///
/// Every line fully allocated gives `Confirmed`, some allocation gives
/// `Partial`, none gives `Pending`. An order without lines is `Pending`.
pub fn project_status(lines: &[OrderLine]) -> OrderStatus {
    if lines.is_empty() {
        return OrderStatus::Pending;
    }
    if lines.iter().all(OrderLine::is_fully_allocated) {
        OrderStatus::Confirmed
    } else if lines.iter().any(|l| l.allocated_quantity > 0) {
        OrderStatus::Partial
    } else {
        OrderStatus::Pending
    }
}

/// Applies the projection on top of a stored status; terminal statuses win
pub fn next_status(current: OrderStatus, lines: &[OrderLine]) -> OrderStatus {
    if current.is_terminal() {
        current
    } else {
        project_status(lines)
    }
}

/// Counts of orders by projected status
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct StatusTally {
    pub fully_allocated: usize,
    pub partially_allocated: usize,
    pub unallocated: usize,
}

impl StatusTally {
    pub fn record(&mut self, status: OrderStatus) {
        match status {
            OrderStatus::Confirmed | OrderStatus::Shipped => self.fully_allocated += 1,
            OrderStatus::Partial => self.partially_allocated += 1,
            OrderStatus::Pending | OrderStatus::Cancelled => self.unallocated += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.fully_allocated + self.partially_allocated + self.unallocated
    }
}
