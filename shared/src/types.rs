//! Common types used across the engine

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Error returned when a stored enum value cannot be parsed
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown {kind} value: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseEnumError {
    pub fn new(kind: &'static str, value: impl Into<String>) -> Self {
        Self {
            kind,
            value: value.into(),
        }
    }
}

/// What a stock movement points back to
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceType {
    Order,
    Statement,
}

impl ReferenceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReferenceType::Order => "order",
            ReferenceType::Statement => "statement",
        }
    }
}

impl std::str::FromStr for ReferenceType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "order" => Ok(ReferenceType::Order),
            "statement" => Ok(ReferenceType::Statement),
            other => Err(ParseEnumError::new("reference_type", other)),
        }
    }
}

/// Reference attached to a movement
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Reference {
    pub reference_type: ReferenceType,
    pub reference_id: Uuid,
}

impl Reference {
    pub fn order(order_id: Uuid) -> Self {
        Self {
            reference_type: ReferenceType::Order,
            reference_id: order_id,
        }
    }

    pub fn statement(statement_id: Uuid) -> Self {
        Self {
            reference_type: ReferenceType::Statement,
            reference_id: statement_id,
        }
    }
}
