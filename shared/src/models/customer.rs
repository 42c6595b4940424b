//! Customer tier models

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::ParseEnumError;

/// Customer account type, highest tier first
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum UserType {
    /// 총판
    MainDistributor,
    /// 대리점
    Distributor,
    /// 소매점
    Retailer,
}

impl UserType {
    /// Lower rank wins under the priority policy
    pub fn rank(&self) -> i32 {
        match self {
            UserType::MainDistributor => 0,
            UserType::Distributor => 1,
            UserType::Retailer => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UserType::MainDistributor => "main_distributor",
            UserType::Distributor => "distributor",
            UserType::Retailer => "retailer",
        }
    }
}

impl std::str::FromStr for UserType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "main_distributor" => Ok(UserType::MainDistributor),
            "distributor" => Ok(UserType::Distributor),
            "retailer" => Ok(UserType::Retailer),
            other => Err(ParseEnumError::new("user_type", other)),
        }
    }
}

/// The allocation-relevant slice of a customer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Customer {
    pub id: Uuid,
    pub user_type: UserType,
    /// Lower value = higher priority
    pub priority_level: i32,
}
