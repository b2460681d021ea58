//! Supplier accrual: money owed to a supplier for one booking.

use chrono::{DateTime, Utc};
use mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::opt_chrono_datetime_as_bson_datetime;

/// Accrual status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccrualStatus {
    Accrued,
    Adjusted,
    InSettlement,
    Reversed,
}

impl AccrualStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccrualStatus::Accrued => "accrued",
            AccrualStatus::Adjusted => "adjusted",
            AccrualStatus::InSettlement => "in_settlement",
            AccrualStatus::Reversed => "reversed",
        }
    }

    /// Statuses an unlocked accrual may be in to be claimed by a run,
    /// adjusted or reversed.
    pub fn is_open(&self) -> bool {
        matches!(self, AccrualStatus::Accrued | AccrualStatus::Adjusted)
    }
}

impl std::fmt::Display for AccrualStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Accrual document.
///
/// `settlement_id` is set iff `status == InSettlement`; `lock_prev_status`
/// remembers what to restore when the lock is released.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SupplierAccrual {
    #[serde(rename = "_id")]
    pub accrual_id: String,
    pub organization_id: String,
    pub booking_id: String,
    pub supplier_id: String,
    pub currency: String,
    pub net_payable: Decimal,
    pub status: AccrualStatus,
    #[serde(default)]
    pub settlement_id: Option<String>,
    #[serde(default)]
    pub lock_prev_status: Option<AccrualStatus>,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub accrued_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adjustment_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reversal_reason: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "opt_chrono_datetime_as_bson_datetime"
    )]
    pub updated_at: Option<DateTime<Utc>>,
}

impl SupplierAccrual {
    pub fn new(
        organization_id: impl Into<String>,
        booking_id: impl Into<String>,
        supplier_id: impl Into<String>,
        currency: impl Into<String>,
        net_payable: Decimal,
    ) -> Self {
        Self {
            accrual_id: uuid::Uuid::new_v4().to_string(),
            organization_id: organization_id.into(),
            booking_id: booking_id.into(),
            supplier_id: supplier_id.into(),
            currency: currency.into().to_uppercase(),
            net_payable,
            status: AccrualStatus::Accrued,
            settlement_id: None,
            lock_prev_status: None,
            accrued_at: Utc::now(),
            adjustment_reason: None,
            reversal_reason: None,
            updated_at: None,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.settlement_id.is_some() || self.status == AccrualStatus::InSettlement
    }

    /// Whether this accrual can be claimed by a run for `supplier_id`/`currency`.
    pub fn is_settleable_for(&self, supplier_id: &str, currency: &str) -> bool {
        !self.is_locked()
            && self.status.is_open()
            && self.supplier_id == supplier_id
            && self.currency == currency
    }

    /// Status to restore when this accrual's settlement lock is released.
    pub fn restore_status(&self) -> AccrualStatus {
        self.lock_prev_status.unwrap_or(AccrualStatus::Accrued)
    }
}
