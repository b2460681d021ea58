//! Settlement run: one payable batch to one supplier in one currency.

use chrono::{DateTime, NaiveDate, Utc};
use mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::opt_chrono_datetime_as_bson_datetime;
use super::AccrualStatus;

/// Settlement run status.
///
/// `draft -> approved -> paid`, or `draft | approved -> cancelled`.
/// `paid` and `cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementStatus {
    Draft,
    Approved,
    Paid,
    Cancelled,
}

impl SettlementStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SettlementStatus::Draft => "draft",
            SettlementStatus::Approved => "approved",
            SettlementStatus::Paid => "paid",
            SettlementStatus::Cancelled => "cancelled",
        }
    }

    /// Open runs block a second run for the same supplier and currency.
    pub fn is_open(&self) -> bool {
        matches!(self, SettlementStatus::Draft | SettlementStatus::Approved)
    }

    pub const OPEN: [SettlementStatus; 2] = [SettlementStatus::Draft, SettlementStatus::Approved];
}

impl std::fmt::Display for SettlementStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Inclusive date range a run covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementPeriod {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl SettlementPeriod {
    pub fn is_valid(&self) -> bool {
        self.start <= self.end
    }
}

/// One accrual claimed by a run.
///
/// While the run is a draft these mirror the accrual at lock time; approval
/// rewrites them from the locked accruals themselves.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SettlementLineItem {
    pub accrual_id: String,
    pub booking_id: String,
    pub net_payable: Decimal,
    pub status_at_approval: AccrualStatus,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub accrued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SettlementTotals {
    pub total_items: i64,
    pub total_net_payable: Decimal,
}

impl SettlementTotals {
    /// Totals are always derived from the full item set, never adjusted
    /// incrementally.
    pub fn from_line_items(items: &[SettlementLineItem]) -> Self {
        Self {
            total_items: items.len() as i64,
            total_net_payable: items.iter().map(|item| item.net_payable).sum(),
        }
    }
}

/// Settlement run document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SettlementRun {
    #[serde(rename = "_id")]
    pub settlement_id: String,
    pub organization_id: String,
    pub supplier_id: String,
    pub currency: String,
    pub status: SettlementStatus,
    #[serde(default)]
    pub period: Option<SettlementPeriod>,
    #[serde(default)]
    pub line_items: Vec<SettlementLineItem>,
    #[serde(default)]
    pub totals: SettlementTotals,
    pub created_by: String,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_by: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "opt_chrono_datetime_as_bson_datetime"
    )]
    pub approved_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paid_by: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "opt_chrono_datetime_as_bson_datetime"
    )]
    pub paid_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancelled_by: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "opt_chrono_datetime_as_bson_datetime"
    )]
    pub cancelled_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_reason: Option<String>,
}

impl SettlementRun {
    pub fn new_draft(
        organization_id: impl Into<String>,
        supplier_id: impl Into<String>,
        currency: impl Into<String>,
        period: Option<SettlementPeriod>,
        created_by: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            settlement_id: uuid::Uuid::new_v4().to_string(),
            organization_id: organization_id.into(),
            supplier_id: supplier_id.into(),
            currency: currency.into().to_uppercase(),
            status: SettlementStatus::Draft,
            period,
            line_items: Vec::new(),
            totals: SettlementTotals::default(),
            created_by: created_by.into(),
            created_at: now,
            updated_at: now,
            approved_by: None,
            approved_at: None,
            paid_by: None,
            paid_at: None,
            payment_reference: None,
            cancelled_by: None,
            cancelled_at: None,
            cancel_reason: None,
        }
    }

    pub fn contains_accrual(&self, accrual_id: &str) -> bool {
        self.line_items
            .iter()
            .any(|item| item.accrual_id == accrual_id)
    }
}
