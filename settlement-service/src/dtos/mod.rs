//! Request and response payloads for the settlement HTTP API.
//!
//! Money is serialised as decimal strings and timestamps as RFC 3339.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::models::{
    AccrualStatus, SettlementLineItem, SettlementPeriod, SettlementRun, SettlementStatus,
    SettlementTotals, SupplierAccrual,
};
use crate::services::{AccrualFilter, ItemsChange, RunFilter};

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, Validate)]
#[validate(schema(function = "validate_period_bounds"))]
pub struct CreateSettlementRequest {
    #[validate(length(min = 1, message = "supplier_id cannot be empty"))]
    pub supplier_id: String,
    #[validate(length(equal = 3, message = "currency must be a 3-letter ISO code"))]
    pub currency: String,
    pub period_start: Option<NaiveDate>,
    pub period_end: Option<NaiveDate>,
}

impl CreateSettlementRequest {
    /// Call after `validate`, which rejects a period with only one bound.
    pub fn period(&self) -> Option<SettlementPeriod> {
        match (self.period_start, self.period_end) {
            (Some(start), Some(end)) => Some(SettlementPeriod { start, end }),
            _ => None,
        }
    }
}

fn validate_period_bounds(request: &CreateSettlementRequest) -> Result<(), ValidationError> {
    if request.period_start.is_some() != request.period_end.is_some() {
        let mut error = ValidationError::new("period_incomplete");
        error.message = Some("period_start and period_end must be given together".into());
        return Err(error);
    }
    Ok(())
}

#[derive(Debug, Deserialize, Validate)]
pub struct AccrualIdsRequest {
    #[validate(length(min = 1, max = 500, message = "accrual_ids must contain 1 to 500 ids"))]
    pub accrual_ids: Vec<String>,
}

#[derive(Debug, Default, Deserialize, Validate)]
pub struct ApproveRequest {
    pub approved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Deserialize, Validate)]
pub struct CancelRequest {
    #[validate(length(max = 1000))]
    pub reason: Option<String>,
}

#[derive(Debug, Default, Deserialize, Validate)]
pub struct MarkPaidRequest {
    pub paid_at: Option<DateTime<Utc>>,
    #[validate(length(min = 1, max = 200))]
    pub payment_reference: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct AdjustAccrualRequest {
    #[validate(custom(function = "validate_non_negative"))]
    pub net_payable: Decimal,
    #[validate(length(max = 1000))]
    pub reason: Option<String>,
}

#[derive(Debug, Default, Deserialize, Validate)]
pub struct ReverseAccrualRequest {
    #[validate(length(max = 1000))]
    pub reason: Option<String>,
}

fn validate_non_negative(value: &Decimal) -> Result<(), ValidationError> {
    if value.is_sign_negative() {
        return Err(ValidationError::new("net_payable_negative"));
    }
    Ok(())
}

#[derive(Debug, Default, Deserialize)]
pub struct ListSettlementsQuery {
    pub supplier_id: Option<String>,
    pub currency: Option<String>,
    pub status: Option<SettlementStatus>,
    pub limit: Option<i64>,
}

impl From<ListSettlementsQuery> for RunFilter {
    fn from(query: ListSettlementsQuery) -> Self {
        RunFilter {
            supplier_id: query.supplier_id,
            currency: query.currency.map(|c| c.to_uppercase()),
            status: query.status,
            limit: query.limit,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ListAccrualsQuery {
    pub supplier_id: Option<String>,
    pub currency: Option<String>,
    pub status: Option<AccrualStatus>,
    pub settlement_id: Option<String>,
    pub limit: Option<i64>,
}

impl From<ListAccrualsQuery> for AccrualFilter {
    fn from(query: ListAccrualsQuery) -> Self {
        AccrualFilter {
            supplier_id: query.supplier_id,
            currency: query.currency.map(|c| c.to_uppercase()),
            status: query.status,
            settlement_id: query.settlement_id,
            limit: query.limit,
        }
    }
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct TotalsResponse {
    pub total_items: i64,
    pub total_net_payable: Decimal,
}

impl From<SettlementTotals> for TotalsResponse {
    fn from(totals: SettlementTotals) -> Self {
        Self {
            total_items: totals.total_items,
            total_net_payable: totals.total_net_payable,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LineItemResponse {
    pub accrual_id: String,
    pub booking_id: String,
    pub net_payable: Decimal,
    pub status_at_approval: AccrualStatus,
    pub accrued_at: DateTime<Utc>,
}

impl From<SettlementLineItem> for LineItemResponse {
    fn from(item: SettlementLineItem) -> Self {
        Self {
            accrual_id: item.accrual_id,
            booking_id: item.booking_id,
            net_payable: item.net_payable,
            status_at_approval: item.status_at_approval,
            accrued_at: item.accrued_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SettlementResponse {
    pub settlement_id: String,
    pub supplier_id: String,
    pub currency: String,
    pub status: SettlementStatus,
    pub period: Option<SettlementPeriod>,
    pub line_items: Vec<LineItemResponse>,
    pub totals: TotalsResponse,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approved_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approved_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paid_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paid_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_reference: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancelled_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancelled_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancel_reason: Option<String>,
}

impl From<SettlementRun> for SettlementResponse {
    fn from(run: SettlementRun) -> Self {
        Self {
            settlement_id: run.settlement_id,
            supplier_id: run.supplier_id,
            currency: run.currency,
            status: run.status,
            period: run.period,
            line_items: run.line_items.into_iter().map(Into::into).collect(),
            totals: run.totals.into(),
            created_by: run.created_by,
            created_at: run.created_at,
            updated_at: run.updated_at,
            approved_by: run.approved_by,
            approved_at: run.approved_at,
            paid_by: run.paid_by,
            paid_at: run.paid_at,
            payment_reference: run.payment_reference,
            cancelled_by: run.cancelled_by,
            cancelled_at: run.cancelled_at,
            cancel_reason: run.cancel_reason,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ItemsAddedResponse {
    pub settlement_id: String,
    pub added: Vec<String>,
    pub totals: TotalsResponse,
}

impl From<ItemsChange> for ItemsAddedResponse {
    fn from(change: ItemsChange) -> Self {
        Self {
            settlement_id: change.settlement_id,
            added: change.accrual_ids,
            totals: change.totals.into(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ItemsRemovedResponse {
    pub settlement_id: String,
    pub removed: Vec<String>,
    pub totals: TotalsResponse,
}

impl From<ItemsChange> for ItemsRemovedResponse {
    fn from(change: ItemsChange) -> Self {
        Self {
            settlement_id: change.settlement_id,
            removed: change.accrual_ids,
            totals: change.totals.into(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AccrualResponse {
    pub accrual_id: String,
    pub booking_id: String,
    pub supplier_id: String,
    pub currency: String,
    pub net_payable: Decimal,
    pub status: AccrualStatus,
    pub settlement_id: Option<String>,
    pub accrued_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adjustment_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reversal_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl From<SupplierAccrual> for AccrualResponse {
    fn from(accrual: SupplierAccrual) -> Self {
        Self {
            accrual_id: accrual.accrual_id,
            booking_id: accrual.booking_id,
            supplier_id: accrual.supplier_id,
            currency: accrual.currency,
            net_payable: accrual.net_payable,
            status: accrual.status,
            settlement_id: accrual.settlement_id,
            accrued_at: accrual.accrued_at,
            adjustment_reason: accrual.adjustment_reason,
            reversal_reason: accrual.reversal_reason,
            updated_at: accrual.updated_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListResponse<T> {
    pub items: Vec<T>,
    pub count: usize,
}

impl<T> ListResponse<T> {
    pub fn new(items: Vec<T>) -> Self {
        let count = items.len();
        Self { items, count }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_money_serialises_as_string() {
        let totals = TotalsResponse {
            total_items: 2,
            total_net_payable: "150.00".parse().unwrap(),
        };
        let json = serde_json::to_value(&totals).unwrap();
        assert_eq!(json["total_net_payable"], "150.00");
    }

    #[test]
    fn test_adjust_rejects_negative_amount() {
        let request: AdjustAccrualRequest =
            serde_json::from_str(r#"{"net_payable": "-5.00"}"#).unwrap();
        assert!(request.validate().is_err());

        let request: AdjustAccrualRequest =
            serde_json::from_str(r#"{"net_payable": "5.00"}"#).unwrap();
        assert!(request.validate().is_ok());
    }

    #[test]
    fn test_create_request_validation() {
        let request: CreateSettlementRequest =
            serde_json::from_str(r#"{"supplier_id": "", "currency": "EURO"}"#).unwrap();
        let errors = request.validate().unwrap_err();
        let fields = errors.field_errors();
        assert!(fields.contains_key("supplier_id"));
        assert!(fields.contains_key("currency"));
    }

    #[test]
    fn test_period_requires_both_bounds() {
        let request: CreateSettlementRequest = serde_json::from_str(
            r#"{"supplier_id": "s", "currency": "EUR", "period_start": "2024-01-01"}"#,
        )
        .unwrap();
        assert!(request.validate().is_err());

        let request: CreateSettlementRequest = serde_json::from_str(
            r#"{"supplier_id": "s", "currency": "EUR", "period_end": "2024-01-31"}"#,
        )
        .unwrap();
        assert!(request.validate().is_err());

        let request: CreateSettlementRequest =
            serde_json::from_str(r#"{"supplier_id": "s", "currency": "EUR"}"#).unwrap();
        assert!(request.validate().is_ok());
        assert!(request.period().is_none());

        let request: CreateSettlementRequest = serde_json::from_str(
            r#"{"supplier_id": "s", "currency": "EUR", "period_start": "2024-01-01", "period_end": "2024-01-31"}"#,
        )
        .unwrap();
        assert!(request.validate().is_ok());
        assert!(request.period().is_some());
    }
}
