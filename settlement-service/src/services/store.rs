//! Document-store seam for accruals and settlement runs.
//!
//! Every mutating method is a conditional single-document write: the
//! expected prior state is part of the match, and a `false`/`None` result
//! means another writer got there first. Nothing here overwrites blindly.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;

use crate::models::{
    AccrualStatus, SettlementLineItem, SettlementRun, SettlementStatus, SettlementTotals,
    SupplierAccrual,
};

pub const DEFAULT_LIST_LIMIT: i64 = 50;
pub const MAX_LIST_LIMIT: i64 = 500;

/// Filter parameters for listing accruals.
#[derive(Debug, Clone, Default)]
pub struct AccrualFilter {
    pub supplier_id: Option<String>,
    pub currency: Option<String>,
    pub status: Option<AccrualStatus>,
    pub settlement_id: Option<String>,
    pub limit: Option<i64>,
}

impl AccrualFilter {
    pub fn matches(&self, accrual: &SupplierAccrual) -> bool {
        self.supplier_id
            .as_deref()
            .is_none_or(|s| accrual.supplier_id == s)
            && self.currency.as_deref().is_none_or(|c| accrual.currency == c)
            && self.status.is_none_or(|s| accrual.status == s)
            && self
                .settlement_id
                .as_deref()
                .is_none_or(|id| accrual.settlement_id.as_deref() == Some(id))
    }

    pub fn effective_limit(&self) -> i64 {
        clamp_limit(self.limit)
    }
}

/// Filter parameters for listing settlement runs.
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub supplier_id: Option<String>,
    pub currency: Option<String>,
    pub status: Option<SettlementStatus>,
    pub limit: Option<i64>,
}

impl RunFilter {
    pub fn matches(&self, run: &SettlementRun) -> bool {
        self.supplier_id
            .as_deref()
            .is_none_or(|s| run.supplier_id == s)
            && self.currency.as_deref().is_none_or(|c| run.currency == c)
            && self.status.is_none_or(|s| run.status == s)
    }

    pub fn effective_limit(&self) -> i64 {
        clamp_limit(self.limit)
    }
}

fn clamp_limit(limit: Option<i64>) -> i64 {
    limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT)
}

/// Status change applied to a run, conditional on its current status.
#[derive(Debug, Clone)]
pub enum RunTransition {
    Approve {
        line_items: Vec<SettlementLineItem>,
        totals: SettlementTotals,
        approved_by: String,
        approved_at: DateTime<Utc>,
    },
    MarkPaid {
        paid_by: String,
        paid_at: DateTime<Utc>,
        payment_reference: Option<String>,
    },
    Cancel {
        cancelled_by: String,
        cancelled_at: DateTime<Utc>,
        reason: Option<String>,
    },
}

impl RunTransition {
    pub fn target_status(&self) -> SettlementStatus {
        match self {
            RunTransition::Approve { .. } => SettlementStatus::Approved,
            RunTransition::MarkPaid { .. } => SettlementStatus::Paid,
            RunTransition::Cancel { .. } => SettlementStatus::Cancelled,
        }
    }

    pub fn apply(&self, run: &mut SettlementRun) {
        run.status = self.target_status();
        run.updated_at = Utc::now();
        match self {
            RunTransition::Approve {
                line_items,
                totals,
                approved_by,
                approved_at,
            } => {
                run.line_items = line_items.clone();
                run.totals = totals.clone();
                run.approved_by = Some(approved_by.clone());
                run.approved_at = Some(*approved_at);
            }
            RunTransition::MarkPaid {
                paid_by,
                paid_at,
                payment_reference,
            } => {
                run.paid_by = Some(paid_by.clone());
                run.paid_at = Some(*paid_at);
                run.payment_reference = payment_reference.clone();
            }
            RunTransition::Cancel {
                cancelled_by,
                cancelled_at,
                reason,
            } => {
                run.cancelled_by = Some(cancelled_by.clone());
                run.cancelled_at = Some(*cancelled_at);
                run.cancel_reason = reason.clone();
            }
        }
    }
}

/// Change applied to an unlocked accrual outside of settlement.
#[derive(Debug, Clone)]
pub enum AccrualRevision {
    Adjust {
        net_payable: Decimal,
        reason: Option<String>,
    },
    Reverse {
        reason: Option<String>,
    },
}

impl AccrualRevision {
    pub fn target_status(&self) -> AccrualStatus {
        match self {
            AccrualRevision::Adjust { .. } => AccrualStatus::Adjusted,
            AccrualRevision::Reverse { .. } => AccrualStatus::Reversed,
        }
    }

    pub fn apply(&self, accrual: &mut SupplierAccrual) {
        accrual.status = self.target_status();
        accrual.updated_at = Some(Utc::now());
        match self {
            AccrualRevision::Adjust {
                net_payable,
                reason,
            } => {
                accrual.net_payable = *net_payable;
                accrual.adjustment_reason = reason.clone();
            }
            AccrualRevision::Reverse { reason } => {
                accrual.reversal_reason = reason.clone();
            }
        }
    }
}

#[async_trait]
pub trait SettlementStore: Send + Sync {
    async fn health_check(&self) -> Result<(), AppError>;

    // ---------------------------------------------------------------------
    // Accruals
    // ---------------------------------------------------------------------

    async fn insert_accrual(&self, accrual: &SupplierAccrual) -> Result<(), AppError>;

    async fn find_accrual(
        &self,
        org_id: &str,
        accrual_id: &str,
    ) -> Result<Option<SupplierAccrual>, AppError>;

    async fn list_accruals(
        &self,
        org_id: &str,
        filter: &AccrualFilter,
    ) -> Result<Vec<SupplierAccrual>, AppError>;

    /// Accruals currently locked to `settlement_id`, oldest accrual first.
    async fn find_locked_accruals(
        &self,
        org_id: &str,
        settlement_id: &str,
    ) -> Result<Vec<SupplierAccrual>, AppError>;

    /// Lock an unlocked accrual whose status is still `expected`.
    async fn lock_accrual(
        &self,
        org_id: &str,
        accrual_id: &str,
        expected: AccrualStatus,
        settlement_id: &str,
    ) -> Result<bool, AppError>;

    /// Release an accrual locked to `settlement_id`, setting `restore_to`.
    async fn unlock_accrual(
        &self,
        org_id: &str,
        accrual_id: &str,
        settlement_id: &str,
        restore_to: AccrualStatus,
    ) -> Result<bool, AppError>;

    /// Blanket release of every accrual locked to `settlement_id` back to
    /// `accrued`. Returns the number released.
    async fn release_settlement_accruals(
        &self,
        org_id: &str,
        settlement_id: &str,
    ) -> Result<u64, AppError>;

    /// Move an unlocked `accrued` accrual to `status`.
    async fn restore_accrual_status(
        &self,
        org_id: &str,
        accrual_id: &str,
        status: AccrualStatus,
    ) -> Result<bool, AppError>;

    /// Apply `revision` to an unlocked accrual whose status is still `expected`.
    async fn revise_accrual(
        &self,
        org_id: &str,
        accrual_id: &str,
        expected: AccrualStatus,
        revision: &AccrualRevision,
    ) -> Result<Option<SupplierAccrual>, AppError>;

    // ---------------------------------------------------------------------
    // Settlement runs
    // ---------------------------------------------------------------------

    async fn insert_run(&self, run: &SettlementRun) -> Result<(), AppError>;

    async fn find_run(
        &self,
        org_id: &str,
        settlement_id: &str,
    ) -> Result<Option<SettlementRun>, AppError>;

    /// The draft or approved run for this supplier and currency, if any.
    async fn find_open_run(
        &self,
        org_id: &str,
        supplier_id: &str,
        currency: &str,
    ) -> Result<Option<SettlementRun>, AppError>;

    /// Runs matching `filter`, newest first.
    async fn list_runs(
        &self,
        org_id: &str,
        filter: &RunFilter,
    ) -> Result<Vec<SettlementRun>, AppError>;

    /// Append line items to a run that is still a draft.
    async fn push_line_items(
        &self,
        org_id: &str,
        settlement_id: &str,
        items: &[SettlementLineItem],
    ) -> Result<bool, AppError>;

    /// Remove line items from a run that is still a draft.
    async fn pull_line_items(
        &self,
        org_id: &str,
        settlement_id: &str,
        accrual_ids: &[String],
    ) -> Result<bool, AppError>;

    /// Store recomputed totals on a run that is still a draft.
    async fn set_totals(
        &self,
        org_id: &str,
        settlement_id: &str,
        totals: &SettlementTotals,
    ) -> Result<bool, AppError>;

    /// Apply `transition` if the run's status is one of `from`; returns the
    /// updated run, or `None` when nothing matched.
    async fn transition_run(
        &self,
        org_id: &str,
        settlement_id: &str,
        from: &[SettlementStatus],
        transition: &RunTransition,
    ) -> Result<Option<SettlementRun>, AppError>;
}
