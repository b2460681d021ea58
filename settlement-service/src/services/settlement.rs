//! Settlement run service: create, add/remove items, approve, mark paid, cancel.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::models::{
    AccrualStatus, SettlementLineItem, SettlementPeriod, SettlementRun, SettlementStatus,
    SettlementTotals, SupplierAccrual,
};
use crate::services::error::SettlementError;
use crate::services::metrics::{record_lock_conflict, record_operation};
use crate::services::store::{RunFilter, RunTransition, SettlementStore};
use service_core::error::AppError;

/// Result of an add or remove batch.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ItemsChange {
    pub settlement_id: String,
    pub accrual_ids: Vec<String>,
    pub totals: SettlementTotals,
}

#[derive(Debug, Clone)]
pub struct CreateRun {
    pub supplier_id: String,
    pub currency: String,
    pub period: Option<SettlementPeriod>,
}

#[derive(Clone)]
pub struct SettlementService {
    store: Arc<dyn SettlementStore>,
}

impl SettlementService {
    pub fn new(store: Arc<dyn SettlementStore>) -> Self {
        Self { store }
    }

    #[instrument(skip(self, request), fields(supplier_id = %request.supplier_id))]
    pub async fn create_run(
        &self,
        org_id: &str,
        request: CreateRun,
        created_by: &str,
    ) -> Result<SettlementRun, SettlementError> {
        let result = self.create_run_inner(org_id, request, created_by).await;
        track(org_id, "create_run", &result);
        result
    }

    async fn create_run_inner(
        &self,
        org_id: &str,
        request: CreateRun,
        created_by: &str,
    ) -> Result<SettlementRun, SettlementError> {
        if let Some(period) = &request.period {
            if !period.is_valid() {
                return Err(AppError::BadRequest(anyhow::anyhow!("period start must not be after period end"))
                .into());
            }
        }

        let currency = request.currency.trim().to_uppercase();

        // Read-then-write: a concurrent create can still slip through.
        if let Some(existing) = self
            .store
            .find_open_run(org_id, &request.supplier_id, &currency)
            .await?
        {
            return Err(SettlementError::OpenSettlementExists {
                settlement_id: existing.settlement_id,
            });
        }

        let run = SettlementRun::new_draft(
            org_id,
            request.supplier_id,
            currency,
            request.period,
            created_by,
        );
        self.store.insert_run(&run).await?;

        info!(
            settlement_id = %run.settlement_id,
            organization_id = %org_id,
            "Settlement run created"
        );
        Ok(run)
    }

    #[instrument(skip(self))]
    pub async fn get_run(
        &self,
        org_id: &str,
        settlement_id: &str,
    ) -> Result<SettlementRun, SettlementError> {
        self.load_run(org_id, settlement_id).await
    }

    #[instrument(skip(self, filter))]
    pub async fn list_runs(
        &self,
        org_id: &str,
        filter: &RunFilter,
    ) -> Result<Vec<SettlementRun>, SettlementError> {
        Ok(self.store.list_runs(org_id, filter).await?)
    }

    #[instrument(skip(self, accrual_ids), fields(count = accrual_ids.len()))]
    pub async fn add_items(
        &self,
        org_id: &str,
        settlement_id: &str,
        accrual_ids: &[String],
        triggered_by: &str,
    ) -> Result<ItemsChange, SettlementError> {
        let result = self
            .add_items_inner(org_id, settlement_id, accrual_ids, triggered_by)
            .await;
        track(org_id, "add_items", &result);
        result
    }

    async fn add_items_inner(
        &self,
        org_id: &str,
        settlement_id: &str,
        accrual_ids: &[String],
        triggered_by: &str,
    ) -> Result<ItemsChange, SettlementError> {
        let run = self.load_run(org_id, settlement_id).await?;
        ensure_draft(&run)?;

        let ids = dedupe(accrual_ids);
        let mut candidates = Vec::with_capacity(ids.len());
        for accrual_id in &ids {
            let not_eligible = || SettlementError::AccrualNotEligible {
                accrual_id: accrual_id.clone(),
            };
            if run.contains_accrual(accrual_id) {
                return Err(not_eligible());
            }
            let accrual = self
                .find_accrual_by_id(org_id, accrual_id)
                .await?
                .ok_or_else(not_eligible)?;
            if !accrual.is_settleable_for(&run.supplier_id, &run.currency) {
                return Err(not_eligible());
            }
            candidates.push(accrual);
        }

        let mut locked: Vec<&SupplierAccrual> = Vec::with_capacity(candidates.len());
        for accrual in &candidates {
            let won = self
                .store
                .lock_accrual(org_id, &accrual.accrual_id, accrual.status, settlement_id)
                .await?;
            if !won {
                record_lock_conflict("lock_accrual");
                warn!(
                    accrual_id = %accrual.accrual_id,
                    "Accrual lock lost to a concurrent writer"
                );
                self.release_batch(org_id, settlement_id, &locked).await;
                return Err(SettlementError::AccrualNotEligible {
                    accrual_id: accrual.accrual_id.clone(),
                });
            }
            locked.push(accrual);
        }

        let items: Vec<SettlementLineItem> = candidates.iter().map(line_item_for).collect();
        if !self
            .store
            .push_line_items(org_id, settlement_id, &items)
            .await?
        {
            self.release_batch(org_id, settlement_id, &locked).await;
            return Err(self.not_draft(org_id, settlement_id).await);
        }

        let totals = self.recompute_totals(org_id, settlement_id).await?;

        info!(
            settlement_id = %settlement_id,
            added = ids.len(),
            triggered_by = %triggered_by,
            "Accruals added to settlement"
        );
        Ok(ItemsChange {
            settlement_id: settlement_id.to_string(),
            accrual_ids: ids,
            totals,
        })
    }

    #[instrument(skip(self, accrual_ids), fields(count = accrual_ids.len()))]
    pub async fn remove_items(
        &self,
        org_id: &str,
        settlement_id: &str,
        accrual_ids: &[String],
        triggered_by: &str,
    ) -> Result<ItemsChange, SettlementError> {
        let result = self
            .remove_items_inner(org_id, settlement_id, accrual_ids, triggered_by)
            .await;
        track(org_id, "remove_items", &result);
        result
    }

    async fn remove_items_inner(
        &self,
        org_id: &str,
        settlement_id: &str,
        accrual_ids: &[String],
        triggered_by: &str,
    ) -> Result<ItemsChange, SettlementError> {
        let run = self.load_run(org_id, settlement_id).await?;
        ensure_draft(&run)?;

        let ids = dedupe(accrual_ids);
        let mut targets = Vec::with_capacity(ids.len());
        for accrual_id in &ids {
            let not_in_run = || SettlementError::AccrualNotInThisSettlement {
                accrual_id: accrual_id.clone(),
            };
            if !run.contains_accrual(accrual_id) {
                return Err(not_in_run());
            }
            let accrual = self
                .find_accrual_by_id(org_id, accrual_id)
                .await?
                .ok_or_else(not_in_run)?;
            if accrual.settlement_id.as_deref() != Some(settlement_id) {
                return Err(not_in_run());
            }
            targets.push(accrual);
        }

        let mut released: Vec<String> = Vec::with_capacity(targets.len());
        for accrual in &targets {
            let won = match self
                .store
                .unlock_accrual(
                    org_id,
                    &accrual.accrual_id,
                    settlement_id,
                    accrual.restore_status(),
                )
                .await
            {
                Ok(won) => won,
                Err(e) => {
                    self.drop_released_items(org_id, settlement_id, &released).await;
                    return Err(e.into());
                }
            };
            if !won {
                record_lock_conflict("unlock_accrual");
                warn!(
                    accrual_id = %accrual.accrual_id,
                    "Accrual unlock lost to a concurrent writer"
                );
                self.drop_released_items(org_id, settlement_id, &released).await;
                return Err(SettlementError::AccrualNotInThisSettlement {
                    accrual_id: accrual.accrual_id.clone(),
                });
            }
            released.push(accrual.accrual_id.clone());
        }

        if !self
            .store
            .pull_line_items(org_id, settlement_id, &ids)
            .await?
        {
            return Err(self.not_draft(org_id, settlement_id).await);
        }

        let totals = self.recompute_totals(org_id, settlement_id).await?;

        info!(
            settlement_id = %settlement_id,
            removed = ids.len(),
            triggered_by = %triggered_by,
            "Accruals removed from settlement"
        );
        Ok(ItemsChange {
            settlement_id: settlement_id.to_string(),
            accrual_ids: ids,
            totals,
        })
    }

    /// Freeze the run: line items are rebuilt from the accruals locked to it.
    #[instrument(skip(self))]
    pub async fn approve(
        &self,
        org_id: &str,
        settlement_id: &str,
        approved_by: &str,
        approved_at: Option<DateTime<Utc>>,
    ) -> Result<SettlementRun, SettlementError> {
        let result = self
            .approve_inner(org_id, settlement_id, approved_by, approved_at)
            .await;
        track(org_id, "approve", &result);
        result
    }

    async fn approve_inner(
        &self,
        org_id: &str,
        settlement_id: &str,
        approved_by: &str,
        approved_at: Option<DateTime<Utc>>,
    ) -> Result<SettlementRun, SettlementError> {
        let run = self.load_run(org_id, settlement_id).await?;
        ensure_draft(&run)?;
        if run.line_items.is_empty() {
            return Err(SettlementError::SettlementEmpty);
        }

        let locked = self
            .store
            .find_locked_accruals(org_id, settlement_id)
            .await?;
        let snapshot = snapshot_line_items(&run, &locked);
        if snapshot.is_empty() {
            return Err(SettlementError::SettlementEmpty);
        }
        let totals = SettlementTotals::from_line_items(&snapshot);

        let transition = RunTransition::Approve {
            line_items: snapshot,
            totals,
            approved_by: approved_by.to_string(),
            approved_at: approved_at.unwrap_or_else(Utc::now),
        };
        let approved = match self
            .store
            .transition_run(org_id, settlement_id, &[SettlementStatus::Draft], &transition)
            .await?
        {
            Some(run) => run,
            None => return Err(self.not_draft(org_id, settlement_id).await),
        };

        // An add that landed after the snapshot was taken holds a lock the
        // frozen run does not list.
        let stray = self
            .store
            .find_locked_accruals(org_id, settlement_id)
            .await?;
        for accrual in stray
            .iter()
            .filter(|a| !approved.contains_accrual(&a.accrual_id))
        {
            record_lock_conflict("approve_snapshot");
            warn!(
                accrual_id = %accrual.accrual_id,
                "Releasing accrual locked outside the approval snapshot"
            );
            self.store
                .unlock_accrual(
                    org_id,
                    &accrual.accrual_id,
                    settlement_id,
                    accrual.restore_status(),
                )
                .await?;
        }

        info!(
            settlement_id = %settlement_id,
            total_items = approved.totals.total_items,
            total_net_payable = %approved.totals.total_net_payable,
            "Settlement approved"
        );
        Ok(approved)
    }

    #[instrument(skip(self))]
    pub async fn mark_paid(
        &self,
        org_id: &str,
        settlement_id: &str,
        paid_by: &str,
        paid_at: Option<DateTime<Utc>>,
        payment_reference: Option<String>,
    ) -> Result<SettlementRun, SettlementError> {
        let result = self
            .mark_paid_inner(org_id, settlement_id, paid_by, paid_at, payment_reference)
            .await;
        track(org_id, "mark_paid", &result);
        result
    }

    async fn mark_paid_inner(
        &self,
        org_id: &str,
        settlement_id: &str,
        paid_by: &str,
        paid_at: Option<DateTime<Utc>>,
        payment_reference: Option<String>,
    ) -> Result<SettlementRun, SettlementError> {
        let run = self.load_run(org_id, settlement_id).await?;
        ensure_approved(&run)?;

        let transition = RunTransition::MarkPaid {
            paid_by: paid_by.to_string(),
            paid_at: paid_at.unwrap_or_else(Utc::now),
            payment_reference,
        };
        match self
            .store
            .transition_run(
                org_id,
                settlement_id,
                &[SettlementStatus::Approved],
                &transition,
            )
            .await?
        {
            Some(paid) => {
                info!(settlement_id = %settlement_id, "Settlement marked paid");
                Ok(paid)
            }
            None => {
                let current = self.load_run(org_id, settlement_id).await?;
                Err(SettlementError::SettlementNotApproved {
                    status: current.status,
                })
            }
        }
    }

    /// Cancel a draft or approved run and release every accrual locked to it.
    ///
    /// The run is closed first so no add can lock into it afterwards. The
    /// release then runs in two passes: a blanket unlock to `accrued`, then a
    /// conditional restore of each accrual's recorded pre-lock status. A crash
    /// between the passes leaves those accruals at `accrued`.
    #[instrument(skip(self, reason))]
    pub async fn cancel(
        &self,
        org_id: &str,
        settlement_id: &str,
        cancelled_by: &str,
        reason: Option<String>,
    ) -> Result<SettlementRun, SettlementError> {
        let result = self
            .cancel_inner(org_id, settlement_id, cancelled_by, reason)
            .await;
        track(org_id, "cancel", &result);
        result
    }

    async fn cancel_inner(
        &self,
        org_id: &str,
        settlement_id: &str,
        cancelled_by: &str,
        reason: Option<String>,
    ) -> Result<SettlementRun, SettlementError> {
        let run = self.load_run(org_id, settlement_id).await?;
        ensure_cancellable(&run)?;

        let transition = RunTransition::Cancel {
            cancelled_by: cancelled_by.to_string(),
            cancelled_at: Utc::now(),
            reason,
        };
        let cancelled = match self
            .store
            .transition_run(org_id, settlement_id, &SettlementStatus::OPEN, &transition)
            .await?
        {
            Some(run) => run,
            None => {
                let current = self.load_run(org_id, settlement_id).await?;
                ensure_cancellable(&current)?;
                return Err(SettlementError::SettlementNotDraft {
                    status: current.status,
                });
            }
        };

        let locked = self
            .store
            .find_locked_accruals(org_id, settlement_id)
            .await?;

        let released = self
            .store
            .release_settlement_accruals(org_id, settlement_id)
            .await?;

        let mut restored = 0u64;
        for accrual in &locked {
            let prev = accrual.restore_status();
            if prev == AccrualStatus::Accrued {
                continue;
            }
            if self
                .store
                .restore_accrual_status(org_id, &accrual.accrual_id, prev)
                .await?
            {
                restored += 1;
            } else {
                record_lock_conflict("restore_accrual_status");
            }
        }

        info!(
            settlement_id = %settlement_id,
            released = released,
            restored = restored,
            "Settlement cancelled"
        );
        Ok(cancelled)
    }

    async fn load_run(
        &self,
        org_id: &str,
        settlement_id: &str,
    ) -> Result<SettlementRun, SettlementError> {
        if !is_uuid(settlement_id) {
            return Err(SettlementError::SettlementNotFound);
        }
        self.store
            .find_run(org_id, settlement_id)
            .await?
            .ok_or(SettlementError::SettlementNotFound)
    }

    async fn find_accrual_by_id(
        &self,
        org_id: &str,
        accrual_id: &str,
    ) -> Result<Option<SupplierAccrual>, SettlementError> {
        if !is_uuid(accrual_id) {
            return Ok(None);
        }
        Ok(self.store.find_accrual(org_id, accrual_id).await?)
    }

    /// Recompute totals from the stored line items and write them back.
    async fn recompute_totals(
        &self,
        org_id: &str,
        settlement_id: &str,
    ) -> Result<SettlementTotals, SettlementError> {
        let run = self.load_run(org_id, settlement_id).await?;
        let totals = SettlementTotals::from_line_items(&run.line_items);
        if !self.store.set_totals(org_id, settlement_id, &totals).await? {
            return Err(self.not_draft(org_id, settlement_id).await);
        }
        Ok(totals)
    }

    /// Undo locks taken earlier in a batch that could not complete.
    async fn release_batch(
        &self,
        org_id: &str,
        settlement_id: &str,
        locked: &[&SupplierAccrual],
    ) {
        for accrual in locked {
            if let Err(e) = self
                .store
                .unlock_accrual(org_id, &accrual.accrual_id, settlement_id, accrual.status)
                .await
            {
                tracing::error!(
                    accrual_id = %accrual.accrual_id,
                    error = %e,
                    "Failed to release accrual after aborted batch"
                );
            }
        }
    }

    /// Pull the line items of accruals already unlocked by a remove that
    /// could not complete, so the draft never lists an accrual it no longer
    /// holds.
    async fn drop_released_items(&self, org_id: &str, settlement_id: &str, released: &[String]) {
        if released.is_empty() {
            return;
        }
        let result = match self
            .store
            .pull_line_items(org_id, settlement_id, released)
            .await
        {
            Ok(true) => self.recompute_totals(org_id, settlement_id).await.map(|_| ()),
            Ok(false) => Ok(()),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            tracing::error!(
                settlement_id = %settlement_id,
                error = %e,
                "Failed to drop line items after aborted remove"
            );
        }
    }

    async fn not_draft(&self, org_id: &str, settlement_id: &str) -> SettlementError {
        match self.load_run(org_id, settlement_id).await {
            Ok(run) => SettlementError::SettlementNotDraft { status: run.status },
            Err(e) => e,
        }
    }
}

fn ensure_draft(run: &SettlementRun) -> Result<(), SettlementError> {
    if run.status != SettlementStatus::Draft {
        return Err(SettlementError::SettlementNotDraft { status: run.status });
    }
    Ok(())
}

fn ensure_approved(run: &SettlementRun) -> Result<(), SettlementError> {
    if run.status != SettlementStatus::Approved {
        return Err(SettlementError::SettlementNotApproved { status: run.status });
    }
    Ok(())
}

fn ensure_cancellable(run: &SettlementRun) -> Result<(), SettlementError> {
    match run.status {
        SettlementStatus::Paid => Err(SettlementError::SettlementAlreadyPaid),
        SettlementStatus::Cancelled => {
            Err(SettlementError::SettlementNotDraft { status: run.status })
        }
        _ => Ok(()),
    }
}

fn is_uuid(id: &str) -> bool {
    uuid::Uuid::parse_str(id).is_ok()
}

fn dedupe(ids: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    ids.iter()
        .map(|id| id.trim().to_string())
        .filter(|id| seen.insert(id.clone()))
        .collect()
}

fn line_item_for(accrual: &SupplierAccrual) -> SettlementLineItem {
    SettlementLineItem {
        accrual_id: accrual.accrual_id.clone(),
        booking_id: accrual.booking_id.clone(),
        net_payable: accrual.net_payable,
        status_at_approval: accrual.status,
        accrued_at: accrual.accrued_at,
    }
}

/// Approval snapshot: accruals both listed on the draft and still locked to
/// it, in line-item order.
fn snapshot_line_items(run: &SettlementRun, locked: &[SupplierAccrual]) -> Vec<SettlementLineItem> {
    run.line_items
        .iter()
        .filter_map(|item| locked.iter().find(|a| a.accrual_id == item.accrual_id))
        .map(|accrual| SettlementLineItem {
            accrual_id: accrual.accrual_id.clone(),
            booking_id: accrual.booking_id.clone(),
            net_payable: accrual.net_payable,
            status_at_approval: accrual.restore_status(),
            accrued_at: accrual.accrued_at,
        })
        .collect()
}

fn track<T>(org_id: &str, operation: &str, result: &Result<T, SettlementError>) {
    let outcome = match result {
        Ok(_) => "ok",
        Err(e) => e.code(),
    };
    record_operation(org_id, operation, outcome);
}
