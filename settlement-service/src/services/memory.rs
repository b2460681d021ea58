//! In-process store used for local runs and tests.
//!
//! Each conditional write holds the entry's shard lock for the whole
//! check-and-set, which gives the same single-document atomicity the
//! MongoDB store gets from filtered updates.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use service_core::error::AppError;

use crate::models::{
    AccrualStatus, SettlementLineItem, SettlementRun, SettlementStatus, SettlementTotals,
    SupplierAccrual,
};
use crate::services::store::{
    AccrualFilter, AccrualRevision, RunFilter, RunTransition, SettlementStore,
};

#[derive(Default)]
pub struct InMemorySettlementStore {
    accruals: DashMap<String, SupplierAccrual>,
    runs: DashMap<String, SettlementRun>,
}

impl InMemorySettlementStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SettlementStore for InMemorySettlementStore {
    async fn health_check(&self) -> Result<(), AppError> {
        Ok(())
    }

    async fn insert_accrual(&self, accrual: &SupplierAccrual) -> Result<(), AppError> {
        if self.accruals.contains_key(&accrual.accrual_id) {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Accrual {} already exists",
                accrual.accrual_id
            )));
        }
        self.accruals
            .insert(accrual.accrual_id.clone(), accrual.clone());
        Ok(())
    }

    async fn find_accrual(
        &self,
        org_id: &str,
        accrual_id: &str,
    ) -> Result<Option<SupplierAccrual>, AppError> {
        Ok(self
            .accruals
            .get(accrual_id)
            .filter(|a| a.organization_id == org_id)
            .map(|a| a.clone()))
    }

    async fn list_accruals(
        &self,
        org_id: &str,
        filter: &AccrualFilter,
    ) -> Result<Vec<SupplierAccrual>, AppError> {
        let mut accruals: Vec<SupplierAccrual> = self
            .accruals
            .iter()
            .filter(|a| a.organization_id == org_id && filter.matches(a))
            .map(|a| a.clone())
            .collect();
        accruals.sort_by(|a, b| a.accrued_at.cmp(&b.accrued_at));
        accruals.truncate(filter.effective_limit() as usize);
        Ok(accruals)
    }

    async fn find_locked_accruals(
        &self,
        org_id: &str,
        settlement_id: &str,
    ) -> Result<Vec<SupplierAccrual>, AppError> {
        let mut accruals: Vec<SupplierAccrual> = self
            .accruals
            .iter()
            .filter(|a| {
                a.organization_id == org_id
                    && a.settlement_id.as_deref() == Some(settlement_id)
                    && a.status == AccrualStatus::InSettlement
            })
            .map(|a| a.clone())
            .collect();
        accruals.sort_by(|a, b| a.accrued_at.cmp(&b.accrued_at));
        Ok(accruals)
    }

    async fn lock_accrual(
        &self,
        org_id: &str,
        accrual_id: &str,
        expected: AccrualStatus,
        settlement_id: &str,
    ) -> Result<bool, AppError> {
        let Some(mut accrual) = self.accruals.get_mut(accrual_id) else {
            return Ok(false);
        };
        if accrual.organization_id != org_id
            || accrual.settlement_id.is_some()
            || accrual.status != expected
        {
            return Ok(false);
        }
        accrual.settlement_id = Some(settlement_id.to_string());
        accrual.status = AccrualStatus::InSettlement;
        accrual.lock_prev_status = Some(expected);
        accrual.updated_at = Some(Utc::now());
        Ok(true)
    }

    async fn unlock_accrual(
        &self,
        org_id: &str,
        accrual_id: &str,
        settlement_id: &str,
        restore_to: AccrualStatus,
    ) -> Result<bool, AppError> {
        let Some(mut accrual) = self.accruals.get_mut(accrual_id) else {
            return Ok(false);
        };
        if accrual.organization_id != org_id
            || accrual.settlement_id.as_deref() != Some(settlement_id)
            || accrual.status != AccrualStatus::InSettlement
        {
            return Ok(false);
        }
        accrual.settlement_id = None;
        accrual.status = restore_to;
        accrual.lock_prev_status = None;
        accrual.updated_at = Some(Utc::now());
        Ok(true)
    }

    async fn release_settlement_accruals(
        &self,
        org_id: &str,
        settlement_id: &str,
    ) -> Result<u64, AppError> {
        let now = Utc::now();
        let mut released = 0;
        for mut accrual in self.accruals.iter_mut() {
            if accrual.organization_id == org_id
                && accrual.settlement_id.as_deref() == Some(settlement_id)
                && accrual.status == AccrualStatus::InSettlement
            {
                accrual.settlement_id = None;
                accrual.status = AccrualStatus::Accrued;
                accrual.lock_prev_status = None;
                accrual.updated_at = Some(now);
                released += 1;
            }
        }
        Ok(released)
    }

    async fn restore_accrual_status(
        &self,
        org_id: &str,
        accrual_id: &str,
        status: AccrualStatus,
    ) -> Result<bool, AppError> {
        let Some(mut accrual) = self.accruals.get_mut(accrual_id) else {
            return Ok(false);
        };
        if accrual.organization_id != org_id
            || accrual.settlement_id.is_some()
            || accrual.status != AccrualStatus::Accrued
        {
            return Ok(false);
        }
        accrual.status = status;
        accrual.updated_at = Some(Utc::now());
        Ok(true)
    }

    async fn revise_accrual(
        &self,
        org_id: &str,
        accrual_id: &str,
        expected: AccrualStatus,
        revision: &AccrualRevision,
    ) -> Result<Option<SupplierAccrual>, AppError> {
        let Some(mut accrual) = self.accruals.get_mut(accrual_id) else {
            return Ok(None);
        };
        if accrual.organization_id != org_id
            || accrual.settlement_id.is_some()
            || accrual.status != expected
        {
            return Ok(None);
        }
        revision.apply(&mut accrual);
        Ok(Some(accrual.clone()))
    }

    async fn insert_run(&self, run: &SettlementRun) -> Result<(), AppError> {
        if self.runs.contains_key(&run.settlement_id) {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Settlement {} already exists",
                run.settlement_id
            )));
        }
        self.runs.insert(run.settlement_id.clone(), run.clone());
        Ok(())
    }

    async fn find_run(
        &self,
        org_id: &str,
        settlement_id: &str,
    ) -> Result<Option<SettlementRun>, AppError> {
        Ok(self
            .runs
            .get(settlement_id)
            .filter(|r| r.organization_id == org_id)
            .map(|r| r.clone()))
    }

    async fn find_open_run(
        &self,
        org_id: &str,
        supplier_id: &str,
        currency: &str,
    ) -> Result<Option<SettlementRun>, AppError> {
        Ok(self
            .runs
            .iter()
            .find(|r| {
                r.organization_id == org_id
                    && r.supplier_id == supplier_id
                    && r.currency == currency
                    && r.status.is_open()
            })
            .map(|r| r.clone()))
    }

    async fn list_runs(
        &self,
        org_id: &str,
        filter: &RunFilter,
    ) -> Result<Vec<SettlementRun>, AppError> {
        let mut runs: Vec<SettlementRun> = self
            .runs
            .iter()
            .filter(|r| r.organization_id == org_id && filter.matches(r))
            .map(|r| r.clone())
            .collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        runs.truncate(filter.effective_limit() as usize);
        Ok(runs)
    }

    async fn push_line_items(
        &self,
        org_id: &str,
        settlement_id: &str,
        items: &[SettlementLineItem],
    ) -> Result<bool, AppError> {
        let Some(mut run) = self.runs.get_mut(settlement_id) else {
            return Ok(false);
        };
        if run.organization_id != org_id || run.status != SettlementStatus::Draft {
            return Ok(false);
        }
        run.line_items.extend_from_slice(items);
        run.updated_at = Utc::now();
        Ok(true)
    }

    async fn pull_line_items(
        &self,
        org_id: &str,
        settlement_id: &str,
        accrual_ids: &[String],
    ) -> Result<bool, AppError> {
        let Some(mut run) = self.runs.get_mut(settlement_id) else {
            return Ok(false);
        };
        if run.organization_id != org_id || run.status != SettlementStatus::Draft {
            return Ok(false);
        }
        run.line_items
            .retain(|item| !accrual_ids.contains(&item.accrual_id));
        run.updated_at = Utc::now();
        Ok(true)
    }

    async fn set_totals(
        &self,
        org_id: &str,
        settlement_id: &str,
        totals: &SettlementTotals,
    ) -> Result<bool, AppError> {
        let Some(mut run) = self.runs.get_mut(settlement_id) else {
            return Ok(false);
        };
        if run.organization_id != org_id || run.status != SettlementStatus::Draft {
            return Ok(false);
        }
        run.totals = totals.clone();
        run.updated_at = Utc::now();
        Ok(true)
    }

    async fn transition_run(
        &self,
        org_id: &str,
        settlement_id: &str,
        from: &[SettlementStatus],
        transition: &RunTransition,
    ) -> Result<Option<SettlementRun>, AppError> {
        let Some(mut run) = self.runs.get_mut(settlement_id) else {
            return Ok(None);
        };
        if run.organization_id != org_id || !from.contains(&run.status) {
            return Ok(None);
        }
        transition.apply(&mut run);
        Ok(Some(run.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accrual(org: &str) -> SupplierAccrual {
        SupplierAccrual::new(org, "bkg-1", "sup-1", "EUR", "100".parse().unwrap())
    }

    #[tokio::test]
    async fn test_lock_is_compare_and_swap() {
        let store = InMemorySettlementStore::new();
        let a = accrual("org-1");
        store.insert_accrual(&a).await.unwrap();

        assert!(store
            .lock_accrual("org-1", &a.accrual_id, AccrualStatus::Accrued, "run-1")
            .await
            .unwrap());
        // Second claimant loses even with the same expected status.
        assert!(!store
            .lock_accrual("org-1", &a.accrual_id, AccrualStatus::Accrued, "run-2")
            .await
            .unwrap());

        let stored = store.find_accrual("org-1", &a.accrual_id).await.unwrap().unwrap();
        assert_eq!(stored.settlement_id.as_deref(), Some("run-1"));
        assert_eq!(stored.lock_prev_status, Some(AccrualStatus::Accrued));
    }

    #[tokio::test]
    async fn test_lock_rejects_stale_expected_status() {
        let store = InMemorySettlementStore::new();
        let mut a = accrual("org-1");
        a.status = AccrualStatus::Adjusted;
        store.insert_accrual(&a).await.unwrap();

        assert!(!store
            .lock_accrual("org-1", &a.accrual_id, AccrualStatus::Accrued, "run-1")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_queries_are_scoped_by_organization() {
        let store = InMemorySettlementStore::new();
        let a = accrual("org-1");
        store.insert_accrual(&a).await.unwrap();

        assert!(store.find_accrual("org-2", &a.accrual_id).await.unwrap().is_none());
        assert!(!store
            .lock_accrual("org-2", &a.accrual_id, AccrualStatus::Accrued, "run-1")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_restore_only_touches_unlocked_accrued() {
        let store = InMemorySettlementStore::new();
        let a = accrual("org-1");
        store.insert_accrual(&a).await.unwrap();
        store
            .lock_accrual("org-1", &a.accrual_id, AccrualStatus::Accrued, "run-1")
            .await
            .unwrap();

        assert!(!store
            .restore_accrual_status("org-1", &a.accrual_id, AccrualStatus::Adjusted)
            .await
            .unwrap());
        assert_eq!(
            store.release_settlement_accruals("org-1", "run-1").await.unwrap(),
            1
        );
        assert!(store
            .restore_accrual_status("org-1", &a.accrual_id, AccrualStatus::Adjusted)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_transition_requires_expected_status() {
        let store = InMemorySettlementStore::new();
        let run = SettlementRun::new_draft("org-1", "sup-1", "EUR", None, "ops");
        store.insert_run(&run).await.unwrap();

        let pay = RunTransition::MarkPaid {
            paid_by: "ops".to_string(),
            paid_at: Utc::now(),
            payment_reference: None,
        };
        assert!(store
            .transition_run("org-1", &run.settlement_id, &[SettlementStatus::Approved], &pay)
            .await
            .unwrap()
            .is_none());
    }
}
