//! Accrual reads and the adjust/reverse operations that change an accrual
//! outside of settlement.

use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{info, instrument};

use crate::models::{AccrualStatus, SupplierAccrual};
use crate::services::error::SettlementError;
use crate::services::metrics::{record_lock_conflict, record_operation};
use crate::services::store::{AccrualFilter, AccrualRevision, SettlementStore};
use service_core::error::AppError;

#[derive(Clone)]
pub struct AccrualService {
    store: Arc<dyn SettlementStore>,
}

impl AccrualService {
    pub fn new(store: Arc<dyn SettlementStore>) -> Self {
        Self { store }
    }

    /// Insert an accrual produced by booking ingestion.
    #[instrument(skip(self, accrual), fields(accrual_id = %accrual.accrual_id))]
    pub async fn record(&self, accrual: SupplierAccrual) -> Result<SupplierAccrual, SettlementError> {
        if accrual.net_payable.is_sign_negative() {
            return Err(
                AppError::BadRequest(anyhow::anyhow!("net_payable must not be negative")).into(),
            );
        }
        self.store.insert_accrual(&accrual).await?;
        info!(
            booking_id = %accrual.booking_id,
            supplier_id = %accrual.supplier_id,
            "Accrual recorded"
        );
        Ok(accrual)
    }

    #[instrument(skip(self))]
    pub async fn get_accrual(
        &self,
        org_id: &str,
        accrual_id: &str,
    ) -> Result<SupplierAccrual, SettlementError> {
        if uuid::Uuid::parse_str(accrual_id).is_err() {
            return Err(SettlementError::AccrualNotFound);
        }
        self.store
            .find_accrual(org_id, accrual_id)
            .await?
            .ok_or(SettlementError::AccrualNotFound)
    }

    #[instrument(skip(self, filter))]
    pub async fn list_accruals(
        &self,
        org_id: &str,
        filter: &AccrualFilter,
    ) -> Result<Vec<SupplierAccrual>, SettlementError> {
        Ok(self.store.list_accruals(org_id, filter).await?)
    }

    #[instrument(skip(self, reason))]
    pub async fn adjust(
        &self,
        org_id: &str,
        accrual_id: &str,
        net_payable: Decimal,
        reason: Option<String>,
        adjusted_by: &str,
    ) -> Result<SupplierAccrual, SettlementError> {
        if net_payable.is_sign_negative() {
            return Err(
                AppError::BadRequest(anyhow::anyhow!("net_payable must not be negative")).into(),
            );
        }
        let revision = AccrualRevision::Adjust {
            net_payable,
            reason,
        };
        let result = self.revise(org_id, accrual_id, &revision).await;
        record_operation(org_id, "adjust_accrual", outcome(&result));
        let accrual = result?;
        info!(
            accrual_id = %accrual_id,
            net_payable = %accrual.net_payable,
            adjusted_by = %adjusted_by,
            "Accrual adjusted"
        );
        Ok(accrual)
    }

    #[instrument(skip(self, reason))]
    pub async fn reverse(
        &self,
        org_id: &str,
        accrual_id: &str,
        reason: Option<String>,
        reversed_by: &str,
    ) -> Result<SupplierAccrual, SettlementError> {
        let revision = AccrualRevision::Reverse { reason };
        let result = self.revise(org_id, accrual_id, &revision).await;
        record_operation(org_id, "reverse_accrual", outcome(&result));
        let accrual = result?;
        info!(accrual_id = %accrual_id, reversed_by = %reversed_by, "Accrual reversed");
        Ok(accrual)
    }

    async fn revise(
        &self,
        org_id: &str,
        accrual_id: &str,
        revision: &AccrualRevision,
    ) -> Result<SupplierAccrual, SettlementError> {
        let current = self.get_accrual(org_id, accrual_id).await?;
        ensure_revisable(&current, revision)?;

        match self
            .store
            .revise_accrual(org_id, accrual_id, current.status, revision)
            .await?
        {
            Some(updated) => Ok(updated),
            None => {
                record_lock_conflict("revise_accrual");
                // Report the state that beat us.
                let latest = self.get_accrual(org_id, accrual_id).await?;
                ensure_revisable(&latest, revision)?;
                Err(SettlementError::AccrualLocked {
                    accrual_id: accrual_id.to_string(),
                })
            }
        }
    }
}

fn ensure_revisable(
    accrual: &SupplierAccrual,
    revision: &AccrualRevision,
) -> Result<(), SettlementError> {
    if accrual.status == AccrualStatus::Reversed
        && matches!(revision, AccrualRevision::Reverse { .. })
    {
        return Err(SettlementError::AccrualAlreadyReversed {
            accrual_id: accrual.accrual_id.clone(),
        });
    }
    if accrual.is_locked() || !accrual.status.is_open() {
        return Err(SettlementError::AccrualLocked {
            accrual_id: accrual.accrual_id.clone(),
        });
    }
    Ok(())
}

fn outcome<T>(result: &Result<T, SettlementError>) -> &'static str {
    match result {
        Ok(_) => "ok",
        Err(e) => e.code(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::memory::InMemorySettlementStore;

    const ORG: &str = "org-1";

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    async fn setup() -> (Arc<InMemorySettlementStore>, AccrualService, SupplierAccrual) {
        let store = Arc::new(InMemorySettlementStore::new());
        let service = AccrualService::new(store.clone());
        let accrual = service
            .record(SupplierAccrual::new(ORG, "bkg-1", "sup-1", "EUR", dec("80.00")))
            .await
            .unwrap();
        (store, service, accrual)
    }

    #[tokio::test]
    async fn test_adjust_sets_amount_and_status() {
        let (_, service, accrual) = setup().await;
        let adjusted = service
            .adjust(
                ORG,
                &accrual.accrual_id,
                dec("72.50"),
                Some("late checkout refund".to_string()),
                "ops",
            )
            .await
            .unwrap();
        assert_eq!(adjusted.status, AccrualStatus::Adjusted);
        assert_eq!(adjusted.net_payable, dec("72.50"));
        assert_eq!(
            adjusted.adjustment_reason.as_deref(),
            Some("late checkout refund")
        );

        // Adjusted accruals can be adjusted again.
        let again = service
            .adjust(ORG, &accrual.accrual_id, dec("70"), None, "ops")
            .await
            .unwrap();
        assert_eq!(again.net_payable, dec("70"));
    }

    #[tokio::test]
    async fn test_adjust_rejects_negative_amount() {
        let (_, service, accrual) = setup().await;
        let err = service
            .adjust(ORG, &accrual.accrual_id, dec("-1"), None, "ops")
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), axum::http::StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_locked_accrual_cannot_be_changed() {
        let (store, service, accrual) = setup().await;
        store
            .lock_accrual(ORG, &accrual.accrual_id, AccrualStatus::Accrued, "run-1")
            .await
            .unwrap();

        let err = service
            .adjust(ORG, &accrual.accrual_id, dec("1"), None, "ops")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "accrual_locked");

        let err = service
            .reverse(ORG, &accrual.accrual_id, None, "ops")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "accrual_locked");
    }

    #[tokio::test]
    async fn test_reverse_twice() {
        let (_, service, accrual) = setup().await;
        let reversed = service
            .reverse(ORG, &accrual.accrual_id, Some("booking cancelled".into()), "ops")
            .await
            .unwrap();
        assert_eq!(reversed.status, AccrualStatus::Reversed);

        let err = service
            .reverse(ORG, &accrual.accrual_id, None, "ops")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "accrual_already_reversed");

        let err = service
            .adjust(ORG, &accrual.accrual_id, dec("5"), None, "ops")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "accrual_locked");
    }

    #[tokio::test]
    async fn test_get_is_scoped_and_tolerates_bad_ids() {
        let (_, service, accrual) = setup().await;
        assert!(service.get_accrual(ORG, &accrual.accrual_id).await.is_ok());
        assert_eq!(
            service
                .get_accrual("org-2", &accrual.accrual_id)
                .await
                .unwrap_err()
                .code(),
            "accrual_not_found"
        );
        assert_eq!(
            service.get_accrual(ORG, "xyz").await.unwrap_err().code(),
            "accrual_not_found"
        );
    }

    #[tokio::test]
    async fn test_list_filters_by_status() {
        let (_, service, accrual) = setup().await;
        service
            .record(SupplierAccrual::new(ORG, "bkg-2", "sup-1", "EUR", dec("10")))
            .await
            .unwrap();
        service
            .reverse(ORG, &accrual.accrual_id, None, "ops")
            .await
            .unwrap();

        let filter = AccrualFilter {
            status: Some(AccrualStatus::Accrued),
            ..Default::default()
        };
        let open = service.list_accruals(ORG, &filter).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].booking_id, "bkg-2");
    }
}
