//! MongoDB store for settlement-service.

use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::{
    bson::{doc, to_bson, DateTime as BsonDateTime, Document},
    options::{FindOneAndUpdateOptions, FindOptions, IndexOptions, ReturnDocument},
    Client as MongoClient, Collection, Database, IndexModel,
};
use service_core::error::AppError;
use tracing::{info, instrument};

use crate::models::{
    AccrualStatus, SettlementLineItem, SettlementRun, SettlementStatus, SettlementTotals,
    SupplierAccrual,
};
use crate::services::metrics::db_timer;
use crate::services::store::{
    AccrualFilter, AccrualRevision, RunFilter, RunTransition, SettlementStore,
};

const ACCRUALS_COLLECTION: &str = "supplier_accruals";
const RUNS_COLLECTION: &str = "settlement_runs";

#[derive(Clone)]
pub struct MongoSettlementStore {
    client: MongoClient,
    db: Database,
}

impl MongoSettlementStore {
    #[instrument(skip(uri))]
    pub async fn connect(uri: &str, database: &str) -> Result<Self, AppError> {
        info!("Connecting to MongoDB");
        let client = MongoClient::with_uri_str(uri).await.map_err(|e| {
            tracing::error!("Failed to connect to MongoDB: {}", e);
            AppError::DatabaseError(anyhow::anyhow!(e.to_string()))
        })?;
        let db = client.database(database);
        info!(database = %database, "Successfully connected to MongoDB database");
        Ok(Self { client, db })
    }

    fn accruals(&self) -> Collection<SupplierAccrual> {
        self.db.collection(ACCRUALS_COLLECTION)
    }

    fn runs(&self) -> Collection<SettlementRun> {
        self.db.collection(RUNS_COLLECTION)
    }

    /// Create indexes for the org-scoped lookups the service performs.
    pub async fn initialize_indexes(&self) -> Result<(), AppError> {
        info!("Creating MongoDB indexes for settlement-service");

        let accrual_lock_index = IndexModel::builder()
            .keys(doc! { "organization_id": 1, "settlement_id": 1, "status": 1 })
            .options(
                IndexOptions::builder()
                    .name("org_settlement_status_idx".to_string())
                    .build(),
            )
            .build();

        let accrual_supplier_index = IndexModel::builder()
            .keys(doc! { "organization_id": 1, "supplier_id": 1, "currency": 1, "status": 1 })
            .options(
                IndexOptions::builder()
                    .name("org_supplier_currency_status_idx".to_string())
                    .build(),
            )
            .build();

        self.accruals()
            .create_indexes([accrual_lock_index, accrual_supplier_index], None)
            .await
            .map_err(|e| {
                tracing::error!("Failed to create accrual indexes: {}", e);
                AppError::DatabaseError(anyhow::anyhow!(e.to_string()))
            })?;

        let run_open_index = IndexModel::builder()
            .keys(doc! { "organization_id": 1, "supplier_id": 1, "currency": 1, "status": 1 })
            .options(
                IndexOptions::builder()
                    .name("org_supplier_currency_status_idx".to_string())
                    .build(),
            )
            .build();

        let run_created_index = IndexModel::builder()
            .keys(doc! { "organization_id": 1, "created_at": -1 })
            .options(
                IndexOptions::builder()
                    .name("org_created_at_idx".to_string())
                    .build(),
            )
            .build();

        self.runs()
            .create_indexes([run_open_index, run_created_index], None)
            .await
            .map_err(|e| {
                tracing::error!("Failed to create settlement run indexes: {}", e);
                AppError::DatabaseError(anyhow::anyhow!(e.to_string()))
            })?;

        info!("Successfully created all MongoDB indexes");
        Ok(())
    }
}

fn status_bson<T: serde::Serialize>(value: &T) -> Result<mongodb::bson::Bson, AppError> {
    Ok(to_bson(value)?)
}

fn now_bson() -> BsonDateTime {
    BsonDateTime::now()
}

fn run_transition_set(transition: &RunTransition) -> Result<Document, AppError> {
    let mut set = doc! {
        "status": status_bson(&transition.target_status())?,
        "updated_at": now_bson(),
    };
    match transition {
        RunTransition::Approve {
            line_items,
            totals,
            approved_by,
            approved_at,
        } => {
            set.insert("line_items", to_bson(line_items)?);
            set.insert("totals", to_bson(totals)?);
            set.insert("approved_by", approved_by.as_str());
            set.insert("approved_at", BsonDateTime::from_chrono(*approved_at));
        }
        RunTransition::MarkPaid {
            paid_by,
            paid_at,
            payment_reference,
        } => {
            set.insert("paid_by", paid_by.as_str());
            set.insert("paid_at", BsonDateTime::from_chrono(*paid_at));
            if let Some(reference) = payment_reference {
                set.insert("payment_reference", reference.as_str());
            }
        }
        RunTransition::Cancel {
            cancelled_by,
            cancelled_at,
            reason,
        } => {
            set.insert("cancelled_by", cancelled_by.as_str());
            set.insert("cancelled_at", BsonDateTime::from_chrono(*cancelled_at));
            if let Some(reason) = reason {
                set.insert("cancel_reason", reason.as_str());
            }
        }
    }
    Ok(set)
}

fn accrual_revision_set(revision: &AccrualRevision) -> Result<Document, AppError> {
    let mut set = doc! {
        "status": status_bson(&revision.target_status())?,
        "updated_at": now_bson(),
    };
    match revision {
        AccrualRevision::Adjust {
            net_payable,
            reason,
        } => {
            set.insert("net_payable", to_bson(net_payable)?);
            if let Some(reason) = reason {
                set.insert("adjustment_reason", reason.as_str());
            }
        }
        AccrualRevision::Reverse { reason } => {
            if let Some(reason) = reason {
                set.insert("reversal_reason", reason.as_str());
            }
        }
    }
    Ok(set)
}

fn after_update() -> FindOneAndUpdateOptions {
    FindOneAndUpdateOptions::builder()
        .return_document(ReturnDocument::After)
        .build()
}

#[async_trait]
impl SettlementStore for MongoSettlementStore {
    async fn health_check(&self) -> Result<(), AppError> {
        self.client
            .database("admin")
            .run_command(doc! { "ping": 1 }, None)
            .await
            .map_err(|e| {
                tracing::error!("MongoDB health check failed: {}", e);
                AppError::DatabaseError(anyhow::anyhow!(e.to_string()))
            })?;
        Ok(())
    }

    #[instrument(skip(self, accrual), fields(accrual_id = %accrual.accrual_id))]
    async fn insert_accrual(&self, accrual: &SupplierAccrual) -> Result<(), AppError> {
        let _timer = db_timer("insert_accrual");
        self.accruals().insert_one(accrual, None).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn find_accrual(
        &self,
        org_id: &str,
        accrual_id: &str,
    ) -> Result<Option<SupplierAccrual>, AppError> {
        let _timer = db_timer("find_accrual");
        let filter = doc! { "_id": accrual_id, "organization_id": org_id };
        Ok(self.accruals().find_one(filter, None).await?)
    }

    #[instrument(skip(self, filter))]
    async fn list_accruals(
        &self,
        org_id: &str,
        filter: &AccrualFilter,
    ) -> Result<Vec<SupplierAccrual>, AppError> {
        let _timer = db_timer("list_accruals");
        let mut query = doc! { "organization_id": org_id };
        if let Some(supplier_id) = &filter.supplier_id {
            query.insert("supplier_id", supplier_id.as_str());
        }
        if let Some(currency) = &filter.currency {
            query.insert("currency", currency.as_str());
        }
        if let Some(status) = &filter.status {
            query.insert("status", status_bson(status)?);
        }
        if let Some(settlement_id) = &filter.settlement_id {
            query.insert("settlement_id", settlement_id.as_str());
        }

        let options = FindOptions::builder()
            .sort(doc! { "accrued_at": 1 })
            .limit(filter.effective_limit())
            .build();

        let cursor = self.accruals().find(query, Some(options)).await?;
        Ok(cursor.try_collect().await?)
    }

    #[instrument(skip(self))]
    async fn find_locked_accruals(
        &self,
        org_id: &str,
        settlement_id: &str,
    ) -> Result<Vec<SupplierAccrual>, AppError> {
        let _timer = db_timer("find_locked_accruals");
        let filter = doc! {
            "organization_id": org_id,
            "settlement_id": settlement_id,
            "status": AccrualStatus::InSettlement.as_str(),
        };
        let options = FindOptions::builder().sort(doc! { "accrued_at": 1 }).build();
        let cursor = self.accruals().find(filter, Some(options)).await?;
        Ok(cursor.try_collect().await?)
    }

    #[instrument(skip(self))]
    async fn lock_accrual(
        &self,
        org_id: &str,
        accrual_id: &str,
        expected: AccrualStatus,
        settlement_id: &str,
    ) -> Result<bool, AppError> {
        let _timer = db_timer("lock_accrual");
        // `settlement_id: null` also matches documents without the field.
        let filter = doc! {
            "_id": accrual_id,
            "organization_id": org_id,
            "settlement_id": null,
            "status": expected.as_str(),
        };
        let update = doc! {
            "$set": {
                "settlement_id": settlement_id,
                "status": AccrualStatus::InSettlement.as_str(),
                "lock_prev_status": expected.as_str(),
                "updated_at": now_bson(),
            }
        };
        let result = self.accruals().update_one(filter, update, None).await?;
        Ok(result.matched_count == 1)
    }

    #[instrument(skip(self))]
    async fn unlock_accrual(
        &self,
        org_id: &str,
        accrual_id: &str,
        settlement_id: &str,
        restore_to: AccrualStatus,
    ) -> Result<bool, AppError> {
        let _timer = db_timer("unlock_accrual");
        let filter = doc! {
            "_id": accrual_id,
            "organization_id": org_id,
            "settlement_id": settlement_id,
            "status": AccrualStatus::InSettlement.as_str(),
        };
        let update = doc! {
            "$set": {
                "settlement_id": null,
                "status": restore_to.as_str(),
                "lock_prev_status": null,
                "updated_at": now_bson(),
            }
        };
        let result = self.accruals().update_one(filter, update, None).await?;
        Ok(result.matched_count == 1)
    }

    #[instrument(skip(self))]
    async fn release_settlement_accruals(
        &self,
        org_id: &str,
        settlement_id: &str,
    ) -> Result<u64, AppError> {
        let _timer = db_timer("release_settlement_accruals");
        let filter = doc! {
            "organization_id": org_id,
            "settlement_id": settlement_id,
            "status": AccrualStatus::InSettlement.as_str(),
        };
        let update = doc! {
            "$set": {
                "settlement_id": null,
                "status": AccrualStatus::Accrued.as_str(),
                "lock_prev_status": null,
                "updated_at": now_bson(),
            }
        };
        let result = self.accruals().update_many(filter, update, None).await?;
        Ok(result.modified_count)
    }

    #[instrument(skip(self))]
    async fn restore_accrual_status(
        &self,
        org_id: &str,
        accrual_id: &str,
        status: AccrualStatus,
    ) -> Result<bool, AppError> {
        let _timer = db_timer("restore_accrual_status");
        let filter = doc! {
            "_id": accrual_id,
            "organization_id": org_id,
            "settlement_id": null,
            "status": AccrualStatus::Accrued.as_str(),
        };
        let update = doc! {
            "$set": {
                "status": status.as_str(),
                "updated_at": now_bson(),
            }
        };
        let result = self.accruals().update_one(filter, update, None).await?;
        Ok(result.matched_count == 1)
    }

    #[instrument(skip(self, revision))]
    async fn revise_accrual(
        &self,
        org_id: &str,
        accrual_id: &str,
        expected: AccrualStatus,
        revision: &AccrualRevision,
    ) -> Result<Option<SupplierAccrual>, AppError> {
        let _timer = db_timer("revise_accrual");
        let filter = doc! {
            "_id": accrual_id,
            "organization_id": org_id,
            "settlement_id": null,
            "status": expected.as_str(),
        };
        let update = doc! { "$set": accrual_revision_set(revision)? };
        Ok(self
            .accruals()
            .find_one_and_update(filter, update, after_update())
            .await?)
    }

    #[instrument(skip(self, run), fields(settlement_id = %run.settlement_id))]
    async fn insert_run(&self, run: &SettlementRun) -> Result<(), AppError> {
        let _timer = db_timer("insert_run");
        self.runs().insert_one(run, None).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn find_run(
        &self,
        org_id: &str,
        settlement_id: &str,
    ) -> Result<Option<SettlementRun>, AppError> {
        let _timer = db_timer("find_run");
        let filter = doc! { "_id": settlement_id, "organization_id": org_id };
        Ok(self.runs().find_one(filter, None).await?)
    }

    #[instrument(skip(self))]
    async fn find_open_run(
        &self,
        org_id: &str,
        supplier_id: &str,
        currency: &str,
    ) -> Result<Option<SettlementRun>, AppError> {
        let _timer = db_timer("find_open_run");
        let open: Vec<&str> = SettlementStatus::OPEN.iter().map(|s| s.as_str()).collect();
        let filter = doc! {
            "organization_id": org_id,
            "supplier_id": supplier_id,
            "currency": currency,
            "status": { "$in": open },
        };
        Ok(self.runs().find_one(filter, None).await?)
    }

    #[instrument(skip(self, filter))]
    async fn list_runs(
        &self,
        org_id: &str,
        filter: &RunFilter,
    ) -> Result<Vec<SettlementRun>, AppError> {
        let _timer = db_timer("list_runs");
        let mut query = doc! { "organization_id": org_id };
        if let Some(supplier_id) = &filter.supplier_id {
            query.insert("supplier_id", supplier_id.as_str());
        }
        if let Some(currency) = &filter.currency {
            query.insert("currency", currency.as_str());
        }
        if let Some(status) = &filter.status {
            query.insert("status", status.as_str());
        }

        let options = FindOptions::builder()
            .sort(doc! { "created_at": -1 })
            .limit(filter.effective_limit())
            .build();

        let cursor = self.runs().find(query, Some(options)).await?;
        Ok(cursor.try_collect().await?)
    }

    #[instrument(skip(self, items), fields(count = items.len()))]
    async fn push_line_items(
        &self,
        org_id: &str,
        settlement_id: &str,
        items: &[SettlementLineItem],
    ) -> Result<bool, AppError> {
        let _timer = db_timer("push_line_items");
        let filter = doc! {
            "_id": settlement_id,
            "organization_id": org_id,
            "status": SettlementStatus::Draft.as_str(),
        };
        let update = doc! {
            "$push": { "line_items": { "$each": to_bson(items)? } },
            "$set": { "updated_at": now_bson() },
        };
        let result = self.runs().update_one(filter, update, None).await?;
        Ok(result.matched_count == 1)
    }

    #[instrument(skip(self, accrual_ids), fields(count = accrual_ids.len()))]
    async fn pull_line_items(
        &self,
        org_id: &str,
        settlement_id: &str,
        accrual_ids: &[String],
    ) -> Result<bool, AppError> {
        let _timer = db_timer("pull_line_items");
        let filter = doc! {
            "_id": settlement_id,
            "organization_id": org_id,
            "status": SettlementStatus::Draft.as_str(),
        };
        let update = doc! {
            "$pull": { "line_items": { "accrual_id": { "$in": accrual_ids } } },
            "$set": { "updated_at": now_bson() },
        };
        let result = self.runs().update_one(filter, update, None).await?;
        Ok(result.matched_count == 1)
    }

    #[instrument(skip(self, totals))]
    async fn set_totals(
        &self,
        org_id: &str,
        settlement_id: &str,
        totals: &SettlementTotals,
    ) -> Result<bool, AppError> {
        let _timer = db_timer("set_totals");
        let filter = doc! {
            "_id": settlement_id,
            "organization_id": org_id,
            "status": SettlementStatus::Draft.as_str(),
        };
        let update = doc! {
            "$set": { "totals": to_bson(totals)?, "updated_at": now_bson() },
        };
        let result = self.runs().update_one(filter, update, None).await?;
        Ok(result.matched_count == 1)
    }

    #[instrument(skip(self, transition), fields(target = %transition.target_status()))]
    async fn transition_run(
        &self,
        org_id: &str,
        settlement_id: &str,
        from: &[SettlementStatus],
        transition: &RunTransition,
    ) -> Result<Option<SettlementRun>, AppError> {
        let _timer = db_timer("transition_run");
        let from: Vec<&str> = from.iter().map(|s| s.as_str()).collect();
        let filter = doc! {
            "_id": settlement_id,
            "organization_id": org_id,
            "status": { "$in": from },
        };
        let update = doc! { "$set": run_transition_set(transition)? };
        Ok(self
            .runs()
            .find_one_and_update(filter, update, after_update())
            .await?)
    }
}
