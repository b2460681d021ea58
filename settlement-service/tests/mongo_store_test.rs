//! MongoDB-backed store tests. Run with a live server:
//! `TEST_MONGODB_URI=mongodb://localhost:27017 cargo test -- --ignored`

use rust_decimal::Decimal;
use settlement_service::models::{AccrualStatus, SettlementRun, SettlementStatus, SupplierAccrual};
use settlement_service::services::store::RunTransition;
use settlement_service::services::{MongoSettlementStore, SettlementStore};
use uuid::Uuid;

async fn store() -> MongoSettlementStore {
    let uri = std::env::var("TEST_MONGODB_URI").expect("TEST_MONGODB_URI must be set");
    let database = format!("settlement_test_{}", Uuid::new_v4().simple());
    let store = MongoSettlementStore::connect(&uri, &database)
        .await
        .expect("Failed to connect to MongoDB");
    store
        .initialize_indexes()
        .await
        .expect("Failed to create indexes");
    store
}

fn accrual(org: &str, amount: &str) -> SupplierAccrual {
    let amount: Decimal = amount.parse().unwrap();
    SupplierAccrual::new(org, "bkg-1", "sup-1", "EUR", amount)
}

#[tokio::test]
#[ignore = "requires MongoDB (TEST_MONGODB_URI)"]
async fn lock_is_conditional_on_unlocked_state() {
    let store = store().await;
    let org = Uuid::new_v4().to_string();
    let a1 = accrual(&org, "12.34");
    store.insert_accrual(&a1).await.unwrap();

    assert!(store
        .lock_accrual(&org, &a1.accrual_id, AccrualStatus::Accrued, "run-a")
        .await
        .unwrap());
    assert!(!store
        .lock_accrual(&org, &a1.accrual_id, AccrualStatus::Accrued, "run-b")
        .await
        .unwrap());

    let locked = store.find_accrual(&org, &a1.accrual_id).await.unwrap().unwrap();
    assert_eq!(locked.status, AccrualStatus::InSettlement);
    assert_eq!(locked.settlement_id.as_deref(), Some("run-a"));
    assert_eq!(locked.net_payable, "12.34".parse::<Decimal>().unwrap());

    assert!(store
        .unlock_accrual(&org, &a1.accrual_id, "run-a", AccrualStatus::Accrued)
        .await
        .unwrap());
    let released = store.find_accrual(&org, &a1.accrual_id).await.unwrap().unwrap();
    assert_eq!(released.settlement_id, None);
    assert_eq!(released.lock_prev_status, None);
}

#[tokio::test]
#[ignore = "requires MongoDB (TEST_MONGODB_URI)"]
async fn run_transitions_are_conditional() {
    let store = store().await;
    let org = Uuid::new_v4().to_string();
    let run = SettlementRun::new_draft(&org, "sup-1", "EUR", None, "ops");
    store.insert_run(&run).await.unwrap();

    let open = store.find_open_run(&org, "sup-1", "EUR").await.unwrap();
    assert_eq!(open.map(|r| r.settlement_id), Some(run.settlement_id.clone()));

    let pay = RunTransition::MarkPaid {
        paid_by: "finance".to_string(),
        paid_at: chrono::Utc::now(),
        payment_reference: None,
    };
    let result = store
        .transition_run(&org, &run.settlement_id, &[SettlementStatus::Approved], &pay)
        .await
        .unwrap();
    assert!(result.is_none());

    let cancel = RunTransition::Cancel {
        cancelled_by: "ops".to_string(),
        cancelled_at: chrono::Utc::now(),
        reason: Some("test".to_string()),
    };
    let cancelled = store
        .transition_run(&org, &run.settlement_id, &SettlementStatus::OPEN, &cancel)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cancelled.status, SettlementStatus::Cancelled);
    assert!(store
        .find_open_run(&org, "sup-1", "EUR")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
#[ignore = "requires MongoDB (TEST_MONGODB_URI)"]
async fn release_then_restore_recovers_pre_lock_status() {
    let store = store().await;
    let org = Uuid::new_v4().to_string();
    let a1 = accrual(&org, "5");
    store.insert_accrual(&a1).await.unwrap();
    store
        .lock_accrual(&org, &a1.accrual_id, AccrualStatus::Accrued, "run-a")
        .await
        .unwrap();

    assert_eq!(
        store
            .release_settlement_accruals(&org, "run-a")
            .await
            .unwrap(),
        1
    );
    assert!(store
        .restore_accrual_status(&org, &a1.accrual_id, AccrualStatus::Adjusted)
        .await
        .unwrap());
    let restored = store.find_accrual(&org, &a1.accrual_id).await.unwrap().unwrap();
    assert_eq!(restored.status, AccrualStatus::Adjusted);
}
