//! Common test utilities for settlement-service integration tests.

#![allow(dead_code)]

use reqwest::{Client, RequestBuilder};
use rust_decimal::Decimal;
use serde_json::Value;
use settlement_service::config::SettlementConfig;
use settlement_service::models::SupplierAccrual;
use settlement_service::services::SettlementStore;
use settlement_service::startup::Application;
use std::sync::{Arc, Once};
use uuid::Uuid;

static INIT: Once = Once::new();

pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("info,settlement_service=debug")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

pub struct TestApp {
    pub address: String,
    pub org_id: String,
    pub client: Client,
    pub store: Arc<dyn SettlementStore>,
}

impl TestApp {
    /// Spawn the HTTP application on a random port over the in-memory store,
    /// with a fresh organization id.
    pub async fn spawn() -> Self {
        init_tracing();

        let app = Application::build(SettlementConfig::for_tests())
            .await
            .expect("Failed to build application");
        let address = format!("http://127.0.0.1:{}", app.port());
        let store = app.store();

        tokio::spawn(async move {
            app.run_until_stopped().await.ok();
        });

        Self {
            address,
            org_id: Uuid::new_v4().to_string(),
            client: Client::new(),
            store,
        }
    }

    pub fn get(&self, path: &str) -> RequestBuilder {
        self.tenant(self.client.get(format!("{}{}", self.address, path)))
    }

    pub fn post(&self, path: &str) -> RequestBuilder {
        self.tenant(self.client.post(format!("{}{}", self.address, path)))
    }

    fn tenant(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header("X-Org-ID", &self.org_id)
            .header("X-User-Email", "ops@example.com")
    }

    /// Insert an accrual for this org directly into the store.
    pub async fn seed_accrual(&self, supplier_id: &str, currency: &str, amount: &str) -> String {
        let net_payable: Decimal = amount.parse().expect("invalid decimal");
        let accrual = SupplierAccrual::new(
            &self.org_id,
            format!("bkg-{}", Uuid::new_v4()),
            supplier_id,
            currency,
            net_payable,
        );
        self.store
            .insert_accrual(&accrual)
            .await
            .expect("Failed to seed accrual");
        accrual.accrual_id
    }

    pub async fn create_settlement(&self, supplier_id: &str, currency: &str) -> Value {
        let response = self
            .post("/settlements")
            .json(&serde_json::json!({ "supplier_id": supplier_id, "currency": currency }))
            .send()
            .await
            .expect("Failed to execute request");
        assert_eq!(response.status().as_u16(), 201);
        response.json().await.expect("Failed to parse response")
    }

    pub async fn add_items(&self, settlement_id: &str, accrual_ids: &[&str]) -> reqwest::Response {
        self.post(&format!("/settlements/{}/items", settlement_id))
            .json(&serde_json::json!({ "accrual_ids": accrual_ids }))
            .send()
            .await
            .expect("Failed to execute request")
    }

    pub async fn get_accrual(&self, accrual_id: &str) -> Value {
        self.get(&format!("/accruals/{}", accrual_id))
            .send()
            .await
            .expect("Failed to execute request")
            .json()
            .await
            .expect("Failed to parse response")
    }
}
