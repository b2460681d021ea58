pub mod accrual;
pub mod database;
pub mod error;
pub mod memory;
pub mod metrics;
pub mod settlement;
pub mod store;

pub use accrual::AccrualService;
pub use database::MongoSettlementStore;
pub use error::SettlementError;
pub use memory::InMemorySettlementStore;
pub use metrics::{get_metrics, init_metrics};
pub use settlement::{CreateRun, ItemsChange, SettlementService};
pub use store::{AccrualFilter, RunFilter, SettlementStore};
