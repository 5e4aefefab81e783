pub mod api_keys;
pub mod apps;
pub mod audit;
pub mod crypto;
pub mod db;
pub mod migrations;
pub mod model;

pub use api_keys::ApiKeyRecord;
pub use audit::{AuditEvent, AuditQuery};
pub use db::Store;
pub use model::AppInstance;
