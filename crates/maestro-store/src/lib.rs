pub mod conversations;
pub mod db;
pub mod error;
pub mod ledger;
pub mod sessions;
pub mod tenants;
pub mod types;
pub mod usage;
pub mod workflows;

pub use db::Store;
pub use error::{Result, StoreError};
