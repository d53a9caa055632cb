pub mod config;
pub mod fingerprint_store;

pub use config::Config;
pub use fingerprint_store::{FingerprintStore, StoreError, SyncRecord};
