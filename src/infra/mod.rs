//! Infrastructure adapters for the durable store, the status cache and the points ledger.

pub mod cache;
pub mod ledger;
pub mod store;

pub use cache::InMemoryCache;
pub use ledger::{Charge, InMemoryLedger};
pub use store::InMemoryStore;
