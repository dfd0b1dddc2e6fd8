//! Points ledger backends.

pub mod memory;

pub use memory::{Charge, InMemoryLedger};
