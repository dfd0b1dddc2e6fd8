//! Status cache backends.

pub mod memory;

pub use memory::InMemoryCache;
