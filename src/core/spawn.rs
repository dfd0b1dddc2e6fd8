//! Runtime-agnostic task spawning.

use std::future::Future;

/// Spawner abstraction for runtime-agnostic async execution.
pub trait Spawn {
    /// Spawn a detached future.
    fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static;
}
