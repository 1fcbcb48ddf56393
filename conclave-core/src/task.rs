//! Task provider abstraction for spawning `!Send` futures.
//!
//! The engine runs every component as a cooperative task on one scheduler
//! thread. Spawning goes through [`TaskProvider`] so tests can intercept or
//! serialize task creation.

use std::future::Future;

/// Provider trait for spawning local (non-`Send`) tasks.
pub trait TaskProvider: Clone {
    /// Spawn a future onto the current scheduler thread.
    ///
    /// The future runs cooperatively with every other task; it is never
    /// moved to another thread.
    fn spawn_local<F>(&self, name: &str, future: F)
    where
        F: Future<Output = ()> + 'static;
}

/// Production task provider spawning onto the current tokio `LocalSet`.
///
/// Panics if used outside a `LocalSet` context, which is a deployment error:
/// the engine requires a current-thread runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioTaskProvider;

impl TokioTaskProvider {
    /// Create a new tokio task provider.
    pub fn new() -> Self {
        Self
    }
}

impl TaskProvider for TokioTaskProvider {
    fn spawn_local<F>(&self, _name: &str, future: F)
    where
        F: Future<Output = ()> + 'static,
    {
        tokio::task::spawn_local(future);
    }
}
