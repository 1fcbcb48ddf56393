//! Provider bundle trait.
//!
//! Bundles the four provider types into one type parameter, so engine code
//! carries `P: Providers` instead of four separate generics with their own
//! where clauses.

use crate::{
    NetworkProvider, RandomProvider, TaskProvider, TimeProvider, TokioNetworkProvider,
    TokioRandomProvider, TokioTaskProvider, TokioTimeProvider,
};

/// Bundle of all provider types for a runtime environment.
///
/// Associated types preserve concrete types at compile time; accessor
/// methods hand out the individual providers.
pub trait Providers: Clone + 'static {
    /// Network provider type for connections and listeners.
    type Network: NetworkProvider + Clone + 'static;

    /// Time provider type for sleep, timeout, and now().
    type Time: TimeProvider + Clone + 'static;

    /// Task provider type for spawning local tasks.
    type Task: TaskProvider + Clone + 'static;

    /// Random provider type.
    type Random: RandomProvider + Clone + 'static;

    /// Get the network provider instance.
    fn network(&self) -> &Self::Network;

    /// Get the time provider instance.
    fn time(&self) -> &Self::Time;

    /// Get the task provider instance.
    fn task(&self) -> &Self::Task;

    /// Get the random provider instance.
    fn random(&self) -> &Self::Random;
}

/// Production providers using the tokio runtime.
#[derive(Clone)]
pub struct TokioProviders {
    network: TokioNetworkProvider,
    time: TokioTimeProvider,
    task: TokioTaskProvider,
    random: TokioRandomProvider,
}

impl TokioProviders {
    /// Create a new production providers bundle.
    pub fn new() -> Self {
        Self {
            network: TokioNetworkProvider::new(),
            time: TokioTimeProvider::new(),
            task: TokioTaskProvider::new(),
            random: TokioRandomProvider::new(),
        }
    }
}

impl Default for TokioProviders {
    fn default() -> Self {
        Self::new()
    }
}

impl Providers for TokioProviders {
    type Network = TokioNetworkProvider;
    type Time = TokioTimeProvider;
    type Task = TokioTaskProvider;
    type Random = TokioRandomProvider;

    fn network(&self) -> &Self::Network {
        &self.network
    }

    fn time(&self) -> &Self::Time {
        &self.time
    }

    fn task(&self) -> &Self::Task {
        &self.task
    }

    fn random(&self) -> &Self::Random {
        &self.random
    }
}
