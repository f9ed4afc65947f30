//! Named breaker registry with read-then-upgrade `GetOrCreate` locking.

use super::{BreakerConfig, CircuitBreaker, Counts, State};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Point-in-time view of one breaker, returned by [`Manager::stats`].
#[derive(Debug, Clone)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: State,
    pub counts: Counts,
}

/// Process-wide (or scoped) registry of named breakers.
#[derive(Default)]
pub struct Manager {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl Manager {
    pub fn new() -> Self {
        Self { breakers: RwLock::new(HashMap::new()) }
    }

    /// Returns the existing breaker for `name`, or constructs one with
    /// `config` and stores it. Takes a read lock first to avoid contending
    /// on the common case where the breaker already exists.
    pub fn get_or_create(&self, name: &str, config: BreakerConfig) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.read().unwrap().get(name) {
            return existing.clone();
        }
        let mut write = self.breakers.write().unwrap();
        if let Some(existing) = write.get(name) {
            return existing.clone();
        }
        let breaker = Arc::new(CircuitBreaker::new(name, config));
        write.insert(name.to_string(), breaker.clone());
        breaker
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.read().unwrap().get(name).cloned()
    }

    pub fn reset(&self, name: &str) {
        if let Some(breaker) = self.get(name) {
            breaker.reset();
        }
    }

    /// Aggregate state/counts for every registered breaker, sorted by name.
    pub fn stats(&self) -> Vec<BreakerSnapshot> {
        let guard = self.breakers.read().unwrap();
        let mut out: Vec<_> = guard
            .values()
            .map(|b| BreakerSnapshot { name: b.name().to_string(), state: b.state(), counts: b.counts() })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }
}
