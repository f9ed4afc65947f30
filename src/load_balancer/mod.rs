//! Multi-algorithm instance selection with health tracking, session
//! affinity, and per-instance circuit breaking.

mod algorithms;

pub use algorithms::AlgorithmName;

use crate::circuit_breaker::{BreakerConfig, CircuitBreaker};
use crate::error::{CoreError, CoreResult};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A backend the load balancer may select.
#[derive(Debug, Clone)]
pub struct Instance {
    pub id: String,
    pub address: String,
    pub weight: u32,
}

/// Per-instance metrics exposed by `get_instance_metrics`.
#[derive(Debug, Clone, Copy, Default)]
pub struct InstanceMetrics {
    pub request_count: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub avg_response_time_millis: f64,
}

pub(crate) struct InstanceState {
    pub(crate) instance: Instance,
    pub(crate) healthy: bool,
    pub(crate) active_connections: AtomicU32,
    pub(crate) request_count: AtomicU64,
    pub(crate) success_count: AtomicU64,
    pub(crate) error_count: AtomicU64,
    pub(crate) avg_response_time_millis: Mutex<f64>,
    pub(crate) sample_count: AtomicU64,
    pub(crate) wrr_current_weight: Mutex<i64>,
    pub(crate) breaker: Arc<CircuitBreaker>,
}

/// Below this many samples the running average is a plain arithmetic mean;
/// beyond it, an exponential moving average smooths out transient spikes.
const EMA_SAMPLE_THRESHOLD: u64 = 20;
const EMA_ALPHA: f64 = 0.2;

/// Selects instances for one logical service and tracks their health.
pub struct LoadBalancer {
    service: String,
    instances: RwLock<Vec<Arc<InstanceState>>>,
    algorithm: Mutex<AlgorithmName>,
    rr_cursor: AtomicUsize,
}

impl LoadBalancer {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            instances: RwLock::new(Vec::new()),
            algorithm: Mutex::new(AlgorithmName::RoundRobin),
            rr_cursor: AtomicUsize::new(0),
        }
    }

    pub fn add_instance(&self, instance: Instance) -> CoreResult<()> {
        let mut instances = self.instances.write();
        if instances.iter().any(|i| i.instance.id == instance.id) {
            return Err(CoreError::InstanceUnavailable {
                service: format!("{}: duplicate instance id {}", self.service, instance.id),
            });
        }
        let breaker_name = format!("{}:{}", self.service, instance.id);
        instances.push(Arc::new(InstanceState {
            instance,
            healthy: true,
            active_connections: AtomicU32::new(0),
            request_count: AtomicU64::new(0),
            success_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            avg_response_time_millis: Mutex::new(0.0),
            sample_count: AtomicU64::new(0),
            wrr_current_weight: Mutex::new(0),
            breaker: Arc::new(CircuitBreaker::new(breaker_name, BreakerConfig::default())),
        }));
        Ok(())
    }

    pub fn remove_instance(&self, id: &str) {
        self.instances.write().retain(|i| i.instance.id != id);
    }

    pub fn mark_healthy(&self, id: &str) {
        self.set_health(id, true);
    }

    pub fn mark_unhealthy(&self, id: &str) {
        self.set_health(id, false);
    }

    /// Membership changes (including health flips) all serialize under one
    /// short write lock on the instance list, per the load balancer's
    /// concurrency discipline. `healthy` is rebuilt into a fresh
    /// `InstanceState` since it sits behind a shared `Arc` that selection
    /// may be holding a clone of concurrently.
    fn set_health(&self, id: &str, healthy: bool) {
        let mut instances = self.instances.write();
        let Some(pos) = instances.iter().position(|i| i.instance.id == id) else {
            return;
        };
        if instances[pos].healthy == healthy {
            return;
        }
        let current = instances[pos].clone();
        instances[pos] = Arc::new(InstanceState {
            instance: current.instance.clone(),
            healthy,
            active_connections: AtomicU32::new(current.active_connections.load(Ordering::Relaxed)),
            request_count: AtomicU64::new(current.request_count.load(Ordering::Relaxed)),
            success_count: AtomicU64::new(current.success_count.load(Ordering::Relaxed)),
            error_count: AtomicU64::new(current.error_count.load(Ordering::Relaxed)),
            avg_response_time_millis: Mutex::new(*current.avg_response_time_millis.lock()),
            sample_count: AtomicU64::new(current.sample_count.load(Ordering::Relaxed)),
            wrr_current_weight: Mutex::new(*current.wrr_current_weight.lock()),
            breaker: current.breaker.clone(),
        });
    }

    pub fn set_algorithm(&self, algorithm: AlgorithmName) {
        *self.algorithm.lock() = algorithm;
    }

    fn healthy_snapshot(&self) -> Vec<Arc<InstanceState>> {
        self.instances.read().iter().filter(|i| i.healthy).cloned().collect()
    }

    pub fn select_instance(&self) -> Option<Instance> {
        let healthy = self.healthy_snapshot();
        let algorithm = *self.algorithm.lock();
        let chosen = match algorithm {
            AlgorithmName::RoundRobin => algorithms::round_robin(&healthy, &self.rr_cursor),
            AlgorithmName::WeightedRoundRobin => algorithms::weighted_round_robin(&healthy),
            AlgorithmName::LeastConnections => algorithms::least_connections(&healthy),
            AlgorithmName::SessionAffinity => return None, // requires a key; use select_with_session
            AlgorithmName::Adaptive => algorithms::adaptive(&healthy),
        }?;
        chosen.active_connections.fetch_add(1, Ordering::Relaxed);
        Some(chosen.instance.clone())
    }

    pub fn select_with_session(&self, key: &str) -> Option<Instance> {
        let healthy = self.healthy_snapshot();
        let chosen = algorithms::session_affinity(&healthy, key)?;
        chosen.active_connections.fetch_add(1, Ordering::Relaxed);
        Some(chosen.instance.clone())
    }

    /// Records the outcome of a call the caller already placed: updates
    /// per-instance counters, the running response-time average, and the
    /// instance's circuit breaker. If that breaker opens as a result, the
    /// instance is marked unhealthy until it recovers.
    pub fn record_request(&self, id: &str, duration: Duration, success: bool) {
        let instances = self.instances.read();
        let Some(inst) = instances.iter().find(|i| i.instance.id == id).cloned() else {
            return;
        };
        drop(instances);

        decrement_saturating(&inst.active_connections);
        inst.request_count.fetch_add(1, Ordering::Relaxed);
        if success {
            inst.success_count.fetch_add(1, Ordering::Relaxed);
        } else {
            inst.error_count.fetch_add(1, Ordering::Relaxed);
        }

        let sample_count = inst.sample_count.fetch_add(1, Ordering::Relaxed) + 1;
        let sample_millis = duration.as_secs_f64() * 1000.0;
        let mut avg = inst.avg_response_time_millis.lock();
        *avg = if sample_count <= EMA_SAMPLE_THRESHOLD {
            (*avg * (sample_count - 1) as f64 + sample_millis) / sample_count as f64
        } else {
            EMA_ALPHA * sample_millis + (1.0 - EMA_ALPHA) * *avg
        };
        drop(avg);

        inst.breaker.observe(success);
        if matches!(inst.breaker.state(), crate::circuit_breaker::State::Open) {
            self.mark_unhealthy(id);
        }
    }

    pub fn get_instance_metrics(&self, id: &str) -> Option<InstanceMetrics> {
        let instances = self.instances.read();
        let inst = instances.iter().find(|i| i.instance.id == id)?;
        Some(InstanceMetrics {
            request_count: inst.request_count.load(Ordering::Relaxed),
            success_count: inst.success_count.load(Ordering::Relaxed),
            error_count: inst.error_count.load(Ordering::Relaxed),
            avg_response_time_millis: *inst.avg_response_time_millis.lock(),
        })
    }
}

/// Decrements an atomic counter without wrapping past zero.
fn decrement_saturating(counter: &AtomicU32) {
    let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(1)));
}

/// Named registry of per-service load balancers.
pub struct Manager {
    balancers: RwLock<HashMap<String, Arc<LoadBalancer>>>,
}

impl Default for Manager {
    fn default() -> Self {
        Self::new()
    }
}

impl Manager {
    pub fn new() -> Self {
        Self { balancers: RwLock::new(HashMap::new()) }
    }

    pub fn get_load_balancer(&self, service: &str) -> Arc<LoadBalancer> {
        if let Some(existing) = self.balancers.read().get(service) {
            return existing.clone();
        }
        let mut write = self.balancers.write();
        if let Some(existing) = write.get(service) {
            return existing.clone();
        }
        let lb = Arc::new(LoadBalancer::new(service));
        write.insert(service.to_string(), lb.clone());
        lb
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lb_with(ids: &[&str]) -> LoadBalancer {
        let lb = LoadBalancer::new("svc");
        for id in ids {
            lb.add_instance(Instance { id: id.to_string(), address: format!("{id}:80"), weight: 1 }).unwrap();
        }
        lb
    }

    #[test]
    fn empty_healthy_set_returns_none() {
        let lb = LoadBalancer::new("svc");
        assert!(lb.select_instance().is_none());
    }

    #[test]
    fn duplicate_instance_id_is_rejected() {
        let lb = lb_with(&["a"]);
        let err = lb.add_instance(Instance { id: "a".into(), address: "a:80".into(), weight: 1 }).unwrap_err();
        assert!(err.is_instance_unavailable());
    }

    #[test]
    fn removed_instance_is_never_selected() {
        let lb = lb_with(&["a", "b"]);
        lb.remove_instance("a");
        for _ in 0..10 {
            assert_eq!(lb.select_instance().unwrap().id, "b");
        }
    }

    #[test]
    fn mark_unhealthy_excludes_instance_from_selection() {
        let lb = lb_with(&["a", "b"]);
        lb.mark_unhealthy("a");
        for _ in 0..10 {
            assert_eq!(lb.select_instance().unwrap().id, "b");
        }
    }

    #[test]
    fn record_request_updates_metrics() {
        let lb = lb_with(&["a"]);
        lb.select_instance();
        lb.record_request("a", Duration::from_millis(50), true);
        let metrics = lb.get_instance_metrics("a").unwrap();
        assert_eq!(metrics.request_count, 1);
        assert_eq!(metrics.success_count, 1);
        assert!((metrics.avg_response_time_millis - 50.0).abs() < 0.01);
    }

    #[test]
    fn breaker_opening_marks_instance_unhealthy() {
        let lb = lb_with(&["a", "b"]);
        for _ in 0..5 {
            lb.select_instance();
            lb.record_request("a", Duration::from_millis(10), false);
        }
        for _ in 0..10 {
            assert_eq!(lb.select_instance().unwrap().id, "b");
        }
    }

    #[test]
    fn manager_returns_same_balancer_for_service() {
        let manager = Manager::new();
        let a = manager.get_load_balancer("letters-api");
        let b = manager.get_load_balancer("letters-api");
        assert!(Arc::ptr_eq(&a, &b));
    }
}
