//! Instance-selection algorithms. Each receives a snapshot of currently
//! healthy instances (already filtered) and picks one.

use super::InstanceState;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Selection policy identifier, settable at runtime via `SetAlgorithm`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlgorithmName {
    RoundRobin,
    WeightedRoundRobin,
    LeastConnections,
    SessionAffinity,
    Adaptive,
}

pub(super) fn round_robin(healthy: &[Arc<InstanceState>], cursor: &std::sync::atomic::AtomicUsize) -> Option<Arc<InstanceState>> {
    if healthy.is_empty() {
        return None;
    }
    let index = cursor.fetch_add(1, Ordering::Relaxed) % healthy.len();
    Some(healthy[index].clone())
}

/// Smooth weighted round robin (Nginx-style): each instance's current
/// weight is incremented by its effective weight; the instance with the
/// highest current weight is picked and has the total weight subtracted.
pub(super) fn weighted_round_robin(healthy: &[Arc<InstanceState>]) -> Option<Arc<InstanceState>> {
    if healthy.is_empty() {
        return None;
    }
    let total_weight: i64 = healthy.iter().map(|i| i.instance.weight.max(1) as i64).sum();
    let mut best: Option<(usize, i64)> = None;
    let mut current_weights = Vec::with_capacity(healthy.len());
    for (idx, inst) in healthy.iter().enumerate() {
        let weight = inst.instance.weight.max(1) as i64;
        let mut current = inst.wrr_current_weight.lock();
        *current += weight;
        current_weights.push(*current);
        if best.map(|(_, w)| *current > w).unwrap_or(true) {
            best = Some((idx, *current));
        }
    }
    let (winner_idx, _) = best.expect("non-empty healthy set");
    *healthy[winner_idx].wrr_current_weight.lock() -= total_weight;
    Some(healthy[winner_idx].clone())
}

pub(super) fn least_connections(healthy: &[Arc<InstanceState>]) -> Option<Arc<InstanceState>> {
    healthy
        .iter()
        .min_by_key(|inst| (inst.active_connections.load(Ordering::Relaxed), inst.instance.id.clone()))
        .cloned()
}

pub(super) fn session_affinity(healthy: &[Arc<InstanceState>], key: &str) -> Option<Arc<InstanceState>> {
    if healthy.is_empty() {
        return None;
    }
    let hash = stable_hash(key);
    let index = (hash as usize) % healthy.len();
    Some(healthy[index].clone())
}

pub(super) fn adaptive(healthy: &[Arc<InstanceState>]) -> Option<Arc<InstanceState>> {
    healthy
        .iter()
        .max_by(|a, b| adaptive_score(a).partial_cmp(&adaptive_score(b)).unwrap())
        .cloned()
}

fn adaptive_score(inst: &InstanceState) -> f64 {
    let response_time = (*inst.avg_response_time_millis.lock()).max(1.0);
    let active = inst.active_connections.load(Ordering::Relaxed) as f64;
    let weight = inst.instance.weight as f64;
    // Response time dominates: inverse scaled by 1000 outweighs the small
    // per-connection and per-weight adjustments on any typical workload.
    (1000.0 / response_time) - active + weight * 0.1
}

/// FNV-1a, used purely as a stable (non-cryptographic) hash for session keys.
fn stable_hash(key: &str) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in key.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}
