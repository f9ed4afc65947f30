//! Smart log aggregator: collapses repeating diagnostic events via a
//! per-fingerprint VERBOSE -> SILENT -> SAMPLED -> CIRCUITED state machine.

use crate::clock::{Clock, MonotonicClock};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Diagnostic severity of a logged event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Info,
    Warning,
    Error,
}

/// Graded suppression state of a single fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuppressionMode {
    Verbose,
    Silent,
    Sampled,
    Circuited,
}

/// Outcome of submitting one event: whether it should actually be emitted,
/// and if so with what annotation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Emission {
    /// Emit with full context.
    Full,
    /// Emit, annotated with the occurrence count since entering SAMPLED.
    Sampled { occurrences_since_sampled: u64 },
    /// Drop silently.
    Suppressed,
}

#[derive(Clone)]
pub struct AggregatorConfig {
    /// Window after which a pattern is pruned if untouched (fresh occurrence restarts it).
    pub time_window: Duration,
    /// Emit-count threshold before VERBOSE advances to SILENT.
    pub verbose_threshold: u64,
    /// Multiplier of `verbose_threshold` before SILENT advances to SAMPLED.
    pub max_aggregation_multiplier: u64,
    /// 1-in-N sampling rate while SAMPLED.
    pub sampling_rate: u64,
    /// Total-count threshold before SAMPLED advances to CIRCUITED.
    pub circuit_breaker_threshold: u64,
    /// Background prune cadence.
    pub cleanup_interval: Duration,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            time_window: Duration::from_secs(300),
            verbose_threshold: 3,
            max_aggregation_multiplier: 2,
            sampling_rate: 5,
            circuit_breaker_threshold: 10,
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

struct Pattern {
    first_seen_millis: u64,
    last_seen_millis: u64,
    count: u64,
    mode: SuppressionMode,
    sampled_occurrences: u64,
}

/// Stats reported by [`SmartLogger::stats`].
#[derive(Debug, Clone, Default)]
pub struct AggregatorStats {
    pub total_errors: u64,
    pub aggregated_errors: u64,
    pub silenced_errors: u64,
    pub circuited_errors: u64,
}

impl AggregatorStats {
    pub fn log_reduction_percent(&self) -> f64 {
        if self.total_errors == 0 {
            0.0
        } else {
            let suppressed = self.aggregated_errors + self.silenced_errors + self.circuited_errors;
            suppressed as f64 / self.total_errors as f64 * 100.0
        }
    }
}

/// Canonicalizes a message by stripping high-variance tokens (UUIDs, bare
/// numeric ids) so that otherwise-identical messages share a fingerprint.
pub fn fingerprint(message: &str) -> String {
    let mut canon = String::with_capacity(message.len());
    for token in message.split_whitespace() {
        if !canon.is_empty() {
            canon.push(' ');
        }
        canon.push_str(&canonicalize_token(token));
    }
    canon
}

fn canonicalize_token(token: &str) -> String {
    if is_uuid(token) {
        return "<uuid>".to_string();
    }
    if token.chars().all(|c| c.is_ascii_digit()) && !token.is_empty() {
        return "<num>".to_string();
    }
    token.to_string()
}

fn is_uuid(token: &str) -> bool {
    let cleaned: String = token.chars().filter(|c| *c != '-').collect();
    cleaned.len() == 32 && cleaned.chars().all(|c| c.is_ascii_hexdigit()) && token.contains('-')
}

/// Suppresses repeated diagnostic noise while preserving the first
/// occurrences and periodic samples of every distinct fingerprint.
pub struct SmartLogger {
    config: AggregatorConfig,
    clock: Arc<dyn Clock>,
    patterns: Mutex<HashMap<String, Pattern>>,
    total_errors: AtomicU64,
    aggregated_errors: AtomicU64,
    silenced_errors: AtomicU64,
    circuited_errors: AtomicU64,
}

impl SmartLogger {
    pub fn new(config: AggregatorConfig) -> Self {
        Self::with_clock(config, Arc::new(MonotonicClock::default()))
    }

    pub fn with_clock(config: AggregatorConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            patterns: Mutex::new(HashMap::new()),
            total_errors: AtomicU64::new(0),
            aggregated_errors: AtomicU64::new(0),
            silenced_errors: AtomicU64::new(0),
            circuited_errors: AtomicU64::new(0),
        }
    }

    pub fn log_error(&self, message: &str, context: &JsonValue) -> Emission {
        self.submit(Level::Error, message, context)
    }

    pub fn log_warning(&self, message: &str, context: &JsonValue) -> Emission {
        self.submit(Level::Warning, message, context)
    }

    pub fn log_info(&self, message: &str, context: &JsonValue) -> Emission {
        self.submit(Level::Info, message, context)
    }

    fn submit(&self, level: Level, message: &str, context: &JsonValue) -> Emission {
        self.total_errors.fetch_add(1, Ordering::Relaxed);
        let now = self.clock.now_millis();
        let key = fingerprint(message);
        let mut patterns = self.patterns.lock().unwrap();

        let fresh = match patterns.get(&key) {
            Some(p) => now.saturating_sub(p.first_seen_millis) >= self.config.time_window.as_millis() as u64,
            None => true,
        };
        if fresh {
            patterns.insert(
                key.clone(),
                Pattern {
                    first_seen_millis: now,
                    last_seen_millis: now,
                    count: 0,
                    mode: SuppressionMode::Verbose,
                    sampled_occurrences: 0,
                },
            );
        }

        let pattern = patterns.get_mut(&key).expect("just inserted or present");
        pattern.count += 1;
        pattern.last_seen_millis = now;

        let emission = match pattern.mode {
            SuppressionMode::Verbose => {
                if pattern.count >= self.config.verbose_threshold {
                    pattern.mode = SuppressionMode::Silent;
                }
                Emission::Full
            }
            SuppressionMode::Silent => {
                self.silenced_errors.fetch_add(1, Ordering::Relaxed);
                if pattern.count >= self.config.verbose_threshold * self.config.max_aggregation_multiplier {
                    pattern.mode = SuppressionMode::Sampled;
                }
                Emission::Suppressed
            }
            SuppressionMode::Sampled => {
                pattern.sampled_occurrences += 1;
                let emit = pattern.sampled_occurrences % self.config.sampling_rate == 1;
                if pattern.count >= self.config.circuit_breaker_threshold {
                    pattern.mode = SuppressionMode::Circuited;
                }
                if emit {
                    self.aggregated_errors.fetch_add(1, Ordering::Relaxed);
                    Emission::Sampled { occurrences_since_sampled: pattern.sampled_occurrences }
                } else {
                    self.aggregated_errors.fetch_add(1, Ordering::Relaxed);
                    Emission::Suppressed
                }
            }
            SuppressionMode::Circuited => {
                self.circuited_errors.fetch_add(1, Ordering::Relaxed);
                Emission::Suppressed
            }
        };

        match (level, &emission) {
            (Level::Error, Emission::Full) => tracing::error!(event = "log_aggregated", fingerprint = %key, %context),
            (Level::Warning, Emission::Full) => tracing::warn!(event = "log_aggregated", fingerprint = %key, %context),
            (Level::Info, Emission::Full) => tracing::info!(event = "log_aggregated", fingerprint = %key, %context),
            (_, Emission::Sampled { occurrences_since_sampled }) => {
                tracing::debug!(event = "log_sampled", fingerprint = %key, occurrences = occurrences_since_sampled)
            }
            _ => {}
        }

        emission
    }

    pub fn stats(&self) -> AggregatorStats {
        AggregatorStats {
            total_errors: self.total_errors.load(Ordering::Relaxed),
            aggregated_errors: self.aggregated_errors.load(Ordering::Relaxed),
            silenced_errors: self.silenced_errors.load(Ordering::Relaxed),
            circuited_errors: self.circuited_errors.load(Ordering::Relaxed),
        }
    }

    pub fn print_summary(&self) {
        let stats = self.stats();
        tracing::info!(
            event = "log_aggregator_summary",
            total = stats.total_errors,
            aggregated = stats.aggregated_errors,
            silenced = stats.silenced_errors,
            circuited = stats.circuited_errors,
            reduction_percent = stats.log_reduction_percent(),
        );
    }

    /// Prunes patterns whose window has expired. Intended to be driven by a
    /// background ticker at `config.cleanup_interval`.
    pub fn cleanup(&self) {
        let now = self.clock.now_millis();
        let window_millis = self.config.time_window.as_millis() as u64;
        let mut patterns = self.patterns.lock().unwrap();
        patterns.retain(|_, p| now.saturating_sub(p.first_seen_millis) < window_millis);
    }

    pub fn active_pattern_count(&self) -> usize {
        self.patterns.lock().unwrap().len()
    }
}

/// Spawns the background cleanup ticker described in the aggregator's
/// concurrency discipline. Returns a handle that stops the ticker on drop.
pub fn spawn_cleanup_ticker(logger: Arc<SmartLogger>) -> tokio::task::JoinHandle<()> {
    let interval = logger.config.cleanup_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            logger.cleanup();
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64 as ClockMillis;

    #[derive(Debug, Default)]
    struct ManualClock {
        millis: ClockMillis,
    }

    impl ManualClock {
        fn advance(&self, by: Duration) {
            self.millis.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn now_millis(&self) -> u64 {
            self.millis.load(Ordering::SeqCst)
        }
    }

    fn ctx() -> JsonValue {
        serde_json::json!({})
    }

    #[test]
    fn fingerprint_strips_uuids_and_numeric_ids() {
        let a = fingerprint("user 123e4567-e89b-12d3-a456-426614174000 not found");
        let b = fingerprint("user 99999999-9999-9999-9999-999999999999 not found");
        assert_eq!(a, b);

        let c = fingerprint("retrying request 42");
        let d = fingerprint("retrying request 9001");
        assert_eq!(c, d);
    }

    #[test]
    fn verbose_then_silent_then_sampled_then_circuited() {
        let config = AggregatorConfig {
            verbose_threshold: 3,
            max_aggregation_multiplier: 2,
            sampling_rate: 5,
            circuit_breaker_threshold: 10,
            ..AggregatorConfig::default()
        };
        let logger = SmartLogger::new(config);
        let mut emitted = 0;
        for _ in 0..15 {
            if matches!(
                logger.log_error("same failure", &ctx()),
                Emission::Full | Emission::Sampled { .. }
            ) {
                emitted += 1;
            }
        }
        let stats = logger.stats();
        assert_eq!(stats.total_errors, 15);
        assert!((3..=8).contains(&emitted), "emitted={emitted}");
    }

    #[test]
    fn distinct_fingerprints_have_independent_patterns() {
        let logger = SmartLogger::new(AggregatorConfig::default());
        for _ in 0..3 {
            logger.log_error("error A", &ctx());
        }
        assert_eq!(logger.log_error("error B", &ctx()), Emission::Full);
    }

    #[test]
    fn cleanup_prunes_expired_patterns() {
        let clock = Arc::new(ManualClock::default());
        let config = AggregatorConfig { time_window: Duration::from_secs(60), ..AggregatorConfig::default() };
        let logger = SmartLogger::with_clock(config, clock.clone());
        logger.log_error("transient", &ctx());
        assert_eq!(logger.active_pattern_count(), 1);
        clock.advance(Duration::from_secs(61));
        logger.cleanup();
        assert_eq!(logger.active_pattern_count(), 0);
    }

    #[test]
    fn window_expiry_restarts_pattern_in_verbose() {
        let clock = Arc::new(ManualClock::default());
        let config = AggregatorConfig {
            time_window: Duration::from_secs(10),
            verbose_threshold: 1,
            ..AggregatorConfig::default()
        };
        let logger = SmartLogger::with_clock(config, clock.clone());
        assert_eq!(logger.log_error("flaky", &ctx()), Emission::Full);
        assert_eq!(logger.log_error("flaky", &ctx()), Emission::Suppressed);
        clock.advance(Duration::from_secs(11));
        assert_eq!(logger.log_error("flaky", &ctx()), Emission::Full);
    }
}
