//! Cross-module scenarios exercising the public library surface the way an
//! external caller (an HTTP gateway, a business-layer service) would.

use campus_core::load_balancer::{Instance, LoadBalancer};
use campus_core::{default_breaker_registry, default_db_manager, default_load_balancer_registry};
use std::time::Duration;

#[test]
fn default_registries_are_process_wide_singletons() {
    let breakers_a = default_breaker_registry();
    let breakers_b = default_breaker_registry();
    breakers_a.get_or_create("letters-api", campus_core::circuit_breaker::BreakerConfig::default());
    assert!(breakers_b.get("letters-api").is_some());

    let lbs_a = default_load_balancer_registry();
    let lbs_b = default_load_balancer_registry();
    let lb = lbs_a.get_load_balancer("courier-matching");
    lb.add_instance(Instance { id: "node-1".into(), address: "10.0.0.1:8080".into(), weight: 1 }).unwrap();
    assert_eq!(lbs_b.get_load_balancer("courier-matching").select_instance().unwrap().id, "node-1");
}

#[test]
fn db_manager_rejects_unvalidated_config_before_any_connection_attempt() {
    let manager = default_db_manager();
    let err = manager
        .add_config("letters-db", campus_core::db::DbPoolConfig { host: String::new(), ..Default::default() })
        .unwrap_err();
    assert_eq!(err, campus_core::db::ConfigError::MissingHost);
}

/// A gateway-shaped scenario: repeated failures against one backend should
/// open its breaker and the load balancer should stop selecting it, without
/// the caller ever touching the breaker directly.
#[tokio::test]
async fn repeated_failures_remove_backend_from_rotation() {
    let lb = LoadBalancer::new("gateway-smoke");
    lb.add_instance(Instance { id: "a".into(), address: "a:80".into(), weight: 1 }).unwrap();
    lb.add_instance(Instance { id: "b".into(), address: "b:80".into(), weight: 1 }).unwrap();

    for _ in 0..10 {
        let chosen = lb.select_instance().unwrap();
        let success = chosen.id != "a";
        lb.record_request(&chosen.id, Duration::from_millis(5), success);
    }

    for _ in 0..10 {
        assert_eq!(lb.select_instance().unwrap().id, "b");
    }
}
