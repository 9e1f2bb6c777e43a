//! Accounting and tarpit tests against the public API
//!
//! Run with: cargo test --test accounting_test

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uologin::net::{address_key, AccountedConnection, ClientAccountingMap};

fn addr(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

#[test]
fn records_are_shared_per_address_not_per_port() {
    let map = ClientAccountingMap::new(16, true);
    let a = map.get(addr("203.0.113.9:1000")).unwrap();
    let b = map.get(addr("203.0.113.9:2000")).unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(map.len(), 1);
}

#[test]
fn v4_mapped_v6_folds_onto_v4() {
    assert_eq!(
        address_key("::ffff:203.0.113.9".parse().unwrap()),
        address_key("203.0.113.9".parse().unwrap())
    );
}

#[test]
fn rapid_abuse_builds_an_accept_delay() {
    let map = ClientAccountingMap::new(16, true);
    let record = map.get(addr("203.0.113.9:1")).unwrap();

    assert_eq!(record.delay(), Duration::ZERO);

    // a burst of malformed logins, each costing 10 tokens
    for _ in 0..12 {
        record.update_token_bucket(10.0);
    }

    let delay = record.delay();
    assert!(delay >= Duration::from_millis(500));
    assert!(delay <= Duration::from_secs(60));
}

#[test]
fn delay_never_exceeds_one_minute() {
    let map = ClientAccountingMap::new(16, true);
    let record = map.get(addr("203.0.113.9:1")).unwrap();

    for _ in 0..1000 {
        record.update_token_bucket(10.0);
    }
    assert_eq!(record.delay(), Duration::from_secs(60));
}

#[test]
fn connection_cap_counts_live_guards() {
    let map = ClientAccountingMap::new(2, true);
    let record = map.get(addr("203.0.113.9:1")).unwrap();

    let first = AccountedConnection::new(Some(record.clone()));
    let second = AccountedConnection::new(Some(record.clone()));
    assert!(!record.check());

    drop(second);
    assert!(record.check());
    drop(first);
}

#[test]
fn empty_records_are_garbage_collected_after_the_ttl() {
    let map = ClientAccountingMap::new(16, true);
    let record = map.get(addr("203.0.113.9:1")).unwrap();
    let guard = AccountedConnection::new(Some(record));
    drop(guard);

    assert_eq!(map.len(), 1);
    map.cleanup(Instant::now());
    assert_eq!(map.len(), 1, "TTL must hold the record for five minutes");

    map.cleanup(Instant::now() + Duration::from_secs(6 * 60));
    assert!(map.is_empty());
}

#[test]
fn knock_survives_until_the_connection_arrives() {
    let map = ClientAccountingMap::new(16, true);
    map.get(addr("203.0.113.9:1")).unwrap().set_knocked();

    // sweeps shortly after the knock must not evict the record
    map.cleanup(Instant::now() + Duration::from_secs(60));
    assert_eq!(map.len(), 1);
    assert!(map.get(addr("203.0.113.9:7")).unwrap().is_knocked());
}
