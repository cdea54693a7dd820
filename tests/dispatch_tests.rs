//! Request-line round trips through a live pool
#![cfg(unix)]

mod common;

use common::{Fixture, MemoryBackend, CSV_SPEC};
use objpool::backend::BackendKind;
use objpool::dispatch;
use std::sync::Arc;

fn fixture() -> Fixture {
    let backend = Arc::new(MemoryBackend::default());
    backend.put("b", "a.csv", "e1", b"1,2.50\n");
    backend.put("b", "logs/x.csv", "e2", b"2,3.75\n");
    backend.put("b", "logs/y.parquet", "e3", b"PAR1");
    Fixture::new(backend, BackendKind::S3)
}

fn request(args: &[&str]) -> String {
    serde_json::to_string(args).unwrap()
}

#[test]
fn test_refresh_glob_pull_round_trip() {
    let fx = fixture();

    let reply = dispatch(&fx.pool, &request(&["REFRESH", "b"]));
    assert_eq!(reply.to_string(), "OK\n\n");

    let reply = dispatch(&fx.pool, &request(&["glob", "b", "logs/*"]));
    assert_eq!(reply.to_string(), "OK\nlogs/x.csv\nlogs/y.parquet\n");

    let schema = fx.schema.display().to_string();
    let reply = dispatch(
        &fx.pool,
        &request(&["PULL", CSV_SPEC, &schema, "b", "logs/x.csv", "a.csv"]),
    );
    let expected = format!(
        "OK\n{}\n{}\n",
        fx.device(1).join("b/logs/x.zmp").display(),
        fx.device(1).join("b/a.zmp").display()
    );
    assert_eq!(reply.to_string(), expected);
}

#[test]
fn test_list_reports_etags() {
    let fx = fixture();
    let reply = dispatch(&fx.pool, &request(&["LIST", "b", "logs/"]));
    assert_eq!(reply.to_string(), "OK\ne2 logs/x.csv\ne3 logs/y.parquet\n");
}

#[test]
fn test_errors_are_replied() {
    let fx = fixture();

    let reply = dispatch(&fx.pool, "PULL b a.csv");
    assert!(!reply.is_ok());
    assert_eq!(reply.to_string(), "ERROR\nInvalid JSON in request");

    let reply = dispatch(&fx.pool, &request(&["GLOB", "b", "*.csv"]));
    assert_eq!(reply.to_string(), "ERROR\nbucket 'b' not refreshed");

    let schema = fx.schema.display().to_string();
    let reply = dispatch(&fx.pool, &request(&["PULL", CSV_SPEC, &schema, "b", "a.csv"]));
    assert_eq!(reply.to_string(), "ERROR\nbucket 'b' not refreshed");

    dispatch(&fx.pool, &request(&["REFRESH", "b"]));
    let reply = dispatch(
        &fx.pool,
        &request(&["PULL", CSV_SPEC, &schema, "b", "a.csv", "nope.csv"]),
    );
    assert!(reply.to_string().starts_with("ERROR\nnope.csv: "));
}

#[test]
fn test_status_counts_requests() {
    let fx = fixture();
    dispatch(&fx.pool, &request(&["REFRESH", "b"]));
    dispatch(&fx.pool, &request(&["LIST", "b"]));

    let reply = dispatch(&fx.pool, &request(&["STATUS"])).to_string();
    assert!(reply.starts_with("OK\n"));
    assert!(reply.lines().any(|l| l == "refreshes 1"));
    assert!(reply.lines().any(|l| l == "lists 1"));
    assert!(reply.lines().any(|l| l == "workers 4"));
}
