use ripple::config::{ENV_HEARTBEAT_MS, ENV_MAX_FRAME_LENGTH, ENV_MAX_OPEN_HANDLES, ENV_RUNTIME_DIR};
use ripple::net::{Scheme, SocketAddress};
use ripple::{Error, RuntimeBuilder, RuntimeConfig};

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
    move |key: &str| vars.get(key).cloned()
}

#[test]
fn test_defaults() {
    let config = RuntimeConfig::default();
    assert_eq!(config.max_open_handles, 1024);
    assert_eq!(config.heartbeat_interval, Duration::from_millis(100));
    assert_eq!(config.max_frame_length, 8 * 1024 * 1024);
    assert!(config.runtime_dir.ends_with("ripple"));
}

#[test]
fn test_overrides_apply() {
    let mut config = RuntimeConfig::default();
    config
        .apply_overrides_from(lookup(&[
            (ENV_RUNTIME_DIR, "/tmp/ripple-test"),
            (ENV_MAX_OPEN_HANDLES, "12"),
            (ENV_HEARTBEAT_MS, "250"),
            (ENV_MAX_FRAME_LENGTH, " 4096 "),
        ]))
        .unwrap();

    assert_eq!(config.runtime_dir, PathBuf::from("/tmp/ripple-test"));
    assert_eq!(config.max_open_handles, 12);
    assert_eq!(config.heartbeat_interval, Duration::from_millis(250));
    assert_eq!(config.max_frame_length, 4096);
}

#[test]
fn test_invalid_overrides_are_rejected() {
    for vars in [
        [(ENV_MAX_OPEN_HANDLES, "many")],
        [(ENV_HEARTBEAT_MS, "0")],
        [(ENV_RUNTIME_DIR, "  ")],
        [(ENV_MAX_FRAME_LENGTH, "-1")],
    ] {
        let mut config = RuntimeConfig::default();
        let result = config.apply_overrides_from(lookup(&vars));
        assert!(matches!(result, Err(Error::Config(_))), "{vars:?} should be refused");
    }
}

#[test]
fn test_builder_setters_reach_the_kernel() {
    let dir = tempfile::tempdir().unwrap();
    let runtime_dir = dir.path().join("nested").join("run");

    let kernel = RuntimeBuilder::new()
        .runtime_dir(&runtime_dir)
        .max_open_handles(3)
        .heartbeat_interval(Duration::from_millis(20))
        .max_frame_length(1024)
        .read_chunk_size(512)
        .build()
        .unwrap();

    let config = kernel.reactor().config();
    assert!(runtime_dir.is_dir(), "Build should create the runtime directory");
    assert_eq!(config.max_open_handles, 3);
    assert_eq!(kernel.reactor().limiter().max(), 3);
    assert_eq!(config.heartbeat_interval, Duration::from_millis(20));
    assert_eq!(config.max_frame_length, 1024);
    assert_eq!(config.read_chunk_size, 512);
}

#[test]
fn test_parse_unix_address() {
    let address = SocketAddress::parse("unix:///var/run/app.sock").unwrap();
    assert_eq!(address.scheme(), Scheme::Unix);
    assert_eq!(address.host(), "/var/run/app.sock");
    assert_eq!(address.port(), 0);
    assert_eq!(address.to_string(), "unix:///var/run/app.sock");
}

#[test]
fn test_parse_tcp_address() {
    let address = SocketAddress::parse("TCP://127.0.0.1:9000").unwrap();
    assert_eq!(address.scheme(), Scheme::Tcp);
    assert_eq!(address.host(), "127.0.0.1");
    assert_eq!(address.port(), 9000);

    let v6 = SocketAddress::parse("tcp://[::1]:80").unwrap();
    assert_eq!(v6.host(), "::1");
    assert_eq!(v6.to_string(), "tcp://[::1]:80");
}

#[test]
fn test_parse_rejects_malformed_addresses() {
    for raw in ["", "localhost:80", "udp://host:1", "tcp://host", "tcp://:80", "tcp://host:99999", "unix://"] {
        assert!(
            matches!(SocketAddress::parse(raw), Err(Error::InvalidAddress(_))),
            "`{raw}` should not parse"
        );
    }
}
