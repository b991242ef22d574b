//! Integration tests for configuration validation

#![allow(clippy::expect_used, clippy::unwrap_used)]

use mmtls_client::config::{
    ClientConfig, DecodeVariant, RouteEntry, StoreBackendKind, NEWSYNC_CGI,
};
use mmtls_client::store::SessionStore;
use std::time::Duration;
use tracing::Level;

#[test]
fn test_default_config_validates() {
    let config = ClientConfig::default();
    let errors = config.validate();
    assert!(
        errors.is_empty(),
        "Default config should be valid, but got errors: {:?}",
        errors
    );
    assert!(config.validate_strict().is_ok());
}

#[test]
fn test_empty_hosts_and_bad_scheme() {
    let config = ClientConfig::default_with_overrides(|c| {
        c.endpoints.short_host.clear();
        c.endpoints.long_port = 0;
        c.endpoints.scheme = "ftp".into();
    });

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Short-link host cannot be empty")));
    assert!(errors.iter().any(|e| e.contains("Long-link port cannot be 0")));
    assert!(errors.iter().any(|e| e.contains("Unsupported scheme")));
}

#[test]
fn test_handshake_path_must_be_absolute() {
    let config = ClientConfig::default_with_overrides(|c| {
        c.endpoints.handshake_path = "mmtls".into();
    });
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("Handshake path must start with '/'")));
}

#[test]
fn test_invalid_hybrid_key() {
    let config = ClientConfig::default_with_overrides(|c| {
        c.protocol.hybrid_server_public_key = "not hex".into();
    });
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("Invalid hybrid server public key")));
}

#[test]
fn test_zero_client_version() {
    let config = ClientConfig::default_with_overrides(|c| c.protocol.client_version = 0);
    assert!(config.validate().iter().any(|e| e.contains("Client version cannot be 0")));
}

#[test]
fn test_duplicate_routes() {
    let config = ClientConfig::default_with_overrides(|c| {
        c.routes.push(RouteEntry {
            cgi: NEWSYNC_CGI,
            path: "/cgi-bin/micromsg-bin/newsync".into(),
            variant: DecodeVariant::Legacy,
        });
        c.routes.push(RouteEntry {
            cgi: 381,
            path: "no-slash".into(),
            variant: DecodeVariant::Legacy,
        });
    });

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Duplicate route table entry for cgi 138")));
    assert!(errors.iter().any(|e| e.contains("Route path must start with '/'")));
}

#[test]
fn test_return_codes_must_differ() {
    let config = ClientConfig::default_with_overrides(|c| {
        c.return_codes.logged_out = c.return_codes.session_timeout;
    });
    assert!(config.validate().iter().any(|e| e.contains("must differ")));

    let config = ClientConfig::default_with_overrides(|c| c.return_codes.session_timeout = 0);
    assert!(config.validate().iter().any(|e| e.contains("must be non-zero")));
}

#[test]
fn test_timeouts_too_short() {
    let config = ClientConfig::default_with_overrides(|c| {
        c.transport.http_timeout = Duration::from_millis(10);
        c.transport.handshake_timeout = Duration::from_millis(10);
        c.long_link.connect_timeout = Duration::from_millis(10);
        c.long_link.heartbeat_interval = Duration::from_millis(10);
    });

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("HTTP timeout too short")));
    assert!(errors.iter().any(|e| e.contains("Handshake timeout too short")));
    assert!(errors.iter().any(|e| e.contains("Connect timeout too short")));
    assert!(errors.iter().any(|e| e.contains("Heartbeat interval too short")));
}

#[test]
fn test_payload_and_record_limits() {
    let config = ClientConfig::default_with_overrides(|c| {
        c.transport.max_payload_size = 100;
        c.transport.compression_level = 12;
        c.long_link.max_record_size = 1 << 20;
    });

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Max payload size too small")));
    assert!(errors.iter().any(|e| e.contains("Invalid compression level")));
    assert!(errors.iter().any(|e| e.contains("16-bit record length")));
}

#[test]
fn test_file_store_requires_directory() {
    let config = ClientConfig::default_with_overrides(|c| {
        c.store.backend = StoreBackendKind::File;
        c.store.directory = None;
    });
    assert!(config.validate().iter().any(|e| e.contains("store.directory")));
    assert!(SessionStore::from_config(&config.store).is_err());
}

#[test]
fn test_logging_needs_an_output() {
    let config = ClientConfig::default_with_overrides(|c| {
        c.logging.log_to_console = false;
        c.logging.log_to_file = false;
    });
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("At least one logging output")));
}

#[test]
fn test_validate_strict_joins_errors() {
    let config = ClientConfig::default_with_overrides(|c| {
        c.endpoints.short_host.clear();
        c.protocol.user_agent.clear();
    });
    let err = config.validate_strict().unwrap_err().to_string();
    assert!(err.contains("Short-link host"));
    assert!(err.contains("User agent"));
}

#[test]
fn test_toml_roundtrip_through_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("client.toml");

    let config = ClientConfig::default_with_overrides(|c| {
        c.endpoints.short_host = "short.example".into();
        c.long_link.heartbeat_interval = Duration::from_secs(45);
        c.logging.log_level = Level::DEBUG;
    });
    config.save_to_file(&path).unwrap();

    let loaded = ClientConfig::from_file(&path).unwrap();
    assert_eq!(loaded.endpoints.short_host, "short.example");
    assert_eq!(loaded.long_link.heartbeat_interval, Duration::from_secs(45));
    assert_eq!(loaded.logging.log_level, Level::DEBUG);
    assert_eq!(loaded.route_variant(NEWSYNC_CGI), DecodeVariant::Aead);
}

#[test]
fn test_toml_route_table_and_missing_sections() {
    let toml = r#"
        [[routes]]
        cgi = 138
        path = "/cgi-bin/micromsg-bin/newsync"
        variant = "aead"

        [[routes]]
        cgi = 522
        path = "/cgi-bin/micromsg-bin/newsendmsg"
        variant = "legacy"

        [store]
        backend = "memory"
        default_ttl_seconds = -1
    "#;

    let config = ClientConfig::from_toml(toml).unwrap();
    assert_eq!(config.routes.len(), 2);
    assert_eq!(config.route_variant(522), DecodeVariant::Legacy);
    assert_eq!(config.store.default_ttl_seconds, -1);
    assert_eq!(config.endpoints.scheme, "http");
    assert!(config.validate().is_empty());
}

#[test]
fn test_bad_toml_is_config_error() {
    assert!(ClientConfig::from_toml("[endpoints]\nshort_host = 5").is_err());
    assert!(ClientConfig::from_file("/definitely/not/here.toml").is_err());
}

#[test]
fn test_example_config_parses() {
    let example = ClientConfig::example_config();
    let parsed = ClientConfig::from_toml(&example).unwrap();
    assert!(parsed.validate().is_empty());
}
