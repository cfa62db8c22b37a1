//! Loading relay configuration from disk.

use std::fs;

use livecode_collab::config::{CommandSpec, ConfigError, ServerConfig};
use tempfile::tempdir;

#[test]
fn test_load_partial_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("relay.toml");
    fs::write(
        &path,
        r#"
bind_addr = "0.0.0.0:7000"
max_peers_per_session = 8

[execution]
timeout_secs = 3
default_language = "ruby"

[execution.languages.ruby]
program = "ruby"
args = ["-"]
"#,
    )
    .unwrap();

    let config = ServerConfig::load(&path).unwrap();
    assert_eq!(config.bind_addr, "0.0.0.0:7000");
    assert_eq!(config.max_peers_per_session, 8);
    // Untouched fields keep their defaults
    assert_eq!(config.http_addr, ServerConfig::default().http_addr);
    assert_eq!(config.execution.timeout().as_secs(), 3);
    assert_eq!(
        config.execution.languages.get("ruby"),
        Some(&CommandSpec::new("ruby", &["-"]))
    );
    assert_eq!(config.execution.default_language, "ruby");
}

#[test]
fn test_missing_file() {
    let dir = tempdir().unwrap();
    let err = ServerConfig::load(&dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, ConfigError::Io { .. }));
}

#[test]
fn test_malformed_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("bad.toml");
    fs::write(&path, "max_peers_per_session = \"many\"").unwrap();
    assert!(matches!(
        ServerConfig::load(&path).unwrap_err(),
        ConfigError::Parse(_)
    ));
}

#[test]
fn test_default_language_without_interpreter() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("relay.toml");
    fs::write(
        &path,
        r#"
[execution.languages.ruby]
program = "ruby"
"#,
    )
    .unwrap();
    let err = ServerConfig::load(&path).unwrap_err();
    assert!(matches!(err, ConfigError::UnknownDefaultLanguage(ref lang) if lang == "javascript"));
    assert!(err.to_string().contains("javascript"));
}
