//! Configuration file handling.

use fibra::util::config::{self, FibraConfig};
use fibra::util::logger::LogLevel;

#[test]
fn test_save_and_load_config() {
    let path = std::env::temp_dir().join(format!("fibra-config-{}.toml", std::process::id()));

    let mut original = FibraConfig::default();
    original.scheduler.task_name_prefix = "io".to_string();
    original.log.level = LogLevel::Trace;
    config::save_config(&original, &path).unwrap();

    let loaded = config::load_config(&path).unwrap();
    std::fs::remove_file(&path).unwrap();

    assert_eq!(loaded, original);
}

#[test]
fn test_invalid_file_is_an_error() {
    let path = std::env::temp_dir().join(format!("fibra-broken-{}.toml", std::process::id()));
    std::fs::write(&path, "[scheduler]\ntask_stack_size = \"big\"\n").unwrap();

    let result = config::load_config(&path);
    std::fs::remove_file(&path).unwrap();

    assert!(matches!(result, Err(config::ConfigError::ParseError(_))));
}
