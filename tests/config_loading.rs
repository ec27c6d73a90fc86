use std::io::Write;

use weft_core::config::{AppConfig, ErrorPolicy};
use weft_core::WeftError;

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[engine]
max_concurrency = 8
approval_timeout_secs = 60
item_concurrency = 3
max_loop_iterations = 20
preview_chars = 120
working_dir = "/tmp/weft-test"

[live]
interval_ms = 250
max_passes = 12
error_policy = "stop"
max_consecutive_errors = 2

[model]
base_url = "http://localhost:11434/v1"
model_id = "llama3.2"
temperature = 0.2
input_cost_per_mtok = 0.5
output_cost_per_mtok = 1.5

[tools]
endpoint = "http://localhost:8700"
timeout_secs = 15

[workflows]
dir = "/srv/workflows"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.engine.max_concurrency, 8);
    assert_eq!(config.engine.approval_timeout().as_secs(), 60);
    assert_eq!(config.engine.item_concurrency, 3);
    assert_eq!(config.engine.max_loop_iterations, 20);
    assert_eq!(config.engine.preview_chars, 120);
    assert_eq!(config.engine.working_dir().to_string_lossy(), "/tmp/weft-test");

    assert_eq!(config.live.interval().as_millis(), 250);
    assert_eq!(config.live.max_passes, 12);
    assert_eq!(config.live.error_policy, ErrorPolicy::Stop);
    assert_eq!(config.live.max_consecutive_errors, 2);

    let model = config.model.expect("model present");
    assert_eq!(model.model_id, "llama3.2");
    assert_eq!(model.base_url, "http://localhost:11434/v1");
    assert_eq!(model.temperature, Some(0.2));
    assert!(model.api_key.is_none());

    let tools = config.tools.expect("tools present");
    assert_eq!(tools.endpoint, "http://localhost:8700");
    assert_eq!(tools.timeout_secs, 15);

    assert_eq!(
        config.workflows.expect("workflows present").dir().to_string_lossy(),
        "/srv/workflows"
    );
}

#[test]
fn test_env_var_expansion_in_config() {
    std::env::set_var("WEFT_TEST_API_KEY", "expanded-key-value");

    let toml_content = r#"
[model]
model_id = "gpt-4o-mini"
api_key = "${WEFT_TEST_API_KEY}"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");
    assert_eq!(
        config.model.expect("model present").api_key,
        Some("expanded-key-value".to_string())
    );

    std::env::remove_var("WEFT_TEST_API_KEY");
}

#[test]
fn test_minimal_config_uses_defaults() {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"[engine]\nmax_concurrency = 2\n").expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");
    assert_eq!(config.engine.max_concurrency, 2);
    assert_eq!(config.engine.item_concurrency, 1);
    assert_eq!(config.engine.max_loop_iterations, 50);
    assert_eq!(config.live.max_consecutive_errors, 5);
    assert!(config.model.is_none());
    assert!(config.tools.is_none());
    assert!(config.workflows.is_none());
}

#[test]
fn test_zero_concurrency_is_rejected() {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"[engine]\nmax_concurrency = 0\n").expect("write toml");

    let err = AppConfig::load(tmp.path()).unwrap_err();
    assert!(matches!(err, WeftError::Config(msg) if msg.contains("max_concurrency")));
}

#[test]
fn test_missing_file_and_bad_toml() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let err = AppConfig::load(&dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, WeftError::ConfigNotFound(_)));

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"[engine\nmax_concurrency = ").expect("write toml");
    assert!(matches!(
        AppConfig::load(tmp.path()).unwrap_err(),
        WeftError::Config(_)
    ));
}
