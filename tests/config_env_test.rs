//! Config environment variable tests
//!
//! Config::from_env() also loads a .env file via dotenvy, so these tests
//! set every variable they assert on and remove it afterwards.
//!
//! Tests use #[serial] to prevent race conditions with shared env vars.

use pipeline_healer::config::{Config, LogFormat};
use serial_test::serial;
use std::env;

fn clear(keys: &[&str]) {
    for key in keys {
        env::remove_var(key);
    }
}

#[test]
#[serial]
fn test_config_from_env_loads_successfully() {
    let result = Config::from_env();
    assert!(result.is_ok(), "Config::from_env() should succeed without overrides");
}

#[test]
#[serial]
fn test_config_from_env_healing_policy() {
    env::set_var("HEALING_CONFIDENCE_THRESHOLD", "0.9");
    env::set_var("HEALING_AUTO_APPLY", "true");
    env::set_var("HEALING_LLM_TIMEOUT_MS", "1500");
    env::set_var("HEALING_BASE_BRANCH", "develop");

    let config = Config::from_env().unwrap();
    assert_eq!(config.healing.confidence_threshold, 0.9);
    assert!(config.healing.auto_apply);
    assert_eq!(config.healing.llm_timeout_ms, 1500);
    assert_eq!(config.healing.base_branch, "develop");

    clear(&[
        "HEALING_CONFIDENCE_THRESHOLD",
        "HEALING_AUTO_APPLY",
        "HEALING_LLM_TIMEOUT_MS",
        "HEALING_BASE_BRANCH",
    ]);
}

#[test]
#[serial]
fn test_config_from_env_rejects_out_of_range_threshold() {
    env::set_var("HEALING_CONFIDENCE_THRESHOLD", "1.5");

    let result = Config::from_env();
    assert!(result.is_err());
    assert!(result
        .unwrap_err()
        .to_string()
        .contains("HEALING_CONFIDENCE_THRESHOLD"));

    clear(&["HEALING_CONFIDENCE_THRESHOLD"]);
}

#[test]
#[serial]
fn test_config_from_env_knowledge_thresholds() {
    env::set_var("KNOWLEDGE_ENABLED", "off");
    env::set_var("KNOWLEDGE_MIN_CONFIDENCE", "0.8");
    env::set_var("KNOWLEDGE_MIN_SUCCESS_COUNT", "5");

    let config = Config::from_env().unwrap();
    assert!(!config.knowledge.enabled);
    assert_eq!(config.knowledge.min_confidence, 0.8);
    assert_eq!(config.knowledge.min_success_count, 5);

    clear(&[
        "KNOWLEDGE_ENABLED",
        "KNOWLEDGE_MIN_CONFIDENCE",
        "KNOWLEDGE_MIN_SUCCESS_COUNT",
    ]);
}

#[test]
#[serial]
fn test_config_from_env_llm_is_inactive_without_key() {
    env::set_var("ANTHROPIC_API_KEY", "   ");

    let config = Config::from_env().unwrap();
    assert!(config.llm.api_key.is_none());
    assert!(!config.llm.is_active());

    env::set_var("ANTHROPIC_API_KEY", "sk-test");
    env::set_var("LLM_ENABLED", "false");
    let config = Config::from_env().unwrap();
    assert!(!config.llm.is_active());

    clear(&["ANTHROPIC_API_KEY", "LLM_ENABLED"]);
}

#[test]
#[serial]
fn test_config_from_env_custom_database() {
    env::set_var("DATABASE_PATH", "/custom/path.db");
    env::set_var("DATABASE_MAX_CONNECTIONS", "10");

    let config = Config::from_env().unwrap();
    assert_eq!(config.database.path.to_str().unwrap(), "/custom/path.db");
    assert_eq!(config.database.max_connections, 10);

    clear(&["DATABASE_PATH", "DATABASE_MAX_CONNECTIONS"]);
}

#[test]
#[serial]
fn test_config_from_env_log_format() {
    env::set_var("LOG_FORMAT", "JSON");
    let config = Config::from_env().unwrap();
    assert!(matches!(config.logging.format, LogFormat::Json));

    env::set_var("LOG_FORMAT", "anything-else");
    let config = Config::from_env().unwrap();
    assert!(matches!(config.logging.format, LogFormat::Pretty));

    clear(&["LOG_FORMAT"]);
}

#[test]
#[serial]
fn test_config_from_env_scm_and_consumer() {
    env::set_var("GITHUB_TOKEN", "ghp_test");
    env::set_var("GITHUB_API_URL", "https://github.example.com/api/v3");
    env::set_var("CONSUMER_CONCURRENCY", "0");

    let config = Config::from_env().unwrap();
    assert_eq!(config.scm.token.as_deref(), Some("ghp_test"));
    assert_eq!(config.scm.base_url, "https://github.example.com/api/v3");
    assert_eq!(config.consumer.concurrency, 1);

    clear(&["GITHUB_TOKEN", "GITHUB_API_URL", "CONSUMER_CONCURRENCY"]);
}

#[test]
#[serial]
fn test_config_from_env_invalid_numbers_use_defaults() {
    env::set_var("REQUEST_TIMEOUT_MS", "not-a-number");
    env::set_var("MAX_RETRIES", "-1");

    let config = Config::from_env().unwrap();
    assert_eq!(config.request.timeout_ms, 30000);
    assert_eq!(config.request.max_retries, 3);

    clear(&["REQUEST_TIMEOUT_MS", "MAX_RETRIES"]);
}
