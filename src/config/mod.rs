use std::env;
use std::path::PathBuf;

use crate::error::AppError;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub llm: LlmConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub request: RequestConfig,
    pub healing: HealingConfig,
    pub knowledge: KnowledgeConfig,
    pub scm: ScmConfig,
    pub consumer: ConsumerConfig,
}

/// LLM (Anthropic Messages API) configuration
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// API key. When absent the deterministic fallback generator is used.
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub max_tokens: u32,
    /// Administrative switch for the LLM path.
    pub enabled: bool,
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub max_connections: u32,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

/// Log output format
#[derive(Debug, Clone, PartialEq)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// HTTP request configuration
#[derive(Debug, Clone)]
pub struct RequestConfig {
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

/// Healing decision policy
#[derive(Debug, Clone)]
pub struct HealingConfig {
    /// Plans below this confidence are escalated.
    pub confidence_threshold: f64,
    /// Apply confident plans without waiting for approval.
    pub auto_apply: bool,
    /// Upper bound for a single generation call.
    pub llm_timeout_ms: u64,
    /// Branch fix branches are cut from.
    pub base_branch: String,
}

/// Knowledge base lookup thresholds
#[derive(Debug, Clone)]
pub struct KnowledgeConfig {
    pub enabled: bool,
    pub min_confidence: f64,
    pub min_success_count: i64,
}

/// Source-hosting API configuration
#[derive(Debug, Clone)]
pub struct ScmConfig {
    pub token: Option<String>,
    pub base_url: String,
}

/// Event consumer configuration
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Maximum partitions processed at the same time.
    pub concurrency: usize,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, AppError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let llm = LlmConfig {
            api_key: env::var("ANTHROPIC_API_KEY").ok().filter(|k| !k.trim().is_empty()),
            base_url: env::var("ANTHROPIC_BASE_URL")
                .unwrap_or_else(|_| "https://api.anthropic.com".to_string()),
            model: env::var("ANTHROPIC_MODEL")
                .unwrap_or_else(|_| "claude-3-5-sonnet-20241022".to_string()),
            max_tokens: parse_env("LLM_MAX_TOKENS", 4096),
            enabled: parse_bool_env("LLM_ENABLED", true),
        };

        let database = DatabaseConfig {
            path: PathBuf::from(
                env::var("DATABASE_PATH").unwrap_or_else(|_| "./data/healer.db".to_string()),
            ),
            max_connections: parse_env("DATABASE_MAX_CONNECTIONS", 5),
        };

        let logging = LoggingConfig {
            level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            format: match env::var("LOG_FORMAT")
                .unwrap_or_else(|_| "pretty".to_string())
                .to_lowercase()
                .as_str()
            {
                "json" => LogFormat::Json,
                _ => LogFormat::Pretty,
            },
        };

        let request = RequestConfig {
            timeout_ms: parse_env("REQUEST_TIMEOUT_MS", 30000),
            max_retries: parse_env("MAX_RETRIES", 3),
            retry_delay_ms: parse_env("RETRY_DELAY_MS", 1000),
        };

        let healing = HealingConfig {
            confidence_threshold: parse_env("HEALING_CONFIDENCE_THRESHOLD", 0.75),
            auto_apply: parse_bool_env("HEALING_AUTO_APPLY", false),
            llm_timeout_ms: parse_env("HEALING_LLM_TIMEOUT_MS", 60000),
            base_branch: env::var("HEALING_BASE_BRANCH").unwrap_or_else(|_| "main".to_string()),
        };

        let knowledge = KnowledgeConfig {
            enabled: parse_bool_env("KNOWLEDGE_ENABLED", true),
            min_confidence: parse_env("KNOWLEDGE_MIN_CONFIDENCE", 0.70),
            min_success_count: parse_env("KNOWLEDGE_MIN_SUCCESS_COUNT", 2),
        };

        let scm = ScmConfig {
            token: env::var("GITHUB_TOKEN").ok().filter(|t| !t.trim().is_empty()),
            base_url: env::var("GITHUB_API_URL")
                .unwrap_or_else(|_| "https://api.github.com".to_string()),
        };

        let consumer = ConsumerConfig {
            concurrency: parse_env::<usize>("CONSUMER_CONCURRENCY", 4).max(1),
        };

        let config = Config {
            llm,
            database,
            logging,
            request,
            healing,
            knowledge,
            scm,
            consumer,
        };
        config.validate()?;

        Ok(config)
    }

    /// Reject values that would make the decision policy meaningless
    pub fn validate(&self) -> Result<(), AppError> {
        if !(0.0..=1.0).contains(&self.healing.confidence_threshold) {
            return Err(AppError::Config {
                message: format!(
                    "HEALING_CONFIDENCE_THRESHOLD must be within [0, 1], got {}",
                    self.healing.confidence_threshold
                ),
            });
        }
        if !(0.0..=1.0).contains(&self.knowledge.min_confidence) {
            return Err(AppError::Config {
                message: format!(
                    "KNOWLEDGE_MIN_CONFIDENCE must be within [0, 1], got {}",
                    self.knowledge.min_confidence
                ),
            });
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn parse_bool_env(key: &str, default: bool) -> bool {
    match env::var(key).map(|v| v.trim().to_lowercase()) {
        Ok(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => true,
        Ok(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => false,
        _ => default,
    }
}

impl LlmConfig {
    /// Whether generation should go through the LLM at all.
    pub fn is_active(&self) -> bool {
        self.enabled && self.api_key.is_some()
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.anthropic.com".to_string(),
            model: "claude-3-5-sonnet-20241022".to_string(),
            max_tokens: 4096,
            enabled: true,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/healer.db"),
            max_connections: 5,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30000,
            max_retries: 3,
            retry_delay_ms: 1000,
        }
    }
}

impl Default for HealingConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.75,
            auto_apply: false,
            llm_timeout_ms: 60000,
            base_branch: "main".to_string(),
        }
    }
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_confidence: 0.70,
            min_success_count: 2,
        }
    }
}

impl Default for ScmConfig {
    fn default() -> Self {
        Self {
            token: None,
            base_url: "https://api.github.com".to_string(),
        }
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self { concurrency: 4 }
    }
}
