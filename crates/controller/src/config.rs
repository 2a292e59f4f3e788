use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::time::Duration;

use medsum_auth::SessionExchangeConfig;
use medsum_gateway::{ExecutorConfig, Paging};

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub sso_auth_url: String,
    pub sso_auth_referrer: Option<String>,
    pub sso_timeout: Duration,
    pub session_refresh_ahead: Duration,
    pub tool_server_url: String,
    pub tool_timeout: Duration,
    pub model: ModelConfig,
    pub upstream_max_concurrency: usize,
    pub upstream_max_attempts: u32,
    pub upstream_base_delay: Duration,
    pub upstream_jitter: Duration,
    pub page_size: usize,
    pub max_pages: usize,
    pub grouping_prompt_path: String,
    pub enrichment_prompt_path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelProvider {
    Azure,
    OpenAi,
}

#[derive(Clone)]
pub struct ModelConfig {
    pub provider: ModelProvider,
    pub endpoint: String,
    pub api_key: Option<String>,
    pub deployment: String,
    pub api_version: String,
    pub timeout: Duration,
    pub max_turns: u32,
}

impl std::fmt::Debug for ModelConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelConfig")
            .field("provider", &self.provider)
            .field("endpoint", &self.endpoint)
            .field(
                "api_key",
                &if self.api_key.is_some() {
                    "present"
                } else {
                    "missing"
                },
            )
            .field("deployment", &self.deployment)
            .field("api_version", &self.api_version)
            .field("timeout", &self.timeout)
            .field("max_turns", &self.max_turns)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupError {
    pub code: &'static str,
    pub message: String,
}

impl std::fmt::Display for StartupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for StartupError {}

impl ControllerConfig {
    pub fn load() -> Result<Self, StartupError> {
        let mut merged = HashMap::new();

        if let Ok(config_path) = std::env::var("MEDSUM_CONFIG_PATH") {
            let config_path = config_path.trim();
            if !config_path.is_empty() {
                let file_kv = parse_env_file(config_path)?;
                merged.extend(file_kv);
            }
        }

        merged.extend(std::env::vars());

        Self::from_kv(&merged)
    }

    pub fn from_kv(kv: &HashMap<String, String>) -> Result<Self, StartupError> {
        let sso_auth_url = require_nonempty(kv, "MEDSUM_SSO_AUTH_URL")?;
        let sso_auth_referrer = optional_nonempty(kv, "MEDSUM_SSO_AUTH_REFERRER");
        let sso_timeout_ms = parse_u64(kv.get("MEDSUM_SSO_TIMEOUT_MS"), 10_000, "MEDSUM_SSO_TIMEOUT_MS")?;
        let refresh_ahead_secs = in_range(
            parse_u64(
                kv.get("MEDSUM_SESSION_REFRESH_AHEAD_SECS"),
                60,
                "MEDSUM_SESSION_REFRESH_AHEAD_SECS",
            )?,
            0..=3600,
            "MEDSUM_SESSION_REFRESH_AHEAD_SECS",
        )?;

        let tool_server_url = require_nonempty(kv, "MEDSUM_TOOL_SERVER_URL")?;
        let tool_timeout_ms =
            parse_u64(kv.get("MEDSUM_TOOL_TIMEOUT_MS"), 30_000, "MEDSUM_TOOL_TIMEOUT_MS")?;

        let provider = match kv
            .get("MEDSUM_MODEL_PROVIDER")
            .map(|v| v.trim().to_ascii_lowercase())
            .filter(|v| !v.is_empty())
            .as_deref()
        {
            None | Some("azure") => ModelProvider::Azure,
            Some("openai") => ModelProvider::OpenAi,
            Some(_) => {
                return Err(StartupError {
                    code: "ERR_INVALID_CONFIG",
                    message: "MEDSUM_MODEL_PROVIDER must be azure or openai".to_string(),
                });
            }
        };

        let model = ModelConfig {
            provider,
            endpoint: require_nonempty(kv, "MEDSUM_MODEL_ENDPOINT")?,
            api_key: optional_nonempty(kv, "MEDSUM_MODEL_API_KEY"),
            deployment: optional_nonempty(kv, "MEDSUM_MODEL_DEPLOYMENT")
                .unwrap_or_else(|| "gpt-4o".to_string()),
            api_version: optional_nonempty(kv, "MEDSUM_MODEL_API_VERSION")
                .unwrap_or_else(|| "2025-03-01-preview".to_string()),
            timeout: Duration::from_millis(parse_u64(
                kv.get("MEDSUM_MODEL_TIMEOUT_MS"),
                120_000,
                "MEDSUM_MODEL_TIMEOUT_MS",
            )?),
            max_turns: in_range(
                parse_u32(kv.get("MEDSUM_MODEL_MAX_TURNS"), 10, "MEDSUM_MODEL_MAX_TURNS")?,
                1..=50,
                "MEDSUM_MODEL_MAX_TURNS",
            )?,
        };

        let upstream_max_concurrency = parse_usize(
            kv.get("MEDSUM_UPSTREAM_MAX_CONCURRENCY"),
            4,
            "MEDSUM_UPSTREAM_MAX_CONCURRENCY",
        )?;
        if upstream_max_concurrency == 0 {
            return Err(StartupError {
                code: "ERR_INVALID_CONFIG",
                message: "MEDSUM_UPSTREAM_MAX_CONCURRENCY must be >= 1".to_string(),
            });
        }
        let upstream_max_attempts = in_range(
            parse_u32(
                kv.get("MEDSUM_UPSTREAM_MAX_ATTEMPTS"),
                5,
                "MEDSUM_UPSTREAM_MAX_ATTEMPTS",
            )?,
            1..=10,
            "MEDSUM_UPSTREAM_MAX_ATTEMPTS",
        )?;
        let upstream_base_delay_ms = parse_u64(
            kv.get("MEDSUM_UPSTREAM_BASE_DELAY_MS"),
            500,
            "MEDSUM_UPSTREAM_BASE_DELAY_MS",
        )?;
        let upstream_jitter_ms = parse_u64(
            kv.get("MEDSUM_UPSTREAM_JITTER_MS"),
            250,
            "MEDSUM_UPSTREAM_JITTER_MS",
        )?;

        let page_size = in_range(
            parse_usize(kv.get("MEDSUM_PAGE_SIZE"), 100, "MEDSUM_PAGE_SIZE")?,
            1..=1000,
            "MEDSUM_PAGE_SIZE",
        )?;
        let max_pages = in_range(
            parse_usize(kv.get("MEDSUM_MAX_PAGES"), 4, "MEDSUM_MAX_PAGES")?,
            1..=100,
            "MEDSUM_MAX_PAGES",
        )?;

        let grouping_prompt_path = require_nonempty(kv, "MEDSUM_GROUPING_PROMPT_PATH")?;
        let enrichment_prompt_path = require_nonempty(kv, "MEDSUM_ENRICHMENT_PROMPT_PATH")?;

        Ok(Self {
            sso_auth_url,
            sso_auth_referrer,
            sso_timeout: Duration::from_millis(sso_timeout_ms),
            session_refresh_ahead: Duration::from_secs(refresh_ahead_secs),
            tool_server_url,
            tool_timeout: Duration::from_millis(tool_timeout_ms),
            model,
            upstream_max_concurrency,
            upstream_max_attempts,
            upstream_base_delay: Duration::from_millis(upstream_base_delay_ms),
            upstream_jitter: Duration::from_millis(upstream_jitter_ms),
            page_size,
            max_pages,
            grouping_prompt_path,
            enrichment_prompt_path,
        })
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            max_concurrency: self.upstream_max_concurrency,
            max_attempts: self.upstream_max_attempts,
            base_delay: self.upstream_base_delay,
            jitter: self.upstream_jitter,
        }
    }

    pub fn paging(&self) -> Paging {
        Paging {
            page_size: self.page_size,
            max_pages: self.max_pages,
        }
    }

    pub fn session_exchange(&self) -> SessionExchangeConfig {
        SessionExchangeConfig {
            url: self.sso_auth_url.clone(),
            referrer: self.sso_auth_referrer.clone(),
            timeout: self.sso_timeout,
        }
    }
}

/// Stage instruction templates read from the configured prompt files.
#[derive(Debug, Clone)]
pub struct StagePrompts {
    pub grouping: String,
    pub enrichment: String,
}

impl StagePrompts {
    pub fn load(config: &ControllerConfig) -> Result<Self, StartupError> {
        Ok(Self {
            grouping: read_prompt(&config.grouping_prompt_path)?,
            enrichment: read_prompt(&config.enrichment_prompt_path)?,
        })
    }
}

fn read_prompt(path: &str) -> Result<String, StartupError> {
    let text = std::fs::read_to_string(path).map_err(|_| StartupError {
        code: "ERR_PROMPT_READ",
        message: format!("failed to read prompt file at {}", path),
    })?;
    let text = text.trim();
    if text.is_empty() {
        return Err(StartupError {
            code: "ERR_PROMPT_READ",
            message: format!("prompt file at {} is empty", path),
        });
    }
    Ok(text.to_string())
}

fn parse_env_file(path: &str) -> Result<HashMap<String, String>, StartupError> {
    let contents = std::fs::read_to_string(path).map_err(|_| StartupError {
        code: "ERR_CONFIG_FILE_READ",
        message: format!("failed to read config file at {}", path),
    })?;

    let mut kv = HashMap::new();
    for (idx, raw_line) in contents.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (key, value) = line.split_once('=').ok_or_else(|| StartupError {
            code: "ERR_CONFIG_FILE_PARSE",
            message: format!("invalid config line {} (expected KEY=VALUE)", idx + 1),
        })?;

        let key = key.trim();
        if key.is_empty() {
            return Err(StartupError {
                code: "ERR_CONFIG_FILE_PARSE",
                message: format!("invalid config line {} (empty key)", idx + 1),
            });
        }

        kv.insert(key.to_string(), strip_quotes(value.trim()));
    }

    Ok(kv)
}

fn strip_quotes(s: &str) -> String {
    for quote in ['"', '\''] {
        if s.len() >= 2
            && let Some(inner) = s.strip_prefix(quote).and_then(|r| r.strip_suffix(quote))
        {
            return inner.to_string();
        }
    }
    s.to_string()
}

fn require_nonempty(
    kv: &HashMap<String, String>,
    key: &'static str,
) -> Result<String, StartupError> {
    optional_nonempty(kv, key).ok_or_else(|| StartupError {
        code: "ERR_MISSING_CONFIG",
        message: format!("missing required config key {}", key),
    })
}

fn optional_nonempty(kv: &HashMap<String, String>, key: &str) -> Option<String> {
    kv.get(key)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(|v| v.to_string())
}

fn parse_u64(value: Option<&String>, default: u64, key: &'static str) -> Result<u64, StartupError> {
    match value {
        None => Ok(default),
        Some(v) if v.trim().is_empty() => Ok(default),
        Some(v) => v.trim().parse::<u64>().map_err(|_| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} must be an integer", key),
        }),
    }
}

fn parse_u32(value: Option<&String>, default: u32, key: &'static str) -> Result<u32, StartupError> {
    match value {
        None => Ok(default),
        Some(v) if v.trim().is_empty() => Ok(default),
        Some(v) => v.trim().parse::<u32>().map_err(|_| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} must be an integer", key),
        }),
    }
}

fn parse_usize(
    value: Option<&String>,
    default: usize,
    key: &'static str,
) -> Result<usize, StartupError> {
    match value {
        None => Ok(default),
        Some(v) if v.trim().is_empty() => Ok(default),
        Some(v) => v.trim().parse::<usize>().map_err(|_| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} must be an integer", key),
        }),
    }
}

fn in_range<T>(value: T, range: RangeInclusive<T>, key: &'static str) -> Result<T, StartupError>
where
    T: PartialOrd + std::fmt::Display,
{
    if range.contains(&value) {
        return Ok(value);
    }
    Err(StartupError {
        code: "ERR_INVALID_CONFIG",
        message: format!(
            "{} must be between {} and {}",
            key,
            range.start(),
            range.end()
        ),
    })
}
