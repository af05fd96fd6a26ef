use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

use crate::brain::{Provider, ProviderConfig};
use crate::engine::RetryPolicy;
use crate::error::ConfigError;
use crate::hands::ChromeOptions;
use crate::storage::InfluxConfig;
use crate::tasks::Budgets;

pub const PORTFOLIO_URL_KEY: &str = "PORTFOLIO_URL";
pub const BROWSER_HEADLESS_KEY: &str = "BROWSER_HEADLESS";
pub const CHROME_DEBUG_URL_KEY: &str = "CHROME_DEBUG_URL";
pub const LLM_PROVIDER_KEY: &str = "LLM_PROVIDER";
pub const LLM_TIMEOUT_KEY: &str = "LLM_TIMEOUT_SECS";
pub const RAW_MAX_STEPS_KEY: &str = "RAW_MAX_STEPS";
pub const STRUCTURED_MAX_STEPS_KEY: &str = "STRUCTURED_MAX_STEPS";
pub const TIME_BUDGET_KEY: &str = "TASK_TIME_BUDGET_SECS";
pub const MAX_ATTEMPTS_KEY: &str = "MAX_ATTEMPTS";
pub const INFLUX_URL_KEY: &str = "INFLUX_URL";
pub const INFLUX_TOKEN_KEY: &str = "INFLUX_TOKEN";
pub const INFLUX_ORG_KEY: &str = "INFLUX_ORG";
pub const INFLUX_BUCKET_KEY: &str = "INFLUX_BUCKET";
pub const INFLUX_SERIES_KEY: &str = "INFLUX_SERIES";

pub const DEFAULT_CHROME_DEBUG_URL: &str = "http://127.0.0.1:9222";
pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o";
pub const DEFAULT_ANTHROPIC_MODEL: &str = "claude-3-5-sonnet-20240620";
pub const DEFAULT_OLLAMA_MODEL: &str = "llama3.2:3b";
pub const DEFAULT_OLLAMA_NUM_CTX: u32 = 32000;
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.0-flash-exp";
pub const DEFAULT_SERIES: &str = "portfolio";

/// Everything a run needs, resolved from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub portfolio_url: String,
    pub chrome: ChromeOptions,
    pub provider: ProviderConfig,
    pub budgets: Budgets,
    pub retry: RetryPolicy,
    /// `None` when InfluxDB is not fully configured.
    pub influx: Option<InfluxConfig>,
    pub series: String,
}

impl Config {
    /// Load `.env` (if present) and read the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let portfolio_url = get(PORTFOLIO_URL_KEY).ok_or(ConfigError::Missing(PORTFOLIO_URL_KEY))?;

        let headless = get(BROWSER_HEADLESS_KEY)
            .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes"))
            .unwrap_or(true);
        let chrome = ChromeOptions {
            endpoint: get(CHROME_DEBUG_URL_KEY).unwrap_or_else(|| DEFAULT_CHROME_DEBUG_URL.into()),
            headless,
            ..ChromeOptions::default()
        };

        let provider = provider_config(&get)?;

        let defaults = Budgets::default();
        let budgets = Budgets {
            raw_steps: parse_or(&get, RAW_MAX_STEPS_KEY, defaults.raw_steps)?,
            structured_steps: parse_or(&get, STRUCTURED_MAX_STEPS_KEY, defaults.structured_steps)?,
            time_budget: Duration::from_secs(parse_or(
                &get,
                TIME_BUDGET_KEY,
                defaults.time_budget.as_secs(),
            )?),
        };

        let retry = RetryPolicy {
            max_attempts: parse_or(&get, MAX_ATTEMPTS_KEY, RetryPolicy::default().max_attempts)?,
            ..RetryPolicy::default()
        };
        if retry.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                key: MAX_ATTEMPTS_KEY,
                reason: "must be at least 1".into(),
            });
        }

        let influx = match (
            get(INFLUX_URL_KEY),
            get(INFLUX_TOKEN_KEY),
            get(INFLUX_ORG_KEY),
            get(INFLUX_BUCKET_KEY),
        ) {
            (Some(url), Some(token), Some(org), Some(bucket)) => Some(InfluxConfig {
                url,
                token,
                org,
                bucket,
            }),
            (None, None, None, None) => None,
            _ => {
                warn!("InfluxDB configuration environment variables not fully set; storage disabled");
                None
            }
        };

        Ok(Self {
            portfolio_url,
            chrome,
            provider,
            budgets,
            retry,
            influx,
            series: get(INFLUX_SERIES_KEY).unwrap_or_else(|| DEFAULT_SERIES.into()),
        })
    }
}

fn provider_config(get: &dyn Fn(&str) -> Option<String>) -> Result<ProviderConfig, ConfigError> {
    let provider = match get(LLM_PROVIDER_KEY) {
        Some(name) => Provider::from_str(&name).map_err(|reason| ConfigError::Invalid {
            key: LLM_PROVIDER_KEY,
            reason,
        })?,
        None => Provider::OpenAi,
    };
    let timeout = Duration::from_secs(parse_or(get, LLM_TIMEOUT_KEY, 100u64)?);

    let required = |key: &'static str| get(key).ok_or(ConfigError::Missing(key));

    let config = match provider {
        Provider::OpenAi => ProviderConfig {
            provider,
            model: get("OPENAI_MODEL").unwrap_or_else(|| DEFAULT_OPENAI_MODEL.into()),
            api_key: Some(required("OPENAI_API_KEY")?),
            base_url: get("OPENAI_BASE_URL").unwrap_or_else(|| "https://api.openai.com".into()),
            timeout,
            num_ctx: None,
        },
        Provider::Anthropic => ProviderConfig {
            provider,
            model: get("ANTHROPIC_MODEL").unwrap_or_else(|| DEFAULT_ANTHROPIC_MODEL.into()),
            api_key: Some(required("ANTHROPIC_API_KEY")?),
            base_url: "https://api.anthropic.com".into(),
            timeout,
            num_ctx: None,
        },
        Provider::Ollama => ProviderConfig {
            provider,
            model: get("OLLAMA_MODEL").unwrap_or_else(|| DEFAULT_OLLAMA_MODEL.into()),
            api_key: None,
            base_url: get("OLLAMA_HOST").unwrap_or_else(|| "http://localhost:11434".into()),
            timeout,
            num_ctx: Some(parse_or(get, "OLLAMA_NUM_CTX", DEFAULT_OLLAMA_NUM_CTX)?),
        },
        Provider::Google => ProviderConfig {
            provider,
            model: get("GEMINI_MODEL").unwrap_or_else(|| DEFAULT_GEMINI_MODEL.into()),
            api_key: Some(required("GEMINI_API_KEY")?),
            base_url: "https://generativelanguage.googleapis.com".into(),
            timeout,
            num_ctx: None,
        },
    };
    Ok(config)
}

fn parse_or<T>(
    get: &dyn Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get(key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            reason: format!("'{raw}': {e}"),
        }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn defaults_apply_with_minimal_environment() {
        let config = load(&[
            ("PORTFOLIO_URL", "https://dash.example/p"),
            ("OPENAI_API_KEY", "sk-test"),
        ])
        .unwrap();

        assert_eq!(config.portfolio_url, "https://dash.example/p");
        assert!(config.chrome.headless);
        assert_eq!(config.chrome.endpoint, DEFAULT_CHROME_DEBUG_URL);
        assert_eq!(config.provider.provider, Provider::OpenAi);
        assert_eq!(config.provider.model, DEFAULT_OPENAI_MODEL);
        assert_eq!(config.provider.timeout, Duration::from_secs(100));
        assert_eq!(config.budgets, Budgets::default());
        assert_eq!(config.retry.max_attempts, 3);
        assert!(config.influx.is_none());
        assert_eq!(config.series, "portfolio");
    }

    #[test]
    fn portfolio_url_is_required() {
        assert_eq!(
            load(&[("OPENAI_API_KEY", "k")]).unwrap_err(),
            ConfigError::Missing(PORTFOLIO_URL_KEY)
        );
    }

    #[test]
    fn provider_selection_and_keys() {
        let config = load(&[
            ("PORTFOLIO_URL", "u"),
            ("LLM_PROVIDER", "ollama"),
            ("OLLAMA_NUM_CTX", "8192"),
        ])
        .unwrap();
        assert_eq!(config.provider.provider, Provider::Ollama);
        assert_eq!(config.provider.num_ctx, Some(8192));
        assert_eq!(config.provider.api_key, None);

        assert_eq!(
            load(&[("PORTFOLIO_URL", "u"), ("LLM_PROVIDER", "google")]).unwrap_err(),
            ConfigError::Missing("GEMINI_API_KEY")
        );
        assert!(matches!(
            load(&[("PORTFOLIO_URL", "u"), ("LLM_PROVIDER", "hal9000")]).unwrap_err(),
            ConfigError::Invalid { key: LLM_PROVIDER_KEY, .. }
        ));
    }

    #[test]
    fn headless_flag_and_budgets_parse() {
        let config = load(&[
            ("PORTFOLIO_URL", "u"),
            ("ANTHROPIC_API_KEY", "k"),
            ("LLM_PROVIDER", "anthropic"),
            ("BROWSER_HEADLESS", "no"),
            ("STRUCTURED_MAX_STEPS", "12"),
            ("TASK_TIME_BUDGET_SECS", "90"),
        ])
        .unwrap();
        assert!(!config.chrome.headless);
        assert_eq!(config.budgets.structured_steps, 12);
        assert_eq!(config.budgets.time_budget, Duration::from_secs(90));

        assert!(matches!(
            load(&[("PORTFOLIO_URL", "u"), ("OPENAI_API_KEY", "k"), ("MAX_ATTEMPTS", "three")])
                .unwrap_err(),
            ConfigError::Invalid { key: MAX_ATTEMPTS_KEY, .. }
        ));
    }

    #[test]
    fn influx_needs_all_four_settings() {
        let base = [("PORTFOLIO_URL", "u"), ("OPENAI_API_KEY", "k")];

        let partial = load(&[base[0], base[1], ("INFLUX_URL", "http://localhost:8086")]).unwrap();
        assert!(partial.influx.is_none());

        let full = load(&[
            base[0],
            base[1],
            ("INFLUX_URL", "http://localhost:8086"),
            ("INFLUX_TOKEN", "t"),
            ("INFLUX_ORG", "o"),
            ("INFLUX_BUCKET", "b"),
        ])
        .unwrap();
        assert_eq!(full.influx.unwrap().bucket, "b");
    }
}
