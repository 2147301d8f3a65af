//! Environment-driven configuration.
//!
//! Everything has a default except what production genuinely cannot run
//! without; those are validated at startup so a misconfigured deploy dies
//! with exit code 1 instead of limping.

use std::time::Duration;

use crate::autoscaler::AutoscalerConfig;
use crate::error::ConfigError;

#[derive(Debug, Clone, Default)]
pub struct ProviderKeys {
    pub fal_api_key: String,
    pub kie_api_key: String,
    pub claid_api_key: String,
    pub gemini_api_key: String,
    pub wavespeed_api_key: String,
    /// Base URL overrides, mostly for pointing tests at a local server.
    pub tryon_base_url: Option<String>,
    pub video_base_url: Option<String>,
    pub compose_base_url: Option<String>,
    pub validate_base_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub environment: String,
    pub redis_url: Option<String>,
    pub worker_shared_secret: Option<String>,
    pub supabase_url: Option<String>,
    pub supabase_service_role_key: Option<String>,
    pub rate_limit_max: u32,
    pub rate_limit_window: Duration,
    pub fallback_rate_limit_max: u32,
    pub max_concurrent_jobs: usize,
    pub autoscaler: AutoscalerConfig,
    pub providers: ProviderKeys,
}

impl Config {
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }

    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load through a lookup function. Tests pass a map; production passes
    /// `std::env::var`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |name: &str| lookup(name).filter(|value| !value.is_empty());

        let environment = get("ENVIRONMENT").unwrap_or_else(|| "development".to_string());

        let config = Config {
            port: parse_or("PORT", &get, 8080)?,
            redis_url: get("REDIS_URL"),
            worker_shared_secret: get("WORKER_SHARED_SECRET"),
            supabase_url: get("SUPABASE_URL"),
            supabase_service_role_key: get("SUPABASE_SERVICE_ROLE_KEY"),
            rate_limit_max: parse_or("RATE_LIMIT_MAX", &get, crate::rate_limit::DEFAULT_MAX_REQUESTS)?,
            rate_limit_window: Duration::from_secs(parse_or(
                "RATE_LIMIT_WINDOW_SECS",
                &get,
                crate::rate_limit::DEFAULT_WINDOW.as_secs(),
            )?),
            fallback_rate_limit_max: parse_or(
                "FALLBACK_RATE_LIMIT_MAX",
                &get,
                crate::rate_limit::FALLBACK_MAX_REQUESTS,
            )?,
            max_concurrent_jobs: parse_or(
                "MAX_CONCURRENT_JOBS",
                &get,
                crate::guard::DEFAULT_MAX_CONCURRENT,
            )?,
            autoscaler: AutoscalerConfig {
                min_replicas: parse_or("AUTOSCALE_MIN_REPLICAS", &get, 1)?,
                max_replicas: parse_or("AUTOSCALE_MAX_REPLICAS", &get, 8)?,
                target_per_replica: parse_or("AUTOSCALE_TARGET_PER_REPLICA", &get, 5)?,
            },
            providers: ProviderKeys {
                fal_api_key: get("FAL_API_KEY").unwrap_or_default(),
                kie_api_key: get("KIE_API_KEY").unwrap_or_default(),
                claid_api_key: get("CLAID_API_KEY").unwrap_or_default(),
                gemini_api_key: get("GEMINI_API_KEY").unwrap_or_default(),
                wavespeed_api_key: get("WAVESPEED_API_KEY").unwrap_or_default(),
                tryon_base_url: get("TRYON_BASE_URL"),
                video_base_url: get("VIDEO_BASE_URL"),
                compose_base_url: get("COMPOSE_BASE_URL"),
                validate_base_url: get("VALIDATE_BASE_URL"),
            },
            environment,
        };

        // Production refuses to start half-configured; development limps
        // along with auth bypassed and the in-memory store.
        if config.is_production() {
            if config.worker_shared_secret.is_none() {
                return Err(ConfigError::Missing("WORKER_SHARED_SECRET"));
            }
            if config.supabase_url.is_none() || config.supabase_service_role_key.is_none() {
                return Err(ConfigError::Missing("SUPABASE_URL / SUPABASE_SERVICE_ROLE_KEY"));
            }
        }
        if config.supabase_url.is_some() != config.supabase_service_role_key.is_some() {
            return Err(ConfigError::Invalid {
                name: "SUPABASE_URL",
                reason: "url and service role key must be set together".to_string(),
            });
        }

        Ok(config)
    }
}

fn parse_or<T: std::str::FromStr>(
    name: &'static str,
    get: &impl Fn(&str) -> Option<String>,
    default: T,
) -> Result<T, ConfigError> {
    match get(name) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|_| ConfigError::Invalid {
            name,
            reason: format!("could not parse {raw:?}"),
        }),
    }
}
