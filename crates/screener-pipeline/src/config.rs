//! Typed configuration assembled from environment variables (§6), in the
//! teacher's own env-var-driven style (`POLYGON_API_KEY`,
//! `POLYGON_RATE_LIMIT`, ...) rather than a config-file format.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use technical_analysis::{EmaFilter, Sma200Filter};

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(v) => v.parse::<T>().map_err(|e| anyhow!("invalid {key}: {e}")),
        Err(_) => Ok(default),
    }
}

fn parse_sma200_filter(raw: &str) -> Result<Sma200Filter> {
    match raw {
        "above" => Ok(Sma200Filter::Above),
        "below" => Ok(Sma200Filter::Below),
        "all" => Ok(Sma200Filter::All),
        other => Err(anyhow!("invalid perfectOrderSMA200Filter: {other}")),
    }
}

fn parse_ema_filter(raw: &str) -> Result<EmaFilter> {
    match raw {
        "10ema" => Ok(EmaFilter::Ema10),
        "20ema" => Ok(EmaFilter::Ema20),
        "50ema" => Ok(EmaFilter::Ema50),
        "all" => Ok(EmaFilter::All),
        other => Err(anyhow!("invalid pullbackEMAFilter: {other}")),
    }
}

/// Every knob from §6, plus the ambient ones SPEC_FULL adds (sampler seed,
/// result-sink identity). `RUST_LOG` governs the log filter directly;
/// there is no separate logging config here.
pub struct PipelineConfig {
    pub concurrency: usize,
    pub perfect_order_sma200_filter: Sma200Filter,
    pub pullback_ema_filter: EmaFilter,
    pub pullback_stochastic: bool,
    pub sampler_max_per_range: usize,
    pub sampler_seed: u64,
    pub squeeze_relaxed_deviation_multiplier: f64,
    pub cache_dir: PathBuf,
    pub cache_max_age_days: i64,
    pub request_timeout: Duration,
    pub retry_count: u32,
    pub retry_delay: Duration,

    pub jquants_base_url: String,
    pub jquants_refresh_token: String,
    pub jquants_credential_issued_at: DateTime<Utc>,

    pub result_sink_database_url: String,
    pub result_sink_user_id: String,

    pub debug_symbol: Option<String>,
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self> {
        let concurrency = env_parse("SCREENER_CONCURRENCY", 20usize)?;
        let perfect_order_sma200_filter = parse_sma200_filter(&env_or("SCREENER_PERFECT_ORDER_SMA200_FILTER", "all"))?;
        let pullback_ema_filter = parse_ema_filter(&env_or("SCREENER_PULLBACK_EMA_FILTER", "all"))?;
        let pullback_stochastic = env_parse("SCREENER_PULLBACK_STOCHASTIC", false)?;
        let sampler_max_per_range = env_parse("SCREENER_SAMPLER_MAX_PER_RANGE", 10usize)?;
        let sampler_seed = env_parse("SCREENER_SAMPLER_SEED", 0u64)?;
        let squeeze_relaxed_deviation_multiplier = env_parse("SCREENER_SQUEEZE_RELAXED_DEVIATION_MULTIPLIER", 1.4f64)?;
        let cache_dir = PathBuf::from(env_or("SCREENER_CACHE_DIR", "./price-cache-data"));
        let cache_max_age_days = env_parse("SCREENER_CACHE_MAX_AGE_DAYS", 30i64)?;
        let request_timeout_sec = env_parse("SCREENER_REQUEST_TIMEOUT_SEC", 30u64)?;
        let retry_count = env_parse("SCREENER_RETRY_COUNT", 3u32)?;
        let retry_delay_sec = env_parse("SCREENER_RETRY_DELAY_SEC", 1u64)?;

        let jquants_base_url = env_or("JQUANTS_BASE_URL", "https://api.jquants.com");
        let jquants_refresh_token = std::env::var("JQUANTS_REFRESH_TOKEN")
            .context("JQUANTS_REFRESH_TOKEN must be set (quoteSourceCredential)")?;
        let jquants_credential_issued_at = match std::env::var("JQUANTS_CREDENTIAL_ISSUED_AT") {
            Ok(raw) => DateTime::parse_from_rfc3339(&raw)
                .map(|dt| dt.with_timezone(&Utc))
                .with_context(|| format!("invalid JQUANTS_CREDENTIAL_ISSUED_AT: {raw}"))?,
            Err(_) => Utc::now(),
        };

        let result_sink_database_url = env_or("RESULT_SINK_DATABASE_URL", "sqlite:screener_results.db?mode=rwc");
        let result_sink_user_id = env_or("RESULT_SINK_USER_ID", "screener-pipeline");

        let debug_symbol = std::env::var("SCREENER_DEBUG_SYMBOL").ok();

        Ok(Self {
            concurrency,
            perfect_order_sma200_filter,
            pullback_ema_filter,
            pullback_stochastic,
            sampler_max_per_range,
            sampler_seed,
            squeeze_relaxed_deviation_multiplier,
            cache_dir,
            cache_max_age_days,
            request_timeout: Duration::from_secs(request_timeout_sec),
            retry_count,
            retry_delay: Duration::from_secs(retry_delay_sec),
            jquants_base_url,
            jquants_refresh_token,
            jquants_credential_issued_at,
            result_sink_database_url,
            result_sink_user_id,
            debug_symbol,
        })
    }
}
