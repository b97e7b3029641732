//! screener-pipeline: daily batch entry point (§4.8, §6).
//!
//! Usage:
//!   cargo run -p screener-pipeline
//!
//! Configuration is entirely environment-driven (§6); see `config.rs` for
//! the full list of knobs. A `.env` file in the working directory is
//! loaded if present.

mod config;
mod pipeline;

use std::process::ExitCode;
use std::sync::Arc;

use config::PipelineConfig;
use pipeline::Pipeline;
use price_cache::PersistentCache;
use quote_source::{Credential, JQuantsSource};
use result_sink::SqlResultSink;
use screener_core::{QuoteSource, ResultSink};

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "screener_pipeline=info,quote_source=warn".into()),
        )
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "pipeline run failed");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> anyhow::Result<()> {
    let config = PipelineConfig::from_env()?;

    let credential = Credential {
        refresh_token: config.jquants_refresh_token.clone(),
        issued_at: config.jquants_credential_issued_at,
    };
    let source: Arc<dyn QuoteSource> = Arc::new(JQuantsSource::new(
        config.jquants_base_url.clone(),
        credential,
        config.request_timeout,
    ));

    let cache = Arc::new(PersistentCache::new(config.cache_dir.clone())?);

    let sink: Arc<dyn ResultSink> = Arc::new(
        SqlResultSink::new(&config.result_sink_database_url, config.result_sink_user_id.clone()).await?,
    );

    let pipeline = Pipeline::new(config, source, cache, sink);
    pipeline.run().await
}
