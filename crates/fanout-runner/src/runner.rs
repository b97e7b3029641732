//! Bounded-concurrency scheduler driving `evalFn x Symbol` (§4.6).
//!
//! Parallel workers on a shared task pool, capped by a counting semaphore
//! at a hard in-flight ceiling `C`. Per-symbol failures — fetch errors
//! after retries, decode errors, anything `eval` itself can't handle —
//! are logged at debug and counted as a non-match; they never abort the
//! run. Progress (`processed`, `detected`) is logged every 100 completions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use screener_core::{BarSeries, Detection, QuoteSource, ScreenerError, Symbol};
use tokio::sync::Semaphore;

use crate::memo::FetchMemo;

const PROGRESS_INTERVAL: u64 = 100;

/// Single-producer-many-writers counters (§5): increments are atomic, the
/// periodic log read is approximate by design.
#[derive(Debug, Default)]
pub struct RunProgress {
    pub processed: AtomicU64,
    pub detected: AtomicU64,
}

pub struct FanOutRunner {
    concurrency: usize,
    retry_count: u32,
    retry_delay: Duration,
}

impl FanOutRunner {
    pub fn new(concurrency: usize, retry_count: u32, retry_delay: Duration) -> Self {
        Self {
            concurrency,
            retry_count,
            retry_delay,
        }
    }

    /// Runs `eval` over `symbols`: acquire a permit, resolve bars through
    /// `memo` (fetching/caching on miss, retrying transient failures),
    /// apply `eval`, release. Result order is unspecified (§4.6) —
    /// callers must treat the returned `Vec` as an unordered set.
    pub async fn run<F>(
        &self,
        source: Arc<dyn QuoteSource>,
        memo: Arc<FetchMemo>,
        symbols: Vec<Symbol>,
        from: NaiveDate,
        to: NaiveDate,
        eval: F,
    ) -> Vec<Detection>
    where
        F: Fn(&BarSeries, &Symbol) -> Option<Detection> + Send + Sync + 'static,
    {
        let total = symbols.len() as u64;
        let semaphore = Arc::new(Semaphore::new(self.concurrency.max(1)));
        let progress = Arc::new(RunProgress::default());
        let eval = Arc::new(eval);

        let mut handles = Vec::with_capacity(symbols.len());
        for symbol in symbols {
            let semaphore = Arc::clone(&semaphore);
            let source = Arc::clone(&source);
            let memo = Arc::clone(&memo);
            let progress = Arc::clone(&progress);
            let eval = Arc::clone(&eval);
            let retry_count = self.retry_count;
            let retry_delay = self.retry_delay;

            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore is never closed");
                let result = Self::evaluate_one(source.as_ref(), memo.as_ref(), &symbol, from, to, retry_count, retry_delay, eval.as_ref()).await;

                let processed = progress.processed.fetch_add(1, Ordering::Relaxed) + 1;
                if result.is_some() {
                    progress.detected.fetch_add(1, Ordering::Relaxed);
                }
                if processed % PROGRESS_INTERVAL == 0 || processed == total {
                    tracing::info!(
                        processed,
                        total,
                        detected = progress.detected.load(Ordering::Relaxed),
                        "fan-out progress"
                    );
                }

                result
            }));
        }

        let mut detections = Vec::new();
        for handle in handles {
            match handle.await {
                Ok(Some(detection)) => detections.push(detection),
                Ok(None) => {}
                Err(join_err) => {
                    tracing::debug!(error = %join_err, "worker task failed, counted as non-match");
                }
            }
        }
        detections
    }

    async fn evaluate_one<F>(
        source: &dyn QuoteSource,
        memo: &FetchMemo,
        symbol: &Symbol,
        from: NaiveDate,
        to: NaiveDate,
        retry_count: u32,
        retry_delay: Duration,
        eval: &F,
    ) -> Option<Detection>
    where
        F: Fn(&BarSeries, &Symbol) -> Option<Detection> + Send + Sync,
    {
        let series = match Self::fetch_with_retry(source, memo, symbol, from, to, retry_count, retry_delay).await {
            Ok(Some(series)) => series,
            Ok(None) => return None,
            Err(err) => {
                tracing::debug!(code = %symbol.code, error = %err, "symbol fetch failed, counted as non-match");
                return None;
            }
        };

        eval(&series, symbol)
    }

    /// Retries `NetworkTransient`/`RateLimited` up to `retry_count` times
    /// with a fixed `retry_delay` between attempts (§4.2, §7). Any other
    /// error, or exhaustion, propagates for the caller to count as a
    /// non-match.
    async fn fetch_with_retry(
        source: &dyn QuoteSource,
        memo: &FetchMemo,
        symbol: &Symbol,
        from: NaiveDate,
        to: NaiveDate,
        retry_count: u32,
        retry_delay: Duration,
    ) -> Result<Option<BarSeries>, ScreenerError> {
        let mut attempt = 0u32;
        loop {
            match memo.get_or_fetch(source, symbol, from, to).await {
                Ok(series) => return Ok(series),
                Err(ScreenerError::Fetch(fetch_err)) if fetch_err.is_retryable() && attempt < retry_count => {
                    attempt += 1;
                    tracing::debug!(code = %symbol.code, attempt, error = %fetch_err, "retrying fetch");
                    tokio::time::sleep(retry_delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
