//! Composes Clock/TradingDay, QuoteSource, PersistentCache, the
//! per-rule screeners, FanOutRunner, Sampler and ResultSink into the
//! full daily run (§4.8).

use std::sync::Arc;
use std::time::Instant;

use chrono::{NaiveDate, Utc};
use fanout_runner::{FanOutRunner, FetchMemo};
use price_cache::PersistentCache;
use screener_core::{Detection, QuoteSource, ResultSink, RuleName, RunSummary, Symbol};
use technical_analysis::PullbackGateCounters;
use trading_calendar::Clock;

use crate::config::PipelineConfig;

/// Trailing window handed to every rule: Pullback's 52-week lookback
/// needs 260 trading days of history; 420 calendar days comfortably
/// covers that plus weekends/holidays.
const HISTORY_DAYS: i64 = 420;

pub struct Pipeline {
    config: PipelineConfig,
    source: Arc<dyn QuoteSource>,
    cache: Arc<PersistentCache>,
    sink: Arc<dyn ResultSink>,
    runner: FanOutRunner,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, source: Arc<dyn QuoteSource>, cache: Arc<PersistentCache>, sink: Arc<dyn ResultSink>) -> Self {
        let runner = FanOutRunner::new(config.concurrency, config.retry_count, config.retry_delay);
        Self { config, source, cache, sink, runner }
    }

    /// Runs the full pipeline. Propagates an error (and thus a non-zero
    /// exit code, §6) only for authentication failure and for a
    /// `SaveRun` (sink summary) failure — the latter still lets the
    /// remaining rules in the fixed order run to completion; only the
    /// failed rule's own detections are dropped (§4.9, §7). This is the
    /// resolution of the apparent §4.6/§4.9 tension recorded in
    /// `DESIGN.md`.
    pub async fn run(&self) -> anyhow::Result<()> {
        self.source
            .authenticate()
            .await
            .map_err(|e| anyhow::anyhow!("authentication failed: {e}"))?;

        let trading_date = self.latest_trading_day().await?;
        let symbols = self
            .source
            .list_symbols()
            .await
            .map_err(|e| anyhow::anyhow!("list_symbols failed: {e}"))?;
        tracing::info!(trading_date = %trading_date, symbols = symbols.len(), "pipeline starting");

        let from = trading_date - chrono::Duration::days(HISTORY_DAYS);
        let memo = Arc::new(FetchMemo::new(Arc::clone(&self.cache), self.config.cache_max_age_days));

        let mut any_sink_summary_failure = false;

        for rule in rule_order() {
            let start = Instant::now();
            let gates = Arc::new(PullbackGateCounters::new());
            let matched = self
                .evaluate_rule(rule, &symbols, from, trading_date, Arc::clone(&memo), Arc::clone(&gates))
                .await;
            let exec_millis = start.elapsed().as_millis() as u64;

            if rule == RuleName::Pullback {
                log_pullback_gates(&gates);
            }

            let total_matched = matched.len() as u64;
            let sampled = sampler::sample(matched, self.config.sampler_max_per_range, self.config.sampler_seed);

            let summary = RunSummary {
                rule,
                trading_date,
                market_filter: "all".to_string(),
                total_matched,
                exec_millis,
            };

            match self.sink.save_run(&summary).await {
                Ok(run_id) => {
                    tracing::info!(rule = %rule, total_matched, sampled = sampled.len(), exec_millis, "rule complete");
                    if let Err(e) = self.sink.save_detections(run_id, &sampled).await {
                        tracing::error!(rule = %rule, error = %e, "failed to persist detections, continuing");
                    }
                }
                Err(e) => {
                    any_sink_summary_failure = true;
                    tracing::error!(rule = %rule, error = %e, "failed to persist run summary, dropping this rule's detections");
                }
            }
        }

        let stats = self.cache.stats();
        tracing::info!(
            files = stats.files,
            bytes = stats.bytes,
            hits = stats.hits,
            misses = stats.misses,
            hit_rate = stats.hit_rate,
            "cache stats"
        );

        if any_sink_summary_failure {
            anyhow::bail!("one or more rules failed to persist their run summary");
        }
        Ok(())
    }

    async fn latest_trading_day(&self) -> anyhow::Result<NaiveDate> {
        Clock::new()
            .latest_trading_day(self.source.as_ref(), Utc::now())
            .await
            .map_err(|e| anyhow::anyhow!("failed to resolve latest trading day: {e}"))
    }

    async fn evaluate_rule(
        &self,
        rule: RuleName,
        symbols: &[Symbol],
        from: NaiveDate,
        to: NaiveDate,
        memo: Arc<FetchMemo>,
        gates: Arc<PullbackGateCounters>,
    ) -> Vec<Detection> {
        let source = Arc::clone(&self.source);
        let symbols = symbols.to_vec();
        let sma200_filter = self.config.perfect_order_sma200_filter;
        let ema_filter = self.config.pullback_ema_filter;
        let stochastic_oversold = self.config.pullback_stochastic;
        let debug_symbol = self.config.debug_symbol.clone();

        match rule {
            RuleName::PerfectOrder => {
                self.runner
                    .run(source, memo, symbols, from, to, move |series, symbol| {
                        technical_analysis::perfect_order(series, symbol, sma200_filter)
                    })
                    .await
            }
            RuleName::BollingerTouch => {
                self.runner
                    .run(source, memo, symbols, from, to, move |series, symbol| {
                        technical_analysis::bollinger_touch(series, symbol)
                    })
                    .await
            }
            RuleName::Pullback => {
                self.runner
                    .run(source, memo, symbols, from, to, move |series, symbol| {
                        technical_analysis::pullback(series, symbol, ema_filter, stochastic_oversold, &gates, debug_symbol.as_deref())
                    })
                    .await
            }
            RuleName::Squeeze => {
                let multiplier = self.config.squeeze_relaxed_deviation_multiplier;
                self.runner
                    .run(source, memo, symbols, from, to, move |series, symbol| {
                        technical_analysis::squeeze(series, symbol, multiplier)
                    })
                    .await
            }
            // No default BreakoutRule ships (§4.5.5, §9): the dispatch
            // table's Breakout slot is absent unless a caller supplies
            // one, so this arm is unreachable from `rule_order`.
            RuleName::Breakout => Vec::new(),
        }
    }
}

/// The fixed evaluation order (§4.8). Breakout is omitted: no default
/// `BreakoutRule` implementation ships (§4.5.5, §9's open question).
fn rule_order() -> Vec<RuleName> {
    vec![RuleName::PerfectOrder, RuleName::BollingerTouch, RuleName::Pullback, RuleName::Squeeze]
}

fn log_pullback_gates(gates: &PullbackGateCounters) {
    use std::sync::atomic::Ordering;
    tracing::info!(
        total = gates.total.load(Ordering::Relaxed),
        with_data = gates.with_data.load(Ordering::Relaxed),
        recent_high = gates.recent_high.load(Ordering::Relaxed),
        within_30pct = gates.within_30pct.load(Ordering::Relaxed),
        touch_ema10 = gates.touch_ema10.load(Ordering::Relaxed),
        touch_ema20 = gates.touch_ema20.load(Ordering::Relaxed),
        touch_ema50 = gates.touch_ema50.load(Ordering::Relaxed),
        any_touch = gates.any_touch.load(Ordering::Relaxed),
        passed_all = gates.passed_all.load(Ordering::Relaxed),
        "pullback gate counts"
    );
}
