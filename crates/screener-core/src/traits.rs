use async_trait::async_trait;
use chrono::NaiveDate;

use crate::{BarSeries, Detection, RunId, RunSummary, ScreenerError, Symbol};

/// Upstream quotation API contract (§4.2). Transport, auth refresh and
/// retry policy are implementation details; this crate only depends on
/// the shape.
#[async_trait]
pub trait QuoteSource: Send + Sync {
    /// Authenticate and cache a token. Implementations are expected to
    /// coalesce concurrent refreshes behind a single in-flight request.
    async fn authenticate(&self) -> Result<(), ScreenerError>;

    /// All symbols on the three target market segments.
    async fn list_symbols(&self) -> Result<Vec<Symbol>, ScreenerError>;

    /// Daily bars for `symbol` in `[from, to]`. `Ok(None)` on an empty
    /// upstream response (not an error).
    async fn fetch_bars(
        &self,
        symbol: &Symbol,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Option<BarSeries>, ScreenerError>;

    /// Whether `date` is a trading day on the upstream calendar.
    async fn is_trading_day(&self, date: NaiveDate) -> Result<bool, ScreenerError>;
}

/// External relational store contract (§4.9).
#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Persist a run's summary row; returns a new run id.
    async fn save_run(&self, summary: &RunSummary) -> Result<RunId, ScreenerError>;

    /// Persist the (already sampled) detections for a run. Partial
    /// success is not exposed: failures are logged by the caller and the
    /// pipeline proceeds to the next rule.
    async fn save_detections(&self, run_id: RunId, detections: &[Detection]) -> Result<(), ScreenerError>;
}
