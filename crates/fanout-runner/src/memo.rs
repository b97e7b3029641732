//! Per-run, in-memory memoization in front of the on-disk `PersistentCache`.
//!
//! Grounded in the Python original's `price_cache.py`: within one pipeline
//! run, each of the five screening rules re-requests the same symbol's
//! bars, so the first rule to touch a symbol populates this map and the
//! rest hit it without a second disk read. Distinct from `PersistentCache`,
//! which is long-lived across runs; this memo is dropped at the end of
//! `Pipeline::run`. Keyed by `(code, from, to)`, matching
//! `price_cache.py`'s `_generate_key(code, start_date, end_date)` — a
//! memo entry for one date range must never be handed back for another.

use std::sync::Arc;

use chrono::NaiveDate;
use dashmap::DashMap;
use price_cache::PersistentCache;
use screener_core::{BarSeries, QuoteSource, ScreenerError, Symbol};

type MemoKey = (String, NaiveDate, NaiveDate);

pub struct FetchMemo {
    cache: Arc<PersistentCache>,
    memo: DashMap<MemoKey, BarSeries>,
    max_age_days: i64,
}

impl FetchMemo {
    pub fn new(cache: Arc<PersistentCache>, max_age_days: i64) -> Self {
        Self {
            cache,
            memo: DashMap::new(),
            max_age_days,
        }
    }

    /// Bars for `symbol` in `[from, to]`: this run's memo, then the
    /// persistent cache, then `source` on a miss. A fetch that reaches
    /// upstream is written back to both the cache (§4.3's differential
    /// `Put`) and the memo.
    pub async fn get_or_fetch(
        &self,
        source: &dyn QuoteSource,
        symbol: &Symbol,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Option<BarSeries>, ScreenerError> {
        let key = (symbol.code.clone(), from, to);

        if let Some(series) = self.memo.get(&key) {
            return Ok(Some(series.clone()));
        }

        if let Some(series) = self.cache.get(&symbol.code, from, to, self.max_age_days).await {
            self.memo.insert(key, series.clone());
            return Ok(Some(series));
        }

        match source.fetch_bars(symbol, from, to).await? {
            Some(series) => {
                self.cache.put(&symbol.code, series.clone()).await?;
                self.memo.insert(key, series.clone());
                Ok(Some(series))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use screener_core::{Bar, MarketSegment};
    use std::sync::atomic::{AtomicU64, Ordering};
    use tempfile::tempdir;

    struct CountingSource {
        calls: AtomicU64,
    }

    #[async_trait]
    impl QuoteSource for CountingSource {
        async fn authenticate(&self) -> Result<(), ScreenerError> {
            Ok(())
        }
        async fn list_symbols(&self) -> Result<Vec<Symbol>, ScreenerError> {
            Ok(vec![])
        }
        async fn fetch_bars(&self, _symbol: &Symbol, _from: NaiveDate, _to: NaiveDate) -> Result<Option<BarSeries>, ScreenerError> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            Ok(Some(BarSeries::new(vec![Bar {
                date: NaiveDate::from_ymd_opt(2024, 1, 5).unwrap(),
                open: 100.0,
                high: 101.0,
                low: 99.0,
                close: 100.5,
                volume: 1000,
            }])))
        }
        async fn is_trading_day(&self, _date: NaiveDate) -> Result<bool, ScreenerError> {
            Ok(true)
        }
    }

    fn symbol() -> Symbol {
        Symbol {
            code: "7203".to_string(),
            display_name: "Toyota".to_string(),
            market_segment: MarketSegment::Prime,
        }
    }

    #[tokio::test]
    async fn second_request_is_served_from_memo_not_upstream() {
        let dir = tempdir().unwrap();
        let cache = Arc::new(PersistentCache::new(dir.path()).unwrap());
        let memo = FetchMemo::new(cache, 30);
        let source = CountingSource { calls: AtomicU64::new(0) };

        let from = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let to = NaiveDate::from_ymd_opt(2024, 1, 10).unwrap();

        memo.get_or_fetch(&source, &symbol(), from, to).await.unwrap();
        memo.get_or_fetch(&source, &symbol(), from, to).await.unwrap();

        assert_eq!(source.calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn distinct_ranges_for_the_same_symbol_are_not_conflated() {
        let dir = tempdir().unwrap();
        let cache = Arc::new(PersistentCache::new(dir.path()).unwrap());
        let memo = FetchMemo::new(cache, 30);
        let source = CountingSource { calls: AtomicU64::new(0) };

        // Two disjoint ranges for the same symbol: the second range does
        // not cover the bar returned for the first, so neither the memo
        // nor the persistent cache may serve it from the first fetch.
        let from1 = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let to1 = NaiveDate::from_ymd_opt(2024, 1, 10).unwrap();
        let from2 = NaiveDate::from_ymd_opt(2024, 2, 1).unwrap();
        let to2 = NaiveDate::from_ymd_opt(2024, 2, 10).unwrap();

        memo.get_or_fetch(&source, &symbol(), from1, to1).await.unwrap();
        memo.get_or_fetch(&source, &symbol(), from2, to2).await.unwrap();

        assert_eq!(source.calls.load(Ordering::Relaxed), 2);
    }
}
