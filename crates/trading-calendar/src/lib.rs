//! Current JST instant and "latest trading day" resolution (§4.1).

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc, Weekday};
use chrono_tz::Asia::Tokyo;
use screener_core::{QuoteSource, ScreenerError};

const MAX_WALKBACK_ATTEMPTS: u32 = 10;
const FALLBACK_DAYS: i64 = 7;
const DATA_AVAILABLE_HOUR_JST: u32 = 16;

/// Current wall-clock time in Asia/Tokyo.
pub fn now_jst() -> DateTime<chrono_tz::Tz> {
    Utc::now().with_timezone(&Tokyo)
}

/// Resolves "the latest trading day" against a live calendar source.
///
/// Stateless: holds no data of its own, just the algorithm from §4.1.
pub struct Clock;

impl Clock {
    pub fn new() -> Self {
        Clock
    }

    /// `now` is an instant in any timezone; it is converted to JST before
    /// the 16:00 cutoff check. Walks backward at most
    /// [`MAX_WALKBACK_ATTEMPTS`] calendar days looking for a weekday that
    /// `source.is_trading_day` confirms; on exhaustion, falls back to
    /// `now - 7d` and logs an error (the cutoff is a contract, not a
    /// heuristic — a silent wrong answer here produces a zero-match run).
    pub async fn latest_trading_day(
        &self,
        source: &dyn QuoteSource,
        now: DateTime<Utc>,
    ) -> Result<NaiveDate, ScreenerError> {
        let now_jst = now.with_timezone(&Tokyo);
        let mut candidate = if now_jst.hour() < DATA_AVAILABLE_HOUR_JST {
            now_jst.date_naive() - Duration::days(1)
        } else {
            now_jst.date_naive()
        };

        let mut attempts = 0u32;
        while attempts < MAX_WALKBACK_ATTEMPTS {
            while is_weekend(candidate) {
                candidate -= Duration::days(1);
            }

            match source.is_trading_day(candidate).await {
                Ok(true) => {
                    tracing::info!(date = %candidate, "latest trading day resolved");
                    return Ok(candidate);
                }
                Ok(false) => {
                    tracing::debug!(date = %candidate, "not a trading day, walking back");
                }
                Err(err) => {
                    tracing::warn!(date = %candidate, error = %err, "is_trading_day check failed, walking back");
                }
            }

            candidate -= Duration::days(1);
            attempts += 1;
        }

        let fallback = now_jst.date_naive() - Duration::days(FALLBACK_DAYS);
        tracing::error!(
            attempts = MAX_WALKBACK_ATTEMPTS,
            fallback = %fallback,
            "exhausted trading-day walkback, falling back to now - 7d"
        );
        Ok(fallback)
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

fn is_weekend(date: NaiveDate) -> bool {
    matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone as _;
    use screener_core::{BarSeries, Symbol};
    use std::collections::HashSet;

    struct FixedCalendar {
        non_trading: HashSet<NaiveDate>,
    }

    #[async_trait]
    impl QuoteSource for FixedCalendar {
        async fn authenticate(&self) -> Result<(), ScreenerError> {
            Ok(())
        }

        async fn list_symbols(&self) -> Result<Vec<Symbol>, ScreenerError> {
            Ok(vec![])
        }

        async fn fetch_bars(
            &self,
            _symbol: &Symbol,
            _from: NaiveDate,
            _to: NaiveDate,
        ) -> Result<Option<BarSeries>, ScreenerError> {
            Ok(None)
        }

        async fn is_trading_day(&self, date: NaiveDate) -> Result<bool, ScreenerError> {
            Ok(!is_weekend(date) && !self.non_trading.contains(&date))
        }
    }

    fn jst_instant(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Tokyo.with_ymd_and_hms(y, m, d, h, min, 0).unwrap().with_timezone(&Utc)
    }

    #[tokio::test]
    async fn before_cutoff_rolls_back_a_day() {
        let source = FixedCalendar { non_trading: HashSet::new() };
        let clock = Clock::new();
        // Monday 2024-06-03 15:59 JST -> latest trading day is Friday 2024-05-31.
        let now = jst_instant(2024, 6, 3, 15, 59);
        let day = clock.latest_trading_day(&source, now).await.unwrap();
        assert_eq!(day, NaiveDate::from_ymd_opt(2024, 5, 31).unwrap());
    }

    #[tokio::test]
    async fn at_cutoff_uses_same_day() {
        let source = FixedCalendar { non_trading: HashSet::new() };
        let clock = Clock::new();
        let now = jst_instant(2024, 6, 3, 16, 0);
        let day = clock.latest_trading_day(&source, now).await.unwrap();
        assert_eq!(day, NaiveDate::from_ymd_opt(2024, 6, 3).unwrap());
    }

    #[tokio::test]
    async fn skips_weekend_and_holiday() {
        let holiday = NaiveDate::from_ymd_opt(2024, 6, 3).unwrap();
        let mut non_trading = HashSet::new();
        non_trading.insert(holiday);
        let source = FixedCalendar { non_trading };
        let clock = Clock::new();
        // Tuesday 2024-06-04 at 20:00 JST; Monday 06-03 is a declared holiday.
        let now = jst_instant(2024, 6, 4, 20, 0);
        let day = clock.latest_trading_day(&source, now).await.unwrap();
        assert_eq!(day, NaiveDate::from_ymd_opt(2024, 6, 4).unwrap());
    }

    #[tokio::test]
    async fn falls_back_after_exhausting_attempts() {
        struct NeverTrading;
        #[async_trait]
        impl QuoteSource for NeverTrading {
            async fn authenticate(&self) -> Result<(), ScreenerError> {
                Ok(())
            }
            async fn list_symbols(&self) -> Result<Vec<Symbol>, ScreenerError> {
                Ok(vec![])
            }
            async fn fetch_bars(
                &self,
                _symbol: &Symbol,
                _from: NaiveDate,
                _to: NaiveDate,
            ) -> Result<Option<BarSeries>, ScreenerError> {
                Ok(None)
            }
            async fn is_trading_day(&self, _date: NaiveDate) -> Result<bool, ScreenerError> {
                Ok(false)
            }
        }

        let clock = Clock::new();
        let now = jst_instant(2024, 6, 3, 20, 0);
        let day = clock.latest_trading_day(&NeverTrading, now).await.unwrap();
        assert_eq!(day, now.with_timezone(&Tokyo).date_naive() - Duration::days(FALLBACK_DAYS));
    }
}
