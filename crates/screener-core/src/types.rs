use std::collections::HashMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// The exchange tier a symbol belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MarketSegment {
    Prime,
    Standard,
    Growth,
}

impl MarketSegment {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketSegment::Prime => "prime",
            MarketSegment::Standard => "standard",
            MarketSegment::Growth => "growth",
        }
    }
}

impl std::fmt::Display for MarketSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An opaque listed symbol, immutable within a run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Symbol {
    pub code: String,
    pub display_name: String,
    pub market_segment: MarketSegment,
}

/// A single daily OHLCV bar.
///
/// Invariant: `low <= min(open, close) <= max(open, close) <= high`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
}

impl Bar {
    pub fn is_valid(&self) -> bool {
        let body_lo = self.open.min(self.close);
        let body_hi = self.open.max(self.close);
        self.low <= body_lo && body_hi <= self.high && self.low > 0.0
    }
}

/// An ordered sequence of bars for a single symbol: strictly increasing by
/// date, deduplicated (last write wins), gaps in the trading calendar
/// permitted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BarSeries {
    bars: Vec<Bar>,
}

impl BarSeries {
    /// Build a series from raw bars: dedups by date (keeping the later
    /// occurrence in `raw`) and sorts ascending by date.
    pub fn new(raw: Vec<Bar>) -> Self {
        let mut by_date: HashMap<NaiveDate, Bar> = HashMap::with_capacity(raw.len());
        for bar in raw {
            by_date.insert(bar.date, bar);
        }
        let mut bars: Vec<Bar> = by_date.into_values().collect();
        bars.sort_by_key(|b| b.date);
        Self { bars }
    }

    pub fn bars(&self) -> &[Bar] {
        &self.bars
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn last_date(&self) -> Option<NaiveDate> {
        self.bars.last().map(|b| b.date)
    }

    pub fn closes(&self) -> Vec<f64> {
        self.bars.iter().map(|b| b.close).collect()
    }

    /// Merge `other` into `self`: concatenate, dedup on date keeping the
    /// bar from `other` on ties (same-day corrections overwrite), sort
    /// ascending. This is the differential-merge semantics the on-disk
    /// cache relies on.
    pub fn merge(self, other: BarSeries) -> BarSeries {
        let mut all = self.bars;
        all.extend(other.bars);
        BarSeries::new(all)
    }

    /// Bars with `from <= date <= to`.
    pub fn range(&self, from: NaiveDate, to: NaiveDate) -> BarSeries {
        BarSeries {
            bars: self
                .bars
                .iter()
                .copied()
                .filter(|b| b.date >= from && b.date <= to)
                .collect(),
        }
    }

    /// Bars with `date >= from`.
    pub fn from(&self, from: NaiveDate) -> BarSeries {
        BarSeries {
            bars: self.bars.iter().copied().filter(|b| b.date >= from).collect(),
        }
    }
}

/// A rule-specific value carried in a [`Detection`]'s `attrs` bag.
///
/// The source data mixes numbers (moving averages, percentages) and
/// strings (touch direction, comma-joined EMA lists); rather than a
/// loosely-typed JSON blob, `attrs` is a small tagged union so sink
/// implementations can render either branch without re-parsing strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttrValue {
    Number(f64),
    Text(String),
}

impl From<f64> for AttrValue {
    fn from(v: f64) -> Self {
        AttrValue::Number(v)
    }
}

impl From<&str> for AttrValue {
    fn from(v: &str) -> Self {
        AttrValue::Text(v.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(v: String) -> Self {
        AttrValue::Text(v)
    }
}

/// The five screening rules, in the fixed evaluation order the pipeline
/// uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuleName {
    PerfectOrder,
    BollingerTouch,
    Pullback,
    Squeeze,
    Breakout,
}

impl RuleName {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleName::PerfectOrder => "perfect_order",
            RuleName::BollingerTouch => "bollinger_touch",
            RuleName::Pullback => "pullback_200day_high",
            RuleName::Squeeze => "squeeze",
            RuleName::Breakout => "breakout",
        }
    }
}

impl std::fmt::Display for RuleName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single screener match, produced per run and handed to a `ResultSink`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detection {
    pub symbol: Symbol,
    pub rule: RuleName,
    pub bar_date: NaiveDate,
    pub price: f64,
    pub volume: u64,
    pub attrs: HashMap<String, AttrValue>,
}

/// Opaque id assigned by a `ResultSink` to a saved run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunId(pub i64);

/// One row per (rule, run). `total_matched` is the pre-sampling population
/// size; the sampled subset is what ends up in the sink's detections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub rule: RuleName,
    pub trading_date: NaiveDate,
    pub market_filter: String,
    pub total_matched: u64,
    pub exec_millis: u64,
}

/// Differential on-disk cache artifact for a single symbol.
///
/// Invariant: `last_date == series.last_date()` whenever `series` is
/// non-empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub series: BarSeries,
    pub last_date: NaiveDate,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(date: &str, close: f64) -> Bar {
        let date = NaiveDate::parse_from_str(date, "%Y-%m-%d").unwrap();
        Bar {
            date,
            open: close,
            high: close,
            low: close,
            close,
            volume: 100,
        }
    }

    #[test]
    fn bar_series_dedups_keeping_last_write() {
        let series = BarSeries::new(vec![bar("2024-01-08", 100.0), bar("2024-01-08", 105.0)]);
        assert_eq!(series.len(), 1);
        assert_eq!(series.bars()[0].close, 105.0);
    }

    #[test]
    fn bar_series_merge_is_differential_and_sorted() {
        let s1 = BarSeries::new(vec![bar("2024-01-01", 1.0), bar("2024-01-02", 2.0)]);
        let s2 = BarSeries::new(vec![bar("2024-01-02", 20.0), bar("2024-01-03", 3.0)]);
        let merged = s1.merge(s2);
        assert_eq!(merged.len(), 3);
        let closes: Vec<f64> = merged.bars().iter().map(|b| b.close).collect();
        assert_eq!(closes, vec![1.0, 20.0, 3.0]);
    }

    #[test]
    fn bar_validity_invariant() {
        let good = bar("2024-01-01", 10.0);
        assert!(good.is_valid());

        let bad = Bar {
            date: good.date,
            open: 10.0,
            high: 9.0,
            low: 11.0,
            close: 10.0,
            volume: 1,
        };
        assert!(!bad.is_valid());
    }
}
