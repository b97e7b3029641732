//! The five screening rules (§4.5). Each takes a `BarSeries` plus per-rule
//! config and returns `Option<Detection>`; the last bar is always "today".

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use screener_core::{AttrValue, BarSeries, Detection, RuleName, Symbol};

use crate::indicators::{atr, bbw, bollinger_bands, ema, sma, stochastic};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sma200Filter {
    Above,
    Below,
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmaFilter {
    Ema10,
    Ema20,
    Ema50,
    All,
}

fn detection(symbol: &Symbol, rule: RuleName, series: &BarSeries, attrs: HashMap<String, AttrValue>) -> Detection {
    let today = series.bars().last().expect("caller checked history length");
    Detection {
        symbol: symbol.clone(),
        rule,
        bar_date: today.date,
        price: today.close,
        volume: today.volume,
        attrs,
    }
}

/// §4.5.1. Requires ≥200 bars.
pub fn perfect_order(series: &BarSeries, symbol: &Symbol, sma200_filter: Sma200Filter) -> Option<Detection> {
    if series.len() < 200 {
        return None;
    }
    let closes = series.closes();
    let i = closes.len() - 1;
    let close = closes[i];

    let ema10 = ema(&closes, 10)[i];
    let ema20 = ema(&closes, 20)[i];
    let ema50 = ema(&closes, 50)[i];
    let sma200 = sma(&closes, 200)[i];

    if sma200.is_nan() {
        return None;
    }
    if !(close >= ema10 && ema10 >= ema20 && ema20 >= ema50) {
        return None;
    }

    let divergence = (close - ema50) / close * 100.0;
    if divergence > 20.0 {
        return None;
    }

    let sma200_position = if close >= sma200 { "above" } else { "below" };
    match sma200_filter {
        Sma200Filter::Above if sma200_position != "above" => return None,
        Sma200Filter::Below if sma200_position != "below" => return None,
        _ => {}
    }

    let mut attrs = HashMap::new();
    attrs.insert("ema10".to_string(), AttrValue::from(ema10));
    attrs.insert("ema20".to_string(), AttrValue::from(ema20));
    attrs.insert("ema50".to_string(), AttrValue::from(ema50));
    attrs.insert("sma200".to_string(), AttrValue::from(sma200));
    attrs.insert("sma200Position".to_string(), AttrValue::from(sma200_position));

    Some(detection(symbol, RuleName::PerfectOrder, series, attrs))
}

/// §4.5.2. Requires ≥20 bars.
pub fn bollinger_touch(series: &BarSeries, symbol: &Symbol) -> Option<Detection> {
    if series.len() < 20 {
        return None;
    }
    let closes = series.closes();
    let i = closes.len() - 1;
    let bands = bollinger_bands(&closes, 20, 3.0);
    let (upper, mid, lower) = (bands.upper[i], bands.mid[i], bands.lower[i]);
    if upper.is_nan() || lower.is_nan() {
        return None;
    }

    let close = closes[i];
    let direction = if close >= upper {
        "upper"
    } else if close <= lower {
        "lower"
    } else {
        return None;
    };

    let mut attrs = HashMap::new();
    attrs.insert("bbMid".to_string(), AttrValue::from(mid));
    attrs.insert("bbUpper".to_string(), AttrValue::from(upper));
    attrs.insert("bbLower".to_string(), AttrValue::from(lower));
    attrs.insert("touchDirection".to_string(), AttrValue::from(direction));

    Some(detection(symbol, RuleName::BollingerTouch, series, attrs))
}

/// Per-gate observability counters for the Pullback rule (§4.5.3). Shared
/// across a run's worker pool; increments only, read non-atomically by the
/// periodic progress log (approximate is fine, per §5).
#[derive(Debug, Default)]
pub struct PullbackGateCounters {
    pub total: AtomicU64,
    pub with_data: AtomicU64,
    pub recent_high: AtomicU64,
    pub within_30pct: AtomicU64,
    pub touch_ema10: AtomicU64,
    pub touch_ema20: AtomicU64,
    pub touch_ema50: AtomicU64,
    pub any_touch: AtomicU64,
    pub passed_all: AtomicU64,
}

impl PullbackGateCounters {
    pub fn new() -> Self {
        Self::default()
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// §4.5.3. Requires ≥200 bars. `debug_symbol`, when it matches `symbol`'s
/// code, traces every gate at debug level (§6's `debugSymbol` knob).
pub fn pullback(
    series: &BarSeries,
    symbol: &Symbol,
    ema_filter: EmaFilter,
    stochastic_oversold: bool,
    gates: &PullbackGateCounters,
    debug_symbol: Option<&str>,
) -> Option<Detection> {
    let trace = debug_symbol == Some(symbol.code.as_str());
    bump(&gates.total);

    if series.len() < 200 {
        if trace {
            tracing::debug!(code = %symbol.code, "pullback: insufficient history");
        }
        return None;
    }
    bump(&gates.with_data);

    let bars = series.bars();
    let closes = series.closes();
    let last = bars.len() - 1;

    let lookback = 260.min(bars.len());
    let start = bars.len() - lookback;
    let (idx_high, high52w) = bars[start..]
        .iter()
        .enumerate()
        .map(|(offset, b)| (start + offset, b.high))
        .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap())
        .expect("lookback window is non-empty");

    if last - idx_high > 60 {
        if trace {
            tracing::debug!(code = %symbol.code, idx_high, "pullback: high not recent");
        }
        return None;
    }
    bump(&gates.recent_high);

    let close = closes[last];
    let pullback_pct = (high52w - close) / high52w * 100.0;
    if pullback_pct > 30.0 {
        if trace {
            tracing::debug!(code = %symbol.code, pullback_pct, "pullback: beyond 30%");
        }
        return None;
    }
    bump(&gates.within_30pct);

    let ema10 = ema(&closes, 10)[last];
    let ema20 = ema(&closes, 20)[last];
    let ema50 = ema(&closes, 50)[last];
    let today = &bars[last];

    let mut touched = Vec::new();
    if today.low <= ema10 && ema10 <= today.high {
        touched.push("10ema");
        bump(&gates.touch_ema10);
    }
    if today.low <= ema20 && ema20 <= today.high {
        touched.push("20ema");
        bump(&gates.touch_ema20);
    }
    if today.low <= ema50 && ema50 <= today.high {
        touched.push("50ema");
        bump(&gates.touch_ema50);
    }

    if touched.is_empty() {
        if trace {
            tracing::debug!(code = %symbol.code, "pullback: no EMA touch");
        }
        return None;
    }
    bump(&gates.any_touch);

    let filtered: Vec<&str> = match ema_filter {
        EmaFilter::All => touched.clone(),
        EmaFilter::Ema10 => touched.iter().copied().filter(|t| *t == "10ema").collect(),
        EmaFilter::Ema20 => touched.iter().copied().filter(|t| *t == "20ema").collect(),
        EmaFilter::Ema50 => touched.iter().copied().filter(|t| *t == "50ema").collect(),
    };
    if filtered.is_empty() {
        if trace {
            tracing::debug!(code = %symbol.code, ?ema_filter, "pullback: ema filter excludes touched set");
        }
        return None;
    }

    let stoch = stochastic(bars, 14, 3);
    let stoch_k = stoch.k[last];
    let stoch_d = stoch.d[last];

    if stochastic_oversold && !(stoch_k <= 20.0) {
        if trace {
            tracing::debug!(code = %symbol.code, stoch_k, "pullback: stochastic not oversold");
        }
        return None;
    }
    bump(&gates.passed_all);

    let mut attrs = HashMap::new();
    attrs.insert("ema10".to_string(), AttrValue::from(ema10));
    attrs.insert("ema20".to_string(), AttrValue::from(ema20));
    attrs.insert("ema50".to_string(), AttrValue::from(ema50));
    attrs.insert("high52w".to_string(), AttrValue::from(high52w));
    attrs.insert("pullbackPct".to_string(), AttrValue::from(pullback_pct));
    attrs.insert("touchEMA".to_string(), AttrValue::from(touched.join(",")));
    attrs.insert("stochK".to_string(), AttrValue::from(stoch_k));
    attrs.insert("stochD".to_string(), AttrValue::from(stoch_d));

    Some(detection(symbol, RuleName::Pullback, series, attrs))
}

/// Upper bound on how far the Squeeze duration count walks back, matching
/// `squeeze_detection.py`'s `for i in range(1, min(len(prices), 30))` —
/// "最大30日まで遡る" ("walk back at most 30 days").
const SQUEEZE_DURATION_MAX_LOOKBACK: usize = 30;

/// §4.5.4. Requires ≥100 bars. `relaxed_deviation_multiplier` is the ×1.4
/// duration-counting relaxation (§9: "preserve the number; surface it as a
/// configuration knob") — callers pass 1.4 to match the source behaviour.
pub fn squeeze(series: &BarSeries, symbol: &Symbol, relaxed_deviation_multiplier: f64) -> Option<Detection> {
    if series.len() < 100 {
        return None;
    }
    let bars = series.bars();
    let closes = series.closes();
    let last = bars.len() - 1;

    let bands = bollinger_bands(&closes, 20, 2.0);
    let bbw_series = bbw(&bands);
    let ema50_series = ema(&closes, 50);
    let atr_series = atr(bars, 14);

    let deviation_series: Vec<f64> = closes
        .iter()
        .zip(&ema50_series)
        .map(|(c, e)| (c - e).abs() / e * 100.0)
        .collect();

    let window_start = last.saturating_sub(59);
    let bbw_min = bbw_series[window_start..=last].iter().cloned().filter(|v| !v.is_nan()).fold(f64::INFINITY, f64::min);
    let atr_min = atr_series[window_start..=last].iter().cloned().fold(f64::INFINITY, f64::min);

    if !bbw_min.is_finite() || !atr_min.is_finite() {
        return None;
    }

    let bbw_today = bbw_series[last];
    let deviation_today = deviation_series[last];
    let atr_today = atr_series[last];

    let today_ok = bbw_today <= 1.3 * bbw_min && deviation_today <= 5.0 && atr_today <= 1.3 * atr_min;
    if !today_ok {
        return None;
    }

    let mut duration = 0usize;
    for idx in (0..=last).rev().take(SQUEEZE_DURATION_MAX_LOOKBACK) {
        let bbw_v = bbw_series[idx];
        let dev_v = deviation_series[idx];
        let atr_v = atr_series[idx];
        if bbw_v.is_nan() {
            break;
        }
        let relaxed_ok = bbw_v <= 1.3 * bbw_min && dev_v <= relaxed_deviation_multiplier * 5.0 && atr_v <= 1.3 * atr_min;
        if relaxed_ok {
            duration += 1;
        } else {
            break;
        }
    }

    if duration < 5 {
        return None;
    }

    let mut attrs = HashMap::new();
    attrs.insert("bbw".to_string(), AttrValue::from(bbw_today));
    attrs.insert("bbwMin60".to_string(), AttrValue::from(bbw_min));
    attrs.insert("bbwRatio".to_string(), AttrValue::from(bbw_today / bbw_min));
    attrs.insert("deviation".to_string(), AttrValue::from(deviation_today));
    attrs.insert("atr".to_string(), AttrValue::from(atr_today));
    attrs.insert("atrMin60".to_string(), AttrValue::from(atr_min));
    attrs.insert("atrRatio".to_string(), AttrValue::from(atr_today / atr_min));
    attrs.insert("duration".to_string(), AttrValue::from(duration as f64));
    attrs.insert("ema50".to_string(), AttrValue::from(ema50_series[last]));

    Some(detection(symbol, RuleName::Squeeze, series, attrs))
}

/// §4.5.5. A pluggable slot: this spec defines the shape (bar-count
/// requirement, today-condition, attrs bag) but not the breakout
/// definition itself. Always `None` until a concrete rule is supplied.
pub fn breakout(_series: &BarSeries, _symbol: &Symbol) -> Option<Detection> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use screener_core::MarketSegment;

    fn symbol() -> Symbol {
        Symbol {
            code: "7203".to_string(),
            display_name: "Toyota".to_string(),
            market_segment: MarketSegment::Prime,
        }
    }

    fn series_from_closes(closes: &[f64]) -> BarSeries {
        let bars = closes
            .iter()
            .enumerate()
            .map(|(i, c)| screener_core::Bar {
                date: NaiveDate::from_ymd_opt(2023, 1, 1).unwrap() + chrono::Duration::days(i as i64),
                open: *c,
                high: *c,
                low: *c,
                close: *c,
                volume: 1000,
            })
            .collect();
        BarSeries::new(bars)
    }

    #[test]
    fn perfect_order_requires_200_bars() {
        let series = series_from_closes(&vec![100.0; 50]);
        assert!(perfect_order(&series, &symbol(), Sma200Filter::All).is_none());
    }

    #[test]
    fn perfect_order_matches_strictly_ordered_averages() {
        // Monotonically increasing closes push EMA10 >= EMA20 >= EMA50 and
        // Close above all three, matching S1's shape.
        let closes: Vec<f64> = (0..220).map(|i| 500.0 + i as f64 * 3.0).collect();
        let series = series_from_closes(&closes);
        let result = perfect_order(&series, &symbol(), Sma200Filter::All);
        assert!(result.is_some());
    }

    #[test]
    fn perfect_order_below_filter_excludes_above_match() {
        let closes: Vec<f64> = (0..220).map(|i| 500.0 + i as f64 * 3.0).collect();
        let series = series_from_closes(&closes);
        assert!(perfect_order(&series, &symbol(), Sma200Filter::Below).is_none());
    }

    #[test]
    fn bollinger_touch_upper_on_spike() {
        let mut closes = vec![100.0; 20];
        *closes.last_mut().unwrap() = 130.0;
        let series = series_from_closes(&closes);
        let result = bollinger_touch(&series, &symbol());
        match result {
            Some(d) => assert_eq!(d.attrs.get("touchDirection"), Some(&AttrValue::from("upper"))),
            None => panic!("expected a touch"),
        }
    }

    #[test]
    fn pullback_requires_200_bars() {
        let series = series_from_closes(&vec![100.0; 50]);
        let gates = PullbackGateCounters::new();
        assert!(pullback(&series, &symbol(), EmaFilter::All, false, &gates, None).is_none());
        assert_eq!(gates.total.load(Ordering::Relaxed), 1);
        assert_eq!(gates.with_data.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn squeeze_requires_100_bars() {
        let series = series_from_closes(&vec![100.0; 50]);
        assert!(squeeze(&series, &symbol(), 1.4).is_none());
    }

    #[test]
    fn squeeze_duration_caps_at_30_days() {
        // A flat series keeps BBW/deviation/ATR pinned at their minima for
        // every bar once the indicator windows fill, so the contraction
        // easily runs past 30 days; duration must still cap at 30.
        let series = series_from_closes(&vec![100.0; 150]);
        let detection = squeeze(&series, &symbol(), 1.4).expect("sustained flat squeeze should match");
        match detection.attrs.get("duration") {
            Some(AttrValue::Number(n)) => assert_eq!(*n, 30.0),
            other => panic!("expected numeric duration attr, got {:?}", other),
        }
    }

    #[test]
    fn breakout_is_unimplemented_by_design() {
        let series = series_from_closes(&vec![100.0; 300]);
        assert!(breakout(&series, &symbol()).is_none());
    }
}
