//! Pure, deterministic indicator functions (§4.4). Every function returns a
//! vector the same length as its input; positions without enough history
//! carry `NaN` rather than being omitted, so callers can always index by
//! the same offset as the source series.

use screener_core::Bar;

/// Simple moving average. `NaN` for `i < n-1`.
pub fn sma(data: &[f64], n: usize) -> Vec<f64> {
    let mut out = vec![f64::NAN; data.len()];
    if n == 0 {
        return out;
    }
    for i in 0..data.len() {
        if i + 1 >= n {
            let window = &data[i + 1 - n..=i];
            out[i] = window.iter().sum::<f64>() / n as f64;
        }
    }
    out
}

/// Exponential moving average, "span, no adjustment" form: `EMA[0] =
/// Close[0]`, `EMA[i] = α·Close[i] + (1−α)·EMA[i−1]` with `α = 2/(n+1)`.
/// No SMA seed — this convention is load-bearing, not a style choice.
pub fn ema(data: &[f64], n: usize) -> Vec<f64> {
    if data.is_empty() {
        return vec![];
    }
    let alpha = 2.0 / (n as f64 + 1.0);
    let mut out = Vec::with_capacity(data.len());
    out.push(data[0]);
    for i in 1..data.len() {
        let prev = out[i - 1];
        out.push(alpha * data[i] + (1.0 - alpha) * prev);
    }
    out
}

/// Sample standard deviation over the trailing `n` closes (divisor `n-1`).
/// `NaN` for `i < n-1` and for `n < 2` (no sample variance with one point).
pub fn stdev(data: &[f64], n: usize) -> Vec<f64> {
    let mut out = vec![f64::NAN; data.len()];
    if n < 2 {
        return out;
    }
    for i in 0..data.len() {
        if i + 1 >= n {
            let window = &data[i + 1 - n..=i];
            let mean = window.iter().sum::<f64>() / n as f64;
            let variance = window.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1) as f64;
            out[i] = variance.sqrt();
        }
    }
    out
}

pub struct BollingerBands {
    pub upper: Vec<f64>,
    pub mid: Vec<f64>,
    pub lower: Vec<f64>,
}

/// `mid = SMA_n`, `upper/lower = mid ± k·StdDev_n`.
pub fn bollinger_bands(data: &[f64], n: usize, k: f64) -> BollingerBands {
    let mid = sma(data, n);
    let sd = stdev(data, n);
    let upper = mid.iter().zip(&sd).map(|(m, s)| m + k * s).collect();
    let lower = mid.iter().zip(&sd).map(|(m, s)| m - k * s).collect();
    BollingerBands { upper, mid, lower }
}

/// Bollinger band width, `(upper − lower) / mid × 100`. `NaN` propagates
/// from the inputs; a zero `mid` also yields `NaN` (no finite price is
/// ever exactly zero, so this is a degenerate-data guard, not a real case).
pub fn bbw(bands: &BollingerBands) -> Vec<f64> {
    bands
        .upper
        .iter()
        .zip(&bands.lower)
        .zip(&bands.mid)
        .map(|((u, l), m)| if *m == 0.0 { f64::NAN } else { (u - l) / m * 100.0 })
        .collect()
}

/// True range per bar. `TR[0] = High[0] − Low[0]`: a degenerate baseline
/// (no previous close to compare against) rather than `NaN`, so the
/// downstream EMA has no gap to special-case.
pub fn true_range(bars: &[Bar]) -> Vec<f64> {
    let mut out = Vec::with_capacity(bars.len());
    if bars.is_empty() {
        return out;
    }
    out.push(bars[0].high - bars[0].low);
    for i in 1..bars.len() {
        let hl = bars[i].high - bars[i].low;
        let hc = (bars[i].high - bars[i - 1].close).abs();
        let lc = (bars[i].low - bars[i - 1].close).abs();
        out.push(hl.max(hc).max(lc));
    }
    out
}

/// Average true range: `EMA_n` of [`true_range`].
pub fn atr(bars: &[Bar], n: usize) -> Vec<f64> {
    ema(&true_range(bars), n)
}

pub struct StochasticResult {
    pub k: Vec<f64>,
    pub d: Vec<f64>,
}

/// `%K = (Close − min(Low, k)) / (max(High, k) − min(Low, k)) × 100`,
/// `%D = SMA_d(%K)`. `NaN` when the k-period range is degenerate (flat
/// High == Low) or there isn't enough history yet.
pub fn stochastic(bars: &[Bar], k_period: usize, d_period: usize) -> StochasticResult {
    let mut k = vec![f64::NAN; bars.len()];
    for i in 0..bars.len() {
        if i + 1 >= k_period && k_period > 0 {
            let window = &bars[i + 1 - k_period..=i];
            let highest = window.iter().map(|b| b.high).fold(f64::NEG_INFINITY, f64::max);
            let lowest = window.iter().map(|b| b.low).fold(f64::INFINITY, f64::min);
            let range = highest - lowest;
            k[i] = if range == 0.0 {
                f64::NAN
            } else {
                100.0 * (bars[i].close - lowest) / range
            };
        }
    }
    let d = sma(&k, d_period);
    StochasticResult { k, d }
}

/// Index of the maximum `High` over the trailing `lookback` bars ending at
/// `end` (inclusive), and that maximum value. `None` if `end` has fewer
/// than one bar of history.
pub fn rolling_max_high(bars: &[Bar], end: usize, lookback: usize) -> Option<(usize, f64)> {
    if bars.is_empty() {
        return None;
    }
    let start = end.saturating_sub(lookback.saturating_sub(1));
    bars[start..=end]
        .iter()
        .enumerate()
        .map(|(offset, b)| (start + offset, b.high))
        .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn bar(close: f64) -> Bar {
        Bar {
            date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            open: close,
            high: close,
            low: close,
            close,
            volume: 1,
        }
    }

    #[test]
    fn ema_of_constant_series_is_constant() {
        let data = vec![1.0, 1.0, 1.0, 1.0, 1.0];
        let result = ema(&data, 2);
        assert_eq!(result, vec![1.0, 1.0, 1.0, 1.0, 1.0]);
    }

    #[test]
    fn ema_matches_hand_seeded_recursion() {
        let data = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        let result = ema(&data, 2);
        let alpha = 2.0 / 3.0;
        let mut expected = vec![1.0];
        for i in 1..5 {
            let prev = expected[i - 1];
            expected.push(alpha * data[i] + (1.0 - alpha) * prev);
        }
        for (a, b) in result.iter().zip(expected.iter()) {
            assert!((a - b).abs() < 1e-9);
        }
    }

    #[test]
    fn sma_is_nan_before_window_fills() {
        let data = vec![1.0, 2.0, 3.0];
        let result = sma(&data, 3);
        assert!(result[0].is_nan());
        assert!(result[1].is_nan());
        assert!((result[2] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn indicators_are_pure() {
        let data = vec![1.0, 3.0, 2.0, 5.0, 4.0, 6.0, 7.0];
        assert_eq!(sma(&data, 3), sma(&data, 3));
        assert_eq!(ema(&data, 3), ema(&data, 3));

        let bars: Vec<Bar> = data.iter().map(|c| bar(*c)).collect();
        assert_eq!(atr(&bars, 3), atr(&bars, 3));
        let s1 = stochastic(&bars, 3, 2);
        let s2 = stochastic(&bars, 3, 2);
        assert_eq!(s1.k, s2.k);
        assert_eq!(s1.d, s2.d);
    }

    #[test]
    fn bollinger_upper_exceeds_lower_with_variance() {
        let data = vec![100.0; 19].into_iter().chain([130.0]).collect::<Vec<_>>();
        let bands = bollinger_bands(&data, 20, 3.0);
        let last = data.len() - 1;
        assert!(bands.upper[last] > bands.lower[last]);
    }
}
