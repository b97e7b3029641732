//! Stratified largest-remainder sampling (§4.7).
//!
//! Detections are split into code-range buckets (leading digit of the
//! symbol code), then by market segment within each bucket; each bucket
//! draws up to `maxPerRange` detections, apportioned across segments by
//! the largest-remainder method and drawn uniformly without replacement.

use std::collections::BTreeMap;

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use screener_core::{Detection, MarketSegment};

/// Fixed tie-break order for largest-remainder seat allocation and for the
/// deterministic order segments are drawn from within a range. The spec
/// leaves the tie-break rule implementation-defined as long as it is
/// deterministic within a run; this crate picks declaration order.
const SEGMENT_ORDER: [MarketSegment; 3] = [MarketSegment::Prime, MarketSegment::Standard, MarketSegment::Growth];

fn code_range(code: &str) -> String {
    if code.len() >= 4 {
        format!("{}000", &code[..1])
    } else {
        "other".to_string()
    }
}

/// Largest-remainder apportionment of `target` seats across `counts`
/// (only segments with a non-zero count participate), clamped so no
/// segment is allocated more seats than it holds.
fn apportion(counts: &BTreeMap<MarketSegment, usize>, target: usize) -> BTreeMap<MarketSegment, usize> {
    let total: usize = counts.values().sum();
    if total == 0 || target == 0 {
        return BTreeMap::new();
    }

    let mut quotas: BTreeMap<MarketSegment, usize> = BTreeMap::new();
    let mut remainders: Vec<(MarketSegment, f64)> = Vec::new();

    for (&segment, &count) in counts {
        let ideal = (count as f64 / total as f64) * target as f64;
        let floor = ideal.floor();
        quotas.insert(segment, floor as usize);
        remainders.push((segment, ideal - floor));
    }

    let allocated: usize = quotas.values().sum();
    let mut shortfall = target.saturating_sub(allocated);

    remainders.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap()
            .then_with(|| segment_rank(a.0).cmp(&segment_rank(b.0)))
    });

    for (segment, _) in remainders {
        if shortfall == 0 {
            break;
        }
        *quotas.get_mut(&segment).unwrap() += 1;
        shortfall -= 1;
    }

    for (segment, quota) in quotas.iter_mut() {
        let available = *counts.get(segment).unwrap_or(&0);
        if *quota > available {
            *quota = available;
        }
    }

    quotas
}

fn segment_rank(segment: MarketSegment) -> usize {
    SEGMENT_ORDER.iter().position(|&s| s == segment).unwrap_or(SEGMENT_ORDER.len())
}

/// Applies §4.7 in full: returns `detections` unchanged when `|detections|
/// <= 100`; otherwise partitions, apportions and draws deterministically
/// for a given `seed`.
pub fn sample(detections: Vec<Detection>, max_per_range: usize, seed: u64) -> Vec<Detection> {
    if detections.len() <= 100 {
        return detections;
    }

    let mut by_range: BTreeMap<String, BTreeMap<MarketSegment, Vec<Detection>>> = BTreeMap::new();
    for d in detections {
        let range = code_range(&d.symbol.code);
        by_range
            .entry(range)
            .or_default()
            .entry(d.symbol.market_segment)
            .or_default()
            .push(d);
    }

    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut sampled = Vec::new();

    for (_range, mut segments) in by_range {
        let counts: BTreeMap<MarketSegment, usize> = segments.iter().map(|(seg, v)| (*seg, v.len())).collect();
        let total_in_range: usize = counts.values().sum();
        let target = max_per_range.min(total_in_range);
        let quotas = apportion(&counts, target);

        for &segment in SEGMENT_ORDER.iter() {
            let Some(draw_count) = quotas.get(&segment).copied() else { continue };
            if draw_count == 0 {
                continue;
            }
            if let Some(pool) = segments.get_mut(&segment) {
                let (chosen, _rest) = pool.partial_shuffle(&mut rng, draw_count);
                sampled.extend_from_slice(chosen);
            }
        }
    }

    sampled
}
