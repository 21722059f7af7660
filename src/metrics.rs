/// Spread of instantaneous throughput readings across a sampling window.
/// The quartiles show how steady the link held under load; a wide gap
/// between p25 and p75 usually means the search picked an unstable config.
#[derive(Debug, Clone, Copy)]
pub struct RateSpread {
    pub mean_mbps: f64,
    pub median_mbps: f64,
    pub p25_mbps: f64,
    pub p75_mbps: f64,
}

/// Summarize per-tick Mbps readings from one saturation window. Needs at
/// least two ticks; a single reading says nothing about stability.
pub fn rate_spread(ticks_mbps: &[f64]) -> Option<RateSpread> {
    if ticks_mbps.len() < 2 {
        return None;
    }
    let mut sorted = ticks_mbps.to_vec();
    sorted.sort_unstable_by(f64::total_cmp);
    let mean_mbps = ticks_mbps.iter().sum::<f64>() / ticks_mbps.len() as f64;
    Some(RateSpread {
        mean_mbps,
        median_mbps: quantile(&sorted, 0.50),
        p25_mbps: quantile(&sorted, 0.25),
        p75_mbps: quantile(&sorted, 0.75),
    })
}

/// Linear-interpolated quantile of an ascending-sorted slice.
fn quantile(sorted: &[f64], q: f64) -> f64 {
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    if lo == hi {
        sorted[lo]
    } else {
        sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn too_few_ticks_yield_none() {
        assert!(rate_spread(&[]).is_none());
        assert!(rate_spread(&[42.0]).is_none());
    }

    #[test]
    fn spread_is_order_insensitive() {
        let s = rate_spread(&[9.0, 1.0, 5.0, 3.0, 7.0]).unwrap();
        assert!((s.mean_mbps - 5.0).abs() < 1e-9);
        assert!((s.median_mbps - 5.0).abs() < 1e-9);
        assert!((s.p25_mbps - 3.0).abs() < 1e-9);
        assert!((s.p75_mbps - 7.0).abs() < 1e-9);
    }

    #[test]
    fn quantiles_interpolate_between_ticks() {
        let s = rate_spread(&[0.0, 10.0]).unwrap();
        assert!((s.median_mbps - 5.0).abs() < 1e-9);
        assert!((s.p25_mbps - 2.5).abs() < 1e-9);
        assert!((s.p75_mbps - 7.5).abs() < 1e-9);
    }

    #[test]
    fn steady_rate_collapses_the_spread() {
        let s = rate_spread(&[80.0, 80.0, 80.0, 80.0]).unwrap();
        assert_eq!(s.p25_mbps, s.p75_mbps);
        assert_eq!(s.median_mbps, 80.0);
    }
}
