use crate::model::LatencySummary;
use hdrhistogram::Histogram;

#[derive(Debug, Default, Clone)]
pub struct OnlineStats {
    n: u64,
    mean: f64,
    m2: f64,
}

impl OnlineStats {
    pub fn push(&mut self, x: f64) {
        self.n += 1;
        let delta = x - self.mean;
        self.mean += delta / (self.n as f64);
        let delta2 = x - self.mean;
        self.m2 += delta * delta2;
    }

    pub fn stddev(&self) -> Option<f64> {
        if self.n < 2 {
            None
        } else {
            Some((self.m2 / ((self.n - 1) as f64)).sqrt())
        }
    }
}

pub fn latency_summary_from_samples(
    sent: u64,
    received: u64,
    samples_ms: &[f64],
    jitter_ms: Option<f64>,
) -> LatencySummary {
    let loss = if sent == 0 {
        0.0
    } else {
        ((sent - received) as f64) / (sent as f64)
    };

    if samples_ms.is_empty() {
        return LatencySummary {
            sent,
            received,
            loss,
            jitter_ms,
            ..Default::default()
        };
    }

    // HDRHistogram wants integer values; store microseconds to preserve precision.
    let mut h = Histogram::<u64>::new_with_bounds(1, 60_000_000, 3).unwrap();
    for &ms in samples_ms {
        let us = (ms * 1000.0).round().clamp(1.0, 60_000_000.0) as u64;
        let _ = h.record(us);
    }

    let mean_ms = samples_ms.iter().sum::<f64>() / samples_ms.len() as f64;

    LatencySummary {
        sent,
        received,
        loss,
        min_ms: Some((h.min() as f64) / 1000.0),
        mean_ms: Some(mean_ms),
        median_ms: Some((h.value_at_quantile(0.50) as f64) / 1000.0),
        p25_ms: Some((h.value_at_quantile(0.25) as f64) / 1000.0),
        p75_ms: Some((h.value_at_quantile(0.75) as f64) / 1000.0),
        max_ms: Some((h.max() as f64) / 1000.0),
        jitter_ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_samples_keep_loss_but_no_values() {
        let s = latency_summary_from_samples(10, 0, &[], None);
        assert_eq!(s.sent, 10);
        assert_eq!(s.received, 0);
        assert!((s.loss - 1.0).abs() < f64::EPSILON);
        assert!(s.median_ms.is_none());
    }

    #[test]
    fn summary_tracks_order_statistics() {
        let samples: Vec<f64> = (1..=100).map(|v| v as f64).collect();
        let s = latency_summary_from_samples(100, 100, &samples, None);
        assert!((s.mean_ms.unwrap() - 50.5).abs() < 0.01);
        let median = s.median_ms.unwrap();
        assert!((49.0..=51.0).contains(&median), "median was {median}");
        assert!(s.min_ms.unwrap() <= 1.01);
        assert!(s.max_ms.unwrap() >= 99.0);
    }

    #[test]
    fn online_stats_stddev() {
        let mut o = OnlineStats::default();
        assert!(o.stddev().is_none());
        for x in [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0] {
            o.push(x);
        }
        let sd = o.stddev().unwrap();
        assert!((sd - 2.138).abs() < 0.01, "stddev was {sd}");
    }
}
