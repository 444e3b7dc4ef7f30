//! Incremental historical volatility over a rolling window of close prices.

use std::collections::VecDeque;

/// Annualization basis for one-minute intraday sampling:
/// 252 trading days x 390 one-minute bars per session.
const MINUTES_PER_YEAR: f64 = 252.0 * 390.0;

/// Annualized historical volatility of a close-price series.
///
/// Returns exactly 0.0 for degenerate inputs: fewer than 2 samples, zero
/// variance, or a non-finite intermediate. Never returns NaN or Inf.
pub fn annualized_hv(closes: &[f64]) -> f64 {
    if closes.len() < 2 {
        return 0.0;
    }

    let returns: Vec<f64> = closes.windows(2).map(|w| (w[1] / w[0]).ln()).collect();
    if returns.is_empty() || returns.iter().all(|r| *r == 0.0) {
        return 0.0;
    }

    let n = returns.len() as f64;
    let mean = returns.iter().sum::<f64>() / n;
    let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n;
    let hv = variance.sqrt() * MINUTES_PER_YEAR.sqrt();

    if hv.is_finite() { hv } else { 0.0 }
}

/// Bounded FIFO of the most recent accepted close prices for one symbol.
/// Oldest sample is evicted when the window is full.
#[derive(Debug)]
pub struct RollingWindow {
    capacity: usize,
    closes: VecDeque<f64>,
}

impl RollingWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            closes: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, price: f64) {
        if self.closes.len() == self.capacity {
            self.closes.pop_front();
        }
        self.closes.push_back(price);
    }

    pub fn len(&self) -> usize {
        self.closes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.closes.is_empty()
    }

    pub fn hv(&self) -> f64 {
        let samples: Vec<f64> = self.closes.iter().copied().collect();
        annualized_hv(&samples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fewer_than_two_samples_is_zero() {
        assert_eq!(annualized_hv(&[]), 0.0);
        assert_eq!(annualized_hv(&[100.0]), 0.0);
    }

    #[test]
    fn zero_variance_is_zero() {
        assert_eq!(annualized_hv(&[100.0, 100.0, 100.0]), 0.0);
    }

    #[test]
    fn varying_prices_give_positive_finite_hv() {
        let hv = annualized_hv(&[100.0, 101.5, 99.8, 100.7, 102.1]);
        assert!(hv > 0.0);
        assert!(hv.is_finite());
    }

    #[test]
    fn pathological_prices_never_produce_nan_or_inf() {
        // Zero and negative prices make ln() blow up; result must stay 0.
        assert_eq!(annualized_hv(&[100.0, 0.0, 100.0]), 0.0);
        assert_eq!(annualized_hv(&[-5.0, 3.0]), 0.0);
        let hv = annualized_hv(&[f64::MAX, f64::MIN_POSITIVE]);
        assert!(hv.is_finite());
    }

    #[test]
    fn window_evicts_oldest_when_full() {
        let mut w = RollingWindow::new(3);
        w.push(1.0);
        w.push(2.0);
        w.push(3.0);
        w.push(4.0);
        assert_eq!(w.len(), 3);
        let samples: Vec<f64> = w.closes.iter().copied().collect();
        assert_eq!(samples, vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn window_hv_matches_direct_computation() {
        let mut w = RollingWindow::new(10);
        for p in [100.0, 101.0, 100.5, 102.0] {
            w.push(p);
        }
        assert_eq!(w.hv(), annualized_hv(&[100.0, 101.0, 100.5, 102.0]));
    }
}
