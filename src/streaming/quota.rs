//! Interactive brick quota heuristics
//!
//! While the user drags the camera in memory-swap mode, only a bounded number
//! of bricks ("the quota") may stream per frame. The quota shrinks when frames
//! run over the up-time and grows back when they finish early.

use std::collections::VecDeque;

use super::config::QuotaEstimate;

/// Rolling history of recent quotas
#[derive(Clone, Debug)]
pub struct QuotaEstimator {
    history: VecDeque<u32>,
    capacity: usize,
    mode: QuotaEstimate,
}

impl QuotaEstimator {
    pub fn new(capacity: usize, mode: QuotaEstimate) -> Self {
        Self { history: VecDeque::with_capacity(capacity.max(1)), capacity: capacity.max(1), mode }
    }

    pub fn push(&mut self, quota: u32) {
        if self.history.len() == self.capacity {
            self.history.pop_front();
        }
        self.history.push_back(quota);
    }

    pub fn clear(&mut self) {
        self.history.clear();
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn last(&self) -> Option<u32> {
        self.history.back().copied()
    }

    pub fn mode(&self) -> QuotaEstimate {
        self.mode
    }

    /// Estimate of the next quota from the history, `None` while empty
    pub fn estimate(&self) -> Option<f32> {
        let n = self.history.len();
        if n == 0 {
            return None;
        }
        let values: Vec<f32> = self.history.iter().map(|&q| q as f32).collect();
        let est = match self.mode {
            QuotaEstimate::Mean => values.iter().sum::<f32>() / n as f32,
            QuotaEstimate::Last => values[n - 1],
            QuotaEstimate::Median => {
                let mut sorted = values.clone();
                sorted.sort_by(|a, b| a.total_cmp(b));
                if n % 2 == 1 {
                    sorted[n / 2]
                } else {
                    (sorted[n / 2 - 1] + sorted[n / 2]) * 0.5
                }
            }
            QuotaEstimate::Trend => {
                if n < 2 {
                    values[0]
                } else {
                    let slope = (values[n - 1] - values[0]) / (n - 1) as f32;
                    values[n - 1] + slope
                }
            }
            QuotaEstimate::Regression => {
                if n < 2 {
                    values[0]
                } else {
                    // Least squares over x = 0..n, evaluated at x = n
                    let mean_x = (n - 1) as f32 * 0.5;
                    let mean_y = values.iter().sum::<f32>() / n as f32;
                    let mut sxy = 0.0;
                    let mut sxx = 0.0;
                    for (i, y) in values.iter().enumerate() {
                        let dx = i as f32 - mean_x;
                        sxy += dx * (y - mean_y);
                        sxx += dx * dx;
                    }
                    mean_y + sxy / sxx * (n as f32 - mean_x)
                }
            }
        };
        Some(est.max(1.0))
    }

    /// Quota for the next interactive frame
    ///
    /// `consumed` is the time the last frame took and `up_time` the budget,
    /// both in milliseconds. The result is always within `1..=total`.
    pub fn next_quota(&mut self, total: u32, consumed: f32, up_time: f32) -> u32 {
        if total == 0 {
            return 0;
        }
        if consumed <= 0.0 {
            self.push(total);
            return total;
        }
        if consumed / up_time.max(f32::EPSILON) > total as f32 {
            self.push(1);
            return 1;
        }
        let last = self.last().unwrap_or(total) as f32;
        let candidate = (last * up_time / consumed).max(1.0);
        let quota = match self.estimate() {
            Some(est) => (est + candidate) * 0.5,
            None => candidate,
        };
        let quota = (quota.round() as u32).clamp(1, total);
        log::debug!(
            "Quota {} of {} (consumed {:.1}ms, up-time {:.1}ms, {:?})",
            quota, total, consumed, up_time, self.mode
        );
        self.push(quota);
        quota
    }
}

impl Default for QuotaEstimator {
    fn default() -> Self {
        Self::new(5, QuotaEstimate::Mean)
    }
}

/// Up-time adjusted for interaction speed; faster motion gets less time per frame
pub fn corrected_up_time(up_time: f32, speed: f32) -> f32 {
    let speed = speed.clamp(5.0, 20.0);
    ((100.0 / speed).log10() * up_time).max(1.0)
}

/// Split a quota across channels, serving `current` first and then its
/// neighbours alternately (+1, -1, +2, -2, ...)
///
/// `required[i]` is the number of bricks channel `i` still needs.
pub fn allocate_channel_quotas(quota: usize, current: usize, required: &[usize]) -> Vec<usize> {
    let n = required.len();
    let mut out = vec![0; n];
    if n == 0 {
        return out;
    }
    let current = current.min(n - 1);
    let mut left = quota;
    let mut order = vec![current];
    for step in 1..n {
        if current + step < n {
            order.push(current + step);
        }
        if step <= current {
            order.push(current - step);
        }
    }
    for ch in order {
        if left == 0 {
            break;
        }
        let take = required[ch].min(left);
        out[ch] = take;
        left -= take;
    }
    out
}

/// Share a brick budget across volumes in proportion to their weights, then
/// hand any leftover to volumes that still have bricks
pub fn share_quota(total: usize, weights: &[f32], available: &[usize]) -> Vec<usize> {
    let n = weights.len().min(available.len());
    let mut out = vec![0usize; n];
    if n == 0 || total == 0 {
        return out;
    }
    let sum: f32 = weights[..n].iter().map(|w| w.max(0.0)).sum();
    let mut used = 0;
    for i in 0..n {
        let share = if sum > 0.0 {
            (total as f32 * weights[i].max(0.0) / sum).floor() as usize
        } else {
            total / n
        };
        out[i] = share.min(available[i]);
        used += out[i];
    }
    let mut left = total.saturating_sub(used);
    while left > 0 {
        let mut gave = false;
        for i in 0..n {
            if left == 0 {
                break;
            }
            if out[i] < available[i] {
                out[i] += 1;
                left -= 1;
                gave = true;
            }
        }
        if !gave {
            break;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_modes() {
        let mut est = QuotaEstimator::new(5, QuotaEstimate::Mean);
        for q in [10, 20, 30] {
            est.push(q);
        }
        assert_eq!(est.estimate(), Some(20.0));

        est.mode = QuotaEstimate::Last;
        assert_eq!(est.estimate(), Some(30.0));
        est.mode = QuotaEstimate::Median;
        assert_eq!(est.estimate(), Some(20.0));
        est.mode = QuotaEstimate::Trend;
        assert_eq!(est.estimate(), Some(40.0));
        est.mode = QuotaEstimate::Regression;
        assert!((est.estimate().unwrap() - 40.0).abs() < 1e-4);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut est = QuotaEstimator::new(2, QuotaEstimate::Mean);
        est.push(1);
        est.push(2);
        est.push(3);
        assert_eq!(est.len(), 2);
        assert_eq!(est.estimate(), Some(2.5));
    }

    #[test]
    fn test_quota_edges() {
        let mut est = QuotaEstimator::default();
        assert_eq!(est.next_quota(50, 0.0, 100.0), 50);
        assert_eq!(est.next_quota(50, 10_000.0, 100.0), 1);
        assert_eq!(est.next_quota(0, 10.0, 100.0), 0);
    }

    #[test]
    fn test_quota_shrinks_when_slow_and_grows_when_fast() {
        let mut est = QuotaEstimator::default();
        est.push(40);
        let slow = est.next_quota(100, 400.0, 100.0);
        assert!(slow < 40);
        let fast = est.next_quota(100, 10.0, 100.0);
        assert!(fast > slow);
        assert!(fast <= 100);
    }

    #[test]
    fn test_corrected_up_time() {
        assert!((corrected_up_time(100.0, 10.0) - 100.0).abs() < 1e-3);
        assert!(corrected_up_time(100.0, 20.0) < corrected_up_time(100.0, 5.0));
        assert_eq!(corrected_up_time(0.0, 10.0), 1.0);
    }

    #[test]
    fn test_channel_allocation_alternates() {
        assert_eq!(allocate_channel_quotas(10, 1, &[4, 3, 5]), vec![2, 3, 5]);
        assert_eq!(allocate_channel_quotas(4, 0, &[1, 2, 9]), vec![1, 2, 1]);
        assert_eq!(allocate_channel_quotas(100, 5, &[1, 1]), vec![1, 1]);
        assert!(allocate_channel_quotas(3, 0, &[]).is_empty());
    }

    #[test]
    fn test_share_quota_redistributes() {
        assert_eq!(share_quota(10, &[1.0, 1.0], &[2, 20]), vec![2, 8]);
        assert_eq!(share_quota(9, &[2.0, 1.0], &[100, 100]), vec![6, 3]);
        assert_eq!(share_quota(5, &[1.0], &[3]), vec![3]);
    }
}
