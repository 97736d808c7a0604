//! Two-stage sensor filtering: median then moving average.
//!
//! The median stage rejects single-sample spikes; the moving-average stage
//! smooths the median output. Both stages return the first sample verbatim
//! on first-ever update so there is no startup bias toward zero.

/// Median filter over the last `N` samples. `N` should be odd (3 or 5)
/// so the median is a real sample.
pub struct MedianFilter<const N: usize> {
    buffer: [f32; N],
    index: usize,
    count: usize,
}

impl<const N: usize> Default for MedianFilter<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> MedianFilter<N> {
    pub fn new() -> Self {
        Self {
            buffer: [0.0; N],
            index: 0,
            count: 0,
        }
    }

    /// Push a sample and return the median of the collected window.
    pub fn update(&mut self, value: f32) -> f32 {
        self.buffer[self.index] = value;
        self.index = (self.index + 1) % N;
        if self.count < N {
            self.count += 1;
        }

        let mut sorted = [0.0f32; N];
        sorted[..self.count].copy_from_slice(&self.buffer[..self.count]);
        // Insertion sort: the window is at most 5 entries.
        for i in 1..self.count {
            let mut j = i;
            while j > 0 && sorted[j - 1] > sorted[j] {
                sorted.swap(j - 1, j);
                j -= 1;
            }
        }
        sorted[self.count / 2]
    }

    pub fn reset(&mut self) {
        self.index = 0;
        self.count = 0;
    }
}

/// Moving average over the last `N` samples with an O(1) running sum.
///
/// Invariant: `sum` equals the sum of the `count` live buffer entries.
pub struct MovingAvgFilter<const N: usize> {
    buffer: [f32; N],
    index: usize,
    count: usize,
    sum: f32,
}

impl<const N: usize> Default for MovingAvgFilter<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> MovingAvgFilter<N> {
    pub fn new() -> Self {
        Self {
            buffer: [0.0; N],
            index: 0,
            count: 0,
            sum: 0.0,
        }
    }

    /// Push a sample and return the mean of the collected window.
    pub fn update(&mut self, value: f32) -> f32 {
        if self.count == N {
            self.sum -= self.buffer[self.index];
        } else {
            self.count += 1;
        }
        self.buffer[self.index] = value;
        self.sum += value;
        self.index = (self.index + 1) % N;
        self.sum / self.count as f32
    }

    pub fn reset(&mut self) {
        self.index = 0;
        self.count = 0;
        self.sum = 0.0;
    }

    /// Most recent output without pushing a sample, or `None` before the
    /// first update.
    pub fn current(&self) -> Option<f32> {
        (self.count > 0).then(|| self.sum / self.count as f32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn median_first_sample_passthrough() {
        let mut f = MedianFilter::<5>::new();
        assert_eq!(f.update(42.0), 42.0);
    }

    #[test]
    fn median_rejects_spike() {
        let mut f = MedianFilter::<3>::new();
        f.update(20.0);
        f.update(21.0);
        // A wild spike cannot become the median of {20, 21, 500}.
        assert_eq!(f.update(500.0), 21.0);
    }

    #[test]
    fn median_of_five() {
        let mut f = MedianFilter::<5>::new();
        for v in [5.0, 1.0, 4.0, 2.0, 3.0] {
            f.update(v);
        }
        assert_eq!(f.update(100.0), 4.0); // window now {1,4,2,3,100}
    }

    #[test]
    fn avg_first_sample_passthrough() {
        let mut f = MovingAvgFilter::<8>::new();
        assert_eq!(f.update(93.0), 93.0);
        assert_eq!(f.current(), Some(93.0));
    }

    #[test]
    fn avg_partial_window() {
        let mut f = MovingAvgFilter::<4>::new();
        f.update(10.0);
        assert_eq!(f.update(20.0), 15.0);
    }

    #[test]
    fn avg_full_window_exact_mean() {
        let mut f = MovingAvgFilter::<4>::new();
        for v in [1.0, 2.0, 3.0, 4.0, 5.0, 6.0] {
            f.update(v);
        }
        // Last 4 samples: 3, 4, 5, 6.
        assert_eq!(f.current(), Some(4.5));
    }

    #[test]
    fn avg_reset_clears_history() {
        let mut f = MovingAvgFilter::<4>::new();
        f.update(100.0);
        f.reset();
        assert_eq!(f.current(), None);
        assert_eq!(f.update(1.0), 1.0);
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// After pushing k >= N samples, the output equals the arithmetic
        /// mean of the last N exactly — the running sum must not drift.
        #[test]
        fn moving_avg_matches_exact_mean(
            samples in proptest::collection::vec(-1000.0f32..1000.0, 8..200),
        ) {
            const N: usize = 8;
            let mut f = MovingAvgFilter::<N>::new();
            let mut last_out = 0.0;
            for &s in &samples {
                last_out = f.update(s);
            }
            let tail: f32 = samples[samples.len() - N..].iter().sum();
            let expected = tail / N as f32;
            prop_assert!((last_out - expected).abs() < 1e-2,
                "avg drifted: {last_out} vs {expected}");
        }

        /// The median output is always one of the samples in the window.
        #[test]
        fn median_output_is_a_window_sample(
            samples in proptest::collection::vec(-1000.0f32..1000.0, 1..50),
        ) {
            const N: usize = 5;
            let mut f = MedianFilter::<N>::new();
            for (i, &s) in samples.iter().enumerate() {
                let out = f.update(s);
                let start = i.saturating_sub(N - 1);
                let window = &samples[start..=i];
                prop_assert!(window.contains(&out),
                    "median {out} not in window {window:?}");
            }
        }
    }
}
