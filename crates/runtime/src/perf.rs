use std::collections::VecDeque;

pub const DEFAULT_WINDOW: usize = 30;
pub const DOWNGRADE_BELOW_FPS: f64 = 30.0;
pub const UPGRADE_ABOVE_FPS: f64 = 50.0;

/// Sliding window of recent frame rates.
///
/// Verdicts are only given once the window is full, and the downgrade/upgrade
/// thresholds are far apart, so a tier change does not immediately
/// flip back.
#[derive(Debug, Clone)]
pub struct PerformanceMonitor {
    capacity: usize,
    samples: VecDeque<f64>,
}

impl Default for PerformanceMonitor {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

impl PerformanceMonitor {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            samples: VecDeque::with_capacity(capacity),
        }
    }

    /// Record one frame duration in milliseconds. Non-finite or non-positive
    /// durations are ignored.
    pub fn record_frame(&mut self, delta_ms: f64) {
        if !delta_ms.is_finite() || delta_ms <= 0.0 {
            return;
        }
        let fps = 1000.0 / delta_ms;
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(fps);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.samples.len() == self.capacity
    }

    pub fn average_fps(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.samples.iter().sum::<f64>() / self.samples.len() as f64)
    }

    pub fn should_downgrade(&self) -> bool {
        self.is_full()
            && self
                .average_fps()
                .is_some_and(|fps| fps < DOWNGRADE_BELOW_FPS)
    }

    pub fn should_upgrade(&self) -> bool {
        self.is_full() && self.average_fps().is_some_and(|fps| fps > UPGRADE_ABOVE_FPS)
    }

    pub fn reset(&mut self) {
        self.samples.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::PerformanceMonitor;

    const SLOW_MS: f64 = 50.0; // 20 fps
    const FAST_MS: f64 = 10.0; // 100 fps

    #[test]
    fn ignores_invalid_deltas() {
        let mut m = PerformanceMonitor::new(3);
        m.record_frame(0.0);
        m.record_frame(-4.0);
        m.record_frame(f64::NAN);
        m.record_frame(f64::INFINITY);
        assert!(m.is_empty());
    }

    #[test]
    fn no_verdict_until_window_is_full() {
        let mut m = PerformanceMonitor::default();
        for _ in 0..29 {
            m.record_frame(SLOW_MS);
            assert!(!m.should_downgrade());
        }
        m.record_frame(SLOW_MS);
        assert!(m.should_downgrade());
        assert!(!m.should_upgrade());
    }

    #[test]
    fn window_slides_and_middle_band_is_neutral() {
        let mut m = PerformanceMonitor::new(4);
        for _ in 0..4 {
            m.record_frame(SLOW_MS);
        }
        assert!(m.should_downgrade());
        for _ in 0..4 {
            m.record_frame(FAST_MS);
        }
        assert_eq!(m.len(), 4);
        assert!(m.should_upgrade());

        m.reset();
        for _ in 0..4 {
            m.record_frame(25.0); // 40 fps
        }
        assert!(!m.should_downgrade());
        assert!(!m.should_upgrade());
    }
}
