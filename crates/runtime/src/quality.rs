use serde::{Deserialize, Serialize};
use tracing::info;

use crate::perf::PerformanceMonitor;

/// Named quality preset trading data resolution and ray-march cost for frame rate.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityTier {
    Low,
    Medium,
    High,
}

#[derive(Debug, Copy, Clone, PartialEq, Serialize)]
pub struct QualityPreset {
    /// Horizontal grid spacing requested from the backend.
    pub grid_resolution_m: f64,
    pub ray_march_steps: u32,
    /// Minimum time between two network fetches.
    pub min_update_interval_ms: u64,
}

impl QualityTier {
    pub const ALL: [QualityTier; 3] = [QualityTier::Low, QualityTier::Medium, QualityTier::High];

    pub fn preset(self) -> QualityPreset {
        match self {
            QualityTier::Low => QualityPreset {
                grid_resolution_m: 6_000.0,
                ray_march_steps: 64,
                min_update_interval_ms: 1_500,
            },
            QualityTier::Medium => QualityPreset {
                grid_resolution_m: 3_000.0,
                ray_march_steps: 128,
                min_update_interval_ms: 800,
            },
            QualityTier::High => QualityPreset {
                grid_resolution_m: 1_500.0,
                ray_march_steps: 256,
                min_update_interval_ms: 400,
            },
        }
    }

    pub fn lower(self) -> Option<Self> {
        match self {
            QualityTier::Low => None,
            QualityTier::Medium => Some(QualityTier::Low),
            QualityTier::High => Some(QualityTier::Medium),
        }
    }

    pub fn higher(self) -> Option<Self> {
        match self {
            QualityTier::Low => Some(QualityTier::Medium),
            QualityTier::Medium => Some(QualityTier::High),
            QualityTier::High => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            QualityTier::Low => "low",
            QualityTier::Medium => "medium",
            QualityTier::High => "high",
        }
    }
}

impl std::fmt::Display for QualityTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownQualityTier(pub String);

impl std::fmt::Display for UnknownQualityTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown quality tier: {:?}", self.0)
    }
}

impl std::error::Error for UnknownQualityTier {}

impl std::str::FromStr for QualityTier {
    type Err = UnknownQualityTier;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(QualityTier::Low),
            "medium" => Ok(QualityTier::Medium),
            "high" => Ok(QualityTier::High),
            _ => Err(UnknownQualityTier(s.to_string())),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TierChange {
    pub from: QualityTier,
    pub to: QualityTier,
}

/// Drives automatic one-step tier changes from frame timings.
#[derive(Debug, Clone)]
pub struct QualityController {
    tier: QualityTier,
    auto_adjust: bool,
    monitor: PerformanceMonitor,
}

impl QualityController {
    pub fn new(tier: QualityTier, auto_adjust: bool) -> Self {
        Self::with_monitor(tier, auto_adjust, PerformanceMonitor::default())
    }

    pub fn with_monitor(tier: QualityTier, auto_adjust: bool, monitor: PerformanceMonitor) -> Self {
        Self {
            tier,
            auto_adjust,
            monitor,
        }
    }

    pub fn tier(&self) -> QualityTier {
        self.tier
    }

    pub fn auto_adjust(&self) -> bool {
        self.auto_adjust
    }

    pub fn monitor(&self) -> &PerformanceMonitor {
        &self.monitor
    }

    /// Explicitly select a tier. Returns the change if the tier differs.
    pub fn set_tier(&mut self, tier: QualityTier) -> Option<TierChange> {
        if tier == self.tier {
            return None;
        }
        let change = TierChange {
            from: self.tier,
            to: tier,
        };
        self.tier = tier;
        self.monitor.reset();
        Some(change)
    }

    /// Toggling auto-adjustment discards collected samples; the tier is kept.
    pub fn set_auto_adjust(&mut self, enabled: bool) {
        self.auto_adjust = enabled;
        self.monitor.reset();
    }

    /// Feed one frame duration; returns a tier change when the monitor's
    /// verdict moves the tier by one step.
    pub fn record_frame(&mut self, delta_ms: f64) -> Option<TierChange> {
        if !self.auto_adjust {
            return None;
        }
        self.monitor.record_frame(delta_ms);

        let next = if self.monitor.should_downgrade() {
            self.tier.lower()
        } else if self.monitor.should_upgrade() {
            self.tier.higher()
        } else {
            None
        }?;

        let change = self.set_tier(next)?;
        info!(
            from = %change.from,
            to = %change.to,
            "quality tier adjusted from frame timings"
        );
        Some(change)
    }
}

#[cfg(test)]
mod tests {
    use super::{QualityController, QualityTier, TierChange};

    const SLOW_MS: f64 = 50.0;
    const FAST_MS: f64 = 10.0;

    #[test]
    fn presets_get_cheaper_as_tier_drops() {
        let low = QualityTier::Low.preset();
        let high = QualityTier::High.preset();
        assert!(low.grid_resolution_m > high.grid_resolution_m);
        assert!(low.ray_march_steps < high.ray_march_steps);
        assert!(low.min_update_interval_ms > high.min_update_interval_ms);
        assert_eq!("HIGH".parse::<QualityTier>(), Ok(QualityTier::High));
        assert!("ultra".parse::<QualityTier>().is_err());
    }

    #[test]
    fn downgrades_once_on_the_thirtieth_slow_frame() {
        let mut q = QualityController::new(QualityTier::High, true);
        for _ in 0..29 {
            assert_eq!(q.record_frame(SLOW_MS), None);
        }
        assert_eq!(
            q.record_frame(SLOW_MS),
            Some(TierChange {
                from: QualityTier::High,
                to: QualityTier::Medium
            })
        );
        assert!(q.monitor().is_empty());
    }

    #[test]
    fn upgrade_after_downgrade_is_a_single_step() {
        let mut q = QualityController::new(QualityTier::High, true);
        for _ in 0..30 {
            q.record_frame(SLOW_MS);
        }
        assert_eq!(q.tier(), QualityTier::Medium);

        let changes: Vec<_> = (0..30).filter_map(|_| q.record_frame(FAST_MS)).collect();
        assert_eq!(
            changes,
            vec![TierChange {
                from: QualityTier::Medium,
                to: QualityTier::High
            }]
        );
        assert_eq!(q.tier(), QualityTier::High);
    }

    #[test]
    fn clamps_at_the_ends() {
        let mut q = QualityController::new(QualityTier::Low, true);
        for _ in 0..60 {
            assert_eq!(q.record_frame(SLOW_MS), None);
        }
        assert_eq!(q.tier(), QualityTier::Low);
    }

    #[test]
    fn disabling_auto_adjust_resets_samples_and_keeps_tier() {
        let mut q = QualityController::new(QualityTier::Medium, true);
        for _ in 0..20 {
            q.record_frame(SLOW_MS);
        }
        q.set_auto_adjust(false);
        assert!(q.monitor().is_empty());
        assert_eq!(q.tier(), QualityTier::Medium);
        for _ in 0..40 {
            assert_eq!(q.record_frame(SLOW_MS), None);
        }
        assert_eq!(q.tier(), QualityTier::Medium);
    }

    #[test]
    fn explicit_tier_change_reports_only_real_changes() {
        let mut q = QualityController::new(QualityTier::Medium, false);
        assert_eq!(q.set_tier(QualityTier::Medium), None);
        assert!(q.set_tier(QualityTier::Low).is_some());
        assert_eq!(q.tier(), QualityTier::Low);
    }
}
