use super::sampler::QualitySampler;
use crate::config::AdaptationConfig;
use crate::types::{QualityLevel, StreamingParameters};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

/// Deployment-wide view of connection quality. Global rather than per room
/// because every viewer consumes the same presenter-encoded stream.
#[derive(Debug, Clone, Serialize)]
pub struct QualitySummary {
    pub connection_count: usize,
    pub dominant_level: QualityLevel,
    pub distribution: HashMap<QualityLevel, usize>,
    pub recommended: StreamingParameters,
}

pub struct QualityAggregator {
    sampler: Arc<QualitySampler>,
    degraded_fraction: f64,
    adaptation: AdaptationConfig,
}

impl QualityAggregator {
    pub fn new(sampler: Arc<QualitySampler>, adaptation: AdaptationConfig) -> Arc<Self> {
        let degraded_fraction = sampler.config().degraded_fraction;
        Arc::new(Self {
            sampler,
            degraded_fraction,
            adaptation,
        })
    }

    pub async fn summarize(&self) -> QualitySummary {
        let levels = self.sampler.levels().await;
        self.summarize_levels(&levels)
    }

    /// Pure aggregation over a set of levels, split out for direct testing.
    pub fn summarize_levels(&self, levels: &[QualityLevel]) -> QualitySummary {
        let mut distribution: HashMap<QualityLevel, usize> = HashMap::new();
        for level in levels {
            *distribution.entry(*level).or_insert(0) += 1;
        }
        let dominant_level = dominant(&distribution, levels.len(), self.degraded_fraction);
        let recommended = StreamingParameters::for_level(dominant_level).clamped(
            self.adaptation.min_bitrate_bps,
            self.adaptation.max_bitrate_bps,
            self.adaptation.min_frame_rate_fps,
            self.adaptation.max_frame_rate_fps,
        );
        QualitySummary {
            connection_count: levels.len(),
            dominant_level,
            distribution,
            recommended,
        }
    }

    /// True when the recommendation meaningfully differs from what is
    /// currently applied; `None` (nothing applied yet) always adapts.
    pub fn should_adapt(
        &self,
        summary: &QualitySummary,
        active: Option<&StreamingParameters>,
    ) -> bool {
        match active {
            Some(active) => active.differs_from(&summary.recommended),
            None => true,
        }
    }
}

/// The worst level held by a meaningful fraction of connections wins;
/// otherwise the mode, with ties going to the worse level.
fn dominant(
    distribution: &HashMap<QualityLevel, usize>,
    total: usize,
    degraded_fraction: f64,
) -> QualityLevel {
    if total == 0 {
        // No connections to measure: stay at the optimistic default.
        return QualityLevel::Good;
    }
    let poor = distribution.get(&QualityLevel::Poor).copied().unwrap_or(0);
    let fair = distribution.get(&QualityLevel::Fair).copied().unwrap_or(0);
    if (poor + fair) as f64 / total as f64 >= degraded_fraction {
        return if poor > 0 {
            QualityLevel::Poor
        } else {
            QualityLevel::Fair
        };
    }
    // Mode; iterate worst-first so a tie resolves to the worse level.
    let mut best = QualityLevel::Good;
    let mut best_count = 0;
    for level in [
        QualityLevel::Poor,
        QualityLevel::Fair,
        QualityLevel::Good,
        QualityLevel::Excellent,
    ] {
        let count = distribution.get(&level).copied().unwrap_or(0);
        if count > best_count {
            best = level;
            best_count = count;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QualityConfig;
    use crate::quality::sampler::QualitySampler;

    fn aggregator() -> Arc<QualityAggregator> {
        let sampler = QualitySampler::new(QualityConfig::default());
        QualityAggregator::new(sampler, AdaptationConfig::default())
    }

    use QualityLevel::*;

    #[test]
    fn degraded_fraction_drags_the_dominant_level_down() {
        let agg = aggregator();
        // 25% Fair among Excellent connections dominates.
        let summary = agg.summarize_levels(&[Excellent, Excellent, Excellent, Fair]);
        assert_eq!(summary.dominant_level, Fair);
        // Any Poor in the degraded share makes Poor dominant.
        let summary = agg.summarize_levels(&[Excellent, Excellent, Fair, Poor]);
        assert_eq!(summary.dominant_level, Poor);
    }

    #[test]
    fn healthy_majority_uses_the_mode() {
        let agg = aggregator();
        let summary = agg.summarize_levels(&[
            Excellent, Excellent, Excellent, Excellent, Excellent, Good, Good, Good, Fair,
        ]);
        // One Fair in nine is under the 25% threshold.
        assert_eq!(summary.dominant_level, Excellent);
    }

    #[test]
    fn empty_deployment_defaults_to_good() {
        let agg = aggregator();
        let summary = agg.summarize_levels(&[]);
        assert_eq!(summary.dominant_level, Good);
        assert_eq!(summary.connection_count, 0);
    }

    #[test]
    fn recommendation_tracks_the_dominant_level() {
        let agg = aggregator();
        let summary = agg.summarize_levels(&[Poor, Poor, Good]);
        assert_eq!(summary.dominant_level, Poor);
        assert_eq!(
            summary.recommended,
            StreamingParameters::for_level(Poor).clamped(250_000, 8_000_000, 10, 60)
        );
    }

    #[test]
    fn should_adapt_ignores_minor_drift() {
        let agg = aggregator();
        let summary = agg.summarize_levels(&[Good, Good, Good]);
        // Nothing applied yet: always adapt.
        assert!(agg.should_adapt(&summary, None));
        // Applied parameters equal to the recommendation: hold steady.
        let applied = summary.recommended;
        assert!(!agg.should_adapt(&summary, Some(&applied)));
        // A near-identical bitrate is not a meaningful change either.
        let mut close = applied;
        close.bitrate_bps = applied.bitrate_bps - applied.bitrate_bps / 50;
        assert!(!agg.should_adapt(&summary, Some(&close)));
        // A different level's parameters are.
        let far = StreamingParameters::for_level(Poor);
        assert!(agg.should_adapt(&summary, Some(&far)));
    }
}
