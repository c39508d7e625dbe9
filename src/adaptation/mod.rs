//! Closed-loop bitrate/framerate controller. Reads the aggregator's summary
//! on a fixed period and, once a level change proves stable, issues one
//! reconfiguration command toward the frame producer.

use crate::config::AdaptationConfig;
use crate::quality::{QualityAggregator, QualitySummary};
use crate::signaling::connection::ConnectionRegistry;
use crate::signaling::messages::ControlMessage;
use crate::types::{QualityLevel, StreamingParameters};
use crate::utils::{Error, Result};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;

/// External frame producer boundary. Commands are fire-and-forget; the
/// controller never verifies that the producer applied them.
#[async_trait::async_trait]
pub trait StreamProducer: Send + Sync {
    async fn reconfigure(&self, params: StreamingParameters) -> Result<()>;
}

/// Default producer: pushes a `reconfigure` control message to every
/// connected presenter, whose encoder is the actual producer.
pub struct PresenterReconfigurer {
    connections: Arc<ConnectionRegistry>,
}

impl PresenterReconfigurer {
    pub fn new(connections: Arc<ConnectionRegistry>) -> Arc<Self> {
        Arc::new(Self { connections })
    }
}

#[async_trait::async_trait]
impl StreamProducer for PresenterReconfigurer {
    async fn reconfigure(&self, params: StreamingParameters) -> Result<()> {
        let presenters = self.connections.presenters().await;
        if presenters.is_empty() {
            return Err(Error::Producer("no presenter connected".to_string()));
        }
        let message = ControlMessage::reconfigure(params);
        for presenter in presenters {
            let _ = presenter.send_control(&message);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ControllerState {
    Uninitialized,
    Running,
    Disabled,
    Stopped,
}

struct ControllerInner {
    state: ControllerState,
    last_applied_level: Option<QualityLevel>,
    applied_params: Option<StreamingParameters>,
    pending_level: Option<QualityLevel>,
    consecutive_agreement: u32,
    last_change_at: Option<DateTime<Utc>>,
    adaptation_count: u64,
}

/// Snapshot of the controller for the status surface.
#[derive(Debug, Clone, Serialize)]
pub struct AdaptationStatus {
    pub state: ControllerState,
    pub last_applied_level: Option<QualityLevel>,
    pub applied_params: Option<StreamingParameters>,
    pub pending_level: Option<QualityLevel>,
    pub consecutive_agreement: u32,
    pub last_change_at: Option<DateTime<Utc>>,
    pub adaptation_count: u64,
}

pub struct AdaptiveController {
    config: AdaptationConfig,
    aggregator: Arc<QualityAggregator>,
    producer: Arc<dyn StreamProducer>,
    inner: Mutex<ControllerInner>,
}

impl AdaptiveController {
    pub fn new(
        config: AdaptationConfig,
        aggregator: Arc<QualityAggregator>,
        producer: Arc<dyn StreamProducer>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            aggregator,
            producer,
            inner: Mutex::new(ControllerInner {
                state: ControllerState::Uninitialized,
                last_applied_level: None,
                applied_params: None,
                pending_level: None,
                consecutive_agreement: 0,
                last_change_at: None,
                adaptation_count: 0,
            }),
        })
    }

    /// Periodic control loop. Runs until `stop()`.
    pub async fn run(self: Arc<Self>) {
        {
            let mut inner = self.inner.lock();
            inner.state = if self.config.enabled {
                ControllerState::Running
            } else {
                ControllerState::Disabled
            };
        }
        info!(
            "Adaptive controller started (period {:?}, stability threshold {})",
            self.config.interval, self.config.stability_threshold
        );
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if self.inner.lock().state == ControllerState::Stopped {
                return;
            }
            self.assess_once().await;
        }
    }

    pub async fn assess_once(&self) {
        let summary = self.aggregator.summarize().await;
        self.assess_summary(summary).await;
    }

    /// One assessment cycle against a summary. Sampling continues while
    /// disabled, but no command leaves the controller.
    pub async fn assess_summary(&self, summary: QualitySummary) {
        let command = {
            let mut inner = self.inner.lock();
            self.decide(&mut inner, &summary)
        };
        if let Some(params) = command {
            self.issue(params).await;
        }
    }

    /// Hysteresis gate: a non-current dominant level must hold for
    /// `stability_threshold` consecutive cycles before anything is applied,
    /// so transient spikes never cause oscillation.
    fn decide(
        &self,
        inner: &mut ControllerInner,
        summary: &QualitySummary,
    ) -> Option<StreamingParameters> {
        if inner.state != ControllerState::Running {
            return None;
        }
        let dominant = summary.dominant_level;
        if inner.last_applied_level == Some(dominant) {
            // Agreement with what is already applied resets any pending change.
            inner.pending_level = None;
            inner.consecutive_agreement = 0;
            return None;
        }
        if inner.pending_level == Some(dominant) {
            inner.consecutive_agreement += 1;
        } else {
            inner.pending_level = Some(dominant);
            inner.consecutive_agreement = 1;
        }
        debug!(
            "Dominant level {} observed {} of {} cycles",
            dominant, inner.consecutive_agreement, self.config.stability_threshold
        );
        if inner.consecutive_agreement < self.config.stability_threshold {
            return None;
        }
        inner.pending_level = None;
        inner.consecutive_agreement = 0;
        if !self
            .aggregator
            .should_adapt(summary, inner.applied_params.as_ref())
        {
            // Stable but within noise of the active parameters: record the
            // level, skip the command.
            inner.last_applied_level = Some(dominant);
            return None;
        }
        inner.last_applied_level = Some(dominant);
        inner.applied_params = Some(summary.recommended);
        inner.last_change_at = Some(Utc::now());
        inner.adaptation_count += 1;
        Some(summary.recommended)
    }

    /// Bypasses the stability gate and applies the current recommendation
    /// immediately. A no-op (reported, not fatal) when the controller is
    /// not running.
    pub async fn force_adaptation(&self) -> Result<bool> {
        let summary = self.aggregator.summarize().await;
        let command = {
            let mut inner = self.inner.lock();
            match inner.state {
                ControllerState::Running => {}
                state => {
                    warn!("Forced adaptation ignored: controller is {:?}", state);
                    return Ok(false);
                }
            }
            inner.pending_level = None;
            inner.consecutive_agreement = 0;
            inner.last_applied_level = Some(summary.dominant_level);
            inner.applied_params = Some(summary.recommended);
            inner.last_change_at = Some(Utc::now());
            inner.adaptation_count += 1;
            summary.recommended
        };
        info!("Forced adaptation to {}", summary.dominant_level);
        self.issue(command).await;
        Ok(true)
    }

    /// Disabling keeps sampling alive but stops reconfiguration commands.
    pub fn set_enabled(&self, enabled: bool) {
        let mut inner = self.inner.lock();
        inner.state = match (inner.state, enabled) {
            (ControllerState::Running, false) => {
                info!("Adaptive controller disabled");
                ControllerState::Disabled
            }
            (ControllerState::Disabled, true) => {
                info!("Adaptive controller re-enabled");
                // Stale agreement from before the pause must not count.
                inner.pending_level = None;
                inner.consecutive_agreement = 0;
                ControllerState::Running
            }
            (state, _) => state,
        };
    }

    pub fn stop(&self) {
        self.inner.lock().state = ControllerState::Stopped;
    }

    pub fn status(&self) -> AdaptationStatus {
        let inner = self.inner.lock();
        AdaptationStatus {
            state: inner.state,
            last_applied_level: inner.last_applied_level,
            applied_params: inner.applied_params,
            pending_level: inner.pending_level,
            consecutive_agreement: inner.consecutive_agreement,
            last_change_at: inner.last_change_at,
            adaptation_count: inner.adaptation_count,
        }
    }

    /// Producer failures are logged and the loop carries on next cycle.
    async fn issue(&self, params: StreamingParameters) {
        info!(
            "Reconfiguring producer: {} bps, {} fps, scale {:.2}",
            params.bitrate_bps, params.frame_rate_fps, params.resolution_scale
        );
        metrics::increment_counter!("adaptations_issued");
        if let Err(e) = self.producer.reconfigure(params).await {
            warn!("Producer reconfiguration failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QualityConfig;
    use crate::quality::QualitySampler;
    use QualityLevel::*;

    struct RecordingProducer {
        calls: Mutex<Vec<StreamingParameters>>,
    }

    impl RecordingProducer {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
            })
        }

        fn call_count(&self) -> usize {
            self.calls.lock().len()
        }
    }

    #[async_trait::async_trait]
    impl StreamProducer for RecordingProducer {
        async fn reconfigure(&self, params: StreamingParameters) -> Result<()> {
            self.calls.lock().push(params);
            Ok(())
        }
    }

    fn controller(
        stability_threshold: u32,
    ) -> (Arc<AdaptiveController>, Arc<RecordingProducer>, Arc<QualityAggregator>) {
        let config = AdaptationConfig {
            stability_threshold,
            ..AdaptationConfig::default()
        };
        let sampler = QualitySampler::new(QualityConfig::default());
        let aggregator = QualityAggregator::new(sampler, config.clone());
        let producer = RecordingProducer::new();
        let controller = AdaptiveController::new(config, aggregator.clone(), producer.clone());
        controller.inner.lock().state = ControllerState::Running;
        (controller, producer, aggregator)
    }

    async fn cycle(
        controller: &AdaptiveController,
        aggregator: &QualityAggregator,
        levels: &[QualityLevel],
    ) {
        let summary = aggregator.summarize_levels(levels);
        controller.assess_summary(summary).await;
    }

    #[tokio::test]
    async fn transient_spike_issues_no_command() {
        let (controller, producer, aggregator) = controller(3);
        // Establish a baseline level first.
        for _ in 0..3 {
            cycle(&controller, &aggregator, &[Good, Good]).await;
        }
        assert_eq!(producer.call_count(), 1);

        // A single degraded cycle that reverts before the threshold.
        cycle(&controller, &aggregator, &[Poor, Poor]).await;
        cycle(&controller, &aggregator, &[Good, Good]).await;
        cycle(&controller, &aggregator, &[Good, Good]).await;
        assert_eq!(producer.call_count(), 1);
    }

    #[tokio::test]
    async fn stable_change_issues_exactly_one_command() {
        let (controller, producer, aggregator) = controller(3);
        for _ in 0..3 {
            cycle(&controller, &aggregator, &[Good, Good]).await;
        }
        assert_eq!(producer.call_count(), 1);

        for i in 0..3 {
            cycle(&controller, &aggregator, &[Poor, Poor]).await;
            // The command fires on the threshold cycle, not before.
            assert_eq!(producer.call_count(), if i < 2 { 1 } else { 2 });
        }
        // Continued agreement does not re-issue.
        cycle(&controller, &aggregator, &[Poor, Poor]).await;
        assert_eq!(producer.call_count(), 2);

        let issued = producer.calls.lock()[1];
        assert_eq!(issued, aggregator.summarize_levels(&[Poor, Poor]).recommended);
        assert_eq!(controller.status().adaptation_count, 2);
    }

    #[tokio::test]
    async fn interleaved_levels_restart_the_agreement_count() {
        let (controller, producer, aggregator) = controller(3);
        for _ in 0..3 {
            cycle(&controller, &aggregator, &[Good]).await;
        }
        // Poor, Fair, Poor, Fair never accumulates three agreeing cycles.
        cycle(&controller, &aggregator, &[Poor]).await;
        cycle(&controller, &aggregator, &[Fair, Fair, Fair, Excellent]).await;
        cycle(&controller, &aggregator, &[Poor]).await;
        cycle(&controller, &aggregator, &[Fair, Fair, Fair, Excellent]).await;
        assert_eq!(producer.call_count(), 1);
    }

    #[tokio::test]
    async fn disabled_controller_keeps_quiet() {
        let (controller, producer, aggregator) = controller(1);
        controller.set_enabled(false);
        for _ in 0..5 {
            cycle(&controller, &aggregator, &[Poor, Poor]).await;
        }
        assert_eq!(producer.call_count(), 0);
        assert_eq!(controller.status().state, ControllerState::Disabled);

        // Re-enabling resumes command flow.
        controller.set_enabled(true);
        cycle(&controller, &aggregator, &[Poor, Poor]).await;
        assert_eq!(producer.call_count(), 1);
    }

    #[tokio::test]
    async fn force_adaptation_bypasses_stability() {
        let (controller, producer, _aggregator) = controller(5);
        assert!(controller.force_adaptation().await.unwrap());
        assert_eq!(producer.call_count(), 1);
        assert_eq!(controller.status().adaptation_count, 1);
    }

    #[tokio::test]
    async fn force_adaptation_is_a_reported_noop_when_unavailable() {
        let (controller, producer, _aggregator) = controller(3);
        controller.set_enabled(false);
        assert!(!controller.force_adaptation().await.unwrap());

        controller.inner.lock().state = ControllerState::Uninitialized;
        assert!(!controller.force_adaptation().await.unwrap());

        controller.stop();
        assert!(!controller.force_adaptation().await.unwrap());
        assert_eq!(producer.call_count(), 0);
    }

    #[tokio::test]
    async fn producer_failure_does_not_poison_the_loop() {
        struct FailingProducer;
        #[async_trait::async_trait]
        impl StreamProducer for FailingProducer {
            async fn reconfigure(&self, _params: StreamingParameters) -> Result<()> {
                Err(Error::Producer("encoder offline".to_string()))
            }
        }
        let config = AdaptationConfig {
            stability_threshold: 1,
            ..AdaptationConfig::default()
        };
        let sampler = QualitySampler::new(QualityConfig::default());
        let aggregator = QualityAggregator::new(sampler, config.clone());
        let controller =
            AdaptiveController::new(config, aggregator.clone(), Arc::new(FailingProducer));
        controller.inner.lock().state = ControllerState::Running;

        cycle(&controller, &aggregator, &[Poor]).await;
        // The failed command still counts as applied state; the loop survives.
        assert_eq!(controller.status().adaptation_count, 1);
        cycle(&controller, &aggregator, &[Poor]).await;
        assert_eq!(controller.status().adaptation_count, 1);
    }
}
