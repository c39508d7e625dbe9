use crate::config::QualityConfig;
use crate::types::{ConnectionId, QualityLevel};
use chrono::{DateTime, Utc};
use log::debug;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Rolling latency history and classification for one connection.
pub struct ConnectionQuality {
    samples: VecDeque<f64>,
    ring_size: usize,
    pub level: QualityLevel,
    pub reason: String,
    pub avg_latency_ms: f64,
    pub jitter_ms: f64,
    pub last_assessed_at: DateTime<Utc>,
    pub assessment_count: u64,
    pub missed_probes: u32,
}

impl ConnectionQuality {
    fn new(ring_size: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(ring_size),
            ring_size,
            level: QualityLevel::Good,
            reason: "insufficient data".to_string(),
            avg_latency_ms: 0.0,
            jitter_ms: 0.0,
            last_assessed_at: Utc::now(),
            assessment_count: 0,
            missed_probes: 0,
        }
    }

    fn record(&mut self, latency_ms: f64, config: &QualityConfig) {
        if self.samples.len() == self.ring_size {
            self.samples.pop_front();
        }
        self.samples.push_back(latency_ms);
        self.assess(config);
    }

    fn assess(&mut self, config: &QualityConfig) {
        self.last_assessed_at = Utc::now();
        self.assessment_count += 1;

        if self.samples.len() < config.min_samples {
            // New joins start optimistic rather than punished.
            self.level = QualityLevel::Good;
            self.reason = format!("insufficient data ({} samples)", self.samples.len());
            return;
        }

        let avg = self.samples.iter().sum::<f64>() / self.samples.len() as f64;
        // Jitter as mean absolute deviation between consecutive samples.
        let jitter = if self.samples.len() < 2 {
            0.0
        } else {
            self.samples
                .iter()
                .zip(self.samples.iter().skip(1))
                .map(|(a, b)| (b - a).abs())
                .sum::<f64>()
                / (self.samples.len() - 1) as f64
        };
        self.avg_latency_ms = avg;
        self.jitter_ms = jitter;

        // Boundaries are inclusive-below: strictly under the threshold
        // qualifies for the better tier.
        let (level, reason) = if avg < config.excellent_latency_ms
            && jitter < config.excellent_jitter_ms
        {
            (
                QualityLevel::Excellent,
                format!("avg {:.1}ms, jitter {:.1}ms", avg, jitter),
            )
        } else if avg < config.good_latency_ms {
            (QualityLevel::Good, format!("avg {:.1}ms", avg))
        } else if avg < config.fair_latency_ms {
            (QualityLevel::Fair, format!("avg {:.1}ms", avg))
        } else {
            (QualityLevel::Poor, format!("avg {:.1}ms", avg))
        };
        self.level = level;
        self.reason = reason;
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }
}

/// Per-connection quality snapshot for the status surface.
#[derive(Debug, Clone, serde::Serialize)]
pub struct QualityReport {
    pub connection_id: ConnectionId,
    pub level: QualityLevel,
    pub reason: String,
    pub avg_latency_ms: f64,
    pub jitter_ms: f64,
    pub assessment_count: u64,
}

/// Tracks every active connection's latency history. Each connection's ring
/// is only written by that connection's own probe handling, so writes never
/// contend across connections in practice; the map lock is held per call.
pub struct QualitySampler {
    config: QualityConfig,
    connections: RwLock<HashMap<ConnectionId, ConnectionQuality>>,
}

impl QualitySampler {
    pub fn new(config: QualityConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            connections: RwLock::new(HashMap::new()),
        })
    }

    pub async fn register(&self, conn_id: &str) {
        self.connections
            .write()
            .await
            .insert(conn_id.to_string(), ConnectionQuality::new(self.config.ring_size));
    }

    pub async fn unregister(&self, conn_id: &str) {
        self.connections.write().await.remove(conn_id);
    }

    /// Appends one round-trip measurement and re-classifies the connection.
    pub async fn record_sample(&self, conn_id: &str, latency_ms: f64) {
        let mut connections = self.connections.write().await;
        if let Some(conn) = connections.get_mut(conn_id) {
            conn.missed_probes = 0;
            conn.record(latency_ms, &self.config);
            debug!(
                "Quality sample for {}: {:.1}ms -> {} ({})",
                conn_id, latency_ms, conn.level, conn.reason
            );
        }
    }

    /// A probe that never came back counts as a high-latency sample rather
    /// than being ignored, so silent connections degrade instead of
    /// coasting on stale history.
    pub async fn record_missed_probe(&self, conn_id: &str) {
        let penalty = self.config.missed_probe_penalty_ms;
        let mut connections = self.connections.write().await;
        if let Some(conn) = connections.get_mut(conn_id) {
            conn.missed_probes += 1;
            conn.record(penalty, &self.config);
            conn.reason = format!("{} missed probes", conn.missed_probes);
        }
    }

    pub async fn level_of(&self, conn_id: &str) -> Option<QualityLevel> {
        self.connections.read().await.get(conn_id).map(|c| c.level)
    }

    /// Levels of all active connections, for aggregation.
    pub async fn levels(&self) -> Vec<QualityLevel> {
        self.connections
            .read()
            .await
            .values()
            .map(|c| c.level)
            .collect()
    }

    pub async fn reports(&self) -> Vec<QualityReport> {
        self.connections
            .read()
            .await
            .iter()
            .map(|(id, c)| QualityReport {
                connection_id: id.clone(),
                level: c.level,
                reason: c.reason.clone(),
                avg_latency_ms: c.avg_latency_ms,
                jitter_ms: c.jitter_ms,
                assessment_count: c.assessment_count,
            })
            .collect()
    }

    pub fn config(&self) -> &QualityConfig {
        &self.config
    }
}
