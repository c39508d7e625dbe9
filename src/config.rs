use std::env;
use std::time::Duration;

#[derive(Clone)]
pub struct ServerConfig {
    pub ws_port: u16,
    pub status_port: u16,
    pub max_frame_size: usize,
    pub max_viewers_per_room: usize,
    pub viewer_queue_capacity: usize,
    pub quality: QualityConfig,
    pub adaptation: AdaptationConfig,
    pub admission: AdmissionConfig,
}

#[derive(Clone)]
pub struct QualityConfig {
    /// Interval between latency probes on each connection.
    pub probe_interval: Duration,
    /// A probe unanswered for this long counts as a missed probe.
    pub probe_timeout: Duration,
    /// Latency recorded for a missed probe, in milliseconds.
    pub missed_probe_penalty_ms: f64,
    /// Capacity of the per-connection RTT ring buffer.
    pub ring_size: usize,
    /// Below this many samples the connection reports `Good` optimistically.
    pub min_samples: usize,
    pub excellent_latency_ms: f64,
    pub excellent_jitter_ms: f64,
    pub good_latency_ms: f64,
    pub fair_latency_ms: f64,
    /// Fraction of connections at Poor/Fair that drags the dominant level down.
    pub degraded_fraction: f64,
}

#[derive(Clone)]
pub struct AdaptationConfig {
    pub enabled: bool,
    pub interval: Duration,
    /// Consecutive assessment cycles a new level must hold before a
    /// reconfiguration command is issued.
    pub stability_threshold: u32,
    pub min_bitrate_bps: u32,
    pub max_bitrate_bps: u32,
    pub min_frame_rate_fps: u32,
    pub max_frame_rate_fps: u32,
}

#[derive(Clone)]
pub struct AdmissionConfig {
    pub rate_limit_window: Duration,
    pub rate_limit_max_actions: u32,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self {
            ws_port: env_or("WS_PORT", 8080),
            status_port: env_or("STATUS_PORT", 8081),
            max_frame_size: env_or("MAX_FRAME_SIZE", 10 * 1024 * 1024),
            max_viewers_per_room: env_or("MAX_VIEWERS_PER_ROOM", 100),
            viewer_queue_capacity: env_or("VIEWER_QUEUE_CAPACITY", 16),
            quality: QualityConfig {
                probe_interval: Duration::from_secs(env_or("PROBE_INTERVAL_SECS", 3)),
                probe_timeout: Duration::from_secs(env_or("PROBE_TIMEOUT_SECS", 10)),
                missed_probe_penalty_ms: env_or("MISSED_PROBE_PENALTY_MS", 1_000.0),
                ring_size: env_or("LATENCY_RING_SIZE", 20),
                min_samples: env_or("MIN_QUALITY_SAMPLES", 3),
                excellent_latency_ms: env_or("EXCELLENT_LATENCY_MS", 50.0),
                excellent_jitter_ms: env_or("EXCELLENT_JITTER_MS", 10.0),
                good_latency_ms: env_or("GOOD_LATENCY_MS", 150.0),
                fair_latency_ms: env_or("FAIR_LATENCY_MS", 300.0),
                degraded_fraction: env_or("DEGRADED_FRACTION", 0.25),
            },
            adaptation: AdaptationConfig {
                enabled: env_or("ADAPTATION_ENABLED", true),
                interval: Duration::from_secs(env_or("ADAPTATION_INTERVAL_SECS", 10)),
                stability_threshold: env_or("ADAPTATION_STABILITY_THRESHOLD", 3),
                min_bitrate_bps: env_or("MIN_BITRATE_BPS", 250_000),
                max_bitrate_bps: env_or("MAX_BITRATE_BPS", 8_000_000),
                min_frame_rate_fps: env_or("MIN_FRAME_RATE_FPS", 10),
                max_frame_rate_fps: env_or("MAX_FRAME_RATE_FPS", 60),
            },
            admission: AdmissionConfig {
                rate_limit_window: Duration::from_secs(env_or("RATE_LIMIT_WINDOW_SECS", 60)),
                rate_limit_max_actions: env_or("RATE_LIMIT_MAX_ACTIONS", 10),
            },
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ws_port: 8080,
            status_port: 8081,
            max_frame_size: 10 * 1024 * 1024,
            max_viewers_per_room: 100,
            viewer_queue_capacity: 16,
            quality: QualityConfig::default(),
            adaptation: AdaptationConfig::default(),
            admission: AdmissionConfig::default(),
        }
    }
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(3),
            probe_timeout: Duration::from_secs(10),
            missed_probe_penalty_ms: 1_000.0,
            ring_size: 20,
            min_samples: 3,
            excellent_latency_ms: 50.0,
            excellent_jitter_ms: 10.0,
            good_latency_ms: 150.0,
            fair_latency_ms: 300.0,
            degraded_fraction: 0.25,
        }
    }
}

impl Default for AdaptationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(10),
            stability_threshold: 3,
            min_bitrate_bps: 250_000,
            max_bitrate_bps: 8_000_000,
            min_frame_rate_fps: 10,
            max_frame_rate_fps: 60,
        }
    }
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            rate_limit_window: Duration::from_secs(60),
            rate_limit_max_actions: 10,
        }
    }
}
