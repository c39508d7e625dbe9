// src/types.rs
use serde::{Deserialize, Serialize};

pub type ConnectionId = String;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Presenter,
    Viewer,
}

/// Discrete network quality classification, ordered worst to best so that
/// `Poor < Fair < Good < Excellent` holds under the derived `Ord`.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum QualityLevel {
    Poor,
    Fair,
    Good,
    Excellent,
}

impl QualityLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            QualityLevel::Poor => "poor",
            QualityLevel::Fair => "fair",
            QualityLevel::Good => "good",
            QualityLevel::Excellent => "excellent",
        }
    }
}

impl std::fmt::Display for QualityLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Encoder parameters recommended for a quality level. All viewers share
/// one presenter-encoded stream, so these are global, not per-viewer.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct StreamingParameters {
    pub bitrate_bps: u32,
    pub frame_rate_fps: u32,
    pub resolution_scale: f32,
}

impl StreamingParameters {
    /// Fixed lookup table from quality level to parameters. Kept as a pure
    /// function so the adaptation math stays auditable in isolation.
    pub fn for_level(level: QualityLevel) -> Self {
        match level {
            QualityLevel::Excellent => Self {
                bitrate_bps: 4_000_000,
                frame_rate_fps: 30,
                resolution_scale: 1.0,
            },
            QualityLevel::Good => Self {
                bitrate_bps: 2_500_000,
                frame_rate_fps: 30,
                resolution_scale: 1.0,
            },
            QualityLevel::Fair => Self {
                bitrate_bps: 1_200_000,
                frame_rate_fps: 24,
                resolution_scale: 0.75,
            },
            QualityLevel::Poor => Self {
                bitrate_bps: 500_000,
                frame_rate_fps: 15,
                resolution_scale: 0.5,
            },
        }
    }

    pub fn clamped(mut self, min_bitrate: u32, max_bitrate: u32, min_fps: u32, max_fps: u32) -> Self {
        self.bitrate_bps = self.bitrate_bps.clamp(min_bitrate, max_bitrate);
        self.frame_rate_fps = self.frame_rate_fps.clamp(min_fps, max_fps);
        self.resolution_scale = self.resolution_scale.clamp(0.5, 1.0);
        self
    }

    /// Whether switching from `self` to `other` is a meaningful change.
    /// Guards the controller against float/int noise re-triggering commands.
    pub fn differs_from(&self, other: &StreamingParameters) -> bool {
        let bitrate_delta = (self.bitrate_bps as i64 - other.bitrate_bps as i64).unsigned_abs();
        bitrate_delta * 20 > self.bitrate_bps as u64
            || self.frame_rate_fps != other.frame_rate_fps
            || (self.resolution_scale - other.resolution_scale).abs() > 0.05
    }
}
