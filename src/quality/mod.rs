pub mod aggregator;
pub mod sampler;

pub use aggregator::{QualityAggregator, QualitySummary};
pub use sampler::{QualityReport, QualitySampler};
