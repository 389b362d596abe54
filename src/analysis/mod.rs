//! Modality analysis.
//!
//! Per-item analyzers, media validation and the concurrent batch runner.

pub mod aggregator;
pub mod analyzer;
pub mod media;

pub use aggregator::analyze_batch;
pub use analyzer::{Base64Analyzer, ModalityAnalyzer};
