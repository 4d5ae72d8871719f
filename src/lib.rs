//! Racing-rank
//!
//! Leakage-safe feature pipeline and pairwise ranking model for horse
//! racing: form parsing, point-in-time statistics, per-runner and
//! field-relative features, batched feature storage, a race-grouped
//! boosted-tree ranker and a softmax predictor for unraced fields.

pub mod cli;
pub mod config;
pub mod error;
pub mod features;
pub mod form;
pub mod parse;
pub mod pipeline;
pub mod predictor;
pub mod ranking;
pub mod stats;
pub mod storage;

pub use error::{RankError, Result};
