//! The prediction settlement engine.
//!
//! `monitor` drives the loop, `resolver` gathers evidence, `payout` turns
//! evidence and wagers into point deltas, `automation` creates the periodic
//! club predictions.

pub mod automation;
pub mod monitor;
pub mod payout;
pub mod resolver;

pub use monitor::{settle_one, MonitorConfig, PredictionMonitor, SettleOutcome, TickSummary};
pub use resolver::{resolve, Resolution};
