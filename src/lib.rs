//! Trackbet Backend Library
//!
//! Club predictions on racing-game track times: members stake points on an
//! outcome, and the settlement engine resolves each prediction exactly once
//! when its window elapses. Exposed as a library so the daemon binary and
//! the integration tests share one surface.

pub mod models;
pub mod nadeo;
pub mod settlement;
pub mod store;

pub use settlement::{PredictionMonitor, SettleOutcome};
pub use store::Db;
