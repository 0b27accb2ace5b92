//! The settlement loop.
//!
//! A fixed-interval tick scans for expired, unprocessed predictions and
//! runs the pipeline on each. The pipeline itself (`settle_one`) is a free
//! function so tests drive it directly, without the scheduler.
//!
//! Everything up to `Db::commit_settlement` is recomputed from current
//! wager/result state, so a crash or error anywhere before the commit just
//! means the prediction is picked up again next tick.

use crate::models::{PointDelta, Prediction, PredictionKind};
use crate::nadeo::RecordsProvider;
use crate::settlement::payout::{
    guess_payouts, raffle_payouts, versus_payouts, void_refunds, winning_result,
};
use crate::settlement::resolver::{resolve, Resolution};
use crate::store::Db;
use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::interval;
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub poll_interval: Duration,
    /// Fixed seed makes raffle draws reproducible; None seeds from entropy.
    pub raffle_seed: Option<u64>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            raffle_seed: None,
        }
    }
}

/// What happened to one prediction during a tick.
#[derive(Debug)]
pub enum SettleOutcome {
    /// Deltas applied and the processed flag committed.
    Settled { deltas: Vec<PointDelta> },
    /// No usable evidence existed; stakes were refunded.
    Voided { refunds: usize },
    /// Left unprocessed for the next tick.
    Pending { reason: String },
    /// Another pass already committed this prediction.
    AlreadyProcessed,
}

/// Per-tick counters, for the log line.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickSummary {
    pub settled: usize,
    pub voided: usize,
    pub pending: usize,
    pub failed: usize,
}

/// The settlement scheduler. Constructed once at startup with its
/// dependencies injected; owns the raffle RNG.
pub struct PredictionMonitor {
    db: Db,
    provider: Arc<dyn RecordsProvider>,
    rng: Arc<Mutex<ChaCha8Rng>>,
    config: MonitorConfig,
}

impl PredictionMonitor {
    pub fn new(db: Db, provider: Arc<dyn RecordsProvider>, config: MonitorConfig) -> Self {
        let rng = match config.raffle_seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };
        Self {
            db,
            provider,
            rng: Arc::new(Mutex::new(rng)),
            config,
        }
    }

    /// Run the loop until the task is aborted.
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                interval_secs = self.config.poll_interval.as_secs(),
                "⏱️ settlement monitor started"
            );
            let mut ticker = interval(self.config.poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                match self.run_tick(Utc::now()).await {
                    Ok(summary) if summary != TickSummary::default() => {
                        info!(
                            settled = summary.settled,
                            voided = summary.voided,
                            pending = summary.pending,
                            failed = summary.failed,
                            "tick complete"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => {
                        // A broken scan must not kill the loop.
                        error!("settlement tick failed: {e:#}");
                        metrics::counter!("settlement_tick_errors_total", 1);
                    }
                }
            }
        })
    }

    /// One scan over the due predictions, settling independent predictions
    /// concurrently. Same-prediction and same-balance effects serialize in
    /// the settlement commit.
    pub async fn run_tick(&self, now: DateTime<Utc>) -> Result<TickSummary> {
        let due = self.db.due_predictions(now).await?;
        if due.is_empty() {
            return Ok(TickSummary::default());
        }

        let mut tasks: JoinSet<(i64, PredictionKind, Result<SettleOutcome>)> = JoinSet::new();
        for prediction in due {
            let db = self.db.clone();
            let provider = self.provider.clone();
            let rng = self.rng.clone();
            tasks.spawn(async move {
                let id = prediction.id;
                let kind = prediction.kind;
                let outcome = settle_one(&db, provider.as_ref(), &rng, &prediction, now).await;
                (id, kind, outcome)
            });
        }

        let mut summary = TickSummary::default();
        while let Some(joined) = tasks.join_next().await {
            let (id, kind, outcome) = match joined {
                Ok(triple) => triple,
                Err(join_err) => {
                    summary.failed += 1;
                    warn!("settlement task aborted: {join_err}");
                    continue;
                }
            };
            match outcome {
                Ok(SettleOutcome::Settled { deltas }) => {
                    summary.settled += 1;
                    metrics::counter!("predictions_settled_total", 1);
                    info!(
                        prediction_id = id,
                        kind = kind.as_str(),
                        deltas = deltas.len(),
                        "✅ prediction settled"
                    );
                }
                Ok(SettleOutcome::Voided { refunds }) => {
                    summary.voided += 1;
                    metrics::counter!("predictions_voided_total", 1);
                    info!(prediction_id = id, refunds, "↩️ prediction voided, stakes refunded");
                }
                Ok(SettleOutcome::Pending { reason }) => {
                    summary.pending += 1;
                    metrics::counter!("predictions_pending_total", 1);
                    info!(prediction_id = id, reason, "prediction left for next tick");
                }
                Ok(SettleOutcome::AlreadyProcessed) => {
                    // Exactly-once guard fired; nothing was applied.
                }
                Err(e) => {
                    summary.failed += 1;
                    metrics::counter!("settlement_errors_total", 1);
                    warn!(prediction_id = id, "settlement failed, will retry: {e:#}");
                }
            }
        }
        Ok(summary)
    }
}

/// Settle a single prediction: resolve evidence, compute deltas, commit.
pub async fn settle_one(
    db: &Db,
    provider: &dyn RecordsProvider,
    rng: &Mutex<ChaCha8Rng>,
    prediction: &Prediction,
    now: DateTime<Utc>,
) -> Result<SettleOutcome> {
    if prediction.processed {
        return Ok(SettleOutcome::AlreadyProcessed);
    }

    let wagers = db.wagers_for(prediction.id).await?;

    // Raffles need no race evidence: draw and pay.
    if prediction.kind == PredictionKind::Raffle {
        let deltas = {
            let mut rng = rng.lock();
            raffle_payouts(prediction, &wagers, &mut *rng)
        };
        return commit(db, prediction, deltas, false).await;
    }

    let protagonists = db.protagonist_players(prediction.id).await?;
    match resolve(db, provider, prediction, &protagonists, now).await? {
        Resolution::Pending(reason) => Ok(SettleOutcome::Pending { reason }),
        Resolution::Void => {
            let refunds = void_refunds(&wagers);
            commit(db, prediction, refunds, true).await
        }
        Resolution::Resolved(results) => {
            let deltas = match prediction.kind {
                PredictionKind::Versus => versus_payouts(prediction, &wagers, &results),
                PredictionKind::Guess => {
                    // The fastest qualifying result is the guessing target;
                    // guess predictions normally carry one protagonist.
                    match winning_result(&results) {
                        Some(target) => guess_payouts(prediction, &wagers, target),
                        None => Vec::new(),
                    }
                }
                PredictionKind::Raffle => unreachable!("raffles settle without resolution"),
            };
            commit(db, prediction, deltas, false).await
        }
    }
}

async fn commit(
    db: &Db,
    prediction: &Prediction,
    deltas: Vec<PointDelta>,
    voided: bool,
) -> Result<SettleOutcome> {
    let applied = db.commit_settlement(prediction.id, &deltas).await?;
    if !applied {
        return Ok(SettleOutcome::AlreadyProcessed);
    }
    if voided {
        Ok(SettleOutcome::Voided {
            refunds: deltas.len(),
        })
    } else {
        Ok(SettleOutcome::Settled { deltas })
    }
}
