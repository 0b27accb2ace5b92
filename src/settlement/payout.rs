//! Pure payout rules: wagers + resolved results -> point deltas.
//!
//! All arithmetic is integer; divisions floor. A bucket's total payout may
//! undershoot the nominal pool; the residue is burned, not redistributed.

use crate::models::{
    DeltaReason, PointDelta, Prediction, ProtagonistResult, Wager, BONUS_POOL_PCT, RAFFLE_OUTCOME,
};
use rand::Rng;
use std::collections::BTreeMap;

/// Bonus granted to a winning protagonist who improved during the event:
/// round(entry_fee * total_wagers * 5%), rounding half up.
pub fn bonus_pool(entry_fee: i64, total_wagers: i64) -> i64 {
    (entry_fee * total_wagers * BONUS_POOL_PCT + 50) / 100
}

/// The protagonist result that counts: fastest time, ties broken by earlier
/// ingestion, then lower player id.
pub fn winning_result<'a>(results: &'a [ProtagonistResult]) -> Option<&'a ProtagonistResult> {
    results
        .iter()
        .min_by_key(|r| (r.time_ms, r.ingested_at, r.player_id))
}

fn buckets(wagers: &[Wager]) -> BTreeMap<i64, Vec<&Wager>> {
    let mut map: BTreeMap<i64, Vec<&Wager>> = BTreeMap::new();
    for w in wagers {
        map.entry(w.outcome).or_default().push(w);
    }
    map
}

fn push_bonus(
    deltas: &mut Vec<PointDelta>,
    prediction: &Prediction,
    winner: &ProtagonistResult,
    total_wagers: i64,
) {
    // The record must have been *achieved* after the event opened; every
    // qualifying record is ingested after the window, so ingestion proves
    // nothing about improvement.
    if winner.achieved_at <= prediction.created_at {
        return;
    }
    let bonus = bonus_pool(prediction.entry_fee, total_wagers);
    if bonus > 0 {
        deltas.push(PointDelta {
            player_id: winner.player_id,
            amount: bonus,
            reason: DeltaReason::Bonus,
        });
    }
}

/// VERSUS: wagers back a protagonist; the fastest protagonist's backers
/// split the pool, `floor(total / N) * entry_fee` each.
pub fn versus_payouts(
    prediction: &Prediction,
    wagers: &[Wager],
    results: &[ProtagonistResult],
) -> Vec<PointDelta> {
    let Some(winner) = winning_result(results) else {
        return Vec::new();
    };
    let total_wagers = wagers.len() as i64;
    let mut deltas = Vec::new();

    let all = buckets(wagers);
    if let Some(bucket) = all.get(&winner.player_id) {
        let n = bucket.len() as i64;
        let per_wager = (total_wagers / n) * prediction.entry_fee;
        for w in bucket {
            deltas.push(PointDelta {
                player_id: w.player_id,
                amount: per_wager,
                reason: DeltaReason::Winnings,
            });
        }
    }
    // Nobody backing the winner degrades to "no payout"; the protagonist
    // bonus does not depend on the bucket.
    push_bonus(&mut deltas, prediction, winner, total_wagers);
    deltas
}

/// GUESS: wagers guess the protagonist's time; the closest guess wins.
/// Equidistant guesses break toward the lower numeric guess.
pub fn guess_payouts(
    prediction: &Prediction,
    wagers: &[Wager],
    target: &ProtagonistResult,
) -> Vec<PointDelta> {
    let total_wagers = wagers.len() as i64;
    let mut deltas = Vec::new();

    let all = buckets(wagers);
    // Keying on (distance, guess) makes the minimum unique: equidistant
    // guesses break toward the lower numeric guess.
    let winning = all.iter().min_by_key(|(guess, _)| {
        let g = **guess;
        ((g - target.time_ms).abs(), g)
    });
    if let Some((_, bucket)) = winning {
        let n = bucket.len() as i64;
        let per_wager = (prediction.entry_fee * total_wagers) / n;
        for w in bucket {
            deltas.push(PointDelta {
                player_id: w.player_id,
                amount: per_wager,
                reason: DeltaReason::Winnings,
            });
        }
    }
    push_bonus(&mut deltas, prediction, target, total_wagers);
    deltas
}

/// RAFFLE: one entry drawn uniformly; the prize is `entry_fee`, created
/// from outside the wager pool. Stakes are never redistributed.
pub fn raffle_payouts(
    prediction: &Prediction,
    wagers: &[Wager],
    rng: &mut impl Rng,
) -> Vec<PointDelta> {
    let entries: Vec<&Wager> = wagers
        .iter()
        .filter(|w| w.outcome == RAFFLE_OUTCOME)
        .collect();
    if entries.is_empty() {
        return Vec::new();
    }
    let drawn = entries[rng.gen_range(0..entries.len())];
    vec![PointDelta {
        player_id: drawn.player_id,
        amount: prediction.entry_fee,
        reason: DeltaReason::Prize,
    }]
}

/// Void path: every stake goes back to its player unchanged.
pub fn void_refunds(wagers: &[Wager]) -> Vec<PointDelta> {
    wagers
        .iter()
        .filter(|w| w.points > 0)
        .map(|w| PointDelta {
            player_id: w.player_id,
            amount: w.points,
            reason: DeltaReason::Refund,
        })
        .collect()
}
