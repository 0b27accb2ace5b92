//! Periodic club predictions.
//!
//! Clubs can opt into a stream of automatically created versus predictions:
//! every `automated_frequency`, `automated_amount` predictions open on the
//! club's least-run tracks, with the whole member set as protagonists.

use crate::models::PredictionKind;
use crate::store::Db;
use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::time::Duration;
use tracing::{error, info};

/// Stake unit for auto-created predictions.
pub const AUTO_ENTRY_FEE: i64 = 10;

/// Create due automated predictions across all clubs. Returns how many
/// predictions were created.
pub async fn run_cycle(db: &Db, now: DateTime<Utc>) -> Result<usize> {
    let clubs = db.clubs_due_automation(now).await?;
    let mut created = 0;

    for club in clubs {
        let members = db.club_member_player_ids(club.id).await?;
        if members.len() < 2 {
            // A versus needs someone to race against; check again next cycle.
            db.mark_automated(club.id, now).await?;
            continue;
        }

        let tracks = db
            .least_run_tracks(club.id, club.automated_amount as usize)
            .await?;
        for track_id in &tracks {
            db.create_prediction(
                club.id,
                *track_id,
                PredictionKind::Versus,
                AUTO_ENTRY_FEE,
                now,
                now + ChronoDuration::seconds(club.automated_open_secs),
                now + ChronoDuration::seconds(club.automated_end_secs),
                &members,
            )
            .await?;
            db.bump_track_counter(*track_id, club.id).await?;
            created += 1;
        }
        db.mark_automated(club.id, now).await?;

        if !tracks.is_empty() {
            info!(
                club_id = club.id,
                predictions = tracks.len(),
                "🏁 automated predictions created"
            );
        }
    }

    Ok(created)
}

/// Check for due clubs on a fixed interval until the task is aborted.
pub fn spawn(db: Db, check_interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if let Err(e) = run_cycle(&db, Utc::now()).await {
                error!("automation cycle failed: {e:#}");
            }
        }
    })
}
