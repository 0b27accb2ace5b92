//! Evidence gathering for versus/guess predictions.
//!
//! A result only counts if it was ingested after the prediction window
//! closed; anything older could be a stale pre-bet time. When the cache
//! comes up short the resolver makes one batched fetch for the whole
//! protagonist set, stores the returned times, and looks again.

use crate::models::{Player, Prediction, ProtagonistResult};
use crate::nadeo::RecordsProvider;
use crate::store::Db;
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::{debug, warn};
use uuid::Uuid;

/// What the resolver concluded about a prediction.
#[derive(Debug)]
pub enum Resolution {
    /// Enough evidence: qualifying results for the protagonists that have
    /// one. Protagonists without a record cannot win.
    Resolved(Vec<ProtagonistResult>),
    /// No evidence and no sign anyone attempted the track: refund stakes.
    Void,
    /// Evidence may still surface (play activity seen, or the fetch
    /// failed); leave the prediction unprocessed and retry next tick.
    Pending(String),
}

async fn qualifying_results(
    db: &Db,
    prediction: &Prediction,
    protagonists: &[Player],
) -> Result<Vec<ProtagonistResult>> {
    let mut results = Vec::with_capacity(protagonists.len());
    for p in protagonists {
        if let Some(rec) = db
            .earliest_record_after(p.id, prediction.track_id, prediction.ends_at)
            .await?
        {
            results.push(ProtagonistResult {
                player_id: p.id,
                time_ms: rec.time_ms,
                achieved_at: rec.achieved_at,
                ingested_at: rec.ingested_at,
            });
        }
    }
    Ok(results)
}

/// Resolve a versus/guess prediction against the cache, fetching once if
/// the cache is incomplete.
pub async fn resolve(
    db: &Db,
    provider: &dyn RecordsProvider,
    prediction: &Prediction,
    protagonists: &[Player],
    now: DateTime<Utc>,
) -> Result<Resolution> {
    if protagonists.is_empty() {
        return Ok(Resolution::Void);
    }

    let mut results = qualifying_results(db, prediction, protagonists).await?;

    if results.len() < protagonists.len() {
        let Some(track) = db.get_track(prediction.track_id).await? else {
            return Ok(Resolution::Pending(format!(
                "track {} missing",
                prediction.track_id
            )));
        };

        let by_uuid: HashMap<Uuid, i64> = protagonists.iter().map(|p| (p.uuid, p.id)).collect();
        let uuids: Vec<Uuid> = protagonists.iter().map(|p| p.uuid).collect();

        let fetched = match provider.fetch_records(track.uuid, &uuids).await {
            Ok(fetched) => fetched,
            Err(e) => {
                warn!(
                    prediction_id = prediction.id,
                    track = %track.uuid,
                    "records fetch failed: {e:#}"
                );
                return Ok(Resolution::Pending(format!("records fetch failed: {e}")));
            }
        };

        debug!(
            prediction_id = prediction.id,
            fetched = fetched.len(),
            "fetched records for protagonist set"
        );

        let rows: Vec<(i64, i64, DateTime<Utc>)> = fetched
            .iter()
            .filter_map(|r| {
                by_uuid
                    .get(&r.player)
                    .map(|player_id| (*player_id, r.time_ms, r.achieved_at))
            })
            .collect();
        if !rows.is_empty() {
            db.insert_fetched_records(prediction.track_id, &rows, now)
                .await?;
        }

        results = qualifying_results(db, prediction, protagonists).await?;
    }

    if !results.is_empty() {
        return Ok(Resolution::Resolved(results));
    }

    for p in protagonists {
        let attempted = db
            .last_play_activity(p.id, prediction.track_id)
            .await?
            .map_or(false, |a| a.last_played > prediction.ends_at);
        if attempted {
            return Ok(Resolution::Pending(
                "track attempted but no record surfaced yet".to_string(),
            ));
        }
    }
    Ok(Resolution::Void)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PredictionKind;
    use crate::nadeo::FetchedRecord;
    use anyhow::anyhow;
    use chrono::Duration;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StaticProvider {
        records: Vec<FetchedRecord>,
        calls: AtomicUsize,
    }

    impl StaticProvider {
        fn new(records: Vec<FetchedRecord>) -> Self {
            Self {
                records,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl RecordsProvider for StaticProvider {
        async fn fetch_records(
            &self,
            _track: Uuid,
            _players: &[Uuid],
        ) -> Result<Vec<FetchedRecord>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.records.clone())
        }
    }

    struct FailingProvider;

    #[async_trait::async_trait]
    impl RecordsProvider for FailingProvider {
        async fn fetch_records(
            &self,
            _track: Uuid,
            _players: &[Uuid],
        ) -> Result<Vec<FetchedRecord>> {
            Err(anyhow!("upstream timed out"))
        }
    }

    struct Fixture {
        db: Db,
        _dir: tempfile::TempDir,
        prediction: Prediction,
        protagonists: Vec<Player>,
    }

    async fn fixture(created_at: DateTime<Utc>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::new(dir.path().join("resolver.db").to_str().unwrap()).unwrap();

        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let a_id = db.upsert_player(a, "alpha").await.unwrap();
        let b_id = db.upsert_player(b, "bravo").await.unwrap();
        let track = db.upsert_track(Uuid::new_v4(), "canyon-a05").await.unwrap();
        let club = db.create_club("resolver-club").await.unwrap();

        let prediction_id = db
            .create_prediction(
                club,
                track,
                PredictionKind::Versus,
                10,
                created_at,
                created_at + Duration::minutes(5),
                created_at + Duration::hours(6),
                &[a_id, b_id],
            )
            .await
            .unwrap();
        let prediction = db.get_prediction(prediction_id).await.unwrap().unwrap();
        let protagonists = db.protagonist_players(prediction_id).await.unwrap();

        Fixture {
            db,
            _dir: dir,
            prediction,
            protagonists,
        }
    }

    #[tokio::test]
    async fn test_cache_hit_skips_fetch() {
        let created = Utc::now() - chrono::Duration::hours(7);
        let f = fixture(created).await;
        let after_end = f.prediction.ends_at + Duration::minutes(1);

        for p in &f.protagonists {
            f.db.submit_record(p.id, f.prediction.track_id, 60_000, created, None, after_end)
                .await
                .unwrap();
        }

        let provider = StaticProvider::new(Vec::new());
        let res = resolve(&f.db, &provider, &f.prediction, &f.protagonists, Utc::now())
            .await
            .unwrap();

        assert!(matches!(res, Resolution::Resolved(ref r) if r.len() == 2));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_fetch_fills_cache_and_resolves() {
        let created = Utc::now() - chrono::Duration::hours(7);
        let f = fixture(created).await;

        let records = f
            .protagonists
            .iter()
            .map(|p| FetchedRecord {
                player: p.uuid,
                time_ms: 58_000,
                achieved_at: created + Duration::hours(1),
            })
            .collect();
        let provider = StaticProvider::new(records);

        let res = resolve(&f.db, &provider, &f.prediction, &f.protagonists, Utc::now())
            .await
            .unwrap();
        assert!(matches!(res, Resolution::Resolved(ref r) if r.len() == 2));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);

        // The fetch landed in the cache: resolving again needs no call.
        let quiet = StaticProvider::new(Vec::new());
        let res = resolve(&f.db, &quiet, &f.prediction, &f.protagonists, Utc::now())
            .await
            .unwrap();
        assert!(matches!(res, Resolution::Resolved(_)));
        assert_eq!(quiet.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_partial_records_resolve_for_present_players() {
        let created = Utc::now() - chrono::Duration::hours(7);
        let f = fixture(created).await;

        // Only the first protagonist ever finished the track.
        let records = vec![FetchedRecord {
            player: f.protagonists[0].uuid,
            time_ms: 58_000,
            achieved_at: created + Duration::hours(1),
        }];
        let provider = StaticProvider::new(records);

        let res = resolve(&f.db, &provider, &f.prediction, &f.protagonists, Utc::now())
            .await
            .unwrap();
        match res {
            Resolution::Resolved(results) => {
                assert_eq!(results.len(), 1);
                assert_eq!(results[0].player_id, f.protagonists[0].id);
            }
            other => panic!("expected resolved, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_no_records_no_activity_voids() {
        let created = Utc::now() - chrono::Duration::hours(7);
        let f = fixture(created).await;

        let provider = StaticProvider::new(Vec::new());
        let res = resolve(&f.db, &provider, &f.prediction, &f.protagonists, Utc::now())
            .await
            .unwrap();
        assert!(matches!(res, Resolution::Void));
    }

    #[tokio::test]
    async fn test_activity_after_window_keeps_pending() {
        let created = Utc::now() - chrono::Duration::hours(7);
        let f = fixture(created).await;

        f.db.touch_play_activity(
            f.protagonists[0].id,
            f.prediction.track_id,
            f.prediction.ends_at + Duration::minutes(2),
        )
        .await
        .unwrap();

        let provider = StaticProvider::new(Vec::new());
        let res = resolve(&f.db, &provider, &f.prediction, &f.protagonists, Utc::now())
            .await
            .unwrap();
        assert!(matches!(res, Resolution::Pending(_)));
    }

    #[tokio::test]
    async fn test_fetch_failure_keeps_pending() {
        let created = Utc::now() - chrono::Duration::hours(7);
        let f = fixture(created).await;

        let res = resolve(&f.db, &FailingProvider, &f.prediction, &f.protagonists, Utc::now())
            .await
            .unwrap();
        assert!(matches!(res, Resolution::Pending(_)));
    }
}
