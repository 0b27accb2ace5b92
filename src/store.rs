//! SQLite persistence for clubs, predictions, wagers and the results cache.
//!
//! One connection behind an async mutex; every multi-row effect runs inside
//! a transaction on that connection. Settlement commits (balance deltas +
//! processed flag) are a single transaction so a crash can never leave a
//! half-paid prediction behind.

use crate::models::{
    Club, Membership, PlayActivity, Player, PointDelta, Prediction, PredictionKind,
    PredictionKind::Raffle, TrackRecord, Wager, RAFFLE_OUTCOME, STARTING_POINTS,
};
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

fn ts(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn dt(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

fn prediction_from_row(row: &Row<'_>) -> rusqlite::Result<Prediction> {
    let kind_raw: i64 = row.get(3)?;
    Ok(Prediction {
        id: row.get(0)?,
        club_id: row.get(1)?,
        track_id: row.get(2)?,
        // Unknown kinds cannot be inserted; default defensively anyway.
        kind: PredictionKind::from_i64(kind_raw).unwrap_or(PredictionKind::Versus),
        entry_fee: row.get(4)?,
        created_at: dt(row.get(5)?),
        closes_at: dt(row.get(6)?),
        ends_at: dt(row.get(7)?),
        processed: row.get::<_, i64>(8)? != 0,
    })
}

const PREDICTION_COLS: &str =
    "id, club_id, track_id, kind, entry_fee, created_at, closes_at, ends_at, processed";

impl Db {
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).context("open trackbet db")?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON").ok();

        Self::init_schema(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS players (
                id INTEGER PRIMARY KEY,
                uuid TEXT UNIQUE NOT NULL,
                name TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS tracks (
                id INTEGER PRIMARY KEY,
                uuid TEXT UNIQUE NOT NULL,
                name TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS clubs (
                id INTEGER PRIMARY KEY,
                name TEXT UNIQUE NOT NULL,
                points_name TEXT NOT NULL DEFAULT 'points',
                restricted INTEGER NOT NULL DEFAULT 0,
                visibility INTEGER NOT NULL DEFAULT 0,
                automated_amount INTEGER NOT NULL DEFAULT 0,
                automated_frequency_secs INTEGER NOT NULL DEFAULT 1800,
                automated_open_secs INTEGER NOT NULL DEFAULT 300,
                automated_end_secs INTEGER NOT NULL DEFAULT 21600,
                last_automated_at INTEGER
            );
            CREATE TABLE IF NOT EXISTS memberships (
                id INTEGER PRIMARY KEY,
                player_id INTEGER NOT NULL REFERENCES players(id),
                club_id INTEGER NOT NULL REFERENCES clubs(id),
                points INTEGER NOT NULL,
                admin INTEGER NOT NULL DEFAULT 0,
                UNIQUE(player_id, club_id)
            );
            CREATE TABLE IF NOT EXISTS club_tracks (
                id INTEGER PRIMARY KEY,
                track_id INTEGER NOT NULL REFERENCES tracks(id),
                club_id INTEGER NOT NULL REFERENCES clubs(id),
                counter INTEGER NOT NULL DEFAULT 0,
                UNIQUE(track_id, club_id)
            );
            CREATE TABLE IF NOT EXISTS predictions (
                id INTEGER PRIMARY KEY,
                club_id INTEGER NOT NULL REFERENCES clubs(id),
                track_id INTEGER NOT NULL REFERENCES tracks(id),
                kind INTEGER NOT NULL,
                entry_fee INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                closes_at INTEGER NOT NULL,
                ends_at INTEGER NOT NULL,
                processed INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_predictions_due
                ON predictions(processed, ends_at);
            CREATE TABLE IF NOT EXISTS protagonists (
                id INTEGER PRIMARY KEY,
                prediction_id INTEGER NOT NULL REFERENCES predictions(id),
                player_id INTEGER NOT NULL REFERENCES players(id),
                UNIQUE(prediction_id, player_id)
            );
            CREATE TABLE IF NOT EXISTS wagers (
                id INTEGER PRIMARY KEY,
                prediction_id INTEGER NOT NULL REFERENCES predictions(id),
                player_id INTEGER NOT NULL REFERENCES players(id),
                outcome INTEGER NOT NULL,
                points INTEGER NOT NULL,
                UNIQUE(prediction_id, player_id)
            );
            CREATE TABLE IF NOT EXISTS track_records (
                id INTEGER PRIMARY KEY,
                player_id INTEGER NOT NULL REFERENCES players(id),
                track_id INTEGER NOT NULL REFERENCES tracks(id),
                time_ms INTEGER NOT NULL,
                achieved_at INTEGER NOT NULL,
                ingested_at INTEGER NOT NULL,
                checked_by TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_track_records_lookup
                ON track_records(player_id, track_id, ingested_at);
            CREATE TABLE IF NOT EXISTS play_activity (
                id INTEGER PRIMARY KEY,
                player_id INTEGER NOT NULL REFERENCES players(id),
                track_id INTEGER NOT NULL REFERENCES tracks(id),
                last_played INTEGER NOT NULL,
                UNIQUE(player_id, track_id)
            );
            CREATE TABLE IF NOT EXISTS nadeo_tokens (
                audience TEXT PRIMARY KEY,
                token_json TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );",
        )
        .context("init trackbet schema")?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Players / tracks / clubs
    // ------------------------------------------------------------------

    pub async fn upsert_player(&self, uuid: Uuid, name: &str) -> Result<i64> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO players (uuid, name) VALUES (?1, ?2)
             ON CONFLICT(uuid) DO UPDATE SET name = excluded.name",
            params![uuid.to_string(), name],
        )?;
        let id = conn.query_row(
            "SELECT id FROM players WHERE uuid = ?1",
            params![uuid.to_string()],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub async fn upsert_track(&self, uuid: Uuid, name: &str) -> Result<i64> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO tracks (uuid, name) VALUES (?1, ?2)
             ON CONFLICT(uuid) DO UPDATE SET name = excluded.name",
            params![uuid.to_string(), name],
        )?;
        let id = conn.query_row(
            "SELECT id FROM tracks WHERE uuid = ?1",
            params![uuid.to_string()],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub async fn get_track(&self, track_id: i64) -> Result<Option<crate::models::Track>> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                "SELECT id, uuid, name FROM tracks WHERE id = ?1",
                params![track_id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;
        match row {
            Some((id, uuid, name)) => Ok(Some(crate::models::Track {
                id,
                uuid: Uuid::parse_str(&uuid).context("track uuid")?,
                name,
            })),
            None => Ok(None),
        }
    }

    pub async fn create_club(&self, name: &str) -> Result<i64> {
        let conn = self.conn.lock().await;
        conn.execute("INSERT INTO clubs (name) VALUES (?1)", params![name])?;
        Ok(conn.last_insert_rowid())
    }

    pub async fn set_club_automation(
        &self,
        club_id: i64,
        amount: i64,
        frequency_secs: i64,
        open_secs: i64,
        end_secs: i64,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        let n = conn.execute(
            "UPDATE clubs SET automated_amount = ?2, automated_frequency_secs = ?3,
                automated_open_secs = ?4, automated_end_secs = ?5
             WHERE id = ?1",
            params![club_id, amount, frequency_secs, open_secs, end_secs],
        )?;
        if n == 0 {
            bail!("club {} not found", club_id);
        }
        Ok(())
    }

    pub async fn join_club(&self, player_id: i64, club_id: i64) -> Result<i64> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR IGNORE INTO memberships (player_id, club_id, points)
             VALUES (?1, ?2, ?3)",
            params![player_id, club_id, STARTING_POINTS],
        )?;
        let id = conn.query_row(
            "SELECT id FROM memberships WHERE player_id = ?1 AND club_id = ?2",
            params![player_id, club_id],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub async fn membership(&self, player_id: i64, club_id: i64) -> Result<Option<Membership>> {
        let conn = self.conn.lock().await;
        let m = conn
            .query_row(
                "SELECT id, player_id, club_id, points, admin
                 FROM memberships WHERE player_id = ?1 AND club_id = ?2",
                params![player_id, club_id],
                |row| {
                    Ok(Membership {
                        id: row.get(0)?,
                        player_id: row.get(1)?,
                        club_id: row.get(2)?,
                        points: row.get(3)?,
                        admin: row.get::<_, i64>(4)? != 0,
                    })
                },
            )
            .optional()?;
        Ok(m)
    }

    pub async fn club_member_player_ids(&self, club_id: i64) -> Result<Vec<i64>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT player_id FROM memberships WHERE club_id = ?1 ORDER BY player_id ASC",
        )?;
        let ids = stmt
            .query_map(params![club_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()?;
        Ok(ids)
    }

    pub async fn add_club_track(&self, track_id: i64, club_id: i64) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR IGNORE INTO club_tracks (track_id, club_id) VALUES (?1, ?2)",
            params![track_id, club_id],
        )?;
        Ok(())
    }

    /// Club tracks ordered by how rarely predictions ran on them.
    pub async fn least_run_tracks(&self, club_id: i64, limit: usize) -> Result<Vec<i64>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT track_id FROM club_tracks WHERE club_id = ?1
             ORDER BY counter ASC, track_id ASC LIMIT ?2",
        )?;
        let ids = stmt
            .query_map(params![club_id, limit as i64], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()?;
        Ok(ids)
    }

    pub async fn bump_track_counter(&self, track_id: i64, club_id: i64) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE club_tracks SET counter = counter + 1
             WHERE track_id = ?1 AND club_id = ?2",
            params![track_id, club_id],
        )?;
        Ok(())
    }

    pub async fn clubs_due_automation(&self, now: DateTime<Utc>) -> Result<Vec<Club>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, name, points_name, restricted, visibility, automated_amount,
                    automated_frequency_secs, automated_open_secs, automated_end_secs,
                    last_automated_at
             FROM clubs
             WHERE automated_amount > 0
               AND (last_automated_at IS NULL
                    OR last_automated_at + automated_frequency_secs * 1000 <= ?1)",
        )?;
        let clubs = stmt
            .query_map(params![ts(now)], |row| {
                Ok(Club {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    points_name: row.get(2)?,
                    restricted: row.get::<_, i64>(3)? != 0,
                    visibility: row.get::<_, i64>(4)? != 0,
                    automated_amount: row.get(5)?,
                    automated_frequency_secs: row.get(6)?,
                    automated_open_secs: row.get(7)?,
                    automated_end_secs: row.get(8)?,
                    last_automated_at: row.get::<_, Option<i64>>(9)?.map(dt),
                })
            })?
            .collect::<rusqlite::Result<Vec<Club>>>()?;
        Ok(clubs)
    }

    pub async fn mark_automated(&self, club_id: i64, now: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE clubs SET last_automated_at = ?2 WHERE id = ?1",
            params![club_id, ts(now)],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Predictions and wagers
    // ------------------------------------------------------------------

    pub async fn create_prediction(
        &self,
        club_id: i64,
        track_id: i64,
        kind: PredictionKind,
        entry_fee: i64,
        created_at: DateTime<Utc>,
        closes_at: DateTime<Utc>,
        ends_at: DateTime<Utc>,
        protagonists: &[i64],
    ) -> Result<i64> {
        if entry_fee < 0 {
            bail!("entry fee must be non-negative");
        }
        if closes_at < created_at || ends_at < closes_at {
            bail!("prediction window out of order");
        }

        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO predictions
                (club_id, track_id, kind, entry_fee, created_at, closes_at, ends_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                club_id,
                track_id,
                kind.as_i64(),
                entry_fee,
                ts(created_at),
                ts(closes_at),
                ts(ends_at)
            ],
        )?;
        let id = tx.last_insert_rowid();
        for player_id in protagonists {
            tx.execute(
                "INSERT OR IGNORE INTO protagonists (prediction_id, player_id) VALUES (?1, ?2)",
                params![id, player_id],
            )?;
        }
        tx.commit()?;
        Ok(id)
    }

    pub async fn get_prediction(&self, id: i64) -> Result<Option<Prediction>> {
        let conn = self.conn.lock().await;
        let p = conn
            .query_row(
                &format!("SELECT {PREDICTION_COLS} FROM predictions WHERE id = ?1"),
                params![id],
                prediction_from_row,
            )
            .optional()?;
        Ok(p)
    }

    /// Expired predictions that still need settlement.
    pub async fn due_predictions(&self, now: DateTime<Utc>) -> Result<Vec<Prediction>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {PREDICTION_COLS} FROM predictions
             WHERE processed = 0 AND ends_at <= ?1"
        ))?;
        let preds = stmt
            .query_map(params![ts(now)], prediction_from_row)?
            .collect::<rusqlite::Result<Vec<Prediction>>>()?;
        Ok(preds)
    }

    pub async fn protagonist_players(&self, prediction_id: i64) -> Result<Vec<Player>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT p.id, p.uuid, p.name FROM protagonists g
             JOIN players p ON p.id = g.player_id
             WHERE g.prediction_id = ?1 ORDER BY p.id ASC",
        )?;
        let rows = stmt
            .query_map(params![prediction_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut players = Vec::with_capacity(rows.len());
        for (id, uuid, name) in rows {
            players.push(Player {
                id,
                uuid: Uuid::parse_str(&uuid).context("player uuid")?,
                name,
            });
        }
        Ok(players)
    }

    pub async fn wagers_for(&self, prediction_id: i64) -> Result<Vec<Wager>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, prediction_id, player_id, outcome, points
             FROM wagers WHERE prediction_id = ?1 ORDER BY id ASC",
        )?;
        let wagers = stmt
            .query_map(params![prediction_id], |row| {
                Ok(Wager {
                    id: row.get(0)?,
                    prediction_id: row.get(1)?,
                    player_id: row.get(2)?,
                    outcome: row.get(3)?,
                    points: row.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<Wager>>>()?;
        Ok(wagers)
    }

    /// Place a wager. Stakes for versus/guess are deducted from the member's
    /// balance here; raffle entries stake nothing (`entry_fee` is the prize,
    /// paid from outside the pool) and enroll the player as a protagonist.
    pub async fn place_wager(
        &self,
        player_id: i64,
        prediction_id: i64,
        outcome: i64,
        points: i64,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        let pred = tx
            .query_row(
                "SELECT kind, closes_at, processed, club_id FROM predictions WHERE id = ?1",
                params![prediction_id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )
            .optional()?;
        let Some((kind_raw, closes_at, processed, club_id)) = pred else {
            bail!("prediction {} not found", prediction_id);
        };
        let kind = PredictionKind::from_i64(kind_raw)
            .with_context(|| format!("prediction {} has unknown kind", prediction_id))?;

        if processed != 0 {
            bail!("prediction {} is already settled", prediction_id);
        }
        if ts(now) >= closes_at {
            bail!("betting window for prediction {} is closed", prediction_id);
        }

        let dup: Option<i64> = tx
            .query_row(
                "SELECT id FROM wagers WHERE prediction_id = ?1 AND player_id = ?2",
                params![prediction_id, player_id],
                |row| row.get(0),
            )
            .optional()?;
        if dup.is_some() {
            bail!("player {} already wagered on prediction {}", player_id, prediction_id);
        }

        let staked = if kind == Raffle {
            tx.execute(
                "INSERT OR IGNORE INTO protagonists (prediction_id, player_id) VALUES (?1, ?2)",
                params![prediction_id, player_id],
            )?;
            0
        } else {
            if points <= 0 {
                bail!("stake must be positive");
            }
            let balance: Option<i64> = tx
                .query_row(
                    "SELECT points FROM memberships WHERE player_id = ?1 AND club_id = ?2",
                    params![player_id, club_id],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(balance) = balance else {
                bail!("player {} is not a member of club {}", player_id, club_id);
            };
            if balance < points {
                bail!("insufficient points: {} < {}", balance, points);
            }
            tx.execute(
                "UPDATE memberships SET points = points - ?1
                 WHERE player_id = ?2 AND club_id = ?3",
                params![points, player_id, club_id],
            )?;
            points
        };

        let outcome = if kind == Raffle { RAFFLE_OUTCOME } else { outcome };
        tx.execute(
            "INSERT INTO wagers (prediction_id, player_id, outcome, points)
             VALUES (?1, ?2, ?3, ?4)",
            params![prediction_id, player_id, outcome, staked],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(id)
    }

    // ------------------------------------------------------------------
    // Results cache and play activity
    // ------------------------------------------------------------------

    /// Client self-report path. `checked_by` records which identity spent
    /// its own upstream quota to look the time up.
    pub async fn submit_record(
        &self,
        player_id: i64,
        track_id: i64,
        time_ms: i64,
        achieved_at: DateTime<Utc>,
        checked_by: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO track_records
                (player_id, track_id, time_ms, achieved_at, ingested_at, checked_by)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![player_id, track_id, time_ms, ts(achieved_at), ts(now), checked_by],
        )?;
        let id = tx.last_insert_rowid();
        Self::touch_activity_tx(&tx, player_id, track_id, achieved_at)?;
        tx.commit()?;
        Ok(id)
    }

    /// Store a batch fetched from the results service. A fetched record is
    /// also play-activity evidence at its achievement time.
    pub async fn insert_fetched_records(
        &self,
        track_id: i64,
        records: &[(i64, i64, DateTime<Utc>)],
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        for (player_id, time_ms, achieved_at) in records {
            tx.execute(
                "INSERT INTO track_records
                    (player_id, track_id, time_ms, achieved_at, ingested_at, checked_by)
                 VALUES (?1, ?2, ?3, ?4, ?5, NULL)",
                params![player_id, track_id, time_ms, ts(*achieved_at), ts(now)],
            )?;
            Self::touch_activity_tx(&tx, *player_id, track_id, *achieved_at)?;
        }
        tx.commit()?;
        Ok(records.len())
    }

    /// Earliest record for (player, track) ingested strictly after `after`.
    pub async fn earliest_record_after(
        &self,
        player_id: i64,
        track_id: i64,
        after: DateTime<Utc>,
    ) -> Result<Option<TrackRecord>> {
        let conn = self.conn.lock().await;
        let rec = conn
            .query_row(
                "SELECT id, player_id, track_id, time_ms, achieved_at, ingested_at, checked_by
                 FROM track_records
                 WHERE player_id = ?1 AND track_id = ?2 AND ingested_at > ?3
                 ORDER BY ingested_at ASC LIMIT 1",
                params![player_id, track_id, ts(after)],
                |row| {
                    Ok(TrackRecord {
                        id: row.get(0)?,
                        player_id: row.get(1)?,
                        track_id: row.get(2)?,
                        time_ms: row.get(3)?,
                        achieved_at: dt(row.get(4)?),
                        ingested_at: dt(row.get(5)?),
                        checked_by: row.get(6)?,
                    })
                },
            )
            .optional()?;
        Ok(rec)
    }

    pub async fn touch_play_activity(
        &self,
        player_id: i64,
        track_id: i64,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        Self::touch_activity_tx(&conn, player_id, track_id, at)
    }

    fn touch_activity_tx(conn: &Connection, player_id: i64, track_id: i64, at: DateTime<Utc>) -> Result<()> {
        conn.execute(
            "INSERT INTO play_activity (player_id, track_id, last_played)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(player_id, track_id) DO UPDATE SET
                last_played = MAX(last_played, excluded.last_played)",
            params![player_id, track_id, ts(at)],
        )?;
        Ok(())
    }

    pub async fn last_play_activity(
        &self,
        player_id: i64,
        track_id: i64,
    ) -> Result<Option<PlayActivity>> {
        let conn = self.conn.lock().await;
        let activity = conn
            .query_row(
                "SELECT player_id, track_id, last_played FROM play_activity
                 WHERE player_id = ?1 AND track_id = ?2",
                params![player_id, track_id],
                |row| {
                    Ok(PlayActivity {
                        player_id: row.get(0)?,
                        track_id: row.get(1)?,
                        last_played: dt(row.get(2)?),
                    })
                },
            )
            .optional()?;
        Ok(activity)
    }

    // ------------------------------------------------------------------
    // Settlement commit
    // ------------------------------------------------------------------

    /// Apply a prediction's balance deltas and flip its processed flag in
    /// one transaction. Returns false (applying nothing) when the flag was
    /// already set, which makes repeated settlement attempts no-ops.
    pub async fn commit_settlement(
        &self,
        prediction_id: i64,
        deltas: &[PointDelta],
    ) -> Result<bool> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        let row = tx
            .query_row(
                "SELECT processed, club_id FROM predictions WHERE id = ?1",
                params![prediction_id],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
            )
            .optional()?;
        let Some((processed, club_id)) = row else {
            bail!("prediction {} not found", prediction_id);
        };
        if processed != 0 {
            return Ok(false);
        }

        for delta in deltas {
            let n = tx.execute(
                "UPDATE memberships SET points = points + ?1
                 WHERE player_id = ?2 AND club_id = ?3",
                params![delta.amount, delta.player_id, club_id],
            )?;
            if n == 0 {
                // Member left the club between wager and settlement; the
                // delta has nowhere to land.
                warn!(
                    prediction_id,
                    player_id = delta.player_id,
                    amount = delta.amount,
                    reason = delta.reason.as_str(),
                    "skipping settlement delta for missing membership"
                );
            }
        }

        tx.execute(
            "UPDATE predictions SET processed = 1 WHERE id = ?1",
            params![prediction_id],
        )?;
        tx.commit()?;
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Results-service credentials
    // ------------------------------------------------------------------

    pub async fn load_token(&self, audience: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().await;
        let json = conn
            .query_row(
                "SELECT token_json FROM nadeo_tokens WHERE audience = ?1",
                params![audience],
                |row| row.get(0),
            )
            .optional()?;
        Ok(json)
    }

    pub async fn save_token(&self, audience: &str, json: &str, now: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO nadeo_tokens (audience, token_json, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(audience) DO UPDATE SET
                token_json = excluded.token_json,
                updated_at = excluded.updated_at",
            params![audience, json, ts(now)],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DeltaReason;
    use chrono::Duration;

    async fn test_db() -> (Db, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("store_test.db");
        let db = Db::new(path.to_str().unwrap()).expect("open db");
        (db, dir)
    }

    async fn seed_prediction(db: &Db, now: DateTime<Utc>) -> (i64, i64, i64) {
        let player = db
            .upsert_player(Uuid::new_v4(), "rider")
            .await
            .unwrap();
        let track = db.upsert_track(Uuid::new_v4(), "canyon-a01").await.unwrap();
        let club = db.create_club("midnight-club").await.unwrap();
        db.join_club(player, club).await.unwrap();
        let prediction = db
            .create_prediction(
                club,
                track,
                PredictionKind::Versus,
                10,
                now,
                now + Duration::minutes(5),
                now + Duration::hours(6),
                &[player],
            )
            .await
            .unwrap();
        (player, club, prediction)
    }

    #[tokio::test]
    async fn test_wager_deducts_stake() {
        let (db, _dir) = test_db().await;
        let now = Utc::now();
        let (player, club, prediction) = seed_prediction(&db, now).await;

        db.place_wager(player, prediction, player, 100, now).await.unwrap();
        let m = db.membership(player, club).await.unwrap().unwrap();
        assert_eq!(m.points, STARTING_POINTS - 100);
    }

    #[tokio::test]
    async fn test_wager_rejected_after_close() {
        let (db, _dir) = test_db().await;
        let now = Utc::now();
        let (player, _club, prediction) = seed_prediction(&db, now).await;

        let late = now + Duration::minutes(5);
        let err = db
            .place_wager(player, prediction, player, 10, late)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("closed"));
    }

    #[tokio::test]
    async fn test_wager_rejected_on_duplicate_and_overstake() {
        let (db, _dir) = test_db().await;
        let now = Utc::now();
        let (player, _club, prediction) = seed_prediction(&db, now).await;

        let err = db
            .place_wager(player, prediction, player, STARTING_POINTS + 1, now)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("insufficient"));

        db.place_wager(player, prediction, player, 10, now).await.unwrap();
        let err = db
            .place_wager(player, prediction, player, 10, now)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already wagered"));
    }

    #[tokio::test]
    async fn test_commit_settlement_exactly_once() {
        let (db, _dir) = test_db().await;
        let now = Utc::now();
        let (player, club, prediction) = seed_prediction(&db, now).await;

        let deltas = vec![PointDelta {
            player_id: player,
            amount: 40,
            reason: DeltaReason::Winnings,
        }];
        assert!(db.commit_settlement(prediction, &deltas).await.unwrap());
        // Second attempt must not re-apply anything.
        assert!(!db.commit_settlement(prediction, &deltas).await.unwrap());

        let m = db.membership(player, club).await.unwrap().unwrap();
        assert_eq!(m.points, STARTING_POINTS + 40);

        let due = db.due_predictions(now + Duration::days(1)).await.unwrap();
        assert!(due.is_empty());
    }

    #[tokio::test]
    async fn test_due_predictions_filters_on_end_time() {
        let (db, _dir) = test_db().await;
        let now = Utc::now();
        let (_player, _club, prediction) = seed_prediction(&db, now).await;

        assert!(db.due_predictions(now).await.unwrap().is_empty());
        let due = db.due_predictions(now + Duration::hours(7)).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, prediction);
        assert!(!due[0].processed);
    }

    #[tokio::test]
    async fn test_earliest_record_after_orders_by_ingestion() {
        let (db, _dir) = test_db().await;
        let now = Utc::now();
        let player = db.upsert_player(Uuid::new_v4(), "rider").await.unwrap();
        let track = db.upsert_track(Uuid::new_v4(), "stadium-b02").await.unwrap();

        let cutoff = now + Duration::hours(1);
        db.submit_record(player, track, 61_000, now, Some("plugin"), now)
            .await
            .unwrap();
        db.submit_record(player, track, 60_000, now, None, cutoff + Duration::minutes(10))
            .await
            .unwrap();
        db.submit_record(player, track, 59_000, now, None, cutoff + Duration::minutes(20))
            .await
            .unwrap();

        let rec = db
            .earliest_record_after(player, track, cutoff)
            .await
            .unwrap()
            .expect("qualifying record");
        assert_eq!(rec.time_ms, 60_000);
    }

    #[tokio::test]
    async fn test_play_activity_keeps_latest() {
        let (db, _dir) = test_db().await;
        let now = Utc::now();
        let player = db.upsert_player(Uuid::new_v4(), "rider").await.unwrap();
        let track = db.upsert_track(Uuid::new_v4(), "valley-c03").await.unwrap();

        db.touch_play_activity(player, track, now).await.unwrap();
        // An older report must not move the timestamp backwards.
        db.touch_play_activity(player, track, now - Duration::hours(2))
            .await
            .unwrap();

        let activity = db
            .last_play_activity(player, track)
            .await
            .unwrap()
            .expect("activity recorded");
        assert_eq!(activity.last_played.timestamp_millis(), now.timestamp_millis());

        assert!(db
            .last_play_activity(player, track + 1)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_raffle_wager_stakes_nothing_and_enrolls() {
        let (db, _dir) = test_db().await;
        let now = Utc::now();
        let player = db.upsert_player(Uuid::new_v4(), "rider").await.unwrap();
        let track = db.upsert_track(Uuid::new_v4(), "lagoon-d04").await.unwrap();
        let club = db.create_club("raffle-club").await.unwrap();
        db.join_club(player, club).await.unwrap();
        let prediction = db
            .create_prediction(
                club,
                track,
                PredictionKind::Raffle,
                500,
                now,
                now + Duration::minutes(5),
                now + Duration::hours(1),
                &[],
            )
            .await
            .unwrap();

        db.place_wager(player, prediction, 7, 123, now).await.unwrap();

        let m = db.membership(player, club).await.unwrap().unwrap();
        assert_eq!(m.points, STARTING_POINTS);

        let wagers = db.wagers_for(prediction).await.unwrap();
        assert_eq!(wagers.len(), 1);
        assert_eq!(wagers[0].outcome, RAFFLE_OUTCOME);
        assert_eq!(wagers[0].points, 0);

        let protagonists = db.protagonist_players(prediction).await.unwrap();
        assert_eq!(protagonists.len(), 1);
        assert_eq!(protagonists[0].id, player);
    }
}
