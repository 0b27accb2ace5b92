use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Points granted to a member when they join a club.
pub const STARTING_POINTS: i64 = 1000;

/// Share of the pool granted to a winning protagonist who improved during
/// the event, in percent.
pub const BONUS_POOL_PCT: i64 = 5;

/// Wager outcome value used by every raffle entry. Raffles have a single
/// bucket; the draw picks one entry from it.
pub const RAFFLE_OUTCOME: i64 = 0;

/// Prediction kinds, stored as integers (0: versus, 1: guess, 2: raffle).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionKind {
    /// Which protagonist sets the fastest time.
    Versus,
    /// How close a wager gets to the protagonist's time.
    Guess,
    /// A uniform draw among entrants; `entry_fee` is the prize.
    Raffle,
}

impl PredictionKind {
    pub fn as_i64(&self) -> i64 {
        match self {
            PredictionKind::Versus => 0,
            PredictionKind::Guess => 1,
            PredictionKind::Raffle => 2,
        }
    }

    pub fn from_i64(v: i64) -> Option<Self> {
        match v {
            0 => Some(PredictionKind::Versus),
            1 => Some(PredictionKind::Guess),
            2 => Some(PredictionKind::Raffle),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            PredictionKind::Versus => "versus",
            PredictionKind::Guess => "guess",
            PredictionKind::Raffle => "raffle",
        }
    }
}

/// A racing-game player. `uuid` is the stable upstream account id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Player {
    pub id: i64,
    pub uuid: Uuid,
    pub name: String,
}

/// A track/map. `uuid` is the stable upstream map id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Track {
    pub id: i64,
    pub uuid: Uuid,
    pub name: String,
}

/// A community of players running predictions against each other.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Club {
    pub id: i64,
    pub name: String,
    /// Custom label for the club's points ("credits", "beans", ...).
    pub points_name: String,
    /// When set, only admins may create predictions.
    pub restricted: bool,
    pub visibility: bool,
    /// Predictions auto-created per cycle; 0 disables automation.
    pub automated_amount: i64,
    pub automated_frequency_secs: i64,
    /// How long the betting window stays open on auto-created predictions.
    pub automated_open_secs: i64,
    /// Delay between creation and resolution on auto-created predictions.
    pub automated_end_secs: i64,
    pub last_automated_at: Option<DateTime<Utc>>,
}

/// Player × club. Holds the point balance wagers draw from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Membership {
    pub id: i64,
    pub player_id: i64,
    pub club_id: i64,
    pub points: i64,
    pub admin: bool,
}

/// A wagering event on one track inside one club.
///
/// Wagers accrue between `created_at` and `closes_at`; at `ends_at` the
/// monitor settles the event and flips `processed`, which is terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prediction {
    pub id: i64,
    pub club_id: i64,
    pub track_id: i64,
    pub kind: PredictionKind,
    /// Stake unit for versus/guess; the prize amount for raffles.
    pub entry_fee: i64,
    pub created_at: DateTime<Utc>,
    pub closes_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub processed: bool,
}

/// A player's staked points on one outcome of a prediction.
///
/// `outcome` is the backed protagonist's player id for versus, a guessed
/// time in milliseconds for guess, and `RAFFLE_OUTCOME` for raffles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wager {
    pub id: i64,
    pub prediction_id: i64,
    pub player_id: i64,
    pub outcome: i64,
    pub points: i64,
}

/// An observed race time, both results cache and audit trail.
///
/// `achieved_at` is when the time was set upstream; `ingested_at` is when
/// this row landed locally. Settlement only trusts rows ingested after the
/// prediction window closed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackRecord {
    pub id: i64,
    pub player_id: i64,
    pub track_id: i64,
    pub time_ms: i64,
    pub achieved_at: DateTime<Utc>,
    pub ingested_at: DateTime<Utc>,
    /// Reporting identity for client self-reports; NULL for fetcher rows.
    pub checked_by: Option<String>,
}

/// Last time a player attempted a track. Distinguishes "never played" from
/// "played but no new record yet" when deciding whether to void.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayActivity {
    pub player_id: i64,
    pub track_id: i64,
    pub last_played: DateTime<Utc>,
}

/// Why a balance delta was applied, for logging and audit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaReason {
    /// Winning wager payout (versus/guess).
    Winnings,
    /// Protagonist bonus pool for improving during the event.
    Bonus,
    /// Stake returned on the void path.
    Refund,
    /// Raffle prize.
    Prize,
}

impl DeltaReason {
    pub fn as_str(&self) -> &str {
        match self {
            DeltaReason::Winnings => "winnings",
            DeltaReason::Bonus => "bonus",
            DeltaReason::Refund => "refund",
            DeltaReason::Prize => "prize",
        }
    }
}

/// A single point transfer produced by the payout calculator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PointDelta {
    pub player_id: i64,
    pub amount: i64,
    pub reason: DeltaReason,
}

/// A protagonist's qualifying result, as selected by the resolver.
#[derive(Debug, Clone)]
pub struct ProtagonistResult {
    pub player_id: i64,
    pub time_ms: i64,
    pub achieved_at: DateTime<Utc>,
    pub ingested_at: DateTime<Utc>,
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub poll_interval_secs: u64,
    pub automation_interval_secs: u64,
    pub nadeo_user: Option<String>,
    pub nadeo_password: Option<String>,
    pub nadeo_user_agent: String,
    /// Minimum spacing between outbound results-service calls.
    pub nadeo_wait_ms: u64,
    pub fetch_timeout_secs: u64,
    /// Fixed seed for raffle draws; unset means seed from entropy.
    pub raffle_seed: Option<u64>,
}

impl Config {
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        let database_path =
            std::env::var("DATABASE_PATH").unwrap_or_else(|_| "./trackbet.db".to_string());

        let poll_interval_secs = std::env::var("POLL_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(60);

        let automation_interval_secs = std::env::var("AUTOMATION_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(60);

        let nadeo_user = std::env::var("NADEO_USER").ok().filter(|v| !v.is_empty());
        let nadeo_password = std::env::var("NADEO_PASSWORD")
            .ok()
            .filter(|v| !v.is_empty());
        let nadeo_user_agent = std::env::var("NADEO_USER_AGENT")
            .unwrap_or_else(|_| "trackbet-backend / maintainer contact unset".to_string());

        let nadeo_wait_ms = std::env::var("NADEO_WAIT_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(3000);

        let fetch_timeout_secs = std::env::var("FETCH_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10);

        let raffle_seed = std::env::var("RAFFLE_SEED").ok().and_then(|v| v.parse().ok());

        Self {
            database_path,
            poll_interval_secs,
            automation_interval_secs,
            nadeo_user,
            nadeo_password,
            nadeo_user_agent,
            nadeo_wait_ms,
            fetch_timeout_secs,
            raffle_seed,
        }
    }
}
