//! Batched map-records lookups against the results service.

use crate::nadeo::auth::{Audience, NadeoCredentials, TokenCache};
use crate::nadeo::rate_limit::CallGate;
use crate::store::Db;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use uuid::Uuid;

const CORE_API_BASE: &str = "https://prod.trackmania.core.nadeo.online";

/// One player's current record on a track, as reported upstream.
#[derive(Debug, Clone)]
pub struct FetchedRecord {
    pub player: Uuid,
    pub time_ms: i64,
    pub achieved_at: DateTime<Utc>,
}

/// Seam between settlement and the results service, so tests and future
/// backends can stand in for the real client.
#[async_trait::async_trait]
pub trait RecordsProvider: Send + Sync {
    /// One batched lookup for the whole player set on a track. Players
    /// without an upstream record are simply absent from the result.
    async fn fetch_records(&self, track: Uuid, players: &[Uuid]) -> Result<Vec<FetchedRecord>>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MapRecordDto {
    account_id: Uuid,
    record_score: RecordScoreDto,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct RecordScoreDto {
    time: i64,
}

/// REST client for the core services map-records endpoint.
pub struct NadeoClient {
    http: Client,
    tokens: TokenCache,
    gate: CallGate,
    base_url: String,
    user_agent: String,
}

impl NadeoClient {
    pub fn new(
        creds: NadeoCredentials,
        db: Db,
        wait_between_requests: Duration,
        timeout: Duration,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build NadeoClient")?;
        let user_agent = creds.user_agent.clone();
        let tokens = TokenCache::new(creds, http.clone(), db);
        Ok(Self {
            http,
            tokens,
            gate: CallGate::new(wait_between_requests),
            base_url: CORE_API_BASE.to_string(),
            user_agent,
        })
    }
}

#[async_trait::async_trait]
impl RecordsProvider for NadeoClient {
    async fn fetch_records(&self, track: Uuid, players: &[Uuid]) -> Result<Vec<FetchedRecord>> {
        if players.is_empty() {
            return Ok(Vec::new());
        }

        // Only actual external calls serialize behind the gate.
        self.gate.acquire().await;
        let token = self.tokens.access_token(Audience::NadeoServices).await?;

        let account_ids = players
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join(",");

        let map_id = track.to_string();
        let resp = self
            .http
            .get(format!("{}/v2/mapRecords/", self.base_url))
            .query(&[
                ("accountIdList", account_ids.as_str()),
                ("mapId", map_id.as_str()),
            ])
            .header(
                reqwest::header::AUTHORIZATION,
                format!("nadeo_v1 t={token}"),
            )
            .header(reqwest::header::USER_AGENT, &self.user_agent)
            .send()
            .await
            .context("GET /v2/mapRecords/ failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("GET /v2/mapRecords/ {}: {}", status, text));
        }

        let records: Vec<MapRecordDto> = resp
            .json()
            .await
            .context("Failed to parse map records response")?;

        Ok(records
            .into_iter()
            .map(|r| FetchedRecord {
                player: r.account_id,
                time_ms: r.record_score.time,
                achieved_at: r.timestamp,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_record_wire_format() {
        let json = r#"[{
            "accountId": "5b4d42f4-c2de-407d-b367-cbff3fe817bc",
            "filename": "a01.Map.Gbx",
            "recordScore": { "respawnCount": 0, "score": 0, "time": 52345 },
            "timestamp": "2026-03-01T18:20:45+00:00"
        }]"#;

        let parsed: Vec<MapRecordDto> = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].record_score.time, 52345);
        assert_eq!(
            parsed[0].account_id,
            "5b4d42f4-c2de-407d-b367-cbff3fe817bc".parse::<Uuid>().unwrap()
        );
    }
}
