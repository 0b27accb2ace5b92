//! Audience-keyed access credentials for the results service.
//!
//! Tokens are cached in memory, persisted in SQLite so restarts don't burn
//! a login, and refreshed when absent or expired. Expired tokens first try
//! the refresh endpoint and fall back to a full server-account login.

use crate::store::Db;
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info, warn};

const AUTH_BASE: &str = "https://prod.trackmania.core.nadeo.online/v2/authentication";

/// Access tokens are short-lived upstream; renew a bit early so an in-flight
/// request never carries a token that expires mid-call.
const TOKEN_TTL_SECS: i64 = 3600;
const EXPIRY_MARGIN_SECS: i64 = 60;

/// Logical token audiences, as named by the upstream service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Audience {
    /// Core services: map records, account data.
    NadeoServices,
    /// Live services: leaderboards, campaigns.
    NadeoLiveServices,
}

impl Audience {
    pub fn as_str(&self) -> &'static str {
        match self {
            Audience::NadeoServices => "NadeoServices",
            Audience::NadeoLiveServices => "NadeoLiveServices",
        }
    }
}

/// Server-account credentials plus the contact user agent the upstream
/// terms require on every request.
#[derive(Debug, Clone)]
pub struct NadeoCredentials {
    pub username: String,
    pub password: String,
    pub user_agent: String,
}

/// A persisted token for one audience.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NadeoToken {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl NadeoToken {
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        self.expires_at - Duration::seconds(EXPIRY_MARGIN_SECS) > now
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
}

/// Token cache keyed by audience, backed by the trackbet database.
pub struct TokenCache {
    creds: NadeoCredentials,
    http: Client,
    db: Db,
    base_url: String,
    cached: Mutex<HashMap<Audience, NadeoToken>>,
}

impl TokenCache {
    pub fn new(creds: NadeoCredentials, http: Client, db: Db) -> Self {
        Self {
            creds,
            http,
            db,
            base_url: AUTH_BASE.to_string(),
            cached: Mutex::new(HashMap::new()),
        }
    }

    #[cfg(test)]
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.to_string();
        self
    }

    /// Current access token for the audience, refreshing transparently.
    pub async fn access_token(&self, audience: Audience) -> Result<String> {
        let now = Utc::now();

        if let Some(token) = self.cached.lock().get(&audience) {
            if token.is_valid(now) {
                return Ok(token.access_token.clone());
            }
        }

        // Fall back to the persisted copy before spending a login.
        let mut stale: Option<NadeoToken> = None;
        if let Some(json) = self.db.load_token(audience.as_str()).await? {
            match serde_json::from_str::<NadeoToken>(&json) {
                Ok(token) if token.is_valid(now) => {
                    debug!(audience = audience.as_str(), "token loaded from store");
                    self.cached.lock().insert(audience, token.clone());
                    return Ok(token.access_token);
                }
                Ok(token) => stale = Some(token),
                Err(e) => warn!(audience = audience.as_str(), "stored token unreadable: {e}"),
            }
        }

        let token = match stale.and_then(|t| t.refresh_token) {
            Some(refresh) => match self.refresh(audience, &refresh).await {
                Ok(token) => token,
                Err(e) => {
                    warn!(
                        audience = audience.as_str(),
                        "token refresh failed, retrying with full login: {e}"
                    );
                    self.login(audience).await?
                }
            },
            None => self.login(audience).await?,
        };

        self.db
            .save_token(
                audience.as_str(),
                &serde_json::to_string(&token).context("serialize token")?,
                now,
            )
            .await?;
        self.cached.lock().insert(audience, token.clone());
        Ok(token.access_token)
    }

    async fn login(&self, audience: Audience) -> Result<NadeoToken> {
        info!(audience = audience.as_str(), "logging in to results service");
        let resp = self
            .http
            .post(format!("{}/token/basic", self.base_url))
            .basic_auth(&self.creds.username, Some(&self.creds.password))
            .header(reqwest::header::USER_AGENT, &self.creds.user_agent)
            .json(&serde_json::json!({ "audience": audience.as_str() }))
            .send()
            .await
            .context("POST /token/basic failed")?;

        Self::token_from_response(resp, "basic login").await
    }

    async fn refresh(&self, audience: Audience, refresh_token: &str) -> Result<NadeoToken> {
        debug!(audience = audience.as_str(), "refreshing access token");
        let resp = self
            .http
            .post(format!("{}/token/refresh", self.base_url))
            .header(
                reqwest::header::AUTHORIZATION,
                format!("nadeo_v1 t={refresh_token}"),
            )
            .header(reqwest::header::USER_AGENT, &self.creds.user_agent)
            .send()
            .await
            .context("POST /token/refresh failed")?;

        Self::token_from_response(resp, "token refresh").await
    }

    async fn token_from_response(resp: reqwest::Response, what: &str) -> Result<NadeoToken> {
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("{what} {status}: {text}");
        }
        let auth: AuthResponse = resp.json().await.with_context(|| format!("parse {what}"))?;
        Ok(NadeoToken {
            access_token: auth.access_token,
            refresh_token: auth.refresh_token,
            expires_at: Utc::now() + Duration::seconds(TOKEN_TTL_SECS),
        })
    }
}
