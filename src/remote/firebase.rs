use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{value_as_number, value_as_string, MonitorSnapshot, RemoteStore, SyncError};
use crate::config::BackendConfig;

/// Refresh the ID token this long before it actually expires.
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);
/// Minimum spacing between sign-up attempts once the initial sign-in has failed.
const AUTH_RETRY_SPACING: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
struct Session {
    id_token: String,
    refresh_token: String,
    expires_at: Instant,
}

impl Session {
    fn is_fresh(&self) -> bool {
        Instant::now() + EXPIRY_MARGIN < self.expires_at
    }
}

#[derive(Debug, Default)]
struct AuthState {
    session: Option<Session>,
    /// Last sign-up attempt. `None` makes the next `ready()` sign up at once.
    last_attempt: Option<Instant>,
    /// Last failed token refresh; further refreshes wait out the retry spacing.
    refresh_failed_at: Option<Instant>,
}

fn spacing_elapsed(at: Option<Instant>) -> bool {
    at.map_or(true, |t| t.elapsed() >= AUTH_RETRY_SPACING)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignUpResponse {
    id_token: String,
    refresh_token: String,
    expires_in: String,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    id_token: String,
    refresh_token: String,
    expires_in: String,
}

fn expiry_from(expires_in: &str) -> Instant {
    let secs = expires_in.trim().parse::<u64>().unwrap_or(3600);
    Instant::now() + Duration::from_secs(secs)
}

/// Firebase Realtime Database over its REST API, signed in anonymously.
///
/// With an empty `api_key` requests go out unauthenticated, which is what the
/// local emulator and open rules expect.
pub struct RtdbClient {
    database_url: String,
    identity_url: String,
    token_url: String,
    api_key: String,
    max_token_retries: u32,
    client: reqwest::Client,
    auth: Mutex<AuthState>,
}

impl RtdbClient {
    pub fn new(cfg: &BackendConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static("power-monitor-agent/0.1"),
        );
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.http_timeout_seconds.max(1)))
            .default_headers(headers)
            .build()?;
        Ok(Self {
            database_url: cfg.database_url.trim_end_matches('/').to_string(),
            identity_url: cfg.identity_url.trim_end_matches('/').to_string(),
            token_url: cfg.token_url.trim_end_matches('/').to_string(),
            api_key: cfg.api_key.clone(),
            max_token_retries: cfg.max_token_retries.max(1),
            client,
            auth: Mutex::new(AuthState::default()),
        })
    }

    fn requires_auth(&self) -> bool {
        !self.api_key.is_empty()
    }

    async fn sign_up_locked(&self, auth: &mut AuthState) -> Result<(), SyncError> {
        let mut last_err = SyncError::Auth("no attempt made".into());
        for attempt in 1..=self.max_token_retries {
            auth.last_attempt = Some(Instant::now());
            match self.sign_up_once().await {
                Ok(session) => {
                    info!(attempt, "backend sign-up ok");
                    auth.session = Some(session);
                    auth.refresh_failed_at = None;
                    return Ok(());
                }
                Err(e) => {
                    warn!(attempt, error = %e, "backend sign-up failed");
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    async fn sign_up_once(&self) -> Result<Session, SyncError> {
        let url = format!("{}/v1/accounts:signUp", self.identity_url);
        let resp = self
            .client
            .post(url)
            .query(&[("key", self.api_key.as_str())])
            .json(&serde_json::json!({ "returnSecureToken": true }))
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(SyncError::Auth(format!("sign-up HTTP {status}: {body}")));
        }
        let body: SignUpResponse = resp
            .json()
            .await
            .map_err(|e| SyncError::Auth(format!("sign-up response: {e}")))?;
        Ok(Session {
            id_token: body.id_token,
            refresh_token: body.refresh_token,
            expires_at: expiry_from(&body.expires_in),
        })
    }

    async fn refresh(&self, refresh_token: &str) -> Result<Session, SyncError> {
        let url = format!("{}/v1/token", self.token_url);
        let resp = self
            .client
            .post(url)
            .query(&[("key", self.api_key.as_str())])
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
            ])
            .send()
            .await?;
        let status = resp.status();
        // 4xx: the refresh token itself was rejected; anything else may pass
        if status.is_client_error() {
            return Err(SyncError::Auth(format!("token refresh rejected: HTTP {status}")));
        }
        if !status.is_success() {
            return Err(SyncError::Http {
                status: status.as_u16(),
                path: "token refresh".into(),
            });
        }
        let body: RefreshResponse = resp.json().await.map_err(|_| SyncError::Parse {
            path: "token refresh".into(),
            expected: "token response",
        })?;
        Ok(Session {
            id_token: body.id_token,
            refresh_token: body.refresh_token,
            expires_at: expiry_from(&body.expires_in),
        })
    }

    async fn token(&self) -> Result<Option<String>, SyncError> {
        if !self.requires_auth() {
            return Ok(None);
        }
        let auth = self.auth.lock().await;
        match &auth.session {
            Some(s) if s.is_fresh() => Ok(Some(s.id_token.clone())),
            _ => Err(SyncError::NotReady),
        }
    }

    fn url_for(&self, path: &str) -> String {
        format!("{}/{}.json", self.database_url, path.trim_matches('/'))
    }

    async fn get_value(&self, path: &str) -> Result<Value, SyncError> {
        let token = self.token().await?;
        let mut req = self.client.get(self.url_for(path));
        if let Some(t) = &token {
            req = req.query(&[("auth", t.as_str())]);
        }
        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(SyncError::Http {
                status: status.as_u16(),
                path: path.to_string(),
            });
        }
        let value: Value = resp.json().await.map_err(|_| SyncError::Parse {
            path: path.to_string(),
            expected: "JSON document",
        })?;
        debug!(%path, %value, "read");
        Ok(value)
    }
}

#[async_trait]
impl RemoteStore for RtdbClient {
    /// Anonymous sign-up, attempted up to `max_token_retries` times.
    async fn sign_in(&self) -> Result<(), SyncError> {
        if !self.requires_auth() {
            return Ok(());
        }
        let mut auth = self.auth.lock().await;
        self.sign_up_locked(&mut auth).await
    }

    async fn ready(&self) -> bool {
        if !self.requires_auth() {
            return true;
        }
        let mut auth = self.auth.lock().await;
        let refresh_token = match &auth.session {
            Some(s) if s.is_fresh() => return true,
            Some(s) => s.refresh_token.clone(),
            None => {
                if !spacing_elapsed(auth.last_attempt) {
                    return false;
                }
                return self.sign_up_locked(&mut auth).await.is_ok();
            }
        };
        if !spacing_elapsed(auth.refresh_failed_at) {
            return false;
        }

        match self.refresh(&refresh_token).await {
            Ok(session) => {
                debug!("backend token refreshed");
                auth.session = Some(session);
                auth.refresh_failed_at = None;
                true
            }
            Err(SyncError::Auth(reason)) => {
                warn!(%reason, "refresh token rejected, signing up again on next check");
                auth.session = None;
                auth.last_attempt = None;
                auth.refresh_failed_at = None;
                false
            }
            Err(e) => {
                warn!(error = %e, "backend token refresh failed");
                auth.refresh_failed_at = Some(Instant::now());
                false
            }
        }
    }

    async fn read_string(&self, path: &str) -> Result<String, SyncError> {
        let value = self.get_value(path).await?;
        value_as_string(path, &value)
    }

    async fn read_number(&self, path: &str) -> Result<f64, SyncError> {
        let value = self.get_value(path).await?;
        value_as_number(path, &value)
    }

    async fn write_json(&self, path: &str, snapshot: &MonitorSnapshot) -> Result<(), SyncError> {
        let token = self.token().await?;
        let mut req = self.client.put(self.url_for(path)).json(snapshot);
        if let Some(t) = &token {
            req = req.query(&[("auth", t.as_str())]);
        }
        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(SyncError::Http {
                status: status.as_u16(),
                path: path.to_string(),
            });
        }
        Ok(())
    }
}
