//! Thin client for the backend's REST endpoints.
//!
//! Only the calls the sync layer needs are here: logging in and out, and
//! fetching the robot roster used to seed the fleet map.

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::fleet::{Coordinates, RobotId, RosterEntry};
use crate::session::Session;

/// Name of the cookie the backend keeps its session id in.
const SESSION_COOKIE: &str = "cookie";

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid username or password")]
    InvalidCredentials,

    #[error("unexpected response ({status}): {detail}")]
    UnexpectedResponse { status: StatusCode, detail: String },

    #[error("invalid backend url: {0}")]
    InvalidUrl(String),
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct LoginResponse {
    session_id: String,
}

#[derive(Deserialize)]
struct RobotsResponse {
    #[serde(default)]
    robots: Vec<RobotRecord>,
}

/// One row of `GET /robots/`. Only the fields the fleet map needs.
#[derive(Debug, Clone, Deserialize)]
pub struct RobotRecord {
    #[serde(default)]
    pub robot_id: serde_json::Value,
    #[serde(rename = "deviceName", alias = "device_name", default)]
    pub device_name: Option<String>,
    #[serde(default)]
    pub lat: Option<f64>,
    #[serde(default)]
    pub lng: Option<f64>,
}

impl RobotRecord {
    /// Convert to a roster entry. Records without a usable id are skipped.
    pub fn into_roster_entry(self) -> Option<RosterEntry> {
        let id = RobotId::from_json(&self.robot_id)?;
        let coordinates = match (self.lat, self.lng) {
            (Some(lat), Some(lng)) => Some(Coordinates { lat, lng }),
            _ => None,
        };
        Some(RosterEntry {
            id,
            display_name: self.device_name.filter(|n| !n.is_empty()),
            coordinates,
        })
    }
}

/// REST client bound to one backend base URL.
#[derive(Clone)]
pub struct BackendClient {
    base: String,
    http: reqwest::Client,
}

impl BackendClient {
    pub fn new(api_url: &str) -> Result<Self, BackendError> {
        reqwest::Url::parse(api_url).map_err(|e| BackendError::InvalidUrl(e.to_string()))?;
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            base: api_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    fn url_for(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    /// `POST /create_session/`: exchange credentials for a session.
    pub async fn create_session(&self, username: &str, password: &str) -> Result<Session, BackendError> {
        let resp = self
            .http
            .post(self.url_for("/create_session/"))
            .json(&LoginRequest { username, password })
            .send()
            .await?;

        match resp.status() {
            StatusCode::UNAUTHORIZED => Err(BackendError::InvalidCredentials),
            status if status.is_success() => {
                let body: LoginResponse = resp.json().await?;
                tracing::info!(username, "session created");
                Ok(Session::authenticated(body.session_id))
            }
            status => Err(unexpected(status, resp).await),
        }
    }

    /// `POST /delete_session`: end a session on the backend.
    pub async fn delete_session(&self, session: &Session) -> Result<(), BackendError> {
        let resp = self
            .http
            .post(self.url_for("/delete_session"))
            .header(
                reqwest::header::COOKIE,
                format!("{}={}", SESSION_COOKIE, session.token),
            )
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(unexpected(status, resp).await);
        }
        Ok(())
    }

    /// `GET /robots/`: the registered robots.
    pub async fn list_robots(&self) -> Result<Vec<RobotRecord>, BackendError> {
        let resp = self.http.get(self.url_for("/robots/")).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(unexpected(status, resp).await);
        }
        let body: RobotsResponse = resp.json().await?;
        Ok(body.robots)
    }

    /// The roster as fleet entries, ready for [`FleetStore::seed`].
    ///
    /// [`FleetStore::seed`]: crate::fleet::FleetStore::seed
    pub async fn roster(&self) -> Result<Vec<RosterEntry>, BackendError> {
        let robots = self.list_robots().await?;
        let total = robots.len();
        let entries: Vec<_> = robots
            .into_iter()
            .filter_map(RobotRecord::into_roster_entry)
            .collect();
        if entries.len() < total {
            tracing::warn!(skipped = total - entries.len(), "roster rows without a usable robot_id");
        }
        Ok(entries)
    }
}

async fn unexpected(status: StatusCode, resp: reqwest::Response) -> BackendError {
    let detail = resp.text().await.unwrap_or_default();
    BackendError::UnexpectedResponse {
        status,
        detail: detail.chars().take(200).collect(),
    }
}
