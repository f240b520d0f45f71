//! HTTP client for the external identity/chart/record service.
//!
//! The service is consumed through three opaque JSON endpoints. Errors are
//! returned as human-readable strings because they flow directly into the
//! failed-response commands sent back to clients; an upstream failure is
//! never terminal for a connection.

use std::time::Duration;

use serde::Deserialize;

/// Upstream request timeout. The wire protocol itself applies none, so a
/// hung identity service must not hold a session handler forever.
const HTTP_TIMEOUT: Duration = Duration::from_secs(5);

/// `GET /me` response body.
#[derive(Debug, Clone, Deserialize)]
pub struct UserProfile {
    pub id: i32,
    pub name: String,
    pub language: String,
}

/// `GET /chart/{id}` response body. Extra fields are ignored.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Chart {
    pub id: i32,
    pub name: String,
}

/// `GET /record/{id}` response body. Extra fields are ignored.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub id: i32,
    pub player: i32,
    pub score: i32,
    pub accuracy: f32,
    pub full_combo: bool,
}

pub struct IdentityClient {
    base: String,
    http: reqwest::Client,
}

impl IdentityClient {
    pub fn new(base: impl Into<String>) -> reqwest::Result<Self> {
        let http = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;
        let mut base = base.into();
        while base.ends_with('/') {
            base.pop();
        }
        Ok(Self { base, http })
    }

    /// Resolves a bearer token to the user it belongs to.
    pub async fn me(&self, token: &str) -> Result<UserProfile, String> {
        let response = self
            .http
            .get(format!("{}/me", self.base))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| format!("identity service unreachable: {e}"))?;
        if !response.status().is_success() {
            return Err(format!("authentication rejected ({})", response.status()));
        }
        response
            .json()
            .await
            .map_err(|e| format!("malformed identity response: {e}"))
    }

    pub async fn chart(&self, id: i32) -> Result<Chart, String> {
        self.fetch(format!("{}/chart/{id}", self.base), "chart").await
    }

    pub async fn record(&self, id: i32) -> Result<Record, String> {
        self.fetch(format!("{}/record/{id}", self.base), "record")
            .await
    }

    async fn fetch<T: for<'de> Deserialize<'de>>(
        &self,
        url: String,
        what: &str,
    ) -> Result<T, String> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| format!("failed to fetch {what}: {e}"))?;
        if !response.status().is_success() {
            return Err(format!("{what} not found ({})", response.status()));
        }
        response
            .json()
            .await
            .map_err(|e| format!("malformed {what} response: {e}"))
    }
}
