// netatmo_exporter - Prometheus metrics exporter for Netatmo weather stations
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//

use reqwest::header::{ACCEPT, USER_AGENT};
use reqwest::{Client, Response, StatusCode, Url};
use serde::Deserialize;
use std::error;
use std::fmt;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

#[derive(Debug)]
pub enum ClientError {
    Internal(reqwest::Error),
    InvalidUrl(String),
    Unauthorized(StatusCode),
    Unexpected(StatusCode, Url),
    Api(String),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Internal(e) => write!(f, "{}", e),
            Self::InvalidUrl(u) => write!(f, "invalid API URL {}", u),
            Self::Unauthorized(status) => write!(f, "credentials rejected with status {}", status),
            Self::Unexpected(status, url) => write!(f, "unexpected status {} for {}", status, url),
            Self::Api(s) => write!(f, "API returned status {}", s),
        }
    }
}

impl error::Error for ClientError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Internal(e) => Some(e),
            _ => None,
        }
    }
}

/// Source of the station and module hierarchy, fetched fresh for each scrape.
pub trait DeviceReader: Send + Sync + 'static {
    fn read(&self) -> impl Future<Output = Result<DeviceTree, ClientError>> + Send;
}

/// OAuth2 application credentials plus the refresh token issued for a user.
#[derive(Clone)]
pub struct Credentials {
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .finish()
    }
}

#[derive(Debug)]
struct TokenState {
    access_token: Option<String>,
    refresh_token: String,
    expires_at: Instant,
}

impl TokenState {
    // Tokens are refreshed a little early so a request never races the expiry.
    const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

    fn new(refresh_token: String) -> Self {
        TokenState {
            access_token: None,
            refresh_token,
            expires_at: Instant::now(),
        }
    }

    fn valid_access_token(&self, now: Instant) -> Option<&str> {
        match &self.access_token {
            Some(t) if now + Self::EXPIRY_MARGIN < self.expires_at => Some(t),
            _ => None,
        }
    }

    fn update(&mut self, res: TokenResponse, now: Instant) -> String {
        self.expires_at = now + Duration::from_secs(res.expires_in);
        self.access_token = Some(res.access_token.clone());
        if let Some(refresh) = res.refresh_token {
            if refresh != self.refresh_token {
                // Only kept in memory: after a restart the configured token may no longer be accepted
                tracing::info!(message = "refresh token rotated by the Netatmo API, configured token is now stale");
                self.refresh_token = refresh;
            }
        }

        res.access_token
    }
}

#[derive(Debug)]
pub struct NetatmoClient {
    client: Client,
    base_url: Url,
    client_id: String,
    client_secret: String,
    token: Mutex<TokenState>,
}

impl NetatmoClient {
    const USER_AGENT: &'static str = "Netatmo Prometheus Exporter";
    const JSON_RESPONSE: &'static str = "application/json";

    pub fn new(client: Client, base_url: &str, credentials: Credentials) -> Result<Self, ClientError> {
        let parsed = Url::parse(base_url).map_err(|e| ClientError::InvalidUrl(format!("{}: {}", base_url, e)))?;
        if parsed.cannot_be_a_base() {
            return Err(ClientError::InvalidUrl(base_url.to_owned()));
        }

        Ok(NetatmoClient {
            client,
            base_url: parsed,
            client_id: credentials.client_id,
            client_secret: credentials.client_secret,
            token: Mutex::new(TokenState::new(credentials.refresh_token)),
        })
    }

    /// Fetch all stations (and their linked modules) visible to the authenticated user.
    pub async fn stations(&self) -> Result<DeviceTree, ClientError> {
        let access_token = self.access_token().await?;
        let request_url = self.url(&["api", "getstationsdata"]);
        tracing::debug!(message = "making station data request", url = %request_url);

        let res = self
            .client
            .get(request_url.clone())
            .header(USER_AGENT, Self::USER_AGENT)
            .header(ACCEPT, Self::JSON_RESPONSE)
            .bearer_auth(&access_token)
            .send()
            .await
            .map_err(ClientError::Internal)?;

        let res = match Self::check_status(res, request_url) {
            Err(ClientError::Unauthorized(status)) => {
                // Force a refresh on the next read instead of reusing a rejected token.
                self.token.lock().await.access_token = None;
                return Err(ClientError::Unauthorized(status));
            }
            other => other?,
        };

        res.json::<StationsDataResponse>()
            .await
            .map_err(ClientError::Internal)?
            .into_tree()
    }

    /// Return a usable access token, exchanging the refresh token for a new one if needed.
    ///
    /// The lock is held for the duration of the refresh so that concurrent scrapes don't
    /// each try to rotate the refresh token.
    async fn access_token(&self) -> Result<String, ClientError> {
        let mut state = self.token.lock().await;
        if let Some(token) = state.valid_access_token(Instant::now()) {
            return Ok(token.to_owned());
        }

        let request_url = self.url(&["oauth2", "token"]);
        tracing::debug!(message = "refreshing access token", url = %request_url);

        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", state.refresh_token.as_str()),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
        ];

        let res = self
            .client
            .post(request_url.clone())
            .header(USER_AGENT, Self::USER_AGENT)
            .header(ACCEPT, Self::JSON_RESPONSE)
            .form(&params)
            .send()
            .await
            .map_err(ClientError::Internal)?;

        let token = Self::check_status(res, request_url)?
            .json::<TokenResponse>()
            .await
            .map_err(ClientError::Internal)?;

        tracing::debug!(message = "refreshed access token", expires_in = token.expires_in);
        Ok(state.update(token, Instant::now()))
    }

    fn check_status(res: Response, url: Url) -> Result<Response, ClientError> {
        let status = res.status();
        if status == StatusCode::OK {
            Ok(res)
        } else if status == StatusCode::BAD_REQUEST
            || status == StatusCode::UNAUTHORIZED
            || status == StatusCode::FORBIDDEN
        {
            Err(ClientError::Unauthorized(status))
        } else {
            Err(ClientError::Unexpected(status, url))
        }
    }

    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        // Base URLs that can't have path segments are rejected by new()
        if let Ok(mut p) = url.path_segments_mut() {
            p.clear().extend(segments);
        }

        url
    }
}

impl DeviceReader for NetatmoClient {
    async fn read(&self) -> Result<DeviceTree, ClientError> {
        self.stations().await
    }
}

#[derive(Deserialize, Debug)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: u64,
}

#[derive(Deserialize, Debug)]
struct StationsDataResponse {
    status: String,
    body: Option<DeviceTree>,
}

impl StationsDataResponse {
    fn into_tree(self) -> Result<DeviceTree, ClientError> {
        if self.status != "ok" {
            return Err(ClientError::Api(self.status));
        }

        self.body.ok_or_else(|| ClientError::Api("ok without body".to_owned()))
    }
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct DeviceTree {
    #[serde(default)]
    pub devices: Vec<Device>,
}

/// A station (top-level device) or one of the modules linked to it.
#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Device {
    #[serde(rename = "station_name")]
    pub station_name: Option<String>,
    #[serde(rename = "module_name")]
    pub module_name: Option<String>,
    #[serde(rename = "wifi_status")]
    pub wifi_status: Option<i64>,
    #[serde(rename = "rf_status")]
    pub rf_status: Option<i64>,
    #[serde(rename = "dashboard_data", default)]
    pub dashboard_data: Reading,
    #[serde(rename = "modules", default)]
    pub linked_modules: Vec<Device>,
}

impl Device {
    /// Name used to identify this device in labels.
    ///
    /// Stations are identified by their station name when they have one, modules
    /// (and stations without a station name) by their module name.
    pub fn name(&self) -> &str {
        self.station_name
            .as_deref()
            .filter(|s| !s.is_empty())
            .or(self.module_name.as_deref())
            .unwrap_or("")
    }
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Reading {
    #[serde(rename = "time_utc")]
    pub last_measure: Option<i64>,
    #[serde(rename = "Temperature")]
    pub temperature: Option<f64>,
    #[serde(rename = "Humidity")]
    pub humidity: Option<f64>,
    #[serde(rename = "CO2")]
    pub co2: Option<f64>,
    #[serde(rename = "Noise")]
    pub noise: Option<f64>,
    #[serde(rename = "Pressure")]
    pub pressure: Option<f64>,
    #[serde(rename = "AbsolutePressure")]
    pub absolute_pressure: Option<f64>,
    #[serde(rename = "health_idx")]
    pub health_index: Option<f64>,
}
