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

//! Prometheus metrics exporter for Netatmo weather stations
//!
//! ## Features
//!
//! `netatmo_exporter` fetches the current readings of all Netatmo stations (and the modules linked
//! to them) visible to a user from the [Netatmo API] and emits them as Prometheus metrics. Readings
//! are fetched on every scrape, nothing is cached between scrapes. A station or module that hasn't
//! reported a measurement in the last 30 minutes is treated as offline and emits no metrics at all.
//! The following metrics are emitted when available (not all fields are available for all modules).
//!
//! * `netatmo_up` - 1 if the last request to the Netatmo API succeeded, 0 otherwise.
//! * `netatmo_aircare_updated{module=$MODULE, station=$STATION}` - UNIX timestamp of the last measurement. Only
//!   ever increases, but is exposed with type `unknown` so that the series keeps this name (OpenMetrics
//!   counters require a `_total` suffix).
//! * `netatmo_aircare_last_measure_utc{module=$MODULE, station=$STATION}` - UNIX timestamp of the last measurement.
//! * `netatmo_aircare_temperature_celsius{module=$MODULE, station=$STATION}` - Temperature, in degrees celsius.
//! * `netatmo_aircare_humidity_percent{module=$MODULE, station=$STATION}` - Relative humidity (0-100).
//! * `netatmo_aircare_co2_ppm{module=$MODULE, station=$STATION}` - Carbon dioxide, in parts per million.
//! * `netatmo_aircare_noise_db{module=$MODULE, station=$STATION}` - Noise, in decibels.
//! * `netatmo_aircare_pressure_mb{module=$MODULE, station=$STATION}` - Sea level pressure, in millibar.
//! * `netatmo_aircare_absolute_pressure{module=$MODULE, station=$STATION}` - Absolute pressure, in millibar.
//! * `netatmo_aircare_health_index{module=$MODULE, station=$STATION}` - Health index, 0 (healthy) to 4 (unhealthy).
//! * `netatmo_aircare_wifi_signal_strength{module=$MODULE, station=$STATION}` - Wifi signal (86 bad, 56 good).
//! * `netatmo_aircare_rf_signal_strength{module=$MODULE, station=$STATION}` - Radio signal (90 lowest, 60 highest).
//!
//! The `station` label is always the name of the station, the `module` label is the name of the module
//! the reading is from (for readings of the station itself, this is also the name of the station).
//!
//! [Netatmo API]: https://dev.netatmo.com/apidocumentation/weather
//!
//! ## Build
//!
//! `netatmo_exporter` is a Rust program and must be built from source using a [Rust toolchain](https://rustup.rs/).
//!
//! ```text
//! cargo build --release
//! ```
//!
//! ## Usage
//!
//! ### Credentials
//!
//! Create an application at [dev.netatmo.com](https://dev.netatmo.com/apps) and generate a token with
//! the `read_station` scope. `netatmo_exporter` needs the client ID and client secret of the application
//! along with the refresh token.
//!
//! **NOTE**: Netatmo may rotate the refresh token when issuing a new access token. The rotated token is
//! only kept in memory (a `refresh token rotated` message is logged at `info` level when this happens). After
//! a restart the exporter starts again from the configured token, which may have been invalidated by then. If
//! startup fails with rejected credentials, generate a new refresh token at dev.netatmo.com.
//!
//! ```text
//! export NETATMO_CLIENT_ID=...
//! export NETATMO_CLIENT_SECRET=...
//! export NETATMO_REFRESH_TOKEN=...
//! ./netatmo_exporter
//! ```
//!
//! ### Prometheus
//!
//! Prometheus metrics are exposed on port `9210` at `/metrics`. Once `netatmo_exporter`
//! is running, configure scrapes of it by your Prometheus server. Each scrape results in
//! a request to the Netatmo API so there's little benefit to scraping more often than
//! stations report (every 5 to 10 minutes).
//!
//! ```yaml
//! # Sample config for Prometheus.
//!
//! global:
//!   scrape_interval:     5m
//!   evaluation_interval: 5m
//!   external_labels:
//!     monitor: 'my_prom'
//!
//! scrape_configs:
//! - job_name: netatmo_exporter
//!   static_configs:
//!   - targets: ['example:9210']
//! ```
//!

pub mod client;
pub mod http;
pub mod metrics;
