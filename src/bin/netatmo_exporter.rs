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

use clap::Parser;
use netatmo_exporter::client::{ClientError, Credentials, DeviceReader, NetatmoClient};
use netatmo_exporter::http::RequestContext;
use netatmo_exporter::metrics::ReadingTranslator;
use reqwest::Client;
use std::error::Error;
use std::io;
use std::net::SocketAddr;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{self, SignalKind};
use tracing::{Instrument, Level};

const DEFAULT_LOG_LEVEL: Level = Level::INFO;
const DEFAULT_BIND_ADDR: ([u8; 4], u16) = ([0, 0, 0, 0], 9210);
const DEFAULT_TIMEOUT_MILLIS: u64 = 5000;
const DEFAULT_API_URL: &str = "https://api.netatmo.com/";

#[derive(Debug, Parser)]
#[clap(name = "netatmo_exporter", version = clap::crate_version!())]
struct NetatmoExporterApplication {
    /// Client ID of the Netatmo application
    #[clap(long, env = "NETATMO_CLIENT_ID")]
    client_id: String,

    /// Client secret of the Netatmo application
    #[clap(long, env = "NETATMO_CLIENT_SECRET", hide_env_values = true)]
    client_secret: String,

    /// Refresh token with the `read_station` scope, used to obtain access tokens
    #[clap(long, env = "NETATMO_REFRESH_TOKEN", hide_env_values = true)]
    refresh_token: String,

    /// Base URL for the Netatmo API
    #[clap(long, env = "NETATMO_API_URL", default_value_t = DEFAULT_API_URL.into())]
    api_url: String,

    /// Logging verbosity. Allowed values are 'trace', 'debug', 'info', 'warn', and 'error'
    /// (case insensitive)
    #[clap(long, env = "NETATMO_LOG_LEVEL", default_value_t = DEFAULT_LOG_LEVEL)]
    log_level: Level,

    /// Timeout for each request to the Netatmo API, in milliseconds.
    #[clap(long, env = "NETATMO_TIMEOUT_MILLIS", default_value_t = DEFAULT_TIMEOUT_MILLIS)]
    timeout_millis: u64,

    /// Address to bind to. By default, netatmo_exporter will bind to public address since
    /// the purpose is to expose metrics to an external system (Prometheus or another
    /// agent for ingestion)
    #[clap(long, env = "NETATMO_BIND", default_value_t = DEFAULT_BIND_ADDR.into())]
    bind: SocketAddr,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    let opts = NetatmoExporterApplication::parse();
    tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(opts.log_level)
            .finish(),
    )
    .expect("failed to set tracing subscriber");

    let timeout = Duration::from_millis(opts.timeout_millis);
    let http_client = Client::builder().timeout(timeout).build().unwrap_or_else(|e| {
        tracing::error!(message = "unable to initialize HTTP client", error = %e);
        process::exit(1)
    });

    let credentials = Credentials {
        client_id: opts.client_id.clone(),
        client_secret: opts.client_secret.clone(),
        refresh_token: opts.refresh_token.clone(),
    };

    let client = NetatmoClient::new(http_client, &opts.api_url, credentials).unwrap_or_else(|e| {
        tracing::error!(message = "unable to initialize API client", error = %e);
        process::exit(1)
    });

    // Make an initial request to fetch station data. This allows us to verify that the
    // credentials the user provided are valid and the API is available before starting
    // the HTTP server and running indefinitely.
    match client
        .read()
        .instrument(tracing::span!(Level::DEBUG, "netatmo_initial_read"))
        .await
    {
        Err(ClientError::Unauthorized(status)) => {
            tracing::error!(message = "credentials rejected by the Netatmo API", status = %status);
            process::exit(1)
        }
        Err(e) => {
            tracing::warn!(message = "failed to fetch initial station data", error = %e);
        }
        Ok(tree) => {
            tracing::debug!(message = "verified station data", num_stations = tree.devices.len());
        }
    }

    let context = Arc::new(RequestContext::new(ReadingTranslator::new(client)));
    let handler = netatmo_exporter::http::text_metrics(context);
    let server = axum::Server::try_bind(&opts.bind)
        .unwrap_or_else(|e| {
            tracing::error!(message = "error binding to address", address = %opts.bind, error = %e);
            process::exit(1)
        })
        .serve(handler.into_make_service());

    tracing::info!(message = "server started", address = %server.local_addr(), api_url = %opts.api_url);

    server
        .with_graceful_shutdown(async {
            // Wait for either SIGTERM or SIGINT to shutdown
            tokio::select! {
                _ = sigterm() => {}
                _ = sigint() => {}
            }
        })
        .await?;

    tracing::info!("server shutdown");
    Ok(())
}

/// Return after the first SIGTERM signal received by this process
async fn sigterm() -> io::Result<()> {
    unix::signal(SignalKind::terminate())?.recv().await;
    Ok(())
}

/// Return after the first SIGINT signal received by this process
async fn sigint() -> io::Result<()> {
    unix::signal(SignalKind::interrupt())?.recv().await;
    Ok(())
}
