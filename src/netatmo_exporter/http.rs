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

use crate::client::DeviceReader;
use crate::metrics::{self, ReadingTranslator};
use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

const OPENMETRICS_TEXT: &str = "application/openmetrics-text; version=1.0.0; charset=utf-8";

/// Global state shared by all HTTP requests.
#[derive(Debug)]
pub struct RequestContext<R> {
    translator: ReadingTranslator<R>,
}

impl<R> RequestContext<R>
where
    R: DeviceReader,
{
    pub fn new(translator: ReadingTranslator<R>) -> Self {
        RequestContext { translator }
    }
}

/// Build a router that serves `/metrics`, fetching fresh readings on every request.
pub fn text_metrics<R>(context: Arc<RequestContext<R>>) -> Router
where
    R: DeviceReader,
{
    Router::new()
        .route("/metrics", get(text_metrics_handler::<R>))
        .layer(TraceLayer::new_for_http())
        .with_state(context)
}

async fn text_metrics_handler<R>(State(context): State<Arc<RequestContext<R>>>) -> Response
where
    R: DeviceReader,
{
    let samples = context.translator.collect().await;
    tracing::debug!(message = "collected samples", num_samples = samples.len());

    match metrics::encode_samples(samples) {
        Ok(buf) => {
            tracing::debug!(message = "encoded metrics to text format", num_bytes = buf.len());
            ([(CONTENT_TYPE, OPENMETRICS_TEXT)], buf).into_response()
        }
        Err(e) => {
            tracing::error!(message = "error encoding metrics", error = %e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
