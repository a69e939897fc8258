use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::response::sse::{Event, Sse};
use axum::response::IntoResponse;
use axum::Json;
use futures::Stream;
use serde::Deserialize;

use crate::AppState;

/// GET /vram — single-shot Snapshot.
pub async fn snapshot(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.aggregator.collect().await)
}

/// GET /vram/stream — one `data:` frame containing the Snapshot JSON every
/// 500 ms, for as long as the client keeps the connection open. This is a
/// single chunked-body response, not repeated HTTP responses.
pub async fn stream(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = async_stream::stream! {
        loop {
            let snapshot = state.aggregator.collect().await;
            let data = serde_json::to_string(&snapshot).unwrap_or_default();
            yield Ok(Event::default().data(data));
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    };
    Sse::new(stream)
}

#[derive(Debug, Deserialize)]
pub struct AggregatedQuery {
    window: Option<u64>,
}

/// GET /vram/aggregated?window=N — AggregatedSnapshot for N seconds, clamped
/// to [1, 60].
pub async fn aggregated(
    State(state): State<Arc<AppState>>,
    Query(params): Query<AggregatedQuery>,
) -> impl IntoResponse {
    let window = params.window.unwrap_or(10);
    Json(state.aggregator.collect_aggregated(window).await)
}
