use std::{
    convert::Infallible,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use axum::{
    extract::{Query, State},
    http::header,
    response::{
        sse::{Event as SseEvent, Sse},
        IntoResponse,
    },
    routing::get,
    Json, Router,
};
use chrono::Utc;
use futures_core::stream::Stream;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::{
    wrappers::{IntervalStream, ReceiverStream},
    StreamExt as _,
};
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use utoipa::OpenApi;
use uuid::Uuid;

use crate::{
    config::Config,
    error::{ApiError, ApiResult},
    main_lib::AppState,
    registry::{ChannelSink, ClientRegistry},
};

/// Fixed heartbeat cadence. Keeps intermediary proxies from timing the
/// stream out and lets clients detect a silently dead link.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Per-client buffer between dispatch and the response stream. A client
/// that stops draining loses events once the buffer is full.
const CLIENT_BUFFER: usize = 64;

#[utoipa::path(get, path = "/api/v1/healthz", responses((status = 200, description = "Health")))]
pub async fn healthz() -> &'static str {
    "ok"
}

#[utoipa::path(get, path = "/api/v1/readyz", responses((status = 200, description = "Ready")))]
pub async fn readyz() -> &'static str {
    "ok"
}

#[derive(Deserialize)]
struct StreamQuery {
    #[serde(rename = "orgId")]
    org_id: Option<String>,
}

/// Response stream bound to one registration. Dropping it (the client
/// closed the connection or the transport errored) unregisters the client
/// and releases its sink and heartbeat timer.
struct ConnectedClient<S> {
    inner: S,
    registry: ClientRegistry,
    client_id: Uuid,
}

impl<S> ConnectedClient<S> {
    fn new(inner: S, registry: ClientRegistry, client_id: Uuid) -> Self {
        Self {
            inner,
            registry,
            client_id,
        }
    }
}

impl<S: Stream + Unpin> Stream for ConnectedClient<S> {
    type Item = S::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<S::Item>> {
        Pin::new(&mut self.get_mut().inner).poll_next(cx)
    }
}

impl<S> Drop for ConnectedClient<S> {
    fn drop(&mut self) {
        self.registry.unregister(self.client_id);
        tracing::info!(client_id = %self.client_id, "streaming client disconnected");
    }
}

async fn stream_activity(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StreamQuery>,
) -> ApiResult<impl IntoResponse> {
    let org_id = query.org_id.unwrap_or_default();
    let org_id = org_id.trim();
    if org_id.is_empty() {
        return Err(ApiError::BadRequest(
            "orgId query parameter is required".into(),
        ));
    }

    let (tx, rx) = mpsc::channel(CLIENT_BUFFER);
    let client_id = state
        .registry
        .register(org_id, Arc::new(ChannelSink::new(tx)))?;
    tracing::info!(%client_id, org_id, "streaming client connected");

    let connected = json!({ "type": "connected", "clientId": client_id });
    let events = ReceiverStream::new(rx);
    let first_tick = tokio::time::Instant::now() + HEARTBEAT_INTERVAL;
    let heartbeats = IntervalStream::new(tokio::time::interval_at(
        first_tick,
        HEARTBEAT_INTERVAL,
    ))
    .map(|_| json!({ "type": "heartbeat", "timestamp": Utc::now().timestamp_millis() }));

    let stream = tokio_stream::once(connected)
        .chain(events.merge(heartbeats))
        .map(|payload| Ok::<_, Infallible>(SseEvent::default().data(payload.to_string())));
    let stream = ConnectedClient::new(stream, state.registry.clone(), client_id);

    Ok((
        [(header::CACHE_CONTROL, "no-cache")],
        Sse::new(stream),
    ))
}

#[derive(OpenApi)]
#[openapi(paths(healthz, readyz), tags((name = "activityfeed")))]
pub struct ApiDoc;

pub fn app_router(state: Arc<AppState>, config: &Config) -> Router {
    let cors = if config.cors_allow.iter().any(|o| o == "*") {
        CorsLayer::new().allow_origin(Any)
    } else {
        let origins = config
            .cors_allow
            .iter()
            .map(|o| o.parse().unwrap())
            .collect::<Vec<_>>();
        CorsLayer::new().allow_origin(origins)
    };

    let openapi = ApiDoc::openapi();

    let api = Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/activity/stream", get(stream_activity));

    Router::new()
        .nest("/api/v1", api)
        .route("/openapi.json", get(move || async move { Json(openapi) }))
        .with_state(state)
        .layer(cors)
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TimeoutLayer::new(config.request_timeout))
        .layer(TraceLayer::new_for_http())
}
