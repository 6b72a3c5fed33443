use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{Path, State, WebSocketUpgrade},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use shared::{
    error::{ApiError, ErrorCode},
    protocol::{PushAction, StatusResponse, StoryDraft, StoryEnvelope, StoryList, StoryPatch},
};
use storage::Storage;
use tokio::sync::broadcast;
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer};
use tracing::{debug, error, info, warn};

mod api;
mod app_state;
mod config;

use api::ApiContext;
use app_state::AppState;
use config::{load_settings, prepare_database_url};

const MAX_REQUEST_BODY_BYTES: usize = 64 * 1024;
const EVENT_BUFFER: usize = 256;

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ApiError>)>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;
    let (events, _) = broadcast::channel(EVENT_BUFFER);

    let state = AppState {
        api: ApiContext { storage },
        events,
    };
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "story server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/story", get(http_list_stories).post(http_create_story))
        .route(
            "/api/story/:story_id",
            get(http_get_story)
                .post(http_update_story)
                .delete(http_delete_story),
        )
        .route("/websocket", get(ws_handler))
        .layer(RequestBodyLimitLayer::new(MAX_REQUEST_BODY_BYTES))
        // Browser boards are served from other origins.
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn reject(err: ApiError) -> (StatusCode, Json<ApiError>) {
    let status = match err.code {
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(err))
}

async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.api.storage.health_check().await {
        Ok(()) => (StatusCode::OK, "ok"),
        Err(err) => {
            warn!(error = %err, "health check failed");
            (StatusCode::SERVICE_UNAVAILABLE, "storage unavailable")
        }
    }
}

async fn http_list_stories(State(state): State<Arc<AppState>>) -> ApiResult<StoryList> {
    let list = api::list_stories(&state.api).await.map_err(reject)?;
    Ok(Json(list))
}

async fn http_get_story(
    State(state): State<Arc<AppState>>,
    Path(story_id): Path<String>,
) -> ApiResult<StoryEnvelope> {
    let story_id = api::parse_story_id(&story_id).map_err(reject)?;
    let story = api::get_story(&state.api, story_id).await.map_err(reject)?;
    Ok(Json(StoryEnvelope { story }))
}

async fn http_create_story(
    State(state): State<Arc<AppState>>,
    Json(draft): Json<StoryDraft>,
) -> ApiResult<StatusResponse> {
    let story = api::create_story(&state.api, draft).await.map_err(reject)?;
    info!(story_id = %story.id, "story created");
    state.publish(PushAction::Added, &story);
    Ok(Json(StatusResponse::success_with(story)))
}

async fn http_update_story(
    State(state): State<Arc<AppState>>,
    Path(story_id): Path<String>,
    Json(patch): Json<StoryPatch>,
) -> ApiResult<StatusResponse> {
    let story_id = api::parse_story_id(&story_id).map_err(reject)?;
    let story = api::update_story(&state.api, story_id, patch)
        .await
        .map_err(reject)?;
    info!(story_id = %story.id, "story updated");
    state.publish(PushAction::Updated, &story);
    Ok(Json(StatusResponse::success_with(story)))
}

async fn http_delete_story(
    State(state): State<Arc<AppState>>,
    Path(story_id): Path<String>,
) -> ApiResult<StatusResponse> {
    let story_id = api::parse_story_id(&story_id).map_err(reject)?;
    let story = api::delete_story(&state.api, story_id)
        .await
        .map_err(reject)?;
    info!(story_id = %story.id, "story deleted");
    state.publish(PushAction::Deleted, &story);
    Ok(Json(StatusResponse::success()))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws_connection(state, socket))
}

async fn ws_connection(state: Arc<AppState>, socket: axum::extract::ws::WebSocket) {
    use axum::extract::ws::Message;
    use futures::{SinkExt, StreamExt};

    info!("push client connected");
    let (mut sender, mut receiver) = socket.split();
    let mut events_rx = state.events.subscribe();

    let send_task = tokio::spawn(async move {
        loop {
            let envelope = match events_rx.recv().await {
                Ok(envelope) => envelope,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "push client lagged; events dropped");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            let text = match serde_json::to_string(&envelope) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    // Clients only ever send the liveness greeting; nothing inbound is acted on.
    while let Some(Ok(msg)) = receiver.next().await {
        if let Message::Text(text) = msg {
            debug!(frame = %text, "push client frame ignored");
        }
    }

    send_task.abort();
    info!("push client disconnected");
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
