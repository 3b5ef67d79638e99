use crate::core::ControlEvent;
use crate::focus::parse_loss;
use crate::state::StateView;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use radio_core::protocol::{Command, HeadunitState, MediaItem, ROOT_ID};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

#[derive(Clone)]
struct HttpState {
    view: StateView,
    event_tx: mpsc::Sender<ControlEvent>,
}

pub fn router(view: StateView, event_tx: mpsc::Sender<ControlEvent>) -> Router {
    let app_state = HttpState { view, event_tx };

    Router::new()
        .route("/api/state", get(get_state))
        .route("/api/browse", get(browse_root))
        .route("/api/browse/:parent", get(browse))
        .route("/api/select/:id", post(select))
        .route("/api/play", post(play))
        .route("/api/pause", post(pause))
        .route("/api/stop", post(stop))
        .route("/api/refresh", post(refresh))
        .route("/api/focus/claim/:kind", post(focus_claim))
        .route("/api/focus/release", post(focus_release))
        .layer(CorsLayer::permissive())
        .with_state(app_state)
}

pub fn start_server(
    bind_address: String,
    port: u16,
    view: StateView,
    event_tx: mpsc::Sender<ControlEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let app = router(view, event_tx);

        let addr = format!("{}:{}", bind_address, port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind HTTP server to {}: {}", addr, e);
                return;
            }
        };

        info!("HTTP API server listening on http://{}", addr);

        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP server error: {}", e);
        }
    })
}

async fn get_state(State(state): State<HttpState>) -> Json<HeadunitState> {
    Json(state.view.get_state().await)
}

async fn browse_root(State(state): State<HttpState>) -> Json<Vec<MediaItem>> {
    Json(state.view.children(ROOT_ID).await)
}

async fn browse(
    State(state): State<HttpState>,
    Path(parent): Path<String>,
) -> Json<Vec<MediaItem>> {
    Json(state.view.children(&parent).await)
}

async fn dispatch(state: &HttpState, event: ControlEvent) -> StatusCode {
    if state.event_tx.send(event).await.is_err() {
        error!("HTTP API: control loop gone");
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    StatusCode::ACCEPTED
}

async fn select(State(state): State<HttpState>, Path(id): Path<String>) -> StatusCode {
    info!("HTTP API: Select station {}", id);
    dispatch(&state, ControlEvent::Command(Command::Select { id })).await
}

async fn play(State(state): State<HttpState>) -> StatusCode {
    info!("HTTP API: Play");
    dispatch(&state, ControlEvent::Command(Command::Play)).await
}

async fn pause(State(state): State<HttpState>) -> StatusCode {
    info!("HTTP API: Pause");
    dispatch(&state, ControlEvent::Command(Command::Pause)).await
}

async fn stop(State(state): State<HttpState>) -> StatusCode {
    info!("HTTP API: Stop");
    dispatch(&state, ControlEvent::Command(Command::Stop)).await
}

async fn refresh(State(state): State<HttpState>) -> StatusCode {
    info!("HTTP API: Refresh directory");
    dispatch(&state, ControlEvent::Command(Command::Refresh)).await
}

async fn focus_claim(State(state): State<HttpState>, Path(kind): Path<String>) -> StatusCode {
    let Some(loss) = parse_loss(&kind) else {
        return StatusCode::BAD_REQUEST;
    };
    info!("HTTP API: Focus claimed ({:?})", loss);
    dispatch(&state, ControlEvent::FocusClaim(loss)).await
}

async fn focus_release(State(state): State<HttpState>) -> StatusCode {
    info!("HTTP API: Focus released");
    dispatch(&state, ControlEvent::FocusRelease).await
}
