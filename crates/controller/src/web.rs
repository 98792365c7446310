use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use std::env;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{error, info};

use crate::controller::Command;
use crate::db::Db;
use crate::state::SharedState;

const DEFAULT_RUN_LIMIT: i64 = 50;
const MAX_WATER_LEVEL: u16 = 250;

#[derive(Clone)]
pub struct AppState {
    pub shared: SharedState,
    pub commands: mpsc::Sender<Command>,
    pub db: Db,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/runs", get(api_runs))
        .route("/api/stations/{id}/run", post(run_station))
        .route("/api/programs/{id}/run", post(run_program))
        .route("/api/stop", post(stop_all))
        .route("/api/enable", post(enable))
        .route("/api/disable", post(disable))
        .route("/api/rain-delay", post(rain_delay))
        .route("/api/water-level", post(water_level))
        .with_state(state)
}

async fn api_status(State(state): State<AppState>) -> impl IntoResponse {
    let st = state.shared.read().await;
    Json(st.to_status())
}

#[derive(Deserialize)]
struct RunsQuery {
    limit: Option<i64>,
}

async fn api_runs(State(state): State<AppState>, Query(q): Query<RunsQuery>) -> Response {
    let limit = q.limit.unwrap_or(DEFAULT_RUN_LIMIT).clamp(1, 1000);
    match state.db.recent_runs(limit).await {
        Ok(runs) => Json(runs).into_response(),
        Err(e) => {
            error!("web: recent_runs failed: {e:#}");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": "run log unavailable" }))).into_response()
        }
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct RunStationQuery {
    seconds: i64,
}

async fn run_station(
    State(state): State<AppState>,
    Path(id): Path<usize>,
    Query(q): Query<RunStationQuery>,
) -> Response {
    let known = {
        let st = state.shared.read().await;
        st.controller.stations.iter().any(|s| s.id == id && !s.master)
    };
    if !known {
        return not_found(format!("no station {id}"));
    }
    if q.seconds <= 0 {
        return bad_request("seconds must be positive");
    }
    submit(
        &state,
        Command::RunStation {
            station: id,
            seconds: q.seconds,
        },
    )
}

#[derive(Deserialize)]
struct RunProgramQuery {
    /// Manual starts run at full water level unless asked otherwise.
    #[serde(default)]
    use_weather: bool,
}

async fn run_program(
    State(state): State<AppState>,
    Path(id): Path<usize>,
    Query(q): Query<RunProgramQuery>,
) -> Response {
    let known = {
        let st = state.shared.read().await;
        id < st.controller.programs.len()
    };
    if !known {
        return not_found(format!("no program {id}"));
    }
    submit(
        &state,
        Command::RunProgram {
            program: id,
            use_weather: q.use_weather,
        },
    )
}

async fn stop_all(State(state): State<AppState>) -> Response {
    submit(&state, Command::StopAll)
}

async fn enable(State(state): State<AppState>) -> Response {
    submit(&state, Command::SetEnabled(true))
}

async fn disable(State(state): State<AppState>) -> Response {
    submit(&state, Command::SetEnabled(false))
}

#[derive(Deserialize)]
struct RainDelayQuery {
    hours: u16,
}

async fn rain_delay(State(state): State<AppState>, Query(q): Query<RainDelayQuery>) -> Response {
    submit(&state, Command::SetRainDelay { hours: q.hours })
}

#[derive(Deserialize)]
struct WaterLevelQuery {
    percent: u16,
}

async fn water_level(State(state): State<AppState>, Query(q): Query<WaterLevelQuery>) -> Response {
    if q.percent > MAX_WATER_LEVEL {
        return bad_request(&format!("percent must be at most {MAX_WATER_LEVEL}"));
    }
    submit(&state, Command::SetWaterLevel(q.percent as u8))
}

/// Hand a command to the control loop without waiting on it.
fn submit(state: &AppState, command: Command) -> Response {
    match state.commands.try_send(command) {
        Ok(()) => (StatusCode::ACCEPTED, Json(json!({ "accepted": true }))).into_response(),
        Err(TrySendError::Full(command)) => {
            error!(?command, "web: command queue full");
            (StatusCode::SERVICE_UNAVAILABLE, Json(json!({ "error": "controller busy" }))).into_response()
        }
        Err(TrySendError::Closed(_)) => {
            (StatusCode::SERVICE_UNAVAILABLE, Json(json!({ "error": "controller stopped" }))).into_response()
        }
    }
}

fn not_found(msg: String) -> Response {
    (StatusCode::NOT_FOUND, Json(json!({ "error": msg }))).into_response()
}

fn bad_request(msg: &str) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": msg }))).into_response()
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: AppState) {
    let port: u16 = env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = match TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(%addr, "web: failed to bind: {e}");
            return;
        }
    };

    info!("web api listening on http://{addr}");

    if let Err(e) = axum::serve(listener, router(state)).await {
        error!("web server error: {e}");
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::testing::controller;
    use crate::db::RunRecord;
    use crate::options::Options;
    use crate::state::SystemState;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::sync::Arc;
    use tokio::sync::RwLock;
    use tower::ServiceExt;

    async fn app(capacity: usize) -> (Router, mpsc::Receiver<Command>, Db) {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();

        let mut options = Options::default();
        options.master1.station = Some(7);
        let programs = vec![crate::controller::testing::daily("lawn", 360, &[60])];
        let snapshot = controller(options, vec![], programs).snapshot();

        let shared = Arc::new(RwLock::new(SystemState::new(snapshot)));
        let (tx, rx) = mpsc::channel(capacity);
        let state = AppState {
            shared,
            commands: tx,
            db: db.clone(),
        };
        (router(state), rx, db)
    }

    async fn call(router: &Router, method: &str, uri: &str) -> (StatusCode, serde_json::Value) {
        let req = Request::builder().method(method).uri(uri).body(Body::empty()).unwrap();
        let resp = router.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let body = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, body)
    }

    // -- status -------------------------------------------------------------

    #[tokio::test]
    async fn status_returns_snapshot() {
        let (router, _rx, _db) = app(4).await;
        let (status, body) = call(&router, "GET", "/api/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["mqtt_connected"], false);
        assert_eq!(body["stations"].as_array().unwrap().len(), 8);
        assert_eq!(body["programs"][0]["name"], "lawn");
    }

    #[tokio::test]
    async fn runs_lists_run_log() {
        let (router, _rx, db) = app(4).await;
        db.insert_run(&RunRecord {
            ts_start: 10,
            ts_end: 40,
            station: 2,
            program: Some(0),
            source: "program".into(),
            duration: 30,
            flow_volume: None,
        })
        .await
        .unwrap();

        let (status, body) = call(&router, "GET", "/api/runs?limit=5").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["station"], 2);
        assert_eq!(body[0]["duration"], 30);
    }

    // -- commands -----------------------------------------------------------

    #[tokio::test]
    async fn run_station_enqueues_command() {
        let (router, mut rx, _db) = app(4).await;
        let (status, _) = call(&router, "POST", "/api/stations/2/run?seconds=300").await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(
            rx.try_recv().unwrap(),
            Command::RunStation {
                station: 2,
                seconds: 300
            }
        );
    }

    #[tokio::test]
    async fn unknown_or_master_station_is_not_found() {
        let (router, mut rx, _db) = app(4).await;
        let (status, _) = call(&router, "POST", "/api/stations/42/run?seconds=60").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(&router, "POST", "/api/stations/7/run?seconds=60").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn non_positive_seconds_rejected() {
        let (router, _rx, _db) = app(4).await;
        let (status, _) = call(&router, "POST", "/api/stations/1/run?seconds=0").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn run_program_defaults_to_full_water_level() {
        let (router, mut rx, _db) = app(4).await;
        let (status, _) = call(&router, "POST", "/api/programs/0/run").await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(
            rx.try_recv().unwrap(),
            Command::RunProgram {
                program: 0,
                use_weather: false
            }
        );

        let (status, _) = call(&router, "POST", "/api/programs/0/run?use_weather=true").await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(
            rx.try_recv().unwrap(),
            Command::RunProgram {
                program: 0,
                use_weather: true
            }
        );

        let (status, _) = call(&router, "POST", "/api/programs/1/run").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn simple_commands_map_to_controller_commands() {
        let (router, mut rx, _db) = app(8).await;
        for uri in ["/api/stop", "/api/disable", "/api/enable", "/api/rain-delay?hours=24", "/api/water-level?percent=80"] {
            let (status, _) = call(&router, "POST", uri).await;
            assert_eq!(status, StatusCode::ACCEPTED, "{uri}");
        }
        let mut got = Vec::new();
        while let Ok(c) = rx.try_recv() {
            got.push(c);
        }
        assert_eq!(
            got,
            vec![
                Command::StopAll,
                Command::SetEnabled(false),
                Command::SetEnabled(true),
                Command::SetRainDelay { hours: 24 },
                Command::SetWaterLevel(80),
            ]
        );
    }

    #[tokio::test]
    async fn water_level_above_limit_rejected() {
        let (router, _rx, _db) = app(4).await;
        let (status, _) = call(&router, "POST", "/api/water-level?percent=300").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn full_command_queue_is_unavailable() {
        let (router, _rx, _db) = app(1).await;
        let (status, _) = call(&router, "POST", "/api/stop").await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let (status, _) = call(&router, "POST", "/api/stop").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }
}
