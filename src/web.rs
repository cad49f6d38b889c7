//! HTTP control surface: status, manual irrigation, mode/threshold
//! changes, and schedule CRUD.
//!
//! Manual starts are accepted and run in the background; the handler
//! answers immediately with 202, or 409 when a session is already active.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::auto::{AutoController, Mode};
use crate::error::RigError;
use crate::interlock::Irrigator;
use crate::scheduler::ScheduleEngine;
use crate::store::{ScheduleSpec, ScheduleStore};

// ---------------------------------------------------------------------------
// State & error mapping
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<AutoController>,
    pub engine: Arc<ScheduleEngine>,
    pub store: Arc<ScheduleStore>,
    pub irrigator: Arc<Irrigator>,
    pub known_zones: BTreeSet<u8>,
}

impl IntoResponse for RigError {
    fn into_response(self) -> Response {
        let status = match &self {
            RigError::InterlockBusy { .. } => StatusCode::CONFLICT,
            RigError::Validation(_) => StatusCode::BAD_REQUEST,
            RigError::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/history", get(api_history))
        .route("/api/irrigation/start", post(api_start))
        .route("/api/irrigation/stop", post(api_stop))
        .route("/api/irrigation/mode", post(api_mode))
        .route("/api/irrigation/threshold", post(api_threshold))
        .route("/api/schedules", get(api_schedules).post(api_add_schedule))
        .route("/api/schedules/next", get(api_next_schedules))
        .route(
            "/api/schedules/{id}",
            get(api_get_schedule)
                .put(api_update_schedule)
                .delete(api_delete_schedule),
        )
        .route("/api/schedules/{id}/toggle", post(api_toggle_schedule))
        .with_state(state)
}

async fn api_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.controller.status().await)
}

async fn api_history(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.irrigator.history(50))
}

#[derive(Deserialize)]
struct StartRequest {
    zone_id: u8,
    duration_sec: Option<u64>,
}

async fn api_start(
    State(state): State<AppState>,
    Json(req): Json<StartRequest>,
) -> Result<impl IntoResponse, RigError> {
    if !state.known_zones.contains(&req.zone_id) {
        return Err(RigError::validation(format!("unknown zone {}", req.zone_id)));
    }
    // Answer busy callers now rather than after the whole session. A caller
    // racing past this check just gets the rejection logged in background.
    let interlock = state.irrigator.interlock_state();
    if interlock.is_irrigating {
        return Err(RigError::InterlockBusy {
            current_zone: interlock.current_zone,
        });
    }

    let controller = Arc::clone(&state.controller);
    let zone_id = req.zone_id;
    let duration = req.duration_sec.map(Duration::from_secs);
    tokio::spawn(async move {
        if let Err(e) = controller.irrigate_zone(zone_id, duration).await {
            warn!(zone = zone_id, "manual irrigation failed: {e}");
        }
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "started": true, "zone_id": zone_id })),
    ))
}

async fn api_stop(State(state): State<AppState>) -> impl IntoResponse {
    state.irrigator.emergency_stop();
    Json(json!({ "stopped": true }))
}

#[derive(Deserialize)]
struct ModeRequest {
    mode: String,
}

async fn api_mode(
    State(state): State<AppState>,
    Json(req): Json<ModeRequest>,
) -> Result<impl IntoResponse, RigError> {
    let mode: Mode = req.mode.parse()?;
    state.controller.set_mode(mode).await;
    Ok(Json(json!({ "mode": mode })))
}

#[derive(Deserialize)]
struct ThresholdRequest {
    zone_id: u8,
    value: f64,
}

async fn api_threshold(
    State(state): State<AppState>,
    Json(req): Json<ThresholdRequest>,
) -> Result<impl IntoResponse, RigError> {
    state.controller.set_threshold(req.zone_id, req.value)?;
    Ok(Json(json!({ "zone_id": req.zone_id, "value": req.value })))
}

async fn api_schedules(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.store.list())
}

async fn api_next_schedules(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.engine.next_schedules(10))
}

async fn api_add_schedule(
    State(state): State<AppState>,
    Json(spec): Json<ScheduleSpec>,
) -> Result<impl IntoResponse, RigError> {
    let entry = state.store.add(spec)?;
    Ok((StatusCode::CREATED, Json(entry)))
}

async fn api_get_schedule(
    State(state): State<AppState>,
    Path(id): Path<u32>,
) -> Result<impl IntoResponse, RigError> {
    let entry = state.store.get(id).ok_or(RigError::NotFound(id))?;
    Ok(Json(entry))
}

async fn api_update_schedule(
    State(state): State<AppState>,
    Path(id): Path<u32>,
    Json(spec): Json<ScheduleSpec>,
) -> Result<impl IntoResponse, RigError> {
    Ok(Json(state.store.update(id, spec)?))
}

async fn api_delete_schedule(
    State(state): State<AppState>,
    Path(id): Path<u32>,
) -> Result<impl IntoResponse, RigError> {
    state.store.delete(id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn api_toggle_schedule(
    State(state): State<AppState>,
    Path(id): Path<u32>,
) -> Result<impl IntoResponse, RigError> {
    let enabled = state.store.toggle(id)?;
    Ok(Json(json!({ "id": id, "enabled": enabled })))
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: AppState, bind: &str) -> anyhow::Result<()> {
    let listener = TcpListener::bind(bind).await?;
    info!(addr = %listener.local_addr()?, "api listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interlock::{IrrigatorConfig, Trigger};
    use crate::relay::MockRelayBank;
    use crate::scheduler::EngineConfig;
    use crate::sensor::{FixedSensorBus, SensorPort};
    use crate::state::EventLog;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::Value;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tower::ServiceExt;

    fn test_state(dir: &tempfile::TempDir) -> AppState {
        let known_zones: BTreeSet<u8> = [1, 2, 3].into_iter().collect();
        let events = EventLog::shared();
        let irrigator = Arc::new(Irrigator::new(
            Box::new(MockRelayBank::with_zones(3)),
            Arc::clone(&events),
            IrrigatorConfig {
                settle: Duration::from_millis(1),
                max_duration: Duration::from_secs(1800),
                poll_interval: Duration::from_millis(1),
            },
        ));
        let sensors: Arc<Mutex<Box<dyn SensorPort>>> = Arc::new(Mutex::new(Box::new(
            FixedSensorBus::new(&[(1, 50.0), (2, 50.0), (3, 50.0)], Some(80.0)),
        )));
        let thresholds = Arc::new(std::sync::RwLock::new(HashMap::new()));
        let store = Arc::new(
            ScheduleStore::load(dir.path().join("schedules.json"), known_zones.clone()).unwrap(),
        );
        let controller = AutoController::new(
            Arc::clone(&irrigator),
            Arc::clone(&sensors),
            Arc::clone(&thresholds),
            Arc::clone(&events),
            Arc::new(|_| {}),
            vec![1, 2, 3],
            crate::auto::AutoConfig {
                default_duration: Duration::from_millis(5),
                zone_interval: Duration::from_millis(1),
                ..crate::auto::AutoConfig::default()
            },
        );
        let engine = ScheduleEngine::new(
            Arc::clone(&store),
            Arc::clone(&irrigator),
            sensors,
            thresholds,
            events,
            EngineConfig::default(),
        );
        AppState {
            controller,
            engine,
            store,
            irrigator,
            known_zones,
        }
    }

    async fn request(
        router: &Router,
        method: &str,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(v) => builder
                .header("content-type", "application/json")
                .body(Body::from(v.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    fn weekly_body(zone: u8) -> Value {
        json!({
            "type": "schedule",
            "days": [1, 4],
            "start_time": "06:00",
            "zone_id": zone,
            "duration": 300
        })
    }

    // -- status -------------------------------------------------------------

    #[tokio::test]
    async fn status_reports_mode_and_thresholds() {
        let dir = tempfile::tempdir().unwrap();
        let router = router(test_state(&dir));

        let (status, body) = request(&router, "GET", "/api/status", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["mode"], "manual");
        assert_eq!(body["is_irrigating"], false);
        assert_eq!(body["zone_thresholds"]["1"], 40.0);
    }

    // -- manual irrigation --------------------------------------------------

    #[tokio::test]
    async fn start_accepts_and_runs_in_background() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);
        let router = router(state.clone());

        let (status, body) = request(
            &router,
            "POST",
            "/api/irrigation/start",
            Some(json!({ "zone_id": 2, "duration_sec": 1 })),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["zone_id"], 2);

        // The session runs off-request; wait for its history record.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            let history = state.irrigator.history(1);
            if !history.is_empty() {
                assert_eq!(history[0].zone_id, 2);
                assert_eq!(history[0].trigger, Trigger::Manual);
                break;
            }
            assert!(std::time::Instant::now() < deadline, "session never ran");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn start_unknown_zone_is_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        let router = router(test_state(&dir));

        let (status, body) = request(
            &router,
            "POST",
            "/api/irrigation/start",
            Some(json!({ "zone_id": 9 })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("unknown zone"));
    }

    #[tokio::test]
    async fn start_while_busy_is_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);
        let router = router(state.clone());

        let blocker = Arc::clone(&state.irrigator);
        let handle = tokio::spawn(async move {
            blocker
                .irrigate(1, Duration::from_millis(200), Trigger::Manual)
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let (status, body) = request(
            &router,
            "POST",
            "/api/irrigation/start",
            Some(json!({ "zone_id": 2 })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body["error"].as_str().unwrap().contains("zone 1"));

        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn stop_halts_an_active_session() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);
        let router = router(state.clone());

        let blocker = Arc::clone(&state.irrigator);
        let handle = tokio::spawn(async move {
            blocker
                .irrigate(1, Duration::from_secs(600), Trigger::Manual)
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(state.irrigator.is_irrigating());

        let (status, _) = request(&router, "POST", "/api/irrigation/stop", None).await;
        assert_eq!(status, StatusCode::OK);

        let entry = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(entry.status, crate::interlock::SessionStatus::Interrupted);
        assert!(!state.irrigator.is_irrigating());
    }

    // -- mode & threshold ---------------------------------------------------

    #[tokio::test]
    async fn mode_change_round_trips_through_status() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);
        let router = router(state.clone());

        let (status, _) = request(
            &router,
            "POST",
            "/api/irrigation/mode",
            Some(json!({ "mode": "schedule" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (_, body) = request(&router, "GET", "/api/status", None).await;
        assert_eq!(body["mode"], "schedule");

        state.controller.set_mode(Mode::Manual).await;
    }

    #[tokio::test]
    async fn unknown_mode_is_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        let router = router(test_state(&dir));
        let (status, _) = request(
            &router,
            "POST",
            "/api/irrigation/mode",
            Some(json!({ "mode": "turbo" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn threshold_update_applies_and_validates() {
        let dir = tempfile::tempdir().unwrap();
        let router = router(test_state(&dir));

        let (status, _) = request(
            &router,
            "POST",
            "/api/irrigation/threshold",
            Some(json!({ "zone_id": 1, "value": 55.0 })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (_, body) = request(&router, "GET", "/api/status", None).await;
        assert_eq!(body["zone_thresholds"]["1"], 55.0);

        let (status, _) = request(
            &router,
            "POST",
            "/api/irrigation/threshold",
            Some(json!({ "zone_id": 1, "value": 150.0 })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    // -- schedules ----------------------------------------------------------

    #[tokio::test]
    async fn schedule_crud_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let router = router(test_state(&dir));

        let (status, created) =
            request(&router, "POST", "/api/schedules", Some(weekly_body(1))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["id"], 1);
        assert_eq!(created["type"], "schedule");

        let (status, list) = request(&router, "GET", "/api/schedules", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(list.as_array().unwrap().len(), 1);

        let (status, fetched) = request(&router, "GET", "/api/schedules/1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(fetched["zone_id"], 1);

        let (status, _) = request(&router, "GET", "/api/schedules/99", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, toggled) =
            request(&router, "POST", "/api/schedules/1/toggle", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(toggled["enabled"], false);

        let (status, updated) =
            request(&router, "PUT", "/api/schedules/1", Some(weekly_body(2))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(updated["zone_id"], 2);

        let (status, _) = request(&router, "DELETE", "/api/schedules/1", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, _) = request(&router, "DELETE", "/api/schedules/1", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn invalid_schedule_is_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        let router = router(test_state(&dir));

        let mut body = weekly_body(1);
        body["start_time"] = json!("noon");
        let (status, _) = request(&router, "POST", "/api/schedules", Some(body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) =
            request(&router, "POST", "/api/schedules", Some(weekly_body(9))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn next_schedules_lists_upcoming_runs() {
        let dir = tempfile::tempdir().unwrap();
        let router = router(test_state(&dir));

        let body = json!({
            "type": "schedule",
            "days": [0, 1, 2, 3, 4, 5, 6],
            "start_time": "12:00",
            "zone_id": 1,
            "duration": 60
        });
        request(&router, "POST", "/api/schedules", Some(body)).await;

        let (status, upcoming) = request(&router, "GET", "/api/schedules/next", None).await;
        assert_eq!(status, StatusCode::OK);
        let runs = upcoming.as_array().unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0]["zone_id"], 1);
    }
}
