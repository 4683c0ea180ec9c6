//! REST surface — spec.md §4.H, §6 (abbreviated HTTP table).
//!
//! Thin translations over the facade, motion/servo state, and job queue.
//! Handlers return `ApiResult<Json<_>>`; `ApiError` maps `ControlError`
//! variants onto the status codes spec.md §7 prescribes.

use std::collections::HashMap;

use axum::extract::{Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use ebb_protocol::{JobPriority, PenState, Units};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::app::AppState;
use crate::error::{ApiError, ApiResult};
use crate::facade::MiniCommand;
use crate::queue::JobPayload;
use crate::servo::ServoConfig;
use crate::svg::{path_to_commands, path_to_svg, LineSegmentConverter, SvgConverter, SvgOptions};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/history", get(history))
        .route("/ports", get(ports))
        .route("/connect", post(connect))
        .route("/disconnect", post(disconnect))
        .route("/initialize", post(initialize))
        .route("/version", get(version))
        .route("/nickname", get(get_nickname).post(set_nickname))
        .route("/reboot", post(reboot))
        .route("/reset", post(reset))
        .route("/pen/up", post(pen_up))
        .route("/pen/down", post(pen_down))
        .route("/pen/toggle", post(pen_toggle))
        .route("/pen/sync", post(pen_sync))
        .route("/pen/status", get(pen_status))
        .route("/pen/config", get(get_pen_config).post(set_pen_config))
        .route("/home", post(home))
        .route("/move", post(move_xy))
        .route("/moveto", post(move_to))
        .route("/lineto", post(line_to))
        .route("/execute", post(execute))
        .route("/batch", post(batch))
        .route("/position", get(position))
        .route("/speed", get(get_speed).post(set_speed))
        .route("/motors/on", post(motors_on))
        .route("/motors/off", post(motors_off))
        .route("/stop", post(stop))
        .route("/reorigin", post(reorigin))
        .route("/queue", get(queue_list).post(queue_add))
        .route("/queue/:id", delete(queue_delete))
        .route("/queue/pause", post(queue_pause))
        .route("/queue/resume", post(queue_resume))
        .route("/queue/clear", post(queue_clear))
        .route("/queue/history", get(queue_history))
        .route("/svg", post(svg_submit))
        .route("/svg/upload", post(svg_upload))
        .route("/svg/preview", post(svg_preview))
        .route("/path", get(path_get))
        .route("/path/clear", post(path_clear))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn status(Query(params): Query<HashMap<String, String>>, State(app): State<AppState>) -> Json<Value> {
    let hardware = params.get("hardware").map(|v| v == "true").unwrap_or(false);
    let facade_state = app.facade.state().await;
    let position = app.facade.position().await;
    let pen_state = app.facade.pen_state().await;

    let mut payload = json!({
        "facade_state": facade_state,
        "model": app.facade.model_name(),
        "position": { "x": position.x, "y": position.y },
        "pen_state": pen_state.to_string(),
        "queue_paused": app.queue.is_paused().await,
    });

    if hardware {
        payload["resolution"] = json!(app.facade.resolution_for_status().await);
    }

    Json(payload)
}

async fn history(Query(params): Query<HashMap<String, String>>, State(app): State<AppState>) -> Json<Value> {
    let limit: usize = params.get("limit").and_then(|v| v.parse().ok()).unwrap_or(100);
    let mut entries = app.facade.action_history().await;
    if entries.len() > limit {
        entries = entries.split_off(entries.len() - limit);
    }
    Json(json!({ "history": entries }))
}

async fn ports() -> Json<Value> {
    let found = crate::serial::discovery::discover_ebb_ports();
    Json(json!({ "ports": found }))
}

#[derive(Deserialize)]
struct ConnectBody {
    port: Option<String>,
    #[serde(default)]
    nickname: Option<String>,
}

async fn connect(State(app): State<AppState>, Json(body): Json<ConnectBody>) -> ApiResult<Json<Value>> {
    let port = match body.port {
        Some(port) => Some(port),
        None => match body.nickname {
            Some(nickname) => crate::serial::resolve_nickname(&nickname).await,
            None => None,
        },
    };
    app.facade.connect(port).await.map_err(ApiError::from)?;
    Ok(Json(json!({ "connected": true })))
}

async fn disconnect(State(app): State<AppState>) -> ApiResult<StatusCode> {
    app.facade.disconnect().await.map_err(ApiError::from)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn initialize(State(app): State<AppState>) -> ApiResult<Json<Value>> {
    app.facade.ensure_ready(None).await.map_err(ApiError::from)?;
    Ok(Json(json!({ "state": app.facade.state().await })))
}

async fn version(State(app): State<AppState>) -> ApiResult<Json<Value>> {
    let v = app.facade.get_version().await.map_err(ApiError::from)?;
    Ok(Json(json!({ "version": v })))
}

async fn get_nickname(State(app): State<AppState>) -> ApiResult<Json<Value>> {
    let name = app.facade.get_nickname().await.map_err(ApiError::from)?;
    Ok(Json(json!({ "nickname": name })))
}

#[derive(Deserialize)]
struct NicknameBody {
    name: String,
}

async fn set_nickname(State(app): State<AppState>, Json(body): Json<NicknameBody>) -> ApiResult<StatusCode> {
    app.facade.set_nickname(&body.name).await.map_err(ApiError::from)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn reboot(State(app): State<AppState>) -> ApiResult<StatusCode> {
    app.facade.reboot().await.map_err(ApiError::from)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn reset(State(app): State<AppState>) -> ApiResult<StatusCode> {
    app.facade.reset_device().await.map_err(ApiError::from)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn pen_up(State(app): State<AppState>) -> ApiResult<Json<Value>> {
    app.facade.pen_up().await.map_err(ApiError::from)?;
    Ok(Json(json!({ "pen_state": app.facade.pen_state().await.to_string() })))
}

async fn pen_down(State(app): State<AppState>) -> ApiResult<Json<Value>> {
    app.facade.pen_down().await.map_err(ApiError::from)?;
    Ok(Json(json!({ "pen_state": app.facade.pen_state().await.to_string() })))
}

async fn pen_toggle(State(app): State<AppState>) -> ApiResult<Json<Value>> {
    let state = app.facade.pen_toggle().await.map_err(ApiError::from)?;
    Ok(Json(json!({ "pen_state": state.to_string() })))
}

async fn pen_sync(State(app): State<AppState>) -> ApiResult<Json<Value>> {
    let state = app.facade.pen_sync().await.map_err(ApiError::from)?;
    Ok(Json(json!({ "pen_state": state.to_string() })))
}

async fn pen_status(State(app): State<AppState>) -> Json<Value> {
    let state = app.facade.pen_state().await;
    Json(json!({ "pen_state": state.to_string(), "is_up": state == PenState::Up }))
}

async fn get_pen_config(State(app): State<AppState>) -> Json<Value> {
    Json(json!(app.facade.pen_config().await))
}

async fn set_pen_config(State(app): State<AppState>, Json(cfg): Json<ServoConfig>) -> ApiResult<StatusCode> {
    app.facade.configure_pen(cfg).await.map_err(ApiError::from)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct HomeBody {
    rate: Option<f64>,
}

async fn home(State(app): State<AppState>, Json(body): Json<HomeBody>) -> ApiResult<Json<Value>> {
    app.facade.home(body.rate).await.map_err(ApiError::from)?;
    Ok(Json(position_payload(&app).await))
}

#[derive(Deserialize)]
struct MoveBody {
    dx: f64,
    dy: f64,
    #[serde(default)]
    units: Units,
    speed: Option<f64>,
    duration: Option<f64>,
}

#[derive(Deserialize)]
struct MoveToBody {
    x: f64,
    y: f64,
    #[serde(default)]
    units: Units,
}

async fn move_xy(
    State(app): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    Json(body): Json<MoveBody>,
) -> ApiResult<Json<Value>> {
    let coalesce_ms: Option<u64> = params.get("coalesce").and_then(|v| v.parse().ok());
    if coalesce_ms.filter(|ms| *ms > 0).is_some() {
        let position = app
            .coalesce_move
            .submit(body.dx, body.dy, body.units, coalesce_ms)
            .await
            .map_err(ApiError::from)?;
        return Ok(Json(json!({ "position": { "x": position.x, "y": position.y } })));
    }
    app.facade.move_xy(body.dx, body.dy, body.units, body.speed, body.duration).await.map_err(ApiError::from)?;
    Ok(Json(position_payload(&app).await))
}

async fn move_to(State(app): State<AppState>, Json(body): Json<MoveToBody>) -> ApiResult<Json<Value>> {
    app.facade.move_to(body.x, body.y, body.units).await.map_err(ApiError::from)?;
    Ok(Json(position_payload(&app).await))
}

async fn line_to(
    State(app): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    Json(body): Json<MoveBody>,
) -> ApiResult<Json<Value>> {
    let coalesce_ms: Option<u64> = params.get("coalesce").and_then(|v| v.parse().ok());
    if coalesce_ms.filter(|ms| *ms > 0).is_some() {
        let position = app
            .coalesce_lineto
            .submit(body.dx, body.dy, body.units, coalesce_ms)
            .await
            .map_err(ApiError::from)?;
        return Ok(Json(json!({ "position": { "x": position.x, "y": position.y } })));
    }
    app.facade.line_to(body.dx, body.dy, body.units, body.speed, body.duration).await.map_err(ApiError::from)?;
    Ok(Json(position_payload(&app).await))
}

#[derive(Deserialize)]
struct ExecuteBody {
    commands: Vec<MiniCommand>,
}

async fn execute(State(app): State<AppState>, Json(body): Json<ExecuteBody>) -> ApiResult<Json<Value>> {
    app.facade.execute(body.commands).await.map_err(ApiError::from)?;
    Ok(Json(position_payload(&app).await))
}

#[derive(Deserialize)]
struct BatchEntry {
    endpoint: String,
    body: Value,
}

#[derive(Deserialize)]
struct BatchBody {
    commands: Vec<BatchEntry>,
}

async fn batch(State(app): State<AppState>, Json(body): Json<BatchBody>) -> ApiResult<Json<Value>> {
    let mut results = Vec::with_capacity(body.commands.len());
    for entry in body.commands {
        let outcome = dispatch_batch_entry(&app, &entry.endpoint, entry.body).await;
        results.push(match outcome {
            Ok(v) => json!({ "endpoint": entry.endpoint, "ok": true, "result": v }),
            Err(e) => json!({ "endpoint": entry.endpoint, "ok": false, "error": e.0.to_string() }),
        });
    }
    Ok(Json(json!({ "results": results })))
}

async fn dispatch_batch_entry(app: &AppState, endpoint: &str, body: Value) -> Result<Value, ApiError> {
    match endpoint {
        "pen/up" => {
            app.facade.pen_up().await?;
            Ok(json!({}))
        }
        "pen/down" => {
            app.facade.pen_down().await?;
            Ok(json!({}))
        }
        "home" => {
            let rate = body.get("rate").and_then(Value::as_f64);
            app.facade.home(rate).await?;
            Ok(json!({}))
        }
        "move" => {
            let body: MoveBody = serde_json::from_value(body)
                .map_err(|e| ApiError(ebb_protocol::ControlError::validation(e.to_string())))?;
            app.facade.move_xy(body.dx, body.dy, body.units, body.speed, body.duration).await?;
            Ok(json!({}))
        }
        "moveto" => {
            let body: MoveToBody = serde_json::from_value(body)
                .map_err(|e| ApiError(ebb_protocol::ControlError::validation(e.to_string())))?;
            app.facade.move_to(body.x, body.y, body.units).await?;
            Ok(json!({}))
        }
        "lineto" => {
            let body: MoveBody = serde_json::from_value(body)
                .map_err(|e| ApiError(ebb_protocol::ControlError::validation(e.to_string())))?;
            app.facade.line_to(body.dx, body.dy, body.units, body.speed, body.duration).await?;
            Ok(json!({}))
        }
        other => Err(ApiError(ebb_protocol::ControlError::validation(format!("unknown batch endpoint {other}")))),
    }
}

async fn position(State(app): State<AppState>) -> Json<Value> {
    Json(position_payload(&app).await)
}

async fn position_payload(app: &AppState) -> Value {
    let position = app.facade.position().await;
    let (mm_x, mm_y) = app.facade.position_mm().await;
    json!({
        "position": { "x": position.x, "y": position.y },
        "position_mm": { "x": mm_x, "y": mm_y },
    })
}

async fn get_speed(State(app): State<AppState>) -> Json<Value> {
    let (pen_up_ips, pen_down_ips) = app.facade.speeds().await;
    Json(json!({ "pen_up_ips": pen_up_ips, "pen_down_ips": pen_down_ips }))
}

#[derive(Deserialize)]
struct SpeedBody {
    pen_up_ips: Option<f64>,
    pen_down_ips: Option<f64>,
}

async fn set_speed(State(app): State<AppState>, Json(body): Json<SpeedBody>) -> Json<Value> {
    app.facade.set_speeds(body.pen_up_ips, body.pen_down_ips).await;
    let (pen_up_ips, pen_down_ips) = app.facade.speeds().await;
    Json(json!({ "pen_up_ips": pen_up_ips, "pen_down_ips": pen_down_ips }))
}

async fn motors_on(State(app): State<AppState>) -> ApiResult<StatusCode> {
    app.facade.motors_on().await.map_err(ApiError::from)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn motors_off(State(app): State<AppState>) -> ApiResult<StatusCode> {
    app.facade.motors_off().await.map_err(ApiError::from)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn stop(State(app): State<AppState>) -> ApiResult<StatusCode> {
    app.facade.emergency_stop().await.map_err(ApiError::from)?;
    app.spatial.stop().await;
    Ok(StatusCode::NO_CONTENT)
}

async fn reorigin(State(app): State<AppState>) -> ApiResult<Json<Value>> {
    app.facade.reorigin().await.map_err(ApiError::from)?;
    Ok(Json(position_payload(&app).await))
}

#[derive(Deserialize)]
struct QueueAddBody {
    #[serde(default)]
    priority: JobPriority,
    commands: Option<Vec<MiniCommand>>,
    svg: Option<String>,
}

async fn queue_list(State(app): State<AppState>) -> Json<Value> {
    Json(json!({ "jobs": app.queue.list().await }))
}

async fn queue_add(State(app): State<AppState>, Json(body): Json<QueueAddBody>) -> ApiResult<Json<Value>> {
    let payload = match (body.commands, body.svg) {
        (Some(cmds), _) => JobPayload::Commands(cmds),
        (None, Some(svg)) => JobPayload::Svg(svg),
        (None, None) => {
            return Err(ApiError(ebb_protocol::ControlError::validation("job requires commands or svg")))
        }
    };
    let id = app.queue.add(body.priority, payload).await;
    Ok(Json(json!({ "id": id })))
}

async fn queue_delete(State(app): State<AppState>, Path(id): Path<u64>) -> ApiResult<StatusCode> {
    if app.queue.cancel(id).await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError(ebb_protocol::ControlError::validation(format!("no such job {id}"))))
    }
}

async fn queue_pause(State(app): State<AppState>) -> StatusCode {
    app.queue.pause().await;
    StatusCode::NO_CONTENT
}

async fn queue_resume(State(app): State<AppState>) -> StatusCode {
    app.queue.resume().await;
    StatusCode::NO_CONTENT
}

async fn queue_clear(State(app): State<AppState>) -> StatusCode {
    app.queue.clear().await;
    StatusCode::NO_CONTENT
}

async fn queue_history(State(app): State<AppState>) -> Json<Value> {
    Json(json!({ "history": app.queue.history().await }))
}

#[derive(Deserialize)]
struct SvgBody {
    svg: String,
    #[serde(default)]
    priority: JobPriority,
    #[serde(default)]
    scale: Option<f64>,
}

async fn svg_submit(State(app): State<AppState>, Json(body): Json<SvgBody>) -> ApiResult<Json<Value>> {
    let mut opts = SvgOptions::default();
    if let Some(scale) = body.scale {
        opts.scale = scale;
    }
    let converted = LineSegmentConverter
        .convert(&body.svg, &opts)
        .map_err(ApiError::from)?;
    let id = app.queue.add(body.priority, JobPayload::Commands(converted.commands)).await;
    Ok(Json(json!({ "id": id, "bounds": converted.bounds })))
}

async fn svg_preview(State(_app): State<AppState>, Json(body): Json<SvgBody>) -> ApiResult<Json<Value>> {
    let opts = SvgOptions::default();
    let converted = LineSegmentConverter
        .convert(&body.svg, &opts)
        .map_err(ApiError::from)?;
    Ok(Json(json!({ "command_count": converted.commands.len(), "bounds": converted.bounds })))
}

/// Multipart counterpart to `svg_submit`: accepts a single uploaded
/// file part (any field name) holding the SVG document, and an
/// optional `priority`/`scale` text field alongside it.
async fn svg_upload(State(app): State<AppState>, mut multipart: Multipart) -> ApiResult<Json<Value>> {
    let mut svg: Option<String> = None;
    let mut priority = JobPriority::default();
    let mut scale: Option<f64> = None;

    while let Some(field) = multipart.next_field().await.map_err(|e| {
        ApiError(ebb_protocol::ControlError::validation(format!("bad multipart upload: {e}")))
    })? {
        match field.name().unwrap_or("") {
            "priority" => {
                if let Ok(text) = field.text().await {
                    priority = serde_json::from_value(json!(text)).unwrap_or_default();
                }
            }
            "scale" => {
                if let Ok(text) = field.text().await {
                    scale = text.parse().ok();
                }
            }
            _ => {
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError(ebb_protocol::ControlError::validation(e.to_string())))?;
                svg = Some(String::from_utf8_lossy(&bytes).into_owned());
            }
        }
    }

    let svg = svg.ok_or_else(|| ApiError(ebb_protocol::ControlError::validation("upload had no SVG file part")))?;

    let mut opts = SvgOptions::default();
    if let Some(scale) = scale {
        opts.scale = scale;
    }
    let converted = LineSegmentConverter.convert(&svg, &opts).map_err(ApiError::from)?;
    let id = app.queue.add(priority, JobPayload::Commands(converted.commands)).await;
    Ok(Json(json!({ "id": id, "bounds": converted.bounds })))
}

async fn path_get(State(app): State<AppState>) -> Json<Value> {
    let history = app.facade.path_history().await;
    let commands = path_to_commands(&history);
    let svg = path_to_svg(&history);
    Json(json!({ "path": history, "commands": commands, "svg": svg }))
}

async fn path_clear(State(app): State<AppState>) -> StatusCode {
    app.facade.clear_path_history().await;
    StatusCode::NO_CONTENT
}
