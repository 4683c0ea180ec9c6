//! WebSocket surface — spec.md §4.H, path `/spatial`.
//!
//! One native axum WebSocket per client, relayed against the session
//! coordinator's broadcast bus with `tokio::select!` the same way the
//! hardware-telemetry socket in the UWB simulator relays its channel.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::app::AppState;
use crate::spatial::Point3;
use ebb_protocol::Units;

pub async fn ws_handler(ws: WebSocketUpgrade, State(app): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, app))
}

async fn handle_socket(socket: WebSocket, app: AppState) {
    let (mut sink, mut stream) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Value>();

    let (id, _previous_controller) = app.sessions.join(outbound_tx.clone()).await;
    send_welcome(&app, id, &outbound_tx).await;

    let mut broadcasts = app.sessions.subscribe();

    let forward = async {
        loop {
            tokio::select! {
                Ok((exclude, msg)) = broadcasts.recv() => {
                    if exclude != Some(id) && sink.send(Message::Text(msg.to_string())).await.is_err() {
                        break;
                    }
                }
                Some(msg) = outbound_rx.recv() => {
                    if sink.send(Message::Text(msg.to_string())).await.is_err() {
                        break;
                    }
                }
                else => break,
            }
        }
    };

    let receive = async {
        while let Some(Ok(msg)) = stream.next().await {
            if let Message::Text(text) = msg {
                handle_inbound(&app, id, &text).await;
            }
        }
    };

    tokio::pin!(forward);
    tokio::pin!(receive);
    tokio::select! {
        _ = &mut forward => {}
        _ = &mut receive => {}
    }

    let was_controller = app.sessions.leave(id).await;
    if was_controller {
        if let Err(e) = app.facade.pen_up().await {
            warn!(%e, "failed to lift pen on controller disconnect");
        }
    }
}

use futures_util::{SinkExt, StreamExt};

async fn send_welcome(app: &AppState, id: u64, outbound: &mpsc::UnboundedSender<Value>) {
    let controller = app.sessions.controller().await;
    let peers = app.sessions.peers(id).await;
    let color = app.sessions.color_of(id).await;
    let position = app.facade.position().await;
    let pen_state = app.facade.pen_state().await;
    let path = app.facade.path_history().await;
    let predicted = app.spatial.predicted_position().await;

    let welcome = json!({
        "type": "welcome",
        "id": id,
        "color": color,
        "controller": controller,
        "peers": peers,
        "position": { "x": position.x, "y": position.y },
        "predicted_position": predicted,
        "pen_state": pen_state.to_string(),
        "path_history": path,
    });
    let _ = outbound.send(welcome);
}

async fn handle_inbound(app: &AppState, id: u64, raw: &str) {
    let value: Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(_) => return,
    };
    let kind = value.get("type").and_then(Value::as_str).unwrap_or("");

    let is_controller = app.sessions.is_controller(id).await;
    if !is_controller && !crate::session::SessionCoordinator::non_controller_may_send(kind) {
        debug!(id, kind, "dropping hardware-driving message from non-controller");
        return;
    }

    match kind {
        "ping" => app.sessions.send_to(id, json!({ "type": "pong", "id": id })).await,
        "client_name" => {
            if let Some(name) = value.get("name").and_then(Value::as_str) {
                app.sessions.set_name(id, name.to_string()).await;
            }
        }
        "client_cursor" => {
            if let (Some(x), Some(y)) = (
                value.get("x").and_then(Value::as_f64),
                value.get("y").and_then(Value::as_f64),
            ) {
                app.sessions.set_cursor(id, Point3 { x, y, z: 0.0 }).await;
            }
        }
        "spatial" => handle_spatial(app, &value).await,
        "dpad" => handle_dpad(app, &value).await,
        "event" => handle_event(app, id, &value).await,
        "config" => match value.get("config") {
            Some(raw) => {
                if let Ok(cfg) = serde_json::from_value(raw.clone()) {
                    app.spatial.configure(cfg).await;
                    app.sessions.broadcast(None, json!({ "type": "config_updated" }));
                }
            }
            None => {
                let cfg = app.spatial.config().await;
                app.sessions.send_to(id, json!({ "type": "config", "config": cfg })).await;
            }
        },
        "sync" => {
            let position = app.facade.position().await;
            app.spatial
                .sync_position(Point3 { x: position.x as f64, y: position.y as f64, z: 0.0 })
                .await;
            app.sessions.send_to(id, json!({ "type": "synced" })).await;
        }
        _ => {}
    }
}

fn movement_callback(app: &AppState) -> crate::spatial::MovementCallback {
    let facade = app.facade.clone();
    Box::new(move |dx, dy, pen_down| {
        let facade = facade.clone();
        Box::pin(async move {
            if pen_down {
                let _ = facade.line_to(dx, dy, Units::Mm, None, None).await;
            } else {
                let _ = facade.move_xy(dx, dy, Units::Mm, None, None).await;
            }
        })
    })
}

async fn handle_spatial(app: &AppState, value: &Value) {
    let mode = value.get("mode").and_then(Value::as_str).unwrap_or("position");

    if mode == "velocity" {
        let vx = value.get("vx").and_then(Value::as_f64).unwrap_or(0.0);
        let vy = value.get("vy").and_then(Value::as_f64).unwrap_or(0.0);
        let angular = value.get("angular").and_then(Value::as_f64).unwrap_or(0.0);
        app.spatial.submit_velocity(vx, vy, angular).await;
        app.spatial.start_velocity_loop(movement_callback(app)).await;
        return;
    }

    let Some(x) = value.get("x").and_then(Value::as_f64) else { return };
    let Some(y) = value.get("y").and_then(Value::as_f64) else { return };
    let z = value.get("z").and_then(Value::as_f64).unwrap_or(0.0);

    let callback = movement_callback(app);
    app.spatial.submit_position(Point3 { x, y, z }, &callback).await;
    let state = crate::spatial::SpatialState {
        position: app.spatial.position().await,
        velocity: Point3::default(),
        angular_velocity: 0.0,
        pen_down: app.facade.pen_state().await == ebb_protocol::PenState::Down,
    };
    app.sessions.broadcast(None, json!({ "type": "state", "state": state }));
}

async fn handle_dpad(app: &AppState, value: &Value) {
    const NUDGE_MM: f64 = 5.0;
    let Some(dir) = value.get("direction").and_then(Value::as_str) else { return };
    let (dx, dy) = match dir {
        "up" => (0.0, NUDGE_MM),
        "down" => (0.0, -NUDGE_MM),
        "left" => (-NUDGE_MM, 0.0),
        "right" => (NUDGE_MM, 0.0),
        _ => return,
    };
    let _ = app.facade.move_xy(dx, dy, Units::Mm, None, None).await;
}

async fn handle_event(app: &AppState, id: u64, value: &Value) {
    let Some(action) = value.get("action").and_then(Value::as_str) else { return };

    // `version`/`nickname` are per-request replies to the requester, not
    // hardware-state broadcasts (spec.md §4.G outbound broadcast catalog).
    match action {
        "version" => {
            let reply = match app.facade.get_version().await {
                Ok(version) => json!({ "type": "version", "version": version }),
                Err(e) => json!({ "type": "error", "error": e.to_string() }),
            };
            app.sessions.send_to(id, reply).await;
            return;
        }
        "nickname" => {
            let reply = match value.get("name").and_then(Value::as_str) {
                Some(name) => match app.facade.set_nickname(name).await {
                    Ok(()) => json!({ "type": "nickname", "nickname": name }),
                    Err(e) => json!({ "type": "error", "error": e.to_string() }),
                },
                None => match app.facade.get_nickname().await {
                    Ok(nickname) => json!({ "type": "nickname", "nickname": nickname }),
                    Err(e) => json!({ "type": "error", "error": e.to_string() }),
                },
            };
            app.sessions.send_to(id, reply).await;
            return;
        }
        _ => {}
    }

    let result = match action {
        "pen_up" => {
            app.spatial.set_pen_down(false).await;
            app.facade.pen_up().await
        }
        "pen_down" => {
            app.spatial.set_pen_down(true).await;
            app.facade.pen_down().await
        }
        "pen_toggle" => app.facade.pen_toggle().await.map(|_| ()),
        "pen_sync" => app.facade.pen_sync().await.map(|_| ()),
        "stop" => {
            app.spatial.stop().await;
            app.facade.emergency_stop().await
        }
        "home" => {
            app.spatial.reset_to_home().await;
            app.facade.home(None).await
        }
        "reset" => app.facade.reset_device().await,
        "reboot" => app.facade.reboot().await,
        "motors_on" => app.facade.motors_on().await,
        "motors_off" => app.facade.motors_off().await,
        _ => return,
    };
    let kind = if result.is_ok() { "state" } else { "error" };
    let payload = match result {
        Ok(()) => json!({ "type": kind, "action": action }),
        Err(e) => json!({ "type": kind, "error": e.to_string() }),
    };
    app.sessions.broadcast(None, payload);
}
