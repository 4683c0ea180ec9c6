//! Session coordinator — spec.md §4.G.
//!
//! Tracks connected WebSocket clients, assigns identity/color, arbitrates
//! which single session holds control of the hardware, and enforces the
//! inbound message taxonomy (non-controllers can't drive the device).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, RwLock};

use crate::spatial::Point3;

const COLOR_PALETTE: &[&str] = &[
    "#e6194b", "#3cb44b", "#ffe119", "#4363d8", "#f58231", "#911eb4", "#46f0f0", "#f032e6",
];

/// Inbound message kinds a non-controller session is allowed to send.
const NON_CONTROLLER_ALLOWED: &[&str] = &["client_cursor", "client_name", "ping"];

#[derive(Debug, Clone, Serialize)]
pub struct PeerSummary {
    pub id: u64,
    pub name: String,
    pub color: &'static str,
    pub last_cursor: Option<Point3>,
}

#[derive(Clone)]
struct SessionEntry {
    outbound: mpsc::UnboundedSender<Value>,
    name: String,
    color: &'static str,
    last_cursor: Option<Point3>,
}

struct Registry {
    sessions: HashMap<u64, SessionEntry>,
    controller: Option<u64>,
}

pub struct SessionCoordinator {
    registry: RwLock<Registry>,
    next_id: AtomicU64,
    broadcasts: broadcast::Sender<(Option<u64>, Value)>,
}

impl SessionCoordinator {
    pub fn new() -> Arc<Self> {
        let (broadcasts, _) = broadcast::channel(512);
        Arc::new(Self {
            registry: RwLock::new(Registry { sessions: HashMap::new(), controller: None }),
            next_id: AtomicU64::new(1),
            broadcasts,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<(Option<u64>, Value)> {
        self.broadcasts.subscribe()
    }

    /// Broadcast to all sessions except `exclude` (use `None` to reach
    /// everyone).
    pub fn broadcast(&self, exclude: Option<u64>, message: Value) {
        let _ = self.broadcasts.send((exclude, message));
    }

    /// Reply directly to one session's own outbound channel, bypassing
    /// the shared broadcast bus (used for request/reply messages like
    /// `pong`, `synced`, or a `config` getter).
    pub async fn send_to(&self, id: u64, message: Value) {
        if let Some(entry) = self.registry.read().await.sessions.get(&id) {
            let _ = entry.outbound.send(message);
        }
    }

    /// Register a new connection, assign it color/id, and make it the
    /// new controller (most-recent-connect-wins). Returns (my id, the
    /// previous controller id if one is being displaced).
    pub async fn join(&self, outbound: mpsc::UnboundedSender<Value>) -> (u64, Option<u64>) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let color = COLOR_PALETTE[(id as usize) % COLOR_PALETTE.len()];
        let mut reg = self.registry.write().await;
        reg.sessions.insert(id, SessionEntry { outbound, name: format!("Pilot {id}"), color, last_cursor: None });
        let previous = reg.controller.replace(id);
        drop(reg);

        self.broadcast(
            None,
            serde_json::json!({ "type": "client_joined", "id": id, "name": format!("Pilot {id}"), "color": color }),
        );
        self.broadcast(None, serde_json::json!({ "type": "control_changed", "controller": id }));
        (id, previous)
    }

    /// Drop a session. If it held control, control is released (no
    /// controller) and the caller must lift the pen as a safety measure.
    pub async fn leave(&self, id: u64) -> bool {
        let mut reg = self.registry.write().await;
        reg.sessions.remove(&id);
        let was_controller = reg.controller == Some(id);
        if was_controller {
            reg.controller = None;
        }
        drop(reg);

        self.broadcast(None, serde_json::json!({ "type": "client_left", "id": id }));
        if was_controller {
            self.broadcast(None, serde_json::json!({ "type": "control_changed", "controller": Value::Null }));
        }
        was_controller
    }

    pub async fn is_controller(&self, id: u64) -> bool {
        self.registry.read().await.controller == Some(id)
    }

    pub async fn controller(&self) -> Option<u64> {
        self.registry.read().await.controller
    }

    pub async fn set_name(&self, id: u64, name: String) {
        let mut reg = self.registry.write().await;
        if let Some(entry) = reg.sessions.get_mut(&id) {
            entry.name = name.clone();
            let color = entry.color;
            drop(reg);
            self.broadcast(None, serde_json::json!({ "type": "client_updated", "id": id, "name": name, "color": color }));
        }
    }

    pub async fn set_cursor(&self, id: u64, cursor: Point3) {
        let mut reg = self.registry.write().await;
        if let Some(entry) = reg.sessions.get_mut(&id) {
            entry.last_cursor = Some(cursor);
        }
        drop(reg);
        self.broadcast(Some(id), serde_json::json!({ "type": "client_cursor", "id": id, "cursor": cursor }));
    }

    pub async fn peers(&self, exclude: u64) -> Vec<PeerSummary> {
        let reg = self.registry.read().await;
        reg.sessions
            .iter()
            .filter(|(id, _)| **id != exclude)
            .map(|(id, e)| PeerSummary { id: *id, name: e.name.clone(), color: e.color, last_cursor: e.last_cursor })
            .collect()
    }

    pub async fn color_of(&self, id: u64) -> Option<&'static str> {
        self.registry.read().await.sessions.get(&id).map(|e| e.color)
    }

    /// True if `kind` is permitted from a session that does not hold
    /// control (spec.md §4.G message taxonomy).
    pub fn non_controller_may_send(kind: &str) -> bool {
        NON_CONTROLLER_ALLOWED.contains(&kind)
    }
}
