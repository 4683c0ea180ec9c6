use std::time::Duration;

use ebb_protocol::ControlError;
use tokio::sync::oneshot;

/// Response-shape classification for a serial command, per spec.md §4.A.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// Expects a trailing acknowledgement token only (no data line).
    Command,
    /// Expects a data line followed by a trailing acknowledgement.
    QueryWithTerminator,
    /// Expects a data line only, no acknowledgement.
    QueryWithoutTerminator,
}

#[derive(Debug, Clone)]
pub struct EnvelopeResponse {
    pub data_line: Option<String>,
}

/// One serial exchange: the literal ASCII command, its classification,
/// a timeout, and a single-producer completion channel. Envelopes are
/// serialized in arrival order by the driver's FIFO mailbox.
pub struct Envelope {
    pub text: String,
    pub kind: CommandKind,
    pub timeout: Duration,
    pub reply: oneshot::Sender<Result<EnvelopeResponse, ControlError>>,
}

impl Envelope {
    pub fn new(
        text: impl Into<String>,
        kind: CommandKind,
        timeout: Duration,
    ) -> (Self, oneshot::Receiver<Result<EnvelopeResponse, ControlError>>) {
        let (tx, rx) = oneshot::channel();
        (
            Envelope {
                text: text.into(),
                kind,
                timeout,
                reply: tx,
            },
            rx,
        )
    }
}

/// Default per-envelope deadline (spec.md §4.A).
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Slack added on top of a motion command's computed duration.
pub const MOTION_SLACK: Duration = Duration::from_secs(5);
