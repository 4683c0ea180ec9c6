//! The serial driver: a single-task mailbox that owns the EBB connection
//! and serializes every command/query through it (spec.md §4.A, §5).
//!
//! No caller ever touches the underlying device handle directly — all
//! access goes through [`SerialDriver`]'s channel, which gives us the
//! "at most one envelope in flight" invariant for free: the actor task
//! processes messages one at a time.

use std::sync::Arc;
use std::time::Duration;

use ebb_protocol::{ControlError, FirmwareVersion};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use tokio_serial::SerialPortBuilderExt;
use tracing::{info, warn};

use super::discovery::{discover_ebb_ports, find_by_nickname};
use super::envelope::{CommandKind, Envelope, EnvelopeResponse};
use super::wire::{assemble_response, encode, lines_needed};

const BAUD_RATE: u32 = 9600;
const EXPECTED_PRODUCT_PREFIX: &str = "ebb";
const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(10);
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Default)]
pub struct ConnectionInfo {
    pub path: Option<String>,
    pub open: bool,
    pub firmware_version: Option<FirmwareVersion>,
    pub backoff: Duration,
    pub last_error: Option<String>,
}

impl ConnectionInfo {
    pub fn min_version(&self, other: FirmwareVersion) -> bool {
        self.firmware_version.map(|v| v.at_least(other)).unwrap_or(false)
    }
}

enum DriverMsg {
    Connect {
        port: Option<String>,
        reply: oneshot::Sender<Result<(), ControlError>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    Submit(Envelope),
    WriteRaw {
        text: String,
        reply: oneshot::Sender<Result<(), ControlError>>,
    },
}

/// Handle to the serial driver's background task.
#[derive(Clone)]
pub struct SerialDriver {
    tx: mpsc::Sender<DriverMsg>,
    info: Arc<RwLock<ConnectionInfo>>,
    error_hook: broadcast::Sender<()>,
}

impl SerialDriver {
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::channel(64);
        let info = Arc::new(RwLock::new(ConnectionInfo::default()));
        let (error_hook, _) = broadcast::channel(16);

        let task_info = info.clone();
        let task_hook = error_hook.clone();
        tokio::spawn(async move {
            run(rx, task_info, task_hook).await;
        });

        Self { tx, info, error_hook }
    }

    /// Subscribe to the "command errored" hook (spec.md §4.A): invoked on
    /// timeout or device error so dependent caches (pen state) can be
    /// invalidated.
    pub fn subscribe_command_errors(&self) -> broadcast::Receiver<()> {
        self.error_hook.subscribe()
    }

    pub async fn info(&self) -> ConnectionInfo {
        self.info.read().await.clone()
    }

    pub async fn connect(&self, port: Option<String>) -> Result<(), ControlError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(DriverMsg::Connect { port, reply })
            .await
            .map_err(|_| ControlError::NotConnected)?;
        rx.await.map_err(|_| ControlError::NotConnected)?
    }

    pub async fn disconnect(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(DriverMsg::Disconnect { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }

    pub async fn command(&self, text: impl Into<String>, timeout: Duration) -> Result<(), ControlError> {
        let (env, rx) = Envelope::new(text, CommandKind::Command, timeout);
        self.submit(env, rx).await.map(|_| ())
    }

    pub async fn query(
        &self,
        text: impl Into<String>,
        kind: CommandKind,
        timeout: Duration,
    ) -> Result<String, ControlError> {
        let (env, rx) = Envelope::new(text, kind, timeout);
        let resp = self.submit(env, rx).await?;
        resp.data_line.ok_or(ControlError::Timeout)
    }

    pub async fn write_raw(&self, text: impl Into<String>) -> Result<(), ControlError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(DriverMsg::WriteRaw { text: text.into(), reply })
            .await
            .map_err(|_| ControlError::NotConnected)?;
        rx.await.map_err(|_| ControlError::NotConnected)?
    }

    async fn submit(
        &self,
        env: Envelope,
        rx: oneshot::Receiver<Result<EnvelopeResponse, ControlError>>,
    ) -> Result<EnvelopeResponse, ControlError> {
        self.tx
            .send(DriverMsg::Submit(env))
            .await
            .map_err(|_| ControlError::NotConnected)?;
        rx.await.map_err(|_| ControlError::NotConnected)?
    }
}

type BoxedWrite = Box<dyn tokio::io::AsyncWrite + Unpin + Send>;
type BoxedRead = BufReader<Box<dyn tokio::io::AsyncRead + Unpin + Send>>;

struct OpenPort {
    write: BoxedWrite,
    reader: BoxedRead,
}

async fn run(
    mut rx: mpsc::Receiver<DriverMsg>,
    info: Arc<RwLock<ConnectionInfo>>,
    error_hook: broadcast::Sender<()>,
) {
    let mut port: Option<OpenPort> = None;

    while let Some(msg) = rx.recv().await {
        match msg {
            DriverMsg::Connect { port: requested, reply } => {
                let result = do_connect(requested, &info).await;
                match result {
                    Ok(opened) => {
                        port = Some(opened);
                        let _ = reply.send(Ok(()));
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }
            DriverMsg::Disconnect { reply } => {
                do_disconnect(&mut port, &info).await;
                let _ = reply.send(());
            }
            DriverMsg::WriteRaw { text, reply } => {
                let Some(p) = port.as_mut() else {
                    let _ = reply.send(Err(ControlError::NotConnected));
                    continue;
                };
                let bytes = match encode(&text) {
                    Ok(b) => b,
                    Err(e) => {
                        let _ = reply.send(Err(e));
                        continue;
                    }
                };
                let result = p
                    .write
                    .write_all(&bytes)
                    .await
                    .map_err(|e| ControlError::WriteFailed { message: e.to_string() });
                // write_raw severs the connection (bootloader entry, reboot).
                do_disconnect(&mut port, &info).await;
                let _ = reply.send(result);
            }
            DriverMsg::Submit(env) => {
                let Some(p) = port.as_mut() else {
                    let _ = env.reply.send(Err(ControlError::NotConnected));
                    continue;
                };

                let outcome = exchange(p, &env.text, env.kind, env.timeout).await;
                if outcome.is_err() {
                    let _ = error_hook.send(());
                }
                let _ = env.reply.send(outcome);
            }
        }
    }
}

async fn exchange(
    port: &mut OpenPort,
    text: &str,
    kind: CommandKind,
    timeout: Duration,
) -> Result<EnvelopeResponse, ControlError> {
    let bytes = encode(text)?;
    port.write
        .write_all(&bytes)
        .await
        .map_err(|e| ControlError::WriteFailed { message: e.to_string() })?;

    let needed = lines_needed(kind);
    let read_fut = async {
        let mut lines = Vec::with_capacity(needed);
        while lines.len() < needed {
            let mut buf = String::new();
            let n = port
                .reader
                .read_line(&mut buf)
                .await
                .map_err(|e| ControlError::WriteFailed { message: e.to_string() })?;
            if n == 0 {
                return Err(ControlError::WriteFailed { message: "device closed connection".into() });
            }
            let trimmed = buf.trim().to_string();
            if trimmed.is_empty() {
                continue;
            }
            lines.push(trimmed);
        }
        Ok(lines)
    };

    match tokio::time::timeout(timeout, read_fut).await {
        Ok(Ok(lines)) => assemble_response(kind, &lines),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(ControlError::Timeout),
    }
}

async fn do_connect(
    requested: Option<String>,
    info: &Arc<RwLock<ConnectionInfo>>,
) -> Result<OpenPort, ControlError> {
    let path = match requested {
        Some(p) => p,
        None => discover_ebb_ports()
            .into_iter()
            .next()
            .map(|p| p.path)
            .ok_or_else(|| ControlError::validation("no EBB device found"))?,
    };

    let mut opened = open_and_greet(&path).await;
    if opened.is_err() {
        // retry once per spec.md §4.A connect sequence
        opened = open_and_greet(&path).await;
    }

    let mut guard = info.write().await;
    match opened {
        Ok((port, version)) => {
            guard.path = Some(path);
            guard.open = true;
            guard.firmware_version = Some(version);
            guard.backoff = BACKOFF_BASE;
            guard.last_error = None;
            info!("connected to EBB at {:?}, firmware {version}", guard.path);
            Ok(port)
        }
        Err(e) => {
            guard.open = false;
            guard.last_error = Some(e.to_string());
            guard.backoff = (guard.backoff.max(BACKOFF_BASE) * 2).min(BACKOFF_CAP);
            warn!("EBB connect failed: {e}, backoff now {:?}", guard.backoff);
            Err(e)
        }
    }
}

async fn open_and_greet(path: &str) -> Result<(OpenPort, FirmwareVersion), ControlError> {
    let stream = tokio_serial::new(path, BAUD_RATE)
        .open_native_async()
        .map_err(|e| ControlError::validation(format!("could not open {path}: {e}")))?;

    let (read_half, write_half) = tokio::io::split(stream);
    let read_box: Box<dyn tokio::io::AsyncRead + Unpin + Send> = Box::new(read_half);
    let write_box: BoxedWrite = Box::new(write_half);
    let reader = BufReader::new(read_box);
    let mut port = OpenPort { write: write_box, reader };

    let banner = exchange(&mut port, "V", CommandKind::QueryWithoutTerminator, Duration::from_secs(5))
        .await?
        .data_line
        .ok_or(ControlError::Timeout)?;

    if !banner.to_lowercase().contains(EXPECTED_PRODUCT_PREFIX) {
        return Err(ControlError::IdentityMismatch {
            message: format!("unexpected banner: {banner}"),
        });
    }

    let version = FirmwareVersion::parse_from_banner(&banner)
        .ok_or_else(|| ControlError::IdentityMismatch { message: format!("unparseable banner: {banner}") })?;

    Ok((port, version))
}

async fn do_disconnect(port: &mut Option<OpenPort>, info: &Arc<RwLock<ConnectionInfo>>) {
    if let Some(mut p) = port.take() {
        let _ = tokio::time::timeout(DISCONNECT_GRACE, p.write.flush()).await;
        // Dropping `p` here force-destroys the handle if the grace
        // window above didn't complete in time.
    }
    let mut guard = info.write().await;
    guard.open = false;
}

/// Find a device by its persisted nickname rather than by raw path.
pub async fn resolve_nickname(nickname: &str) -> Option<String> {
    find_by_nickname(nickname).map(|p| p.path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    /// Wires a `OpenPort` to an in-process duplex pipe standing in for the
    /// serial device, so `exchange` can be driven end-to-end without real
    /// hardware (connecting through `tokio_serial` is left untested here).
    fn loopback_port() -> (OpenPort, tokio::io::DuplexStream) {
        let (driver_side, device_side) = tokio::io::duplex(1024);
        let (read_half, write_half) = tokio::io::split(driver_side);
        let read_box: Box<dyn tokio::io::AsyncRead + Unpin + Send> = Box::new(read_half);
        let write_box: BoxedWrite = Box::new(write_half);
        let port = OpenPort { write: write_box, reader: BufReader::new(read_box) };
        (port, device_side)
    }

    async fn read_command(device: &mut tokio::io::DuplexStream) -> String {
        let mut buf = vec![0u8; 256];
        let n = device.read(&mut buf).await.unwrap();
        String::from_utf8(buf[..n].to_vec()).unwrap().trim_end_matches('\r').to_string()
    }

    #[tokio::test]
    async fn exchange_round_trips_a_plain_command() {
        let (mut port, mut device) = loopback_port();
        let device_task = tokio::spawn(async move {
            let cmd = read_command(&mut device).await;
            assert_eq!(cmd, "EM,1,1");
            device.write_all(b"OK\r\n").await.unwrap();
        });

        let resp = exchange(&mut port, "EM,1,1", CommandKind::Command, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(resp.data_line.is_none());
        device_task.await.unwrap();
    }

    #[tokio::test]
    async fn exchange_parses_a_query_with_terminator() {
        let (mut port, mut device) = loopback_port();
        let device_task = tokio::spawn(async move {
            read_command(&mut device).await;
            device.write_all(b"GPIO=0F\r\nOK\r\n").await.unwrap();
        });

        let resp = exchange(&mut port, "QG", CommandKind::QueryWithTerminator, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(resp.data_line.as_deref(), Some("GPIO=0F"));
        device_task.await.unwrap();
    }

    #[tokio::test]
    async fn exchange_propagates_a_device_error_line() {
        let (mut port, mut device) = loopback_port();
        let device_task = tokio::spawn(async move {
            read_command(&mut device).await;
            device.write_all(b"!0 Err: Unknown Command\r\n").await.unwrap();
        });

        let err = exchange(&mut port, "ZZ", CommandKind::Command, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::DeviceError { .. }));
        device_task.await.unwrap();
    }

    #[tokio::test]
    async fn exchange_times_out_when_device_stays_silent() {
        let (mut port, device) = loopback_port();
        // Held open so the driver sees "still connected, no data" rather
        // than EOF, then dropped once the timeout has had a chance to fire.
        let err = exchange(&mut port, "V", CommandKind::QueryWithoutTerminator, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::Timeout));
        drop(device);
    }
}
