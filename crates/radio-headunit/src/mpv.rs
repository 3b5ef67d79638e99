/// mpv-backed player with separated reader/writer IPC tasks.
///
/// Architecture:
///
/// ```text
///   PlaybackSession ──Player trait──▶ MpvPlayer ──PlayerCommand──▶ player_task
///                                                                    │ owns MpvDriver
///                                                                    ├── writer_task  ← MpvRequest → socket
///                                                                    └── reader_task  ← JSON lines
///                                                                          ├── response (request_id) → oneshot
///                                                                          └── event → player_task
///   control loop ◀── ControlEvent::Player(PlayerEvent{token}) ───────────────┘
/// ```
///
/// The session runs on the control loop and must never await mpv, so
/// `MpvPlayer` only queues commands.  Outcomes come back as `PlayerEvent`s
/// tagged with the token of the load in force when mpv reported them.
///
/// Platform notes:
/// - Unix:   Unix domain sockets
/// - Windows: Named pipes  \\.\pipe\<name>
use radio_core::{LoadToken, Player, PlayerError, PlayerEvent};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

#[cfg(unix)]
use tokio::net::UnixStream;

#[cfg(windows)]
use tokio::net::windows::named_pipe::ClientOptions;

use crate::core::ControlEvent;

// ── global request-id counter ─────────────────────────────────────────────────

static NEXT_REQ_ID: AtomicU64 = AtomicU64::new(1);

/// observe_property id for `paused-for-cache`.
pub const OBS_PAUSED_FOR_CACHE: u64 = 1;

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<anyhow::Result<Value>>>>>;

// ── internal channel types ────────────────────────────────────────────────────

struct PendingRequest {
    req_id: u64,
    payload: String, // serialised JSON line (already has '\n')
    reply: oneshot::Sender<anyhow::Result<Value>>,
}

/// An mpv event / property-change that arrived unsolicited (no request_id).
#[derive(Debug, Clone)]
pub struct MpvEvent {
    pub raw: Value,
}

impl MpvEvent {
    /// Returns `Some((obs_id, data))` if this is a property-change event.
    pub fn as_property_change(&self) -> Option<(u64, &Value)> {
        if self.raw.get("event")?.as_str()? == "property-change" {
            let id = self.raw.get("id")?.as_u64()?;
            let data = self.raw.get("data").unwrap_or(&Value::Null);
            Some((id, data))
        } else {
            None
        }
    }

    /// Returns the event name, e.g. "end-file", "start-file", "file-loaded".
    pub fn event_name(&self) -> Option<&str> {
        self.raw.get("event")?.as_str()
    }
}

/// Translate an mpv event into a player callback for the load `token`.
pub fn to_player_event(evt: &MpvEvent, token: LoadToken) -> Option<PlayerEvent> {
    if let Some((id, data)) = evt.as_property_change() {
        if id == OBS_PAUSED_FOR_CACHE {
            if let Some(waiting) = data.as_bool() {
                let detail = if waiting { "buffering" } else { "buffered" };
                return Some(PlayerEvent::Info {
                    token,
                    detail: detail.to_string(),
                });
            }
        }
        return None;
    }

    match evt.event_name()? {
        "file-loaded" => Some(PlayerEvent::Prepared { token }),
        "playback-restart" => Some(PlayerEvent::Info {
            token,
            detail: "playback restarted".to_string(),
        }),
        "end-file" => match evt.raw.get("reason").and_then(Value::as_str) {
            Some("error") => {
                let message = evt
                    .raw
                    .get("file_error")
                    .and_then(Value::as_str)
                    .unwrap_or("playback error")
                    .to_string();
                Some(PlayerEvent::Error { token, message })
            }
            // A live stream only ends when the connection drops.
            Some("eof") => Some(PlayerEvent::Error {
                token,
                message: "stream ended".to_string(),
            }),
            _ => None,
        },
        _ => None,
    }
}

// ── public handle ─────────────────────────────────────────────────────────────

/// Cloneable handle to the mpv writer task.  Use `send()` to fire a command
/// and await the response.
#[derive(Clone)]
pub struct MpvHandle {
    tx: mpsc::Sender<PendingRequest>,
}

impl MpvHandle {
    pub async fn send(&self, command: Value) -> anyhow::Result<Value> {
        let req_id = NEXT_REQ_ID.fetch_add(1, Ordering::Relaxed);
        let msg = json!({ "command": command, "request_id": req_id });
        let mut raw = serde_json::to_string(&msg)?;
        raw.push('\n');

        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(PendingRequest {
                req_id,
                payload: raw,
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("mpv writer task gone"))?;

        tokio::time::timeout(tokio::time::Duration::from_secs(5), reply_rx)
            .await
            .map_err(|_| anyhow::anyhow!("mpv IPC timeout for req={}", req_id))?
            .map_err(|_| anyhow::anyhow!("mpv reply channel dropped req={}", req_id))?
    }

    /// Load `url` paused; playback begins with `set_pause(false)`.
    pub async fn load_stream(&self, url: &str, volume: f32) -> anyhow::Result<()> {
        self.set_pause(true).await?;
        self.send(json!(["loadfile", url, "replace"])).await?;
        let vol_pct = (volume * 100.0).clamp(0.0, 100.0);
        let _ = self.send(json!(["set_property", "volume", vol_pct])).await;
        Ok(())
    }

    pub async fn stop(&self) -> anyhow::Result<()> {
        self.send(json!(["stop"])).await?;
        Ok(())
    }

    pub async fn set_pause(&self, paused: bool) -> anyhow::Result<()> {
        self.send(json!(["set_property", "pause", paused])).await?;
        Ok(())
    }

    /// Must be called after every fresh connection.
    pub async fn observe_properties(&self) {
        match self
            .send(json!(["observe_property", OBS_PAUSED_FOR_CACHE, "paused-for-cache"]))
            .await
        {
            Ok(_) => debug!("mpv: observing paused-for-cache"),
            Err(e) => warn!("mpv: observe_property paused-for-cache failed: {}", e),
        }
    }
}

// ── driver ────────────────────────────────────────────────────────────────────

/// Owns the mpv child process.
pub struct MpvDriver {
    socket_name: String,
    binary: Option<PathBuf>,
    process: Option<tokio::process::Child>,
    pub volume: f32,
}

impl MpvDriver {
    pub fn new(binary: Option<PathBuf>, volume: f32) -> Self {
        Self {
            socket_name: radio_core::platform::mpv_socket_name(),
            binary,
            process: None,
            volume,
        }
    }

    pub fn process_alive(&mut self) -> bool {
        if let Some(ref mut child) = self.process {
            child.try_wait().ok().flatten().is_none()
        } else {
            false
        }
    }

    /// Kill the process if running.
    pub async fn kill(&mut self) {
        if let Some(mut p) = self.process.take() {
            let _ = p.kill().await;
        }
    }

    async fn spawn_process(&mut self) -> anyhow::Result<()> {
        self.kill().await;

        info!("mpv: spawning new process");
        let mpv_binary = radio_core::platform::find_mpv_binary(self.binary.as_deref())
            .ok_or_else(|| anyhow::anyhow!("mpv binary not found"))?;

        let vol_arg = format!(
            "--volume={}",
            (self.volume * 100.0).clamp(0.0, 100.0).round() as i64
        );

        let child = tokio::process::Command::new(mpv_binary)
            .arg("--no-video")
            .arg("--idle=yes")
            .arg(radio_core::platform::mpv_socket_arg())
            .arg("--quiet")
            .arg(vol_arg)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        self.process = Some(child);
        Ok(())
    }

    #[cfg(unix)]
    pub async fn spawn_and_connect(
        &mut self,
        event_tx: mpsc::Sender<MpvEvent>,
    ) -> anyhow::Result<MpvHandle> {
        let socket_path = std::path::PathBuf::from(&self.socket_name);
        let _ = tokio::fs::remove_file(&socket_path).await;

        self.spawn_process().await?;

        // Wait for socket to appear
        for _ in 0..50 {
            tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
            if socket_path.exists() {
                break;
            }
        }
        if !socket_path.exists() {
            anyhow::bail!("mpv IPC socket did not appear");
        }
        tokio::time::sleep(tokio::time::Duration::from_millis(200)).await;

        let stream = UnixStream::connect(&socket_path).await?;
        info!("mpv: connected to IPC socket");
        let (read_half, write_half) = stream.into_split();
        Ok(start_io_tasks(BufReader::new(read_half), write_half, event_tx))
    }

    #[cfg(windows)]
    pub async fn spawn_and_connect(
        &mut self,
        event_tx: mpsc::Sender<MpvEvent>,
    ) -> anyhow::Result<MpvHandle> {
        self.spawn_process().await?;

        let pipe_path = format!(r"\\.\pipe\{}", self.socket_name);
        for _ in 0..50 {
            tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
            if let Ok(client) = ClientOptions::new().open(&pipe_path) {
                info!("mpv: connected to named pipe");
                let (read_half, write_half) = tokio::io::split(client);
                return Ok(start_io_tasks(BufReader::new(read_half), write_half, event_tx));
            }
        }
        anyhow::bail!("mpv named pipe did not appear")
    }
}

fn start_io_tasks<R, W>(
    reader: BufReader<R>,
    writer: W,
    event_tx: mpsc::Sender<MpvEvent>,
) -> MpvHandle
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
    W: tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    // req_id → reply channel.  Writer inserts, reader resolves.
    let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
    let (cmd_tx, cmd_rx) = mpsc::channel::<PendingRequest>(64);

    tokio::spawn(writer_task(writer, cmd_rx, pending.clone()));
    tokio::spawn(reader_task(reader, pending, event_tx));

    MpvHandle { tx: cmd_tx }
}

// ── reader task ───────────────────────────────────────────────────────────────

async fn reader_task<R>(
    mut reader: BufReader<R>,
    pending: PendingMap,
    event_tx: mpsc::Sender<MpvEvent>,
) where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                debug!("mpv reader: connection closed");
                let mut map = pending.lock().await;
                for (_, tx) in map.drain() {
                    let _ = tx.send(Err(anyhow::anyhow!("mpv IPC connection closed")));
                }
                break;
            }
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let val: Value = match serde_json::from_str(trimmed) {
                    Ok(v) => v,
                    Err(e) => {
                        debug!("mpv reader: invalid json '{}': {}", trimmed, e);
                        continue;
                    }
                };

                if let Some(req_id) = val.get("request_id").and_then(|v| v.as_u64()) {
                    let mut map = pending.lock().await;
                    if let Some(tx) = map.remove(&req_id) {
                        let result = if val["error"].as_str() == Some("success") {
                            Ok(val)
                        } else {
                            let err = val["error"]
                                .as_str()
                                .unwrap_or("unknown error")
                                .to_string();
                            debug!("mpv reader: response req={} err={}", req_id, err);
                            Err(anyhow::anyhow!("mpv error: {}", err))
                        };
                        let _ = tx.send(result);
                    } else {
                        debug!("mpv reader: response for unknown req={}", req_id);
                    }
                } else {
                    debug!("mpv reader: event {}", trimmed);
                    if event_tx.send(MpvEvent { raw: val }).await.is_err() {
                        break;
                    }
                }
            }
            Err(e) => {
                warn!("mpv reader: read error: {}", e);
                let mut map = pending.lock().await;
                for (_, tx) in map.drain() {
                    let _ = tx.send(Err(anyhow::anyhow!("mpv IPC read error: {}", e)));
                }
                break;
            }
        }
    }
}

// ── writer task ───────────────────────────────────────────────────────────────

async fn writer_task<W>(mut writer: W, mut rx: mpsc::Receiver<PendingRequest>, pending: PendingMap)
where
    W: tokio::io::AsyncWrite + Unpin,
{
    while let Some(req) = rx.recv().await {
        // Register before writing so the reader can match the reply.
        {
            let mut map = pending.lock().await;
            map.insert(req.req_id, req.reply);
        }
        debug!("mpv writer: send req={} payload={}", req.req_id, req.payload.trim());
        if let Err(e) = writer.write_all(req.payload.as_bytes()).await {
            warn!("mpv writer: write error: {}", e);
            let mut map = pending.lock().await;
            if let Some(tx) = map.remove(&req.req_id) {
                let _ = tx.send(Err(anyhow::anyhow!("mpv write error: {}", e)));
            }
            break;
        }
    }
    debug!("mpv writer: task exiting");
}

// ── Player implementation ─────────────────────────────────────────────────────

#[derive(Debug)]
pub enum PlayerCommand {
    Load { token: LoadToken, url: String },
    Start,
    Stop,
    Release,
}

/// `Player` for the session: queues commands for the player task.
pub struct MpvPlayer {
    tx: mpsc::Sender<PlayerCommand>,
}

impl MpvPlayer {
    pub fn new(tx: mpsc::Sender<PlayerCommand>) -> Self {
        Self { tx }
    }

    fn queue(&self, cmd: PlayerCommand) -> Result<(), PlayerError> {
        self.tx.try_send(cmd).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => PlayerError::Rejected("player busy".to_string()),
            mpsc::error::TrySendError::Closed(_) => PlayerError::Unavailable,
        })
    }
}

impl Player for MpvPlayer {
    fn load(&mut self, token: LoadToken, url: &str) -> Result<(), PlayerError> {
        self.queue(PlayerCommand::Load {
            token,
            url: url.to_string(),
        })
    }

    fn start(&mut self) -> Result<(), PlayerError> {
        self.queue(PlayerCommand::Start)
    }

    fn stop(&mut self) -> Result<(), PlayerError> {
        self.queue(PlayerCommand::Stop)
    }

    fn release(&mut self) {
        if let Err(e) = self.queue(PlayerCommand::Release) {
            debug!("mpv: release not queued: {}", e);
        }
    }
}

/// Start the task that owns mpv.  It exits, killing mpv, once every
/// `MpvPlayer` for it is dropped.
pub fn spawn_player(
    driver: MpvDriver,
    control_tx: mpsc::Sender<ControlEvent>,
) -> (MpvPlayer, tokio::task::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(32);
    let handle = tokio::spawn(player_task(driver, rx, control_tx));
    (MpvPlayer::new(tx), handle)
}

struct Connection {
    handle: MpvHandle,
    events: mpsc::Receiver<MpvEvent>,
}

async fn next_mpv_event(conn: &mut Option<Connection>) -> Option<MpvEvent> {
    match conn {
        Some(c) => c.events.recv().await,
        None => std::future::pending().await,
    }
}

async fn player_task(
    mut driver: MpvDriver,
    mut rx: mpsc::Receiver<PlayerCommand>,
    control_tx: mpsc::Sender<ControlEvent>,
) {
    let mut conn: Option<Connection> = None;
    let mut token: Option<LoadToken> = None;

    loop {
        tokio::select! {
            cmd = rx.recv() => {
                let Some(cmd) = cmd else { break };
                debug!("mpv: command {:?}", cmd);
                match cmd {
                    PlayerCommand::Load { token: t, url } => {
                        token = Some(t);
                        if let Err(e) = load(&mut driver, &mut conn, &url).await {
                            warn!("mpv: load of {} failed: {}", url, e);
                            report(&control_tx, PlayerEvent::Error { token: t, message: e.to_string() }).await;
                        }
                    }
                    PlayerCommand::Start => {
                        let result = match &conn {
                            Some(c) => c.handle.set_pause(false).await,
                            None => Err(anyhow::anyhow!("mpv not connected")),
                        };
                        if let (Err(e), Some(t)) = (result, token) {
                            report(&control_tx, PlayerEvent::Error { token: t, message: e.to_string() }).await;
                        }
                    }
                    PlayerCommand::Stop => {
                        token = None;
                        if let Some(c) = &conn {
                            if let Err(e) = c.handle.stop().await {
                                debug!("mpv: stop failed: {}", e);
                            }
                        }
                    }
                    PlayerCommand::Release => {
                        token = None;
                        conn = None;
                        driver.kill().await;
                    }
                }
            }

            evt = next_mpv_event(&mut conn) => {
                match evt {
                    Some(evt) => {
                        if let Some(t) = token {
                            if let Some(player_event) = to_player_event(&evt, t) {
                                report(&control_tx, player_event).await;
                            }
                        }
                    }
                    None => {
                        warn!("mpv: IPC connection lost");
                        conn = None;
                        if let Some(t) = token.take() {
                            report(&control_tx, PlayerEvent::Error {
                                token: t,
                                message: "mpv connection lost".to_string(),
                            }).await;
                        }
                    }
                }
            }
        }
    }

    info!("mpv: player task exiting");
    driver.kill().await;
}

async fn load(
    driver: &mut MpvDriver,
    conn: &mut Option<Connection>,
    url: &str,
) -> anyhow::Result<()> {
    if conn.is_none() || !driver.process_alive() {
        let (event_tx, events) = mpsc::channel(64);
        let handle = driver.spawn_and_connect(event_tx).await?;
        handle.observe_properties().await;
        *conn = Some(Connection { handle, events });
    }
    let Some(c) = conn.as_ref() else {
        anyhow::bail!("mpv not connected");
    };
    c.handle.load_stream(url, driver.volume).await
}

async fn report(control_tx: &mpsc::Sender<ControlEvent>, event: PlayerEvent) {
    if control_tx.send(ControlEvent::Player(event)).await.is_err() {
        debug!("mpv: control loop gone");
    }
}
