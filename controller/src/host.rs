use std::{
    collections::{BTreeMap, HashMap},
    io::ErrorKind,
    net::SocketAddr,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex as StdMutex, OnceLock,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{
        mpsc::{self, error::TryRecvError},
        oneshot, Mutex,
    },
};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use relaybox_common::{
    decode_inbound, CommandQueueFull, CommandSource, DeviceIdentity, HardwareError,
    InboundMessage, Line, ManualInputs, OutboundMessage, ReconciliationEngine, RelayOutputs,
    RemoteCommand, RuntimeConfig, SessionContext, SwitchView,
};

const CONTROL_TICK_MS: u64 = 20;
const SETTINGS_SAVE_RETRY_MS: u64 = 1_000;
const EVENT_QUEUE_DEPTH: usize = 32;
const OUTBOUND_QUEUE_DEPTH: usize = 32;

enum ControlEvent {
    LinkUp,
    LinkDown,
    Inbound(InboundMessage),
    Local {
        command: RemoteCommand,
        reply: oneshot::Sender<Result<(), CommandQueueFull>>,
    },
}

#[derive(Clone)]
struct AppState {
    events: mpsc::Sender<ControlEvent>,
    board: SimulatedBoard,
    status: Arc<Mutex<ControlStatus>>,
    link_up: Arc<AtomicBool>,
    device: DeviceIdentity,
    ws_url: Arc<String>,
    started_at: DateTime<Utc>,
}

#[derive(Clone)]
struct AppStore {
    runtime_path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
struct ControlStatus {
    switches: Vec<SwitchView>,
    #[serde(rename = "queuedCommands")]
    queued_commands: usize,
    #[serde(rename = "reportsSent")]
    reports_sent: u64,
    #[serde(rename = "lastCycleMs")]
    last_cycle_ms: u64,
}

impl ControlStatus {
    fn from_engine(engine: &ReconciliationEngine<SimulatedBoard>, now_ms: u64) -> Self {
        Self {
            switches: engine.snapshot(),
            queued_commands: engine.queued_commands(),
            reports_sent: engine.reports_sent(),
            last_cycle_ms: now_ms,
        }
    }
}

#[derive(Debug, Serialize)]
struct LinkView {
    connected: bool,
    url: String,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    device: DeviceIdentity,
    link: LinkView,
    #[serde(rename = "startedAt")]
    started_at: String,
    #[serde(rename = "uptimeMs")]
    uptime_ms: u64,
    #[serde(flatten)]
    control: ControlStatus,
}

#[derive(Debug, Serialize)]
struct QueuedResponse {
    queued: bool,
    gpio: Line,
    state: bool,
}

/// Relay outputs and manual inputs held in memory, driven through the HTTP API.
#[derive(Clone, Default)]
struct SimulatedBoard {
    levels: Arc<StdMutex<BoardLevels>>,
}

#[derive(Debug, Clone, Default, Serialize)]
struct BoardLevels {
    outputs: BTreeMap<Line, bool>,
    inputs: BTreeMap<Line, bool>,
}

impl SimulatedBoard {
    fn snapshot(&self) -> Option<BoardLevels> {
        self.levels.lock().ok().map(|levels| levels.clone())
    }

    fn set_input(&self, line: Line, high: bool) -> bool {
        match self.levels.lock() {
            Ok(mut levels) => {
                levels.inputs.insert(line, high);
                true
            }
            Err(_) => false,
        }
    }
}

impl RelayOutputs for SimulatedBoard {
    fn write_level(&mut self, line: Line, high: bool) -> Result<(), HardwareError> {
        let mut levels = self
            .levels
            .lock()
            .map_err(|_| HardwareError::Unavailable {
                line,
                reason: "board state poisoned".to_string(),
            })?;
        levels.outputs.insert(line, high);
        Ok(())
    }

    fn pause_ms(&mut self, ms: u64) {
        thread::sleep(Duration::from_millis(ms));
    }
}

impl ManualInputs for SimulatedBoard {
    fn read_level(&mut self, line: Line) -> Result<bool, HardwareError> {
        let levels = self.levels.lock().map_err(|_| HardwareError::ReadFailed {
            line,
            reason: "board state poisoned".to_string(),
        })?;
        // Unwired inputs idle high on the pull-up.
        Ok(levels.inputs.get(&line).copied().unwrap_or(true))
    }
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = AppStore::new();
    let mut runtime = store.load_runtime_config().await.unwrap_or_else(|err| {
        warn!("failed to load runtime config from store: {err:#}");
        RuntimeConfig::default()
    });
    runtime.controller.sanitize();

    if let Ok(secret) = std::env::var("RELAYBOX_SECRET") {
        runtime.network.device_secret = secret;
    }
    if let Ok(device_id) = std::env::var("RELAYBOX_DEVICE_ID") {
        runtime.device.mac = device_id;
    }
    let ws_url = std::env::var("RELAYBOX_WS_URL").unwrap_or_else(|_| runtime.network.ws_url());

    let board = SimulatedBoard::default();
    let mut inputs = board.clone();
    let mut engine = ReconciliationEngine::new(runtime.controller.clone(), board.clone());
    engine.restore(&runtime.switches);
    engine.prime_inputs(&mut inputs, monotonic_ms());
    info!(
        "restored {} switches for {}",
        engine.registry().len(),
        runtime.device.mac
    );

    let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
    let link_up = Arc::new(AtomicBool::new(false));
    let status = Arc::new(Mutex::new(ControlStatus::from_engine(&engine, 0)));
    let session = SessionContext::new(runtime.device.clone(), runtime.network.secret());

    let app_state = AppState {
        events: event_tx.clone(),
        board,
        status: status.clone(),
        link_up: link_up.clone(),
        device: runtime.device.clone(),
        ws_url: Arc::new(ws_url.clone()),
        started_at: Utc::now(),
    };

    spawn_link_loop(
        ws_url,
        Duration::from_millis(runtime.network.reconnect_interval_ms),
        event_tx,
        outbound_rx,
        link_up,
    );
    spawn_control_loop(ControlLoop {
        engine,
        inputs,
        session,
        events: event_rx,
        outbound: outbound_tx,
        status,
        store,
        runtime,
        save_deadline_ms: None,
        handle: tokio::runtime::Handle::current(),
    })?;

    let app = Router::new()
        .route("/api/status", get(handle_get_status))
        .route("/api/switches/{line}", post(handle_set_switch))
        .route("/api/board", get(handle_get_board))
        .route("/api/board/inputs/{line}", post(handle_set_input))
        .with_state(app_state);

    let port = std::env::var("RELAYBOX_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind relay box server at {addr}"))?;

    info!("relay box listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

struct ControlLoop {
    engine: ReconciliationEngine<SimulatedBoard>,
    inputs: SimulatedBoard,
    session: SessionContext,
    events: mpsc::Receiver<ControlEvent>,
    outbound: mpsc::Sender<OutboundMessage>,
    status: Arc<Mutex<ControlStatus>>,
    store: AppStore,
    runtime: RuntimeConfig,
    save_deadline_ms: Option<u64>,
    handle: tokio::runtime::Handle,
}

// Relay staggering sleeps on the writing path, so the engine gets its own thread.
fn spawn_control_loop(control: ControlLoop) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("control-loop".to_string())
        .spawn(move || control.run())
        .context("failed to spawn control loop")?;
    Ok(())
}

impl ControlLoop {
    fn run(mut self) {
        let tick = Duration::from_millis(CONTROL_TICK_MS);

        loop {
            let started = Instant::now();
            let now_ms = monotonic_ms();
            let mut outbound = Vec::new();

            loop {
                match self.events.try_recv() {
                    Ok(event) => outbound.extend(self.handle_event(event, now_ms)),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        warn!("control event channel closed, stopping control loop");
                        return;
                    }
                }
            }

            outbound.extend(
                self.engine
                    .run_cycle(&self.session, &mut self.inputs, now_ms),
            );
            self.send(outbound);

            if self.engine.take_dirty() {
                self.queue_save(now_ms, self.runtime.controller.settings_save_debounce_ms);
            }
            self.flush_pending_save(now_ms);
            *self.status.blocking_lock() = ControlStatus::from_engine(&self.engine, now_ms);

            if let Some(rest) = tick.checked_sub(started.elapsed()) {
                thread::sleep(rest);
            }
        }
    }

    fn handle_event(&mut self, event: ControlEvent, now_ms: u64) -> Vec<OutboundMessage> {
        match event {
            ControlEvent::LinkUp => {
                self.session.set_connected(true);
                info!("backend link up, identifying as {}", self.session.mac());
                vec![self.session.identify(now_ms)]
            }
            ControlEvent::LinkDown => {
                self.session.set_connected(false);
                Vec::new()
            }
            ControlEvent::Inbound(message) => {
                self.engine.handle_inbound(&self.session, message, now_ms)
            }
            ControlEvent::Local { command, reply } => {
                let result = self.engine.enqueue_command(command, CommandSource::Local);
                if let Err(err) = &result {
                    error!("{err}");
                }
                let _ = reply.send(result);
                Vec::new()
            }
        }
    }

    fn send(&self, messages: Vec<OutboundMessage>) {
        if !self.session.is_connected() {
            return;
        }
        for message in messages {
            let kind = message.kind();
            if let Err(err) = self.outbound.try_send(message) {
                warn!("dropping outbound {kind}: {err}");
            }
        }
    }

    fn queue_save(&mut self, now_ms: u64, debounce_ms: u64) {
        self.save_deadline_ms = Some(now_ms.saturating_add(debounce_ms));
    }

    fn flush_pending_save(&mut self, now_ms: u64) {
        match self.save_deadline_ms {
            Some(due_ms) if now_ms >= due_ms => self.save_deadline_ms = None,
            _ => return,
        }

        self.runtime.switches = self.engine.persisted_switches();
        if let Err(err) = self
            .handle
            .block_on(self.store.save_runtime_config(&self.runtime))
        {
            warn!("failed to persist switch state: {err:#}");
            self.queue_save(now_ms, SETTINGS_SAVE_RETRY_MS);
        }
    }
}

fn spawn_link_loop(
    url: String,
    reconnect: Duration,
    events: mpsc::Sender<ControlEvent>,
    mut outbound: mpsc::Receiver<OutboundMessage>,
    link_up: Arc<AtomicBool>,
) {
    tokio::spawn(async move {
        loop {
            match connect_async(url.as_str()).await {
                Ok((ws_stream, _)) => {
                    info!("backend link connected to {url}");
                    // Anything queued while offline predates the new session.
                    while outbound.try_recv().is_ok() {}
                    link_up.store(true, Ordering::Relaxed);

                    if let Err(err) = pump_link(ws_stream, &events, &mut outbound).await {
                        warn!("backend link error: {err:#}");
                    }

                    link_up.store(false, Ordering::Relaxed);
                    if events.send(ControlEvent::LinkDown).await.is_err() {
                        return;
                    }
                    info!("backend link closed");
                }
                Err(err) => warn!("backend connect to {url} failed: {err}"),
            }

            tokio::time::sleep(reconnect).await;
        }
    });
}

async fn pump_link(
    ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    events: &mpsc::Sender<ControlEvent>,
    outbound: &mut mpsc::Receiver<OutboundMessage>,
) -> anyhow::Result<()> {
    let (mut write, mut read) = ws_stream.split();
    events
        .send(ControlEvent::LinkUp)
        .await
        .context("control loop stopped")?;

    loop {
        tokio::select! {
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let text: &str = &text;
                    match decode_inbound(text) {
                        Ok(message) => {
                            debug!("inbound frame: {message:?}");
                            if let Err(err) = events.try_send(ControlEvent::Inbound(message)) {
                                warn!("control loop busy, dropping inbound frame: {err}");
                            }
                        }
                        Err(err) => warn!("dropping inbound frame: {err}"),
                    }
                }
                Some(Ok(Message::Close(_))) | None => return Ok(()),
                Some(Ok(_)) => {}
                Some(Err(err)) => return Err(err.into()),
            },
            message = outbound.recv() => {
                let Some(message) = message else {
                    return Ok(());
                };
                let text = message.encode().context("failed to encode outbound message")?;
                write.send(Message::Text(text.into())).await?;
            }
        }
    }
}

async fn handle_get_status(State(state): State<AppState>) -> impl IntoResponse {
    let control = state.status.lock().await.clone();

    Json(StatusResponse {
        device: state.device.clone(),
        link: LinkView {
            connected: state.link_up.load(Ordering::Relaxed),
            url: state.ws_url.as_ref().clone(),
        },
        started_at: state.started_at.to_rfc3339(),
        uptime_ms: monotonic_ms(),
        control,
    })
}

async fn handle_set_switch(
    State(state): State<AppState>,
    Path(line): Path<Line>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(value) = params.get("state") else {
        return error_response(StatusCode::BAD_REQUEST, "Missing 'state' parameter");
    };
    let Some(on) = parse_switch_state(value) else {
        return error_response(StatusCode::BAD_REQUEST, "State must be 'on' or 'off'");
    };

    let (reply, response) = oneshot::channel();
    let event = ControlEvent::Local {
        command: RemoteCommand::by_line(line, on, None),
        reply,
    };
    if state.events.try_send(event).is_err() {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "Control loop is busy");
    }

    match response.await {
        Ok(Ok(())) => (
            StatusCode::ACCEPTED,
            Json(QueuedResponse {
                queued: true,
                gpio: line,
                state: on,
            }),
        )
            .into_response(),
        Ok(Err(err)) => error_response(StatusCode::SERVICE_UNAVAILABLE, &err.to_string()),
        Err(_) => error_response(StatusCode::INTERNAL_SERVER_ERROR, "Control loop stopped"),
    }
}

async fn handle_get_board(State(state): State<AppState>) -> impl IntoResponse {
    match state.board.snapshot() {
        Some(levels) => Json(levels).into_response(),
        None => error_response(StatusCode::INTERNAL_SERVER_ERROR, "Board state unavailable"),
    }
}

async fn handle_set_input(
    State(state): State<AppState>,
    Path(line): Path<Line>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(value) = params.get("level") else {
        return error_response(StatusCode::BAD_REQUEST, "Missing 'level' parameter");
    };
    let Some(high) = parse_level(value) else {
        return error_response(StatusCode::BAD_REQUEST, "Level must be 'high' or 'low'");
    };

    if !state.board.set_input(line, high) {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Board state unavailable");
    }
    StatusCode::NO_CONTENT.into_response()
}

impl AppStore {
    fn new() -> Self {
        let data_dir = std::env::var("RELAYBOX_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.relaybox"));

        Self {
            runtime_path: Arc::new(data_dir.join("runtime.json")),
            lock: Arc::new(Mutex::new(())),
        }
    }

    async fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let _guard = self.lock.lock().await;
        match tokio::fs::read(self.runtime_path.as_ref()).await {
            Ok(raw) => Ok(serde_json::from_slice::<RuntimeConfig>(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
            Err(err) => Err(err.into()),
        }
    }

    async fn save_runtime_config(&self, runtime: &RuntimeConfig) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        let path = self.runtime_path.as_ref().clone();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let payload = serde_json::to_vec_pretty(runtime)?;
        tokio::fs::write(path, payload).await?;
        Ok(())
    }
}

fn parse_switch_state(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "on" | "true" | "1" => Some(true),
        "off" | "false" | "0" => Some(false),
        _ => None,
    }
}

fn parse_level(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "high" | "1" => Some(true),
        "low" | "0" => Some(false),
        _ => None,
    }
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}
