use core::convert::TryInto;
use std::{
    collections::{hash_map::Entry, HashMap},
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, SyncSender, TryRecvError},
        Arc, OnceLock,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    wifi::{AuthMethod, ClientConfiguration, Configuration},
    ws::FrameType,
};
use esp_idf_hal::gpio::{AnyInputPin, AnyOutputPin, Input, Output, PinDriver, Pull};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    io::EspIOError,
    log::EspLogger,
    nvs::{EspDefaultNvsPartition, EspNvs},
    wifi::{BlockingWifi, EspWifi},
    ws::client::{
        EspWebSocketClient, EspWebSocketClientConfig, WebSocketEvent, WebSocketEventType,
    },
};
use log::{error, info, warn};

use relaybox_common::{
    config::NetworkConfig, decode_inbound, DeviceIdentity, HardwareError, InboundMessage, Line,
    ManualInputs, OutboundMessage, ReconciliationEngine, RelayOutputs, RuntimeConfig,
    SessionContext,
};

const NVS_NAMESPACE: &str = "relaybox";
const NVS_RUNTIME_KEY: &str = "runtime_json";
const WATCHDOG_TIMEOUT_SEC: u32 = 10;
const SETTINGS_SAVE_RETRY_MS: u64 = 1_000;
const WIFI_RESTART_GRACE_MS: u64 = 300_000;
const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;
const WS_TIMEOUT: Duration = Duration::from_secs(10);
const CONTROL_TICK_MS: u64 = 20;
const EVENT_QUEUE_DEPTH: usize = 32;
const LED_BACKEND_BLINK_MS: u64 = 120;
const LED_WIFI_BLINK_MS: u64 = 400;
const LED_OFFLINE_BLINK_MS: u64 = 1_000;

enum ControlEvent {
    LinkUp,
    LinkDown,
    Inbound(InboundMessage),
}

struct StatusLed {
    pin: PinDriver<'static, AnyOutputPin, Output>,
    lit: bool,
}

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
}

/// Relay outputs opened on first use.
#[derive(Default)]
struct GpioRelays {
    pins: HashMap<Line, PinDriver<'static, AnyOutputPin, Output>>,
}

/// Manual inputs with the internal pull-up enabled, opened on first use.
#[derive(Default)]
struct GpioInputs {
    pins: HashMap<Line, PinDriver<'static, AnyInputPin, Input>>,
}

impl RelayOutputs for GpioRelays {
    fn write_level(&mut self, line: Line, high: bool) -> Result<(), HardwareError> {
        let pin = match self.pins.entry(line) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                // Lines reaching the driver are outside the reserved flash range.
                let driver = unsafe { PinDriver::output(AnyOutputPin::new(i32::from(line))) }
                    .map_err(|err| HardwareError::Unavailable {
                        line,
                        reason: err.to_string(),
                    })?;
                entry.insert(driver)
            }
        };

        let result = if high { pin.set_high() } else { pin.set_low() };
        result.map_err(|err| HardwareError::WriteFailed {
            line,
            reason: err.to_string(),
        })
    }

    fn pause_ms(&mut self, ms: u64) {
        thread::sleep(Duration::from_millis(ms));
    }
}

impl ManualInputs for GpioInputs {
    fn read_level(&mut self, line: Line) -> Result<bool, HardwareError> {
        let pin = match self.pins.entry(line) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let unavailable = |err: esp_idf_svc::sys::EspError| HardwareError::Unavailable {
                    line,
                    reason: err.to_string(),
                };
                let mut driver = unsafe { PinDriver::input(AnyInputPin::new(i32::from(line))) }
                    .map_err(unavailable)?;
                driver.set_pull(Pull::Up).map_err(unavailable)?;
                entry.insert(driver)
            }
        };
        Ok(pin.is_high())
    }
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let nvs_store = NvsStore {
        partition: nvs_partition.clone(),
    };

    let mut runtime = nvs_store.load_runtime_config().unwrap_or_else(|err| {
        warn!("failed to load runtime config from NVS: {err:#}");
        RuntimeConfig::default()
    });
    runtime.controller.sanitize();

    info!(
        "NVS config loaded: ssid=`{}`, backend=`{}`, {} switches",
        runtime.network.wifi_ssid,
        runtime.network.ws_url(),
        runtime.switches.entries.len(),
    );

    // Relays and wall switches come up before any network activity.
    let mut engine = ReconciliationEngine::new(runtime.controller.clone(), GpioRelays::default());
    engine.restore(&runtime.switches);
    let mut inputs = GpioInputs::default();
    engine.prime_inputs(&mut inputs, monotonic_ms());

    let Peripherals { modem, .. } = Peripherals::take()?;
    let wifi = connect_wifi(modem, sys_loop, nvs_partition, &runtime.network)
        .context("wifi startup failed")?;
    disable_wifi_power_save();

    if runtime.device.mac == DeviceIdentity::default().mac {
        match wifi.sta_netif().get_mac() {
            Ok(mac) => runtime.device.mac = format_mac(&mac),
            Err(err) => warn!("failed to read station MAC: {err}"),
        }
    }

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;

    let (event_tx, event_rx) = mpsc::sync_channel(EVENT_QUEUE_DEPTH);
    let backend_connected = Arc::new(AtomicBool::new(false));
    let ws = create_ws_client(&runtime.network, event_tx, backend_connected.clone())?;

    let session = SessionContext::new(runtime.device.clone(), runtime.network.secret());
    let status_led = runtime.controller.status_led_line.and_then(init_status_led);
    spawn_control_loop(ControlLoop {
        engine,
        inputs,
        session,
        events: event_rx,
        ws,
        backend_connected,
        nvs_store,
        runtime,
        status_led,
        save_deadline_ms: None,
        wifi_disconnected_since_ms: None,
        last_wifi_retry_ms: 0,
    })?;

    // Keep services alive for the program lifetime.
    let _wifi = wifi;

    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    network: &NetworkConfig,
) -> anyhow::Result<EspWifi<'static>> {
    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

    let auth_method = if network.wifi_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: network
            .wifi_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: network
            .wifi_pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{}`", network.wifi_ssid);

    for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
        info!("wifi connect attempt {attempt}/{WIFI_CONNECT_ATTEMPTS}");
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                info!("wifi connected and netif up on attempt {attempt}");
                break;
            }
            Err(err) => {
                warn!("wifi connect failed on attempt {attempt}: {err:#}");
                if attempt < WIFI_CONNECT_ATTEMPTS {
                    let _ = wifi.disconnect();
                    thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
                } else {
                    // Manual switches keep working offline; the control loop keeps retrying.
                    warn!("wifi unavailable after {WIFI_CONNECT_ATTEMPTS} attempts, running offline");
                }
            }
        }
    }

    drop(wifi);
    Ok(esp_wifi)
}

fn create_ws_client(
    network: &NetworkConfig,
    events: SyncSender<ControlEvent>,
    backend_connected: Arc<AtomicBool>,
) -> anyhow::Result<EspWebSocketClient<'static>> {
    let url = network.ws_url();
    let config = EspWebSocketClientConfig {
        reconnect_timeout_ms: Duration::from_millis(network.reconnect_interval_ms),
        ..Default::default()
    };

    let client = EspWebSocketClient::new(&url, &config, WS_TIMEOUT, move |event| {
        handle_ws_event(event, &events, &backend_connected)
    })
    .with_context(|| format!("failed to start websocket client for {url}"))?;
    info!("websocket client started for {url}");
    Ok(client)
}

fn handle_ws_event(
    event: &Result<WebSocketEvent, EspIOError>,
    events: &SyncSender<ControlEvent>,
    backend_connected: &AtomicBool,
) {
    let event = match event {
        Ok(event) => event,
        Err(err) => {
            warn!("websocket error: {err:?}");
            return;
        }
    };

    // Link transitions block until queued; only data frames may be dropped.
    match event.event_type {
        WebSocketEventType::Connected => {
            info!("backend link connected");
            if events.send(ControlEvent::LinkUp).is_ok() {
                backend_connected.store(true, Ordering::Relaxed);
            } else {
                error!("control loop gone, link up not delivered");
            }
        }
        WebSocketEventType::Disconnected | WebSocketEventType::Closed => {
            if !backend_connected.swap(false, Ordering::Relaxed) {
                return;
            }
            info!("backend link closed");
            if events.send(ControlEvent::LinkDown).is_err() {
                error!("control loop gone, link down not delivered");
            }
        }
        WebSocketEventType::Text(text) => match decode_inbound(text) {
            Ok(message) => {
                if events.try_send(ControlEvent::Inbound(message)).is_err() {
                    warn!("control loop busy, dropping inbound frame");
                }
            }
            Err(err) => warn!("dropping inbound frame: {err}"),
        },
        _ => {}
    }
}

struct ControlLoop {
    engine: ReconciliationEngine<GpioRelays>,
    inputs: GpioInputs,
    session: SessionContext,
    events: Receiver<ControlEvent>,
    ws: EspWebSocketClient<'static>,
    backend_connected: Arc<AtomicBool>,
    nvs_store: NvsStore,
    runtime: RuntimeConfig,
    status_led: Option<StatusLed>,
    save_deadline_ms: Option<u64>,
    wifi_disconnected_since_ms: Option<u64>,
    last_wifi_retry_ms: u64,
}

fn spawn_control_loop(control: ControlLoop) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("control-loop".into())
        .stack_size(12 * 1024)
        .spawn(move || control.run())
        .context("failed to spawn control loop thread")?;
    Ok(())
}

impl ControlLoop {
    fn run(mut self) {
        if let Err(err) = add_current_task_to_watchdog() {
            warn!("failed to register control loop with watchdog: {err:#}");
        }

        loop {
            feed_watchdog();
            let started = Instant::now();
            let now_ms = monotonic_ms();

            let wifi_connected = is_wifi_station_connected();
            self.supervise_wifi(wifi_connected, now_ms);
            update_status_led(
                &mut self.status_led,
                wifi_connected,
                self.backend_connected.load(Ordering::Relaxed),
                now_ms,
            );

            let mut outbound = Vec::new();
            loop {
                match self.events.try_recv() {
                    Ok(event) => outbound.extend(self.handle_event(event, now_ms)),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        error!("websocket event channel closed");
                        break;
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

            let tick = Duration::from_millis(CONTROL_TICK_MS);
            if let Some(rest) = tick.checked_sub(started.elapsed()) {
                thread::sleep(rest);
            }
        }
    }

    fn handle_event(&mut self, event: ControlEvent, now_ms: u64) -> Vec<OutboundMessage> {
        match event {
            ControlEvent::LinkUp => {
                self.session.set_connected(true);
                info!("identifying as {}", self.session.mac());
                vec![self.session.identify(now_ms)]
            }
            ControlEvent::LinkDown => {
                self.session.set_connected(false);
                Vec::new()
            }
            ControlEvent::Inbound(message) => {
                self.engine.handle_inbound(&self.session, message, now_ms)
            }
        }
    }

    fn send(&mut self, messages: Vec<OutboundMessage>) {
        if !self.session.is_connected() {
            return;
        }
        for message in messages {
            let text = match message.encode() {
                Ok(text) => text,
                Err(err) => {
                    warn!("failed to encode {}: {err}", message.kind());
                    continue;
                }
            };
            if let Err(err) = self.ws.send(FrameType::Text(false), text.as_bytes()) {
                warn!("failed to send {}: {err}", message.kind());
            }
        }
    }

    fn supervise_wifi(&mut self, wifi_connected: bool, now_ms: u64) {
        let Some(disconnected_since_ms) = self.wifi_disconnected_since_ms else {
            if !wifi_connected {
                self.wifi_disconnected_since_ms = Some(now_ms);
            }
            return;
        };

        if wifi_connected {
            self.wifi_disconnected_since_ms = None;
            return;
        }

        if now_ms.saturating_sub(disconnected_since_ms) >= WIFI_RESTART_GRACE_MS {
            warn!(
                "wifi disconnected for {}s; restarting device for recovery",
                WIFI_RESTART_GRACE_MS / 1000
            );
            thread::sleep(Duration::from_millis(100));
            unsafe { esp_idf_svc::sys::esp_restart() };
        }

        if now_ms.saturating_sub(self.last_wifi_retry_ms) >= WIFI_RETRY_DELAY_MS {
            self.last_wifi_retry_ms = now_ms;
            info!("wifi (re)connecting");
            let rc = unsafe { esp_idf_svc::sys::esp_wifi_connect() };
            if rc != esp_idf_svc::sys::ESP_OK {
                warn!("esp_wifi_connect failed: esp_err_t={rc}");
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
        if let Err(err) = self.nvs_store.save_runtime_config(&self.runtime) {
            warn!("failed to persist switch state: {err:#}");
            self.queue_save(now_ms, SETTINGS_SAVE_RETRY_MS);
        }
    }
}

impl NvsStore {
    fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; 4096];

        match nvs.get_str(NVS_RUNTIME_KEY, &mut buffer)? {
            Some(value) => Ok(serde_json::from_str::<RuntimeConfig>(value)?),
            None => Ok(RuntimeConfig::default()),
        }
    }

    fn save_runtime_config(&self, runtime: &RuntimeConfig) -> anyhow::Result<()> {
        let mut nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let payload = serde_json::to_string(runtime)?;
        nvs.set_str(NVS_RUNTIME_KEY, &payload)?;
        Ok(())
    }
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
}

fn disable_wifi_power_save() {
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_set_ps(0) };
    if rc == esp_idf_svc::sys::ESP_OK {
        info!("wifi power save disabled");
    } else {
        warn!("failed to disable wifi power save: esp_err_t={rc}");
    }
}

fn is_wifi_station_connected() -> bool {
    let mut ap_info = esp_idf_svc::sys::wifi_ap_record_t::default();
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_sta_get_ap_info(&mut ap_info) };
    rc == esp_idf_svc::sys::ESP_OK
}

fn init_status_led(pin: Line) -> Option<StatusLed> {
    let driver = unsafe { PinDriver::output(AnyOutputPin::new(i32::from(pin))) };
    match driver {
        Ok(mut pin) => {
            let _ = pin.set_low();
            Some(StatusLed { pin, lit: false })
        }
        Err(err) => {
            warn!("status LED unavailable on GPIO{pin}: {err}");
            None
        }
    }
}

fn update_status_led(
    status_led: &mut Option<StatusLed>,
    wifi_connected: bool,
    backend_connected: bool,
    now_ms: u64,
) {
    let blink_ms = if backend_connected {
        LED_BACKEND_BLINK_MS
    } else if wifi_connected {
        LED_WIFI_BLINK_MS
    } else {
        LED_OFFLINE_BLINK_MS
    };
    let desired_on = ((now_ms / blink_ms) % 2) == 0;

    let Some(led) = status_led.as_mut() else {
        return;
    };

    if desired_on == led.lit {
        return;
    }

    let result = if desired_on {
        led.pin.set_high()
    } else {
        led.pin.set_low()
    };

    if let Err(err) = result {
        warn!("failed to drive status LED: {err}");
    } else {
        led.lit = desired_on;
    }
}

fn format_mac(mac: &[u8; 6]) -> String {
    mac.iter()
        .map(|byte| format!("{byte:02X}"))
        .collect::<Vec<_>>()
        .join(":")
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
