use core::convert::TryInto;
use std::{
    io::{self, ErrorKind, Write as _},
    net::{SocketAddr, TcpListener, TcpStream},
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    http::{client::Client as HttpClient, Headers, Method, Status},
    io::Read,
    wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::gpio::{Output, PinDriver};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{gpio::AnyOutputPin, prelude::Peripherals},
    http::client::{Configuration as HttpClientConfiguration, EspHttpConnection},
    log::EspLogger,
    nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault},
    ota::EspOta,
    sntp::EspSntp,
    wifi::{BlockingWifi, EspWifi},
};
use log::{error, info, warn};
use sha2::{Digest, Sha256};

use lightctl_common::{
    api::{frame_status, Frame},
    clock::{local_now, monotonic_ms},
    config::{ApiConfig, NetworkConfig, OtaConfig, RelayConfig, DEFAULT_API_PORT},
    connectivity::{self, AccessPointCredentials},
    device::{self, Device},
    ota::{self, FetchOutcome, DEVICE_ID_HEADER, SIGNATURE_HEADER},
    ControlApi, ControlEngine, DeviceIdentity, Disposition, EngineAction, MemoryStorage,
    NetworkPosture, OtaError, RestartReason, RuntimeConfig, ScheduleStore, Storage, StoreError,
    UpdateVerifier,
};

const NVS_NAMESPACE: &str = "lightctl";
const NVS_RUNTIME_KEY: &str = "runtime_json";
const NVS_SCHEDULE_KEY: &str = "schedule";
const NVS_SCHEDULE_MAX: usize = 4096;
const OTA_CHUNK_SIZE: usize = 4096;

type EspDevice = Device<ScheduleBackend>;

struct NvsStore {
    partition: EspDefaultNvsPartition,
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

    /// Falls back to RAM so the schedule still runs when NVS will not open.
    fn schedule_backend(&self) -> ScheduleBackend {
        match EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true) {
            Ok(nvs) => ScheduleBackend::Nvs(NvsStorage { nvs }),
            Err(err) => {
                error!("failed to open NVS for the schedule, changes will not persist: {err:?}");
                ScheduleBackend::Volatile(MemoryStorage::default())
            }
        }
    }
}

enum ScheduleBackend {
    Nvs(NvsStorage),
    Volatile(MemoryStorage),
}

impl Storage for ScheduleBackend {
    fn read(&self) -> io::Result<Vec<u8>> {
        match self {
            Self::Nvs(storage) => storage.read(),
            Self::Volatile(storage) => storage.read(),
        }
    }

    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        match self {
            Self::Nvs(storage) => storage.write(bytes),
            Self::Volatile(storage) => storage.write(bytes),
        }
    }
}

/// Schedule bytes kept as one NVS blob; NVS commits each write as a unit.
struct NvsStorage {
    nvs: EspNvs<NvsDefault>,
}

impl Storage for NvsStorage {
    fn read(&self) -> io::Result<Vec<u8>> {
        let mut buffer = vec![0_u8; NVS_SCHEDULE_MAX];
        match self.nvs.get_blob(NVS_SCHEDULE_KEY, &mut buffer) {
            Ok(Some(bytes)) => Ok(bytes.to_vec()),
            Ok(None) => Err(io::Error::from(ErrorKind::NotFound)),
            Err(err) => Err(io::Error::other(err)),
        }
    }

    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        if bytes.len() > NVS_SCHEDULE_MAX {
            return Err(io::Error::other("schedule larger than its nvs slot"));
        }
        self.nvs
            .set_blob(NVS_SCHEDULE_KEY, bytes)
            .map_err(io::Error::other)
    }
}

struct Relay {
    pin: PinDriver<'static, AnyOutputPin, Output>,
    active_high: bool,
    on: Option<bool>,
}

impl Relay {
    fn new(config: &RelayConfig) -> anyhow::Result<Self> {
        let pin = unsafe { PinDriver::output(AnyOutputPin::new(config.gpio)) }
            .with_context(|| format!("relay gpio {}", config.gpio))?;
        let mut relay = Self {
            pin,
            active_high: config.active_high,
            on: None,
        };
        relay.set(false);
        Ok(relay)
    }

    fn set(&mut self, on: bool) {
        if self.on == Some(on) {
            return;
        }
        let high = on == self.active_high;
        let result = if high {
            self.pin.set_high()
        } else {
            self.pin.set_low()
        };
        match result {
            Ok(()) => {
                info!("relay {}", if on { "on" } else { "off" });
                self.on = Some(on);
            }
            Err(err) => warn!("relay write failed: {err:?}"),
        }
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
    ensure_wifi_defaults(&mut runtime);
    runtime.sanitize();

    let Peripherals { modem, .. } = Peripherals::take()?;
    let mut relay = Relay::new(&runtime.relay)?;

    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let identity = DeviceIdentity::from_mac(
        esp_wifi
            .sta_netif()
            .get_mac()
            .map_err(|err| anyhow!("reading station mac: {err:?}"))?,
    );
    info!(
        "lightctl {} starting as {identity}",
        lightctl_common::types::FIRMWARE_VERSION
    );

    // 1. network
    let posture = bring_up_network(&mut esp_wifi, sys_loop, &runtime.network, &identity)
        .unwrap_or_else(|err| {
            warn!("network bring-up failed: {err:#}");
            NetworkPosture::AccessPoint
        });
    let _sntp = match posture {
        NetworkPosture::Station => EspSntp::new_default()
            .map_err(|err| warn!("failed to start SNTP: {err:?}"))
            .ok(),
        NetworkPosture::AccessPoint => None,
    };

    if let Err(err) = init_watchdog(runtime.supervisor.watchdog_timeout_ms)
        .and_then(|()| add_current_task_to_watchdog())
    {
        error!("task watchdog unavailable: {err:#}");
    }

    if let Ok(mut ota) = EspOta::new() {
        if let Err(err) = ota.mark_running_slot_valid() {
            warn!("failed to mark running OTA slot valid: {err:?}");
        }
    }

    // 2. schedule
    let mut store = ScheduleStore::new(nvs_store.schedule_backend());
    match store.load() {
        Ok(schedule) => info!(
            "schedule loaded: enabled={}, entries={}",
            schedule.enabled,
            schedule.entries.len()
        ),
        Err(StoreError::NotFound) => info!("no schedule persisted yet, relay stays off"),
        Err(err) => warn!("rejected persisted schedule, keeping safe default: {err}"),
    }

    // 3. update
    if posture == NetworkPosture::Station {
        check_update(&runtime.ota, &identity, &mut relay);
    }

    // 4. control api
    let api_key = runtime
        .api
        .api_key
        .clone()
        .unwrap_or_else(|| identity.default_api_key());
    let mut api = ControlApi::new(
        api_key,
        Duration::from_millis(runtime.api.rate_limit_ms),
        device::routes(),
    );
    let listener = bind_api(runtime.api.port_or(DEFAULT_API_PORT));

    // 5. loop
    let engine = ControlEngine::new(
        runtime.supervisor.clone(),
        runtime.ota.recheck_interval_secs,
        monotonic_ms(),
    );
    let mut device = Device::new(identity, posture, runtime.timezone.clone(), store, engine);
    let loop_sleep = Duration::from_millis(runtime.supervisor.loop_sleep_ms);

    // Keep the radio alive for the program lifetime.
    let _wifi = esp_wifi;

    loop {
        if let Some(listener) = &listener {
            match listener.accept() {
                Ok((stream, peer)) => {
                    serve_connection(stream, peer, &mut api, &mut device, &runtime.api)
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => {}
                Err(err) => warn!("accept failed: {err}"),
            }
        }

        let actions = device.poll(monotonic_ms(), local_now(&device.timezone));
        for action in actions {
            match action {
                EngineAction::FeedWatchdog => feed_watchdog(),
                EngineAction::SetRelay(on) => relay.set(on),
                EngineAction::CheckUpdate if device.posture == NetworkPosture::Station => {
                    check_update(&runtime.ota, &identity, &mut relay)
                }
                EngineAction::CheckUpdate => {}
                EngineAction::Restart(reason) => restart(reason, &mut relay),
            }
        }

        thread::sleep(loop_sleep);
    }
}

fn ensure_wifi_defaults(runtime: &mut RuntimeConfig) {
    if runtime.network.wifi_ssid.is_empty() {
        if let Some(ssid) = option_env!("WIFI_SSID") {
            runtime.network.wifi_ssid = ssid.to_string();
        }
    }

    if runtime.network.wifi_pass.is_empty() {
        if let Some(pass) = option_env!("WIFI_PASS") {
            runtime.network.wifi_pass = pass.to_string();
        }
    }
}

fn bring_up_network(
    esp_wifi: &mut EspWifi<'static>,
    sys_loop: EspSystemEventLoop,
    network: &NetworkConfig,
    identity: &DeviceIdentity,
) -> anyhow::Result<NetworkPosture> {
    let mut wifi = BlockingWifi::wrap(esp_wifi, sys_loop)?;

    let posture = if network.has_station_credentials() {
        start_station(&mut wifi, network)?;
        let joined = connectivity::poll_until(
            network.connect_attempts,
            Duration::from_millis(network.connect_interval_ms),
            |attempt| try_associate(&mut wifi, attempt, network.connect_attempts),
            thread::sleep,
        );
        match joined {
            Some(attempt) => {
                info!("wifi connected on attempt {attempt}");
                NetworkPosture::Station
            }
            None => {
                warn!(
                    "all {} wifi connect attempts failed",
                    network.connect_attempts
                );
                let _ = wifi.disconnect();
                let _ = wifi.stop();
                NetworkPosture::AccessPoint
            }
        }
    } else {
        warn!("wifi credentials missing");
        NetworkPosture::AccessPoint
    };

    if posture == NetworkPosture::AccessPoint {
        let credentials = AccessPointCredentials::generate(identity, &mut rand::thread_rng());
        start_access_point(&mut wifi, &credentials)?;
    }
    Ok(posture)
}

fn start_station(
    wifi: &mut BlockingWifi<&mut EspWifi<'static>>,
    network: &NetworkConfig,
) -> anyhow::Result<()> {
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
    Ok(())
}

fn try_associate(
    wifi: &mut BlockingWifi<&mut EspWifi<'static>>,
    attempt: u32,
    attempts: u32,
) -> bool {
    info!("wifi connect attempt {attempt}/{attempts}");
    let result = wifi.connect().and_then(|()| wifi.wait_netif_up());
    match result {
        Ok(()) => true,
        Err(err) => {
            warn!("wifi attempt {attempt} failed: {err:?}");
            let _ = wifi.disconnect();
            false
        }
    }
}

fn start_access_point(
    wifi: &mut BlockingWifi<&mut EspWifi<'static>>,
    credentials: &AccessPointCredentials,
) -> anyhow::Result<()> {
    wifi.set_configuration(&Configuration::AccessPoint(AccessPointConfiguration {
        ssid: credentials
            .ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("access point ssid too long"))?,
        password: credentials
            .password
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("access point password too long"))?,
        auth_method: AuthMethod::WPA2Personal,
        channel: 1,
        ..Default::default()
    }))?;
    wifi.start()?;
    wifi.wait_netif_up()?;
    warn!(
        "access point `{}` up (password: `{}`)",
        credentials.ssid, credentials.password
    );
    Ok(())
}

/// A port we cannot bind leaves the API off; the schedule keeps running.
fn bind_api(port: u16) -> Option<TcpListener> {
    let bound = TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port))).and_then(|listener| {
        listener.set_nonblocking(true)?;
        Ok(listener)
    });
    match bound {
        Ok(listener) => {
            info!("control api listening on port {port}");
            Some(listener)
        }
        Err(err) => {
            error!("failed to bind control api on port {port}, running without it: {err}");
            None
        }
    }
}

fn serve_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    api: &mut ControlApi<EspDevice>,
    device: &mut EspDevice,
    config: &ApiConfig,
) {
    let budget = Duration::from_millis(config.read_timeout_ms);
    if let Err(err) = prepare_stream(&stream, budget) {
        warn!("socket setup for {peer} failed: {err}");
        return;
    }

    let mut buffer = Vec::with_capacity(config.max_request_bytes);
    let frame = read_request(&mut stream, &mut buffer, config.max_request_bytes, budget);
    let exchange = match frame {
        Frame::TooLarge => api.reject_oversized(config.max_request_bytes),
        Frame::Complete | Frame::NeedMore => {
            api.handle(peer.ip(), &buffer, Instant::now(), device)
        }
    };
    device.observe(&exchange);

    match &exchange.disposition {
        Disposition::Accepted { method, path } => info!(
            "{peer} {method} {path} -> {}",
            exchange.response.status().as_u16()
        ),
        Disposition::Throttled => info!("{peer} throttled"),
        Disposition::Unauthorized => warn!("{peer} unauthorized"),
        Disposition::Malformed(err) => info!("{peer} malformed request: {err}"),
    }

    if let Err(err) = stream.write_all(&exchange.response.to_bytes()) {
        warn!("response to {peer} failed: {err}");
    }
    let _ = stream.shutdown(std::net::Shutdown::Both);
}

fn prepare_stream(stream: &TcpStream, budget: Duration) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(budget))?;
    stream.set_write_timeout(Some(budget))
}

/// Reads until a full request, the size limit, EOF, or the time budget.
fn read_request(stream: &mut TcpStream, buffer: &mut Vec<u8>, limit: usize, budget: Duration) -> Frame {
    let deadline = Instant::now() + budget;
    let mut chunk = [0_u8; 256];
    loop {
        let frame = frame_status(buffer, limit);
        if frame != Frame::NeedMore || Instant::now() >= deadline {
            return frame;
        }
        match io::Read::read(stream, &mut chunk) {
            Ok(0) => return Frame::NeedMore,
            Ok(read) => buffer.extend_from_slice(&chunk[..read]),
            Err(err) if err.kind() == ErrorKind::Interrupted => {}
            Err(_) => return Frame::NeedMore,
        }
    }
}

/// Never fails the caller; a successful install does not return.
fn check_update(ota_config: &OtaConfig, identity: &DeviceIdentity, relay: &mut Relay) {
    feed_watchdog();
    match fetch_and_flash(ota_config, identity) {
        Ok(Some(digest)) => {
            info!("update installed, sha256 {}", hex::encode(digest));
            restart(RestartReason::UpdateInstalled, relay);
        }
        Ok(None) => info!("firmware is up to date"),
        Err(err) => warn!("update check failed: {err:#}"),
    }
}

fn fetch_and_flash(
    ota_config: &OtaConfig,
    identity: &DeviceIdentity,
) -> anyhow::Result<Option<[u8; 32]>> {
    let verifier = UpdateVerifier::embedded()?;

    let http_conf = HttpClientConfiguration {
        timeout: Some(Duration::from_millis(ota_config.request_timeout_ms)),
        crt_bundle_attach: Some(esp_idf_svc::sys::esp_crt_bundle_attach),
        ..Default::default()
    };
    let mut client = HttpClient::wrap(EspHttpConnection::new(&http_conf)?);
    let token = identity.token();
    let headers = [(DEVICE_ID_HEADER, token.as_str())];
    let request = client.request(Method::Get, &ota_config.url, &headers)?;
    let mut response = request.submit().map_err(|e| anyhow!("{e:?}"))?;

    if ota::classify_status(response.status())? == FetchOutcome::UpToDate {
        return Ok(None);
    }
    let signature = response
        .header(SIGNATURE_HEADER)
        .map(str::to_string)
        .ok_or(OtaError::MissingSignature)?;

    let mut ota = EspOta::new().map_err(|err| anyhow!("failed to acquire OTA: {err:?}"))?;
    let mut update = ota
        .initiate_update()
        .map_err(|err| anyhow!("failed to initiate OTA update: {err:?}"))?;

    let mut hasher = Sha256::new();
    let mut total_written = 0_u64;
    let mut chunk = vec![0_u8; OTA_CHUNK_SIZE];

    let streamed: anyhow::Result<()> = (|| {
        loop {
            let read = response.read(&mut chunk).map_err(|e| anyhow!("{e:?}"))?;
            if read == 0 {
                return Ok(());
            }
            update
                .write(&chunk[..read])
                .map_err(|err| anyhow!("failed writing OTA data: {err:?}"))?;
            hasher.update(&chunk[..read]);
            total_written = total_written.saturating_add(read as u64);
            feed_watchdog();
        }
    })();

    let digest: [u8; 32] = hasher.finalize().into();
    let verified = streamed.and_then(|()| {
        if total_written == 0 {
            return Err(OtaError::EmptyPayload.into());
        }
        verifier.verify_digest(&digest, Some(&signature))?;
        Ok(())
    });

    if let Err(err) = verified {
        if let Err(abort_err) = update.abort() {
            warn!("failed to abort OTA slot write: {abort_err:?}");
        }
        return Err(err);
    }

    info!("update signature verified ({total_written} bytes)");
    update
        .complete()
        .map_err(|err| anyhow!("failed finalizing OTA image: {err:?}"))?;
    Ok(Some(digest))
}

fn restart(reason: RestartReason, relay: &mut Relay) -> ! {
    warn!("restarting: {}", reason.as_str());
    relay.set(false);
    thread::sleep(Duration::from_millis(200));
    unsafe { esp_idf_svc::sys::esp_restart() }
}

fn init_watchdog(timeout_ms: u64) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: u32::try_from(timeout_ms).unwrap_or(u32::MAX),
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
