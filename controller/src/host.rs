use std::{
    io::ErrorKind,
    net::{SocketAddr, UdpSocket},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::Context;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    time::{timeout, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

use lightctl_common::{
    api::{frame_status, Frame},
    clock::{local_now, monotonic_ms},
    config::{ApiConfig, NetworkConfig, OtaConfig},
    connectivity,
    device::{self, Device},
    ota::{self, FetchOutcome, DEVICE_ID_HEADER, SIGNATURE_HEADER},
    AccessPointCredentials, ControlApi, ControlEngine, DeviceIdentity, Disposition, EngineAction,
    FileStorage, NetworkPosture, RestartReason, RuntimeConfig, ScheduleStore,
    StoreError, UpdateVerifier,
};

/// Exit status telling the service manager to start us again.
const RESTART_EXIT_CODE: i32 = 3;
/// Locally administered address for hosts that configure none.
const FALLBACK_MAC: [u8; 6] = [0x02, 0, 0, 0, 0, 0x01];
const HOST_DEFAULT_PORT: u16 = 8080;

type HostDevice = Device<FileStorage>;

struct DataPaths {
    runtime: PathBuf,
    schedule: PathBuf,
}

impl DataPaths {
    fn from_env() -> Self {
        let data_dir = std::env::var("LIGHTCTL_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.lightctl"));

        Self {
            runtime: data_dir.join("runtime.json"),
            schedule: data_dir.join("schedule.json"),
        }
    }
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let paths = DataPaths::from_env();
    let mut runtime = load_runtime_config(&paths.runtime)
        .await
        .unwrap_or_else(|err| {
            warn!("failed to load runtime config: {err:#}");
            RuntimeConfig::default()
        });
    apply_env_overrides(&mut runtime, |name| std::env::var(name).ok());
    runtime.sanitize();

    let identity = resolve_identity(&runtime);
    info!(device = %identity, version = lightctl_common::types::FIRMWARE_VERSION, "lightctl controller starting");

    let posture = connect_network(runtime.network.clone(), identity).await;

    let mut store = ScheduleStore::new(FileStorage::new(&paths.schedule));
    match store.load() {
        Ok(schedule) => info!(
            enabled = schedule.enabled,
            entries = schedule.entries.len(),
            "schedule loaded"
        ),
        Err(StoreError::NotFound) => info!("no schedule persisted yet, relay stays off"),
        Err(err) => warn!("rejected persisted schedule, keeping safe default: {err}"),
    }

    let image_path = resolve_image_path(&runtime.ota);
    check_update(&runtime.ota, &identity, image_path.as_deref()).await;

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

    let listener = bind_api(runtime.api.port_or(HOST_DEFAULT_PORT)).await;

    let engine = ControlEngine::new(
        runtime.supervisor.clone(),
        runtime.ota.recheck_interval_secs,
        monotonic_ms(),
    );
    let mut device = Device::new(identity, posture, runtime.timezone.clone(), store, engine);
    let mut relay = HostRelay::default();
    relay.set(false);
    let watchdog = Watchdog::start(Duration::from_millis(
        runtime.supervisor.watchdog_timeout_ms,
    ))?;

    let mut interval = tokio::time::interval(Duration::from_millis(runtime.supervisor.loop_sleep_ms));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            accepted = accept(listener.as_ref()) => match accepted {
                Ok((stream, peer)) => serve_connection(stream, peer, &mut api, &mut device, &runtime.api).await,
                Err(err) => warn!("accept failed: {err}"),
            },
            _ = interval.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, relay off");
                relay.set(false);
                return Ok(());
            }
        }

        let actions = device.poll(monotonic_ms(), local_now(&device.timezone));
        for action in actions {
            match action {
                EngineAction::FeedWatchdog => watchdog.feed(),
                EngineAction::SetRelay(on) => relay.set(on),
                EngineAction::CheckUpdate => {
                    watchdog.feed();
                    check_update(&runtime.ota, &identity, image_path.as_deref()).await
                }
                EngineAction::Restart(reason) => restart(reason),
            }
        }
    }
}

async fn load_runtime_config(path: &Path) -> anyhow::Result<RuntimeConfig> {
    match tokio::fs::read(path).await {
        Ok(raw) => Ok(serde_json::from_slice::<RuntimeConfig>(&raw)
            .with_context(|| format!("invalid runtime config at {}", path.display()))?),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
        Err(err) => Err(err.into()),
    }
}

fn apply_env_overrides(runtime: &mut RuntimeConfig, var: impl Fn(&str) -> Option<String>) {
    if let Some(port) = var("LIGHTCTL_HTTP_PORT") {
        match port.parse::<u16>() {
            Ok(port) => runtime.api.port = Some(port),
            Err(err) => warn!("ignoring LIGHTCTL_HTTP_PORT `{port}`: {err}"),
        }
    }
    if let Some(key) = var("LIGHTCTL_API_KEY") {
        runtime.api.api_key = Some(key);
    }
    if let Some(url) = var("LIGHTCTL_OTA_URL") {
        runtime.ota.url = url;
    }
    if let Some(mac) = var("LIGHTCTL_MAC") {
        runtime.device.mac = Some(mac);
    }
}

fn resolve_identity(runtime: &RuntimeConfig) -> DeviceIdentity {
    let fallback = DeviceIdentity::from_mac(FALLBACK_MAC);
    let Some(configured) = runtime.device.mac.as_deref() else {
        warn!("no device.mac or LIGHTCTL_MAC set, using {fallback}");
        return fallback;
    };
    configured.parse().unwrap_or_else(|err| {
        warn!("{err}, using {fallback}");
        fallback
    })
}

async fn connect_network(config: NetworkConfig, identity: DeviceIdentity) -> NetworkPosture {
    let probe_addr = config.probe_addr.clone();
    let attempt = tokio::task::spawn_blocking(move || {
        connectivity::establish(
            &config,
            || Ok::<(), anyhow::Error>(()),
            |attempt| {
                let routed = has_route(&probe_addr);
                debug!(attempt, routed, "network probe");
                routed
            },
            thread::sleep,
        )
    })
    .await;

    let posture = match attempt {
        Ok(Ok(posture)) => posture,
        Ok(Err(err)) => {
            warn!("network bring-up failed: {err:#}");
            NetworkPosture::AccessPoint
        }
        Err(err) => {
            warn!("network probe task failed: {err}");
            NetworkPosture::AccessPoint
        }
    };

    match posture {
        NetworkPosture::Station => info!("network up"),
        NetworkPosture::AccessPoint => {
            let credentials = AccessPointCredentials::generate(&identity, &mut rand::thread_rng());
            warn!(
                ssid = %credentials.ssid,
                password = %credentials.password,
                "no network, access point posture (host build has no radio to start)"
            );
        }
    }
    posture
}

fn has_route(probe_addr: &str) -> bool {
    let Ok(socket) = UdpSocket::bind("0.0.0.0:0") else {
        return false;
    };
    if socket.connect(probe_addr).is_err() {
        return false;
    }
    socket
        .local_addr()
        .map(|local| !local.ip().is_loopback() && !local.ip().is_unspecified())
        .unwrap_or(false)
}

fn resolve_image_path(ota: &OtaConfig) -> Option<PathBuf> {
    if let Some(path) = &ota.image_path {
        return Some(PathBuf::from(path));
    }
    std::env::current_exe()
        .map_err(|err| warn!("cannot locate running image, updates disabled: {err}"))
        .ok()
}

/// Never fails the caller; a successful install does not return.
async fn check_update(ota: &OtaConfig, identity: &DeviceIdentity, image: Option<&Path>) {
    let Some(image) = image else {
        return;
    };
    match fetch_and_install(ota, identity, image).await {
        Ok(Some(digest)) => {
            info!(digest = %hex::encode(digest), "update installed");
            restart(RestartReason::UpdateInstalled);
        }
        Ok(None) => info!("firmware is up to date"),
        Err(err) => warn!("update check failed: {err:#}"),
    }
}

async fn fetch_and_install(
    ota: &OtaConfig,
    identity: &DeviceIdentity,
    image: &Path,
) -> anyhow::Result<Option<[u8; 32]>> {
    let verifier = UpdateVerifier::embedded()?;

    let client = reqwest::Client::builder()
        .timeout(Duration::from_millis(ota.request_timeout_ms))
        .build()?;
    let response = client
        .get(&ota.url)
        .header(DEVICE_ID_HEADER, identity.token())
        .send()
        .await
        .with_context(|| format!("GET {}", ota.url))?;

    if ota::classify_status(response.status().as_u16())? == FetchOutcome::UpToDate {
        return Ok(None);
    }

    let signature = response
        .headers()
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let payload = response.bytes().await.context("reading update body")?;
    info!(bytes = payload.len(), "update candidate downloaded");

    let image = image.to_path_buf();
    let digest = tokio::task::spawn_blocking(move || {
        ota::apply_update(&verifier, &image, &payload, signature.as_deref())
    })
    .await??;
    Ok(Some(digest))
}

/// A port we cannot bind leaves the API off; the schedule keeps running.
async fn bind_api(port: u16) -> Option<TcpListener> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    match TcpListener::bind(addr).await {
        Ok(listener) => {
            info!("control api listening on {addr}");
            Some(listener)
        }
        Err(err) => {
            error!("failed to bind control api at {addr}, running without it: {err}");
            None
        }
    }
}

async fn accept(listener: Option<&TcpListener>) -> std::io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    api: &mut ControlApi<HostDevice>,
    device: &mut HostDevice,
    config: &ApiConfig,
) {
    let mut buffer = Vec::with_capacity(config.max_request_bytes);
    let budget = Duration::from_millis(config.read_timeout_ms);
    let frame = match timeout(
        budget,
        read_request(&mut stream, &mut buffer, config.max_request_bytes),
    )
    .await
    {
        Ok(Ok(frame)) => frame,
        Ok(Err(err)) => {
            debug!(%peer, "request read failed: {err}");
            return;
        }
        // Whatever arrived is answered; the parser rejects partial requests.
        Err(_) => Frame::NeedMore,
    };

    let exchange = match frame {
        Frame::TooLarge => api.reject_oversized(config.max_request_bytes),
        Frame::Complete | Frame::NeedMore => {
            api.handle(peer.ip(), &buffer, Instant::now(), device)
        }
    };
    device.observe(&exchange);

    match &exchange.disposition {
        Disposition::Accepted { method, path } => {
            info!(%peer, %method, path = %path, status = exchange.response.status().as_u16(), "request")
        }
        Disposition::Throttled => debug!(%peer, "request throttled"),
        Disposition::Unauthorized => warn!(%peer, "unauthorized request"),
        Disposition::Malformed(err) => debug!(%peer, "malformed request: {err}"),
    }

    let write = async {
        stream.write_all(&exchange.response.to_bytes()).await?;
        stream.shutdown().await
    };
    if let Err(err) = timeout(budget, write)
        .await
        .map_err(std::io::Error::from)
        .and_then(|result| result)
    {
        debug!(%peer, "response write failed: {err}");
    }
}

async fn read_request(
    stream: &mut TcpStream,
    buffer: &mut Vec<u8>,
    limit: usize,
) -> std::io::Result<Frame> {
    let mut chunk = [0_u8; 256];
    loop {
        let frame = frame_status(buffer, limit);
        if frame != Frame::NeedMore {
            return Ok(frame);
        }
        let read = stream.read(&mut chunk).await?;
        if read == 0 {
            return Ok(Frame::NeedMore);
        }
        buffer.extend_from_slice(&chunk[..read]);
    }
}

/// Software stand-in for the hardware task watchdog: aborts the process when
/// the loop stops feeding it.
struct Watchdog {
    last_feed_ms: Arc<AtomicU64>,
}

impl Watchdog {
    fn start(timeout: Duration) -> anyhow::Result<Self> {
        let last_feed_ms = Arc::new(AtomicU64::new(monotonic_ms()));
        let monitored = Arc::clone(&last_feed_ms);
        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);

        thread::Builder::new()
            .name("watchdog".to_string())
            .spawn(move || loop {
                thread::sleep(Duration::from_secs(1));
                let starved_ms = monotonic_ms().saturating_sub(monitored.load(Ordering::Relaxed));
                if starved_ms > timeout_ms {
                    error!(starved_ms, "watchdog not fed, aborting");
                    std::process::abort();
                }
            })
            .context("failed to spawn watchdog thread")?;

        info!(timeout_ms, "watchdog armed");
        Ok(Self { last_feed_ms })
    }

    fn feed(&self) {
        self.last_feed_ms.store(monotonic_ms(), Ordering::Relaxed);
    }
}

#[derive(Default)]
struct HostRelay {
    on: Option<bool>,
}

impl HostRelay {
    fn set(&mut self, on: bool) {
        if self.on != Some(on) {
            info!(on, "relay switched");
            self.on = Some(on);
        }
    }
}

fn restart(reason: RestartReason) -> ! {
    warn!(reason = reason.as_str(), "restarting");
    std::process::exit(RESTART_EXIT_CODE)
}
