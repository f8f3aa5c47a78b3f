use serde::{Deserialize, Serialize};

/// Control API port on devices when the configuration sets none.
pub const DEFAULT_API_PORT: u16 = 80;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub connect_attempts: u32,
    pub connect_interval_ms: u64,
    /// Host builds only: address used to check that a route exists.
    pub probe_addr: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            connect_attempts: 15,
            connect_interval_ms: 1_000,
            probe_addr: "1.1.1.1:53".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ApiConfig {
    /// Unset means the runtime's own default port.
    pub port: Option<u16>,
    /// Falls back to the identity-derived key when unset.
    pub api_key: Option<String>,
    pub rate_limit_ms: u64,
    pub max_request_bytes: usize,
    pub read_timeout_ms: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            port: None,
            api_key: None,
            rate_limit_ms: 1_000,
            max_request_bytes: 1_024,
            read_timeout_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OtaConfig {
    pub url: String,
    /// 0 checks only at boot.
    pub recheck_interval_secs: u64,
    /// Host builds only: the image replaced by an update. Defaults to the
    /// running executable.
    pub image_path: Option<String>,
    pub request_timeout_ms: u64,
}

impl Default for OtaConfig {
    fn default() -> Self {
        Self {
            url: "https://your-ota-server.com/firmware".to_string(),
            recheck_interval_secs: 0,
            image_path: None,
            request_timeout_ms: 15_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SupervisorConfig {
    pub tick_interval_ms: u64,
    pub loop_sleep_ms: u64,
    pub watchdog_timeout_ms: u64,
    pub watchdog_feed_interval_ms: u64,
    pub inactivity_timeout_secs: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 60_000,
            loop_sleep_ms: 100,
            watchdog_timeout_ms: 30_000,
            watchdog_feed_interval_ms: 10_000,
            inactivity_timeout_secs: 86_400,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RelayConfig {
    pub gpio: i32,
    pub active_high: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            gpio: 12,
            active_high: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DeviceConfig {
    /// Overrides the hardware address on hosts without a fixed one.
    pub mac: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RuntimeConfig {
    pub network: NetworkConfig,
    pub api: ApiConfig,
    pub ota: OtaConfig,
    pub supervisor: SupervisorConfig,
    pub relay: RelayConfig,
    pub device: DeviceConfig,
    pub timezone: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            api: ApiConfig::default(),
            ota: OtaConfig::default(),
            supervisor: SupervisorConfig::default(),
            relay: RelayConfig::default(),
            device: DeviceConfig::default(),
            timezone: "UTC+2".to_string(),
        }
    }
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.network.sanitize();
        self.api.sanitize();
        self.supervisor.sanitize();
        self.ota.sanitize(self.supervisor.watchdog_timeout_ms);

        if crate::clock::parse_timezone(&self.timezone).is_none() {
            self.timezone = "UTC".to_string();
        }
        if self.relay.gpio < 0 {
            self.relay.gpio = RelayConfig::default().gpio;
        }
    }
}

impl NetworkConfig {
    pub fn sanitize(&mut self) {
        self.connect_attempts = self.connect_attempts.clamp(1, 120);
        self.connect_interval_ms = self.connect_interval_ms.clamp(100, 10_000);
    }

    pub fn has_station_credentials(&self) -> bool {
        let ssid = self.wifi_ssid.trim();
        !ssid.is_empty() && ssid != "YOUR_SSID"
    }
}

impl ApiConfig {
    pub fn port_or(&self, default: u16) -> u16 {
        self.port.unwrap_or(default)
    }

    pub fn sanitize(&mut self) {
        if self.port == Some(0) {
            self.port = None;
        }
        if self
            .api_key
            .as_ref()
            .is_some_and(|key| key.trim().is_empty())
        {
            self.api_key = None;
        }
        self.max_request_bytes = self.max_request_bytes.clamp(256, 16 * 1024);
        self.read_timeout_ms = self.read_timeout_ms.clamp(100, 10_000);
    }
}

impl OtaConfig {
    /// An update request blocks the loop, so it must finish well inside the
    /// watchdog window.
    pub fn sanitize(&mut self, watchdog_timeout_ms: u64) {
        self.request_timeout_ms = self
            .request_timeout_ms
            .clamp(1_000, watchdog_timeout_ms / 2);
    }
}

impl SupervisorConfig {
    pub fn sanitize(&mut self) {
        self.watchdog_timeout_ms = self.watchdog_timeout_ms.clamp(5_000, 120_000);
        self.loop_sleep_ms = self.loop_sleep_ms.clamp(10, 1_000);

        // The loop must get back to the feed well inside the timeout window.
        let max_feed = self.watchdog_timeout_ms / 3;
        self.watchdog_feed_interval_ms = self
            .watchdog_feed_interval_ms
            .clamp(self.loop_sleep_ms, max_feed);

        self.tick_interval_ms = self.tick_interval_ms.clamp(1_000, 3_600_000);
        self.inactivity_timeout_secs = self.inactivity_timeout_secs.max(60);
    }
}
