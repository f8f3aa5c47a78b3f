use serde::Serialize;

pub const FIRMWARE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Body of `GET /status`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceStatus {
    #[serde(rename = "relayOn")]
    pub relay_on: bool,
    #[serde(rename = "scheduleEnabled")]
    pub schedule_enabled: bool,
    pub entries: usize,
    #[serde(rename = "activeEntry")]
    pub active_entry: Option<usize>,
    pub network: &'static str,
    #[serde(rename = "deviceId")]
    pub device_id: String,
    #[serde(rename = "uptimeSecs")]
    pub uptime_secs: u64,
    #[serde(rename = "idleSecs")]
    pub idle_secs: u64,
    #[serde(rename = "timeSynced")]
    pub time_synced: bool,
    pub timezone: String,
    pub version: &'static str,
}
