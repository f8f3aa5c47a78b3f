use std::{fmt, time::Duration};

use rand::{distributions::Alphanumeric, Rng};
use serde::Serialize;

use crate::{config::NetworkConfig, identity::DeviceIdentity};

pub const AP_SSID_PREFIX: &str = "LightCtrl-";
pub const AP_PASSWORD_LEN: usize = 12;

/// Station and access point are mutually exclusive; leaving access-point
/// mode takes a reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum NetworkPosture {
    Station,
    AccessPoint,
}

impl NetworkPosture {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Station => "station",
            Self::AccessPoint => "accessPoint",
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct AccessPointCredentials {
    pub ssid: String,
    pub password: String,
}

impl AccessPointCredentials {
    pub fn generate<R: Rng + ?Sized>(identity: &DeviceIdentity, rng: &mut R) -> Self {
        let password = rng
            .sample_iter(&Alphanumeric)
            .take(AP_PASSWORD_LEN)
            .map(char::from)
            .collect();
        Self {
            ssid: format!("{AP_SSID_PREFIX}{}", identity.suffix()),
            password,
        }
    }
}

// Keeps the password out of debug logs.
impl fmt::Debug for AccessPointCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessPointCredentials")
            .field("ssid", &self.ssid)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Calls `probe` up to `attempts` times, sleeping `interval` between tries.
/// Returns the 1-based attempt that succeeded.
pub fn poll_until<P, S>(attempts: u32, interval: Duration, mut probe: P, mut sleep: S) -> Option<u32>
where
    P: FnMut(u32) -> bool,
    S: FnMut(Duration),
{
    for attempt in 1..=attempts {
        if probe(attempt) {
            return Some(attempt);
        }
        if attempt < attempts {
            sleep(interval);
        }
    }
    None
}

/// Joins the configured network or settles on access-point posture.
/// `start` brings the radio up once, then `associated` is polled per attempt.
/// An error from `start` is returned so the caller can decide on a fallback.
pub fn establish<E, F, A, S>(
    config: &NetworkConfig,
    start: F,
    associated: A,
    sleep: S,
) -> Result<NetworkPosture, E>
where
    F: FnOnce() -> Result<(), E>,
    A: FnMut(u32) -> bool,
    S: FnMut(Duration),
{
    if !config.has_station_credentials() {
        return Ok(NetworkPosture::AccessPoint);
    }
    start()?;

    let joined = poll_until(
        config.connect_attempts,
        Duration::from_millis(config.connect_interval_ms),
        associated,
        sleep,
    );
    Ok(match joined {
        Some(_) => NetworkPosture::Station,
        None => NetworkPosture::AccessPoint,
    })
}
