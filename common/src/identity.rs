use std::{fmt, str::FromStr};

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid MAC address `{0}`, expected six colon-separated hex octets")]
pub struct InvalidMac(pub String);

/// Stable device identity derived from the hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceIdentity {
    mac: [u8; 6],
}

impl DeviceIdentity {
    pub fn from_mac(mac: [u8; 6]) -> Self {
        Self { mac }
    }

    /// Sent as `X-Device-ID` with update requests.
    pub fn token(&self) -> String {
        hex::encode(self.mac)
    }

    /// Last three octets, used to tell devices apart on the air.
    pub fn suffix(&self) -> String {
        hex::encode(&self.mac[3..])
    }

    pub fn default_api_key(&self) -> String {
        format!("SECURE_KEY_{}", self.suffix())
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.mac;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl FromStr for DeviceIdentity {
    type Err = InvalidMac;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidMac(value.to_string());
        let mut mac = [0_u8; 6];
        let mut parts = value.trim().split([':', '-']);

        for octet in mac.iter_mut() {
            let part = parts.next().ok_or_else(invalid)?;
            if part.len() != 2 {
                return Err(invalid());
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }

        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(Self { mac })
    }
}
