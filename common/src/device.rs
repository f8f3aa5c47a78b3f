//! Device state shared by the runtimes and the built-in API handlers.

use chrono::{DateTime, FixedOffset};
use http::{Method, StatusCode};

use crate::{
    api::{Disposition, Exchange, Request, Response, Routes},
    connectivity::NetworkPosture,
    engine::{ControlEngine, EngineAction},
    identity::DeviceIdentity,
    schedule::Schedule,
    store::{ScheduleStore, Storage, StoreError},
    types::{DeviceStatus, FIRMWARE_VERSION},
};

/// Everything the supervisor owns, passed to handlers by `&mut`.
pub struct Device<S> {
    pub identity: DeviceIdentity,
    pub posture: NetworkPosture,
    pub timezone: String,
    pub store: ScheduleStore<S>,
    pub engine: ControlEngine,

    now_ms: u64,
    local: Option<DateTime<FixedOffset>>,
}

impl<S: Storage> Device<S> {
    pub fn new(
        identity: DeviceIdentity,
        posture: NetworkPosture,
        timezone: impl Into<String>,
        store: ScheduleStore<S>,
        engine: ControlEngine,
    ) -> Self {
        Self {
            identity,
            posture,
            timezone: timezone.into(),
            store,
            engine,
            now_ms: 0,
            local: None,
        }
    }

    /// Advances the clocks and asks the engine what to do.
    pub fn poll(&mut self, now_ms: u64, local: Option<DateTime<FixedOffset>>) -> Vec<EngineAction> {
        self.now_ms = now_ms;
        self.local = local;
        self.engine.poll(now_ms, local, self.store.active())
    }

    /// Only requests that cleared both gates count as activity.
    pub fn observe(&mut self, exchange: &Exchange) {
        if matches!(exchange.disposition, Disposition::Accepted { .. }) {
            self.engine.note_activity(self.now_ms);
        }
    }

    pub fn replace_schedule(&mut self, schedule: Schedule) -> Result<(), StoreError> {
        self.store.save(schedule)?;
        self.engine.schedule_changed();
        Ok(())
    }

    pub fn status(&self) -> DeviceStatus {
        let schedule = self.store.active();
        DeviceStatus {
            relay_on: self.engine.relay_on(),
            schedule_enabled: schedule.enabled,
            entries: schedule.entries.len(),
            active_entry: self
                .local
                .as_ref()
                .filter(|_| schedule.enabled)
                .and_then(|local| schedule.active_entry(local)),
            network: self.posture.as_str(),
            device_id: self.identity.token(),
            uptime_secs: self.now_ms / 1_000,
            idle_secs: self.engine.idle_ms(self.now_ms) / 1_000,
            time_synced: self.local.is_some(),
            timezone: self.timezone.clone(),
            version: FIRMWARE_VERSION,
        }
    }
}

/// `GET /status`, `GET /schedule` and `PUT /schedule`; everything else gets
/// the stub answer.
pub fn routes<S: Storage + 'static>() -> Routes<Device<S>> {
    Routes::<Device<S>>::new()
        .route(Method::GET, "/status", |_, device| {
            Response::json(StatusCode::OK, &device.status())
        })
        .route(Method::GET, "/schedule", |_, device| {
            Response::json(StatusCode::OK, device.store.active())
        })
        .route(Method::PUT, "/schedule", put_schedule::<S>)
}

fn put_schedule<S: Storage>(request: &Request, device: &mut Device<S>) -> Response {
    let schedule: Schedule = match serde_json::from_slice(&request.body) {
        Ok(schedule) => schedule,
        Err(err) => return Response::error(StatusCode::BAD_REQUEST, &err.to_string()),
    };

    match device.replace_schedule(schedule) {
        Ok(()) => Response::json(StatusCode::OK, device.store.active()),
        Err(err) => Response::error(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::{self, ErrorKind},
        net::{IpAddr, Ipv4Addr},
        time::{Duration, Instant},
    };

    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{api::ControlApi, config::SupervisorConfig};

    const KEY: &str = "SECURE_KEY_a1b2c3";
    const DOCUMENT: &str =
        r#"{"enabled":true,"entries":[{"days":[0],"on":[22,0],"off":[6,0],"enabled":true}]}"#;

    #[derive(Default)]
    struct MemoryStorage {
        bytes: Option<Vec<u8>>,
        fail_writes: bool,
    }

    impl Storage for MemoryStorage {
        fn read(&self) -> io::Result<Vec<u8>> {
            self.bytes
                .clone()
                .ok_or_else(|| io::Error::from(ErrorKind::NotFound))
        }

        fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
            if self.fail_writes {
                return Err(io::Error::other("flash worn out"));
            }
            self.bytes = Some(bytes.to_vec());
            Ok(())
        }
    }

    fn device(storage: MemoryStorage) -> Device<MemoryStorage> {
        Device::new(
            DeviceIdentity::from_mac([0x24, 0x6f, 0x28, 0xa1, 0xb2, 0xc3]),
            NetworkPosture::Station,
            "UTC+2",
            ScheduleStore::new(storage),
            ControlEngine::new(SupervisorConfig::default(), 0, 0),
        )
    }

    fn api() -> ControlApi<Device<MemoryStorage>> {
        ControlApi::new(KEY, Duration::from_secs(1), routes())
    }

    fn request(method: &str, path: &str, body: &str) -> Vec<u8> {
        format!(
            "{method} {path} HTTP/1.1\r\nX-API-Key: {KEY}\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        )
        .into_bytes()
    }

    fn peer(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(192, 168, 1, last))
    }

    // 2026-06-01 is a Monday.
    fn monday_night() -> Option<DateTime<FixedOffset>> {
        FixedOffset::east_opt(7_200)
            .unwrap()
            .with_ymd_and_hms(2026, 6, 1, 23, 0, 0)
            .single()
    }

    #[test]
    fn put_schedule_persists_and_reevaluates() {
        let mut device = device(MemoryStorage::default());
        let mut api = api();
        device.poll(0, monday_night());

        let exchange = api.handle(
            peer(10),
            &request("PUT", "/schedule", DOCUMENT),
            Instant::now(),
            &mut device,
        );
        assert_eq!(exchange.response.status(), StatusCode::OK);
        assert!(device.store.active().enabled);

        let actions = device.poll(100, monday_night());
        assert_eq!(
            actions,
            vec![EngineAction::FeedWatchdog, EngineAction::SetRelay(true)]
        );

        // A fresh store over the same bytes sees the document.
        let persisted = device.store.active().clone();
        let mut reloaded = ScheduleStore::new(MemoryStorage {
            bytes: crate::store::encode_document(&persisted).ok(),
            fail_writes: false,
        });
        assert_eq!(reloaded.load().unwrap(), &persisted);
    }

    #[test]
    fn put_schedule_rejects_invalid_documents() {
        let mut device = device(MemoryStorage::default());
        let mut api = api();

        let bad = r#"{"enabled":true,"entries":[{"days":[9],"on":[22,0],"off":[6,0],"enabled":true}]}"#;
        let exchange = api.handle(
            peer(10),
            &request("PUT", "/schedule", bad),
            Instant::now(),
            &mut device,
        );

        assert_eq!(exchange.response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(device.store.active(), &Schedule::default());
    }

    #[test]
    fn put_schedule_reports_write_failure() {
        let mut device = device(MemoryStorage {
            bytes: None,
            fail_writes: true,
        });
        let mut api = api();

        let exchange = api.handle(
            peer(10),
            &request("PUT", "/schedule", DOCUMENT),
            Instant::now(),
            &mut device,
        );

        assert_eq!(
            exchange.response.status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(device.store.active(), &Schedule::default());
    }

    #[test]
    fn status_reports_device_state() {
        let mut device = device(MemoryStorage::default());
        device.replace_schedule(serde_json::from_str(DOCUMENT).unwrap()).unwrap();
        device.poll(90_000, monday_night());

        let status = device.status();
        assert!(status.relay_on);
        assert_eq!(status.active_entry, Some(0));
        assert_eq!(status.entries, 1);
        assert_eq!(status.network, "station");
        assert_eq!(status.device_id, "246f28a1b2c3");
        assert_eq!(status.uptime_secs, 90);
        assert!(status.time_synced);

        let mut api = api();
        let exchange = api.handle(
            peer(10),
            &request("GET", "/status", ""),
            Instant::now(),
            &mut device,
        );
        let body: serde_json::Value = serde_json::from_slice(exchange.response.body()).unwrap();
        assert_eq!(body["relayOn"], true);
        assert_eq!(body["deviceId"], "246f28a1b2c3");
    }

    #[test]
    fn unknown_routes_fall_through_to_stub() {
        let mut device = device(MemoryStorage::default());
        let mut api = api();

        let exchange = api.handle(
            peer(10),
            &request("POST", "/relay", ""),
            Instant::now(),
            &mut device,
        );
        assert_eq!(exchange.response.to_bytes(), b"HTTP/1.1 200 OK\r\n\r\nOK");
    }

    #[test]
    fn only_accepted_requests_count_as_activity() {
        let mut device = device(MemoryStorage::default());
        let mut api = api();
        let start = Instant::now();
        device.poll(50_000, None);

        let unauthorized = api.handle(
            peer(10),
            b"GET /status HTTP/1.1\r\n\r\n",
            start,
            &mut device,
        );
        device.observe(&unauthorized);
        assert_eq!(device.engine.idle_ms(50_000), 50_000);

        let accepted = api.handle(peer(10), &request("GET", "/status", ""), start, &mut device);
        device.observe(&accepted);
        assert_eq!(device.engine.idle_ms(50_000), 0);
    }
}
