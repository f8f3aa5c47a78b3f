pub mod api;
pub mod clock;
pub mod config;
pub mod connectivity;
pub mod device;
pub mod engine;
pub mod identity;
pub mod ota;
pub mod schedule;
pub mod store;
pub mod types;

pub use api::{ControlApi, Disposition, Exchange, Request, Response, Routes};
pub use config::RuntimeConfig;
pub use connectivity::{AccessPointCredentials, NetworkPosture};
pub use device::Device;
pub use engine::{ControlEngine, EngineAction, RestartReason};
pub use identity::DeviceIdentity;
pub use ota::{OtaError, UpdateVerifier};
pub use schedule::{DayOfWeek, Schedule, ScheduleEntry, TimeOfDay};
pub use store::{FileStorage, MemoryStorage, ScheduleStore, Storage, StoreError};
pub use types::DeviceStatus;
