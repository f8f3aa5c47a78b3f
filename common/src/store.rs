//! Integrity-checked persistence for the schedule document.
//!
//! On-disk layout is `content || hex(sha256(content))`, where `content` is the
//! compact JSON document and the trailer is 64 lowercase hex characters.

use std::{
    fs,
    io::{self, ErrorKind},
    path::PathBuf,
};

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::schedule::Schedule;

pub const DIGEST_HEX_LEN: usize = 64;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no schedule has been persisted yet")]
    NotFound,
    #[error("storage i/o failed: {0}")]
    Io(#[from] io::Error),
    #[error("persisted schedule is {0} bytes, shorter than its digest")]
    TooShort(usize),
    #[error("persisted schedule digest does not match its content")]
    DigestMismatch,
    #[error("persisted schedule is not a valid document: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Byte-level backend the schedule is persisted to.
pub trait Storage {
    /// `ErrorKind::NotFound` means nothing has been written yet.
    fn read(&self) -> io::Result<Vec<u8>>;
    fn write(&mut self, bytes: &[u8]) -> io::Result<()>;
}

#[derive(Debug, Clone)]
pub struct FileStorage {
    path: PathBuf,
}

impl FileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Storage for FileStorage {
    fn read(&self) -> io::Result<Vec<u8>> {
        fs::read(&self.path)
    }

    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, bytes)
    }
}

/// Volatile backend for devices whose persistent storage cannot be opened.
/// Writes last until the next restart.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    bytes: Option<Vec<u8>>,
}

impl Storage for MemoryStorage {
    fn read(&self) -> io::Result<Vec<u8>> {
        self.bytes
            .clone()
            .ok_or_else(|| io::Error::from(ErrorKind::NotFound))
    }

    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.bytes = Some(bytes.to_vec());
        Ok(())
    }
}

pub fn digest_hex(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

pub fn encode_document(schedule: &Schedule) -> Result<Vec<u8>, serde_json::Error> {
    let mut buffer = serde_json::to_vec(schedule)?;
    let digest = digest_hex(&buffer);
    buffer.extend_from_slice(digest.as_bytes());
    Ok(buffer)
}

pub fn decode_document(raw: &[u8]) -> Result<Schedule, StoreError> {
    if raw.len() < DIGEST_HEX_LEN {
        return Err(StoreError::TooShort(raw.len()));
    }

    let (content, trailer) = raw.split_at(raw.len() - DIGEST_HEX_LEN);
    if digest_hex(content).as_bytes() != trailer {
        return Err(StoreError::DigestMismatch);
    }

    Ok(serde_json::from_slice(content)?)
}

/// Holds the active schedule and its persisted copy.
///
/// The active document only changes to something that verified on load or
/// was written successfully on save; every failure leaves it as it was.
pub struct ScheduleStore<S> {
    storage: S,
    active: Schedule,
}

impl<S: Storage> ScheduleStore<S> {
    pub fn new(storage: S) -> Self {
        Self {
            storage,
            active: Schedule::default(),
        }
    }

    pub fn active(&self) -> &Schedule {
        &self.active
    }

    pub fn load(&mut self) -> Result<&Schedule, StoreError> {
        let raw = self.storage.read().map_err(|err| match err.kind() {
            ErrorKind::NotFound => StoreError::NotFound,
            _ => StoreError::Io(err),
        })?;
        self.active = decode_document(&raw)?;
        Ok(&self.active)
    }

    pub fn save(&mut self, schedule: Schedule) -> Result<(), StoreError> {
        let buffer = encode_document(&schedule)?;
        self.storage.write(&buffer)?;
        self.active = schedule;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::schedule::{DayOfWeek, ScheduleEntry, TimeOfDay};

    #[derive(Default)]
    struct FlakyStorage {
        bytes: Option<Vec<u8>>,
        fail_writes: bool,
    }

    impl Storage for FlakyStorage {
        fn read(&self) -> io::Result<Vec<u8>> {
            self.bytes
                .clone()
                .ok_or_else(|| io::Error::from(ErrorKind::NotFound))
        }

        fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
            if self.fail_writes {
                return Err(io::Error::other("flash full"));
            }
            self.bytes = Some(bytes.to_vec());
            Ok(())
        }
    }

    fn sample() -> Schedule {
        Schedule {
            enabled: true,
            entries: vec![ScheduleEntry {
                days: [DayOfWeek::Mon, DayOfWeek::Fri].into_iter().collect(),
                on: TimeOfDay::new(22, 0).unwrap(),
                off: TimeOfDay::new(6, 0).unwrap(),
                enabled: true,
            }],
        }
    }

    #[test]
    fn round_trips_through_storage() {
        let mut store = ScheduleStore::new(FlakyStorage::default());
        store.save(sample()).unwrap();

        let mut reloaded = ScheduleStore::new(FlakyStorage {
            bytes: store.storage.bytes.clone(),
            fail_writes: false,
        });
        reloaded.load().unwrap();

        assert_eq!(reloaded.active(), &sample());
    }

    #[test]
    fn trailer_is_hex_sha256_of_content() {
        let encoded = encode_document(&sample()).unwrap();
        let (content, trailer) = encoded.split_at(encoded.len() - DIGEST_HEX_LEN);

        assert_eq!(content, serde_json::to_vec(&sample()).unwrap().as_slice());
        assert_eq!(trailer, digest_hex(content).as_bytes());
    }

    #[test]
    fn tampered_content_keeps_default() {
        let mut bytes = encode_document(&sample()).unwrap();
        bytes[3] ^= 0x20;
        let mut store = ScheduleStore::new(FlakyStorage {
            bytes: Some(bytes),
            fail_writes: false,
        });

        assert!(matches!(store.load(), Err(StoreError::DigestMismatch)));
        assert_eq!(store.active(), &Schedule::default());
    }

    #[test]
    fn truncated_file_keeps_previous_document() {
        let mut store = ScheduleStore::new(FlakyStorage::default());
        store.save(sample()).unwrap();

        let truncated = store.storage.bytes.as_ref().unwrap()[..40].to_vec();
        store.storage.bytes = Some(truncated);

        assert!(matches!(store.load(), Err(StoreError::TooShort(40))));
        assert_eq!(store.active(), &sample());
    }

    #[test]
    fn valid_digest_over_invalid_document_is_rejected() {
        let content = br#"{"enabled":true,"entries":[{"days":[9]}]}"#;
        let mut bytes = content.to_vec();
        bytes.extend_from_slice(digest_hex(content).as_bytes());
        let mut store = ScheduleStore::new(FlakyStorage {
            bytes: Some(bytes),
            fail_writes: false,
        });

        assert!(matches!(store.load(), Err(StoreError::Parse(_))));
        assert_eq!(store.active(), &Schedule::default());
    }

    #[test]
    fn missing_storage_is_not_found() {
        let mut store = ScheduleStore::new(FlakyStorage::default());
        assert!(matches!(store.load(), Err(StoreError::NotFound)));
    }

    #[test]
    fn failed_write_does_not_replace_active_document() {
        let mut store = ScheduleStore::new(FlakyStorage {
            bytes: None,
            fail_writes: true,
        });

        assert!(matches!(store.save(sample()), Err(StoreError::Io(_))));
        assert_eq!(store.active(), &Schedule::default());
    }

    #[test]
    fn memory_storage_serves_the_saved_document() {
        let mut store = ScheduleStore::new(MemoryStorage::default());
        assert!(matches!(store.load(), Err(StoreError::NotFound)));

        store.save(sample()).unwrap();
        assert_eq!(store.load().unwrap(), &sample());
    }

    #[test]
    fn file_storage_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("schedule.json");
        let mut store = ScheduleStore::new(FileStorage::new(&path));

        store.save(sample()).unwrap();
        let mut reloaded = ScheduleStore::new(FileStorage::new(&path));
        reloaded.load().unwrap();

        assert_eq!(reloaded.active(), &sample());
    }
}
