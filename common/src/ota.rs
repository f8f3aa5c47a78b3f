//! Update verification and installation.
//!
//! An update is an image plus an `X-Signature` header carrying a hex Ed25519
//! signature over the SHA-256 digest of the image. Nothing is written to the
//! live location before the signature verifies, and the live image is only
//! ever replaced by an atomic rename of a fully written temporary file.

use std::{
    fs::{self, File},
    io::{self, Write},
    path::{Path, PathBuf},
};

use ed25519_dalek::{Signature, VerifyingKey, PUBLIC_KEY_LENGTH, SIGNATURE_LENGTH};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const DEVICE_ID_HEADER: &str = "X-Device-ID";
pub const SIGNATURE_HEADER: &str = "X-Signature";

/// Verifying key baked in at build time; updates are refused without one.
pub const EMBEDDED_PUBLIC_KEY_HEX: Option<&str> = option_env!("LIGHTCTL_UPDATE_PUBLIC_KEY");

#[derive(Debug, Error)]
pub enum OtaError {
    #[error("no update verifying key was embedded in this build")]
    NoVerifyingKey,
    #[error("invalid verifying key: {0}")]
    InvalidKey(String),
    #[error("update server answered HTTP {0}")]
    HttpStatus(u16),
    #[error("update response carried no X-Signature header")]
    MissingSignature,
    #[error("malformed update signature: {0}")]
    MalformedSignature(String),
    #[error("update signature does not verify")]
    BadSignature,
    #[error("update payload is empty")]
    EmptyPayload,
    #[error("installing update failed: {0}")]
    Install(#[from] io::Error),
}

/// What a response from the update endpoint means before any bytes are trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    UpToDate,
    Candidate,
}

pub fn classify_status(status: u16) -> Result<FetchOutcome, OtaError> {
    match status {
        204 | 304 => Ok(FetchOutcome::UpToDate),
        200..=299 => Ok(FetchOutcome::Candidate),
        other => Err(OtaError::HttpStatus(other)),
    }
}

#[derive(Debug, Clone)]
pub struct UpdateVerifier {
    key: VerifyingKey,
}

impl UpdateVerifier {
    pub fn new(key: VerifyingKey) -> Self {
        Self { key }
    }

    pub fn embedded() -> Result<Self, OtaError> {
        Self::from_hex(EMBEDDED_PUBLIC_KEY_HEX.ok_or(OtaError::NoVerifyingKey)?)
    }

    pub fn from_hex(value: &str) -> Result<Self, OtaError> {
        let mut bytes = [0_u8; PUBLIC_KEY_LENGTH];
        hex::decode_to_slice(value.trim(), &mut bytes)
            .map_err(|err| OtaError::InvalidKey(err.to_string()))?;
        let key =
            VerifyingKey::from_bytes(&bytes).map_err(|err| OtaError::InvalidKey(err.to_string()))?;
        Ok(Self { key })
    }

    /// Verifies `payload` against the header value and returns its digest.
    pub fn verify(&self, payload: &[u8], signature: Option<&str>) -> Result<[u8; 32], OtaError> {
        if payload.is_empty() {
            return Err(OtaError::EmptyPayload);
        }
        let digest: [u8; 32] = Sha256::digest(payload).into();
        self.verify_digest(&digest, signature)?;
        Ok(digest)
    }

    /// For images that were streamed and hashed elsewhere.
    pub fn verify_digest(&self, digest: &[u8; 32], signature: Option<&str>) -> Result<(), OtaError> {
        let signature = parse_signature(signature.ok_or(OtaError::MissingSignature)?)?;
        self.key
            .verify_strict(digest, &signature)
            .map_err(|_| OtaError::BadSignature)
    }
}

fn parse_signature(value: &str) -> Result<Signature, OtaError> {
    let mut bytes = [0_u8; SIGNATURE_LENGTH];
    hex::decode_to_slice(value.trim(), &mut bytes)
        .map_err(|err| OtaError::MalformedSignature(err.to_string()))?;
    Ok(Signature::from_bytes(&bytes))
}

pub fn staging_path(live: &Path) -> PathBuf {
    let mut name = live
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    live.with_file_name(name)
}

/// Writes `payload` next to `live`, flushes it to disk and renames it over
/// `live`. On failure the staging file is removed and `live` is untouched.
pub fn install_image(live: &Path, payload: &[u8]) -> Result<(), OtaError> {
    let staging = staging_path(live);
    let result = write_staged(&staging, live, payload);
    if result.is_err() {
        let _ = fs::remove_file(&staging);
    }
    result.map_err(OtaError::from)
}

fn write_staged(staging: &Path, live: &Path, payload: &[u8]) -> io::Result<()> {
    let mut file = File::create(staging)?;
    file.write_all(payload)?;
    file.sync_all()?;
    drop(file);

    #[cfg(unix)]
    if let Ok(metadata) = fs::metadata(live) {
        fs::set_permissions(staging, metadata.permissions())?;
    }

    fs::rename(staging, live)
}

/// Verify, then install. The live image is never opened unless the
/// signature holds.
pub fn apply_update(
    verifier: &UpdateVerifier,
    live: &Path,
    payload: &[u8],
    signature: Option<&str>,
) -> Result<[u8; 32], OtaError> {
    let digest = verifier.verify(payload, signature)?;
    install_image(live, payload)?;
    Ok(digest)
}
