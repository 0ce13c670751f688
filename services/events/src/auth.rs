//! Per-device API key authentication.
//!
//! Keys are never stored; devices are registered with the hex SHA-256 of
//! their key and every request is checked against it.

use crate::models::Device;
use crate::store::{EventStore, StoreError};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Invalid or revoked device credential")]
    Unauthorized,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Hex SHA-256 of an API key.
pub fn hash_api_key(api_key: &str) -> String {
    hex::encode(Sha256::digest(api_key.as_bytes()))
}

/// Compare a presented key against a stored hex hash in constant time.
fn key_matches(api_key: &str, stored_hash: &str) -> bool {
    let presented = hash_api_key(api_key);
    let stored = stored_hash.to_ascii_lowercase();
    bool::from(presented.as_bytes().ct_eq(stored.as_bytes()))
}

/// Check `api_key` against the registered device.
pub async fn authenticate(
    store: &dyn EventStore,
    device_id: &str,
    api_key: &str,
) -> Result<Device, AuthError> {
    let Some(device) = store.find_device(device_id).await? else {
        warn!(device_id = %device_id, "Unknown device");
        return Err(AuthError::Unauthorized);
    };

    if device.is_revoked() {
        warn!(device_id = %device_id, "Revoked device presented a credential");
        return Err(AuthError::Unauthorized);
    }

    if !key_matches(api_key, &device.api_key_hash) {
        warn!(device_id = %device_id, "API key mismatch");
        return Err(AuthError::Unauthorized);
    }

    Ok(device)
}

/// Resolve an API key to the live devices registered with it, without
/// knowing which device is calling.
pub async fn devices_for_key(
    store: &dyn EventStore,
    api_key: &str,
) -> Result<Vec<Device>, AuthError> {
    let devices: Vec<Device> = store
        .find_devices_by_key_hash(&hash_api_key(api_key))
        .await?
        .into_iter()
        .filter(|d| !d.is_revoked())
        .collect();

    if devices.is_empty() {
        warn!("API key matches no active device");
        return Err(AuthError::Unauthorized);
    }
    Ok(devices)
}
