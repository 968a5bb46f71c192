use std::path::{Path, PathBuf};

use crate::{
    error::{FleetError, FleetResult},
    host::Host,
    record::{self, ConfigRecord, DERIVED_FIELDS},
    registry::ComponentType,
};

pub const CONFIG_MODE: u32 = 0o664;

pub fn config_path(ct: &ComponentType, record: &ConfigRecord) -> PathBuf {
    PathBuf::from(record.string(record::HOME)).join(ct.config_file())
}

/// Persist the record atomically. When the host session is privileged the
/// file is handed to the instance user before it becomes visible.
pub async fn write_config(host: &Host, ct: &ComponentType, record: &ConfigRecord) -> FleetResult<()> {
    let path = config_path(ct, record);
    let mut data = serde_json::to_vec_pretty(&record.persistable())
        .map_err(|error| FleetError::invalid_config(&path, error.to_string()))?;
    data.push(b'\n');
    let owner = record
        .non_empty(record::USER)
        .filter(|_| host.is_privileged());
    host.write_atomic(&path, &data, CONFIG_MODE, owner.as_deref())
        .await
}

/// Read a stored record, `None` when the file does not exist.
pub async fn read_config(host: &Host, path: &Path) -> FleetResult<Option<ConfigRecord>> {
    let data = match host.read_file(path).await {
        Ok(data) => data,
        Err(error) if error.is_not_found() => return Ok(None),
        Err(error) => return Err(error),
    };
    serde_json::from_slice(&data)
        .map(Some)
        .map_err(|error| FleetError::invalid_config(path, error.to_string()))
}

/// Overlay stored fields onto computed defaults. Derived fields stay as
/// computed.
pub fn overlay(record: &mut ConfigRecord, stored: &ConfigRecord) {
    for (key, value) in stored.iter() {
        if DERIVED_FIELDS.contains(&key) {
            continue;
        }
        record.set(key, value.clone());
    }
}
