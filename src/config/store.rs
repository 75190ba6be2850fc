//! Persistent key/value storage.
//!
//! Five logical namespaces (wifi, zone, system, sensors, actuators)
//! with full-replace semantics per namespace. Values are postcard
//! blobs. The ESP build talks to NVS; the host build keeps an in-memory
//! map with the same atomic-per-write behaviour.

#[cfg(target_os = "espidf")]
use log::{info, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::StoreError;

pub const NS_WIFI: &str = "wifi";
pub const NS_ZONE: &str = "zone";
pub const NS_SYSTEM: &str = "system";
pub const NS_SENSORS: &str = "sensors";
pub const NS_ACTUATORS: &str = "actuators";

/// Every namespace stores its full current set under this key.
pub const KEY_SET: &str = "set";

const MAX_BLOB_SIZE: usize = 4000;

/// Persistent key-value storage boundary.
///
/// Writes MUST be atomic — no partial blobs on power loss. NVS commits
/// guarantee this natively; the in-memory backend trivially.
pub trait StoragePort {
    /// Read a value. Returns the number of bytes written to `buf`.
    fn read(&self, namespace: &str, key: &str, buf: &mut [u8]) -> Result<usize, StoreError>;

    /// Write a value atomically.
    fn write(&mut self, namespace: &str, key: &str, data: &[u8]) -> Result<(), StoreError>;

    /// Delete a key. `Ok` even if the key didn't exist.
    fn delete(&mut self, namespace: &str, key: &str) -> Result<(), StoreError>;

    fn exists(&self, namespace: &str, key: &str) -> bool;
}

/// Serialize `value` and full-replace the namespace's set blob.
pub fn save_blob<T: Serialize>(
    store: &mut dyn StoragePort,
    namespace: &str,
    value: &T,
) -> Result<(), StoreError> {
    let bytes = postcard::to_allocvec(value).map_err(|_| StoreError::IoFailed)?;
    if bytes.len() > MAX_BLOB_SIZE {
        return Err(StoreError::Full);
    }
    store.write(namespace, KEY_SET, &bytes)
}

/// Load and decode the namespace's set blob. `NotFound` when the
/// namespace was never written; `Corrupted` when it no longer decodes.
pub fn load_blob<T: DeserializeOwned>(
    store: &dyn StoragePort,
    namespace: &str,
) -> Result<T, StoreError> {
    let mut buf = [0u8; MAX_BLOB_SIZE];
    let len = store.read(namespace, KEY_SET, &mut buf)?;
    postcard::from_bytes(&buf[..len]).map_err(|_| StoreError::Corrupted)
}

// ---------------------------------------------------------------------------
// Host backend
// ---------------------------------------------------------------------------

/// In-memory store for host builds and tests.
#[cfg(not(target_os = "espidf"))]
#[derive(Default)]
pub struct MemStore {
    map: std::collections::HashMap<String, Vec<u8>>,
}

#[cfg(not(target_os = "espidf"))]
impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn composite(namespace: &str, key: &str) -> String {
        format!("{}::{}", namespace, key)
    }
}

#[cfg(not(target_os = "espidf"))]
impl StoragePort for MemStore {
    fn read(&self, namespace: &str, key: &str, buf: &mut [u8]) -> Result<usize, StoreError> {
        match self.map.get(&Self::composite(namespace, key)) {
            Some(data) => {
                let len = data.len().min(buf.len());
                buf[..len].copy_from_slice(&data[..len]);
                Ok(len)
            }
            None => Err(StoreError::NotFound),
        }
    }

    fn write(&mut self, namespace: &str, key: &str, data: &[u8]) -> Result<(), StoreError> {
        self.map
            .insert(Self::composite(namespace, key), data.to_vec());
        Ok(())
    }

    fn delete(&mut self, namespace: &str, key: &str) -> Result<(), StoreError> {
        self.map.remove(&Self::composite(namespace, key));
        Ok(())
    }

    fn exists(&self, namespace: &str, key: &str) -> bool {
        self.map.contains_key(&Self::composite(namespace, key))
    }
}

// ---------------------------------------------------------------------------
// ESP-IDF NVS backend
// ---------------------------------------------------------------------------

/// NVS-backed store. Initialises the flash partition once; on a version
/// mismatch the partition is erased and re-initialised (the node comes
/// up bare rather than failing to boot).
#[cfg(target_os = "espidf")]
pub struct NvsStore {
    _private: (),
}

#[cfg(target_os = "espidf")]
impl NvsStore {
    pub fn new() -> Result<Self, StoreError> {
        use esp_idf_svc::sys::*;
        // SAFETY: called once from the main task before any other NVS
        // access.
        let ret = unsafe { nvs_flash_init() };
        if ret == ESP_ERR_NVS_NO_FREE_PAGES || ret == ESP_ERR_NVS_NEW_VERSION_FOUND {
            warn!("store: erasing and re-initialising NVS partition");
            if unsafe { nvs_flash_erase() } != ESP_OK {
                return Err(StoreError::IoFailed);
            }
            if unsafe { nvs_flash_init() } != ESP_OK {
                return Err(StoreError::IoFailed);
            }
        } else if ret != ESP_OK {
            return Err(StoreError::IoFailed);
        }
        info!("store: NVS initialised");
        Ok(Self { _private: () })
    }

    /// Open a namespace, run `f` with the handle, close.
    fn with_handle<F, T>(namespace: &str, write: bool, f: F) -> Result<T, i32>
    where
        F: FnOnce(esp_idf_svc::sys::nvs_handle_t) -> Result<T, i32>,
    {
        use esp_idf_svc::sys::*;

        let mut ns_buf = [0u8; 16];
        let ns_bytes = namespace.as_bytes();
        let len = ns_bytes.len().min(15);
        ns_buf[..len].copy_from_slice(&ns_bytes[..len]);

        let mut handle: nvs_handle_t = 0;
        let mode = if write {
            nvs_open_mode_t_NVS_READWRITE
        } else {
            nvs_open_mode_t_NVS_READONLY
        };

        let ret = unsafe { nvs_open(ns_buf.as_ptr() as *const _, mode, &mut handle) };
        if ret != ESP_OK {
            return Err(ret);
        }
        let result = f(handle);
        unsafe { nvs_close(handle) };
        result
    }

    fn key_buf(key: &str) -> [u8; 16] {
        let mut buf = [0u8; 16];
        let bytes = key.as_bytes();
        let len = bytes.len().min(15);
        buf[..len].copy_from_slice(&bytes[..len]);
        buf
    }
}

#[cfg(target_os = "espidf")]
impl StoragePort for NvsStore {
    fn read(&self, namespace: &str, key: &str, buf: &mut [u8]) -> Result<usize, StoreError> {
        use esp_idf_svc::sys::*;
        let result = Self::with_handle(namespace, false, |handle| {
            let key = Self::key_buf(key);
            let mut size = buf.len();
            let ret = unsafe {
                nvs_get_blob(
                    handle,
                    key.as_ptr() as *const _,
                    buf.as_mut_ptr() as *mut _,
                    &mut size,
                )
            };
            if ret != ESP_OK {
                return Err(ret);
            }
            Ok(size)
        });
        match result {
            Ok(size) => Ok(size),
            Err(e) if e == ESP_ERR_NVS_NOT_FOUND => Err(StoreError::NotFound),
            Err(_) => Err(StoreError::IoFailed),
        }
    }

    fn write(&mut self, namespace: &str, key: &str, data: &[u8]) -> Result<(), StoreError> {
        use esp_idf_svc::sys::*;
        let result = Self::with_handle(namespace, true, |handle| {
            let key = Self::key_buf(key);
            let ret = unsafe {
                nvs_set_blob(
                    handle,
                    key.as_ptr() as *const _,
                    data.as_ptr() as *const _,
                    data.len(),
                )
            };
            if ret != ESP_OK {
                return Err(ret);
            }
            let ret = unsafe { nvs_commit(handle) };
            if ret != ESP_OK {
                return Err(ret);
            }
            Ok(())
        });
        result.map_err(|e| {
            if e == ESP_ERR_NVS_NOT_ENOUGH_SPACE {
                StoreError::Full
            } else {
                StoreError::IoFailed
            }
        })
    }

    fn delete(&mut self, namespace: &str, key: &str) -> Result<(), StoreError> {
        use esp_idf_svc::sys::*;
        let result = Self::with_handle(namespace, true, |handle| {
            let key = Self::key_buf(key);
            let ret = unsafe { nvs_erase_key(handle, key.as_ptr() as *const _) };
            if ret != ESP_OK && ret != ESP_ERR_NVS_NOT_FOUND {
                return Err(ret);
            }
            let ret = unsafe { nvs_commit(handle) };
            if ret != ESP_OK {
                return Err(ret);
            }
            Ok(())
        });
        result.map_err(|_| StoreError::IoFailed)
    }

    fn exists(&self, namespace: &str, key: &str) -> bool {
        use esp_idf_svc::sys::*;
        Self::with_handle(namespace, false, |handle| {
            let key = Self::key_buf(key);
            let ret =
                unsafe { nvs_find_key(handle, key.as_ptr() as *const _, core::ptr::null_mut()) };
            Ok(ret == ESP_OK)
        })
        .unwrap_or(false)
    }
}
