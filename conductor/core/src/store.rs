//! Persisted Key-Value Store
//!
//! The one piece of shared mutable state in the launcher. Keys are flat
//! dotted strings (`auth.accessToken`, `data.region`), values are JSON.
//!
//! Reads and writes are synchronous against the in-memory map so that a
//! flow always reads its own writes. [`Store::flush`] writes the map to disk
//! asynchronously with a write-then-rename.
//!
//! # Change notification
//!
//! Every `set`/`delete` that changes a value is announced on a
//! [`NativeEmitter`]. [`Store::on_did_change`] and [`Store::watch`] expose a
//! single key as a [`Signal`] through an [`EventAdapter`].
//!
//! # Corruption
//!
//! A store file that cannot be parsed is renamed to `<file>.corrupt`, the
//! store starts empty, and [`Store::snapshot`] carries an `error` field
//! describing what happened.

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::adapter::{EventAdapter, Handler, NativeEmitter};
use crate::registry::Payload;

/// Well-known keys
pub mod keys {
    /// Account email
    pub const USER_EMAIL: &str = "auth.userEmail";
    /// Bearer token
    pub const ACCESS_TOKEN: &str = "auth.accessToken";
    /// Token used to refresh [`ACCESS_TOKEN`]
    pub const REFRESH_TOKEN: &str = "auth.refreshToken";
    /// Key for the encrypted application config
    pub const CONFIG_TOKEN: &str = "auth.configToken";
    /// Every credential key
    pub const AUTH: [&str; 4] = [USER_EMAIL, ACCESS_TOKEN, REFRESH_TOKEN, CONFIG_TOKEN];
    /// Prefix for settings and feature flags
    pub const DATA_PREFIX: &str = "data.";
}

/// Field of [`Store::snapshot`] carrying a load error
pub const SNAPSHOT_ERROR: &str = "error";

/// Errors from store persistence
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store file exists but could not be read
    #[error("Failed to read store file {path}: {source}")]
    Read {
        /// Store file
        path: PathBuf,
        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// The store file is not a JSON object
    #[error("Store file {path} is corrupt: {reason}")]
    Corrupt {
        /// Store file
        path: PathBuf,
        /// Parser message
        reason: String,
    },

    /// The store could not be written
    #[error("Failed to write store file {path}: {source}")]
    Write {
        /// Store file
        path: PathBuf,
        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// The in-memory map could not be encoded
    #[error("Failed to encode store: {0}")]
    Encode(#[from] serde_json::Error),
}

/// One key changing value
#[derive(Clone, Debug, PartialEq)]
pub struct StoreChange {
    /// Changed key
    pub key: String,
    /// New value, `None` when deleted
    pub value: Option<Value>,
}

/// The persisted credential record
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    /// Account email
    pub user_email: String,
    /// Bearer token
    pub access_token: String,
    /// Refresh token
    pub refresh_token: String,
    /// Config encryption token
    pub config_token: String,
    /// Config token was generated during this session
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_new_config_token: bool,
}

impl Credentials {
    /// Parse credentials out of a payload, requiring every field to be non-empty
    #[must_use]
    pub fn from_payload(payload: &Payload) -> Option<Self> {
        let credentials: Self = serde_json::from_value(payload.clone()).ok()?;
        credentials.is_complete().then_some(credentials)
    }

    /// Serialize as a trigger payload
    #[must_use]
    pub fn to_payload(&self) -> Payload {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// No field is empty
    #[must_use]
    pub fn is_complete(&self) -> bool {
        !(self.user_email.is_empty()
            || self.access_token.is_empty()
            || self.refresh_token.is_empty()
            || self.config_token.is_empty())
    }
}

/// Persisted key-value store
#[derive(Clone)]
pub struct Store {
    path: Option<PathBuf>,
    data: Arc<RwLock<BTreeMap<String, Value>>>,
    changes: NativeEmitter<StoreChange>,
    load_error: Arc<Mutex<Option<String>>>,
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("path", &self.path)
            .field("keys", &self.data.read().len())
            .field("load_error", &*self.load_error.lock())
            .finish()
    }
}

impl Store {
    /// A store that is never written to disk
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            path: None,
            data: Arc::new(RwLock::new(BTreeMap::new())),
            changes: NativeEmitter::new(),
            load_error: Arc::new(Mutex::new(None)),
        }
    }

    /// Load the store at `path`
    ///
    /// A missing file yields an empty store. Unreadable or corrupt files are
    /// recorded in [`Store::load_error`] rather than returned.
    pub async fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut store = Self::in_memory();
        store.path = Some(path.clone());

        match load(&path).await {
            Ok(data) => {
                tracing::info!(path = %path.display(), keys = data.len(), "Store loaded");
                *store.data.write() = data;
            }
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "Store could not be loaded");
                if matches!(e, StoreError::Corrupt { .. }) {
                    quarantine(&path).await;
                }
                *store.load_error.lock() = Some(e.to_string());
            }
        }
        store
    }

    /// File backing this store
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Error encountered while loading, if any
    #[must_use]
    pub fn load_error(&self) -> Option<String> {
        self.load_error.lock().clone()
    }

    /// Value for `key`
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Value> {
        self.data.read().get(key).cloned()
    }

    /// Non-empty string value for `key`
    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<String> {
        self.data
            .read()
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }

    /// Whether `key` holds a value
    #[must_use]
    pub fn has(&self, key: &str) -> bool {
        self.data.read().contains_key(key)
    }

    /// Write `value` under `key`
    pub fn set(&self, key: &str, value: impl Into<Value>) {
        let value = value.into();
        let previous = self.data.write().insert(key.to_string(), value.clone());
        if previous.as_ref() != Some(&value) {
            self.changes.emit(StoreChange {
                key: key.to_string(),
                value: Some(value),
            });
        }
    }

    /// Remove `key`, returning its value
    pub fn delete(&self, key: &str) -> Option<Value> {
        let previous = self.data.write().remove(key);
        if previous.is_some() {
            self.changes.emit(StoreChange {
                key: key.to_string(),
                value: None,
            });
        }
        previous
    }

    /// Store every credential key
    pub fn set_credentials(&self, credentials: &Credentials) {
        self.set(keys::USER_EMAIL, credentials.user_email.as_str());
        self.set(keys::ACCESS_TOKEN, credentials.access_token.as_str());
        self.set(keys::REFRESH_TOKEN, credentials.refresh_token.as_str());
        self.set(keys::CONFIG_TOKEN, credentials.config_token.as_str());
    }

    /// Complete credentials, if all four keys are present
    #[must_use]
    pub fn credentials(&self) -> Option<Credentials> {
        Some(Credentials {
            user_email: self.get_str(keys::USER_EMAIL)?,
            access_token: self.get_str(keys::ACCESS_TOKEN)?,
            refresh_token: self.get_str(keys::REFRESH_TOKEN)?,
            config_token: self.get_str(keys::CONFIG_TOKEN)?,
            is_new_config_token: false,
        })
    }

    /// Remove every credential key
    pub fn clear_auth(&self) {
        for key in keys::AUTH {
            self.delete(key);
        }
    }

    /// Every key plus, when loading failed, an `error` field
    #[must_use]
    pub fn snapshot(&self) -> Payload {
        let mut map: Map<String, Value> = self
            .data
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if let Some(error) = self.load_error() {
            map.insert(SNAPSHOT_ERROR.to_string(), Value::String(error));
        }
        Value::Object(map)
    }

    /// Every change, as a signal
    #[must_use]
    pub fn changes(&self) -> EventAdapter<StoreChange> {
        EventAdapter::from_emitter(&self.changes, |change| change)
    }

    /// Values written to `key` from now on; `null` on delete
    #[must_use]
    pub fn on_did_change(&self, key: &str) -> EventAdapter<Payload> {
        self.key_adapter(key, false)
    }

    /// Like [`Store::on_did_change`], seeded with the current value
    #[must_use]
    pub fn watch(&self, key: &str) -> EventAdapter<Payload> {
        let adapter = self.key_adapter(key, true);
        adapter.signal().emit(self.get(key).unwrap_or(Value::Null));
        adapter
    }

    fn key_adapter(&self, key: &str, replay: bool) -> EventAdapter<Payload> {
        let key = key.to_string();
        let installed: Arc<Mutex<Option<Handler<StoreChange>>>> = Arc::new(Mutex::new(None));

        let on = {
            let emitter = self.changes.clone();
            let installed = Arc::clone(&installed);
            move |handler: Handler<StoreChange>| {
                let filtered: Handler<StoreChange> = Arc::new(move |change: StoreChange| {
                    if change.key == key {
                        handler(change);
                    }
                });
                emitter.on(Arc::clone(&filtered));
                *installed.lock() = Some(filtered);
            }
        };
        let off = {
            let emitter = self.changes.clone();
            move |_handler: Handler<StoreChange>| {
                if let Some(filtered) = installed.lock().take() {
                    emitter.off(&filtered);
                }
            }
        };
        let transform = |change: StoreChange| change.value.unwrap_or(Value::Null);

        if replay {
            EventAdapter::replaying(on, off, transform)
        } else {
            EventAdapter::new(on, off, transform)
        }
    }

    /// Write the store to disk
    ///
    /// In-memory stores flush trivially.
    pub async fn flush(&self) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let encoded = {
            let data = self.data.read();
            serde_json::to_vec_pretty(&*data)?
        };

        let write_err = |source| StoreError::Write {
            path: path.clone(),
            source,
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
        }
        let staging = path.with_extension("json.tmp");
        tokio::fs::write(&staging, encoded).await.map_err(write_err)?;
        tokio::fs::rename(&staging, path).await.map_err(write_err)?;

        tracing::debug!(path = %path.display(), "Store flushed");
        Ok(())
    }
}

async fn load(path: &Path) -> Result<BTreeMap<String, Value>, StoreError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(source) => {
            return Err(StoreError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

async fn quarantine(path: &Path) {
    let aside = path.with_extension("json.corrupt");
    match tokio::fs::rename(path, &aside).await {
        Ok(()) => tracing::warn!(aside = %aside.display(), "Corrupt store moved aside"),
        Err(e) => tracing::error!(error = %e, "Corrupt store could not be moved aside"),
    }
}
