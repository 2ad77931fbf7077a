//! OS keychain backend over the `keyring` crate.
//!
//! Keychain entries are keyed by `(service, name)`. Because some OS stores
//! cannot enumerate credentials, the backend maintains its own registry
//! entry (a JSON array of managed names) under a reserved account, updated on
//! every set/delete. Keychain calls are blocking platform APIs and run on
//! the blocking thread pool.

use std::collections::BTreeSet;

use async_trait::async_trait;
use keyring::Entry;

use crate::error::{Error, ErrorCode, Result};
use crate::secrets::{BackendKind, SecretBackend};

const INDEX_ACCOUNT: &str = "__ika_index__";
const PROBE_ACCOUNT: &str = "__ika_probe__";

/// Keychain-backed secret store.
pub struct KeychainBackend {
    service: String,
}

impl KeychainBackend {
    /// Creates a backend for a keychain service name.
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(String) -> Result<T> + Send + 'static,
    {
        let service = self.service.clone();
        tokio::task::spawn_blocking(move || op(service))
            .await
            .map_err(|e| {
                Error::new(ErrorCode::KeychainUnavailable, "keychain task failed")
                    .with_cause(e)
            })?
    }
}

fn entry(service: &str, account: &str) -> Result<Entry> {
    Entry::new(service, account).map_err(|e| {
        Error::new(ErrorCode::KeychainUnavailable, "cannot open keychain entry").with_cause(e)
    })
}

fn read_index(service: &str) -> Result<BTreeSet<String>> {
    match entry(service, INDEX_ACCOUNT)?.get_password() {
        Ok(raw) => serde_json::from_str(&raw).map_err(|e| {
            Error::new(ErrorCode::KeychainUnavailable, "keychain registry is corrupt")
                .with_cause(e)
        }),
        Err(keyring::Error::NoEntry) => Ok(BTreeSet::new()),
        Err(e) => Err(
            Error::new(ErrorCode::KeychainUnavailable, "cannot read keychain registry")
                .with_cause(e),
        ),
    }
}

fn write_index(service: &str, index: &BTreeSet<String>) -> Result<()> {
    let encoded = serde_json::to_string(index).map_err(|e| {
        Error::new(ErrorCode::KeychainUnavailable, "cannot encode keychain registry")
            .with_cause(e)
    })?;
    entry(service, INDEX_ACCOUNT)?.set_password(&encoded).map_err(|e| {
        Error::new(ErrorCode::KeychainUnavailable, "cannot write keychain registry")
            .with_cause(e)
    })
}

#[async_trait]
impl SecretBackend for KeychainBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Keychain
    }

    async fn is_available(&self) -> bool {
        self.blocking(|service| {
            let probe = match entry(&service, PROBE_ACCOUNT) {
                Ok(probe) => probe,
                Err(_) => return Ok(false),
            };
            // A missing entry still proves the store answered.
            Ok(matches!(
                probe.get_password(),
                Ok(_) | Err(keyring::Error::NoEntry)
            ))
        })
        .await
        .unwrap_or(false)
    }

    async fn requires_init(&self) -> bool {
        false
    }

    async fn initialize(&self, _passphrase: Option<&str>) -> Result<()> {
        Ok(())
    }

    async fn unlock(&self, _passphrase: Option<&str>) -> Result<()> {
        Ok(())
    }

    fn lock(&self) {}

    fn is_unlocked(&self) -> bool {
        true
    }

    async fn get(&self, name: &str) -> Result<Option<String>> {
        let name = name.to_string();
        self.blocking(move |service| match entry(&service, &name)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(
                Error::new(ErrorCode::KeychainUnavailable, "cannot read keychain entry")
                    .with_cause(e),
            ),
        })
        .await
    }

    async fn set(&self, name: &str, value: &str) -> Result<()> {
        let name = name.to_string();
        let value = value.to_string();
        self.blocking(move |service| {
            entry(&service, &name)?.set_password(&value).map_err(|e| {
                Error::new(ErrorCode::KeychainUnavailable, "cannot write keychain entry")
                    .with_cause(e)
            })?;
            let mut index = read_index(&service)?;
            if index.insert(name) {
                write_index(&service, &index)?;
            }
            Ok(())
        })
        .await
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        let name = name.to_string();
        self.blocking(move |service| {
            let existed = match entry(&service, &name)?.delete_credential() {
                Ok(()) => true,
                Err(keyring::Error::NoEntry) => false,
                Err(e) => {
                    return Err(Error::new(
                        ErrorCode::KeychainUnavailable,
                        "cannot delete keychain entry",
                    )
                    .with_cause(e));
                }
            };
            let mut index = read_index(&service)?;
            if index.remove(&name) {
                write_index(&service, &index)?;
            }
            Ok(existed)
        })
        .await
    }

    async fn list(&self) -> Result<Vec<String>> {
        self.blocking(|service| Ok(read_index(&service)?.into_iter().collect()))
            .await
    }
}
