//! Secret storage: backend contract, encrypted vault, OS keychain, and the
//! resolver that picks between them.
//!
//! Two backends implement [`SecretBackend`]: the OS keychain (no passphrase,
//! always unlocked) and the encrypted [`vault`](crate::secrets::vault)
//! (passphrase-gated). [`BackendResolver`] selects one per
//! [`BackendMode`]: `auto` probes the keychain and falls back to the vault
//! with a recorded reason, `keychain` demands keychain availability, `vault`
//! always uses the vault. The decision is memoized until [`reset`].
//!
//! [`reset`]: BackendResolver::reset

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{Error, ErrorCode, Result};
use crate::secrets::vault::Vault;

/// OS keychain backend.
pub mod keychain;

/// Encrypted vault backend.
pub mod vault;

/// Which store a backend represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// OS keychain.
    Keychain,
    /// Encrypted vault file.
    Vault,
}

/// Contract every secret store satisfies.
#[async_trait]
pub trait SecretBackend: Send + Sync {
    /// Which store this is.
    fn kind(&self) -> BackendKind;

    /// Whether the store is usable on this host.
    async fn is_available(&self) -> bool;

    /// Whether the store must be initialized before first use.
    async fn requires_init(&self) -> bool;

    /// One-time setup (vault: create the encrypted file).
    async fn initialize(&self, passphrase: Option<&str>) -> Result<()>;

    /// Makes secrets readable (vault: decrypt with the passphrase).
    async fn unlock(&self, passphrase: Option<&str>) -> Result<()>;

    /// Drops key material and makes secrets unreadable.
    fn lock(&self);

    /// Whether secrets are currently readable.
    fn is_unlocked(&self) -> bool;

    /// Reads one secret.
    async fn get(&self, name: &str) -> Result<Option<String>>;

    /// Writes one secret.
    async fn set(&self, name: &str, value: &str) -> Result<()>;

    /// Removes one secret; returns whether it existed.
    async fn delete(&self, name: &str) -> Result<bool>;

    /// Lists stored secret names.
    async fn list(&self) -> Result<Vec<String>>;
}

/// [`SecretBackend`] over the encrypted [`Vault`].
pub struct VaultBackend {
    vault: Vault,
}

impl VaultBackend {
    /// Binds the backend to a vault file path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            vault: Vault::new(path),
        }
    }
}

fn passphrase_required() -> Error {
    Error::new(ErrorCode::Validation, "the vault backend requires a passphrase")
}

#[async_trait]
impl SecretBackend for VaultBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Vault
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn requires_init(&self) -> bool {
        !self.vault.exists().await
    }

    async fn initialize(&self, passphrase: Option<&str>) -> Result<()> {
        let passphrase = passphrase.ok_or_else(passphrase_required)?;
        self.vault.initialize(passphrase).await
    }

    async fn unlock(&self, passphrase: Option<&str>) -> Result<()> {
        let passphrase = passphrase.ok_or_else(passphrase_required)?;
        self.vault.unlock(passphrase).await
    }

    fn lock(&self) {
        self.vault.lock();
    }

    fn is_unlocked(&self) -> bool {
        self.vault.is_unlocked()
    }

    async fn get(&self, name: &str) -> Result<Option<String>> {
        self.vault.get(name)
    }

    async fn set(&self, name: &str, value: &str) -> Result<()> {
        self.vault.set(name, value).await
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        self.vault.delete(name).await
    }

    async fn list(&self) -> Result<Vec<String>> {
        self.vault.list()
    }
}

/// Backend selection mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendMode {
    /// Prefer the keychain, fall back to the vault.
    Auto,
    /// Require the keychain.
    Keychain,
    /// Always use the vault.
    Vault,
}

/// The resolver's (memoized) decision.
#[derive(Clone)]
pub struct Resolution {
    /// The selected backend.
    pub backend: Arc<dyn SecretBackend>,
    /// Why the fallback was taken, when it was.
    pub fallback_reason: Option<String>,
}

impl std::fmt::Debug for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolution")
            .field("fallback_reason", &self.fallback_reason)
            .finish_non_exhaustive()
    }
}

/// Selects a secret backend per [`BackendMode`].
pub struct BackendResolver {
    mode: BackendMode,
    keychain: Arc<dyn SecretBackend>,
    vault: Arc<dyn SecretBackend>,
    memo: Mutex<Option<Resolution>>,
}

impl BackendResolver {
    /// Creates a resolver over the default backends.
    pub fn new(
        mode: BackendMode,
        service: impl Into<String>,
        vault_path: impl Into<PathBuf>,
    ) -> Self {
        Self::with_backends(
            mode,
            Arc::new(keychain::KeychainBackend::new(service)),
            Arc::new(VaultBackend::new(vault_path)),
        )
    }

    /// Creates a resolver over explicit backends.
    pub fn with_backends(
        mode: BackendMode,
        keychain: Arc<dyn SecretBackend>,
        vault: Arc<dyn SecretBackend>,
    ) -> Self {
        Self {
            mode,
            keychain,
            vault,
            memo: Mutex::new(None),
        }
    }

    /// Resolves (and memoizes) the backend to use.
    pub async fn resolve(&self) -> Result<Resolution> {
        if let Some(resolution) = self.memo.lock().clone() {
            return Ok(resolution);
        }

        let resolution = match self.mode {
            BackendMode::Vault => Resolution {
                backend: self.vault.clone(),
                fallback_reason: None,
            },
            BackendMode::Keychain => {
                if !self.keychain.is_available().await {
                    return Err(Error::new(
                        ErrorCode::KeychainUnavailable,
                        "keychain mode requested but no OS keychain is usable",
                    ));
                }
                Resolution {
                    backend: self.keychain.clone(),
                    fallback_reason: None,
                }
            }
            BackendMode::Auto => {
                if self.keychain.is_available().await {
                    Resolution {
                        backend: self.keychain.clone(),
                        fallback_reason: None,
                    }
                } else {
                    let reason = "OS keychain unavailable, falling back to encrypted vault";
                    tracing::warn!(target: "ika.secrets", "{reason}");
                    Resolution {
                        backend: self.vault.clone(),
                        fallback_reason: Some(reason.to_string()),
                    }
                }
            }
        };

        *self.memo.lock() = Some(resolution.clone());
        Ok(resolution)
    }

    /// Forgets the memoized decision; the next [`resolve`](Self::resolve)
    /// probes again.
    pub fn reset(&self) {
        *self.memo.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    struct FakeBackend {
        kind: BackendKind,
        available: AtomicBool,
        probes: AtomicU32,
    }

    impl FakeBackend {
        fn new(kind: BackendKind, available: bool) -> Self {
            Self {
                kind,
                available: AtomicBool::new(available),
                probes: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl SecretBackend for FakeBackend {
        fn kind(&self) -> BackendKind {
            self.kind
        }
        async fn is_available(&self) -> bool {
            self.probes.fetch_add(1, Ordering::SeqCst);
            self.available.load(Ordering::SeqCst)
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
        async fn get(&self, _name: &str) -> Result<Option<String>> {
            Ok(None)
        }
        async fn set(&self, _name: &str, _value: &str) -> Result<()> {
            Ok(())
        }
        async fn delete(&self, _name: &str) -> Result<bool> {
            Ok(false)
        }
        async fn list(&self) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
    }

    fn resolver(mode: BackendMode, keychain_available: bool) -> (BackendResolver, Arc<FakeBackend>) {
        let keychain = Arc::new(FakeBackend::new(BackendKind::Keychain, keychain_available));
        let vault = Arc::new(FakeBackend::new(BackendKind::Vault, true));
        (
            BackendResolver::with_backends(mode, keychain.clone(), vault),
            keychain,
        )
    }

    #[tokio::test]
    async fn auto_prefers_the_keychain() {
        let (resolver, _keychain) = resolver(BackendMode::Auto, true);
        let resolution = resolver.resolve().await.unwrap();
        assert_eq!(resolution.backend.kind(), BackendKind::Keychain);
        assert!(resolution.fallback_reason.is_none());
    }

    #[tokio::test]
    async fn auto_falls_back_with_a_reason() {
        let (resolver, _keychain) = resolver(BackendMode::Auto, false);
        let resolution = resolver.resolve().await.unwrap();
        assert_eq!(resolution.backend.kind(), BackendKind::Vault);
        assert!(resolution.fallback_reason.is_some());
    }

    #[tokio::test]
    async fn keychain_mode_requires_availability() {
        let (resolver, _keychain) = resolver(BackendMode::Keychain, false);
        let err = resolver.resolve().await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::KeychainUnavailable);
    }

    #[tokio::test]
    async fn vault_mode_ignores_the_keychain() {
        let (resolver, keychain) = resolver(BackendMode::Vault, true);
        let resolution = resolver.resolve().await.unwrap();
        assert_eq!(resolution.backend.kind(), BackendKind::Vault);
        assert_eq!(keychain.probes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn decisions_are_memoized_until_reset() {
        let (resolver, keychain) = resolver(BackendMode::Auto, true);
        resolver.resolve().await.unwrap();
        resolver.resolve().await.unwrap();
        assert_eq!(keychain.probes.load(Ordering::SeqCst), 1);

        resolver.reset();
        resolver.resolve().await.unwrap();
        assert_eq!(keychain.probes.load(Ordering::SeqCst), 2);
    }
}
