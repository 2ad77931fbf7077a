//! Passphrase-protected secret vault.
//!
//! Secrets live in a JSON map sealed with AES-256-GCM under a key derived
//! from the passphrase with scrypt (`N = 2^15, r = 8, p = 1, keyLen = 32`,
//! 16-byte random salt per vault). Every mutation re-encrypts with a fresh
//! 96-bit IV and rewrites the vault file atomically.
//!
//! Tampering with the ciphertext or the authentication tag fails with one
//! generic `CRYPTO` error; the error never reveals which part failed, and
//! plaintext never appears in messages. `lock()` drops the derived key
//! through a zeroizing wrapper.
//!
//! On-disk record (all binary fields base64):
//! `{cacheVersion, ciphertext, iv, authTag, salt, scryptParams{n,r,p,keyLen}}`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use parking_lot::Mutex;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::error::{Error, ErrorCode, Result};

/// Current on-disk record version.
pub const VAULT_VERSION: u32 = 1;

const SALT_LEN: usize = 16;
const IV_LEN: usize = 12;
const TAG_LEN: usize = 16;
const KEY_LEN: usize = 32;

/// scrypt parameters stored alongside the envelope.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScryptParams {
    /// CPU/memory cost; must be a power of two.
    pub n: u32,
    /// Block size.
    pub r: u32,
    /// Parallelism.
    pub p: u32,
    /// Derived key length in bytes.
    pub key_len: u32,
}

impl Default for ScryptParams {
    fn default() -> Self {
        Self {
            n: 1 << 15,
            r: 8,
            p: 1,
            key_len: KEY_LEN as u32,
        }
    }
}

/// Versioned on-disk vault record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultFile {
    /// Record version.
    pub cache_version: u32,
    /// Base64 AES-256-GCM ciphertext (without the tag).
    pub ciphertext: String,
    /// Base64 96-bit IV.
    pub iv: String,
    /// Base64 128-bit authentication tag.
    pub auth_tag: String,
    /// Base64 scrypt salt.
    pub salt: String,
    /// Key-derivation parameters.
    pub scrypt_params: ScryptParams,
}

fn generic_crypto_error() -> Error {
    Error::new(ErrorCode::Crypto, "vault decryption failed")
}

pub(crate) fn derive_key(
    passphrase: &str,
    salt: &[u8],
    params: &ScryptParams,
) -> Result<Zeroizing<[u8; KEY_LEN]>> {
    if !params.n.is_power_of_two() || params.n < 2 || params.key_len as usize != KEY_LEN {
        return Err(Error::new(ErrorCode::Crypto, "invalid key derivation parameters"));
    }
    let log_n = params.n.trailing_zeros() as u8;
    let scrypt_params =
        scrypt::Params::new(log_n, params.r, params.p, KEY_LEN).map_err(|e| {
            Error::new(ErrorCode::Crypto, "invalid key derivation parameters").with_cause(e)
        })?;
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    scrypt::scrypt(passphrase.as_bytes(), salt, &scrypt_params, &mut *key).map_err(|e| {
        Error::new(ErrorCode::Crypto, "key derivation failed").with_cause(e)
    })?;
    Ok(key)
}

pub(crate) fn seal(
    key: &[u8; KEY_LEN],
    plaintext: &[u8],
) -> Result<(Vec<u8>, [u8; IV_LEN], [u8; TAG_LEN])> {
    let mut iv = [0u8; IV_LEN];
    rand::rngs::OsRng.fill_bytes(&mut iv);

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let mut combined = cipher
        .encrypt(Nonce::from_slice(&iv), plaintext)
        .map_err(|_| Error::new(ErrorCode::Crypto, "vault encryption failed"))?;

    let tag_start = combined.len() - TAG_LEN;
    let mut tag = [0u8; TAG_LEN];
    tag.copy_from_slice(&combined[tag_start..]);
    combined.truncate(tag_start);
    Ok((combined, iv, tag))
}

pub(crate) fn open(
    key: &[u8; KEY_LEN],
    ciphertext: &[u8],
    iv: &[u8],
    tag: &[u8],
) -> Result<Zeroizing<Vec<u8>>> {
    if iv.len() != IV_LEN || tag.len() != TAG_LEN {
        return Err(generic_crypto_error());
    }
    let mut combined = Vec::with_capacity(ciphertext.len() + TAG_LEN);
    combined.extend_from_slice(ciphertext);
    combined.extend_from_slice(tag);

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(iv), combined.as_ref())
        .map(Zeroizing::new)
        .map_err(|_| generic_crypto_error())
}

struct Unlocked {
    key: Zeroizing<[u8; KEY_LEN]>,
    secrets: BTreeMap<String, String>,
    salt: Vec<u8>,
    params: ScryptParams,
}

enum State {
    Locked,
    Unlocked(Unlocked),
}

/// Passphrase-protected secret store bound to one vault file.
pub struct Vault {
    path: PathBuf,
    state: Mutex<State>,
}

impl Vault {
    /// Binds a (locked) vault to a file path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: Mutex::new(State::Locked),
        }
    }

    /// The vault file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the vault file exists on disk.
    pub async fn exists(&self) -> bool {
        tokio::fs::try_exists(&self.path).await.unwrap_or(false)
    }

    /// Creates a fresh, empty vault (new salt, new key) and unlocks it.
    pub async fn initialize(&self, passphrase: &str) -> Result<()> {
        let mut salt = vec![0u8; SALT_LEN];
        rand::rngs::OsRng.fill_bytes(&mut salt);
        let params = ScryptParams::default();
        let key = derive_key(passphrase, &salt, &params)?;

        let unlocked = Unlocked {
            key,
            secrets: BTreeMap::new(),
            salt,
            params,
        };
        self.persist(&unlocked).await?;
        *self.state.lock() = State::Unlocked(unlocked);
        tracing::debug!(target: "ika.secrets", path = %self.path.display(), "vault initialized");
        Ok(())
    }

    /// Decrypts the vault file with the passphrase.
    pub async fn unlock(&self, passphrase: &str) -> Result<()> {
        let raw = tokio::fs::read(&self.path).await.map_err(|e| {
            Error::new(ErrorCode::Crypto, "failed to read vault file").with_cause(e)
        })?;
        let file: VaultFile = serde_json::from_slice(&raw).map_err(|e| {
            Error::new(ErrorCode::Crypto, "vault file is not a valid record").with_cause(e)
        })?;
        if file.cache_version != VAULT_VERSION {
            return Err(Error::new(
                ErrorCode::Crypto,
                format!("unsupported vault version {}", file.cache_version),
            ));
        }

        let salt = decode_field(&file.salt)?;
        let ciphertext = decode_field(&file.ciphertext)?;
        let iv = decode_field(&file.iv)?;
        let tag = decode_field(&file.auth_tag)?;

        let key = derive_key(passphrase, &salt, &file.scrypt_params)?;
        let plaintext = open(&key, &ciphertext, &iv, &tag)?;
        let secrets: BTreeMap<String, String> =
            serde_json::from_slice(&plaintext).map_err(|_| generic_crypto_error())?;

        *self.state.lock() = State::Unlocked(Unlocked {
            key,
            secrets,
            salt,
            params: file.scrypt_params,
        });
        Ok(())
    }

    /// Drops the key material (zeroized) and relocks the vault.
    pub fn lock(&self) {
        *self.state.lock() = State::Locked;
    }

    /// Whether secrets are currently readable.
    pub fn is_unlocked(&self) -> bool {
        matches!(&*self.state.lock(), State::Unlocked(_))
    }

    /// Reads one secret.
    pub fn get(&self, name: &str) -> Result<Option<String>> {
        match &*self.state.lock() {
            State::Unlocked(unlocked) => Ok(unlocked.secrets.get(name).cloned()),
            State::Locked => Err(locked_error()),
        }
    }

    /// Lists secret names.
    pub fn list(&self) -> Result<Vec<String>> {
        match &*self.state.lock() {
            State::Unlocked(unlocked) => Ok(unlocked.secrets.keys().cloned().collect()),
            State::Locked => Err(locked_error()),
        }
    }

    /// Writes one secret and re-encrypts the vault with a fresh IV.
    pub async fn set(&self, name: &str, value: &str) -> Result<()> {
        let snapshot = {
            let mut state = self.state.lock();
            let State::Unlocked(unlocked) = &mut *state else {
                return Err(locked_error());
            };
            unlocked.secrets.insert(name.to_string(), value.to_string());
            snapshot(unlocked)
        };
        self.persist(&snapshot).await
    }

    /// Removes one secret; returns whether it existed.
    pub async fn delete(&self, name: &str) -> Result<bool> {
        let (existed, snapshot) = {
            let mut state = self.state.lock();
            let State::Unlocked(unlocked) = &mut *state else {
                return Err(locked_error());
            };
            let existed = unlocked.secrets.remove(name).is_some();
            (existed, snapshot(unlocked))
        };
        if existed {
            self.persist(&snapshot).await?;
        }
        Ok(existed)
    }

    async fn persist(&self, unlocked: &Unlocked) -> Result<()> {
        let plaintext = serde_json::to_vec(&unlocked.secrets).map_err(|e| {
            Error::new(ErrorCode::Crypto, "failed to encode secrets").with_cause(e)
        })?;
        let (ciphertext, iv, tag) = seal(&unlocked.key, &plaintext)?;

        let file = VaultFile {
            cache_version: VAULT_VERSION,
            ciphertext: STANDARD.encode(ciphertext),
            iv: STANDARD.encode(iv),
            auth_tag: STANDARD.encode(tag),
            salt: STANDARD.encode(&unlocked.salt),
            scrypt_params: unlocked.params,
        };
        let encoded = serde_json::to_vec_pretty(&file).map_err(|e| {
            Error::new(ErrorCode::Crypto, "failed to encode vault file").with_cause(e)
        })?;

        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, &encoded).await.map_err(|e| {
            Error::new(ErrorCode::Crypto, "failed to write vault file").with_cause(e)
        })?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(|e| {
            Error::new(ErrorCode::Crypto, "failed to replace vault file").with_cause(e)
        })?;
        Ok(())
    }
}

fn snapshot(unlocked: &Unlocked) -> Unlocked {
    Unlocked {
        key: unlocked.key.clone(),
        secrets: unlocked.secrets.clone(),
        salt: unlocked.salt.clone(),
        params: unlocked.params,
    }
}

fn locked_error() -> Error {
    Error::new(ErrorCode::Validation, "vault is locked")
}

fn decode_field(value: &str) -> Result<Vec<u8>> {
    STANDARD.decode(value).map_err(|_| generic_crypto_error())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn fast_params() -> ScryptParams {
        // Keep the KDF cheap in tests.
        ScryptParams {
            n: 1 << 4,
            r: 8,
            p: 1,
            key_len: 32,
        }
    }

    #[test]
    fn envelope_round_trips() {
        let key = derive_key("passphrase", &[7u8; 16], &fast_params()).unwrap();
        let (ciphertext, iv, tag) = seal(&key, b"{\"k\":\"v\"}").unwrap();
        let plaintext = open(&key, &ciphertext, &iv, &tag).unwrap();
        assert_eq!(&*plaintext, b"{\"k\":\"v\"}");
    }

    #[test]
    fn tampered_ciphertext_and_tag_fail_identically() {
        let key = derive_key("p", &[1u8; 16], &fast_params()).unwrap();
        let (mut ciphertext, iv, mut tag) = seal(&key, b"{\"k\":\"v\"}").unwrap();

        ciphertext[0] ^= 0x01;
        let err_ct = open(&key, &ciphertext, &iv, &tag).unwrap_err();
        ciphertext[0] ^= 0x01;

        tag[0] ^= 0x01;
        let err_tag = open(&key, &ciphertext, &iv, &tag).unwrap_err();

        assert_eq!(err_ct.code(), ErrorCode::Crypto);
        assert_eq!(err_ct.to_string(), err_tag.to_string());
        assert!(!err_ct.to_string().contains('v'), "plaintext must not leak");
    }

    #[test]
    fn wrong_passphrase_fails_generically() {
        let key = derive_key("right", &[2u8; 16], &fast_params()).unwrap();
        let (ciphertext, iv, tag) = seal(&key, b"{}").unwrap();
        let wrong = derive_key("wrong", &[2u8; 16], &fast_params()).unwrap();
        let err = open(&wrong, &ciphertext, &iv, &tag).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Crypto);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn any_secret_map_round_trips(
            passphrase in "[ -~]{1,16}",
            name in "[a-z_]{1,12}",
            value in "[ -~]{0,32}",
        ) {
            let mut secrets = BTreeMap::new();
            secrets.insert(name, value);
            let plaintext = serde_json::to_vec(&secrets).unwrap();

            let key = derive_key(&passphrase, &[9u8; 16], &fast_params()).unwrap();
            let (ciphertext, iv, tag) = seal(&key, &plaintext).unwrap();
            let opened = open(&key, &ciphertext, &iv, &tag).unwrap();
            let decoded: BTreeMap<String, String> = serde_json::from_slice(&opened).unwrap();
            prop_assert_eq!(decoded, secrets);
        }
    }

    #[tokio::test]
    async fn vault_file_survives_lock_and_unlock() {
        let dir = tempfile::tempdir().unwrap();
        let vault = Vault::new(dir.path().join("secrets.vault"));
        vault.initialize("hunter2").await.unwrap();
        vault.set("api_key", "s3cr3t").await.unwrap();
        vault.lock();
        assert!(!vault.is_unlocked());
        assert!(vault.get("api_key").is_err());

        vault.unlock("hunter2").await.unwrap();
        assert_eq!(vault.get("api_key").unwrap().as_deref(), Some("s3cr3t"));
        assert_eq!(vault.list().unwrap(), vec!["api_key".to_string()]);

        assert!(vault.delete("api_key").await.unwrap());
        assert!(!vault.delete("api_key").await.unwrap());
    }

    #[tokio::test]
    async fn flipping_one_stored_byte_breaks_unlock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secrets.vault");
        let vault = Vault::new(&path);
        vault.initialize("hunter2").await.unwrap();
        vault.set("k", "v").await.unwrap();
        vault.lock();

        let raw = tokio::fs::read(&path).await.unwrap();
        let mut file: VaultFile = serde_json::from_slice(&raw).unwrap();
        let mut ciphertext = STANDARD.decode(&file.ciphertext).unwrap();
        ciphertext[0] ^= 0xFF;
        file.ciphertext = STANDARD.encode(ciphertext);
        tokio::fs::write(&path, serde_json::to_vec(&file).unwrap())
            .await
            .unwrap();

        let err = vault.unlock("hunter2").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Crypto);
        assert_eq!(err.to_string(), "CRYPTO: vault decryption failed");
    }

    #[tokio::test]
    async fn wrong_vault_passphrase_is_generic() {
        let dir = tempfile::tempdir().unwrap();
        let vault = Vault::new(dir.path().join("secrets.vault"));
        vault.initialize("right").await.unwrap();
        vault.lock();
        let err = vault.unlock("wrong").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Crypto);
    }
}
