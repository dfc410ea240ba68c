//! Key sources that live on the node itself.
//!
//! | Signer            | Source                               |
//! |-------------------|--------------------------------------|
//! | `EnvKeySigner`    | `CREDMINT_KEY_<NAME>` hex secret     |
//! | `FileKeySigner`   | `<dir>/<name>.key`, mode 0600        |
//! | `StaticKeySigner` | keys handed over at construction     |

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use tracing::{debug, info};

use super::{KeySigner, RelayerKey, SignerError};

/// Prefix of the environment variables read by [`EnvKeySigner`].
pub const KEY_ENV_PREFIX: &str = "CREDMINT_KEY_";

/// File extension used by [`FileKeySigner`].
pub const KEY_FILE_EXTENSION: &str = "key";

// ---------------------------------------------------------------------------
// EnvKeySigner
// ---------------------------------------------------------------------------

/// Reads hex secrets from `CREDMINT_KEY_<NAME>`, where `<NAME>` is the key
/// name upper-cased with every non-alphanumeric character mapped to `_`.
#[derive(Debug, Default, Clone)]
pub struct EnvKeySigner;

impl EnvKeySigner {
    pub fn new() -> Self {
        Self
    }

    /// Environment variable holding the key called `name`.
    pub fn variable_for(name: &str) -> String {
        let suffix: String = name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("{KEY_ENV_PREFIX}{suffix}")
    }
}

#[async_trait]
impl KeySigner for EnvKeySigner {
    async fn get_signer(&self, key_name: &str) -> Result<RelayerKey, SignerError> {
        let variable = Self::variable_for(key_name);
        let secret = std::env::var(&variable)
            .map_err(|e| SignerError::unavailable(key_name, format!("{variable}: {e}")))?;
        RelayerKey::from_hex(key_name, &secret)
    }
}

// ---------------------------------------------------------------------------
// FileKeySigner
// ---------------------------------------------------------------------------

/// Reads hex secrets from `<dir>/<name>.key`.
#[derive(Debug, Clone)]
pub struct FileKeySigner {
    dir: PathBuf,
}

impl FileKeySigner {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.{KEY_FILE_EXTENSION}"))
    }

    /// Generates a key and writes it to `<dir>/<name>.key` with owner-only
    /// permissions. Refuses to overwrite an existing key file.
    pub fn create_key(&self, name: &str) -> Result<RelayerKey, SignerError> {
        std::fs::create_dir_all(&self.dir).map_err(|e| SignerError::unavailable(name, e))?;
        let path = self.path_for(name);
        let key = RelayerKey::generate(name);

        let mut options = OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options
            .open(&path)
            .map_err(|e| SignerError::unavailable(name, format!("{}: {e}", path.display())))?;
        file.write_all(key.secret_hex().as_bytes())
            .and_then(|_| file.write_all(b"\n"))
            .and_then(|_| file.sync_all())
            .map_err(|e| SignerError::unavailable(name, e))?;

        info!(key_name = name, address = %key.address(), path = %path.display(), "relayer key created");
        Ok(key)
    }
}

#[async_trait]
impl KeySigner for FileKeySigner {
    async fn get_signer(&self, key_name: &str) -> Result<RelayerKey, SignerError> {
        let path = self.path_for(key_name);
        let secret = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| SignerError::unavailable(key_name, format!("{}: {e}", path.display())))?;
        let key = RelayerKey::from_hex(key_name, &secret)?;
        debug!(key_name, path = %path.display(), "key file loaded");
        Ok(key)
    }
}

// ---------------------------------------------------------------------------
// StaticKeySigner
// ---------------------------------------------------------------------------

/// Serves keys held in memory. Availability can be toggled to exercise the
/// relayer's skip path.
#[derive(Debug)]
pub struct StaticKeySigner {
    keys: HashMap<String, RelayerKey>,
    available: AtomicBool,
    fetches: AtomicU64,
}

impl StaticKeySigner {
    pub fn new() -> Self {
        Self {
            keys: HashMap::new(),
            available: AtomicBool::new(true),
            fetches: AtomicU64::new(0),
        }
    }

    pub fn with_key(mut self, key: RelayerKey) -> Self {
        self.keys.insert(key.name().to_string(), key);
        self
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Calls to `get_signer`, successful or not.
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl Default for StaticKeySigner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeySigner for StaticKeySigner {
    async fn get_signer(&self, key_name: &str) -> Result<RelayerKey, SignerError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if !self.available.load(Ordering::SeqCst) {
            return Err(SignerError::unavailable(key_name, "key service offline"));
        }
        self.keys
            .get(key_name)
            .cloned()
            .ok_or_else(|| SignerError::unavailable(key_name, "no such key"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_variable_names() {
        assert_eq!(EnvKeySigner::variable_for("relayer"), "CREDMINT_KEY_RELAYER");
        assert_eq!(EnvKeySigner::variable_for("mint-hot.1"), "CREDMINT_KEY_MINT_HOT_1");
    }

    #[tokio::test]
    async fn env_signer_reads_variable() {
        let key = RelayerKey::generate("env-test-signer");
        std::env::set_var(EnvKeySigner::variable_for("env-test-signer"), key.secret_hex());
        let loaded = EnvKeySigner::new().get_signer("env-test-signer").await.unwrap();
        assert_eq!(loaded.address(), key.address());

        assert!(matches!(
            EnvKeySigner::new().get_signer("env-test-missing").await,
            Err(SignerError::Unavailable { .. })
        ));
    }

    #[tokio::test]
    async fn key_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let signer = FileKeySigner::new(dir.path().join("keys"));
        let created = signer.create_key("relayer").unwrap();

        let loaded = signer.get_signer("relayer").await.unwrap();
        assert_eq!(loaded.address(), created.address());

        // Never overwrites an existing key.
        assert!(signer.create_key("relayer").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn key_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let signer = FileKeySigner::new(dir.path());
        signer.create_key("relayer").unwrap();
        let mode = std::fs::metadata(signer.path_for("relayer"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn missing_key_file_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let signer = FileKeySigner::new(dir.path());
        assert!(matches!(
            signer.get_signer("nope").await,
            Err(SignerError::Unavailable { .. })
        ));
    }

    #[tokio::test]
    async fn corrupt_key_file_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let signer = FileKeySigner::new(dir.path());
        std::fs::write(signer.path_for("bad"), "not hex").unwrap();
        assert!(matches!(
            signer.get_signer("bad").await,
            Err(SignerError::InvalidKey { .. })
        ));
    }
}
