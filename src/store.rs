//! Certificate persistence
//!
//! A [`CertStore`] is a key/value store of PEM pairs keyed by identity name:
//! the reserved root name or an intercepted domain. [`FsCertStore`] keeps one
//! `<name>.crt` / `<name>.key` pair per identity in a directory, and
//! [`MemoryCertStore`] keeps everything in process for tests and ephemeral runs.

use crate::error::{Error, Result};
use async_trait::async_trait;
use rand::Rng;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

/// Directory name used under the user's home when no storage path is given
pub const DEFAULT_STORE_DIR: &str = ".vproxy";

/// One issued identity: a certificate and its private key, both PEM encoded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CaEntry {
  /// Store name, either the root name or the domain the leaf was issued for
  pub domain: String,
  /// Certificate in PEM format
  pub cert_pem: String,
  /// Private key in PEM format
  pub key_pem: String,
}

impl CaEntry {
  /// Create a new entry
  pub fn new(
    domain: impl Into<String>,
    cert_pem: impl Into<String>,
    key_pem: impl Into<String>,
  ) -> Self {
    Self {
      domain: domain.into(),
      cert_pem: cert_pem.into(),
      key_pem: key_pem.into(),
    }
  }
}

/// Pluggable persistence for certificate/key pairs.
///
/// Implementations must tolerate concurrent `get`/`save` calls. A `save`
/// must be atomic per name: a concurrent `get`, or a `get` after a crash in
/// the middle of a `save`, sees the previous pair, the new pair, or nothing.
/// Never a mix or a truncated file.
#[async_trait]
pub trait CertStore: std::fmt::Debug + Send + Sync {
  /// Persist `entry` under `entry.domain`, replacing any previous pair
  async fn save(&self, entry: &CaEntry) -> Result<()>;
  /// Look up the pair stored under `name`
  async fn get(&self, name: &str) -> Result<Option<CaEntry>>;
}

/// Filesystem store with two files per name.
#[derive(Debug, Clone)]
pub struct FsCertStore {
  root: PathBuf,
}

impl FsCertStore {
  /// Create a store rooted at `root`. The directory is created on first save.
  pub fn new(root: impl AsRef<Path>) -> Self {
    Self {
      root: root.as_ref().to_path_buf(),
    }
  }

  /// Store rooted at `$HOME/.vproxy`, falling back to the temp directory
  /// when no home directory can be determined.
  pub fn in_home() -> Self {
    Self::new(default_store_path())
  }

  /// Directory this store writes into
  pub fn root(&self) -> &Path {
    &self.root
  }

  fn paths(&self, name: &str) -> Result<(PathBuf, PathBuf)> {
    if name.is_empty()
      || name.starts_with('.')
      || name.contains(['/', '\\', '\0'])
      || name.contains("..")
    {
      return Err(Error::certificate_error(format!(
        "Invalid certificate store name: {:?}",
        name
      )));
    }
    Ok((
      self.root.join(format!("{}.crt", name)),
      self.root.join(format!("{}.key", name)),
    ))
  }

  /// Write `contents` next to `path` and fsync it, returning the temp path
  async fn stage(&self, path: &Path, contents: &str) -> Result<PathBuf> {
    let suffix: u64 = rand::thread_rng().gen();
    let tmp = path.with_extension(format!("{:016x}.tmp", suffix));
    let written = async {
      let mut file = fs::File::create(&tmp).await?;
      file.write_all(contents.as_bytes()).await?;
      file.sync_all().await
    }
    .await;
    if let Err(e) = written {
      fs::remove_file(&tmp).await.ok();
      return Err(e.into());
    }
    Ok(tmp)
  }

  async fn commit(&self, key_tmp: &Path, key_path: &Path, cert_tmp: &Path, cert_path: &Path) -> Result<()> {
    // Withdraw the old certificate first: a pair interrupted from here on
    // reads as absent instead of as an old certificate with a new key.
    match fs::remove_file(cert_path).await {
      Ok(()) => {}
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
      Err(e) => return Err(e.into()),
    }
    fs::rename(key_tmp, key_path).await?;
    fs::rename(cert_tmp, cert_path).await?;
    Ok(())
  }
}

#[async_trait]
impl CertStore for FsCertStore {
  async fn save(&self, entry: &CaEntry) -> Result<()> {
    let (cert_path, key_path) = self.paths(&entry.domain)?;
    fs::create_dir_all(&self.root).await?;
    let key_tmp = self.stage(&key_path, &entry.key_pem).await?;
    let cert_tmp = match self.stage(&cert_path, &entry.cert_pem).await {
      Ok(tmp) => tmp,
      Err(e) => {
        fs::remove_file(&key_tmp).await.ok();
        return Err(e);
      }
    };
    // The certificate is the presence marker, so it lands last.
    if let Err(e) = self.commit(&key_tmp, &key_path, &cert_tmp, &cert_path).await {
      fs::remove_file(&key_tmp).await.ok();
      fs::remove_file(&cert_tmp).await.ok();
      return Err(e);
    }
    tracing::debug!("Saved certificate pair for {}", entry.domain);
    Ok(())
  }

  async fn get(&self, name: &str) -> Result<Option<CaEntry>> {
    let (cert_path, key_path) = self.paths(name)?;
    let cert_pem = match fs::read_to_string(&cert_path).await {
      Ok(pem) => pem,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
      Err(e) => return Err(e.into()),
    };
    let key_pem = match fs::read_to_string(&key_path).await {
      Ok(pem) => pem,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
      Err(e) => return Err(e.into()),
    };
    Ok(Some(CaEntry::new(name, cert_pem, key_pem)))
  }
}

/// In-process store.
#[derive(Debug, Default)]
pub struct MemoryCertStore {
  entries: RwLock<HashMap<String, CaEntry>>,
}

impl MemoryCertStore {
  /// Create an empty store
  pub fn new() -> Self {
    Self::default()
  }

  /// Number of stored pairs
  pub async fn len(&self) -> usize {
    self.entries.read().await.len()
  }

  /// Whether nothing has been stored yet
  pub async fn is_empty(&self) -> bool {
    self.entries.read().await.is_empty()
  }
}

#[async_trait]
impl CertStore for MemoryCertStore {
  async fn save(&self, entry: &CaEntry) -> Result<()> {
    self
      .entries
      .write()
      .await
      .insert(entry.domain.clone(), entry.clone());
    Ok(())
  }

  async fn get(&self, name: &str) -> Result<Option<CaEntry>> {
    Ok(self.entries.read().await.get(name).cloned())
  }
}

pub(crate) fn default_store_path() -> PathBuf {
  std::env::var_os("HOME")
    .or_else(|| std::env::var_os("USERPROFILE"))
    .map(PathBuf::from)
    .unwrap_or_else(std::env::temp_dir)
    .join(DEFAULT_STORE_DIR)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn temp_store(tag: &str) -> FsCertStore {
    let dir = std::env::temp_dir().join(format!(
      "vproxy-store-{}-{}",
      tag,
      rand::thread_rng().gen::<u32>()
    ));
    FsCertStore::new(dir)
  }

  #[tokio::test]
  async fn test_fs_store_roundtrip() {
    let store = temp_store("roundtrip");
    assert!(store.get("example.com").await.unwrap().is_none());

    let entry = CaEntry::new("example.com", "CERT", "KEY");
    store.save(&entry).await.unwrap();
    assert_eq!(store.get("example.com").await.unwrap(), Some(entry));
    assert!(store.root().join("example.com.crt").exists());
    assert!(store.root().join("example.com.key").exists());

    std::fs::remove_dir_all(store.root()).ok();
  }

  #[tokio::test]
  async fn test_fs_store_leaves_no_temp_files() {
    let store = temp_store("tmp");
    store
      .save(&CaEntry::new("a.example", "one", "one-key"))
      .await
      .unwrap();
    store
      .save(&CaEntry::new("a.example", "two", "two-key"))
      .await
      .unwrap();

    let names: Vec<_> = std::fs::read_dir(store.root())
      .unwrap()
      .filter_map(|e| e.ok())
      .map(|e| e.file_name().to_string_lossy().to_string())
      .collect();
    assert_eq!(names.len(), 2, "unexpected files: {:?}", names);
    let got = store.get("a.example").await.unwrap().unwrap();
    assert_eq!(got.cert_pem, "two");
    assert_eq!(got.key_pem, "two-key");

    std::fs::remove_dir_all(store.root()).ok();
  }

  #[tokio::test]
  async fn test_fs_store_replace_withdraws_old_cert() {
    let store = temp_store("replace");
    store
      .save(&CaEntry::new("r.example", "old", "old-key"))
      .await
      .unwrap();
    let (cert_tmp, key_tmp) = (
      store.stage(&store.root().join("r.example.crt"), "new").await.unwrap(),
      store.stage(&store.root().join("r.example.key"), "new-key").await.unwrap(),
    );
    // state left by a save interrupted between the two renames
    std::fs::remove_file(store.root().join("r.example.crt")).unwrap();
    std::fs::rename(&key_tmp, store.root().join("r.example.key")).unwrap();
    assert!(store.get("r.example").await.unwrap().is_none());
    std::fs::remove_file(&cert_tmp).unwrap();

    store
      .save(&CaEntry::new("r.example", "new", "new-key"))
      .await
      .unwrap();
    let got = store.get("r.example").await.unwrap().unwrap();
    assert_eq!((got.cert_pem.as_str(), got.key_pem.as_str()), ("new", "new-key"));
    std::fs::remove_dir_all(store.root()).ok();
  }

  #[tokio::test]
  async fn test_fs_store_rejects_path_names() {
    let store = temp_store("names");
    assert!(store.get("../etc/passwd").await.is_err());
    assert!(store.save(&CaEntry::new("a/b", "c", "k")).await.is_err());
  }

  #[tokio::test]
  async fn test_memory_store() {
    let store = MemoryCertStore::new();
    assert!(store.is_empty().await);
    store.save(&CaEntry::new("x.test", "c", "k")).await.unwrap();
    assert_eq!(store.len().await, 1);
    assert_eq!(store.get("x.test").await.unwrap().unwrap().key_pem, "k");
    assert!(store.get("y.test").await.unwrap().is_none());
  }
}
