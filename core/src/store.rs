use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Minimal key/value interface over byte keys and values.
pub trait Kv: Clone + Send + Sync + 'static {
    /// Get value bytes for `key`, if present.
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;
    /// Set value bytes for `key`, overwriting if it exists.
    fn put(&self, key: &[u8], val: &[u8]) -> Result<()>;
    /// Delete `key`; returns `true` if a value existed.
    fn delete(&self, key: &[u8]) -> bool;
}

/// Serde helpers layered on top of any [`Kv`] implementation.
pub trait KvSerde: Kv {
    /// Deserialize type `T` stored at `key` using `bincode`.
    fn get_t<T: DeserializeOwned>(&self, key: &[u8]) -> Result<Option<T>> {
        match self.get(key) {
            Some(bytes) => {
                let v = bincode::deserialize::<T>(&bytes)
                    .with_context(|| "bincode deserialize")?;
                Ok(Some(v))
            }
            None => Ok(None),
        }
    }
    /// Serialize `val` with `bincode` and store at `key`.
    fn put_t<T: Serialize>(&self, key: &[u8], val: &T) -> Result<()> {
        let buf = bincode::serialize(val).with_context(|| "bincode serialize")?;
        self.put(key, &buf)
    }
}
impl<T: Kv> KvSerde for T {}

/// Build a namespaced key as bytes: `"{ns}:{key}"`.
pub fn ns(ns: &str, key: &str) -> Vec<u8> {
    format!("{ns}:{key}").into_bytes()
}

/* --------------------- FsKv --------------------- */

/// Filesystem-backed key/value store: one file per key.
#[derive(Clone)]
pub struct FsKv {
    root: PathBuf,
}

/// Open an FS-backed KV rooted at `dir` (created if missing).
pub fn open_fs<P: AsRef<Path>>(dir: P) -> Result<FsKv> {
    let root = dir.as_ref().to_path_buf();
    fs::create_dir_all(&root)
        .with_context(|| format!("create kv dir {}", root.display()))?;
    Ok(FsKv { root })
}

impl FsKv {
    fn path_for(&self, key: &[u8]) -> PathBuf {
        // Hex file names keep arbitrary key bytes portable.
        let mut name = String::with_capacity(key.len() * 2);
        for b in key {
            let _ = write!(name, "{b:02x}");
        }
        self.root.join(name)
    }
}

impl Kv for FsKv {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        fs::read(self.path_for(key)).ok()
    }

    fn put(&self, key: &[u8], val: &[u8]) -> Result<()> {
        let path = self.path_for(key);
        // Write a temp file then rename over the target.
        let tmp = path.with_extension("tmp");
        let mut f = fs::File::create(&tmp)
            .with_context(|| format!("create {}", tmp.display()))?;
        f.write_all(val)?;
        f.sync_all()?;
        fs::rename(&tmp, &path).with_context(|| format!("rename to {}", path.display()))?;
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> bool {
        fs::remove_file(self.path_for(key)).is_ok()
    }
}

/* --------------------- MemKv --------------------- */

/// In-memory key/value store. Clones share the same map.
#[derive(Clone, Default)]
pub struct MemKv {
    map: Arc<Mutex<HashMap<Vec<u8>, Vec<u8>>>>,
}

impl MemKv {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Kv for MemKv {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.map.lock().ok()?.get(key).cloned()
    }

    fn put(&self, key: &[u8], val: &[u8]) -> Result<()> {
        self.map
            .lock()
            .map_err(|_| anyhow::anyhow!("mem kv poisoned"))?
            .insert(key.to_vec(), val.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> bool {
        self.map
            .lock()
            .map(|mut m| m.remove(key).is_some())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fs_kv_round_trips_typed_values() {
        let dir = tempfile::tempdir().unwrap();
        let kv = open_fs(dir.path()).unwrap();
        let key = ns("jobs", "registry");

        assert!(kv.get_t::<Vec<String>>(&key).unwrap().is_none());
        kv.put_t(&key, &vec!["a".to_string(), "b".to_string()]).unwrap();
        let ids: Vec<String> = kv.get_t(&key).unwrap().unwrap();
        assert_eq!(ids, vec!["a", "b"]);

        assert!(kv.delete(&key));
        assert!(!kv.delete(&key));
    }

    #[test]
    fn fs_kv_keys_map_to_hex_names() {
        let dir = tempfile::tempdir().unwrap();
        let kv = open_fs(dir.path()).unwrap();
        kv.put(b"a:b", b"x").unwrap();
        assert!(dir.path().join("613a62").exists());
        assert!(!dir.path().join("613a62.tmp").exists());
    }

    #[test]
    fn mem_kv_clones_share_state() {
        let kv = MemKv::new();
        let other = kv.clone();
        kv.put(b"k", b"v").unwrap();
        assert_eq!(other.get(b"k"), Some(b"v".to_vec()));
        assert!(other.delete(b"k"));
        assert_eq!(kv.get(b"k"), None);
    }
}
