//! Persisted peer address cache.
//!
//! A small JSON file of `{name, address}` pairs learned at runtime, read
//! once at startup and rewritten whenever a peer is learned or renamed.
//! Best effort: every failure is reported to the caller to log, never to
//! abort on. Writes go through a temp file and a rename so a crash never
//! leaves a half-written cache.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};

#[derive(Serialize, Deserialize, Default)]
struct CacheFile {
    peers: Vec<CacheEntry>,
}

#[derive(Serialize, Deserialize)]
struct CacheEntry {
    name: String,
    address: String,
}

pub struct AddressCache {
    path: PathBuf,
    entries: BTreeMap<String, String>,
}

impl AddressCache {
    /// Read the cache, treating a missing or unreadable file as empty.
    /// Parse failures are returned so the caller can log them; the cache
    /// still starts empty and will be rewritten on the next learn.
    pub fn load(path: impl Into<PathBuf>) -> (Self, Option<SyncError>) {
        let path = path.into();
        let mut cache = AddressCache {
            path,
            entries: BTreeMap::new(),
        };
        let raw = match std::fs::read(&cache.path) {
            Ok(raw) => raw,
            Err(_) => return (cache, None),
        };
        match serde_json::from_slice::<CacheFile>(&raw) {
            Ok(file) => {
                for entry in file.peers {
                    cache.entries.insert(entry.name, entry.address);
                }
                (cache, None)
            }
            Err(e) => {
                let err = SyncError::Cache(format!("unreadable cache file: {e}"));
                (cache, Some(err))
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, a)| (n.as_str(), a.as_str()))
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries.get(name).map(String::as_str)
    }

    /// Record a peer's address and rewrite the file.
    pub fn upsert(&mut self, name: &str, address: &str) -> Result<()> {
        let prior = self
            .entries
            .insert(name.to_string(), address.to_string());
        if prior.as_deref() == Some(address) {
            return Ok(());
        }
        self.save()
    }

    /// Drop a name (the old key of a renamed peer) and rewrite the file.
    pub fn remove(&mut self, name: &str) -> Result<()> {
        if self.entries.remove(name).is_none() {
            return Ok(());
        }
        self.save()
    }

    fn save(&self) -> Result<()> {
        let file = CacheFile {
            peers: self
                .entries
                .iter()
                .map(|(name, address)| CacheEntry {
                    name: name.clone(),
                    address: address.clone(),
                })
                .collect(),
        };
        let json = serde_json::to_vec_pretty(&file)?;

        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)
                .map_err(|e| SyncError::Cache(format!("create {}: {e}", dir.display())))?;
        }
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, &json)
            .map_err(|e| SyncError::Cache(format!("write {}: {e}", tmp.display())))?;
        std::fs::rename(&tmp, &self.path)
            .map_err(|e| SyncError::Cache(format!("rename into {}: {e}", self.path.display())))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, err) = AddressCache::load(dir.path().join("p2p-cache.json"));
        assert!(err.is_none());
        assert_eq!(cache.entries().count(), 0);
    }

    #[test]
    fn upsert_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("p2p-cache.json");

        let (mut cache, _) = AddressCache::load(&path);
        cache.upsert("alpha", "10.0.0.5:4000").unwrap();
        cache.upsert("bravo", "[::1]:4001").unwrap();

        let (reloaded, err) = AddressCache::load(&path);
        assert!(err.is_none());
        assert_eq!(reloaded.get("alpha"), Some("10.0.0.5:4000"));
        assert_eq!(reloaded.get("bravo"), Some("[::1]:4001"));
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn schema_matches_the_wire_contract() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p2p-cache.json");
        let (mut cache, _) = AddressCache::load(&path);
        cache.upsert("alpha", "10.0.0.5:4000").unwrap();

        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(raw["peers"][0]["name"], "alpha");
        assert_eq!(raw["peers"][0]["address"], "10.0.0.5:4000");
    }

    #[test]
    fn rename_removes_the_old_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p2p-cache.json");
        let (mut cache, _) = AddressCache::load(&path);
        cache.upsert("alpha", "10.0.0.5:4000").unwrap();
        cache.upsert("bravo", "10.0.0.5:4000").unwrap();
        cache.remove("alpha").unwrap();

        let (reloaded, _) = AddressCache::load(&path);
        assert_eq!(reloaded.get("alpha"), None);
        assert_eq!(reloaded.get("bravo"), Some("10.0.0.5:4000"));
    }

    #[test]
    fn corrupt_file_reports_but_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p2p-cache.json");
        std::fs::write(&path, b"{not json").unwrap();

        let (cache, err) = AddressCache::load(&path);
        assert!(matches!(err, Some(SyncError::Cache(_))));
        assert_eq!(cache.entries().count(), 0);
    }

    #[test]
    fn unchanged_upsert_skips_the_rewrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p2p-cache.json");
        let (mut cache, _) = AddressCache::load(&path);
        cache.upsert("alpha", "10.0.0.5:4000").unwrap();
        let mtime = std::fs::metadata(&path).unwrap().modified().unwrap();

        cache.upsert("alpha", "10.0.0.5:4000").unwrap();
        assert_eq!(
            std::fs::metadata(&path).unwrap().modified().unwrap(),
            mtime
        );
    }
}
