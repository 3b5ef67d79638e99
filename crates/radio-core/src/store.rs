//! Durable station cache on top of a string key-value store.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::station::StationRecord;

/// Key under which the station list is persisted.
pub const STATIONS_KEY: &str = "stations_json";

/// A durable string key-value store.
pub trait KeyValueStore: Send {
    fn get(&self, key: &str) -> Option<String>;
    fn put(&mut self, key: &str, value: String) -> Result<(), StoreError>;
}

// ── file-backed store ─────────────────────────────────────────────────────────

/// All keys live in one JSON object on disk.  Writes go to a sibling temp
/// file first and are renamed over the original.
#[derive(Debug)]
pub struct FileKeyValueStore {
    path: PathBuf,
    entries: BTreeMap<String, String>,
}

impl FileKeyValueStore {
    /// Open the store; a missing or unreadable file starts empty.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<BTreeMap<String, String>>(&content) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("store: {} is not a valid key-value file: {}", path.display(), e);
                    BTreeMap::new()
                }
            },
            Err(_) => BTreeMap::new(),
        };
        Self { path, entries }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.entries)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl KeyValueStore for FileKeyValueStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.get(key).cloned()
    }

    fn put(&mut self, key: &str, value: String) -> Result<(), StoreError> {
        self.entries.insert(key.to_string(), value);
        self.flush()
    }
}

/// In-memory store for tests and for running without a data directory.
#[derive(Debug, Default, Clone)]
pub struct MemoryKeyValueStore {
    entries: BTreeMap<String, String>,
}

impl KeyValueStore for MemoryKeyValueStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.get(key).cloned()
    }

    fn put(&mut self, key: &str, value: String) -> Result<(), StoreError> {
        self.entries.insert(key.to_string(), value);
        Ok(())
    }
}

// ── station cache ─────────────────────────────────────────────────────────────

/// Persisted shape of one station.  An empty subtitle means none.
#[derive(Debug, Serialize)]
struct CachedStation {
    id: String,
    name: String,
    url: String,
    subtitle: String,
}

impl From<&StationRecord> for CachedStation {
    fn from(station: &StationRecord) -> Self {
        Self {
            id: station.id.clone(),
            name: station.name.clone(),
            url: station.url.clone(),
            subtitle: station.subtitle.clone().unwrap_or_default(),
        }
    }
}

impl CachedStation {
    /// Read one cached member.  Missing, null or non-string fields read as
    /// empty; only a non-object member is rejected.
    fn from_value(item: &Value) -> Option<Self> {
        let obj = item.as_object()?;
        let text = |key: &str| {
            obj.get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        Some(Self {
            id: text("id"),
            name: text("name"),
            url: text("url"),
            subtitle: text("subtitle"),
        })
    }

    fn into_record(self) -> Option<StationRecord> {
        if self.id.trim().is_empty() || self.name.trim().is_empty() || self.url.trim().is_empty()
        {
            return None;
        }
        Some(StationRecord::new(self.id, self.name, self.url).with_subtitle(self.subtitle))
    }
}

pub struct StationStore<S> {
    kv: S,
}

impl<S: KeyValueStore> StationStore<S> {
    pub fn new(kv: S) -> Self {
        Self { kv }
    }

    pub fn save(&mut self, stations: &[StationRecord]) -> Result<(), StoreError> {
        let cached: Vec<CachedStation> = stations.iter().map(CachedStation::from).collect();
        let json = serde_json::to_string(&cached)?;
        self.kv.put(STATIONS_KEY, json)?;
        debug!("store: saved {} stations", stations.len());
        Ok(())
    }

    /// Cached stations, or an empty list when nothing usable is stored.
    pub fn load(&self) -> Vec<StationRecord> {
        let Some(raw) = self.kv.get(STATIONS_KEY) else {
            return Vec::new();
        };
        let items: Vec<Value> = match serde_json::from_str(&raw) {
            Ok(items) => items,
            Err(e) => {
                warn!("store: cached station list is corrupt, ignoring: {}", e);
                return Vec::new();
            }
        };

        let mut seen = HashSet::new();
        items
            .iter()
            .filter_map(CachedStation::from_value)
            .filter_map(CachedStation::into_record)
            .filter(|station| seen.insert(station.id.clone()))
            .collect()
    }

    pub fn kv(&self) -> &S {
        &self.kv
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<StationRecord> {
        vec![
            StationRecord::new("ambient", "Ambient", "https://h/radio/ambient.mp3")
                .with_subtitle("Drones"),
            StationRecord::new("jazz", "Jazz", "https://h/radio/jazz.mp3"),
        ]
    }

    #[test]
    fn test_round_trip() {
        let mut store = StationStore::new(MemoryKeyValueStore::default());
        store.save(&sample()).unwrap();
        assert_eq!(store.load(), sample());
    }

    #[test]
    fn test_invalid_records_are_dropped_on_reload() {
        let mut store = StationStore::new(MemoryKeyValueStore::default());
        let mut stations = sample();
        stations.push(StationRecord::new(" ", "Blank Id", "https://h/radio/x.mp3"));
        stations.push(StationRecord::new("noname", "", "https://h/radio/y.mp3"));
        stations.push(StationRecord::new("nourl", "No Url", ""));
        store.save(&stations).unwrap();
        assert_eq!(store.load(), sample());
    }

    #[test]
    fn test_empty_subtitle_is_persisted_as_empty_string() {
        let mut store = StationStore::new(MemoryKeyValueStore::default());
        store.save(&sample()[1..]).unwrap();
        let raw = store.kv().get(STATIONS_KEY).unwrap();
        assert!(raw.contains(r#""subtitle":"""#));
    }

    #[test]
    fn test_missing_data_loads_empty() {
        let store = StationStore::new(MemoryKeyValueStore::default());
        assert!(store.load().is_empty());
    }

    #[test]
    fn test_corrupt_payload_loads_empty() {
        for payload in ["{not json", "{\"id\":\"a\"}", "42", ""] {
            let mut kv = MemoryKeyValueStore::default();
            kv.put(STATIONS_KEY, payload.to_string()).unwrap();
            let store = StationStore::new(kv);
            assert!(store.load().is_empty(), "payload {:?}", payload);
        }
    }

    #[test]
    fn test_non_object_members_are_skipped() {
        let mut kv = MemoryKeyValueStore::default();
        kv.put(
            STATIONS_KEY,
            r#"[1, {"id":"jazz","name":"Jazz","url":"https://h/radio/jazz.mp3","subtitle":""}]"#
                .to_string(),
        )
        .unwrap();
        let store = StationStore::new(kv);
        assert_eq!(store.load(), sample()[1..].to_vec());
    }

    #[test]
    fn test_null_or_missing_subtitle_loads_without_subtitle() {
        let mut kv = MemoryKeyValueStore::default();
        kv.put(
            STATIONS_KEY,
            r#"[
                {"id":"jazz","name":"Jazz","url":"https://h/radio/jazz.mp3","subtitle":null},
                {"id":"rock","name":"Rock","url":"https://h/radio/rock.mp3"},
                {"id":"news","name":null,"url":"https://h/radio/news.mp3"}
            ]"#
            .to_string(),
        )
        .unwrap();
        let store = StationStore::new(kv);
        let loaded = store.load();
        let ids: Vec<&str> = loaded.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["jazz", "rock"]);
        assert!(loaded.iter().all(|s| s.subtitle.is_none()));
    }

    #[test]
    fn test_file_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prefs.json");

        let mut store = StationStore::new(FileKeyValueStore::open(&path));
        store.save(&sample()).unwrap();

        let reopened = StationStore::new(FileKeyValueStore::open(&path));
        assert_eq!(reopened.load(), sample());
    }

    #[test]
    fn test_file_store_tolerates_garbage_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prefs.json");
        std::fs::write(&path, "garbage").unwrap();

        let store = StationStore::new(FileKeyValueStore::open(&path));
        assert!(store.load().is_empty());
    }
}
