//! StationCatalog: the single authoritative station list.
//!
//! Owned by the control context.  Readers get an `Arc` snapshot, so a
//! replacement is atomic from their point of view.  Remote refreshes run on
//! a background task and hand their result back as a [`Discovery`] message;
//! only the owner installs it, persists it and notifies listeners.

use std::sync::Arc;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::directory::{DirectoryClient, DirectoryParser};
use crate::station::StationRecord;
use crate::store::{KeyValueStore, StationStore};

/// Where the active list came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CatalogOrigin {
    Fallback,
    Cached,
    Discovered,
}

/// Emitted to listeners whenever the active list is replaced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogEvent {
    Changed {
        rev: u64,
        origin: CatalogOrigin,
        count: usize,
    },
}

/// Result of one background refresh, tagged with the refresh that produced it.
#[derive(Debug, Clone)]
pub struct Discovery {
    pub generation: u64,
    pub stations: Vec<StationRecord>,
}

pub struct StationCatalog<S> {
    stations: Arc<Vec<StationRecord>>,
    origin: CatalogOrigin,
    /// Bumped on every replacement.
    rev: u64,
    refreshed_at: Option<DateTime<Local>>,
    /// Latest refresh started; results from older ones are ignored.
    refresh_generation: u64,
    store: StationStore<S>,
    fallback: Vec<StationRecord>,
    events: broadcast::Sender<CatalogEvent>,
}

impl<S: KeyValueStore> StationCatalog<S> {
    /// Starts on the fallback list; call [`bootstrap`](Self::bootstrap) to
    /// pick up the cache.
    pub fn new(store: StationStore<S>, fallback: Vec<StationRecord>) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            stations: Arc::new(fallback.clone()),
            origin: CatalogOrigin::Fallback,
            rev: 1,
            refreshed_at: None,
            refresh_generation: 0,
            store,
            fallback,
            events,
        }
    }

    /// Adopt the cached list if there is one, otherwise the fallback list.
    pub fn bootstrap(&mut self) {
        let cached = self.store.load();
        if cached.is_empty() {
            info!("catalog: no cache, using {} fallback stations", self.fallback.len());
            self.stations = Arc::new(self.fallback.clone());
            self.origin = CatalogOrigin::Fallback;
        } else {
            info!("catalog: loaded {} cached stations", cached.len());
            self.stations = Arc::new(cached);
            self.origin = CatalogOrigin::Cached;
        }
        self.rev += 1;
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CatalogEvent> {
        self.events.subscribe()
    }

    pub fn current_list(&self) -> Arc<Vec<StationRecord>> {
        Arc::clone(&self.stations)
    }

    pub fn lookup(&self, id: &str) -> Option<StationRecord> {
        self.stations.iter().find(|s| s.id == id).cloned()
    }

    pub fn origin(&self) -> CatalogOrigin {
        self.origin
    }

    pub fn rev(&self) -> u64 {
        self.rev
    }

    pub fn refreshed_at(&self) -> Option<DateTime<Local>> {
        self.refreshed_at
    }

    pub fn store(&self) -> &StationStore<S> {
        &self.store
    }

    /// Start a new refresh; any refresh started earlier is superseded.
    pub fn begin_refresh(&mut self) -> u64 {
        self.refresh_generation += 1;
        self.refresh_generation
    }

    /// Install a discovered list.  Returns `true` if the catalog changed.
    ///
    /// Empty or superseded discoveries leave the active list untouched.
    pub fn apply_discovery(&mut self, discovery: Discovery) -> bool {
        if discovery.generation != self.refresh_generation {
            debug!(
                "catalog: ignoring superseded refresh {} (latest {})",
                discovery.generation, self.refresh_generation
            );
            return false;
        }
        if discovery.stations.is_empty() {
            info!("catalog: discovery returned no stations, keeping current list");
            return false;
        }

        let stations = discovery.stations;
        if let Err(e) = self.store.save(&stations) {
            warn!("catalog: failed to persist discovered stations: {}", e);
        }

        self.stations = Arc::new(stations);
        self.origin = CatalogOrigin::Discovered;
        self.refreshed_at = Some(Local::now());
        self.rev += 1;
        info!(
            "catalog: installed {} discovered stations (rev {})",
            self.stations.len(),
            self.rev
        );

        // No receivers is fine.
        let _ = self.events.send(CatalogEvent::Changed {
            rev: self.rev,
            origin: self.origin,
            count: self.stations.len(),
        });
        true
    }

    /// Fetch, parse and install in place.  Failures are logged and leave the
    /// catalog as it was.
    ///
    /// Holds `&mut self` across the fetch; a host with a serialized control
    /// loop uses [`spawn_refresh`] and [`apply_discovery`](Self::apply_discovery)
    /// instead.
    pub async fn refresh_from_remote(
        &mut self,
        client: &DirectoryClient,
        parser: &DirectoryParser,
        directory_url: &str,
    ) -> bool {
        let generation = self.begin_refresh();
        match discover_stations(client, parser, directory_url).await {
            Some(stations) => self.apply_discovery(Discovery {
                generation,
                stations,
            }),
            None => false,
        }
    }
}

/// Fetch and resolve the feed, swallowing every failure.
pub async fn discover_stations(
    client: &DirectoryClient,
    parser: &DirectoryParser,
    directory_url: &str,
) -> Option<Vec<StationRecord>> {
    match client.discover(directory_url, parser).await {
        Ok(stations) => Some(stations),
        Err(e) if e.is_timeout() => {
            warn!("catalog: directory fetch timed out: {}", e);
            None
        }
        Err(e) => {
            warn!("catalog: directory refresh failed: {}", e);
            None
        }
    }
}

/// Run a refresh on a background task and deliver a non-empty result to the
/// owning context as an event built by `into_event`.
pub fn spawn_refresh<E, F>(
    client: DirectoryClient,
    parser: DirectoryParser,
    directory_url: String,
    generation: u64,
    tx: mpsc::Sender<E>,
    into_event: F,
) -> tokio::task::JoinHandle<()>
where
    E: Send + 'static,
    F: FnOnce(Discovery) -> E + Send + 'static,
{
    tokio::spawn(async move {
        let Some(stations) = discover_stations(&client, &parser, &directory_url).await else {
            return;
        };
        if stations.is_empty() {
            info!("catalog: directory lists no live mounts");
            return;
        }
        let discovery = Discovery {
            generation,
            stations,
        };
        if tx.send(into_event(discovery)).await.is_err() {
            debug!("catalog: control loop gone, dropping discovery");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::station::fallback_stations;
    use crate::store::{MemoryKeyValueStore, STATIONS_KEY};

    const BASE: &str = "https://h/radio";

    fn discovered() -> Vec<StationRecord> {
        vec![
            StationRecord::new("chill", "Chill", "https://h/radio/chill.mp3"),
            StationRecord::new("news", "News", "https://h/radio/news.mp3"),
        ]
    }

    fn catalog_with(kv: MemoryKeyValueStore) -> StationCatalog<MemoryKeyValueStore> {
        StationCatalog::new(StationStore::new(kv), fallback_stations(BASE))
    }

    #[test]
    fn test_bootstrap_without_cache_uses_fallback() {
        let mut catalog = catalog_with(MemoryKeyValueStore::default());
        catalog.bootstrap();
        assert_eq!(catalog.origin(), CatalogOrigin::Fallback);
        assert_eq!(*catalog.current_list(), fallback_stations(BASE));
    }

    #[test]
    fn test_bootstrap_prefers_cache() {
        let mut store = StationStore::new(MemoryKeyValueStore::default());
        store.save(&discovered()).unwrap();
        let mut catalog = StationCatalog::new(store, fallback_stations(BASE));
        catalog.bootstrap();
        assert_eq!(catalog.origin(), CatalogOrigin::Cached);
        assert_eq!(*catalog.current_list(), discovered());
    }

    #[test]
    fn test_bootstrap_with_corrupt_cache_uses_fallback() {
        let mut kv = MemoryKeyValueStore::default();
        kv.put(STATIONS_KEY, "[[[".to_string()).unwrap();
        let mut catalog = catalog_with(kv);
        catalog.bootstrap();
        assert_eq!(catalog.origin(), CatalogOrigin::Fallback);
    }

    #[test]
    fn test_discovery_replaces_persists_and_notifies() {
        let mut catalog = catalog_with(MemoryKeyValueStore::default());
        catalog.bootstrap();
        let mut rx = catalog.subscribe();
        let before = catalog.rev();

        let generation = catalog.begin_refresh();
        assert!(catalog.apply_discovery(Discovery {
            generation,
            stations: discovered(),
        }));

        assert_eq!(catalog.origin(), CatalogOrigin::Discovered);
        assert_eq!(*catalog.current_list(), discovered());
        assert_eq!(catalog.store().load(), discovered());
        assert!(catalog.refreshed_at().is_some());
        assert_eq!(
            rx.try_recv().unwrap(),
            CatalogEvent::Changed {
                rev: before + 1,
                origin: CatalogOrigin::Discovered,
                count: 2,
            }
        );
    }

    #[test]
    fn test_empty_discovery_leaves_list_unchanged() {
        let mut catalog = catalog_with(MemoryKeyValueStore::default());
        catalog.bootstrap();
        let mut rx = catalog.subscribe();
        let before = catalog.current_list();

        let generation = catalog.begin_refresh();
        assert!(!catalog.apply_discovery(Discovery {
            generation,
            stations: Vec::new(),
        }));

        assert_eq!(catalog.current_list(), before);
        assert_eq!(catalog.origin(), CatalogOrigin::Fallback);
        assert!(catalog.store().load().is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_superseded_discovery_is_ignored() {
        let mut catalog = catalog_with(MemoryKeyValueStore::default());
        catalog.bootstrap();
        let stale = catalog.begin_refresh();
        let _latest = catalog.begin_refresh();

        assert!(!catalog.apply_discovery(Discovery {
            generation: stale,
            stations: discovered(),
        }));
        assert_eq!(catalog.origin(), CatalogOrigin::Fallback);
    }

    #[test]
    fn test_snapshot_is_not_mutated_by_replacement() {
        let mut catalog = catalog_with(MemoryKeyValueStore::default());
        catalog.bootstrap();
        let snapshot = catalog.current_list();

        let generation = catalog.begin_refresh();
        catalog.apply_discovery(Discovery {
            generation,
            stations: discovered(),
        });

        assert_eq!(*snapshot, fallback_stations(BASE));
        assert_eq!(*catalog.current_list(), discovered());
    }

    #[test]
    fn test_lookup() {
        let mut catalog = catalog_with(MemoryKeyValueStore::default());
        catalog.bootstrap();
        assert_eq!(catalog.lookup("jazz").map(|s| s.name), Some("Jazz".to_string()));
        assert!(catalog.lookup("missing").is_none());
    }
}
