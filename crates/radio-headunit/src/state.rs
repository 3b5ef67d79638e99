use std::sync::Arc;

use radio_core::protocol::{browse_children, HeadunitState, MediaItem};
use radio_core::{CatalogOrigin, SessionSnapshot, StationRecord};
use tokio::sync::RwLock;

/// Last state published by the control loop.
#[derive(Debug, Clone)]
struct Published {
    state: HeadunitState,
    stations: Arc<Vec<StationRecord>>,
}

/// Read-only view of the head unit for the socket and HTTP servers.
///
/// Only the control loop writes; readers get clones and never block it for
/// longer than a copy.
#[derive(Clone)]
pub struct StateView {
    inner: Arc<RwLock<Published>>,
}

impl StateView {
    pub fn new() -> Self {
        let state = HeadunitState {
            session: SessionSnapshot::default(),
            catalog_origin: CatalogOrigin::Fallback,
            station_count: 0,
            catalog_rev: 0,
            refreshed_at: None,
        };
        Self {
            inner: Arc::new(RwLock::new(Published {
                state,
                stations: Arc::new(Vec::new()),
            })),
        }
    }

    /// Replace the published state.  Returns `true` if anything observable
    /// changed.
    pub async fn publish(&self, state: HeadunitState, stations: Arc<Vec<StationRecord>>) -> bool {
        let mut guard = self.inner.write().await;
        let changed = guard.state.session != state.session
            || guard.state.catalog_rev != state.catalog_rev
            || guard.state.catalog_origin != state.catalog_origin;
        guard.state = state;
        guard.stations = stations;
        changed
    }

    pub async fn get_state(&self) -> HeadunitState {
        self.inner.read().await.state.clone()
    }

    pub async fn children(&self, parent: &str) -> Vec<MediaItem> {
        let stations = Arc::clone(&self.inner.read().await.stations);
        browse_children(parent, &stations)
    }
}
