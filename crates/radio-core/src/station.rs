use serde::{Deserialize, Serialize};

/// One playable station as presented to browsers and the playback session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StationRecord {
    /// Stable, URL-safe media identifier (unique within a list).
    pub id: String,
    /// Display name.
    pub name: String,
    /// Absolute stream URL handed to the player.
    pub url: String,
    /// Optional descriptive line shown under the name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtitle: Option<String>,
}

impl StationRecord {
    pub fn new(id: impl Into<String>, name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            url: url.into(),
            subtitle: None,
        }
    }

    pub fn with_subtitle(mut self, subtitle: impl Into<String>) -> Self {
        let subtitle = subtitle.into();
        self.subtitle = if subtitle.trim().is_empty() {
            None
        } else {
            Some(subtitle)
        };
        self
    }

    /// Lowercased name used as the presentation sort key.
    pub fn sort_key(&self) -> String {
        self.name.to_lowercase()
    }
}

/// Stable presentation order: case-insensitive by name, ties keep their
/// incoming order.
pub fn sort_by_name(stations: &mut [StationRecord]) {
    stations.sort_by_cached_key(StationRecord::sort_key);
}

/// Built-in station list used when no cache exists yet.
///
/// The mounts mirror the ones the stream host always carries, so the list is
/// playable offline of the directory feed.
pub fn fallback_stations(stream_base: &str) -> Vec<StationRecord> {
    let base = stream_base.trim_end_matches('/');
    let mounts = [("ambient", "Ambient"), ("jazz", "Jazz"), ("rock", "Rock")];
    let mut stations: Vec<StationRecord> = mounts
        .iter()
        .map(|(id, name)| StationRecord::new(*id, *name, format!("{}/{}.mp3", base, id)))
        .collect();
    sort_by_name(&mut stations);
    stations
}
