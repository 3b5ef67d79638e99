use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::catalog::CatalogOrigin;
use crate::session::SessionSnapshot;
use crate::station::StationRecord;

/// Current protocol version.  Bump this when the wire format changes in a
/// breaking way.  Integration clients check it on connect.
pub const PROTOCOL_VERSION: u32 = 1;

/// The single browsable collection.
pub const ROOT_ID: &str = "ROOT";

/// Messages sent from the car-display integration to the head unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd")]
pub enum Command {
    Browse { parent: String },
    Select { id: String },
    /// Resume the last selected station.
    Play,
    Pause,
    Stop,
    /// Re-run the directory refresh.
    Refresh,
    GetState,
}

/// Messages sent from the head unit to integration clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "broadcast")]
pub enum Broadcast {
    /// Sent immediately on connect.
    Hello {
        protocol_version: u32,
        state: HeadunitState,
    },
    Children {
        parent: String,
        items: Vec<MediaItem>,
    },
    State {
        data: HeadunitState,
    },
    /// The station list changed; clients should browse again.
    CatalogChanged {
        rev: u64,
    },
    /// Playback became audible; show the foreground indicator.
    Active {
        title: String,
    },
    /// Playback stopped; drop the foreground indicator.
    Inactive,
    Log {
        message: String,
    },
}

/// A playable entry of the browse tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaItem {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub subtitle: Option<String>,
    pub playable: bool,
}

impl From<&StationRecord> for MediaItem {
    fn from(station: &StationRecord) -> Self {
        Self {
            id: station.id.clone(),
            title: station.name.clone(),
            subtitle: station.subtitle.clone(),
            playable: true,
        }
    }
}

/// Children of a browse node.  Only the root has any.
pub fn browse_children(parent: &str, stations: &[StationRecord]) -> Vec<MediaItem> {
    if parent != ROOT_ID {
        return Vec::new();
    }
    stations.iter().map(MediaItem::from).collect()
}

/// Full observable state of the head unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeadunitState {
    pub session: SessionSnapshot,
    pub catalog_origin: CatalogOrigin,
    pub station_count: usize,
    /// Incremented every time the station list is replaced.
    pub catalog_rev: u64,
    pub refreshed_at: Option<DateTime<Local>>,
}

/// Wrapper for socket communication
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Command(Command),
    Broadcast(Broadcast),
}

impl Message {
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        let json = serde_json::to_vec(self)?;
        let len = json.len() as u32;
        let mut result = Vec::with_capacity(4 + json.len());
        result.extend_from_slice(&len.to_be_bytes());
        result.extend_from_slice(&json);
        Ok(result)
    }

    pub fn decode(data: &[u8]) -> anyhow::Result<(Self, usize)> {
        if data.len() < 4 {
            anyhow::bail!("Insufficient data for length header");
        }
        let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if data.len() < 4 + len {
            anyhow::bail!("Insufficient data for message");
        }
        let msg: Self = serde_json::from_slice(&data[4..4 + len])?;
        Ok((msg, 4 + len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::LifecycleState;

    fn stations() -> Vec<StationRecord> {
        vec![
            StationRecord::new("ambient", "Ambient", "https://h/radio/ambient.mp3")
                .with_subtitle("Drones"),
            StationRecord::new("jazz", "Jazz", "https://h/radio/jazz.mp3"),
        ]
    }

    #[test]
    fn test_root_lists_catalog() {
        let items = browse_children(ROOT_ID, &stations());
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].id, "ambient");
        assert_eq!(items[0].title, "Ambient");
        assert_eq!(items[0].subtitle.as_deref(), Some("Drones"));
        assert!(items.iter().all(|i| i.playable));
    }

    #[test]
    fn test_other_parents_are_empty() {
        assert!(browse_children("ambient", &stations()).is_empty());
    }

    #[test]
    fn test_select_command_wire_format() {
        let msg = Message::Command(Command::Select { id: "jazz".into() });
        let encoded = msg.encode().unwrap();
        assert_eq!(&encoded[4..], br#"{"cmd":"Select","id":"jazz"}"#);
        let (decoded, len) = Message::decode(&encoded).unwrap();
        assert_eq!(len, encoded.len());
        match decoded {
            Message::Command(Command::Select { id }) => assert_eq!(id, "jazz"),
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_partial_frame_is_rejected() {
        let encoded = Message::Command(Command::Stop).encode().unwrap();
        assert!(Message::decode(&encoded[..encoded.len() - 1]).is_err());
        assert!(Message::decode(&encoded[..2]).is_err());
    }

    #[test]
    fn test_broadcast_wire_names() {
        let frame = |b: Broadcast| Message::Broadcast(b).encode().unwrap()[4..].to_vec();
        assert_eq!(frame(Broadcast::Inactive), br#"{"broadcast":"Inactive"}"#);
        assert_eq!(
            frame(Broadcast::Log { message: "x".into() }),
            br#"{"broadcast":"Log","message":"x"}"#
        );

        let unknown = br#"{"broadcast":"Error","message":"x"}"#;
        let mut framed = (unknown.len() as u32).to_be_bytes().to_vec();
        framed.extend_from_slice(unknown);
        assert!(Message::decode(&framed).is_err());
    }

    #[test]
    fn test_hello_carries_state() {
        let state = HeadunitState {
            session: SessionSnapshot {
                current_station_id: Some("jazz".into()),
                lifecycle: LifecycleState::Stopped,
                ..Default::default()
            },
            catalog_origin: CatalogOrigin::Cached,
            station_count: 2,
            catalog_rev: 7,
            refreshed_at: None,
        };
        let msg = Message::Broadcast(Broadcast::Hello {
            protocol_version: PROTOCOL_VERSION,
            state,
        });
        let encoded = msg.encode().unwrap();
        let (decoded, _) = Message::decode(&encoded).unwrap();
        match decoded {
            Message::Broadcast(Broadcast::Hello {
                protocol_version,
                state,
            }) => {
                assert_eq!(protocol_version, PROTOCOL_VERSION);
                assert_eq!(state.catalog_rev, 7);
                assert_eq!(state.session.current_station_id.as_deref(), Some("jazz"));
            }
            _ => panic!("Wrong message type"),
        }
    }
}
