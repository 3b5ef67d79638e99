//! Station directory resolution and single-stream playback session for a
//! head-unit radio.
//!
//! [`catalog::StationCatalog`] owns the station list (fallback, cached or
//! discovered from an Icecast status feed through
//! [`directory::DirectoryParser`]), [`store::StationStore`] persists it, and
//! [`session::PlaybackSession`] drives the black-box player.

pub mod catalog;
pub mod config;
pub mod directory;
pub mod error;
pub mod platform;
pub mod protocol;
pub mod session;
pub mod station;
pub mod store;

pub use catalog::{CatalogEvent, CatalogOrigin, Discovery, StationCatalog};
pub use directory::{DirectoryClient, DirectoryParser};
pub use error::{DirectoryError, PlayerError, StoreError};
pub use session::{
    ActivityIndicator, AudioFocus, FocusLoss, LifecycleState, LoadToken, PlaybackSession, Player,
    PlayerEvent, SessionSnapshot, StationLookup,
};
pub use station::StationRecord;
pub use store::{FileKeyValueStore, KeyValueStore, MemoryKeyValueStore, StationStore};
