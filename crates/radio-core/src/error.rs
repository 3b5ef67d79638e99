//! Error types for the station directory, cache and player seams.

/// Failures while fetching or parsing the remote directory feed.
///
/// None of these ever leave the catalog layer; a failed refresh simply keeps
/// the current list.
#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    /// The document is not JSON at all.
    #[error("malformed directory document: {0}")]
    Malformed(#[from] serde_json::Error),

    /// Transport failure, including connect/read timeouts.
    #[error("directory request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The feed answered with a non-success status.
    #[error("directory returned HTTP {0}")]
    Status(u16),
}

impl DirectoryError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Http(e) if e.is_timeout())
    }
}

/// Failures of the durable key-value store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store encoding error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failures reported synchronously by a player backend.
#[derive(Debug, thiserror::Error)]
pub enum PlayerError {
    /// The backend task or process is gone.
    #[error("player backend unavailable")]
    Unavailable,

    /// The backend refused the command.
    #[error("player rejected command: {0}")]
    Rejected(String),
}
