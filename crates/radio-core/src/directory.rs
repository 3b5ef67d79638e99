//! Icecast status-feed resolution.
//!
//! The feed is the JSON rendition of Icecast's `status-json.xsl`.  Upstream
//! servers are inconsistent: `icestats.source` is an object when a single
//! mount is live and an array otherwise, and `listenurl` carries whatever
//! host the server believes it has (often `0.0.0.0`).  Only the mount path is
//! trusted; the reachable host comes from the configured stream base.
//!
//! Normalisation is per entry: an unusable entry is skipped, and only a
//! document that is not JSON at all fails the whole resolve.

use std::collections::HashSet;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use reqwest::header::ACCEPT;
use serde_json::{Map, Value};
use tracing::{debug, info};
use url::Url;

use crate::error::DirectoryError;
use crate::station::{sort_by_name, StationRecord};

/// Turns a status document into station records under one stream base.
#[derive(Debug, Clone)]
pub struct DirectoryParser {
    stream_base: String,
}

impl DirectoryParser {
    pub fn new(stream_base: impl AsRef<str>) -> Self {
        Self {
            stream_base: stream_base.as_ref().trim_end_matches('/').to_string(),
        }
    }

    /// Stream base with any trailing slash removed.
    pub fn stream_base(&self) -> &str {
        &self.stream_base
    }

    pub fn resolve(&self, raw: &str) -> Result<Vec<StationRecord>, DirectoryError> {
        let root: Value = serde_json::from_str(raw)?;
        let sources = source_entries(&root);

        let mut seen = HashSet::new();
        let mut stations = Vec::with_capacity(sources.len());
        for source in sources {
            let Some(station) = self.station_from_source(source) else {
                continue;
            };
            if !seen.insert(station.id.clone()) {
                debug!("directory: dropping duplicate mount id={}", station.id);
                continue;
            }
            stations.push(station);
        }

        sort_by_name(&mut stations);
        Ok(stations)
    }

    fn station_from_source(&self, source: &Map<String, Value>) -> Option<StationRecord> {
        let name = field_text(source, "server_name");
        if name.is_empty() {
            debug!("directory: skipping source without server_name");
            return None;
        }

        let listen_url = field_text(source, "listenurl");
        let Some(mount) = mount_path(&listen_url) else {
            debug!("directory: skipping '{}', no mount in {:?}", name, listen_url);
            return None;
        };

        let id = station_id(&mount, &name);
        let url = format!("{}{}", self.stream_base, mount);
        let subtitle = field_text(source, "server_description");

        Some(StationRecord::new(id, name, url).with_subtitle(subtitle))
    }
}

/// `icestats.source` as a uniform list of objects.
fn source_entries(root: &Value) -> Vec<&Map<String, Value>> {
    match root.get("icestats").and_then(|stats| stats.get("source")) {
        Some(Value::Array(items)) => items.iter().filter_map(Value::as_object).collect(),
        Some(Value::Object(source)) => vec![source],
        _ => Vec::new(),
    }
}

/// Trimmed text of a scalar field; anything else reads as empty.
fn field_text(source: &Map<String, Value>, key: &str) -> String {
    match source.get(key) {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        _ => String::new(),
    }
}

/// Path component of a listen URL, e.g. `/ambient.mp3`.
pub fn mount_path(listen_url: &str) -> Option<String> {
    let listen_url = listen_url.trim();
    if listen_url.is_empty() {
        return None;
    }
    match Url::parse(listen_url) {
        Ok(parsed) => {
            let path = parsed.path();
            // A bare root is not a mount.
            if path.starts_with('/') && path != "/" {
                Some(path.to_string())
            } else {
                None
            }
        }
        Err(_) => path_after_authority(listen_url),
    }
}

/// Everything from the first `/` after `://` (or from the start when there
/// is no scheme separator).
fn path_after_authority(raw: &str) -> Option<String> {
    let start = raw.find("://").map(|i| i + 3).unwrap_or(0);
    raw[start..].find('/').map(|i| raw[start + i..].to_string())
}

/// Mount path without its leading `/` and everything after the last `.`,
/// or a slug of the server name when that leaves nothing.
fn station_id(mount: &str, server_name: &str) -> String {
    let trimmed = mount.strip_prefix('/').unwrap_or(mount);
    let stem = match trimmed.rfind('.') {
        Some(dot) => &trimmed[..dot],
        None => trimmed,
    };
    if stem.is_empty() {
        slugify(server_name)
    } else {
        stem.to_string()
    }
}

fn slug_separator() -> Option<&'static Regex> {
    static SEPARATOR: OnceLock<Option<Regex>> = OnceLock::new();
    SEPARATOR
        .get_or_init(|| Regex::new("[^a-z0-9]+").ok())
        .as_ref()
}

pub fn slugify(name: &str) -> String {
    let lowered = name.to_lowercase();
    let slug = slug_separator()
        .map(|re| re.replace_all(&lowered, "_").trim_matches('_').to_string())
        .unwrap_or_default();
    if slug.is_empty() {
        "station".to_string()
    } else {
        slug
    }
}

// ── remote fetch ──────────────────────────────────────────────────────────────

/// HTTP client for the directory feed with bounded connect and read time.
#[derive(Debug, Clone)]
pub struct DirectoryClient {
    http: reqwest::Client,
}

impl DirectoryClient {
    pub fn new(connect_timeout: Duration, read_timeout: Duration) -> Result<Self, DirectoryError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("radio-headunit/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(connect_timeout)
            .timeout(connect_timeout + read_timeout)
            .build()?;
        Ok(Self { http })
    }

    pub async fn fetch_document(&self, url: &str) -> Result<String, DirectoryError> {
        let response = self
            .http
            .get(url)
            .header(ACCEPT, "application/json")
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(DirectoryError::Status(response.status().as_u16()));
        }
        Ok(response.text().await?)
    }

    /// Fetch and resolve in one step.  Runs on a background worker.
    pub async fn discover(
        &self,
        url: &str,
        parser: &DirectoryParser,
    ) -> Result<Vec<StationRecord>, DirectoryError> {
        let body = self.fetch_document(url).await?;
        let stations = parser.resolve(&body)?;
        info!("directory: resolved {} stations from {}", stations.len(), url);
        Ok(stations)
    }
}
