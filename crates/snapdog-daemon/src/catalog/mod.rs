//! Media catalog port: where tracks and playlists come from.
//!
//! Two sources feed the zones: the configured radio station list (always
//! present, playlist id `radio`) and, when enabled, playlists hosted on a
//! Subsonic server (ids prefixed `subsonic:`).

pub mod subsonic;

use std::sync::Arc;

use async_trait::async_trait;

use snapdog_core::command::{Playlist, TrackInfo};
use snapdog_core::config::RadioStationConfig;
use snapdog_core::{Error, Result};

pub const RADIO_PLAYLIST_ID: &str = "radio";
const SUBSONIC_PREFIX: &str = "subsonic:";

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct PlaylistSummary {
    pub id: String,
    pub name: String,
    pub track_count: usize,
}

#[async_trait]
pub trait MediaCatalog: Send + Sync {
    async fn playlists(&self) -> Result<Vec<PlaylistSummary>>;
    async fn playlist(&self, id: &str) -> Result<Playlist>;
}

// ── radio stations ────────────────────────────────────────────────────────────

pub struct RadioCatalog {
    stations: Vec<RadioStationConfig>,
}

impl RadioCatalog {
    pub fn new(stations: Vec<RadioStationConfig>) -> Self {
        Self { stations }
    }

    fn as_playlist(&self) -> Playlist {
        Playlist {
            id: RADIO_PLAYLIST_ID.to_string(),
            name: "Radio".to_string(),
            tracks: self
                .stations
                .iter()
                .enumerate()
                .map(|(i, s)| TrackInfo::radio(i, &s.name, &s.url))
                .collect(),
        }
    }
}

#[async_trait]
impl MediaCatalog for RadioCatalog {
    async fn playlists(&self) -> Result<Vec<PlaylistSummary>> {
        Ok(vec![PlaylistSummary {
            id: RADIO_PLAYLIST_ID.to_string(),
            name: "Radio".to_string(),
            track_count: self.stations.len(),
        }])
    }

    async fn playlist(&self, id: &str) -> Result<Playlist> {
        if id != RADIO_PLAYLIST_ID {
            return Err(Error::not_found(format!("playlist '{id}'")));
        }
        Ok(self.as_playlist())
    }
}

// ── combined view ─────────────────────────────────────────────────────────────

/// Radio plus (optionally) Subsonic, routed by playlist id prefix.
pub struct CombinedCatalog {
    radio: RadioCatalog,
    subsonic: Option<Arc<subsonic::SubsonicClient>>,
}

impl CombinedCatalog {
    pub fn new(
        stations: Vec<RadioStationConfig>,
        subsonic: Option<Arc<subsonic::SubsonicClient>>,
    ) -> Self {
        Self {
            radio: RadioCatalog::new(stations),
            subsonic,
        }
    }
}

#[async_trait]
impl MediaCatalog for CombinedCatalog {
    async fn playlists(&self) -> Result<Vec<PlaylistSummary>> {
        let mut all = self.radio.playlists().await?;
        if let Some(subsonic) = &self.subsonic {
            for summary in subsonic.playlists().await? {
                all.push(PlaylistSummary {
                    id: format!("{SUBSONIC_PREFIX}{}", summary.id),
                    ..summary
                });
            }
        }
        Ok(all)
    }

    async fn playlist(&self, id: &str) -> Result<Playlist> {
        if id == RADIO_PLAYLIST_ID {
            return self.radio.playlist(id).await;
        }
        if let Some(raw) = id.strip_prefix(SUBSONIC_PREFIX) {
            let subsonic = self
                .subsonic
                .as_ref()
                .ok_or_else(|| Error::not_found("subsonic is not enabled"))?;
            let mut playlist = subsonic.playlist(raw).await?;
            playlist.id = id.to_string();
            return Ok(playlist);
        }
        Err(Error::not_found(format!("playlist '{id}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stations() -> Vec<RadioStationConfig> {
        vec![
            RadioStationConfig {
                index: 1,
                name: "FM4".into(),
                url: "http://stream.example/fm4".into(),
            },
            RadioStationConfig {
                index: 2,
                name: "Dublab".into(),
                url: "http://stream.example/dublab".into(),
            },
        ]
    }

    #[tokio::test]
    async fn radio_playlist_from_config() {
        let catalog = RadioCatalog::new(stations());
        let lists = catalog.playlists().await.unwrap();
        assert_eq!(lists.len(), 1);
        assert_eq!(lists[0].track_count, 2);

        let playlist = catalog.playlist(RADIO_PLAYLIST_ID).await.unwrap();
        assert_eq!(playlist.tracks.len(), 2);
        assert_eq!(playlist.tracks[0].title, "FM4");
        assert!(playlist.tracks[0].source.is_live());
        assert!(matches!(
            catalog.playlist("nope").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn combined_without_subsonic() {
        let catalog = CombinedCatalog::new(stations(), None);
        assert_eq!(catalog.playlists().await.unwrap().len(), 1);
        assert!(matches!(
            catalog.playlist("subsonic:77").await,
            Err(Error::NotFound(_))
        ));
    }
}
