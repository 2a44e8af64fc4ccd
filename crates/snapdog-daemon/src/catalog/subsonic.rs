//! Subsonic REST client.
//!
//! Covers exactly what the zones need: list playlists, fetch one playlist
//! with its entries, and construct authenticated stream/cover URLs.  Uses the
//! salted-token auth scheme (`t = md5(password + salt)`); the password never
//! leaves the process.

use std::sync::Arc;
use std::time::Duration;

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use snapdog_core::command::{Playlist, TrackInfo, TrackSource};
use snapdog_core::config::SubsonicConfig;
use snapdog_core::resilience;
use snapdog_core::{Error, Result};

use super::PlaylistSummary;

const API_VERSION: &str = "1.16.1";
const CLIENT_NAME: &str = "snapdog";

pub struct SubsonicClient {
    http: reqwest::Client,
    config: SubsonicConfig,
    cancel: CancellationToken,
}

impl SubsonicClient {
    pub fn new(config: SubsonicConfig, cancel: CancellationToken) -> Result<Arc<Self>> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| Error::transport(format!("http client: {e}")))?;
        Ok(Arc::new(Self {
            http,
            config,
            cancel,
        }))
    }

    /// Query-string auth parameters with a fresh salt.
    fn auth_params(&self) -> Vec<(String, String)> {
        let salt: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(12)
            .map(char::from)
            .collect();
        let token = format!(
            "{:x}",
            md5::compute(format!("{}{}", self.config.password, salt))
        );
        vec![
            ("u".into(), self.config.username.clone()),
            ("t".into(), token),
            ("s".into(), salt),
            ("v".into(), API_VERSION.into()),
            ("c".into(), CLIENT_NAME.into()),
            ("f".into(), "json".into()),
        ]
    }

    fn endpoint(&self, method: &str) -> String {
        format!("{}/rest/{method}", self.config.url.trim_end_matches('/'))
    }

    /// Authenticated URL for a resource the decoder (or a UI) fetches itself.
    fn resource_url(&self, method: &str, id: &str) -> String {
        let mut params = self.auth_params();
        params.push(("id".into(), id.into()));
        let query: Vec<String> = params
            .iter()
            .map(|(k, v)| format!("{k}={}", urlencode(v)))
            .collect();
        format!("{}?{}", self.endpoint(method), query.join("&"))
    }

    async fn call(&self, method: &str, extra: &[(String, String)]) -> Result<SubsonicBody> {
        let operation = self.config.resilience.operation;
        let url = self.endpoint(method);
        resilience::retry("subsonic", &operation, &self.cancel, |attempt| {
            let mut params = self.auth_params();
            params.extend_from_slice(extra);
            let request = self.http.get(&url).query(&params);
            async move {
                debug!("subsonic: {method} attempt {attempt}");
                let response = request
                    .send()
                    .await
                    .map_err(|e| Error::transport(format!("subsonic request: {e}")))?;
                if !response.status().is_success() {
                    return Err(Error::transport(format!(
                        "subsonic returned {}",
                        response.status()
                    )));
                }
                let envelope: SubsonicEnvelope = response
                    .json()
                    .await
                    .map_err(|e| Error::protocol(format!("subsonic body: {e}")))?;
                let body = envelope.response;
                if body.status != "ok" {
                    let reason = body
                        .error
                        .map(|e| e.message)
                        .unwrap_or_else(|| "unknown error".to_string());
                    return Err(Error::protocol(format!("subsonic error: {reason}")));
                }
                Ok(body)
            }
        })
        .await
    }

    pub async fn playlists(&self) -> Result<Vec<PlaylistSummary>> {
        let body = self.call("getPlaylists", &[]).await?;
        let playlists = body
            .playlists
            .map(|p| p.playlist)
            .unwrap_or_default();
        Ok(playlists
            .into_iter()
            .map(|p| PlaylistSummary {
                id: p.id,
                name: p.name,
                track_count: p.song_count.unwrap_or(0),
            })
            .collect())
    }

    pub async fn playlist(&self, id: &str) -> Result<Playlist> {
        let body = self
            .call("getPlaylist", &[("id".to_string(), id.to_string())])
            .await?;
        let playlist = body
            .playlist
            .ok_or_else(|| Error::not_found(format!("subsonic playlist {id}")))?;
        let tracks = playlist
            .entry
            .unwrap_or_default()
            .into_iter()
            .enumerate()
            .map(|(index, song)| self.track_from_song(index, song))
            .collect();
        Ok(Playlist {
            id: playlist.id,
            name: playlist.name,
            tracks,
        })
    }

    fn track_from_song(&self, index: usize, song: Song) -> TrackInfo {
        TrackInfo {
            index,
            title: song.title,
            artist: song.artist.unwrap_or_default(),
            album: song.album,
            duration_ms: song.duration.map(|s| s * 1000),
            position_ms: 0,
            progress: 0.0,
            cover_url: song
                .cover_art
                .as_deref()
                .map(|id| self.resource_url("getCoverArt", id)),
            source: TrackSource::Subsonic,
            url: self.resource_url("stream", &song.id),
        }
    }
}

fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

// ── wire types ────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct SubsonicEnvelope {
    #[serde(rename = "subsonic-response")]
    response: SubsonicBody,
}

#[derive(Debug, Deserialize)]
struct SubsonicBody {
    status: String,
    error: Option<SubsonicError>,
    playlists: Option<Playlists>,
    playlist: Option<PlaylistDetail>,
}

#[derive(Debug, Deserialize)]
struct SubsonicError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct Playlists {
    #[serde(default)]
    playlist: Vec<PlaylistHead>,
}

#[derive(Debug, Deserialize)]
struct PlaylistHead {
    id: String,
    name: String,
    #[serde(rename = "songCount")]
    song_count: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct PlaylistDetail {
    id: String,
    name: String,
    entry: Option<Vec<Song>>,
}

#[derive(Debug, Deserialize)]
struct Song {
    id: String,
    title: String,
    artist: Option<String>,
    album: Option<String>,
    /// Seconds.
    duration: Option<u64>,
    #[serde(rename = "coverArt")]
    cover_art: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use snapdog_core::resilience::ServicePolicies;

    fn client() -> Arc<SubsonicClient> {
        SubsonicClient::new(
            SubsonicConfig {
                enabled: true,
                url: "http://music.local:4533/".into(),
                username: "listener".into(),
                password: "sesame".into(),
                timeout_ms: 1000,
                resilience: ServicePolicies::default(),
            },
            CancellationToken::new(),
        )
        .unwrap()
    }

    #[test]
    fn token_is_salted_md5() {
        let c = client();
        let params = c.auth_params();
        let get = |k: &str| params.iter().find(|(key, _)| key == k).unwrap().1.clone();
        let expected = format!("{:x}", md5::compute(format!("sesame{}", get("s"))));
        assert_eq!(get("t"), expected);
        assert_eq!(get("u"), "listener");
        assert_eq!(get("f"), "json");
        // fresh salt every time
        assert_ne!(get("s"), {
            let again = c.auth_params();
            again.iter().find(|(k, _)| k == "s").unwrap().1.clone()
        });
    }

    #[test]
    fn stream_url_shape() {
        let c = client();
        let url = c.resource_url("stream", "track 42");
        assert!(url.starts_with("http://music.local:4533/rest/stream?"));
        assert!(url.contains("id=track%2042"));
        assert!(url.contains("u=listener"));
        assert!(!url.contains("sesame"), "password must not appear in URLs");
    }

    #[test]
    fn envelope_parsing() {
        let json = r#"{
            "subsonic-response": {
                "status": "ok",
                "playlists": { "playlist": [
                    { "id": "7", "name": "Morning", "songCount": 12 }
                ]}
            }
        }"#;
        let envelope: SubsonicEnvelope = serde_json::from_str(json).unwrap();
        let lists = envelope.response.playlists.unwrap().playlist;
        assert_eq!(lists.len(), 1);
        assert_eq!(lists[0].name, "Morning");
        assert_eq!(lists[0].song_count, Some(12));
    }

    #[test]
    fn error_envelope_parsing() {
        let json = r#"{
            "subsonic-response": {
                "status": "failed",
                "error": { "code": 40, "message": "Wrong username or password" }
            }
        }"#;
        let envelope: SubsonicEnvelope = serde_json::from_str(json).unwrap();
        assert_eq!(envelope.response.status, "failed");
        assert_eq!(
            envelope.response.error.unwrap().message,
            "Wrong username or password"
        );
    }
}
