//! The typed command/status model mirrored onto MQTT, KNX and HTTP.
//!
//! Every inbound surface parses into a [`Command`] tagged with its
//! [`CommandSource`] and a correlation id; every engine mutation emits a
//! [`StatusEvent`] that the notification queue fans out to all adapters.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── identities ────────────────────────────────────────────────────────────────

static NEXT_CORRELATION_ID: AtomicU64 = AtomicU64::new(1);

/// Correlation id tying a command to the events and errors it produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(u64);

impl CorrelationId {
    pub fn next() -> Self {
        Self(NEXT_CORRELATION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c-{:06}", self.0)
    }
}

/// Normalized Snapcast client MAC (`aa:bb:cc:dd:ee:ff`, lowercase).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientMac(String);

impl ClientMac {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for ClientMac {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', ":");
        let octets: Vec<&str> = normalized.split(':').collect();
        if octets.len() != 6
            || octets
                .iter()
                .any(|o| o.len() != 2 || !o.chars().all(|c| c.is_ascii_hexdigit()))
        {
            return Err(format!("'{s}' is not a MAC address"));
        }
        Ok(Self(normalized))
    }
}

impl fmt::Display for ClientMac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which surface a command entered through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandSource {
    Internal,
    Http,
    Mqtt,
    Knx,
}

// ── commands ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Command {
    // zone transport
    Play { zone: usize, track: Option<usize> },
    Pause { zone: usize },
    Stop { zone: usize },
    Next { zone: usize },
    Prev { zone: usize },
    SeekMs { zone: usize, ms: u64 },
    SeekProgress { zone: usize, progress: f32 },
    // zone audio
    SetVolume { zone: usize, volume: u8 },
    VolumeUp { zone: usize },
    VolumeDown { zone: usize },
    SetMute { zone: usize, muted: bool },
    ToggleMute { zone: usize },
    // zone playlist
    SetShuffle { zone: usize, enabled: bool },
    SetRepeatTrack { zone: usize, enabled: bool },
    SetRepeatPlaylist { zone: usize, enabled: bool },
    SelectPlaylist { zone: usize, id: String },
    // clients
    SetClientVolume { mac: ClientMac, volume: u8 },
    SetClientMute { mac: ClientMac, muted: bool },
    ToggleClientMute { mac: ClientMac },
    SetClientLatency { mac: ClientMac, latency_ms: i32 },
    AssignClientToZone { mac: ClientMac, zone: usize },
    // system
    ReloadCatalogue,
}

/// Routing key of a command.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandTarget {
    Zone(usize),
    Client(ClientMac),
    System,
}

impl Command {
    pub fn target(&self) -> CommandTarget {
        use Command::*;
        match self {
            Play { zone, .. }
            | Pause { zone }
            | Stop { zone }
            | Next { zone }
            | Prev { zone }
            | SeekMs { zone, .. }
            | SeekProgress { zone, .. }
            | SetVolume { zone, .. }
            | VolumeUp { zone }
            | VolumeDown { zone }
            | SetMute { zone, .. }
            | ToggleMute { zone }
            | SetShuffle { zone, .. }
            | SetRepeatTrack { zone, .. }
            | SetRepeatPlaylist { zone, .. }
            | SelectPlaylist { zone, .. } => CommandTarget::Zone(*zone),
            SetClientVolume { mac, .. }
            | SetClientMute { mac, .. }
            | ToggleClientMute { mac }
            | SetClientLatency { mac, .. }
            | AssignClientToZone { mac, .. } => CommandTarget::Client(mac.clone()),
            ReloadCatalogue => CommandTarget::System,
        }
    }
}

/// A command plus its provenance, as it travels through the dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub id: CorrelationId,
    pub source: CommandSource,
    pub command: Command,
}

impl CommandEnvelope {
    pub fn new(source: CommandSource, command: Command) -> Self {
        Self {
            id: CorrelationId::next(),
            source,
            command,
        }
    }
}

// ── playback/track model ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    #[default]
    Stopped,
    Paused,
    Playing,
}

impl fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Paused => write!(f, "paused"),
            Self::Playing => write!(f, "playing"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackSource {
    Radio,
    Subsonic,
    File,
}

impl TrackSource {
    /// Live sources cannot seek and treat pause as stop.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Radio)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackInfo {
    pub index: usize,
    pub title: String,
    pub artist: String,
    pub album: Option<String>,
    pub duration_ms: Option<u64>,
    pub position_ms: u64,
    /// 0..1 of `duration_ms` when known, otherwise 0.
    pub progress: f32,
    pub cover_url: Option<String>,
    pub source: TrackSource,
    pub url: String,
}

impl TrackInfo {
    pub fn radio(index: usize, name: &str, url: &str) -> Self {
        Self {
            index,
            title: name.to_string(),
            artist: String::new(),
            album: None,
            duration_ms: None,
            position_ms: 0,
            progress: 0.0,
            cover_url: None,
            source: TrackSource::Radio,
            url: url.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Playlist {
    pub id: String,
    pub name: String,
    pub tracks: Vec<TrackInfo>,
}

// ── status events ─────────────────────────────────────────────────────────────

/// External integration whose link state is surfaced on the push channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Integration {
    Knx,
    Mqtt,
    Snapcast,
    Subsonic,
}

impl fmt::Display for Integration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Knx => write!(f, "knx"),
            Self::Mqtt => write!(f, "mqtt"),
            Self::Snapcast => write!(f, "snapcast"),
            Self::Subsonic => write!(f, "subsonic"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StatusEvent {
    PlaybackChanged { zone: usize, state: PlaybackState },
    TrackChanged { zone: usize, track: TrackInfo },
    PositionTick {
        zone: usize,
        position_ms: u64,
        duration_ms: Option<u64>,
        progress: f32,
    },
    VolumeChanged { zone: usize, volume: u8 },
    MuteChanged { zone: usize, muted: bool },
    ShuffleChanged { zone: usize, enabled: bool },
    RepeatTrackChanged { zone: usize, enabled: bool },
    RepeatPlaylistChanged { zone: usize, enabled: bool },
    PlaylistChanged { zone: usize, playlist_id: String, name: String },
    ClientVolumeChanged { mac: ClientMac, volume: u8 },
    ClientMuteChanged { mac: ClientMac, muted: bool },
    ClientLatencyChanged { mac: ClientMac, latency_ms: i32 },
    ClientZoneChanged { mac: ClientMac, zone: usize },
    ClientConnected { mac: ClientMac, connected: bool },
    CatalogueReloaded { entries: usize },
    ConnectionStateChanged { integration: Integration, connected: bool },
    Error {
        kind: String,
        detail: String,
        correlation_id: Option<CorrelationId>,
    },
}

impl StatusEvent {
    /// Stable label for logging and topic filtering.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::PlaybackChanged { .. } => "playback_changed",
            Self::TrackChanged { .. } => "track_changed",
            Self::PositionTick { .. } => "position_tick",
            Self::VolumeChanged { .. } => "volume_changed",
            Self::MuteChanged { .. } => "mute_changed",
            Self::ShuffleChanged { .. } => "shuffle_changed",
            Self::RepeatTrackChanged { .. } => "repeat_track_changed",
            Self::RepeatPlaylistChanged { .. } => "repeat_playlist_changed",
            Self::PlaylistChanged { .. } => "playlist_changed",
            Self::ClientVolumeChanged { .. } => "client_volume_changed",
            Self::ClientMuteChanged { .. } => "client_mute_changed",
            Self::ClientLatencyChanged { .. } => "client_latency_changed",
            Self::ClientZoneChanged { .. } => "client_zone_changed",
            Self::ClientConnected { .. } => "client_connected",
            Self::CatalogueReloaded { .. } => "catalogue_reloaded",
            Self::ConnectionStateChanged { .. } => "connection_state_changed",
            Self::Error { .. } => "error",
        }
    }

    /// Zone the event concerns, if any.
    pub fn zone(&self) -> Option<usize> {
        match self {
            Self::PlaybackChanged { zone, .. }
            | Self::TrackChanged { zone, .. }
            | Self::PositionTick { zone, .. }
            | Self::VolumeChanged { zone, .. }
            | Self::MuteChanged { zone, .. }
            | Self::ShuffleChanged { zone, .. }
            | Self::RepeatTrackChanged { zone, .. }
            | Self::RepeatPlaylistChanged { zone, .. }
            | Self::PlaylistChanged { zone, .. }
            | Self::ClientZoneChanged { zone, .. } => Some(*zone),
            _ => None,
        }
    }

    /// True for state-like events a broker should retain; false for edges.
    pub fn is_state_like(&self) -> bool {
        !matches!(
            self,
            Self::PositionTick { .. } | Self::CatalogueReloaded { .. } | Self::Error { .. }
        )
    }
}

/// Queue envelope: an event plus its delivery bookkeeping.
#[derive(Debug, Clone)]
pub struct Notification {
    pub event: StatusEvent,
    pub attempt: u16,
    pub enqueued_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(event: StatusEvent) -> Self {
        Self {
            event,
            attempt: 0,
            enqueued_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_normalization() {
        let mac: ClientMac = "AA-BB-CC-00-11-22".parse().unwrap();
        assert_eq!(mac.as_str(), "aa:bb:cc:00:11:22");
        assert!("not-a-mac".parse::<ClientMac>().is_err());
        assert!("aa:bb:cc:00:11".parse::<ClientMac>().is_err());
        assert!("aa:bb:cc:00:11:2g".parse::<ClientMac>().is_err());
    }

    #[test]
    fn command_targets() {
        let mac: ClientMac = "aa:bb:cc:00:11:22".parse().unwrap();
        assert_eq!(
            Command::SetVolume { zone: 2, volume: 30 }.target(),
            CommandTarget::Zone(2)
        );
        assert_eq!(
            Command::ToggleClientMute { mac: mac.clone() }.target(),
            CommandTarget::Client(mac)
        );
        assert_eq!(Command::ReloadCatalogue.target(), CommandTarget::System);
    }

    #[test]
    fn correlation_ids_are_unique() {
        let a = CorrelationId::next();
        let b = CorrelationId::next();
        assert_ne!(a, b);
    }

    #[test]
    fn command_json_round_trip() {
        let env = CommandEnvelope::new(
            CommandSource::Mqtt,
            Command::Play { zone: 1, track: Some(3) },
        );
        let json = serde_json::to_string(&env).unwrap();
        let back: CommandEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back, env);
    }

    #[test]
    fn retain_classification() {
        assert!(StatusEvent::VolumeChanged { zone: 1, volume: 10 }.is_state_like());
        assert!(!StatusEvent::PositionTick {
            zone: 1,
            position_ms: 0,
            duration_ms: None,
            progress: 0.0
        }
        .is_state_like());
        assert!(!StatusEvent::Error {
            kind: "timeout".into(),
            detail: "x".into(),
            correlation_id: None
        }
        .is_state_like());
    }

    #[test]
    fn live_sources() {
        assert!(TrackSource::Radio.is_live());
        assert!(!TrackSource::Subsonic.is_live());
    }
}
