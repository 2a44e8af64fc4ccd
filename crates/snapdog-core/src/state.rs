//! Authoritative per-zone and per-client state.
//!
//! Each struct is owned and mutated by exactly one engine task; read paths
//! receive cloned snapshots.  The mutators preserve the documented
//! invariants: volume stays within 0..100, position never exceeds a known
//! duration, and a non-stopped zone always carries a current track.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::command::{ClientMac, PlaybackState, Playlist, TrackInfo};

pub const VOLUME_MAX: u8 = 100;
/// Step used by volume up/down commands.
pub const VOLUME_STEP: u8 = 5;

// ── zones ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneState {
    pub zone_index: usize,
    pub name: String,
    pub sink_path: String,
    pub playback: PlaybackState,
    pub current_track: Option<TrackInfo>,
    pub playlist: Option<Playlist>,
    pub position_ms: u64,
    pub duration_ms: Option<u64>,
    pub volume: u8,
    pub muted: bool,
    pub shuffle: bool,
    pub repeat_track: bool,
    pub repeat_playlist: bool,
    /// MACs of the Snapcast clients grouped onto this zone's stream.
    pub members: BTreeSet<ClientMac>,
}

impl ZoneState {
    pub fn new(zone_index: usize, name: &str, sink_path: &str, volume: u8) -> Self {
        Self {
            zone_index,
            name: name.to_string(),
            sink_path: sink_path.to_string(),
            playback: PlaybackState::Stopped,
            current_track: None,
            playlist: None,
            position_ms: 0,
            duration_ms: None,
            volume: volume.min(VOLUME_MAX),
            muted: false,
            shuffle: false,
            repeat_track: false,
            repeat_playlist: false,
            members: BTreeSet::new(),
        }
    }

    pub fn set_volume(&mut self, volume: u8) -> u8 {
        self.volume = volume.min(VOLUME_MAX);
        self.volume
    }

    pub fn step_volume(&mut self, up: bool) -> u8 {
        let v = if up {
            self.volume.saturating_add(VOLUME_STEP)
        } else {
            self.volume.saturating_sub(VOLUME_STEP)
        };
        self.set_volume(v)
    }

    /// Clamp to a known duration and recompute progress on the current track.
    pub fn set_position(&mut self, position_ms: u64) {
        self.position_ms = match self.duration_ms {
            Some(d) => position_ms.min(d),
            None => position_ms,
        };
        let progress = self.progress();
        if let Some(track) = &mut self.current_track {
            track.position_ms = self.position_ms;
            track.progress = progress;
        }
    }

    pub fn set_duration(&mut self, duration_ms: Option<u64>) {
        self.duration_ms = duration_ms;
        if let Some(d) = duration_ms {
            self.position_ms = self.position_ms.min(d);
        }
        if let Some(track) = &mut self.current_track {
            track.duration_ms = duration_ms;
        }
    }

    pub fn progress(&self) -> f32 {
        match self.duration_ms {
            Some(d) if d > 0 => (self.position_ms as f64 / d as f64).clamp(0.0, 1.0) as f32,
            _ => 0.0,
        }
    }

    pub fn start_track(&mut self, track: TrackInfo) {
        self.duration_ms = track.duration_ms;
        self.position_ms = 0;
        self.current_track = Some(track);
        self.playback = PlaybackState::Playing;
    }

    pub fn stop(&mut self) {
        self.playback = PlaybackState::Stopped;
        self.current_track = None;
        self.position_ms = 0;
        self.duration_ms = None;
    }

    pub fn pause(&mut self) {
        if self.playback == PlaybackState::Playing {
            self.playback = PlaybackState::Paused;
        }
    }
}

// ── clients ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientState {
    pub mac: ClientMac,
    pub name: String,
    /// Zone this client is assigned to; the reconciler keeps Snapcast in sync.
    pub zone_index: Option<usize>,
    pub volume: u8,
    pub muted: bool,
    pub latency_ms: i32,
    pub connected: bool,
    pub last_seen: DateTime<Utc>,
}

impl ClientState {
    pub fn new(mac: ClientMac, name: &str) -> Self {
        Self {
            mac,
            name: name.to_string(),
            zone_index: None,
            volume: VOLUME_MAX,
            muted: false,
            latency_ms: 0,
            connected: false,
            last_seen: Utc::now(),
        }
    }

    pub fn set_volume(&mut self, volume: u8) -> u8 {
        self.volume = volume.min(VOLUME_MAX);
        self.volume
    }

    pub fn touch(&mut self) {
        self.last_seen = Utc::now();
    }
}
