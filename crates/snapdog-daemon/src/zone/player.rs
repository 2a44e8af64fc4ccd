//! Per-zone playback engine.
//!
//! One task per zone owns the authoritative [`ZoneState`], the zone's
//! decoder, and its playlist.  Commands arrive serialized over the engine
//! channel; decoder events are folded into the state machine; every mutation
//! publishes status events and a fresh snapshot.
//!
//! State machine: `Stopped → (play) Playing → (pause) Paused | (stop)
//! Stopped`; a decoder failure lands in `Stopped` with an error event.  Live
//! (radio) sources treat pause as stop and refuse seeking.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use snapdog_core::audio::AudioFormat;
use snapdog_core::command::{
    ClientMac, Command, PlaybackState, StatusEvent, TrackInfo,
};
use snapdog_core::config::ZoneConfig;
use snapdog_core::state::ZoneState;
use snapdog_core::{Error, Result};

use crate::catalog::{MediaCatalog, RADIO_PLAYLIST_ID};
use crate::decoder::{DecoderEvent, DecoderMetadata, DecoderState, MediaDecoder, PlayRequest};
use crate::dispatcher::EngineRequest;
use crate::notify::Publisher;

/// How long a freshly started decoder may sit in Opening/Buffering.
const STARTUP_TIMEOUT: Duration = Duration::from_secs(10);
/// Minimum gap between published position ticks.
const POSITION_TICK_INTERVAL: Duration = Duration::from_secs(1);
/// Position-stuck watchdog: check every 5 s, alarm after 3 hits.
const STUCK_CHECK_INTERVAL: Duration = Duration::from_secs(5);
const STUCK_CHECKS_BEFORE_ALARM: u8 = 3;

pub struct ZonePlayerHandles {
    pub commands: mpsc::Sender<EngineRequest>,
    pub members: mpsc::Sender<BTreeSet<ClientMac>>,
    pub snapshot: watch::Receiver<ZoneState>,
    pub task: tokio::task::JoinHandle<()>,
}

pub fn spawn(
    config: ZoneConfig,
    audio: AudioFormat,
    initial_volume: u8,
    decoder: Arc<dyn MediaDecoder>,
    catalog: Arc<dyn MediaCatalog>,
    publisher: Publisher,
    cancel: CancellationToken,
) -> ZonePlayerHandles {
    let state = ZoneState::new(config.index, &config.name, &config.sink, initial_volume);
    let (snapshot_tx, snapshot_rx) = watch::channel(state.clone());
    let (cmd_tx, cmd_rx) = mpsc::channel(16);
    let (members_tx, members_rx) = mpsc::channel(16);

    let player = ZonePlayer {
        state,
        audio,
        decoder,
        catalog,
        publisher,
        snapshot_tx,
        metadata_merged: false,
        last_tick_at: None,
        stuck_checks: 0,
        stuck_alarmed: false,
    };
    let task = tokio::spawn(player.run(cmd_rx, members_rx, cancel));

    ZonePlayerHandles {
        commands: cmd_tx,
        members: members_tx,
        snapshot: snapshot_rx,
        task,
    }
}

struct ZonePlayer {
    state: ZoneState,
    audio: AudioFormat,
    decoder: Arc<dyn MediaDecoder>,
    catalog: Arc<dyn MediaCatalog>,
    publisher: Publisher,
    snapshot_tx: watch::Sender<ZoneState>,
    /// Decoder metadata has been folded into the current track.
    metadata_merged: bool,
    last_tick_at: Option<tokio::time::Instant>,
    stuck_checks: u8,
    stuck_alarmed: bool,
}

impl ZonePlayer {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<EngineRequest>,
        mut members_rx: mpsc::Receiver<BTreeSet<ClientMac>>,
        cancel: CancellationToken,
    ) {
        let zone = self.state.zone_index;
        // load the default playlist so next/prev work before any selection
        match self.catalog.playlist(RADIO_PLAYLIST_ID).await {
            Ok(playlist) if !playlist.tracks.is_empty() => {
                self.state.playlist = Some(playlist);
            }
            Ok(_) => {}
            Err(e) => debug!("zone {zone}: no default playlist: {e}"),
        }
        self.sync_snapshot();
        info!("zone {zone}: engine running");

        let mut decoder_events = self.decoder.events();
        let mut stuck_timer = tokio::time::interval(STUCK_CHECK_INTERVAL);
        stuck_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = self.decoder.stop().await;
                    info!("zone {zone}: engine stopped");
                    return;
                }

                request = cmd_rx.recv() => {
                    let Some(request) = request else {
                        let _ = self.decoder.stop().await;
                        return;
                    };
                    let result = self.handle_command(request.env.command).await;
                    if let Err(e) = &result {
                        debug!("zone {zone}: command failed: {e}");
                    }
                    let _ = request.reply.send(result);
                }

                members = members_rx.recv() => {
                    if let Some(members) = members {
                        if self.state.members != members {
                            self.state.members = members;
                            self.sync_snapshot();
                        }
                    }
                }

                event = decoder_events.recv() => {
                    match event {
                        Ok(event) => self.handle_decoder_event(event).await,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            debug!("zone {zone}: missed {n} decoder events");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            warn!("zone {zone}: decoder event stream closed");
                            return;
                        }
                    }
                }

                _ = stuck_timer.tick() => self.check_position_stuck().await,
            }
        }
    }

    // ── commands ──────────────────────────────────────────────────────────────

    async fn handle_command(&mut self, command: Command) -> Result<()> {
        match command {
            Command::Play { track, .. } => self.play(track).await,
            Command::Pause { .. } => self.pause().await,
            Command::Stop { .. } => self.stop().await,
            Command::Next { .. } => self.skip(1).await,
            Command::Prev { .. } => self.skip(-1).await,
            Command::SeekMs { ms, .. } => self.seek_ms(ms).await,
            Command::SeekProgress { progress, .. } => {
                let duration = self
                    .state
                    .duration_ms
                    .ok_or_else(|| Error::invalid_state("stream length is unknown"))?;
                self.seek_ms((progress.clamp(0.0, 1.0) as f64 * duration as f64) as u64)
                    .await
            }
            Command::SetVolume { volume, .. } => {
                let volume = self.state.set_volume(volume);
                self.emit(StatusEvent::VolumeChanged {
                    zone: self.state.zone_index,
                    volume,
                })
                .await;
                Ok(())
            }
            Command::VolumeUp { .. } | Command::VolumeDown { .. } => {
                let up = matches!(command, Command::VolumeUp { .. });
                let volume = self.state.step_volume(up);
                self.emit(StatusEvent::VolumeChanged {
                    zone: self.state.zone_index,
                    volume,
                })
                .await;
                Ok(())
            }
            Command::SetMute { muted, .. } => {
                self.state.muted = muted;
                self.emit(StatusEvent::MuteChanged {
                    zone: self.state.zone_index,
                    muted,
                })
                .await;
                Ok(())
            }
            Command::ToggleMute { .. } => {
                self.state.muted = !self.state.muted;
                self.emit(StatusEvent::MuteChanged {
                    zone: self.state.zone_index,
                    muted: self.state.muted,
                })
                .await;
                Ok(())
            }
            Command::SetShuffle { enabled, .. } => {
                self.state.shuffle = enabled;
                self.emit(StatusEvent::ShuffleChanged {
                    zone: self.state.zone_index,
                    enabled,
                })
                .await;
                Ok(())
            }
            Command::SetRepeatTrack { enabled, .. } => {
                self.state.repeat_track = enabled;
                self.emit(StatusEvent::RepeatTrackChanged {
                    zone: self.state.zone_index,
                    enabled,
                })
                .await;
                Ok(())
            }
            Command::SetRepeatPlaylist { enabled, .. } => {
                self.state.repeat_playlist = enabled;
                self.emit(StatusEvent::RepeatPlaylistChanged {
                    zone: self.state.zone_index,
                    enabled,
                })
                .await;
                Ok(())
            }
            Command::SelectPlaylist { id, .. } => {
                let playlist = self.catalog.playlist(&id).await?;
                self.emit(StatusEvent::PlaylistChanged {
                    zone: self.state.zone_index,
                    playlist_id: playlist.id.clone(),
                    name: playlist.name.clone(),
                })
                .await;
                self.state.playlist = Some(playlist);
                self.sync_snapshot();
                Ok(())
            }
            other => Err(Error::internal(format!(
                "zone engine received non-zone command {other:?}"
            ))),
        }
    }

    async fn play(&mut self, track_index: Option<usize>) -> Result<()> {
        match track_index {
            Some(index) => {
                let track = self.playlist_track(index)?;
                self.start_track(track).await
            }
            None => {
                // bare play resumes a pause, restarts the current track, or
                // falls back to the top of the playlist
                if self.state.playback == PlaybackState::Paused {
                    return self.resume().await;
                }
                let track = match self.state.current_track.clone() {
                    Some(track) => track,
                    None => self.playlist_track(0)?,
                };
                self.start_track(track).await
            }
        }
    }

    fn playlist_track(&self, index: usize) -> Result<TrackInfo> {
        let playlist = self
            .state
            .playlist
            .as_ref()
            .ok_or_else(|| Error::invalid_state("no playlist selected"))?;
        playlist
            .tracks
            .get(index)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("track {index}")))
    }

    async fn start_track(&mut self, mut track: TrackInfo) -> Result<()> {
        let zone = self.state.zone_index;
        let _ = self.decoder.stop().await;

        // the sink directory must exist before the decoder opens the pipe
        if let Some(parent) = std::path::Path::new(&self.state.sink_path).parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                Error::transport(format!("cannot create sink directory: {e}"))
            })?;
        }

        let sout = self.audio.sout_chain(&self.state.sink_path)?;
        let mut events = self.decoder.events();
        self.decoder
            .play(PlayRequest {
                url: track.url.clone(),
                sout,
                seekable: !track.source.is_live(),
                start_ms: None,
            })
            .await?;

        if let Err(e) = self.await_decoder_start(&mut events).await {
            let _ = self.decoder.stop().await;
            return Err(e);
        }

        track.position_ms = 0;
        track.progress = 0.0;
        info!("zone {zone}: playing '{}'", track.title);
        self.metadata_merged = false;
        self.stuck_checks = 0;
        self.stuck_alarmed = false;
        self.state.start_track(track.clone());
        self.emit(StatusEvent::PlaybackChanged {
            zone,
            state: PlaybackState::Playing,
        })
        .await;
        self.emit(StatusEvent::TrackChanged { zone, track }).await;
        Ok(())
    }

    /// Wait out Opening/Buffering up to [`STARTUP_TIMEOUT`].
    async fn await_decoder_start(
        &self,
        events: &mut broadcast::Receiver<DecoderEvent>,
    ) -> Result<()> {
        let deadline = tokio::time::Instant::now() + STARTUP_TIMEOUT;
        loop {
            let event = tokio::time::timeout_at(deadline, events.recv())
                .await
                .map_err(|_| Error::timeout("decoder startup"))?;
            match event {
                Ok(DecoderEvent::StateChanged(DecoderState::Playing)) => return Ok(()),
                Ok(DecoderEvent::StateChanged(DecoderState::Failed)) => {
                    return Err(Error::transport("decoder failed to open the stream"));
                }
                Ok(DecoderEvent::Error(detail)) => {
                    return Err(Error::transport(detail));
                }
                Ok(_) => {} // Opening, Buffering, early metadata
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(Error::transport("decoder event stream closed"));
                }
            }
        }
    }

    async fn resume(&mut self) -> Result<()> {
        self.decoder.set_paused(false).await?;
        self.state.playback = PlaybackState::Playing;
        self.emit(StatusEvent::PlaybackChanged {
            zone: self.state.zone_index,
            state: PlaybackState::Playing,
        })
        .await;
        Ok(())
    }

    async fn pause(&mut self) -> Result<()> {
        let Some(track) = &self.state.current_track else {
            return Err(Error::invalid_state("nothing is playing"));
        };
        // continuous sources have no resumable position
        if track.source.is_live() {
            return self.stop().await;
        }
        self.decoder.set_paused(true).await?;
        self.state.pause();
        self.emit(StatusEvent::PlaybackChanged {
            zone: self.state.zone_index,
            state: PlaybackState::Paused,
        })
        .await;
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        self.decoder.stop().await?;
        self.state.stop();
        self.emit(StatusEvent::PlaybackChanged {
            zone: self.state.zone_index,
            state: PlaybackState::Stopped,
        })
        .await;
        Ok(())
    }

    /// Next/previous with shuffle and wrap-around.
    async fn skip(&mut self, direction: i64) -> Result<()> {
        let playlist = self
            .state
            .playlist
            .as_ref()
            .ok_or_else(|| Error::invalid_state("no playlist selected"))?;
        let len = playlist.tracks.len();
        if len == 0 {
            return Err(Error::invalid_state("playlist is empty"));
        }
        let current = self
            .state
            .current_track
            .as_ref()
            .map(|t| t.index.min(len - 1))
            .unwrap_or(0);
        let next = if self.state.shuffle && len > 1 {
            // avoid replaying the same track
            let mut pick = rand::thread_rng().gen_range(0..len - 1);
            if pick >= current {
                pick += 1;
            }
            pick
        } else {
            (current as i64 + direction).rem_euclid(len as i64) as usize
        };
        let track = playlist.tracks[next].clone();
        self.start_track(track).await
    }

    async fn seek_ms(&mut self, ms: u64) -> Result<()> {
        let Some(track) = &self.state.current_track else {
            return Err(Error::invalid_state("nothing is playing"));
        };
        if track.source.is_live() {
            return Err(Error::not_seekable());
        }
        self.decoder.seek_ms(ms).await?;
        self.state.set_position(ms);
        self.publish_position_tick(true).await;
        Ok(())
    }

    // ── decoder events ────────────────────────────────────────────────────────

    async fn handle_decoder_event(&mut self, event: DecoderEvent) {
        let zone = self.state.zone_index;
        match event {
            DecoderEvent::StateChanged(DecoderState::Playing) => {
                if self.state.playback == PlaybackState::Paused {
                    self.state.playback = PlaybackState::Playing;
                    self.emit(StatusEvent::PlaybackChanged {
                        zone,
                        state: PlaybackState::Playing,
                    })
                    .await;
                }
            }
            DecoderEvent::StateChanged(DecoderState::Ended) => {
                if self.state.playback != PlaybackState::Stopped {
                    self.advance_after_end().await;
                }
            }
            DecoderEvent::StateChanged(DecoderState::Failed) => {
                if self.state.playback != PlaybackState::Stopped {
                    self.state.stop();
                    self.emit(StatusEvent::PlaybackChanged {
                        zone,
                        state: PlaybackState::Stopped,
                    })
                    .await;
                }
            }
            DecoderEvent::StateChanged(_) => {}
            DecoderEvent::Error(detail) => {
                warn!("zone {zone}: decoder error: {detail}");
                self.emit(StatusEvent::Error {
                    kind: "transport".to_string(),
                    detail,
                    correlation_id: None,
                })
                .await;
            }
            DecoderEvent::PositionMs(ms) => {
                if self.state.playback == PlaybackState::Playing {
                    self.state.set_position(ms);
                    self.publish_position_tick(false).await;
                }
            }
            DecoderEvent::Progress(progress) => {
                if self.state.playback == PlaybackState::Playing {
                    if let Some(duration) = self.state.duration_ms {
                        self.state
                            .set_position((progress as f64 * duration as f64) as u64);
                        self.publish_position_tick(false).await;
                    }
                }
            }
            DecoderEvent::Metadata(metadata) => self.merge_metadata(metadata).await,
        }
    }

    /// Natural end of a track: repeat, advance, wrap, or stop.
    async fn advance_after_end(&mut self) {
        let zone = self.state.zone_index;
        let repeat_track = self.state.repeat_track;
        let current = self.state.current_track.clone();

        let next = if repeat_track {
            current
        } else if let (Some(track), Some(playlist)) = (&current, &self.state.playlist) {
            let len = playlist.tracks.len();
            if self.state.shuffle && len > 1 {
                Some(playlist.tracks[rand::thread_rng().gen_range(0..len)].clone())
            } else if track.index + 1 < len {
                Some(playlist.tracks[track.index + 1].clone())
            } else if self.state.repeat_playlist && len > 0 {
                Some(playlist.tracks[0].clone())
            } else {
                None
            }
        } else {
            None
        };

        match next {
            Some(track) => {
                if let Err(e) = self.start_track(track).await {
                    warn!("zone {zone}: could not advance playlist: {e}");
                    self.state.stop();
                    self.emit(StatusEvent::PlaybackChanged {
                        zone,
                        state: PlaybackState::Stopped,
                    })
                    .await;
                }
            }
            None => {
                self.state.stop();
                self.emit(StatusEvent::PlaybackChanged {
                    zone,
                    state: PlaybackState::Stopped,
                })
                .await;
            }
        }
    }

    /// Fill fields the catalog did not know from what the container reports;
    /// the merged track is announced exactly once.
    async fn merge_metadata(&mut self, metadata: DecoderMetadata) {
        if self.metadata_merged {
            return;
        }
        let zone = self.state.zone_index;
        let Some(track) = &mut self.state.current_track else {
            return;
        };
        let mut changed = false;
        if track.title.is_empty() {
            if let Some(title) = metadata.title {
                track.title = title;
                changed = true;
            }
        }
        if track.artist.is_empty() {
            if let Some(artist) = metadata.artist {
                track.artist = artist;
                changed = true;
            }
        }
        if track.album.is_none() && metadata.album.is_some() {
            track.album = metadata.album;
            changed = true;
        }
        if track.duration_ms.is_none() {
            if let Some(duration) = metadata.duration_ms.filter(|d| *d > 0) {
                track.duration_ms = Some(duration);
                self.state.duration_ms = Some(duration);
                changed = true;
            }
        }
        self.metadata_merged = true;
        if changed {
            let track = track.clone();
            self.emit(StatusEvent::TrackChanged { zone, track }).await;
        }
    }

    /// Debounced position publishing.
    async fn publish_position_tick(&mut self, force: bool) {
        let now = tokio::time::Instant::now();
        if !force {
            if let Some(last) = self.last_tick_at {
                if now - last < POSITION_TICK_INTERVAL {
                    self.sync_snapshot();
                    return;
                }
            }
        }
        self.last_tick_at = Some(now);
        if self.state.position_ms > 0 {
            self.stuck_checks = 0;
            self.stuck_alarmed = false;
        }
        self.emit(StatusEvent::PositionTick {
            zone: self.state.zone_index,
            position_ms: self.state.position_ms,
            duration_ms: self.state.duration_ms,
            progress: self.state.progress(),
        })
        .await;
    }

    /// A position that stays at zero while playing usually means the sink is
    /// wedged.  Non-fatal: surfaced as an error event only.
    async fn check_position_stuck(&mut self) {
        if self.state.playback != PlaybackState::Playing || self.state.position_ms > 0 {
            self.stuck_checks = 0;
            return;
        }
        self.stuck_checks = self.stuck_checks.saturating_add(1);
        if self.stuck_checks >= STUCK_CHECKS_BEFORE_ALARM && !self.stuck_alarmed {
            self.stuck_alarmed = true;
            warn!(
                "zone {}: position stuck at 0 for {} checks",
                self.state.zone_index, self.stuck_checks
            );
            self.emit(StatusEvent::Error {
                kind: "position_stuck".to_string(),
                detail: format!(
                    "position has not advanced for {}s",
                    u64::from(self.stuck_checks) * STUCK_CHECK_INTERVAL.as_secs()
                ),
                correlation_id: None,
            })
            .await;
        }
    }

    // ── plumbing ──────────────────────────────────────────────────────────────

    async fn emit(&mut self, event: StatusEvent) {
        self.sync_snapshot();
        self.publisher.publish(event).await;
    }

    fn sync_snapshot(&self) {
        let _ = self.snapshot_tx.send(self.state.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use snapdog_core::command::{CommandEnvelope, CommandSource, Notification, TrackSource};
    use snapdog_core::config::{ZoneKnxConfig, ZoneMqttConfig};
    use std::sync::Mutex;

    // ── mocks ─────────────────────────────────────────────────────────────────

    struct MockDecoder {
        events_tx: broadcast::Sender<DecoderEvent>,
        calls: Mutex<Vec<String>>,
        /// Emitted automatically when `play` is called.
        auto_start: bool,
    }

    impl MockDecoder {
        fn new(auto_start: bool) -> Arc<Self> {
            let (events_tx, _) = broadcast::channel(64);
            Arc::new(Self {
                events_tx,
                calls: Mutex::new(Vec::new()),
                auto_start,
            })
        }

        fn push(&self, event: DecoderEvent) {
            let _ = self.events_tx.send(event);
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MediaDecoder for MockDecoder {
        async fn play(&self, request: PlayRequest) -> snapdog_core::Result<()> {
            self.calls.lock().unwrap().push(format!("play {}", request.url));
            if self.auto_start {
                self.push(DecoderEvent::StateChanged(DecoderState::Opening));
                self.push(DecoderEvent::StateChanged(DecoderState::Playing));
            }
            Ok(())
        }
        async fn stop(&self) -> snapdog_core::Result<()> {
            self.calls.lock().unwrap().push("stop".into());
            Ok(())
        }
        async fn set_paused(&self, paused: bool) -> snapdog_core::Result<()> {
            self.calls.lock().unwrap().push(format!("pause {paused}"));
            Ok(())
        }
        async fn seek_ms(&self, ms: u64) -> snapdog_core::Result<()> {
            self.calls.lock().unwrap().push(format!("seek {ms}"));
            Ok(())
        }
        fn events(&self) -> broadcast::Receiver<DecoderEvent> {
            self.events_tx.subscribe()
        }
    }

    struct FixedCatalog {
        playlist: snapdog_core::command::Playlist,
    }

    #[async_trait]
    impl MediaCatalog for FixedCatalog {
        async fn playlists(&self) -> snapdog_core::Result<Vec<crate::catalog::PlaylistSummary>> {
            Ok(vec![])
        }
        async fn playlist(&self, id: &str) -> snapdog_core::Result<snapdog_core::command::Playlist> {
            if id == RADIO_PLAYLIST_ID || id == self.playlist.id {
                Ok(self.playlist.clone())
            } else {
                Err(Error::not_found(format!("playlist '{id}'")))
            }
        }
    }

    fn subsonic_track(index: usize, title: &str) -> TrackInfo {
        TrackInfo {
            index,
            title: title.to_string(),
            artist: String::new(),
            album: None,
            duration_ms: Some(180_000),
            position_ms: 0,
            progress: 0.0,
            cover_url: None,
            source: TrackSource::Subsonic,
            url: format!("http://music.local/stream/{index}"),
        }
    }

    struct Harness {
        handles: ZonePlayerHandles,
        decoder: Arc<MockDecoder>,
        events_rx: mpsc::Receiver<Notification>,
        cancel: CancellationToken,
    }

    fn harness(tracks: Vec<TrackInfo>, auto_start: bool) -> Harness {
        let decoder = MockDecoder::new(auto_start);
        let catalog = Arc::new(FixedCatalog {
            playlist: snapdog_core::command::Playlist {
                id: RADIO_PLAYLIST_ID.to_string(),
                name: "Radio".to_string(),
                tracks,
            },
        });
        let (events_tx, events_rx) = mpsc::channel(64);
        let publisher = Publisher::from_sender(events_tx);
        let cancel = CancellationToken::new();

        let dir = std::env::temp_dir().join("snapdog-zone-tests");
        let config = ZoneConfig {
            index: 1,
            name: "Kitchen".into(),
            sink: dir.join("zone1").to_string_lossy().to_string(),
            mqtt: ZoneMqttConfig::defaults(1),
            knx: ZoneKnxConfig::default(),
        };
        let handles = spawn(
            config,
            AudioFormat::default(),
            50,
            decoder.clone(),
            catalog,
            publisher,
            cancel.clone(),
        );
        Harness {
            handles,
            decoder,
            events_rx,
            cancel,
        }
    }

    async fn send(handles: &ZonePlayerHandles, command: Command) -> snapdog_core::Result<()> {
        let (request, rx) = EngineRequest::new(CommandEnvelope::new(
            CommandSource::Internal,
            command,
        ));
        handles.commands.send(request).await.unwrap();
        rx.await.unwrap()
    }

    async fn next_event(rx: &mut mpsc::Receiver<Notification>) -> StatusEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("no status event within 2s")
            .expect("queue closed")
            .event
    }

    // ── tests ─────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn play_starts_decoder_and_emits() {
        let mut h = harness(vec![subsonic_track(0, "One"), subsonic_track(1, "Two")], true);
        send(&h.handles, Command::Play { zone: 1, track: Some(1) })
            .await
            .unwrap();

        assert!(h
            .decoder
            .calls()
            .contains(&"play http://music.local/stream/1".to_string()));
        assert!(matches!(
            next_event(&mut h.events_rx).await,
            StatusEvent::PlaybackChanged { zone: 1, state: PlaybackState::Playing }
        ));
        let StatusEvent::TrackChanged { track, .. } = next_event(&mut h.events_rx).await else {
            panic!("expected track change");
        };
        assert_eq!(track.title, "Two");

        let snapshot = h.handles.snapshot.borrow().clone();
        assert_eq!(snapshot.playback, PlaybackState::Playing);
        assert_eq!(snapshot.current_track.unwrap().index, 1);
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn pause_on_live_source_stops() {
        let mut h = harness(
            vec![TrackInfo::radio(0, "FM4", "http://stream.example/fm4")],
            true,
        );
        send(&h.handles, Command::Play { zone: 1, track: Some(0) })
            .await
            .unwrap();
        // drain playback + track events
        next_event(&mut h.events_rx).await;
        next_event(&mut h.events_rx).await;

        send(&h.handles, Command::Pause { zone: 1 }).await.unwrap();
        assert!(matches!(
            next_event(&mut h.events_rx).await,
            StatusEvent::PlaybackChanged { state: PlaybackState::Stopped, .. }
        ));
        // the decoder was stopped, not paused
        let calls = h.decoder.calls();
        assert!(!calls.iter().any(|c| c.starts_with("pause")));
        assert_eq!(h.handles.snapshot.borrow().playback, PlaybackState::Stopped);
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn pause_and_resume_on_seekable_source() {
        let mut h = harness(vec![subsonic_track(0, "One")], true);
        send(&h.handles, Command::Play { zone: 1, track: Some(0) })
            .await
            .unwrap();
        next_event(&mut h.events_rx).await;
        next_event(&mut h.events_rx).await;

        send(&h.handles, Command::Pause { zone: 1 }).await.unwrap();
        assert!(matches!(
            next_event(&mut h.events_rx).await,
            StatusEvent::PlaybackChanged { state: PlaybackState::Paused, .. }
        ));
        assert!(h.decoder.calls().contains(&"pause true".to_string()));

        send(&h.handles, Command::Play { zone: 1, track: None })
            .await
            .unwrap();
        assert!(matches!(
            next_event(&mut h.events_rx).await,
            StatusEvent::PlaybackChanged { state: PlaybackState::Playing, .. }
        ));
        assert!(h.decoder.calls().contains(&"pause false".to_string()));
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn seek_on_live_source_fails() {
        let mut h = harness(
            vec![TrackInfo::radio(0, "FM4", "http://stream.example/fm4")],
            true,
        );
        send(&h.handles, Command::Play { zone: 1, track: Some(0) })
            .await
            .unwrap();
        next_event(&mut h.events_rx).await;
        next_event(&mut h.events_rx).await;

        let err = send(&h.handles, Command::SeekMs { zone: 1, ms: 1000 })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn set_volume_is_idempotent() {
        let mut h = harness(vec![subsonic_track(0, "One")], true);
        for _ in 0..2 {
            send(&h.handles, Command::SetVolume { zone: 1, volume: 42 })
                .await
                .unwrap();
        }
        let first = next_event(&mut h.events_rx).await;
        let second = next_event(&mut h.events_rx).await;
        assert_eq!(first, second);
        assert!(matches!(first, StatusEvent::VolumeChanged { volume: 42, .. }));
        assert_eq!(h.handles.snapshot.borrow().volume, 42);
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn volume_clamps_above_hundred() {
        let h = harness(vec![], true);
        send(&h.handles, Command::SetVolume { zone: 1, volume: 255 })
            .await
            .unwrap();
        assert_eq!(h.handles.snapshot.borrow().volume, 100);
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn natural_end_advances_to_next_track() {
        let mut h = harness(vec![subsonic_track(0, "One"), subsonic_track(1, "Two")], true);
        send(&h.handles, Command::Play { zone: 1, track: Some(0) })
            .await
            .unwrap();
        next_event(&mut h.events_rx).await;
        next_event(&mut h.events_rx).await;

        h.decoder.push(DecoderEvent::StateChanged(DecoderState::Ended));
        assert!(matches!(
            next_event(&mut h.events_rx).await,
            StatusEvent::PlaybackChanged { state: PlaybackState::Playing, .. }
        ));
        let StatusEvent::TrackChanged { track, .. } = next_event(&mut h.events_rx).await else {
            panic!("expected track change");
        };
        assert_eq!(track.index, 1);
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn end_of_playlist_stops_without_repeat() {
        let mut h = harness(vec![subsonic_track(0, "One")], true);
        send(&h.handles, Command::Play { zone: 1, track: Some(0) })
            .await
            .unwrap();
        next_event(&mut h.events_rx).await;
        next_event(&mut h.events_rx).await;

        h.decoder.push(DecoderEvent::StateChanged(DecoderState::Ended));
        assert!(matches!(
            next_event(&mut h.events_rx).await,
            StatusEvent::PlaybackChanged { state: PlaybackState::Stopped, .. }
        ));
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn metadata_merge_reannounces_track_once() {
        let mut h = harness(vec![subsonic_track(0, "One")], true);
        send(&h.handles, Command::Play { zone: 1, track: Some(0) })
            .await
            .unwrap();
        next_event(&mut h.events_rx).await;
        next_event(&mut h.events_rx).await;

        h.decoder.push(DecoderEvent::Metadata(DecoderMetadata {
            title: Some("ignored, track already has one".into()),
            artist: Some("New Order".into()),
            album: Some("Substance".into()),
            duration_ms: None,
        }));
        let StatusEvent::TrackChanged { track, .. } = next_event(&mut h.events_rx).await else {
            panic!("expected merged track change");
        };
        assert_eq!(track.title, "One", "existing title wins");
        assert_eq!(track.artist, "New Order");
        assert_eq!(track.album.as_deref(), Some("Substance"));

        // a second metadata burst must not re-announce
        h.decoder.push(DecoderEvent::Metadata(DecoderMetadata {
            artist: Some("Someone Else".into()),
            ..Default::default()
        }));
        h.decoder.push(DecoderEvent::PositionMs(5000));
        assert!(matches!(
            next_event(&mut h.events_rx).await,
            StatusEvent::PositionTick { .. }
        ));
        h.cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn startup_timeout_fails_the_play() {
        let h = harness(vec![subsonic_track(0, "One")], false);
        let err = send(&h.handles, Command::Play { zone: 1, track: Some(0) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)), "{err:?}");
        // the failed stream was torn down and the player stays reusable
        assert!(h.decoder.calls().iter().filter(|c| *c == "stop").count() >= 1);
        assert_eq!(h.handles.snapshot.borrow().playback, PlaybackState::Stopped);
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn select_playlist_and_out_of_range_track() {
        let mut h = harness(vec![subsonic_track(0, "One")], true);
        let err = send(&h.handles, Command::Play { zone: 1, track: Some(5) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));

        send(
            &h.handles,
            Command::SelectPlaylist { zone: 1, id: RADIO_PLAYLIST_ID.into() },
        )
        .await
        .unwrap();
        assert!(matches!(
            next_event(&mut h.events_rx).await,
            StatusEvent::PlaylistChanged { .. }
        ));
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn members_update_reaches_snapshot() {
        let h = harness(vec![], true);
        let mac: ClientMac = "aa:bb:cc:00:11:22".parse().unwrap();
        h.handles
            .members
            .send(BTreeSet::from([mac.clone()]))
            .await
            .unwrap();
        // watch updates are async; poll briefly
        for _ in 0..50 {
            if h.handles.snapshot.borrow().members.contains(&mac) {
                h.cancel.cancel();
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("members never reached the snapshot");
    }
}
