//! Media decoder port.
//!
//! A decoder owns at most one live stream for one zone: it pulls the source
//! URL, transcodes to the global PCM format, and writes into the zone's sink
//! pipe.  Implementations push [`DecoderEvent`]s; the zone player folds them
//! into its state machine.

pub mod vlc;

use async_trait::async_trait;
use tokio::sync::broadcast;

use snapdog_core::Result;

/// Everything a decoder needs to start one stream.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayRequest {
    pub url: String,
    /// Transcode/output chain (see [`snapdog_core::audio::AudioFormat::sout_chain`]).
    pub sout: String,
    /// Live sources cannot seek or pause.
    pub seekable: bool,
    pub start_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderState {
    Opening,
    Buffering,
    Playing,
    Paused,
    Ended,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecoderMetadata {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub duration_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DecoderEvent {
    StateChanged(DecoderState),
    PositionMs(u64),
    /// 0..1 of the container-reported length.
    Progress(f32),
    /// Emitted once after the container is parsed.
    Metadata(DecoderMetadata),
    Error(String),
}

/// One decoder instance per zone.  `play` replaces any in-flight stream;
/// `stop` cancels it without surfacing an error.
#[async_trait]
pub trait MediaDecoder: Send + Sync {
    async fn play(&self, request: PlayRequest) -> Result<()>;
    async fn stop(&self) -> Result<()>;
    async fn set_paused(&self, paused: bool) -> Result<()>;
    async fn seek_ms(&self, ms: u64) -> Result<()>;
    fn events(&self) -> broadcast::Receiver<DecoderEvent>;
}

/// Degraded-mode decoder used when no real backend is available: every play
/// fails, so zones stay controllable while playback reports errors.
pub struct UnavailableDecoder {
    events_tx: broadcast::Sender<DecoderEvent>,
    reason: String,
}

impl UnavailableDecoder {
    pub fn new(reason: impl Into<String>) -> Self {
        let (events_tx, _) = broadcast::channel(8);
        Self {
            events_tx,
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl MediaDecoder for UnavailableDecoder {
    async fn play(&self, _request: PlayRequest) -> Result<()> {
        Err(snapdog_core::Error::transport(self.reason.clone()))
    }
    async fn stop(&self) -> Result<()> {
        Ok(())
    }
    async fn set_paused(&self, _paused: bool) -> Result<()> {
        Err(snapdog_core::Error::invalid_state("no stream is active"))
    }
    async fn seek_ms(&self, _ms: u64) -> Result<()> {
        Err(snapdog_core::Error::invalid_state("no stream is active"))
    }
    fn events(&self) -> broadcast::Receiver<DecoderEvent> {
        self.events_tx.subscribe()
    }
}
