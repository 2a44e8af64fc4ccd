//! VLC-backed decoder: one headless process per stream, driven over the RC
//! interface on a loopback TCP socket.
//!
//! ```text
//!   VlcDecoder::play()
//!         │ kills any running stream, spawns `cvlc <url> --sout …`
//!         └── driver task
//!                ├── rc socket   ← pause/seek commands, 1 s status polls
//!                ├── child watch ← exit → Ended / Failed
//!                └── events      → broadcast<DecoderEvent>
//! ```
//!
//! The transcode chain (`#transcode{…}:std{access=file,mux=raw,dst=…}`) makes
//! VLC do all decoding and reformatting; this driver only supervises.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use snapdog_core::{Error, Result};

use super::{DecoderEvent, DecoderMetadata, DecoderState, MediaDecoder, PlayRequest};

const RC_CONNECT_ATTEMPTS: u32 = 50;
const RC_CONNECT_DELAY: Duration = Duration::from_millis(100);
const RC_REPLY_TIMEOUT: Duration = Duration::from_millis(500);
const POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Every 30th poll tick logs a stream-status trace.
const STATUS_TRACE_TICKS: u64 = 30;

enum RcCommand {
    SetPaused(bool),
    SeekMs(u64),
}

struct ActiveStream {
    cancel: CancellationToken,
    rc_tx: mpsc::Sender<RcCommand>,
}

pub struct VlcDecoder {
    zone: usize,
    binary: PathBuf,
    events_tx: broadcast::Sender<DecoderEvent>,
    active: Mutex<Option<ActiveStream>>,
}

impl VlcDecoder {
    pub fn new(zone: usize) -> Result<Self> {
        let binary = find_vlc_binary()
            .ok_or_else(|| Error::transport("vlc binary not found (looked for cvlc, vlc)"))?;
        let (events_tx, _) = broadcast::channel(64);
        Ok(Self {
            zone,
            binary,
            events_tx,
            active: Mutex::new(None),
        })
    }

    async fn cancel_active(&self) {
        let mut active = self.active.lock().await;
        if let Some(stream) = active.take() {
            stream.cancel.cancel();
        }
    }
}

#[async_trait]
impl MediaDecoder for VlcDecoder {
    async fn play(&self, request: PlayRequest) -> Result<()> {
        self.cancel_active().await;

        let mut command = tokio::process::Command::new(&self.binary);
        command
            .arg(&request.url)
            .args(["-I", "rc", "--no-video", "--quiet", "--play-and-exit"])
            .arg("--sout")
            .arg(&request.sout)
            .args(["--sout-keep", "--sout-all"]);
        if let Some(start_ms) = request.start_ms {
            command.arg(format!("--start-time={}", start_ms / 1000));
        }

        // loopback RC port; picked fresh per stream
        let probe = tokio::net::TcpListener::bind(("127.0.0.1", 0))
            .await
            .map_err(|e| Error::transport(format!("no free rc port: {e}")))?;
        let rc_port = probe
            .local_addr()
            .map_err(|e| Error::transport(format!("rc port: {e}")))?
            .port();
        drop(probe);
        command.arg("--rc-host").arg(format!("127.0.0.1:{rc_port}"));

        info!("zone {}: starting decoder for {}", self.zone, request.url);
        let child = command
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .stdin(Stdio::null())
            .spawn()
            .map_err(|e| Error::transport(format!("cannot spawn {}: {e}", self.binary.display())))?;

        let cancel = CancellationToken::new();
        let (rc_tx, rc_rx) = mpsc::channel(8);
        *self.active.lock().await = Some(ActiveStream {
            cancel: cancel.clone(),
            rc_tx,
        });

        tokio::spawn(driver_task(
            self.zone,
            child,
            rc_port,
            rc_rx,
            self.events_tx.clone(),
            cancel,
        ));
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.cancel_active().await;
        Ok(())
    }

    async fn set_paused(&self, paused: bool) -> Result<()> {
        let active = self.active.lock().await;
        match active.as_ref() {
            Some(stream) => stream
                .rc_tx
                .send(RcCommand::SetPaused(paused))
                .await
                .map_err(|_| Error::invalid_state("no stream is active")),
            None => Err(Error::invalid_state("no stream is active")),
        }
    }

    async fn seek_ms(&self, ms: u64) -> Result<()> {
        let active = self.active.lock().await;
        match active.as_ref() {
            Some(stream) => stream
                .rc_tx
                .send(RcCommand::SeekMs(ms))
                .await
                .map_err(|_| Error::invalid_state("no stream is active")),
            None => Err(Error::invalid_state("no stream is active")),
        }
    }

    fn events(&self) -> broadcast::Receiver<DecoderEvent> {
        self.events_tx.subscribe()
    }
}

// ── driver task ───────────────────────────────────────────────────────────────

struct Rc {
    reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
    writer: tokio::net::tcp::OwnedWriteHalf,
}

async fn driver_task(
    zone: usize,
    mut child: tokio::process::Child,
    rc_port: u16,
    mut rc_rx: mpsc::Receiver<RcCommand>,
    events_tx: broadcast::Sender<DecoderEvent>,
    cancel: CancellationToken,
) {
    let emit = |event: DecoderEvent| {
        let _ = events_tx.send(event);
    };
    emit(DecoderEvent::StateChanged(DecoderState::Opening));

    // RC socket appears once VLC is up
    let mut rc = None;
    for _ in 0..RC_CONNECT_ATTEMPTS {
        if cancel.is_cancelled() {
            let _ = child.kill().await;
            return;
        }
        if let Ok(Some(_)) = child.try_wait() {
            emit(DecoderEvent::Error("decoder exited during startup".into()));
            emit(DecoderEvent::StateChanged(DecoderState::Failed));
            return;
        }
        match TcpStream::connect(("127.0.0.1", rc_port)).await {
            Ok(stream) => {
                let (read_half, write_half) = stream.into_split();
                rc = Some(Rc {
                    reader: BufReader::new(read_half),
                    writer: write_half,
                });
                break;
            }
            Err(_) => tokio::time::sleep(RC_CONNECT_DELAY).await,
        }
    }
    let Some(mut rc) = rc else {
        warn!("zone {zone}: decoder rc socket did not appear");
        let _ = child.kill().await;
        emit(DecoderEvent::Error("decoder control socket did not appear".into()));
        emit(DecoderEvent::StateChanged(DecoderState::Failed));
        return;
    };

    debug!("zone {zone}: decoder rc connected on port {rc_port}");
    emit(DecoderEvent::StateChanged(DecoderState::Buffering));

    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let mut playing_seen = false;
    let mut paused = false;
    let mut metadata_sent = false;
    let mut tick: u64 = 0;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = rc_query(&mut rc, "quit").await;
                let _ = child.kill().await;
                debug!("zone {zone}: decoder cancelled");
                return;
            }

            cmd = rc_rx.recv() => {
                match cmd {
                    Some(RcCommand::SetPaused(want)) => {
                        // oldrc only has a toggle
                        if want != paused {
                            let _ = rc_query(&mut rc, "pause").await;
                            paused = want;
                            emit(DecoderEvent::StateChanged(if want {
                                DecoderState::Paused
                            } else {
                                DecoderState::Playing
                            }));
                        }
                    }
                    Some(RcCommand::SeekMs(ms)) => {
                        let _ = rc_query(&mut rc, &format!("seek {}", ms / 1000)).await;
                        emit(DecoderEvent::PositionMs(ms));
                    }
                    None => {
                        let _ = child.kill().await;
                        return;
                    }
                }
            }

            _ = ticker.tick() => {
                tick += 1;

                if let Ok(Some(status)) = child.try_wait() {
                    if playing_seen && status.success() {
                        emit(DecoderEvent::StateChanged(DecoderState::Ended));
                    } else if playing_seen {
                        emit(DecoderEvent::Error(format!("decoder exited with {status}")));
                        emit(DecoderEvent::StateChanged(DecoderState::Failed));
                    } else {
                        emit(DecoderEvent::Error("decoder exited before playback".into()));
                        emit(DecoderEvent::StateChanged(DecoderState::Failed));
                    }
                    return;
                }

                if paused {
                    continue;
                }

                let time_s = rc_query(&mut rc, "get_time").await.ok()
                    .and_then(|reply| parse_rc_integer(&reply));
                let length_s = rc_query(&mut rc, "get_length").await.ok()
                    .and_then(|reply| parse_rc_integer(&reply));

                if !playing_seen {
                    if let Some(t) = time_s {
                        if t >= 0 {
                            playing_seen = true;
                            emit(DecoderEvent::StateChanged(DecoderState::Playing));
                        }
                    }
                }

                if playing_seen && !metadata_sent {
                    metadata_sent = true;
                    let info = rc_query_block(&mut rc, "info").await.unwrap_or_default();
                    let mut metadata = parse_info_metadata(&info);
                    if let Some(len) = length_s.filter(|l| *l > 0) {
                        metadata.duration_ms = Some(len as u64 * 1000);
                    }
                    emit(DecoderEvent::Metadata(metadata));
                }

                if let Some(t) = time_s.filter(|t| *t >= 0) {
                    let position_ms = t as u64 * 1000;
                    emit(DecoderEvent::PositionMs(position_ms));
                    if let Some(len) = length_s.filter(|l| *l > 0) {
                        emit(DecoderEvent::Progress(
                            (t as f64 / len as f64).clamp(0.0, 1.0) as f32,
                        ));
                    }
                }

                if tick % STATUS_TRACE_TICKS == 0 {
                    debug!(
                        "zone {zone}: stream status tick={tick} time={time_s:?}s length={length_s:?}s"
                    );
                }
            }
        }
    }
}

// ── RC plumbing ───────────────────────────────────────────────────────────────

/// Send one command and return the first meaningful reply line.
async fn rc_query(rc: &mut Rc, command: &str) -> Result<String> {
    rc.writer
        .write_all(format!("{command}\n").as_bytes())
        .await
        .map_err(|e| Error::transport(format!("rc write failed: {e}")))?;

    let deadline = tokio::time::Instant::now() + RC_REPLY_TIMEOUT;
    let mut line = String::new();
    loop {
        line.clear();
        let read = tokio::time::timeout_at(deadline, rc.reader.read_line(&mut line))
            .await
            .map_err(|_| Error::timeout(format!("rc reply to '{command}'")))?
            .map_err(|e| Error::transport(format!("rc read failed: {e}")))?;
        if read == 0 {
            return Err(Error::transport("rc socket closed"));
        }
        let cleaned = clean_rc_line(&line);
        if !cleaned.is_empty() {
            return Ok(cleaned);
        }
    }
}

/// Send one command and collect reply lines until the stream goes quiet.
async fn rc_query_block(rc: &mut Rc, command: &str) -> Result<Vec<String>> {
    rc.writer
        .write_all(format!("{command}\n").as_bytes())
        .await
        .map_err(|e| Error::transport(format!("rc write failed: {e}")))?;

    let mut lines = Vec::new();
    let mut line = String::new();
    loop {
        line.clear();
        match tokio::time::timeout(RC_REPLY_TIMEOUT, rc.reader.read_line(&mut line)).await {
            Err(_) => break,
            Ok(Err(e)) => return Err(Error::transport(format!("rc read failed: {e}"))),
            Ok(Ok(0)) => break,
            Ok(Ok(_)) => {
                let cleaned = clean_rc_line(&line);
                if !cleaned.is_empty() {
                    lines.push(cleaned);
                }
            }
        }
    }
    Ok(lines)
}

/// Strip prompts and banner noise from an RC line.
fn clean_rc_line(line: &str) -> String {
    let mut s = line.trim();
    while let Some(rest) = s.strip_prefix("> ") {
        s = rest.trim_start();
    }
    if s == ">" || s.starts_with("VLC media player") || s.starts_with("Command Line Interface") {
        return String::new();
    }
    s.to_string()
}

fn parse_rc_integer(reply: &str) -> Option<i64> {
    reply.trim().parse::<i64>().ok()
}

/// Pull title/artist/album out of an `info` block (`| title: …` lines).
fn parse_info_metadata(lines: &[String]) -> DecoderMetadata {
    let field = |name: &str| {
        lines.iter().find_map(|l| {
            let l = l.trim_start_matches('|').trim();
            l.strip_prefix(name)
                .and_then(|rest| rest.strip_prefix(':'))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        })
    };
    DecoderMetadata {
        title: field("title"),
        artist: field("artist"),
        album: field("album"),
        duration_ms: None,
    }
}

/// First of `cvlc`, `vlc` found on PATH.
fn find_vlc_binary() -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path) {
        for name in ["cvlc", "vlc"] {
            let candidate = dir.join(name);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
    }
    None
}
