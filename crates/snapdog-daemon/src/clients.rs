//! Client engine: authoritative per-client state.
//!
//! Clients come into existence when the Snapcast server first reports them
//! and disappear when a refresh no longer sees them.  Commands flow out to
//! the server via the control port; server notifications and periodic
//! snapshots flow back in and are folded into state plus status events.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use snapdog_core::command::{ClientMac, Command, StatusEvent};
use snapdog_core::config::ClientConfig;
use snapdog_core::state::ClientState;
use snapdog_core::{Error, Result};

use crate::dispatcher::EngineRequest;
use crate::notify::Publisher;
use crate::snapcast::client::SnapcastControl;
use crate::snapcast::reconciler::Assignments;
use crate::snapcast::types::{ServerSnapshot, SnapcastEvent};
use crate::zone::ZoneManager;

pub struct ClientEngineHandles {
    pub commands: mpsc::Sender<EngineRequest>,
    pub snapshot: watch::Receiver<Vec<ClientState>>,
    pub task: tokio::task::JoinHandle<()>,
}

#[allow(clippy::too_many_arguments)]
pub fn spawn(
    configs: Vec<ClientConfig>,
    control: Arc<dyn SnapcastControl>,
    events: broadcast::Receiver<SnapcastEvent>,
    assignments: Arc<Assignments>,
    zones: ZoneManager,
    zone_streams: HashMap<usize, String>,
    publisher: Publisher,
    refresh_interval: Duration,
    cancel: CancellationToken,
) -> ClientEngineHandles {
    let (cmd_tx, cmd_rx) = mpsc::channel(16);
    let (snapshot_tx, snapshot_rx) = watch::channel(Vec::new());

    let engine = ClientEngine {
        configured_names: configs
            .iter()
            .map(|c| (c.mac.clone(), c.name.clone()))
            .collect(),
        states: HashMap::new(),
        server_ids: HashMap::new(),
        control,
        assignments,
        zones,
        stream_zones: zone_streams.into_iter().map(|(z, s)| (s, z)).collect(),
        publisher,
        snapshot_tx,
    };
    let task = tokio::spawn(engine.run(cmd_rx, events, refresh_interval, cancel));

    ClientEngineHandles {
        commands: cmd_tx,
        snapshot: snapshot_rx,
        task,
    }
}

struct ClientEngine {
    configured_names: HashMap<ClientMac, String>,
    states: HashMap<ClientMac, ClientState>,
    /// MAC → id the server knows the client by.
    server_ids: HashMap<ClientMac, String>,
    control: Arc<dyn SnapcastControl>,
    assignments: Arc<Assignments>,
    zones: ZoneManager,
    /// stream id → zone index.
    stream_zones: HashMap<String, usize>,
    publisher: Publisher,
    snapshot_tx: watch::Sender<Vec<ClientState>>,
}

impl ClientEngine {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<EngineRequest>,
        mut events: broadcast::Receiver<SnapcastEvent>,
        refresh_interval: Duration,
        cancel: CancellationToken,
    ) {
        if let Err(e) = self.refresh().await {
            warn!("clients: initial refresh failed: {e}");
        }
        info!("clients: engine running ({} known)", self.states.len());

        let mut refresh_timer = tokio::time::interval(refresh_interval);
        refresh_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("clients: engine stopped");
                    return;
                }

                request = cmd_rx.recv() => {
                    let Some(request) = request else { return };
                    let result = self.handle_command(request.env.command).await;
                    let _ = request.reply.send(result);
                }

                event = events.recv() => {
                    match event {
                        Ok(event) => self.handle_event(event).await,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            debug!("clients: missed {n} server events, refreshing");
                            if let Err(e) = self.refresh().await {
                                warn!("clients: refresh failed: {e}");
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    }
                }

                _ = refresh_timer.tick() => {
                    if let Err(e) = self.refresh().await {
                        debug!("clients: refresh failed: {e}");
                    }
                }
            }
        }
    }

    // ── commands ──────────────────────────────────────────────────────────────

    async fn handle_command(&mut self, command: Command) -> Result<()> {
        match command {
            Command::SetClientVolume { mac, volume } => {
                let id = self.server_id(&mac)?;
                let muted = self.state(&mac)?.muted;
                self.control.set_client_volume(&id, volume.min(100), muted).await?;
                let state = self.state_mut(&mac)?;
                let volume = state.set_volume(volume);
                self.emit(StatusEvent::ClientVolumeChanged { mac, volume }).await;
                Ok(())
            }
            Command::SetClientMute { mac, muted } => self.set_mute(mac, muted).await,
            Command::ToggleClientMute { mac } => {
                let muted = !self.state(&mac)?.muted;
                self.set_mute(mac, muted).await
            }
            Command::SetClientLatency { mac, latency_ms } => {
                let id = self.server_id(&mac)?;
                self.control.set_client_latency(&id, latency_ms).await?;
                self.state_mut(&mac)?.latency_ms = latency_ms;
                self.emit(StatusEvent::ClientLatencyChanged { mac, latency_ms })
                    .await;
                Ok(())
            }
            Command::AssignClientToZone { mac, zone } => {
                if !self.zones.has_zone(zone) {
                    return Err(Error::not_found(format!("zone {zone}")));
                }
                // the client need not be online yet; the reconciler applies
                // the assignment once it shows up
                self.assignments.assign(mac.clone(), zone).await;
                if let Ok(state) = self.state_mut(&mac) {
                    state.zone_index = Some(zone);
                }
                self.emit(StatusEvent::ClientZoneChanged { mac, zone }).await;
                Ok(())
            }
            other => Err(Error::internal(format!(
                "client engine received non-client command {other:?}"
            ))),
        }
    }

    async fn set_mute(&mut self, mac: ClientMac, muted: bool) -> Result<()> {
        let id = self.server_id(&mac)?;
        let volume = self.state(&mac)?.volume;
        self.control.set_client_volume(&id, volume, muted).await?;
        self.state_mut(&mac)?.muted = muted;
        self.emit(StatusEvent::ClientMuteChanged { mac, muted }).await;
        Ok(())
    }

    fn server_id(&self, mac: &ClientMac) -> Result<String> {
        self.server_ids
            .get(mac)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("client {mac}")))
    }

    fn state(&self, mac: &ClientMac) -> Result<&ClientState> {
        self.states
            .get(mac)
            .ok_or_else(|| Error::not_found(format!("client {mac}")))
    }

    fn state_mut(&mut self, mac: &ClientMac) -> Result<&mut ClientState> {
        self.states
            .get_mut(mac)
            .ok_or_else(|| Error::not_found(format!("client {mac}")))
    }

    // ── server events ─────────────────────────────────────────────────────────

    async fn handle_event(&mut self, event: SnapcastEvent) {
        match event {
            SnapcastEvent::ClientConnect(info) => {
                if let Some(mac) = info.mac.clone() {
                    self.server_ids.insert(mac.clone(), info.id.clone());
                    let state = self
                        .states
                        .entry(mac.clone())
                        .or_insert_with(|| ClientState::new(mac.clone(), &info.name));
                    state.connected = true;
                    state.touch();
                    self.emit(StatusEvent::ClientConnected { mac, connected: true })
                        .await;
                }
            }
            SnapcastEvent::ClientDisconnect { id } => {
                if let Some(mac) = self.mac_for_id(&id) {
                    if let Some(state) = self.states.get_mut(&mac) {
                        state.connected = false;
                    }
                    self.emit(StatusEvent::ClientConnected { mac, connected: false })
                        .await;
                }
            }
            SnapcastEvent::ClientVolumeChanged { id, percent, muted } => {
                if let Some(mac) = self.mac_for_id(&id) {
                    let (volume_changed, mute_changed) = match self.states.get_mut(&mac) {
                        Some(state) => {
                            let changed = (state.volume != percent, state.muted != muted);
                            state.set_volume(percent);
                            state.muted = muted;
                            changed
                        }
                        None => (false, false),
                    };
                    if volume_changed {
                        self.emit(StatusEvent::ClientVolumeChanged {
                            mac: mac.clone(),
                            volume: percent,
                        })
                        .await;
                    }
                    if mute_changed {
                        self.emit(StatusEvent::ClientMuteChanged { mac, muted }).await;
                    }
                }
            }
            SnapcastEvent::ClientLatencyChanged { id, latency_ms } => {
                if let Some(mac) = self.mac_for_id(&id) {
                    if let Some(state) = self.states.get_mut(&mac) {
                        state.latency_ms = latency_ms;
                    }
                    self.emit(StatusEvent::ClientLatencyChanged { mac, latency_ms })
                        .await;
                }
            }
            SnapcastEvent::ClientNameChanged { id, name } => {
                if let Some(mac) = self.mac_for_id(&id) {
                    if let Some(state) = self.states.get_mut(&mac) {
                        state.name = name;
                        self.sync_snapshot();
                    }
                }
            }
            SnapcastEvent::GroupChanged | SnapcastEvent::StreamChanged { .. } => {
                if let Err(e) = self.refresh().await {
                    debug!("clients: refresh after server event failed: {e}");
                }
            }
        }
    }

    fn mac_for_id(&self, id: &str) -> Option<ClientMac> {
        self.server_ids
            .iter()
            .find(|(_, known)| known.as_str() == id)
            .map(|(mac, _)| mac.clone())
            // servers usually use the MAC as the id
            .or_else(|| id.parse().ok())
    }

    // ── snapshot refresh ──────────────────────────────────────────────────────

    async fn refresh(&mut self) -> Result<()> {
        let snapshot = self.control.server_status().await?;
        let mut seen: BTreeSet<ClientMac> = BTreeSet::new();

        for group in &snapshot.groups {
            let zone = self.stream_zones.get(&group.stream_id).copied();
            for info in &group.clients {
                let Some(mac) = info.mac.clone() else { continue };
                seen.insert(mac.clone());
                self.server_ids.insert(mac.clone(), info.id.clone());

                let configured_name = self.configured_names.get(&mac).cloned();
                let state = self.states.entry(mac.clone()).or_insert_with(|| {
                    ClientState::new(mac.clone(), configured_name.as_deref().unwrap_or(&info.name))
                });

                let was = state.clone();
                state.connected = info.connected;
                state.set_volume(info.volume_percent);
                state.muted = info.muted;
                state.latency_ms = info.latency_ms;
                state.zone_index = zone;
                state.touch();

                if was.connected != state.connected {
                    self.publisher
                        .publish(StatusEvent::ClientConnected {
                            mac: mac.clone(),
                            connected: info.connected,
                        })
                        .await;
                }
                if was.volume != state.volume {
                    self.publisher
                        .publish(StatusEvent::ClientVolumeChanged {
                            mac: mac.clone(),
                            volume: info.volume_percent,
                        })
                        .await;
                }
                if was.muted != state.muted {
                    self.publisher
                        .publish(StatusEvent::ClientMuteChanged {
                            mac: mac.clone(),
                            muted: info.muted,
                        })
                        .await;
                }
                if was.zone_index != state.zone_index {
                    if let Some(zone) = zone {
                        self.publisher
                            .publish(StatusEvent::ClientZoneChanged { mac: mac.clone(), zone })
                            .await;
                    }
                }
            }
        }

        // clients the server no longer reports are gone
        self.states.retain(|mac, _| seen.contains(mac));
        self.server_ids.retain(|mac, _| seen.contains(mac));

        for (zone, members) in zone_membership(&snapshot, &self.stream_zones) {
            self.zones.set_members(zone, members).await;
        }
        self.sync_snapshot();
        Ok(())
    }

    async fn emit(&mut self, event: StatusEvent) {
        self.sync_snapshot();
        self.publisher.publish(event).await;
    }

    fn sync_snapshot(&self) {
        let mut list: Vec<ClientState> = self.states.values().cloned().collect();
        list.sort_by(|a, b| a.mac.cmp(&b.mac));
        let _ = self.snapshot_tx.send(list);
    }
}

/// Per-zone membership as reported by the server's grouping.
pub fn zone_membership(
    snapshot: &ServerSnapshot,
    stream_zones: &HashMap<String, usize>,
) -> HashMap<usize, BTreeSet<ClientMac>> {
    let mut membership: HashMap<usize, BTreeSet<ClientMac>> = stream_zones
        .values()
        .map(|zone| (*zone, BTreeSet::new()))
        .collect();
    for group in &snapshot.groups {
        let Some(zone) = stream_zones.get(&group.stream_id) else {
            continue;
        };
        let members = membership.entry(*zone).or_default();
        for client in &group.clients {
            if let Some(mac) = &client.mac {
                members.insert(mac.clone());
            }
        }
    }
    membership
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapcast::types::{ClientInfo, GroupInfo, StreamInfo};
    use async_trait::async_trait;
    use snapdog_core::command::{CommandEnvelope, CommandSource, Notification};
    use std::sync::Mutex;

    const MAC_A: &str = "aa:aa:aa:aa:aa:01";

    struct MockControl {
        snapshot: ServerSnapshot,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl SnapcastControl for MockControl {
        async fn server_status(&self) -> Result<ServerSnapshot> {
            Ok(self.snapshot.clone())
        }
        async fn set_client_volume(&self, id: &str, percent: u8, muted: bool) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("volume {id} {percent} {muted}"));
            Ok(())
        }
        async fn set_client_latency(&self, id: &str, latency_ms: i32) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("latency {id} {latency_ms}"));
            Ok(())
        }
        async fn set_client_name(&self, _id: &str, _name: &str) -> Result<()> {
            Ok(())
        }
        async fn set_group_clients(&self, _group_id: &str, _client_ids: &[String]) -> Result<()> {
            Ok(())
        }
        async fn set_group_stream(&self, _group_id: &str, _stream_id: &str) -> Result<()> {
            Ok(())
        }
    }

    fn snapshot_with_client() -> ServerSnapshot {
        ServerSnapshot {
            groups: vec![GroupInfo {
                id: "g1".into(),
                name: String::new(),
                stream_id: "zone1".into(),
                clients: vec![ClientInfo {
                    id: MAC_A.into(),
                    name: "pi-kitchen".into(),
                    mac: MAC_A.parse().ok(),
                    connected: true,
                    volume_percent: 70,
                    muted: false,
                    latency_ms: 0,
                }],
            }],
            streams: vec![StreamInfo {
                id: "zone1".into(),
                status: "playing".into(),
            }],
        }
    }

    struct Harness {
        handles: ClientEngineHandles,
        control: Arc<MockControl>,
        events_rx: mpsc::Receiver<Notification>,
        cancel: CancellationToken,
        _server_events_tx: broadcast::Sender<SnapcastEvent>,
    }

    fn harness() -> Harness {
        let control = Arc::new(MockControl {
            snapshot: snapshot_with_client(),
            calls: Mutex::new(Vec::new()),
        });
        let (events_tx, events_rx) = mpsc::channel(64);
        let (_unused_tx, server_events) = broadcast::channel::<SnapcastEvent>(8);
        let cancel = CancellationToken::new();
        let zones = ZoneManager::spawn_all(
            &[],
            &snapdog_core::audio::AudioFormat::default(),
            Arc::new(crate::catalog::RadioCatalog::new(vec![])),
            &Publisher::from_sender(events_tx.clone()),
            |_| unreachable!("no zones configured"),
            &cancel,
        )
        .unwrap();
        let handles = spawn(
            vec![],
            control.clone(),
            server_events,
            Assignments::new(&[]),
            zones,
            HashMap::from([(1, "zone1".to_string())]),
            Publisher::from_sender(events_tx),
            Duration::from_secs(3600),
            cancel.clone(),
        );
        Harness {
            handles,
            control,
            events_rx,
            cancel,
            _server_events_tx: _unused_tx,
        }
    }

    async fn send(handles: &ClientEngineHandles, command: Command) -> Result<()> {
        let (request, rx) =
            EngineRequest::new(CommandEnvelope::new(CommandSource::Internal, command));
        handles.commands.send(request).await.unwrap();
        rx.await.unwrap()
    }

    #[tokio::test]
    async fn volume_command_hits_server_and_state() {
        let mut h = harness();
        // wait for the initial refresh to land
        for _ in 0..50 {
            if !h.handles.snapshot.borrow().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let mac: ClientMac = MAC_A.parse().unwrap();
        send(&h.handles, Command::SetClientVolume { mac: mac.clone(), volume: 33 })
            .await
            .unwrap();

        assert_eq!(
            *h.control.calls.lock().unwrap(),
            vec![format!("volume {MAC_A} 33 false")]
        );
        let snapshot = h.handles.snapshot.borrow().clone();
        assert_eq!(snapshot[0].volume, 33);

        // the initial refresh also emitted first-sighting events; scan past them
        loop {
            let event = tokio::time::timeout(Duration::from_secs(2), h.events_rx.recv())
                .await
                .expect("no volume event within 2s")
                .unwrap()
                .event;
            if matches!(event, StatusEvent::ClientVolumeChanged { volume: 33, .. }) {
                break;
            }
        }
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn unknown_client_is_not_found() {
        let h = harness();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let mac: ClientMac = "ff:ff:ff:ff:ff:ff".parse().unwrap();
        let err = send(&h.handles, Command::SetClientVolume { mac, volume: 10 })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn assign_to_unknown_zone_is_not_found() {
        let h = harness();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let mac: ClientMac = MAC_A.parse().unwrap();
        let err = send(&h.handles, Command::AssignClientToZone { mac, zone: 5 })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        h.cancel.cancel();
    }

    #[test]
    fn membership_is_computed_per_zone() {
        let snapshot = snapshot_with_client();
        let stream_zones = HashMap::from([("zone1".to_string(), 1), ("zone2".to_string(), 2)]);
        let membership = zone_membership(&snapshot, &stream_zones);
        assert_eq!(membership[&1].len(), 1);
        assert!(membership[&1].contains(&MAC_A.parse().unwrap()));
        assert!(membership[&2].is_empty(), "zones without clients are reported empty");
    }
}
