//! KNX surface of the command/status bus.
//!
//! Inbound group writes on configured command addresses become typed
//! commands with `Source = Knx`; status events are DPT-encoded onto the
//! configured status addresses; reads on status addresses are answered with
//! the current state.  KNX has no error back-channel, so failed commands are
//! logged only.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use snapdog_core::command::{
    ClientMac, Command, CommandEnvelope, CommandSource, PlaybackState, StatusEvent,
};
use snapdog_core::config::{ClientConfig, ZoneConfig};
use snapdog_core::knx::cemi::{Apci, CemiFrame, Payload};
use snapdog_core::knx::dpt::{self, DptId, GroupValue};
use snapdog_core::knx::{GroupAddress, KnxLink};
use snapdog_core::state::ClientState;
use snapdog_core::{Error, Result};

use crate::dispatcher::Dispatcher;
use crate::notify::StatusSink;
use crate::zone::ZoneManager;

const DPT_SWITCH: DptId = DptId::new(1, 1);
const DPT_PERCENT: DptId = DptId::new(5, 1);

// ── bindings ──────────────────────────────────────────────────────────────────

/// What a write on a command group address means.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandBinding {
    ZonePlay(usize),
    ZonePause(usize),
    ZoneStop(usize),
    ZoneNext(usize),
    ZonePrev(usize),
    ZoneVolume(usize),
    ZoneVolumeUp(usize),
    ZoneVolumeDown(usize),
    ZoneMute(usize),
    ZoneMuteToggle(usize),
    ZoneShuffle(usize),
    ZoneRepeatTrack(usize),
    ZoneRepeatPlaylist(usize),
    ClientVolume(ClientMac),
    ClientMute(ClientMac),
}

/// Which state a status group address reflects.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusBinding {
    ZoneVolume(usize),
    ZoneMute(usize),
    ZonePlaying(usize),
    ClientVolume(ClientMac),
    ClientMute(ClientMac),
}

#[derive(Debug, Default)]
pub struct KnxBindings {
    commands: HashMap<GroupAddress, CommandBinding>,
    status: HashMap<GroupAddress, StatusBinding>,
}

impl KnxBindings {
    pub fn from_config(zones: &[ZoneConfig], clients: &[ClientConfig]) -> Self {
        let mut bindings = Self::default();
        for zone in zones.iter().filter(|z| z.knx.enabled) {
            let z = zone.index;
            let knx = &zone.knx;
            let mut command = |address: Option<GroupAddress>, binding: CommandBinding| {
                if let Some(address) = address {
                    bindings.commands.insert(address, binding);
                }
            };
            command(knx.play, CommandBinding::ZonePlay(z));
            command(knx.pause, CommandBinding::ZonePause(z));
            command(knx.stop, CommandBinding::ZoneStop(z));
            command(knx.next, CommandBinding::ZoneNext(z));
            command(knx.previous, CommandBinding::ZonePrev(z));
            command(knx.volume, CommandBinding::ZoneVolume(z));
            command(knx.volume_up, CommandBinding::ZoneVolumeUp(z));
            command(knx.volume_down, CommandBinding::ZoneVolumeDown(z));
            command(knx.mute, CommandBinding::ZoneMute(z));
            command(knx.mute_toggle, CommandBinding::ZoneMuteToggle(z));
            command(knx.shuffle, CommandBinding::ZoneShuffle(z));
            command(knx.repeat_track, CommandBinding::ZoneRepeatTrack(z));
            command(knx.repeat_playlist, CommandBinding::ZoneRepeatPlaylist(z));

            if let Some(address) = knx.volume_status {
                bindings.status.insert(address, StatusBinding::ZoneVolume(z));
            }
            if let Some(address) = knx.mute_status {
                bindings.status.insert(address, StatusBinding::ZoneMute(z));
            }
            if let Some(address) = knx.playing_status {
                bindings.status.insert(address, StatusBinding::ZonePlaying(z));
            }
        }
        for client in clients.iter().filter(|c| c.knx.enabled) {
            let mac = &client.mac;
            if let Some(address) = client.knx.volume {
                bindings
                    .commands
                    .insert(address, CommandBinding::ClientVolume(mac.clone()));
            }
            if let Some(address) = client.knx.mute {
                bindings
                    .commands
                    .insert(address, CommandBinding::ClientMute(mac.clone()));
            }
            if let Some(address) = client.knx.volume_status {
                bindings
                    .status
                    .insert(address, StatusBinding::ClientVolume(mac.clone()));
            }
            if let Some(address) = client.knx.mute_status {
                bindings
                    .status
                    .insert(address, StatusBinding::ClientMute(mac.clone()));
            }
        }
        bindings
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty() && self.status.is_empty()
    }
}

/// Decode an inbound write per the binding's DPT and produce the command.
/// `Ok(None)` means the value was valid but asks for nothing (e.g. a `false`
/// on a trigger address).
pub fn command_for_write(binding: &CommandBinding, raw: &[u8]) -> Result<Option<Command>> {
    let switch = |raw: &[u8]| -> Result<bool> {
        match dpt::decode(raw, DPT_SWITCH)? {
            GroupValue::Bool(b) => Ok(b),
            _ => Err(Error::dpt("expected a switch value")),
        }
    };
    let percent = |raw: &[u8]| -> Result<u8> {
        match dpt::decode(raw, DPT_PERCENT)? {
            GroupValue::U8(v) => Ok(v),
            _ => Err(Error::dpt("expected a scaled value")),
        }
    };

    let command = match binding {
        CommandBinding::ZonePlay(zone) => {
            if switch(raw)? {
                Some(Command::Play { zone: *zone, track: None })
            } else {
                Some(Command::Pause { zone: *zone })
            }
        }
        CommandBinding::ZonePause(zone) => switch(raw)?.then(|| Command::Pause { zone: *zone }),
        CommandBinding::ZoneStop(zone) => switch(raw)?.then(|| Command::Stop { zone: *zone }),
        CommandBinding::ZoneNext(zone) => switch(raw)?.then(|| Command::Next { zone: *zone }),
        CommandBinding::ZonePrev(zone) => switch(raw)?.then(|| Command::Prev { zone: *zone }),
        CommandBinding::ZoneVolume(zone) => Some(Command::SetVolume {
            zone: *zone,
            volume: percent(raw)?,
        }),
        CommandBinding::ZoneVolumeUp(zone) => {
            switch(raw)?.then(|| Command::VolumeUp { zone: *zone })
        }
        CommandBinding::ZoneVolumeDown(zone) => {
            switch(raw)?.then(|| Command::VolumeDown { zone: *zone })
        }
        CommandBinding::ZoneMute(zone) => Some(Command::SetMute {
            zone: *zone,
            muted: switch(raw)?,
        }),
        CommandBinding::ZoneMuteToggle(zone) => {
            switch(raw)?.then(|| Command::ToggleMute { zone: *zone })
        }
        CommandBinding::ZoneShuffle(zone) => Some(Command::SetShuffle {
            zone: *zone,
            enabled: switch(raw)?,
        }),
        CommandBinding::ZoneRepeatTrack(zone) => Some(Command::SetRepeatTrack {
            zone: *zone,
            enabled: switch(raw)?,
        }),
        CommandBinding::ZoneRepeatPlaylist(zone) => Some(Command::SetRepeatPlaylist {
            zone: *zone,
            enabled: switch(raw)?,
        }),
        CommandBinding::ClientVolume(mac) => Some(Command::SetClientVolume {
            mac: mac.clone(),
            volume: percent(raw)?,
        }),
        CommandBinding::ClientMute(mac) => Some(Command::SetClientMute {
            mac: mac.clone(),
            muted: switch(raw)?,
        }),
    };
    Ok(command)
}

/// Status address payload for an event, when the event maps to one.
pub fn status_write_for_event(
    bindings: &KnxBindings,
    event: &StatusEvent,
) -> Option<(GroupAddress, GroupValue, DptId)> {
    let find = |wanted: &StatusBinding| {
        bindings
            .status
            .iter()
            .find(|(_, binding)| *binding == wanted)
            .map(|(address, _)| *address)
    };
    match event {
        StatusEvent::VolumeChanged { zone, volume } => find(&StatusBinding::ZoneVolume(*zone))
            .map(|a| (a, GroupValue::U8(*volume), DPT_PERCENT)),
        StatusEvent::MuteChanged { zone, muted } => find(&StatusBinding::ZoneMute(*zone))
            .map(|a| (a, GroupValue::Bool(*muted), DPT_SWITCH)),
        StatusEvent::PlaybackChanged { zone, state } => find(&StatusBinding::ZonePlaying(*zone))
            .map(|a| {
                (
                    a,
                    GroupValue::Bool(*state == PlaybackState::Playing),
                    DPT_SWITCH,
                )
            }),
        StatusEvent::ClientVolumeChanged { mac, volume } => {
            find(&StatusBinding::ClientVolume(mac.clone()))
                .map(|a| (a, GroupValue::U8(*volume), DPT_PERCENT))
        }
        StatusEvent::ClientMuteChanged { mac, muted } => {
            find(&StatusBinding::ClientMute(mac.clone()))
                .map(|a| (a, GroupValue::Bool(*muted), DPT_SWITCH))
        }
        _ => None,
    }
}

// ── service ───────────────────────────────────────────────────────────────────

pub struct KnxService {
    link: KnxLink,
    bindings: Arc<KnxBindings>,
}

impl KnxService {
    /// Wire the inbound task and return the status sink for the queue.
    pub fn start(
        link: KnxLink,
        bindings: KnxBindings,
        dispatcher: Arc<Dispatcher>,
        zones: ZoneManager,
        clients: Option<watch::Receiver<Vec<ClientState>>>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let bindings = Arc::new(bindings);
        let service = Arc::new(Self {
            link: link.clone(),
            bindings: bindings.clone(),
        });

        tokio::spawn(inbound_task(
            link,
            bindings,
            dispatcher,
            zones,
            clients,
            cancel,
        ));
        service
    }
}

#[async_trait]
impl StatusSink for KnxService {
    fn name(&self) -> &'static str {
        "knx"
    }

    async fn deliver(&self, event: &StatusEvent) -> Result<()> {
        let Some((address, value, dpt)) = status_write_for_event(&self.bindings, event) else {
            return Ok(());
        };
        self.link.group_write(address, &value, dpt).await
    }
}

async fn inbound_task(
    link: KnxLink,
    bindings: Arc<KnxBindings>,
    dispatcher: Arc<Dispatcher>,
    zones: ZoneManager,
    clients: Option<watch::Receiver<Vec<ClientState>>>,
    cancel: CancellationToken,
) {
    let mut events = link.subscribe();
    info!(
        "knx: listening on {} command and {} status addresses",
        bindings.commands.len(),
        bindings.status.len()
    );

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return,
            frame = events.recv() => match frame {
                Ok(frame) => frame,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!("knx: missed {n} bus telegrams");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return,
            },
        };

        match frame.apci {
            Apci::GroupValueWrite => {
                let Some(binding) = bindings.commands.get(&frame.dst) else {
                    continue;
                };
                match command_for_write(binding, &frame.payload.data()) {
                    Ok(Some(command)) => {
                        debug!("knx: {} → {:?}", frame.dst, command);
                        let env = CommandEnvelope::new(CommandSource::Knx, command);
                        if let Err(e) = dispatcher.dispatch(env).await {
                            warn!("knx: command from {} failed: {e}", frame.dst);
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!("knx: bad payload on {}: {e}", frame.dst),
                }
            }
            Apci::GroupValueRead => {
                let Some(binding) = bindings.status.get(&frame.dst) else {
                    continue;
                };
                let Some((value, dpt)) = current_status(binding, &zones, clients.as_ref()) else {
                    continue;
                };
                match dpt::encode(&value, dpt) {
                    Ok(bytes) => {
                        let response =
                            CemiFrame::group_response(frame.dst, Payload::for_dpt(bytes, dpt));
                        if let Err(e) = link.send(response).await {
                            debug!("knx: response on {} failed: {e}", frame.dst);
                        }
                    }
                    Err(e) => warn!("knx: cannot encode status for {}: {e}", frame.dst),
                }
            }
            Apci::GroupValueResponse => {}
        }
    }
}

fn current_status(
    binding: &StatusBinding,
    zones: &ZoneManager,
    clients: Option<&watch::Receiver<Vec<ClientState>>>,
) -> Option<(GroupValue, DptId)> {
    match binding {
        StatusBinding::ZoneVolume(zone) => zones
            .snapshot(*zone)
            .map(|z| (GroupValue::U8(z.volume), DPT_PERCENT)),
        StatusBinding::ZoneMute(zone) => zones
            .snapshot(*zone)
            .map(|z| (GroupValue::Bool(z.muted), DPT_SWITCH)),
        StatusBinding::ZonePlaying(zone) => zones.snapshot(*zone).map(|z| {
            (
                GroupValue::Bool(z.playback == PlaybackState::Playing),
                DPT_SWITCH,
            )
        }),
        StatusBinding::ClientVolume(mac) => clients?
            .borrow()
            .iter()
            .find(|c| &c.mac == mac)
            .map(|c| (GroupValue::U8(c.volume), DPT_PERCENT)),
        StatusBinding::ClientMute(mac) => clients?
            .borrow()
            .iter()
            .find(|c| &c.mac == mac)
            .map(|c| (GroupValue::Bool(c.muted), DPT_SWITCH)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use snapdog_core::config::{ClientKnxConfig, ClientMqttConfig, ZoneKnxConfig, ZoneMqttConfig};

    fn ga(s: &str) -> GroupAddress {
        s.parse().unwrap()
    }

    fn zone_config() -> ZoneConfig {
        ZoneConfig {
            index: 1,
            name: "Kitchen".into(),
            sink: "/snapsinks/zone1".into(),
            mqtt: ZoneMqttConfig::defaults(1),
            knx: ZoneKnxConfig {
                enabled: true,
                play: Some(ga("1/1/1")),
                volume: Some(ga("1/1/2")),
                volume_status: Some(ga("1/1/3")),
                mute: Some(ga("1/1/4")),
                mute_status: Some(ga("1/1/5")),
                ..Default::default()
            },
        }
    }

    fn client_config() -> ClientConfig {
        ClientConfig {
            index: 1,
            name: "Speaker".into(),
            mac: "aa:bb:cc:00:11:22".parse().unwrap(),
            default_zone: Some(1),
            mqtt: ClientMqttConfig::defaults(1),
            knx: ClientKnxConfig {
                enabled: true,
                volume: Some(ga("2/1/1")),
                volume_status: Some(ga("2/1/2")),
                mute: None,
                mute_status: None,
            },
        }
    }

    #[test]
    fn bindings_from_config() {
        let bindings = KnxBindings::from_config(&[zone_config()], &[client_config()]);
        assert_eq!(
            bindings.commands.get(&ga("1/1/1")),
            Some(&CommandBinding::ZonePlay(1))
        );
        assert_eq!(
            bindings.status.get(&ga("1/1/3")),
            Some(&StatusBinding::ZoneVolume(1))
        );
        assert_eq!(
            bindings.commands.get(&ga("2/1/1")),
            Some(&CommandBinding::ClientVolume(
                "aa:bb:cc:00:11:22".parse().unwrap()
            ))
        );
        assert!(bindings.commands.get(&ga("3/3/3")).is_none());
    }

    #[test]
    fn disabled_zone_contributes_nothing() {
        let mut zone = zone_config();
        zone.knx.enabled = false;
        let bindings = KnxBindings::from_config(&[zone], &[]);
        assert!(bindings.is_empty());
    }

    #[test]
    fn play_write_true_becomes_play() {
        let command = command_for_write(&CommandBinding::ZonePlay(1), &[0x01]).unwrap();
        assert_eq!(command, Some(Command::Play { zone: 1, track: None }));
        let command = command_for_write(&CommandBinding::ZonePlay(1), &[0x00]).unwrap();
        assert_eq!(command, Some(Command::Pause { zone: 1 }));
    }

    #[test]
    fn volume_write_scales() {
        // 0xBF = 191 → 75 %
        let command = command_for_write(&CommandBinding::ZoneVolume(2), &[0xBF]).unwrap();
        assert_eq!(command, Some(Command::SetVolume { zone: 2, volume: 75 }));
    }

    #[test]
    fn trigger_false_is_a_no_op() {
        assert_eq!(
            command_for_write(&CommandBinding::ZoneNext(1), &[0x00]).unwrap(),
            None
        );
        assert_eq!(
            command_for_write(&CommandBinding::ZoneMuteToggle(1), &[0x00]).unwrap(),
            None
        );
    }

    #[test]
    fn wrong_length_payload_fails() {
        assert!(command_for_write(&CommandBinding::ZoneVolume(1), &[0x00, 0x01]).is_err());
    }

    #[test]
    fn status_events_map_to_addresses() {
        let bindings = KnxBindings::from_config(&[zone_config()], &[client_config()]);

        let (address, value, dpt) = status_write_for_event(
            &bindings,
            &StatusEvent::VolumeChanged { zone: 1, volume: 75 },
        )
        .unwrap();
        assert_eq!(address, ga("1/1/3"));
        assert_eq!(value, GroupValue::U8(75));
        assert_eq!(dpt, DPT_PERCENT);
        // and the wire byte is the scaled form
        assert_eq!(dpt::encode(&value, dpt).unwrap(), vec![0xBF]);

        let (address, value, _) = status_write_for_event(
            &bindings,
            &StatusEvent::MuteChanged { zone: 1, muted: true },
        )
        .unwrap();
        assert_eq!(address, ga("1/1/5"));
        assert_eq!(value, GroupValue::Bool(true));

        // events without a mapped address produce no write
        assert!(status_write_for_event(
            &bindings,
            &StatusEvent::VolumeChanged { zone: 9, volume: 1 },
        )
        .is_none());
        assert!(status_write_for_event(
            &bindings,
            &StatusEvent::PositionTick {
                zone: 1,
                position_ms: 0,
                duration_ms: None,
                progress: 0.0
            },
        )
        .is_none());
    }
}
