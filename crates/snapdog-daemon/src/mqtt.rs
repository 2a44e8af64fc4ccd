//! MQTT surface of the command/status bus.
//!
//! Subscribes to every configured `…/set` topic, parses payloads into typed
//! commands with `Source = Mqtt`, and publishes status events onto the
//! configured status topics: QoS 1 everywhere, retained for state-like
//! topics, unretained for edges (position ticks, errors).  Availability uses
//! a retained LWT: `offline` as the will, `online` published on connect.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, LastWill, MqttOptions, Packet, QoS, Transport};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use snapdog_core::command::{
    ClientMac, Command, CommandEnvelope, CommandSource, StatusEvent,
};
use snapdog_core::config::{ClientConfig, MqttConfig, ZoneConfig};
use snapdog_core::{Error, Result};

use crate::dispatcher::Dispatcher;
use crate::notify::StatusSink;

// ── topic map ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum CommandTopic {
    ZoneControl(usize),
    ZoneVolumeSet(usize),
    ZoneMuteSet(usize),
    ZoneShuffleSet(usize),
    ZoneRepeatTrackSet(usize),
    ZoneRepeatPlaylistSet(usize),
    ZonePlaylistSet(usize),
    ClientVolumeSet(ClientMac),
    ClientMuteSet(ClientMac),
    ClientLatencySet(ClientMac),
    ClientZoneSet(ClientMac),
}

/// Resolved topic layout: inbound command topics and outbound status topics.
#[derive(Debug, Default)]
pub struct TopicMap {
    commands: HashMap<String, CommandTopic>,
    zone_status: HashMap<usize, ZoneStatusTopics>,
    client_status: HashMap<ClientMac, ClientStatusTopics>,
    error_topic: String,
}

#[derive(Debug, Clone)]
struct ZoneStatusTopics {
    state: String,
    volume: String,
    mute: String,
    shuffle: String,
    repeat_track: String,
    repeat_playlist: String,
    playlist: String,
    track: String,
    track_title: String,
    track_artist: String,
    position: String,
}

#[derive(Debug, Clone)]
struct ClientStatusTopics {
    volume: String,
    mute: String,
    latency: String,
    zone: String,
    connected: String,
}

fn join(base: &str, middle: &str, leaf: &str) -> String {
    format!("{base}/{middle}/{leaf}")
}

impl TopicMap {
    pub fn from_config(base: &str, zones: &[ZoneConfig], clients: &[ClientConfig]) -> Self {
        let mut map = Self {
            error_topic: format!("{base}/error"),
            ..Self::default()
        };

        for zone in zones {
            let z = zone.index;
            let m = &zone.mqtt;
            let mid = &m.base_topic;
            map.commands
                .insert(join(base, mid, &m.control_set_topic), CommandTopic::ZoneControl(z));
            map.commands
                .insert(join(base, mid, &m.volume_set_topic), CommandTopic::ZoneVolumeSet(z));
            map.commands
                .insert(join(base, mid, &m.mute_set_topic), CommandTopic::ZoneMuteSet(z));
            map.commands
                .insert(join(base, mid, &m.shuffle_set_topic), CommandTopic::ZoneShuffleSet(z));
            map.commands.insert(
                join(base, mid, &m.repeat_track_set_topic),
                CommandTopic::ZoneRepeatTrackSet(z),
            );
            map.commands.insert(
                join(base, mid, &m.repeat_playlist_set_topic),
                CommandTopic::ZoneRepeatPlaylistSet(z),
            );
            map.commands
                .insert(join(base, mid, &m.playlist_set_topic), CommandTopic::ZonePlaylistSet(z));

            let track = join(base, mid, &m.track_topic);
            map.zone_status.insert(
                z,
                ZoneStatusTopics {
                    state: join(base, mid, &m.state_topic),
                    volume: join(base, mid, &m.volume_topic),
                    mute: join(base, mid, &m.mute_topic),
                    shuffle: join(base, mid, &m.shuffle_topic),
                    repeat_track: join(base, mid, &m.repeat_track_topic),
                    repeat_playlist: join(base, mid, &m.repeat_playlist_topic),
                    playlist: join(base, mid, &m.playlist_topic),
                    track_title: format!("{track}/title"),
                    track_artist: format!("{track}/artist"),
                    track,
                    position: join(base, mid, &m.position_topic),
                },
            );
        }

        for client in clients {
            let m = &client.mqtt;
            let mid = &m.base_topic;
            let mac = &client.mac;
            map.commands.insert(
                join(base, mid, &m.volume_set_topic),
                CommandTopic::ClientVolumeSet(mac.clone()),
            );
            map.commands.insert(
                join(base, mid, &m.mute_set_topic),
                CommandTopic::ClientMuteSet(mac.clone()),
            );
            map.commands.insert(
                join(base, mid, &m.latency_set_topic),
                CommandTopic::ClientLatencySet(mac.clone()),
            );
            map.commands.insert(
                join(base, mid, &m.zone_set_topic),
                CommandTopic::ClientZoneSet(mac.clone()),
            );
            map.client_status.insert(
                mac.clone(),
                ClientStatusTopics {
                    volume: join(base, mid, &m.volume_topic),
                    mute: join(base, mid, &m.mute_topic),
                    latency: join(base, mid, &m.latency_topic),
                    zone: join(base, mid, &m.zone_topic),
                    connected: join(base, mid, &m.connected_topic),
                },
            );
        }
        map
    }

    pub fn command_topics(&self) -> impl Iterator<Item = &str> {
        self.commands.keys().map(String::as_str)
    }

    pub fn resolve(&self, topic: &str) -> Option<&CommandTopic> {
        self.commands.get(topic)
    }
}

// ── payload parsing ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoolPayload {
    Value(bool),
    Toggle,
}

pub fn parse_bool_payload(payload: &str) -> Result<BoolPayload> {
    match payload.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "on" => Ok(BoolPayload::Value(true)),
        "false" | "0" | "off" => Ok(BoolPayload::Value(false)),
        "toggle" => Ok(BoolPayload::Toggle),
        other => Err(Error::protocol(format!("'{other}' is not a boolean payload"))),
    }
}

fn parse_int_payload(payload: &str, min: i64, max: i64) -> Result<i64> {
    let value: i64 = payload
        .trim()
        .parse()
        .map_err(|_| Error::protocol(format!("'{}' is not a number", payload.trim())))?;
    if value < min || value > max {
        return Err(Error::protocol(format!(
            "{value} out of range {min}..{max}"
        )));
    }
    Ok(value)
}

/// Translate one inbound publish into a command.
pub fn command_for_publish(topic: &CommandTopic, payload: &str) -> Result<Command> {
    match topic {
        CommandTopic::ZoneControl(zone) => match payload.trim().to_ascii_lowercase().as_str() {
            "play" => Ok(Command::Play { zone: *zone, track: None }),
            "pause" => Ok(Command::Pause { zone: *zone }),
            "stop" => Ok(Command::Stop { zone: *zone }),
            "next" => Ok(Command::Next { zone: *zone }),
            "previous" | "prev" => Ok(Command::Prev { zone: *zone }),
            other => Err(Error::protocol(format!("unknown transport command '{other}'"))),
        },
        CommandTopic::ZoneVolumeSet(zone) => Ok(Command::SetVolume {
            zone: *zone,
            volume: parse_int_payload(payload, 0, 100)? as u8,
        }),
        CommandTopic::ZoneMuteSet(zone) => Ok(match parse_bool_payload(payload)? {
            BoolPayload::Value(muted) => Command::SetMute { zone: *zone, muted },
            BoolPayload::Toggle => Command::ToggleMute { zone: *zone },
        }),
        CommandTopic::ZoneShuffleSet(zone) => match parse_bool_payload(payload)? {
            BoolPayload::Value(enabled) => Ok(Command::SetShuffle { zone: *zone, enabled }),
            BoolPayload::Toggle => Err(Error::protocol("shuffle does not accept toggle")),
        },
        CommandTopic::ZoneRepeatTrackSet(zone) => match parse_bool_payload(payload)? {
            BoolPayload::Value(enabled) => Ok(Command::SetRepeatTrack { zone: *zone, enabled }),
            BoolPayload::Toggle => Err(Error::protocol("repeat does not accept toggle")),
        },
        CommandTopic::ZoneRepeatPlaylistSet(zone) => match parse_bool_payload(payload)? {
            BoolPayload::Value(enabled) => Ok(Command::SetRepeatPlaylist { zone: *zone, enabled }),
            BoolPayload::Toggle => Err(Error::protocol("repeat does not accept toggle")),
        },
        CommandTopic::ZonePlaylistSet(zone) => {
            let id = payload.trim();
            if id.is_empty() {
                return Err(Error::protocol("empty playlist id"));
            }
            Ok(Command::SelectPlaylist {
                zone: *zone,
                id: id.to_string(),
            })
        }
        CommandTopic::ClientVolumeSet(mac) => Ok(Command::SetClientVolume {
            mac: mac.clone(),
            volume: parse_int_payload(payload, 0, 100)? as u8,
        }),
        CommandTopic::ClientMuteSet(mac) => Ok(match parse_bool_payload(payload)? {
            BoolPayload::Value(muted) => Command::SetClientMute { mac: mac.clone(), muted },
            BoolPayload::Toggle => Command::ToggleClientMute { mac: mac.clone() },
        }),
        CommandTopic::ClientLatencySet(mac) => Ok(Command::SetClientLatency {
            mac: mac.clone(),
            latency_ms: parse_int_payload(payload, -10_000, 10_000)? as i32,
        }),
        CommandTopic::ClientZoneSet(mac) => Ok(Command::AssignClientToZone {
            mac: mac.clone(),
            zone: parse_int_payload(payload, 1, 256)? as usize,
        }),
    }
}

/// Outbound publishes for a status event: `(topic, payload, retain)`.
pub fn publishes_for_event(map: &TopicMap, event: &StatusEvent) -> Vec<(String, String, bool)> {
    let retain = event.is_state_like();
    match event {
        StatusEvent::PlaybackChanged { zone, state } => map
            .zone_status
            .get(zone)
            .map(|t| vec![(t.state.clone(), state.to_string(), retain)])
            .unwrap_or_default(),
        StatusEvent::VolumeChanged { zone, volume } => map
            .zone_status
            .get(zone)
            .map(|t| vec![(t.volume.clone(), volume.to_string(), retain)])
            .unwrap_or_default(),
        StatusEvent::MuteChanged { zone, muted } => map
            .zone_status
            .get(zone)
            .map(|t| vec![(t.mute.clone(), muted.to_string(), retain)])
            .unwrap_or_default(),
        StatusEvent::ShuffleChanged { zone, enabled } => map
            .zone_status
            .get(zone)
            .map(|t| vec![(t.shuffle.clone(), enabled.to_string(), retain)])
            .unwrap_or_default(),
        StatusEvent::RepeatTrackChanged { zone, enabled } => map
            .zone_status
            .get(zone)
            .map(|t| vec![(t.repeat_track.clone(), enabled.to_string(), retain)])
            .unwrap_or_default(),
        StatusEvent::RepeatPlaylistChanged { zone, enabled } => map
            .zone_status
            .get(zone)
            .map(|t| vec![(t.repeat_playlist.clone(), enabled.to_string(), retain)])
            .unwrap_or_default(),
        StatusEvent::PlaylistChanged { zone, playlist_id, .. } => map
            .zone_status
            .get(zone)
            .map(|t| vec![(t.playlist.clone(), playlist_id.clone(), retain)])
            .unwrap_or_default(),
        StatusEvent::TrackChanged { zone, track } => map
            .zone_status
            .get(zone)
            .map(|t| {
                vec![
                    (
                        t.track.clone(),
                        serde_json::to_string(track).unwrap_or_default(),
                        retain,
                    ),
                    (t.track_title.clone(), track.title.clone(), retain),
                    (t.track_artist.clone(), track.artist.clone(), retain),
                ]
            })
            .unwrap_or_default(),
        StatusEvent::PositionTick {
            zone,
            position_ms,
            duration_ms,
            progress,
        } => map
            .zone_status
            .get(zone)
            .map(|t| {
                let payload = serde_json::json!({
                    "position_ms": position_ms,
                    "duration_ms": duration_ms,
                    "progress": progress,
                });
                vec![(t.position.clone(), payload.to_string(), false)]
            })
            .unwrap_or_default(),
        StatusEvent::ClientVolumeChanged { mac, volume } => map
            .client_status
            .get(mac)
            .map(|t| vec![(t.volume.clone(), volume.to_string(), retain)])
            .unwrap_or_default(),
        StatusEvent::ClientMuteChanged { mac, muted } => map
            .client_status
            .get(mac)
            .map(|t| vec![(t.mute.clone(), muted.to_string(), retain)])
            .unwrap_or_default(),
        StatusEvent::ClientLatencyChanged { mac, latency_ms } => map
            .client_status
            .get(mac)
            .map(|t| vec![(t.latency.clone(), latency_ms.to_string(), retain)])
            .unwrap_or_default(),
        StatusEvent::ClientZoneChanged { mac, zone } => map
            .client_status
            .get(mac)
            .map(|t| vec![(t.zone.clone(), zone.to_string(), retain)])
            .unwrap_or_default(),
        StatusEvent::ClientConnected { mac, connected } => map
            .client_status
            .get(mac)
            .map(|t| vec![(t.connected.clone(), connected.to_string(), retain)])
            .unwrap_or_default(),
        StatusEvent::Error {
            kind,
            detail,
            correlation_id,
        } => {
            let payload = serde_json::json!({
                "kind": kind,
                "detail": detail,
                "correlation_id": correlation_id.map(|id| id.to_string()),
            });
            vec![(map.error_topic.clone(), payload.to_string(), false)]
        }
        StatusEvent::CatalogueReloaded { .. } | StatusEvent::ConnectionStateChanged { .. } => {
            Vec::new()
        }
    }
}

// ── retained dedupe ───────────────────────────────────────────────────────────

/// Fingerprints of the last payload sent per retained topic.  Re-publishing
/// an identical retained value only churns the broker, so those are skipped;
/// unretained (edge) topics always go out.
#[derive(Default)]
pub struct RetainedCache {
    fingerprints: std::sync::Mutex<HashMap<String, u64>>,
}

impl RetainedCache {
    /// Records the payload and says whether it needs publishing.
    pub fn should_publish(&self, topic: &str, payload: &str) -> bool {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};
        let mut hasher = DefaultHasher::new();
        payload.hash(&mut hasher);
        let fingerprint = hasher.finish();

        let mut fingerprints = self.fingerprints.lock().unwrap();
        match fingerprints.insert(topic.to_string(), fingerprint) {
            Some(previous) => previous != fingerprint,
            None => true,
        }
    }
}

// ── adapter ───────────────────────────────────────────────────────────────────

pub struct MqttAdapter {
    client: AsyncClient,
    topics: Arc<TopicMap>,
    retained: RetainedCache,
}

impl MqttAdapter {
    /// Build the client, spawn the event loop, and return the status sink.
    pub fn start(
        config: &MqttConfig,
        topics: TopicMap,
        dispatcher: Arc<Dispatcher>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let availability_topic = format!("{}/{}", config.base_topic, config.status_topic);

        let mut options = MqttOptions::new(
            config.client_id.clone(),
            config.broker_address.clone(),
            config.port,
        );
        options.set_keep_alive(Duration::from_secs(config.keep_alive_seconds));
        options.set_last_will(LastWill::new(
            &availability_topic,
            "offline",
            QoS::AtLeastOnce,
            true,
        ));
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            options.set_credentials(username.clone(), password.clone());
        }
        if config.ssl_enabled {
            options.set_transport(Transport::tls_with_default_config());
        }

        let (client, eventloop) = AsyncClient::new(options, 64);
        let topics = Arc::new(topics);
        let adapter = Arc::new(Self {
            client: client.clone(),
            topics: topics.clone(),
            retained: RetainedCache::default(),
        });

        let reconnect_delay =
            Duration::from_millis(config.resilience.connection.retry_delay_ms.max(250));
        tokio::spawn(event_loop_task(
            client,
            eventloop,
            topics,
            dispatcher,
            availability_topic,
            reconnect_delay,
            cancel,
        ));
        adapter
    }
}

#[async_trait]
impl StatusSink for MqttAdapter {
    fn name(&self) -> &'static str {
        "mqtt"
    }

    async fn deliver(&self, event: &StatusEvent) -> Result<()> {
        for (topic, payload, retain) in publishes_for_event(&self.topics, event) {
            if retain && !self.retained.should_publish(&topic, &payload) {
                continue;
            }
            self.client
                .publish(topic, QoS::AtLeastOnce, retain, payload)
                .await
                .map_err(|e| Error::transport(format!("mqtt publish: {e}")))?;
        }
        Ok(())
    }
}

async fn event_loop_task(
    client: AsyncClient,
    mut eventloop: rumqttc::EventLoop,
    topics: Arc<TopicMap>,
    dispatcher: Arc<Dispatcher>,
    availability_topic: String,
    reconnect_delay: Duration,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => {
                // best effort: leave a clean offline marker instead of the will
                let _ = client
                    .publish(&availability_topic, QoS::AtLeastOnce, true, "offline")
                    .await;
                let _ = client.disconnect().await;
                info!("mqtt: adapter stopped");
                return;
            }
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("mqtt: connected, subscribing {} command topics", topics.commands.len());
                for topic in topics.command_topics() {
                    if let Err(e) = client.subscribe(topic, QoS::AtLeastOnce).await {
                        warn!("mqtt: subscribe {topic} failed: {e}");
                    }
                }
                let _ = client
                    .publish(&availability_topic, QoS::AtLeastOnce, true, "online")
                    .await;
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let payload = String::from_utf8_lossy(&publish.payload).to_string();
                let Some(binding) = topics.resolve(&publish.topic) else {
                    continue;
                };
                match command_for_publish(binding, &payload) {
                    Ok(command) => {
                        debug!("mqtt: {} → {:?}", publish.topic, command);
                        let env = CommandEnvelope::new(CommandSource::Mqtt, command);
                        if let Err(e) = dispatcher.dispatch(env).await {
                            debug!("mqtt: command from {} failed: {e}", publish.topic);
                        }
                    }
                    Err(e) => warn!("mqtt: bad payload on {}: {e}", publish.topic),
                }
            }
            Ok(_) => {}
            Err(e) => {
                warn!("mqtt: connection error, retrying in {reconnect_delay:?}: {e}");
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(reconnect_delay) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use snapdog_core::command::{PlaybackState, TrackInfo};
    use snapdog_core::config::{ClientKnxConfig, ClientMqttConfig, ZoneKnxConfig, ZoneMqttConfig};

    fn zone(index: usize) -> ZoneConfig {
        ZoneConfig {
            index,
            name: format!("Zone {index}"),
            sink: format!("/snapsinks/zone{index}"),
            mqtt: ZoneMqttConfig::defaults(index),
            knx: ZoneKnxConfig::default(),
        }
    }

    fn client() -> ClientConfig {
        ClientConfig {
            index: 1,
            name: "Speaker".into(),
            mac: "aa:bb:cc:00:11:22".parse().unwrap(),
            default_zone: Some(1),
            mqtt: ClientMqttConfig::defaults(1),
            knx: ClientKnxConfig::default(),
        }
    }

    fn map() -> TopicMap {
        TopicMap::from_config("snapdog", &[zone(1), zone(2)], &[client()])
    }

    #[test]
    fn command_topic_resolution() {
        let map = map();
        assert_eq!(
            map.resolve("snapdog/zone/1/volume/set"),
            Some(&CommandTopic::ZoneVolumeSet(1))
        );
        assert_eq!(
            map.resolve("snapdog/zone/2/control/set"),
            Some(&CommandTopic::ZoneControl(2))
        );
        assert_eq!(
            map.resolve("snapdog/client/1/mute/set"),
            Some(&CommandTopic::ClientMuteSet("aa:bb:cc:00:11:22".parse().unwrap()))
        );
        assert_eq!(map.resolve("snapdog/zone/1/volume"), None, "status topics are not commands");
    }

    #[test]
    fn volume_payload_parsing() {
        let topic = CommandTopic::ZoneVolumeSet(1);
        assert_eq!(
            command_for_publish(&topic, "42").unwrap(),
            Command::SetVolume { zone: 1, volume: 42 }
        );
        assert!(command_for_publish(&topic, "142").is_err());
        assert!(command_for_publish(&topic, "-1").is_err());
        assert!(command_for_publish(&topic, "loud").is_err());
    }

    #[test]
    fn bool_payload_spellings() {
        let topic = CommandTopic::ZoneMuteSet(1);
        for (payload, muted) in [("true", true), ("1", true), ("on", true), ("off", false), ("0", false)] {
            assert_eq!(
                command_for_publish(&topic, payload).unwrap(),
                Command::SetMute { zone: 1, muted },
                "payload {payload}"
            );
        }
        assert_eq!(
            command_for_publish(&topic, "toggle").unwrap(),
            Command::ToggleMute { zone: 1 }
        );
        assert!(command_for_publish(&topic, "maybe").is_err());
    }

    #[test]
    fn control_payloads() {
        let topic = CommandTopic::ZoneControl(1);
        assert_eq!(
            command_for_publish(&topic, "play").unwrap(),
            Command::Play { zone: 1, track: None }
        );
        assert_eq!(
            command_for_publish(&topic, "NEXT").unwrap(),
            Command::Next { zone: 1 }
        );
        assert_eq!(
            command_for_publish(&topic, "previous").unwrap(),
            Command::Prev { zone: 1 }
        );
        assert!(command_for_publish(&topic, "rewind").is_err());
    }

    #[test]
    fn volume_event_publishes_retained() {
        let publishes = publishes_for_event(
            &map(),
            &StatusEvent::VolumeChanged { zone: 1, volume: 42 },
        );
        assert_eq!(
            publishes,
            vec![("snapdog/zone/1/volume".to_string(), "42".to_string(), true)]
        );
    }

    #[test]
    fn position_tick_is_not_retained() {
        let publishes = publishes_for_event(
            &map(),
            &StatusEvent::PositionTick {
                zone: 1,
                position_ms: 1000,
                duration_ms: Some(2000),
                progress: 0.5,
            },
        );
        assert_eq!(publishes.len(), 1);
        assert_eq!(publishes[0].0, "snapdog/zone/1/position");
        assert!(!publishes[0].2);
    }

    #[test]
    fn track_event_fans_out_metadata_topics() {
        let track = TrackInfo::radio(0, "FM4", "http://stream.example/fm4");
        let publishes =
            publishes_for_event(&map(), &StatusEvent::TrackChanged { zone: 1, track });
        let topics: Vec<&str> = publishes.iter().map(|(t, _, _)| t.as_str()).collect();
        assert_eq!(
            topics,
            vec![
                "snapdog/zone/1/track",
                "snapdog/zone/1/track/title",
                "snapdog/zone/1/track/artist"
            ]
        );
        assert!(publishes.iter().all(|(_, _, retain)| *retain));
        assert_eq!(publishes[1].1, "FM4");
    }

    #[test]
    fn playback_state_payloads() {
        let publishes = publishes_for_event(
            &map(),
            &StatusEvent::PlaybackChanged { zone: 2, state: PlaybackState::Playing },
        );
        assert_eq!(
            publishes,
            vec![("snapdog/zone/2/state".to_string(), "playing".to_string(), true)]
        );
    }

    #[test]
    fn error_event_goes_to_error_topic_unretained() {
        let publishes = publishes_for_event(
            &map(),
            &StatusEvent::Error {
                kind: "timeout".into(),
                detail: "knx read".into(),
                correlation_id: None,
            },
        );
        assert_eq!(publishes.len(), 1);
        assert_eq!(publishes[0].0, "snapdog/error");
        assert!(!publishes[0].2);
        assert!(publishes[0].1.contains("\"kind\":\"timeout\""));
    }

    #[test]
    fn retained_cache_skips_unchanged_values() {
        let cache = RetainedCache::default();
        assert!(cache.should_publish("snapdog/zone/1/volume", "42"));
        assert!(!cache.should_publish("snapdog/zone/1/volume", "42"));
        assert!(cache.should_publish("snapdog/zone/1/volume", "43"));
        // back to the earlier value is a change again
        assert!(cache.should_publish("snapdog/zone/1/volume", "42"));
        // other topics are tracked independently
        assert!(cache.should_publish("snapdog/zone/2/volume", "42"));
    }

    #[test]
    fn events_for_unknown_zones_publish_nothing() {
        assert!(publishes_for_event(
            &map(),
            &StatusEvent::VolumeChanged { zone: 9, volume: 1 },
        )
        .is_empty());
    }
}
