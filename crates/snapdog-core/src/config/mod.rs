//! Configuration model.
//!
//! The canonical serialization is environment variables with the `SNAPDOG_`
//! prefix; [`Config::from_env`] is a pure function over key/value pairs and
//! [`Config::load`] reads the process environment.  Any unparsable value is a
//! fatal startup error that names the offending key.

mod env;

pub use env::{EnvMap, ENV_PREFIX};

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::audio::AudioFormat;
use crate::error::{Error, Result};
use crate::knx::address::GroupAddress;
use crate::resilience::{Policy, ServicePolicies};

// ── top level ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub system: SystemConfig,
    pub api: ApiConfig,
    pub snapcast: SnapcastConfig,
    pub mqtt: MqttConfig,
    pub knx: KnxConfig,
    pub subsonic: SubsonicConfig,
    pub audio: AudioFormat,
    pub notifications: NotificationConfig,
    pub zones: Vec<ZoneConfig>,
    pub clients: Vec<ClientConfig>,
    pub radios: Vec<RadioStationConfig>,
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::from_env(EnvMap::from_process_env())
    }

    pub fn from_env(env: EnvMap) -> Result<Self> {
        let config = Self {
            system: SystemConfig::from_env(&env)?,
            api: ApiConfig::from_env(&env)?,
            snapcast: SnapcastConfig::from_env(&env)?,
            mqtt: MqttConfig::from_env(&env)?,
            knx: KnxConfig::from_env(&env)?,
            subsonic: SubsonicConfig::from_env(&env)?,
            audio: audio_from_env(&env)?,
            notifications: NotificationConfig::from_env(&env)?,
            zones: zones_from_env(&env)?,
            clients: clients_from_env(&env)?,
            radios: radios_from_env(&env)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn zone(&self, index: usize) -> Option<&ZoneConfig> {
        self.zones.iter().find(|z| z.index == index)
    }

    fn validate(&self) -> Result<()> {
        if self.api.enabled && self.api.auth_enabled && self.api.api_keys.is_empty() {
            return Err(Error::config(
                "SNAPDOG_API_APIKEY_1",
                "auth is enabled but no API keys are configured",
            ));
        }
        if self.mqtt.enabled && self.mqtt.broker_address.is_empty() {
            return Err(Error::config(
                "SNAPDOG_SERVICES_MQTT_BROKER_ADDRESS",
                "missing required value",
            ));
        }
        if self.knx.enabled
            && self.knx.connection_type == KnxConnectionType::Tunnel
            && self.knx.gateway.is_none()
        {
            return Err(Error::config(
                "SNAPDOG_SERVICES_KNX_GATEWAY",
                "tunnel connections need a gateway address",
            ));
        }

        let mut sinks = std::collections::HashSet::new();
        for zone in &self.zones {
            if !sinks.insert(zone.sink.as_str()) {
                return Err(Error::config(
                    format!("SNAPDOG_ZONE_{}_SINK", zone.index),
                    format!("sink path '{}' is used by another zone", zone.sink),
                ));
            }
        }

        let mut macs = std::collections::HashSet::new();
        for client in &self.clients {
            if !macs.insert(client.mac.clone()) {
                return Err(Error::config(
                    format!("SNAPDOG_CLIENT_{}_MAC", client.index),
                    format!("MAC {} is used by another client", client.mac),
                ));
            }
            if let Some(zone) = client.default_zone {
                if self.zone(zone).is_none() {
                    return Err(Error::config(
                        format!("SNAPDOG_CLIENT_{}_DEFAULT_ZONE", client.index),
                        format!("zone {zone} is not configured"),
                    ));
                }
            }
        }
        Ok(())
    }
}

// ── system / api ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    pub log_level: String,
    pub environment: String,
    pub health_checks_enabled: bool,
    pub health_checks_timeout_seconds: u64,
    pub health_checks_tags: Vec<String>,
}

impl SystemConfig {
    fn from_env(env: &EnvMap) -> Result<Self> {
        Ok(Self {
            log_level: env.string_or("SYSTEM_LOG_LEVEL", "info"),
            environment: env.string_or("SYSTEM_ENVIRONMENT", "production"),
            health_checks_enabled: env.bool_or("SYSTEM_HEALTH_CHECKS_ENABLED", true)?,
            health_checks_timeout_seconds: env.parse_or("SYSTEM_HEALTH_CHECKS_TIMEOUT", 5)?,
            health_checks_tags: env.csv("SYSTEM_HEALTH_CHECKS_TAGS"),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub enabled: bool,
    pub port: u16,
    pub bind_address: String,
    pub auth_enabled: bool,
    pub api_keys: Vec<String>,
    /// Requests per second per API key (or per peer when auth is off).
    pub rate_limit_per_second: u32,
}

impl ApiConfig {
    fn from_env(env: &EnvMap) -> Result<Self> {
        Ok(Self {
            enabled: env.bool_or("API_ENABLED", true)?,
            port: env.parse_or("API_PORT", 5000)?,
            bind_address: env.string_or("API_BIND_ADDRESS", "0.0.0.0"),
            auth_enabled: env.bool_or("API_AUTH_ENABLED", false)?,
            api_keys: env.numbered_values("API_APIKEY"),
            rate_limit_per_second: env.parse_or("API_RATE_LIMIT_PER_SECOND", 10)?,
        })
    }
}

// ── services ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapcastConfig {
    pub address: String,
    pub jsonrpc_port: u16,
    pub http_port: u16,
    pub timeout_seconds: u64,
    pub reconnect_interval_seconds: u64,
    pub auto_reconnect: bool,
    /// Overwrite client names on the server with configured names.
    pub sync_names: bool,
    pub periodic_check_interval_ms: u64,
    pub event_debounce_delay_ms: u64,
    pub resilience: ServicePolicies,
}

impl SnapcastConfig {
    fn from_env(env: &EnvMap) -> Result<Self> {
        Ok(Self {
            address: env.string_or("SERVICES_SNAPCAST_ADDRESS", "127.0.0.1"),
            jsonrpc_port: env.parse_or("SERVICES_SNAPCAST_JSONRPC_PORT", 1705)?,
            http_port: env.parse_or("SERVICES_SNAPCAST_HTTP_PORT", 1780)?,
            timeout_seconds: env.parse_or("SERVICES_SNAPCAST_TIMEOUT", 30)?,
            reconnect_interval_seconds: env.parse_or("SERVICES_SNAPCAST_RECONNECT_INTERVAL", 5)?,
            auto_reconnect: env.bool_or("SERVICES_SNAPCAST_AUTO_RECONNECT", true)?,
            sync_names: env.bool_or("SERVICES_SNAPCAST_SYNC_NAMES", false)?,
            periodic_check_interval_ms: env
                .parse_or("SERVICES_SNAPCAST_PERIODIC_CHECK_INTERVAL_MS", 5000)?,
            event_debounce_delay_ms: env
                .parse_or("SERVICES_SNAPCAST_EVENT_DEBOUNCE_DELAY_MS", 500)?,
            resilience: policies_from_env(env, "SERVICES_SNAPCAST")?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    pub enabled: bool,
    pub broker_address: String,
    pub port: u16,
    pub client_id: String,
    pub ssl_enabled: bool,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_seconds: u64,
    pub base_topic: String,
    /// Availability topic under the base topic; carries `online`/`offline`.
    pub status_topic: String,
    pub resilience: ServicePolicies,
}

impl MqttConfig {
    fn from_env(env: &EnvMap) -> Result<Self> {
        Ok(Self {
            enabled: env.bool_or("SERVICES_MQTT_ENABLED", false)?,
            broker_address: env.string_or("SERVICES_MQTT_BROKER_ADDRESS", ""),
            port: env.parse_or("SERVICES_MQTT_PORT", 1883)?,
            client_id: env.string_or("SERVICES_MQTT_CLIENT_ID", "snapdog"),
            ssl_enabled: env.bool_or("SERVICES_MQTT_SSL_ENABLED", false)?,
            username: env.string("SERVICES_MQTT_USERNAME"),
            password: env.string("SERVICES_MQTT_PASSWORD"),
            keep_alive_seconds: env.parse_or("SERVICES_MQTT_KEEP_ALIVE", 60)?,
            base_topic: env.string_or("SERVICES_MQTT_MQTT_BASE_TOPIC", "snapdog"),
            status_topic: env.string_or("SERVICES_MQTT_STATUS_TOPIC", "status"),
            resilience: policies_from_env(env, "SERVICES_MQTT")?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KnxConnectionType {
    Tunnel,
    Router,
    Usb,
}

impl FromStr for KnxConnectionType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tunnel" => Ok(Self::Tunnel),
            "router" => Ok(Self::Router),
            "usb" => Ok(Self::Usb),
            other => Err(format!(
                "unknown connection type '{other}' (tunnel, router, usb)"
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnxConfig {
    pub enabled: bool,
    pub connection_type: KnxConnectionType,
    pub gateway: Option<String>,
    pub multicast_address: String,
    pub usb_device: Option<String>,
    pub port: u16,
    pub timeout_seconds: u64,
    pub auto_reconnect: bool,
    /// ETS group-address export; optional, enriches monitoring and reads.
    pub csv_path: Option<String>,
    pub resilience: ServicePolicies,
}

impl KnxConfig {
    fn from_env(env: &EnvMap) -> Result<Self> {
        Ok(Self {
            enabled: env.bool_or("SERVICES_KNX_ENABLED", false)?,
            connection_type: env
                .parse("SERVICES_KNX_CONNECTION_TYPE")?
                .unwrap_or(KnxConnectionType::Tunnel),
            gateway: env.string("SERVICES_KNX_GATEWAY"),
            multicast_address: env.string_or("SERVICES_KNX_MULTICAST_ADDRESS", "224.0.23.12"),
            usb_device: env.string("SERVICES_KNX_USB_DEVICE"),
            port: env.parse_or("SERVICES_KNX_PORT", 3671)?,
            timeout_seconds: env.parse_or("SERVICES_KNX_TIMEOUT", 10)?,
            auto_reconnect: env.bool_or("SERVICES_KNX_AUTO_RECONNECT", true)?,
            csv_path: env.string("SERVICES_KNX_CSV"),
            resilience: policies_from_env(env, "SERVICES_KNX")?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubsonicConfig {
    pub enabled: bool,
    pub url: String,
    pub username: String,
    pub password: String,
    pub timeout_ms: u64,
    pub resilience: ServicePolicies,
}

impl SubsonicConfig {
    fn from_env(env: &EnvMap) -> Result<Self> {
        let enabled = env.bool_or("SERVICES_SUBSONIC_ENABLED", false)?;
        Ok(Self {
            enabled,
            url: if enabled {
                env.required("SERVICES_SUBSONIC_URL")?
            } else {
                env.string_or("SERVICES_SUBSONIC_URL", "")
            },
            username: if enabled {
                env.required("SERVICES_SUBSONIC_USERNAME")?
            } else {
                env.string_or("SERVICES_SUBSONIC_USERNAME", "")
            },
            password: if enabled {
                env.required("SERVICES_SUBSONIC_PASSWORD")?
            } else {
                env.string_or("SERVICES_SUBSONIC_PASSWORD", "")
            },
            timeout_ms: env.parse_or("SERVICES_SUBSONIC_TIMEOUT", 10_000)?,
            resilience: policies_from_env(env, "SERVICES_SUBSONIC")?,
        })
    }
}

fn audio_from_env(env: &EnvMap) -> Result<AudioFormat> {
    let format = AudioFormat {
        sample_rate: env.parse_or("AUDIO_SAMPLE_RATE", 48_000)?,
        bit_depth: env.parse_or("AUDIO_BIT_DEPTH", 16)?,
        channels: env.parse_or("AUDIO_CHANNELS", 2)?,
        codec: env.string_or("AUDIO_CODEC", "flac"),
        buffer_ms: env.parse_or("AUDIO_BUFFER_MS", 1000)?,
    };
    // surfaces unsupported bit depths at startup instead of first playback
    format
        .pcm_codec()
        .map_err(|_| Error::config("SNAPDOG_AUDIO_BIT_DEPTH", format!("unsupported bit depth {}", format.bit_depth)))?;
    if format.channels == 0 || format.channels > 8 {
        return Err(Error::config(
            "SNAPDOG_AUDIO_CHANNELS",
            format!("{} channels out of range 1..8", format.channels),
        ));
    }
    Ok(format)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    pub max_queue_capacity: usize,
    pub max_concurrency: usize,
    pub max_retry_attempts: u16,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub shutdown_timeout_seconds: u64,
}

impl NotificationConfig {
    fn from_env(env: &EnvMap) -> Result<Self> {
        let cfg = Self {
            max_queue_capacity: env.parse_or("NOTIFICATIONS_MAX_QUEUE_CAPACITY", 1024)?,
            max_concurrency: env.parse_or("NOTIFICATIONS_MAX_CONCURRENCY", 4)?,
            max_retry_attempts: env.parse_or("NOTIFICATIONS_MAX_RETRY_ATTEMPTS", 3)?,
            retry_base_delay_ms: env.parse_or("NOTIFICATIONS_RETRY_BASE_DELAY_MS", 250)?,
            retry_max_delay_ms: env.parse_or("NOTIFICATIONS_RETRY_MAX_DELAY_MS", 10_000)?,
            shutdown_timeout_seconds: env.parse_or("NOTIFICATIONS_SHUTDOWN_TIMEOUT", 5)?,
        };
        if cfg.max_queue_capacity == 0 {
            return Err(Error::config(
                "SNAPDOG_NOTIFICATIONS_MAX_QUEUE_CAPACITY",
                "capacity must be at least 1",
            ));
        }
        if cfg.max_concurrency == 0 {
            return Err(Error::config(
                "SNAPDOG_NOTIFICATIONS_MAX_CONCURRENCY",
                "concurrency must be at least 1",
            ));
        }
        Ok(cfg)
    }
}

fn policies_from_env(env: &EnvMap, service: &str) -> Result<ServicePolicies> {
    Ok(ServicePolicies {
        connection: policy_from_env(env, service, "CONNECTION", Policy::connection_default())?,
        operation: policy_from_env(env, service, "OPERATION", Policy::operation_default())?,
    })
}

fn policy_from_env(env: &EnvMap, service: &str, kind: &str, default: Policy) -> Result<Policy> {
    let key = |name: &str| format!("{service}_RESILIENCE_{kind}_{name}");
    Ok(Policy {
        max_retries: env.parse_or(&key("MAX_RETRIES"), default.max_retries)?,
        retry_delay_ms: env.parse_or(&key("RETRY_DELAY_MS"), default.retry_delay_ms)?,
        backoff: env.parse_or(&key("BACKOFF_TYPE"), default.backoff)?,
        use_jitter: env.bool_or(&key("USE_JITTER"), default.use_jitter)?,
        jitter_percentage: env.parse_or(&key("JITTER_PERCENTAGE"), default.jitter_percentage)?,
        timeout_seconds: env.parse_or(&key("TIMEOUT_SECONDS"), default.timeout_seconds)?,
    })
}

// ── zones ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneConfig {
    pub index: usize,
    pub name: String,
    pub sink: String,
    pub mqtt: ZoneMqttConfig,
    pub knx: ZoneKnxConfig,
}

/// Per-zone MQTT topics, all relative to the zone base topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneMqttConfig {
    pub base_topic: String,
    pub control_set_topic: String,
    pub state_topic: String,
    pub volume_set_topic: String,
    pub volume_topic: String,
    pub mute_set_topic: String,
    pub mute_topic: String,
    pub shuffle_set_topic: String,
    pub shuffle_topic: String,
    pub repeat_track_set_topic: String,
    pub repeat_track_topic: String,
    pub repeat_playlist_set_topic: String,
    pub repeat_playlist_topic: String,
    pub playlist_set_topic: String,
    pub playlist_topic: String,
    pub track_topic: String,
    pub position_topic: String,
}

impl ZoneMqttConfig {
    /// The default topic layout for a zone, without any env overrides.
    pub fn defaults(index: usize) -> Self {
        Self::from_env(&EnvMap::default(), index)
    }

    fn from_env(env: &EnvMap, index: usize) -> Self {
        let key = |name: &str| format!("ZONE_{index}_MQTT_{name}");
        let topic = |name: &str, default: &str| env.string_or(&key(name), default);
        Self {
            base_topic: topic("BASE_TOPIC", &format!("zone/{index}")),
            control_set_topic: topic("CONTROL_SET_TOPIC", "control/set"),
            state_topic: topic("STATE_TOPIC", "state"),
            volume_set_topic: topic("VOLUME_SET_TOPIC", "volume/set"),
            volume_topic: topic("VOLUME_TOPIC", "volume"),
            mute_set_topic: topic("MUTE_SET_TOPIC", "mute/set"),
            mute_topic: topic("MUTE_TOPIC", "mute"),
            shuffle_set_topic: topic("SHUFFLE_SET_TOPIC", "shuffle/set"),
            shuffle_topic: topic("SHUFFLE_TOPIC", "shuffle"),
            repeat_track_set_topic: topic("REPEAT_TRACK_SET_TOPIC", "repeat/track/set"),
            repeat_track_topic: topic("REPEAT_TRACK_TOPIC", "repeat/track"),
            repeat_playlist_set_topic: topic("REPEAT_PLAYLIST_SET_TOPIC", "repeat/playlist/set"),
            repeat_playlist_topic: topic("REPEAT_PLAYLIST_TOPIC", "repeat/playlist"),
            playlist_set_topic: topic("PLAYLIST_SET_TOPIC", "playlist/set"),
            playlist_topic: topic("PLAYLIST_TOPIC", "playlist"),
            track_topic: topic("TRACK_TOPIC", "track"),
            position_topic: topic("POSITION_TOPIC", "position"),
        }
    }
}

/// Per-zone KNX group addresses.  Every field is optional; unmapped commands
/// simply have no KNX surface.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ZoneKnxConfig {
    pub enabled: bool,
    pub play: Option<GroupAddress>,
    pub pause: Option<GroupAddress>,
    pub stop: Option<GroupAddress>,
    pub next: Option<GroupAddress>,
    pub previous: Option<GroupAddress>,
    pub volume: Option<GroupAddress>,
    pub volume_status: Option<GroupAddress>,
    pub volume_up: Option<GroupAddress>,
    pub volume_down: Option<GroupAddress>,
    pub mute: Option<GroupAddress>,
    pub mute_toggle: Option<GroupAddress>,
    pub mute_status: Option<GroupAddress>,
    pub shuffle: Option<GroupAddress>,
    pub repeat_track: Option<GroupAddress>,
    pub repeat_playlist: Option<GroupAddress>,
    pub playing_status: Option<GroupAddress>,
}

impl ZoneKnxConfig {
    fn from_env(env: &EnvMap, index: usize) -> Result<Self> {
        let ga = |name: &str| -> Result<Option<GroupAddress>> {
            let key = format!("ZONE_{index}_KNX_{name}");
            match env.get(&key) {
                None => Ok(None),
                Some(raw) => raw
                    .parse()
                    .map(Some)
                    .map_err(|e| Error::config(format!("{ENV_PREFIX}{key}"), e)),
            }
        };
        Ok(Self {
            enabled: env.bool_or(&format!("ZONE_{index}_KNX_ENABLED"), false)?,
            play: ga("PLAY")?,
            pause: ga("PAUSE")?,
            stop: ga("STOP")?,
            next: ga("NEXT")?,
            previous: ga("PREVIOUS")?,
            volume: ga("VOLUME")?,
            volume_status: ga("VOLUME_STATUS")?,
            volume_up: ga("VOLUME_UP")?,
            volume_down: ga("VOLUME_DOWN")?,
            mute: ga("MUTE")?,
            mute_toggle: ga("MUTE_TOGGLE")?,
            mute_status: ga("MUTE_STATUS")?,
            shuffle: ga("SHUFFLE")?,
            repeat_track: ga("REPEAT_TRACK")?,
            repeat_playlist: ga("REPEAT_PLAYLIST")?,
            playing_status: ga("PLAYING_STATUS")?,
        })
    }
}

fn zones_from_env(env: &EnvMap) -> Result<Vec<ZoneConfig>> {
    let mut zones = Vec::new();
    for index in env.indexed_sections("ZONE") {
        zones.push(ZoneConfig {
            index,
            name: env.string_or(&format!("ZONE_{index}_NAME"), &format!("Zone {index}")),
            sink: env.string_or(&format!("ZONE_{index}_SINK"), &format!("/snapsinks/zone{index}")),
            mqtt: ZoneMqttConfig::from_env(env, index),
            knx: ZoneKnxConfig::from_env(env, index)?,
        });
    }
    Ok(zones)
}

// ── clients ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub index: usize,
    pub name: String,
    pub mac: crate::command::ClientMac,
    pub default_zone: Option<usize>,
    pub mqtt: ClientMqttConfig,
    pub knx: ClientKnxConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientMqttConfig {
    pub base_topic: String,
    pub volume_set_topic: String,
    pub volume_topic: String,
    pub mute_set_topic: String,
    pub mute_topic: String,
    pub latency_set_topic: String,
    pub latency_topic: String,
    pub zone_set_topic: String,
    pub zone_topic: String,
    pub connected_topic: String,
}

impl ClientMqttConfig {
    /// The default topic layout for a client, without any env overrides.
    pub fn defaults(index: usize) -> Self {
        Self::from_env(&EnvMap::default(), index)
    }

    fn from_env(env: &EnvMap, index: usize) -> Self {
        let key = |name: &str| format!("CLIENT_{index}_MQTT_{name}");
        let topic = |name: &str, default: &str| env.string_or(&key(name), default);
        Self {
            base_topic: topic("BASE_TOPIC", &format!("client/{index}")),
            volume_set_topic: topic("VOLUME_SET_TOPIC", "volume/set"),
            volume_topic: topic("VOLUME_TOPIC", "volume"),
            mute_set_topic: topic("MUTE_SET_TOPIC", "mute/set"),
            mute_topic: topic("MUTE_TOPIC", "mute"),
            latency_set_topic: topic("LATENCY_SET_TOPIC", "latency/set"),
            latency_topic: topic("LATENCY_TOPIC", "latency"),
            zone_set_topic: topic("ZONE_SET_TOPIC", "zone/set"),
            zone_topic: topic("ZONE_TOPIC", "zone"),
            connected_topic: topic("CONNECTED_TOPIC", "connected"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientKnxConfig {
    pub enabled: bool,
    pub volume: Option<GroupAddress>,
    pub volume_status: Option<GroupAddress>,
    pub mute: Option<GroupAddress>,
    pub mute_status: Option<GroupAddress>,
}

impl ClientKnxConfig {
    fn from_env(env: &EnvMap, index: usize) -> Result<Self> {
        let ga = |name: &str| -> Result<Option<GroupAddress>> {
            let key = format!("CLIENT_{index}_KNX_{name}");
            match env.get(&key) {
                None => Ok(None),
                Some(raw) => raw
                    .parse()
                    .map(Some)
                    .map_err(|e| Error::config(format!("{ENV_PREFIX}{key}"), e)),
            }
        };
        Ok(Self {
            enabled: env.bool_or(&format!("CLIENT_{index}_KNX_ENABLED"), false)?,
            volume: ga("VOLUME")?,
            volume_status: ga("VOLUME_STATUS")?,
            mute: ga("MUTE")?,
            mute_status: ga("MUTE_STATUS")?,
        })
    }
}

fn clients_from_env(env: &EnvMap) -> Result<Vec<ClientConfig>> {
    let mut clients = Vec::new();
    for index in env.indexed_sections("CLIENT") {
        let mac_key = format!("CLIENT_{index}_MAC");
        let mac: crate::command::ClientMac = env
            .required(&mac_key)?
            .parse()
            .map_err(|e| Error::config(format!("{ENV_PREFIX}{mac_key}"), e))?;
        clients.push(ClientConfig {
            index,
            name: env.string_or(&format!("CLIENT_{index}_NAME"), &format!("Client {index}")),
            mac,
            default_zone: env.parse(&format!("CLIENT_{index}_DEFAULT_ZONE"))?,
            mqtt: ClientMqttConfig::from_env(env, index),
            knx: ClientKnxConfig::from_env(env, index)?,
        });
    }
    Ok(clients)
}

// ── radio stations ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RadioStationConfig {
    pub index: usize,
    pub name: String,
    pub url: String,
}

fn radios_from_env(env: &EnvMap) -> Result<Vec<RadioStationConfig>> {
    let mut radios = Vec::new();
    for index in env.indexed_sections("RADIO") {
        radios.push(RadioStationConfig {
            index,
            name: env.string_or(&format!("RADIO_{index}_NAME"), &format!("Radio {index}")),
            url: env.required(&format!("RADIO_{index}_URL"))?,
        });
    }
    Ok(radios)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::Backoff;

    fn env(pairs: &[(&str, &str)]) -> EnvMap {
        EnvMap::from_pairs(pairs.iter().map(|(k, v)| (*k, v.to_string())))
    }

    #[test]
    fn defaults_without_env() {
        let cfg = Config::from_env(env(&[])).unwrap();
        assert_eq!(cfg.api.port, 5000);
        assert_eq!(cfg.snapcast.jsonrpc_port, 1705);
        assert_eq!(cfg.mqtt.port, 1883);
        assert_eq!(cfg.knx.port, 3671);
        assert_eq!(cfg.knx.multicast_address, "224.0.23.12");
        assert_eq!(cfg.audio.sample_rate, 48_000);
        assert_eq!(cfg.notifications.max_queue_capacity, 1024);
        assert!(cfg.zones.is_empty());
        assert!(!cfg.mqtt.enabled);
        assert!(!cfg.knx.enabled);
    }

    #[test]
    fn full_zone_section() {
        let cfg = Config::from_env(env(&[
            ("SNAPDOG_ZONE_1_NAME", "Kitchen"),
            ("SNAPDOG_ZONE_1_SINK", "/snapsinks/kitchen"),
            ("SNAPDOG_ZONE_1_KNX_ENABLED", "true"),
            ("SNAPDOG_ZONE_1_KNX_PLAY", "1/1/1"),
            ("SNAPDOG_ZONE_1_KNX_VOLUME", "1/1/2"),
            ("SNAPDOG_ZONE_2_NAME", "Bath"),
        ]))
        .unwrap();
        assert_eq!(cfg.zones.len(), 2);
        let kitchen = cfg.zone(1).unwrap();
        assert_eq!(kitchen.name, "Kitchen");
        assert_eq!(kitchen.sink, "/snapsinks/kitchen");
        assert!(kitchen.knx.enabled);
        assert_eq!(kitchen.knx.play, Some("1/1/1".parse().unwrap()));
        assert_eq!(kitchen.mqtt.base_topic, "zone/1");
        assert_eq!(cfg.zone(2).unwrap().sink, "/snapsinks/zone2");
    }

    #[test]
    fn bad_group_address_is_fatal_with_key() {
        let err = Config::from_env(env(&[
            ("SNAPDOG_ZONE_1_NAME", "Kitchen"),
            ("SNAPDOG_ZONE_1_KNX_PLAY", "99/1/1"),
        ]))
        .unwrap_err();
        let Error::Config { key, .. } = err else {
            panic!("expected config error, got {err:?}");
        };
        assert_eq!(key, "SNAPDOG_ZONE_1_KNX_PLAY");
    }

    #[test]
    fn resilience_subtree() {
        let cfg = Config::from_env(env(&[
            ("SNAPDOG_SERVICES_KNX_RESILIENCE_CONNECTION_MAX_RETRIES", "5"),
            ("SNAPDOG_SERVICES_KNX_RESILIENCE_CONNECTION_BACKOFF_TYPE", "linear"),
            ("SNAPDOG_SERVICES_KNX_RESILIENCE_CONNECTION_USE_JITTER", "false"),
            ("SNAPDOG_SERVICES_KNX_RESILIENCE_OPERATION_TIMEOUT_SECONDS", "2"),
        ]))
        .unwrap();
        let conn = cfg.knx.resilience.connection;
        assert_eq!(conn.max_retries, 5);
        assert_eq!(conn.backoff, Backoff::Linear);
        assert!(!conn.use_jitter);
        assert_eq!(cfg.knx.resilience.operation.timeout_seconds, 2);
        // untouched values keep their defaults
        assert_eq!(conn.retry_delay_ms, 2000);
    }

    #[test]
    fn clients_need_a_mac() {
        let err = Config::from_env(env(&[("SNAPDOG_CLIENT_1_NAME", "Speaker")])).unwrap_err();
        assert!(matches!(err, Error::Config { .. }));

        let cfg = Config::from_env(env(&[
            ("SNAPDOG_CLIENT_1_NAME", "Speaker"),
            ("SNAPDOG_CLIENT_1_MAC", "AA:BB:CC:00:11:22"),
        ]))
        .unwrap();
        assert_eq!(cfg.clients[0].mac.as_str(), "aa:bb:cc:00:11:22");
    }

    #[test]
    fn client_default_zone_must_exist() {
        let err = Config::from_env(env(&[
            ("SNAPDOG_CLIENT_1_MAC", "aa:bb:cc:00:11:22"),
            ("SNAPDOG_CLIENT_1_DEFAULT_ZONE", "4"),
        ]))
        .unwrap_err();
        let Error::Config { key, .. } = err else {
            panic!("expected config error");
        };
        assert_eq!(key, "SNAPDOG_CLIENT_1_DEFAULT_ZONE");
    }

    #[test]
    fn duplicate_sinks_rejected() {
        let err = Config::from_env(env(&[
            ("SNAPDOG_ZONE_1_SINK", "/snapsinks/shared"),
            ("SNAPDOG_ZONE_2_SINK", "/snapsinks/shared"),
        ]))
        .unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }

    #[test]
    fn auth_requires_keys() {
        let err = Config::from_env(env(&[("SNAPDOG_API_AUTH_ENABLED", "true")])).unwrap_err();
        assert!(matches!(err, Error::Config { .. }));

        let cfg = Config::from_env(env(&[
            ("SNAPDOG_API_AUTH_ENABLED", "true"),
            ("SNAPDOG_API_APIKEY_1", "secret"),
        ]))
        .unwrap();
        assert_eq!(cfg.api.api_keys, vec!["secret"]);
    }

    #[test]
    fn tunnel_requires_gateway() {
        let err = Config::from_env(env(&[("SNAPDOG_SERVICES_KNX_ENABLED", "true")])).unwrap_err();
        let Error::Config { key, .. } = err else {
            panic!("expected config error");
        };
        assert_eq!(key, "SNAPDOG_SERVICES_KNX_GATEWAY");

        // router mode needs no gateway
        let cfg = Config::from_env(env(&[
            ("SNAPDOG_SERVICES_KNX_ENABLED", "true"),
            ("SNAPDOG_SERVICES_KNX_CONNECTION_TYPE", "Router"),
        ]))
        .unwrap();
        assert_eq!(cfg.knx.connection_type, KnxConnectionType::Router);
    }

    #[test]
    fn radios_require_url() {
        assert!(Config::from_env(env(&[("SNAPDOG_RADIO_1_NAME", "FM4")])).is_err());
        let cfg = Config::from_env(env(&[
            ("SNAPDOG_RADIO_1_NAME", "FM4"),
            ("SNAPDOG_RADIO_1_URL", "http://stream.example/fm4"),
        ]))
        .unwrap();
        assert_eq!(cfg.radios[0].url, "http://stream.example/fm4");
    }

    #[test]
    fn unparsable_numeric_is_fatal() {
        let err = Config::from_env(env(&[("SNAPDOG_AUDIO_SAMPLE_RATE", "fast")])).unwrap_err();
        let Error::Config { key, .. } = err else {
            panic!("expected config error");
        };
        assert_eq!(key, "SNAPDOG_AUDIO_SAMPLE_RATE");
    }
}
