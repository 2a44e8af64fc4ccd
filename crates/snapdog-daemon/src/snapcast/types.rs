//! Snapcast server state as reported by `Server.GetStatus`, plus the typed
//! notification stream.

use serde_json::Value;

use snapdog_core::command::ClientMac;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerSnapshot {
    pub groups: Vec<GroupInfo>,
    pub streams: Vec<StreamInfo>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupInfo {
    pub id: String,
    pub name: String,
    pub stream_id: String,
    pub clients: Vec<ClientInfo>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClientInfo {
    pub id: String,
    pub name: String,
    pub mac: Option<ClientMac>,
    pub connected: bool,
    pub volume_percent: u8,
    pub muted: bool,
    pub latency_ms: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamInfo {
    pub id: String,
    pub status: String,
}

impl ServerSnapshot {
    /// Parse the `result` object of a `Server.GetStatus` response.
    pub fn from_status(result: &Value) -> Self {
        let server = &result["server"];
        let groups = server["groups"]
            .as_array()
            .map(|groups| groups.iter().map(GroupInfo::from_json).collect())
            .unwrap_or_default();
        let streams = server["streams"]
            .as_array()
            .map(|streams| {
                streams
                    .iter()
                    .map(|s| StreamInfo {
                        id: s["id"].as_str().unwrap_or_default().to_string(),
                        status: s["status"].as_str().unwrap_or_default().to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        Self { groups, streams }
    }

    pub fn find_client(&self, mac: &ClientMac) -> Option<(&GroupInfo, &ClientInfo)> {
        self.groups.iter().find_map(|g| {
            g.clients
                .iter()
                .find(|c| c.mac.as_ref() == Some(mac))
                .map(|c| (g, c))
        })
    }

    pub fn group_for_stream(&self, stream_id: &str) -> Option<&GroupInfo> {
        self.groups.iter().find(|g| g.stream_id == stream_id)
    }

    pub fn has_stream(&self, stream_id: &str) -> bool {
        self.streams.iter().any(|s| s.id == stream_id)
    }
}

impl GroupInfo {
    fn from_json(group: &Value) -> Self {
        Self {
            id: group["id"].as_str().unwrap_or_default().to_string(),
            name: group["name"].as_str().unwrap_or_default().to_string(),
            stream_id: group["stream_id"].as_str().unwrap_or_default().to_string(),
            clients: group["clients"]
                .as_array()
                .map(|clients| clients.iter().map(ClientInfo::from_json).collect())
                .unwrap_or_default(),
        }
    }
}

impl ClientInfo {
    pub fn from_json(client: &Value) -> Self {
        let config_name = client["config"]["name"].as_str().unwrap_or_default();
        let host_name = client["host"]["name"].as_str().unwrap_or_default();
        Self {
            id: client["id"].as_str().unwrap_or_default().to_string(),
            name: if config_name.is_empty() {
                host_name.to_string()
            } else {
                config_name.to_string()
            },
            mac: client["host"]["mac"]
                .as_str()
                .and_then(|m| m.parse().ok()),
            connected: client["connected"].as_bool().unwrap_or(false),
            volume_percent: client["config"]["volume"]["percent"]
                .as_u64()
                .unwrap_or(100)
                .min(100) as u8,
            muted: client["config"]["volume"]["muted"].as_bool().unwrap_or(false),
            latency_ms: client["config"]["latency"].as_i64().unwrap_or(0) as i32,
        }
    }
}

// ── notifications ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum SnapcastEvent {
    ClientConnect(ClientInfo),
    ClientDisconnect { id: String },
    ClientVolumeChanged {
        id: String,
        percent: u8,
        muted: bool,
    },
    ClientLatencyChanged { id: String, latency_ms: i32 },
    ClientNameChanged { id: String, name: String },
    GroupChanged,
    StreamChanged { id: String, status: String },
}

impl SnapcastEvent {
    /// Map a JSON-RPC notification to a typed event; `None` for methods the
    /// controller does not care about.
    pub fn from_notification(method: &str, params: &Value) -> Option<Self> {
        match method {
            "Client.OnConnect" => Some(Self::ClientConnect(ClientInfo::from_json(
                &params["client"],
            ))),
            "Client.OnDisconnect" => Some(Self::ClientDisconnect {
                id: params["id"].as_str().unwrap_or_default().to_string(),
            }),
            "Client.OnVolumeChanged" => Some(Self::ClientVolumeChanged {
                id: params["id"].as_str().unwrap_or_default().to_string(),
                percent: params["volume"]["percent"].as_u64().unwrap_or(0).min(100) as u8,
                muted: params["volume"]["muted"].as_bool().unwrap_or(false),
            }),
            "Client.OnLatencyChanged" => Some(Self::ClientLatencyChanged {
                id: params["id"].as_str().unwrap_or_default().to_string(),
                latency_ms: params["latency"].as_i64().unwrap_or(0) as i32,
            }),
            "Client.OnNameChanged" => Some(Self::ClientNameChanged {
                id: params["id"].as_str().unwrap_or_default().to_string(),
                name: params["name"].as_str().unwrap_or_default().to_string(),
            }),
            "Group.OnStreamChanged" | "Server.OnUpdate" => Some(Self::GroupChanged),
            "Stream.OnUpdate" => Some(Self::StreamChanged {
                id: params["id"].as_str().unwrap_or_default().to_string(),
                status: params["stream"]["status"].as_str().unwrap_or_default().to_string(),
            }),
            _ => None,
        }
    }
}

/// Stream id a zone's sink maps to: the file stem of the sink path
/// (`/snapsinks/zone1` → `zone1`), matching the Snapcast pipe source name.
pub fn stream_id_for_sink(sink: &str) -> String {
    std::path::Path::new(sink)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| sink.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn status_fixture() -> Value {
        json!({
            "server": {
                "groups": [
                    {
                        "id": "g1",
                        "name": "",
                        "stream_id": "zone1",
                        "clients": [
                            {
                                "id": "aa:bb:cc:00:11:22",
                                "connected": true,
                                "host": { "mac": "aa:bb:cc:00:11:22", "name": "pi-kitchen" },
                                "config": {
                                    "name": "Kitchen",
                                    "latency": 20,
                                    "volume": { "percent": 65, "muted": false }
                                }
                            }
                        ]
                    }
                ],
                "streams": [
                    { "id": "zone1", "status": "playing" },
                    { "id": "zone2", "status": "idle" }
                ]
            }
        })
    }

    #[test]
    fn snapshot_parsing() {
        let snapshot = ServerSnapshot::from_status(&status_fixture());
        assert_eq!(snapshot.groups.len(), 1);
        assert_eq!(snapshot.streams.len(), 2);
        let group = &snapshot.groups[0];
        assert_eq!(group.stream_id, "zone1");
        let client = &group.clients[0];
        assert_eq!(client.name, "Kitchen");
        assert_eq!(client.volume_percent, 65);
        assert_eq!(client.latency_ms, 20);
        assert!(client.connected);
        assert_eq!(client.mac, Some("aa:bb:cc:00:11:22".parse().unwrap()));
    }

    #[test]
    fn client_falls_back_to_host_name() {
        let client = ClientInfo::from_json(&json!({
            "id": "x",
            "host": { "name": "pi-bath", "mac": "not a mac" },
            "config": { "volume": { "percent": 200 } }
        }));
        assert_eq!(client.name, "pi-bath");
        assert_eq!(client.mac, None);
        assert_eq!(client.volume_percent, 100, "volume clamped");
    }

    #[test]
    fn lookup_helpers() {
        let snapshot = ServerSnapshot::from_status(&status_fixture());
        let mac: ClientMac = "aa:bb:cc:00:11:22".parse().unwrap();
        let (group, client) = snapshot.find_client(&mac).unwrap();
        assert_eq!(group.id, "g1");
        assert_eq!(client.id, "aa:bb:cc:00:11:22");
        assert!(snapshot.has_stream("zone2"));
        assert!(!snapshot.has_stream("zone9"));
        assert!(snapshot.group_for_stream("zone1").is_some());
        assert!(snapshot.group_for_stream("zone2").is_none());
    }

    #[test]
    fn notification_mapping() {
        let event = SnapcastEvent::from_notification(
            "Client.OnVolumeChanged",
            &json!({ "id": "c1", "volume": { "percent": 30, "muted": true } }),
        )
        .unwrap();
        assert_eq!(
            event,
            SnapcastEvent::ClientVolumeChanged {
                id: "c1".into(),
                percent: 30,
                muted: true
            }
        );
        assert!(SnapcastEvent::from_notification("Stream.OnProperties", &json!({})).is_none());
    }

    #[test]
    fn sink_to_stream_id() {
        assert_eq!(stream_id_for_sink("/snapsinks/zone1"), "zone1");
        assert_eq!(stream_id_for_sink("/var/lib/snap/living.pipe"), "living");
        assert_eq!(stream_id_for_sink("plain"), "plain");
    }
}
