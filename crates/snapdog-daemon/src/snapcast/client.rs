//! Snapcast JSON-RPC client with separated reader/writer handling.
//!
//! ```text
//!   SnapcastClient::connect()
//!         │  TCP connect under the connection policy
//!         └── io task
//!               ├── req_rx      ← serialized requests, id → oneshot reply
//!               ├── socket line ← response (has id)   → matched reply
//!               │                 notification        → SnapcastEvent fan-out
//!               └── reconnect on loss while auto_reconnect
//! ```
//!
//! Requests are newline-delimited JSON-RPC 2.0; the server pushes
//! notifications on the same connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use snapdog_core::config::SnapcastConfig;
use snapdog_core::resilience;
use snapdog_core::{Error, Result};

use super::types::{ServerSnapshot, SnapcastEvent};

static NEXT_REQ_ID: AtomicU64 = AtomicU64::new(1);

// ── control port ──────────────────────────────────────────────────────────────

/// Outbound Snapcast operations, as the reconciler and client engine see
/// them.  Mockable in tests.
#[async_trait]
pub trait SnapcastControl: Send + Sync {
    async fn server_status(&self) -> Result<ServerSnapshot>;
    async fn set_client_volume(&self, id: &str, percent: u8, muted: bool) -> Result<()>;
    async fn set_client_latency(&self, id: &str, latency_ms: i32) -> Result<()>;
    async fn set_client_name(&self, id: &str, name: &str) -> Result<()>;
    async fn set_group_clients(&self, group_id: &str, client_ids: &[String]) -> Result<()>;
    async fn set_group_stream(&self, group_id: &str, stream_id: &str) -> Result<()>;
}

// ── client ────────────────────────────────────────────────────────────────────

struct RpcRequest {
    id: u64,
    payload: String, // serialized JSON line, '\n' included
    reply: oneshot::Sender<Result<Value>>,
}

pub struct SnapcastClient {
    req_tx: mpsc::Sender<RpcRequest>,
    events_tx: broadcast::Sender<SnapcastEvent>,
    connected_rx: watch::Receiver<bool>,
    request_timeout: Duration,
}

impl SnapcastClient {
    /// Connect under the connection policy and spawn the io/reconnect task.
    pub async fn connect(config: SnapcastConfig, cancel: CancellationToken) -> Result<Self> {
        let stream = resilience::retry(
            "snapcast connect",
            &config.resilience.connection.clone(),
            &cancel,
            |attempt| {
                let address = config.address.clone();
                let port = config.jsonrpc_port;
                async move {
                    debug!("snapcast: connect attempt {attempt} to {address}:{port}");
                    TcpStream::connect((address.as_str(), port))
                        .await
                        .map_err(|e| Error::transport(format!("snapcast connect: {e}")))
                }
            },
        )
        .await?;
        info!(
            "snapcast: connected to {}:{}",
            config.address, config.jsonrpc_port
        );

        let (req_tx, req_rx) = mpsc::channel::<RpcRequest>(64);
        let (events_tx, _) = broadcast::channel(256);
        let (connected_tx, connected_rx) = watch::channel(true);
        let request_timeout = Duration::from_secs(config.resilience.operation.timeout_seconds);

        tokio::spawn(io_task(
            config,
            stream,
            req_rx,
            events_tx.clone(),
            connected_tx,
            cancel,
        ));

        Ok(Self {
            req_tx,
            events_tx,
            connected_rx,
            request_timeout,
        })
    }

    pub fn events(&self) -> broadcast::Receiver<SnapcastEvent> {
        self.events_tx.subscribe()
    }

    pub fn connected(&self) -> watch::Receiver<bool> {
        self.connected_rx.clone()
    }

    pub async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let id = NEXT_REQ_ID.fetch_add(1, Ordering::Relaxed);
        let mut payload = serde_json::to_string(&json!({
            "id": id,
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        }))
        .map_err(|e| Error::internal(format!("rpc serialize: {e}")))?;
        payload.push('\n');

        let (reply_tx, reply_rx) = oneshot::channel();
        self.req_tx
            .send(RpcRequest {
                id,
                payload,
                reply: reply_tx,
            })
            .await
            .map_err(|_| Error::transport("snapcast client closed"))?;

        tokio::time::timeout(self.request_timeout, reply_rx)
            .await
            .map_err(|_| Error::timeout(format!("snapcast {method}")))?
            .map_err(|_| Error::transport("snapcast reply dropped"))?
    }
}

#[async_trait]
impl SnapcastControl for SnapcastClient {
    async fn server_status(&self) -> Result<ServerSnapshot> {
        let result = self.request("Server.GetStatus", json!({})).await?;
        Ok(ServerSnapshot::from_status(&result))
    }

    async fn set_client_volume(&self, id: &str, percent: u8, muted: bool) -> Result<()> {
        self.request(
            "Client.SetVolume",
            json!({ "id": id, "volume": { "percent": percent, "muted": muted } }),
        )
        .await
        .map(|_| ())
    }

    async fn set_client_latency(&self, id: &str, latency_ms: i32) -> Result<()> {
        self.request(
            "Client.SetLatency",
            json!({ "id": id, "latency": latency_ms }),
        )
        .await
        .map(|_| ())
    }

    async fn set_client_name(&self, id: &str, name: &str) -> Result<()> {
        self.request("Client.SetName", json!({ "id": id, "name": name }))
            .await
            .map(|_| ())
    }

    async fn set_group_clients(&self, group_id: &str, client_ids: &[String]) -> Result<()> {
        self.request(
            "Group.SetClients",
            json!({ "id": group_id, "clients": client_ids }),
        )
        .await
        .map(|_| ())
    }

    async fn set_group_stream(&self, group_id: &str, stream_id: &str) -> Result<()> {
        self.request(
            "Group.SetStream",
            json!({ "id": group_id, "stream_id": stream_id }),
        )
        .await
        .map(|_| ())
    }
}

// ── io task ───────────────────────────────────────────────────────────────────

async fn io_task(
    config: SnapcastConfig,
    mut stream: TcpStream,
    mut req_rx: mpsc::Receiver<RpcRequest>,
    events_tx: broadcast::Sender<SnapcastEvent>,
    connected_tx: watch::Sender<bool>,
    cancel: CancellationToken,
) {
    loop {
        let lost = run_connection(stream, &mut req_rx, &events_tx, &cancel).await;
        let _ = connected_tx.send(false);

        if cancel.is_cancelled() || !lost {
            debug!("snapcast: io task stopping");
            return;
        }
        if !config.auto_reconnect {
            warn!("snapcast: connection lost, auto-reconnect disabled");
            return;
        }
        let _ = events_tx.send(SnapcastEvent::GroupChanged);

        // keep reopening under the connection policy until cancelled
        loop {
            let attempt = resilience::retry(
                "snapcast reconnect",
                &config.resilience.connection.clone(),
                &cancel,
                |n| {
                    let address = config.address.clone();
                    let port = config.jsonrpc_port;
                    async move {
                        debug!("snapcast: reconnect attempt {n}");
                        TcpStream::connect((address.as_str(), port))
                            .await
                            .map_err(|e| Error::transport(format!("snapcast connect: {e}")))
                    }
                },
            )
            .await;
            match attempt {
                Ok(s) => {
                    info!("snapcast: reconnected");
                    let _ = connected_tx.send(true);
                    stream = s;
                    break;
                }
                Err(Error::Cancelled) => return,
                Err(e) => warn!("snapcast: reconnect round failed: {e}"),
            }
        }
    }
}

/// One connection's lifetime.  Returns true when the link was lost (as
/// opposed to a cancellation / request-channel close).
async fn run_connection(
    stream: TcpStream,
    req_rx: &mut mpsc::Receiver<RpcRequest>,
    events_tx: &broadcast::Sender<SnapcastEvent>,
    cancel: &CancellationToken,
) -> bool {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut pending: HashMap<u64, oneshot::Sender<Result<Value>>> = HashMap::new();
    let mut line = String::new();

    let lost = loop {
        line.clear();
        tokio::select! {
            _ = cancel.cancelled() => break false,

            req = req_rx.recv() => {
                let Some(req) = req else { break false };
                if let Err(e) = write_half.write_all(req.payload.as_bytes()).await {
                    let _ = req.reply.send(Err(Error::transport(format!("snapcast write: {e}"))));
                    break true;
                }
                pending.insert(req.id, req.reply);
            }

            read = reader.read_line(&mut line) => {
                match read {
                    Ok(0) => break true,
                    Ok(_) => handle_line(line.trim(), &mut pending, events_tx),
                    Err(e) => {
                        warn!("snapcast: read failed: {e}");
                        break true;
                    }
                }
            }
        }
    };

    for (_, reply) in pending.drain() {
        let _ = reply.send(Err(Error::transport("snapcast connection closed")));
    }
    lost
}

fn handle_line(
    line: &str,
    pending: &mut HashMap<u64, oneshot::Sender<Result<Value>>>,
    events_tx: &broadcast::Sender<SnapcastEvent>,
) {
    if line.is_empty() {
        return;
    }
    let value: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            debug!("snapcast: invalid json '{line}': {e}");
            return;
        }
    };

    if let Some(id) = value.get("id").and_then(Value::as_u64) {
        let Some(reply) = pending.remove(&id) else {
            debug!("snapcast: response for unknown request {id}");
            return;
        };
        let result = if let Some(error) = value.get("error") {
            let message = error["message"].as_str().unwrap_or("unknown error");
            Err(Error::protocol(format!("snapcast: {message}")))
        } else {
            Ok(value["result"].clone())
        };
        let _ = reply.send(result);
    } else if let Some(method) = value.get("method").and_then(Value::as_str) {
        if let Some(event) = SnapcastEvent::from_notification(method, &value["params"]) {
            let _ = events_tx.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use snapdog_core::resilience::{Backoff, Policy, ServicePolicies};
    use tokio::net::TcpListener;

    fn test_config(port: u16) -> SnapcastConfig {
        let fast = Policy {
            max_retries: 0,
            retry_delay_ms: 10,
            backoff: Backoff::Constant,
            use_jitter: false,
            jitter_percentage: 0,
            timeout_seconds: 2,
        };
        SnapcastConfig {
            address: "127.0.0.1".to_string(),
            jsonrpc_port: port,
            http_port: 1780,
            timeout_seconds: 2,
            reconnect_interval_seconds: 1,
            auto_reconnect: false,
            sync_names: false,
            periodic_check_interval_ms: 5000,
            event_debounce_delay_ms: 500,
            resilience: ServicePolicies {
                connection: fast,
                operation: fast,
            },
        }
    }

    /// Fake server: answers one GetStatus, then pushes a volume notification.
    async fn fake_server(listener: TcpListener) {
        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();

        let request: Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(request["method"], "Server.GetStatus");
        let response = json!({
            "id": request["id"],
            "jsonrpc": "2.0",
            "result": { "server": { "groups": [], "streams": [
                { "id": "zone1", "status": "idle" }
            ]}}
        });
        write_half
            .write_all(format!("{response}\n").as_bytes())
            .await
            .unwrap();

        let notification = json!({
            "jsonrpc": "2.0",
            "method": "Client.OnVolumeChanged",
            "params": { "id": "c1", "volume": { "percent": 40, "muted": false } }
        });
        write_half
            .write_all(format!("{notification}\n").as_bytes())
            .await
            .unwrap();

        // keep the socket open until the client is done
        let mut drain = String::new();
        let _ = reader.read_line(&mut drain).await;
    }

    #[tokio::test]
    async fn request_response_and_notifications() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(fake_server(listener));

        let cancel = CancellationToken::new();
        let client = SnapcastClient::connect(test_config(port), cancel.clone())
            .await
            .unwrap();
        let mut events = client.events();

        let snapshot = client.server_status().await.unwrap();
        assert!(snapshot.has_stream("zone1"));

        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("no notification within 2s")
            .unwrap();
        assert_eq!(
            event,
            SnapcastEvent::ClientVolumeChanged {
                id: "c1".into(),
                percent: 40,
                muted: false
            }
        );

        cancel.cancel();
        server.abort();
    }

    #[tokio::test]
    async fn connect_failure_surfaces() {
        let probe = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let cancel = CancellationToken::new();
        let result = SnapcastClient::connect(test_config(port), cancel).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn rpc_error_maps_to_protocol_error() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut reader = BufReader::new(read_half);
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            let request: Value = serde_json::from_str(line.trim()).unwrap();
            let response = json!({
                "id": request["id"],
                "jsonrpc": "2.0",
                "error": { "code": -32602, "message": "Client not found" }
            });
            write_half
                .write_all(format!("{response}\n").as_bytes())
                .await
                .unwrap();
            let mut drain = String::new();
            let _ = reader.read_line(&mut drain).await;
        });

        let cancel = CancellationToken::new();
        let client = SnapcastClient::connect(test_config(port), cancel.clone())
            .await
            .unwrap();
        let err = client
            .set_client_volume("ghost", 10, false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)), "{err:?}");
        cancel.cancel();
    }
}
