//! KNX bus link with separated supervisor/IO tasks.
//!
//! Architecture:
//!
//! ```text
//!   KnxLink::open()
//!         │  first connect under the connection policy (caller sees failures)
//!         └── supervisor task
//!                ├── io loop        ← owns the socket / hidraw handle
//!                │     ├── cmd_rx   ← serialized outbound cEMI frames
//!                │     └── events   → broadcast::Sender<CemiFrame> fan-out
//!                └── reconnect loop ← reopens on loss while auto_reconnect
//! ```
//!
//! Three connection variants share the loop: KNXnet/IP tunnelling (UDP
//! unicast with sequence counters, acks and a connection-state heartbeat),
//! KNXnet/IP routing (IPv4 multicast), and a KNX USB interface on hidraw.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::PathBuf;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{KnxConfig, KnxConnectionType};
use crate::error::{Error, Result};
use crate::knx::cemi::{CemiFrame, MSG_L_DATA_IND, MSG_L_DATA_REQ};
use crate::knx::dpt::{self, DptId, GroupValue};
use crate::knx::address::GroupAddress;
use crate::knx::netip;

// ── connection state ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Stopped,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Reconnecting => write!(f, "reconnecting"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

// ── public handle ─────────────────────────────────────────────────────────────

struct SendRequest {
    frame: CemiFrame,
    reply: oneshot::Sender<Result<()>>,
}

/// Cheaply cloneable handle to the bus link.  Senders are serialized through
/// one channel; every received group telegram is fanned out to all
/// subscribers.
#[derive(Clone)]
pub struct KnxLink {
    cmd_tx: mpsc::Sender<SendRequest>,
    events_tx: broadcast::Sender<CemiFrame>,
    state_rx: watch::Receiver<ConnectionState>,
    operation_timeout: Duration,
}

impl KnxLink {
    /// Connect under the configured connection policy and spawn the
    /// supervisor.  Fails when the first connect cannot be established
    /// within the policy.
    pub async fn open(config: KnxConfig, cancel: CancellationToken) -> Result<Self> {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);

        let conn = crate::resilience::retry(
            "knx connect",
            &config.resilience.connection.clone(),
            &cancel,
            |attempt| {
                let config = config.clone();
                let cancel = cancel.clone();
                async move {
                    debug!("knx: connect attempt {attempt}");
                    Conn::connect(&config, &cancel).await
                }
            },
        )
        .await?;

        let _ = state_tx.send(ConnectionState::Connected);
        info!("knx: connected ({:?})", config.connection_type);

        let (cmd_tx, cmd_rx) = mpsc::channel::<SendRequest>(64);
        let (events_tx, _) = broadcast::channel::<CemiFrame>(256);

        let operation_timeout = Duration::from_secs(config.resilience.operation.timeout_seconds);

        tokio::spawn(supervisor(
            config,
            conn,
            cmd_rx,
            events_tx.clone(),
            state_tx,
            cancel,
        ));

        Ok(Self {
            cmd_tx,
            events_tx,
            state_rx,
            operation_timeout,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CemiFrame> {
        self.events_tx.subscribe()
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    pub fn is_connected(&self) -> bool {
        *self.state_rx.borrow() == ConnectionState::Connected
    }

    /// Send a raw cEMI frame.  Resolves once the link has put it on the wire
    /// (and, for tunnels, the gateway acknowledged it).
    pub async fn send(&self, frame: CemiFrame) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(SendRequest {
                frame,
                reply: reply_tx,
            })
            .await
            .map_err(|_| Error::transport("knx link closed"))?;
        reply_rx
            .await
            .map_err(|_| Error::transport("knx link closed"))?
    }

    /// DPT-encode `value` and write it to `address`.
    pub async fn group_write(
        &self,
        address: GroupAddress,
        value: &GroupValue,
        dpt: DptId,
    ) -> Result<()> {
        let bytes = dpt::encode(value, dpt)?;
        let payload = crate::knx::cemi::Payload::for_dpt(bytes, dpt);
        self.send(CemiFrame::group_write(address, payload)).await
    }

    /// Issue a GroupValue_Read.
    pub async fn group_read(&self, address: GroupAddress) -> Result<()> {
        self.send(CemiFrame::group_read(address)).await
    }

    /// Read + await the matching GroupValue_Response within the operation
    /// policy window.  Decodes through `dpt` when given, falls back to
    /// heuristic detection, and preserves raw bytes otherwise.
    pub async fn read_group_value(
        &self,
        address: GroupAddress,
        dpt: Option<DptId>,
    ) -> Result<GroupValue> {
        let mut rx = self.subscribe();
        self.group_read(address).await?;

        let wait = async {
            loop {
                match rx.recv().await {
                    Ok(frame) => {
                        if frame.dst == address
                            && frame.apci == crate::knx::cemi::Apci::GroupValueResponse
                        {
                            let raw = frame.payload.data();
                            let value = match dpt {
                                Some(d) => dpt::decode(&raw, d)?,
                                None => match dpt::detect(&raw) {
                                    Some((_, v)) => v,
                                    None => GroupValue::Raw(raw),
                                },
                            };
                            return Ok(value);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!("knx read: missed {n} bus events while waiting");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(Error::transport("knx link closed"));
                    }
                }
            }
        };

        tokio::time::timeout(self.operation_timeout, wait)
            .await
            .map_err(|_| Error::timeout(format!("no response from {address}")))?
    }
}

// ── supervisor ────────────────────────────────────────────────────────────────

enum Exit {
    Cancelled,
    Lost(Error),
}

async fn supervisor(
    config: KnxConfig,
    mut conn: Conn,
    mut cmd_rx: mpsc::Receiver<SendRequest>,
    events_tx: broadcast::Sender<CemiFrame>,
    state_tx: watch::Sender<ConnectionState>,
    cancel: CancellationToken,
) {
    loop {
        let exit = conn.run(&mut cmd_rx, &events_tx, &cancel).await;
        conn.close().await;

        match exit {
            Exit::Cancelled => {
                let _ = state_tx.send(ConnectionState::Stopped);
                info!("knx: link stopped");
                return;
            }
            Exit::Lost(e) => {
                warn!("knx: connection lost: {e}");
                if !config.auto_reconnect {
                    let _ = state_tx.send(ConnectionState::Disconnected);
                    return;
                }
                let _ = state_tx.send(ConnectionState::Reconnecting);

                // keep reopening under the connection policy until cancelled
                loop {
                    let attempt = crate::resilience::retry(
                        "knx reconnect",
                        &config.resilience.connection.clone(),
                        &cancel,
                        |n| {
                            let config = config.clone();
                            let cancel = cancel.clone();
                            async move {
                                debug!("knx: reconnect attempt {n}");
                                Conn::connect(&config, &cancel).await
                            }
                        },
                    )
                    .await;
                    match attempt {
                        Ok(c) => {
                            conn = c;
                            let _ = state_tx.send(ConnectionState::Connected);
                            info!("knx: reconnected");
                            break;
                        }
                        Err(Error::Cancelled) => {
                            let _ = state_tx.send(ConnectionState::Stopped);
                            return;
                        }
                        Err(e) => {
                            warn!("knx: reconnect round failed: {e}");
                        }
                    }
                }
            }
        }
    }
}

// ── connection variants ───────────────────────────────────────────────────────

enum Conn {
    Tunnel(TunnelConn),
    Router(RouterConn),
    Usb(UsbConn),
}

impl Conn {
    async fn connect(config: &KnxConfig, cancel: &CancellationToken) -> Result<Self> {
        match config.connection_type {
            KnxConnectionType::Tunnel => Ok(Self::Tunnel(TunnelConn::connect(config).await?)),
            KnxConnectionType::Router => Ok(Self::Router(RouterConn::connect(config).await?)),
            KnxConnectionType::Usb => Ok(Self::Usb(UsbConn::connect(config, cancel).await?)),
        }
    }

    async fn run(
        &mut self,
        cmd_rx: &mut mpsc::Receiver<SendRequest>,
        events_tx: &broadcast::Sender<CemiFrame>,
        cancel: &CancellationToken,
    ) -> Exit {
        match self {
            Self::Tunnel(t) => t.run(cmd_rx, events_tx, cancel).await,
            Self::Router(r) => r.run(cmd_rx, events_tx, cancel).await,
            Self::Usb(u) => u.run(cmd_rx, events_tx, cancel).await,
        }
    }

    async fn close(&mut self) {
        if let Self::Tunnel(t) = self {
            t.disconnect().await;
        }
    }
}

/// Resolve a gateway host to its first IPv4 A record.
async fn resolve_ipv4(host: &str, port: u16) -> Result<SocketAddrV4> {
    if let Ok(ip) = host.parse::<Ipv4Addr>() {
        return Ok(SocketAddrV4::new(ip, port));
    }
    let addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| Error::transport(format!("cannot resolve '{host}': {e}")))?;
    addrs
        .filter_map(|a| match a {
            SocketAddr::V4(v4) => Some(v4),
            SocketAddr::V6(_) => None,
        })
        .next()
        .ok_or_else(|| Error::transport(format!("'{host}' has no IPv4 A record")))
}

fn publish_ind(events_tx: &broadcast::Sender<CemiFrame>, cemi: &[u8]) {
    match CemiFrame::decode(cemi) {
        Ok(frame) if frame.msg_code == MSG_L_DATA_IND => {
            let _ = events_tx.send(frame);
        }
        Ok(_) => {} // L_Data.con and friends are link-local
        Err(e) => debug!("knx: dropping malformed cEMI: {e}"),
    }
}

// ── tunnel ────────────────────────────────────────────────────────────────────

const ACK_TIMEOUT: Duration = Duration::from_secs(1);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

struct TunnelConn {
    socket: UdpSocket,
    gateway: SocketAddrV4,
    channel: u8,
    send_seq: u8,
}

impl TunnelConn {
    async fn connect(config: &KnxConfig) -> Result<Self> {
        let gateway_host = config
            .gateway
            .as_deref()
            .ok_or_else(|| Error::transport("no KNX gateway configured"))?;
        let gateway = resolve_ipv4(gateway_host, config.port).await?;

        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
            .await
            .map_err(|e| Error::transport(format!("bind failed: {e}")))?;
        let local = match socket.local_addr() {
            Ok(SocketAddr::V4(v4)) => v4,
            _ => SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0),
        };

        let request = netip::connect_request(local, local).encode();
        socket
            .send_to(&request, gateway)
            .await
            .map_err(|e| Error::transport(format!("connect request failed: {e}")))?;

        let mut buf = [0u8; 512];
        let (n, _) = socket
            .recv_from(&mut buf)
            .await
            .map_err(|e| Error::transport(format!("connect response failed: {e}")))?;
        let frame = netip::Frame::decode(&buf[..n])?;
        let response = netip::parse_connect_response(&frame)?;
        if response.status != netip::E_NO_ERROR {
            return Err(Error::transport(format!(
                "gateway refused tunnel (status 0x{:02X})",
                response.status
            )));
        }

        debug!("knx tunnel: channel {} to {}", response.channel, gateway);
        Ok(Self {
            socket,
            gateway,
            channel: response.channel,
            send_seq: 0,
        })
    }

    async fn run(
        &mut self,
        cmd_rx: &mut mpsc::Receiver<SendRequest>,
        events_tx: &broadcast::Sender<CemiFrame>,
        cancel: &CancellationToken,
    ) -> Exit {
        let mut rbuf = [0u8; 512];
        let mut heartbeat = tokio::time::interval_at(
            tokio::time::Instant::now() + HEARTBEAT_INTERVAL,
            HEARTBEAT_INTERVAL,
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Exit::Cancelled,

                req = cmd_rx.recv() => {
                    let Some(req) = req else { return Exit::Cancelled };
                    let result = self.send_data(&req.frame, events_tx).await;
                    let lost = result.as_ref().err().cloned();
                    let _ = req.reply.send(result);
                    if let Some(e) = lost {
                        if e.is_transient() {
                            return Exit::Lost(e);
                        }
                    }
                }

                received = self.socket.recv_from(&mut rbuf) => {
                    match received {
                        Ok((n, _)) => {
                            if let Err(e) = self.handle_datagram(&rbuf[..n], events_tx).await {
                                return Exit::Lost(e);
                            }
                        }
                        Err(e) => return Exit::Lost(Error::transport(format!("recv failed: {e}"))),
                    }
                }

                _ = heartbeat.tick() => {
                    if let Err(e) = self.heartbeat(events_tx).await {
                        return Exit::Lost(e);
                    }
                }
            }
        }
    }

    /// TUNNELING_REQUEST with retransmit-once-then-fail ack handling.
    /// Inbound data frames arriving while we wait are processed inline.
    async fn send_data(
        &mut self,
        frame: &CemiFrame,
        events_tx: &broadcast::Sender<CemiFrame>,
    ) -> Result<()> {
        let mut cemi = frame.clone();
        cemi.msg_code = MSG_L_DATA_REQ;
        let seq = self.send_seq;
        let wire = netip::tunneling_request(self.channel, seq, &cemi.encode()).encode();

        for transmission in 0..2 {
            self.socket
                .send_to(&wire, self.gateway)
                .await
                .map_err(|e| Error::transport(format!("send failed: {e}")))?;

            if self.await_ack(seq, events_tx).await? {
                self.send_seq = self.send_seq.wrapping_add(1);
                return Ok(());
            }
            debug!("knx tunnel: no ack for seq {seq} (transmission {})", transmission + 1);
        }
        Err(Error::timeout(format!("tunneling ack for seq {seq}")))
    }

    /// Wait up to [`ACK_TIMEOUT`] for the matching ack.  Returns Ok(false)
    /// on timeout so the caller can retransmit.
    async fn await_ack(
        &mut self,
        seq: u8,
        events_tx: &broadcast::Sender<CemiFrame>,
    ) -> Result<bool> {
        let deadline = tokio::time::Instant::now() + ACK_TIMEOUT;
        let mut buf = [0u8; 512];
        loop {
            let received =
                match tokio::time::timeout_at(deadline, self.socket.recv_from(&mut buf)).await {
                    Err(_) => return Ok(false),
                    Ok(Err(e)) => return Err(Error::transport(format!("recv failed: {e}"))),
                    Ok(Ok((n, _))) => n,
                };
            let Ok(frame) = netip::Frame::decode(&buf[..received]) else {
                continue;
            };
            if frame.service == netip::TUNNELING_ACK {
                if let Ok(ack) = netip::parse_tunneling_ack(&frame) {
                    if ack.seq == seq {
                        if ack.status != netip::E_NO_ERROR {
                            return Err(Error::transport(format!(
                                "gateway rejected frame (status 0x{:02X})",
                                ack.status
                            )));
                        }
                        return Ok(true);
                    }
                }
            } else {
                self.handle_datagram(&buf[..received], events_tx).await?;
            }
        }
    }

    async fn handle_datagram(
        &self,
        datagram: &[u8],
        events_tx: &broadcast::Sender<CemiFrame>,
    ) -> Result<()> {
        let frame = match netip::Frame::decode(datagram) {
            Ok(f) => f,
            Err(e) => {
                debug!("knx tunnel: dropping malformed datagram: {e}");
                return Ok(());
            }
        };
        match frame.service {
            netip::TUNNELING_REQUEST => {
                let request = netip::parse_tunneling_request(&frame)?;
                let ack = netip::tunneling_ack(self.channel, request.seq, netip::E_NO_ERROR);
                self.socket
                    .send_to(&ack.encode(), self.gateway)
                    .await
                    .map_err(|e| Error::transport(format!("ack send failed: {e}")))?;
                publish_ind(events_tx, &request.cemi);
                Ok(())
            }
            netip::DISCONNECT_REQUEST => {
                let _ = self
                    .socket
                    .send_to(
                        &netip::disconnect_response(self.channel).encode(),
                        self.gateway,
                    )
                    .await;
                Err(Error::transport("gateway closed the tunnel"))
            }
            netip::CONNECTIONSTATE_RESPONSE | netip::DISCONNECT_RESPONSE => Ok(()),
            other => {
                debug!("knx tunnel: ignoring service 0x{other:04X}");
                Ok(())
            }
        }
    }

    /// CONNECTIONSTATE_REQUEST keep-alive.  A missing or non-zero response
    /// counts as link loss.
    async fn heartbeat(&mut self, events_tx: &broadcast::Sender<CemiFrame>) -> Result<()> {
        let local = match self.socket.local_addr() {
            Ok(SocketAddr::V4(v4)) => v4,
            _ => SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0),
        };
        let request = netip::connectionstate_request(self.channel, local).encode();
        self.socket
            .send_to(&request, self.gateway)
            .await
            .map_err(|e| Error::transport(format!("heartbeat send failed: {e}")))?;

        let deadline = tokio::time::Instant::now() + ACK_TIMEOUT * 3;
        let mut buf = [0u8; 512];
        loop {
            let n = match tokio::time::timeout_at(deadline, self.socket.recv_from(&mut buf)).await {
                Err(_) => return Err(Error::timeout("connection-state heartbeat")),
                Ok(Err(e)) => return Err(Error::transport(format!("recv failed: {e}"))),
                Ok(Ok((n, _))) => n,
            };
            let Ok(frame) = netip::Frame::decode(&buf[..n]) else {
                continue;
            };
            if frame.service == netip::CONNECTIONSTATE_RESPONSE {
                let (_, status) = netip::parse_channel_status(&frame)?;
                if status != netip::E_NO_ERROR {
                    return Err(Error::transport(format!(
                        "heartbeat rejected (status 0x{status:02X})"
                    )));
                }
                return Ok(());
            }
            self.handle_datagram(&buf[..n], events_tx).await?;
        }
    }

    async fn disconnect(&mut self) {
        let local = match self.socket.local_addr() {
            Ok(SocketAddr::V4(v4)) => v4,
            _ => SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0),
        };
        let request = netip::disconnect_request(self.channel, local).encode();
        let _ = self.socket.send_to(&request, self.gateway).await;
    }
}

// ── router ────────────────────────────────────────────────────────────────────

struct RouterConn {
    socket: UdpSocket,
    group: SocketAddrV4,
}

impl RouterConn {
    async fn connect(config: &KnxConfig) -> Result<Self> {
        let group = resolve_ipv4(&config.multicast_address, config.port).await?;
        if !group.ip().is_multicast() {
            return Err(Error::transport(format!(
                "{} is not a multicast address",
                group.ip()
            )));
        }

        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, config.port))
            .await
            .map_err(|e| Error::transport(format!("bind {} failed: {e}", config.port)))?;
        socket
            .join_multicast_v4(*group.ip(), Ipv4Addr::UNSPECIFIED)
            .map_err(|e| Error::transport(format!("multicast join failed: {e}")))?;

        debug!("knx router: joined {}", group);
        Ok(Self { socket, group })
    }

    async fn run(
        &mut self,
        cmd_rx: &mut mpsc::Receiver<SendRequest>,
        events_tx: &broadcast::Sender<CemiFrame>,
        cancel: &CancellationToken,
    ) -> Exit {
        let mut buf = [0u8; 512];
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Exit::Cancelled,

                req = cmd_rx.recv() => {
                    let Some(req) = req else { return Exit::Cancelled };
                    // routers repeat indications; requests stay on the tunnel side
                    let mut cemi = req.frame.clone();
                    cemi.msg_code = MSG_L_DATA_IND;
                    let wire = netip::routing_indication(&cemi.encode()).encode();
                    let result = self
                        .socket
                        .send_to(&wire, self.group)
                        .await
                        .map(|_| ())
                        .map_err(|e| Error::transport(format!("multicast send failed: {e}")));
                    let lost = result.is_err();
                    let _ = req.reply.send(result);
                    if lost {
                        return Exit::Lost(Error::transport("multicast send failed"));
                    }
                }

                received = self.socket.recv_from(&mut buf) => {
                    match received {
                        Ok((n, _)) => {
                            if let Ok(frame) = netip::Frame::decode(&buf[..n]) {
                                if frame.service == netip::ROUTING_INDICATION {
                                    publish_ind(events_tx, &frame.body);
                                }
                            }
                        }
                        Err(e) => return Exit::Lost(Error::transport(format!("recv failed: {e}"))),
                    }
                }
            }
        }
    }
}

// ── USB ───────────────────────────────────────────────────────────────────────

/// Vendor ids of common KNX USB interfaces (Insta/Gira/Hager/MDT, Weinzierl,
/// Busch-Jaeger, Siemens).
const KNX_USB_VENDORS: &[u16] = &[0x135E, 0x0E77, 0x145C, 0x0908];

const USB_REPORT_LEN: usize = 64;

struct UsbConn {
    writer: tokio::fs::File,
    report_rx: mpsc::Receiver<CemiFrame>,
    reader_cancel: CancellationToken,
}

impl UsbConn {
    async fn connect(config: &KnxConfig, cancel: &CancellationToken) -> Result<Self> {
        let path = match &config.usb_device {
            Some(dev) => PathBuf::from(dev),
            None => enumerate_knx_hidraw().await?,
        };

        let writer = tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .await
            .map_err(|e| Error::transport(format!("cannot open {}: {e}", path.display())))?;
        let reader = writer
            .try_clone()
            .await
            .map_err(|e| Error::transport(format!("cannot clone {}: {e}", path.display())))?;

        info!("knx usb: using {}", path.display());

        let reader_cancel = cancel.child_token();
        let (report_tx, report_rx) = mpsc::channel(64);
        tokio::spawn(usb_reader_task(reader, report_tx, reader_cancel.clone()));

        Ok(Self {
            writer,
            report_rx,
            reader_cancel,
        })
    }

    async fn run(
        &mut self,
        cmd_rx: &mut mpsc::Receiver<SendRequest>,
        events_tx: &broadcast::Sender<CemiFrame>,
        cancel: &CancellationToken,
    ) -> Exit {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.reader_cancel.cancel();
                    return Exit::Cancelled;
                }

                req = cmd_rx.recv() => {
                    let Some(req) = req else {
                        self.reader_cancel.cancel();
                        return Exit::Cancelled;
                    };
                    let mut cemi = req.frame.clone();
                    cemi.msg_code = MSG_L_DATA_REQ;
                    let result = match encode_usb_report(&cemi.encode()) {
                        Ok(report) => self
                            .writer
                            .write_all(&report)
                            .await
                            .map_err(|e| Error::transport(format!("usb write failed: {e}"))),
                        Err(e) => Err(e),
                    };
                    let lost = matches!(result, Err(Error::Transport(_)));
                    let _ = req.reply.send(result);
                    if lost {
                        self.reader_cancel.cancel();
                        return Exit::Lost(Error::transport("usb write failed"));
                    }
                }

                frame = self.report_rx.recv() => {
                    match frame {
                        Some(frame) => {
                            if frame.msg_code == MSG_L_DATA_IND {
                                let _ = events_tx.send(frame);
                            }
                        }
                        None => {
                            return Exit::Lost(Error::transport("usb interface detached"));
                        }
                    }
                }
            }
        }
    }
}

async fn usb_reader_task(
    mut reader: tokio::fs::File,
    report_tx: mpsc::Sender<CemiFrame>,
    cancel: CancellationToken,
) {
    let mut report = [0u8; USB_REPORT_LEN];
    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => return,
            read = reader.read(&mut report) => read,
        };
        match read {
            Ok(0) => return,
            Ok(n) => match decode_usb_report(&report[..n]) {
                Ok(cemi) => match CemiFrame::decode(&cemi) {
                    Ok(frame) => {
                        if report_tx.send(frame).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => debug!("knx usb: malformed cEMI: {e}"),
                },
                Err(e) => debug!("knx usb: dropping report: {e}"),
            },
            Err(e) => {
                warn!("knx usb: read failed: {e}");
                return;
            }
        }
    }
}

/// Pick the first hidraw device whose HID vendor id is a known KNX interface.
async fn enumerate_knx_hidraw() -> Result<PathBuf> {
    let mut dir = tokio::fs::read_dir("/sys/class/hidraw")
        .await
        .map_err(|e| Error::transport(format!("no hidraw class on this system: {e}")))?;
    let mut names: Vec<String> = Vec::new();
    while let Ok(Some(entry)) = dir.next_entry().await.map_err(|e| {
        Error::transport(format!("hidraw enumeration failed: {e}"))
    }) {
        names.push(entry.file_name().to_string_lossy().to_string());
    }
    names.sort();

    for name in names {
        let uevent = format!("/sys/class/hidraw/{name}/device/uevent");
        let Ok(content) = tokio::fs::read_to_string(&uevent).await else {
            continue;
        };
        if let Some(vendor) = parse_hid_vendor(&content) {
            if KNX_USB_VENDORS.contains(&vendor) {
                return Ok(PathBuf::from(format!("/dev/{name}")));
            }
        }
    }
    Err(Error::transport("no KNX USB interface attached"))
}

/// Extract the vendor id from a hidraw uevent `HID_ID=0003:0000135E:...` line.
fn parse_hid_vendor(uevent: &str) -> Option<u16> {
    let line = uevent
        .lines()
        .find_map(|l| l.strip_prefix("HID_ID="))?;
    let vendor_field = line.split(':').nth(1)?;
    u32::from_str_radix(vendor_field, 16).ok().map(|v| v as u16)
}

/// Frame a cEMI frame into a single HID report: report id, packet info
/// (start+end, sequence 1), data length, then the KNX USB transfer protocol
/// header (version 0, header length 8, body length, tunnel protocol, cEMI).
fn encode_usb_report(cemi: &[u8]) -> Result<Vec<u8>> {
    let body_len = cemi.len();
    if 3 + 8 + body_len > USB_REPORT_LEN {
        return Err(Error::protocol(format!(
            "cEMI frame of {body_len} bytes exceeds one HID report"
        )));
    }
    let mut report = vec![0u8; USB_REPORT_LEN];
    report[0] = 0x01; // report id
    report[1] = 0x13; // sequence 1, start+end packet
    report[2] = (8 + body_len) as u8;
    report[3] = 0x00; // protocol version
    report[4] = 0x08; // header length
    report[5..7].copy_from_slice(&(body_len as u16).to_be_bytes());
    report[7] = 0x01; // KNX tunnel
    report[8] = 0x03; // EMI id: cEMI
    // report[9..11]: manufacturer, zero
    report[11..11 + body_len].copy_from_slice(cemi);
    Ok(report)
}

fn decode_usb_report(report: &[u8]) -> Result<Vec<u8>> {
    if report.len() < 11 {
        return Err(Error::protocol("HID report too short"));
    }
    if report[0] != 0x01 {
        return Err(Error::protocol(format!("unexpected report id {}", report[0])));
    }
    if report[7] != 0x01 || report[8] != 0x03 {
        return Err(Error::protocol("not a cEMI tunnel report"));
    }
    let body_len = u16::from_be_bytes([report[5], report[6]]) as usize;
    if report.len() < 11 + body_len {
        return Err(Error::protocol("HID report body truncated"));
    }
    Ok(report[11..11 + body_len].to_vec())
}
