mod catalog;
mod clients;
mod decoder;
mod dispatcher;
mod http;
mod knx;
mod mqtt;
mod notify;
mod snapcast;
mod zone;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use snapdog_core::command::{Integration, StatusEvent};
use snapdog_core::config::Config;
use snapdog_core::knx::{ConnectionState, KnxLink};

use crate::catalog::{subsonic::SubsonicClient, CombinedCatalog, MediaCatalog};
use crate::decoder::{vlc::VlcDecoder, MediaDecoder, UnavailableDecoder};
use crate::dispatcher::{CatalogueStore, Dispatcher};
use crate::notify::NotificationQueue;
use crate::snapcast::client::{SnapcastClient, SnapcastControl};
use crate::snapcast::reconciler::{Assignments, Reconciler};
use crate::snapcast::types::stream_id_for_sink;
use crate::zone::ZoneManager;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // configuration is the only fatal startup path
    let config = Config::load()?;

    let fmt_layer = tracing_subscriber::fmt::layer();
    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(format!(
                    "{},snapdog_daemon=debug",
                    config.system.log_level
                ))
            }),
        )
        .init();

    info!(
        "starting ({} zones, {} clients, {} radio stations, environment {})",
        config.zones.len(),
        config.clients.len(),
        config.radios.len(),
        config.system.environment
    );

    // shutdown stages: adapters → dispatcher/queue → engines → transports
    let adapters_cancel = CancellationToken::new();
    let queue_cancel = CancellationToken::new();
    let engines_cancel = CancellationToken::new();
    let transports_cancel = CancellationToken::new();
    let (ready_tx, ready_rx) = watch::channel(false);

    // ── dispatcher substrate ──────────────────────────────────────────────────
    let queue = NotificationQueue::spawn(
        config.notifications.clone(),
        Vec::new(),
        queue_cancel.clone(),
    );
    let publisher = queue.publisher();

    let catalogue = CatalogueStore::load(config.knx.csv_path.clone()).await?;

    // ── media catalog ─────────────────────────────────────────────────────────
    let subsonic = if config.subsonic.enabled {
        match SubsonicClient::new(config.subsonic.clone(), transports_cancel.clone()) {
            Ok(client) => Some(client),
            Err(e) => {
                error!("subsonic: disabled after setup failure: {e}");
                None
            }
        }
    } else {
        None
    };
    let media_catalog: Arc<dyn MediaCatalog> =
        Arc::new(CombinedCatalog::new(config.radios.clone(), subsonic));

    // ── zone engines ──────────────────────────────────────────────────────────
    let zones = ZoneManager::spawn_all(
        &config.zones,
        &config.audio,
        media_catalog.clone(),
        &publisher,
        |zone| match VlcDecoder::new(zone) {
            Ok(decoder) => Ok(Arc::new(decoder) as Arc<dyn MediaDecoder>),
            Err(e) => {
                warn!("zone {zone}: decoder unavailable: {e}");
                Ok(Arc::new(UnavailableDecoder::new(e.to_string())) as Arc<dyn MediaDecoder>)
            }
        },
        &engines_cancel,
    )?;

    // ── snapcast ──────────────────────────────────────────────────────────────
    let zone_streams: HashMap<usize, String> = config
        .zones
        .iter()
        .map(|z| (z.index, stream_id_for_sink(&z.sink)))
        .collect();
    let assignments = Assignments::new(&config.clients);

    let mut client_commands = None;
    let mut client_snapshots = None;
    match SnapcastClient::connect(config.snapcast.clone(), transports_cancel.clone()).await {
        Ok(snapcast) => {
            let snapcast = Arc::new(snapcast);
            watch_snapcast_link(&snapcast, publisher.clone(), engines_cancel.clone());

            let engine = clients::spawn(
                config.clients.clone(),
                snapcast.clone() as Arc<dyn SnapcastControl>,
                snapcast.events(),
                assignments.clone(),
                zones.clone(),
                zone_streams.clone(),
                publisher.clone(),
                Duration::from_millis(config.snapcast.periodic_check_interval_ms),
                engines_cancel.clone(),
            );
            client_commands = Some(engine.commands);
            client_snapshots = Some(engine.snapshot);

            let reconciler = Reconciler::new(
                snapcast.clone() as Arc<dyn SnapcastControl>,
                config.snapcast.clone(),
                &config.zones,
                &config.clients,
                assignments.clone(),
            );
            tokio::spawn(reconciler.run(snapcast.events(), engines_cancel.clone()));
        }
        Err(e) => {
            error!("snapcast: running without the server: {e}");
            publisher
                .publish(StatusEvent::ConnectionStateChanged {
                    integration: Integration::Snapcast,
                    connected: false,
                })
                .await;
        }
    }

    // ── dispatcher ────────────────────────────────────────────────────────────
    let dispatcher = Dispatcher::new(
        zones.command_channels(),
        client_commands,
        catalogue.clone(),
        publisher.clone(),
    );

    // ── KNX ───────────────────────────────────────────────────────────────────
    if config.knx.enabled {
        match KnxLink::open(config.knx.clone(), transports_cancel.clone()).await {
            Ok(link) => {
                watch_knx_link(&link, publisher.clone(), adapters_cancel.clone());
                let bindings = knx::KnxBindings::from_config(&config.zones, &config.clients);
                let service = knx::KnxService::start(
                    link,
                    bindings,
                    dispatcher.clone(),
                    zones.clone(),
                    client_snapshots.clone(),
                    adapters_cancel.clone(),
                );
                queue.register(service);
            }
            Err(e) => {
                error!("knx: running without the bus: {e}");
                publisher
                    .publish(StatusEvent::ConnectionStateChanged {
                        integration: Integration::Knx,
                        connected: false,
                    })
                    .await;
            }
        }
    }

    // ── MQTT ──────────────────────────────────────────────────────────────────
    if config.mqtt.enabled {
        let topics =
            mqtt::TopicMap::from_config(&config.mqtt.base_topic, &config.zones, &config.clients);
        let adapter = mqtt::MqttAdapter::start(
            &config.mqtt,
            topics,
            dispatcher.clone(),
            adapters_cancel.clone(),
        );
        queue.register(adapter);
    }

    // ── HTTP ──────────────────────────────────────────────────────────────────
    if config.api.enabled {
        let (push_sink, events_tx) = http::HttpPushSink::new();
        queue.register(push_sink);
        let state = http::AppState {
            dispatcher: dispatcher.clone(),
            zones: zones.clone(),
            clients: client_snapshots.clone(),
            catalog: media_catalog.clone(),
            events_tx,
            api: Arc::new(config.api.clone()),
            health_enabled: config.system.health_checks_enabled,
            ready: ready_rx.clone(),
            limiter: http::RateLimiter::new(config.api.rate_limit_per_second),
        };
        http::start_server(
            state,
            config.api.bind_address.clone(),
            config.api.port,
            adapters_cancel.clone(),
        );
    }

    let _ = ready_tx.send(true);
    info!("ready");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    let _ = ready_tx.send(false);

    // ordered teardown; each stage gets a moment to settle
    adapters_cancel.cancel();
    tokio::time::sleep(Duration::from_millis(200)).await;
    queue_cancel.cancel();
    queue.join().await;
    engines_cancel.cancel();
    tokio::time::sleep(Duration::from_millis(200)).await;
    transports_cancel.cancel();
    tokio::time::sleep(Duration::from_millis(100)).await;

    info!("bye");
    Ok(())
}

/// Mirror the KNX link state onto the status bus.
fn watch_knx_link(link: &KnxLink, publisher: notify::Publisher, cancel: CancellationToken) {
    let mut state_rx = link.state();
    tokio::spawn(async move {
        loop {
            let state = *state_rx.borrow();
            publisher
                .publish(StatusEvent::ConnectionStateChanged {
                    integration: Integration::Knx,
                    connected: state == ConnectionState::Connected,
                })
                .await;
            tokio::select! {
                _ = cancel.cancelled() => return,
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
    });
}

/// Mirror the Snapcast connection state onto the status bus.
fn watch_snapcast_link(
    snapcast: &Arc<SnapcastClient>,
    publisher: notify::Publisher,
    cancel: CancellationToken,
) {
    let mut connected_rx = snapcast.connected();
    tokio::spawn(async move {
        loop {
            let connected = *connected_rx.borrow();
            publisher
                .publish(StatusEvent::ConnectionStateChanged {
                    integration: Integration::Snapcast,
                    connected,
                })
                .await;
            tokio::select! {
                _ = cancel.cancelled() => return,
                changed = connected_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
    });
}
