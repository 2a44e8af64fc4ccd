//! Zone-grouping reconciler.
//!
//! Drives Snapcast toward the declarative mapping "each configured client
//! belongs to the group whose stream is its zone's sink".  Runs on a periodic
//! tick, plus an extra debounced pass on server notifications.  Every
//! operation is idempotent; errors are logged and the next tick retries.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use snapdog_core::command::ClientMac;
use snapdog_core::config::{ClientConfig, SnapcastConfig, ZoneConfig};
use snapdog_core::Result;

use super::client::SnapcastControl;
use super::types::{stream_id_for_sink, SnapcastEvent};

/// Desired client → zone assignment: configuration defaults overlaid with
/// runtime overrides from `AssignClientToZone`.
pub struct Assignments {
    defaults: HashMap<ClientMac, usize>,
    overrides: RwLock<HashMap<ClientMac, usize>>,
}

impl Assignments {
    pub fn new(clients: &[ClientConfig]) -> Arc<Self> {
        let defaults = clients
            .iter()
            .filter_map(|c| c.default_zone.map(|z| (c.mac.clone(), z)))
            .collect();
        Arc::new(Self {
            defaults,
            overrides: RwLock::new(HashMap::new()),
        })
    }

    pub async fn assign(&self, mac: ClientMac, zone: usize) {
        self.overrides.write().await.insert(mac, zone);
    }

    pub async fn desired(&self) -> HashMap<ClientMac, usize> {
        let mut desired = self.defaults.clone();
        for (mac, zone) in self.overrides.read().await.iter() {
            desired.insert(mac.clone(), *zone);
        }
        desired
    }
}

pub struct Reconciler {
    control: Arc<dyn SnapcastControl>,
    config: SnapcastConfig,
    /// zone index → stream id.
    zone_streams: HashMap<usize, String>,
    /// configured display names by MAC.
    names: HashMap<ClientMac, String>,
    assignments: Arc<Assignments>,
}

impl Reconciler {
    pub fn new(
        control: Arc<dyn SnapcastControl>,
        config: SnapcastConfig,
        zones: &[ZoneConfig],
        clients: &[ClientConfig],
        assignments: Arc<Assignments>,
    ) -> Self {
        let zone_streams = zones
            .iter()
            .map(|z| (z.index, stream_id_for_sink(&z.sink)))
            .collect();
        let names = clients
            .iter()
            .map(|c| (c.mac.clone(), c.name.clone()))
            .collect();
        Self {
            control,
            config,
            zone_streams,
            names,
            assignments,
        }
    }

    pub async fn run(self, mut events: broadcast::Receiver<SnapcastEvent>, cancel: CancellationToken) {
        let tick = Duration::from_millis(self.config.periodic_check_interval_ms);
        let debounce = Duration::from_millis(self.config.event_debounce_delay_ms);
        let mut ticker = tokio::time::interval(tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // armed after an event; fires one extra pass
        let mut extra_pass_at: Option<tokio::time::Instant> = None;

        info!(
            "reconciler: running every {}ms (event debounce {}ms)",
            self.config.periodic_check_interval_ms, self.config.event_debounce_delay_ms
        );

        loop {
            let extra_sleep = async {
                match extra_pass_at {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => return,

                _ = ticker.tick() => {
                    self.pass().await;
                }

                _ = extra_sleep => {
                    extra_pass_at = None;
                    self.pass().await;
                }

                event = events.recv() => {
                    match event {
                        Ok(_) => {
                            extra_pass_at = Some(tokio::time::Instant::now() + debounce);
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            debug!("reconciler: missed {n} server events");
                            extra_pass_at = Some(tokio::time::Instant::now() + debounce);
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    }
                }
            }
        }
    }

    async fn pass(&self) {
        let desired = self.assignments.desired().await;
        match reconcile_once(
            self.control.as_ref(),
            &self.zone_streams,
            &desired,
            self.config.sync_names,
            &self.names,
        )
        .await
        {
            Ok(0) => {}
            Ok(calls) => debug!("reconciler: made {calls} corrections"),
            Err(e) => warn!("reconciler: pass failed, will retry next tick: {e}"),
        }
    }
}

/// One reconcile pass.  Returns the number of RPC calls issued, so a
/// converged system is observable as zero.
pub async fn reconcile_once(
    control: &dyn SnapcastControl,
    zone_streams: &HashMap<usize, String>,
    desired: &HashMap<ClientMac, usize>,
    sync_names: bool,
    names: &HashMap<ClientMac, String>,
) -> Result<usize> {
    let snapshot = control.server_status().await?;
    let mut calls = 0usize;

    for (zone, stream_id) in zone_streams {
        if !snapshot.has_stream(stream_id) {
            debug!("reconciler: zone {zone} stream '{stream_id}' not on the server yet");
            continue;
        }

        // configured members of this zone that the server currently knows
        let mut misplaced: Vec<String> = Vec::new();
        let mut members: Vec<String> = Vec::new();
        for (mac, target_zone) in desired {
            if target_zone != zone {
                continue;
            }
            let Some((group, client)) = snapshot.find_client(mac) else {
                continue;
            };
            members.push(client.id.clone());
            if group.stream_id != *stream_id {
                misplaced.push(client.id.clone());
            }
        }
        if misplaced.is_empty() {
            continue;
        }

        match snapshot.group_for_stream(stream_id) {
            Some(group) => {
                // move the misplaced clients into the existing group
                let mut client_ids: Vec<String> =
                    group.clients.iter().map(|c| c.id.clone()).collect();
                for id in &misplaced {
                    if !client_ids.contains(id) {
                        client_ids.push(id.clone());
                    }
                }
                if let Err(e) = control.set_group_clients(&group.id, &client_ids).await {
                    warn!("reconciler: Group.SetClients failed for zone {zone}: {e}");
                } else {
                    calls += 1;
                }
            }
            None => {
                // no group serves this stream: regroup the members and point
                // their group at it
                let Some((source_group, _)) = desired
                    .iter()
                    .find(|(_, z)| *z == zone)
                    .and_then(|(mac, _)| snapshot.find_client(mac))
                else {
                    continue;
                };
                match control.set_group_clients(&source_group.id, &members).await {
                    Ok(()) => calls += 1,
                    Err(e) => {
                        warn!("reconciler: Group.SetClients failed for zone {zone}: {e}");
                        continue;
                    }
                }
                match control.set_group_stream(&source_group.id, stream_id).await {
                    Ok(()) => calls += 1,
                    Err(e) => warn!("reconciler: Group.SetStream failed for zone {zone}: {e}"),
                }
            }
        }
    }

    if sync_names {
        for (mac, configured_name) in names {
            let Some((_, client)) = snapshot.find_client(mac) else {
                continue;
            };
            if &client.name != configured_name {
                match control.set_client_name(&client.id, configured_name).await {
                    Ok(()) => calls += 1,
                    Err(e) => warn!("reconciler: Client.SetName failed for {mac}: {e}"),
                }
            }
        }
    }

    Ok(calls)
}
