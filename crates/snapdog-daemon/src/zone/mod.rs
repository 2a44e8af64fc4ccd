//! Zone engines and their shared front door.

pub mod player;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use snapdog_core::audio::AudioFormat;
use snapdog_core::command::ClientMac;
use snapdog_core::config::ZoneConfig;
use snapdog_core::state::ZoneState;
use snapdog_core::Result;

use crate::catalog::MediaCatalog;
use crate::decoder::MediaDecoder;
use crate::dispatcher::EngineRequest;
use crate::notify::Publisher;

/// Handle over all zone engines: command channels for the dispatcher,
/// snapshots for the read paths, membership updates for the client engine.
#[derive(Clone)]
pub struct ZoneManager {
    inner: Arc<Inner>,
}

struct Inner {
    commands: HashMap<usize, mpsc::Sender<EngineRequest>>,
    members: HashMap<usize, mpsc::Sender<BTreeSet<ClientMac>>>,
    snapshots: HashMap<usize, tokio::sync::watch::Receiver<ZoneState>>,
    indices: Vec<usize>,
}

impl ZoneManager {
    /// Spawn one engine per configured zone.
    pub fn spawn_all(
        zones: &[ZoneConfig],
        audio: &AudioFormat,
        catalog: Arc<dyn MediaCatalog>,
        publisher: &Publisher,
        make_decoder: impl Fn(usize) -> Result<Arc<dyn MediaDecoder>>,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        let mut commands = HashMap::new();
        let mut members = HashMap::new();
        let mut snapshots = HashMap::new();
        let mut indices = Vec::new();

        for zone in zones {
            let decoder = make_decoder(zone.index)?;
            let handles = player::spawn(
                zone.clone(),
                audio.clone(),
                50,
                decoder,
                catalog.clone(),
                publisher.clone(),
                cancel.child_token(),
            );
            commands.insert(zone.index, handles.commands);
            members.insert(zone.index, handles.members);
            snapshots.insert(zone.index, handles.snapshot);
            indices.push(zone.index);
        }
        indices.sort_unstable();

        Ok(Self {
            inner: Arc::new(Inner {
                commands,
                members,
                snapshots,
                indices,
            }),
        })
    }

    pub fn command_channels(&self) -> HashMap<usize, mpsc::Sender<EngineRequest>> {
        self.inner.commands.clone()
    }

    pub fn snapshot(&self, zone: usize) -> Option<ZoneState> {
        self.inner.snapshots.get(&zone).map(|rx| rx.borrow().clone())
    }

    pub fn snapshots(&self) -> Vec<ZoneState> {
        self.inner
            .indices
            .iter()
            .filter_map(|i| self.snapshot(*i))
            .collect()
    }

    pub fn has_zone(&self, zone: usize) -> bool {
        self.inner.commands.contains_key(&zone)
    }

    /// Push the current Snapcast group membership into a zone's state.
    pub async fn set_members(&self, zone: usize, members: BTreeSet<ClientMac>) {
        if let Some(tx) = self.inner.members.get(&zone) {
            let _ = tx.send(members).await;
        }
    }
}
